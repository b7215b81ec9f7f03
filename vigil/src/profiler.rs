//! Idle power-state profiler
//!
//! Counts idle entries, early wakeups and residency per CPU and per state.
//! Counting happens only inside a profiling session; at most one session runs
//! at a time and it ends on its own once its period has elapsed.

use crate::cpuidle::IdleState;
use crate::error::{GovernorError, Result};
use crate::topology::CpuId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Longest session accepted, in seconds
pub const MAX_PERIOD_SECS: u32 = 120;

/// Counters of one state on one CPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StateStats {
    entry_count: u64,
    early_wakeup_count: u64,
    residency: Duration,
}

#[derive(Debug, Default)]
struct CpuRecord {
    current: Option<(IdleState, Instant)>,
    stats: [StateStats; IdleState::COUNT],
}

#[derive(Debug, Clone)]
struct Session {
    started: Instant,
    started_at: DateTime<Utc>,
    period: Option<Duration>,
    ended: Option<Instant>,
}

impl Session {
    fn deadline_passed(&self, now: Instant) -> bool {
        self.period
            .is_some_and(|p| now.duration_since(self.started) >= p)
    }

    /// Latest instant that still counts: the stop time or the deadline,
    /// whichever comes first
    fn end_bound(&self) -> Option<Instant> {
        let deadline = self.period.map(|p| self.started + p);
        match (self.ended, deadline) {
            (Some(ended), Some(deadline)) => Some(ended.min(deadline)),
            (ended, deadline) => ended.or(deadline),
        }
    }

    /// Counting window clipped to `now`
    fn window(&self, now: Instant) -> (Instant, Instant) {
        let end = self.end_bound().map_or(now, |end| end.min(now));
        (self.started, end.max(self.started))
    }

    fn duration(&self, now: Instant) -> Duration {
        let (start, end) = self.window(now);
        end.duration_since(start)
    }
}

/// Which states a report covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileMode {
    /// Every state, per CPU
    All = 0,
    C1 = 1,
    C2 = 2,
    Lpm = 3,
    /// C2 and LPM, per CPU
    Deep = 4,
    /// Per-state totals without the per-CPU breakdown
    Summary = 5,
}

impl TryFrom<u8> for ProfileMode {
    type Error = GovernorError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::All,
            1 => Self::C1,
            2 => Self::C2,
            3 => Self::Lpm,
            4 => Self::Deep,
            5 => Self::Summary,
            other => return Err(GovernorError::InvalidProfileMode(other)),
        })
    }
}

impl ProfileMode {
    fn covers(&self, state: IdleState) -> bool {
        match self {
            Self::All | Self::Summary => true,
            Self::C1 => state == IdleState::C1,
            Self::C2 => state == IdleState::C2,
            Self::Lpm => state == IdleState::Lpm,
            Self::Deep => state != IdleState::C1,
        }
    }
}

/// Reported counters of one state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    pub state: IdleState,
    pub entry_count: u64,
    pub early_wakeup_count: u64,
    pub residency_us: u64,
    /// Residency as a share of the session duration
    pub residency_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuReport {
    pub cpu: CpuId,
    pub states: Vec<StateReport>,
}

/// Result of the current or most recent session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileReport {
    pub mode: ProfileMode,
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub cpus: Vec<CpuReport>,
    pub totals: Vec<StateReport>,
}

/// Idle profiler
#[derive(Debug)]
pub struct IdleProfiler {
    cpus: Vec<Mutex<CpuRecord>>,
    session: Mutex<Option<Session>>,
    active: AtomicBool,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl IdleProfiler {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            cpus: (0..nr_cpus).map(|_| Mutex::new(CpuRecord::default())).collect(),
            session: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Begin a session of `period_secs` seconds (0 runs until stopped)
    pub fn start_session(&self, period_secs: u32) -> Result<()> {
        if period_secs > MAX_PERIOD_SECS {
            return Err(GovernorError::InvalidProfilePeriod(period_secs));
        }

        let mut session = relock(&self.session);
        if self.refresh_locked(&mut session, Instant::now()) {
            return Err(GovernorError::ProfilerBusy);
        }

        for cpu in &self.cpus {
            *relock(cpu) = CpuRecord::default();
        }
        *session = Some(Session {
            started: Instant::now(),
            started_at: Utc::now(),
            period: (period_secs > 0).then(|| Duration::from_secs(period_secs as u64)),
            ended: None,
        });
        self.active.store(true, Ordering::Release);
        info!("Idle profiling started (period {}s)", period_secs);
        Ok(())
    }

    /// End the running session; returns false when none was running
    pub fn stop_session(&self) -> bool {
        let mut session = relock(&self.session);
        let was_active = self.active.swap(false, Ordering::AcqRel);
        if let Some(s) = session.as_mut() {
            if s.ended.is_none() {
                s.ended = Some(Instant::now());
            }
        }
        if was_active {
            info!("Idle profiling stopped");
        }
        was_active
    }

    /// Whether a session is counting right now
    pub fn is_active(&self) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        match self.session.try_lock() {
            Ok(mut session) => self.refresh_locked(&mut session, Instant::now()),
            Err(TryLockError::Poisoned(p)) => {
                self.refresh_locked(&mut p.into_inner(), Instant::now())
            }
            // Someone is starting or stopping a session; trust the flag
            Err(TryLockError::WouldBlock) => true,
        }
    }

    /// Expire an overdue session; returns whether one is still counting
    fn refresh_locked(&self, session: &mut Option<Session>, now: Instant) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        match session.as_mut() {
            Some(s) if s.deadline_passed(now) => {
                s.ended.get_or_insert(now);
                self.active.store(false, Ordering::Release);
                debug!("Idle profiling period elapsed");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Idle entry on `cpu`
    pub fn start(&self, cpu: CpuId, state: IdleState) {
        if !self.is_active() {
            return;
        }
        if let Some(record) = self.cpus.get(cpu) {
            let mut record = relock(record);
            if record.current.is_none() {
                record.current = Some((state, Instant::now()));
            }
        }
    }

    /// Idle exit on `cpu`.
    ///
    /// Residency is clipped to the session window; an entry that began after
    /// the session ended is dropped.
    pub fn finish(&self, cpu: CpuId, early_wakeup: bool) {
        let Some(record) = self.cpus.get(cpu) else {
            return;
        };
        // Session before record, same order as start_session
        let now = Instant::now();
        let window = relock(&self.session).as_ref().map(|s| s.window(now));
        let mut record = relock(record);
        let Some((state, entered)) = record.current.take() else {
            return;
        };
        let Some((started, end)) = window else {
            return;
        };
        if entered < started || entered >= end {
            return;
        }
        let stats = &mut record.stats[state.index()];
        stats.entry_count += 1;
        if early_wakeup {
            stats.early_wakeup_count += 1;
        }
        stats.residency += end.duration_since(entered);
    }

    /// Report the current or last session
    pub fn report(&self, mode: ProfileMode) -> ProfileReport {
        let active = self.is_active();
        let session = relock(&self.session).clone();
        let duration = session
            .as_ref()
            .map(|s| s.duration(Instant::now()))
            .unwrap_or_default();

        let state_report = |state: IdleState, stats: &StateStats| StateReport {
            state,
            entry_count: stats.entry_count,
            early_wakeup_count: stats.early_wakeup_count,
            residency_us: stats.residency.as_micros() as u64,
            residency_percent: if duration.is_zero() {
                0.0
            } else {
                stats.residency.as_secs_f64() * 100.0 / duration.as_secs_f64()
            },
        };

        let mut totals = [StateStats::default(); IdleState::COUNT];
        let mut cpus = Vec::new();
        for (cpu, record) in self.cpus.iter().enumerate() {
            let record = relock(record);
            let mut states = Vec::new();
            for state in IdleState::ALL.into_iter().filter(|s| mode.covers(*s)) {
                let stats = &record.stats[state.index()];
                let total = &mut totals[state.index()];
                total.entry_count += stats.entry_count;
                total.early_wakeup_count += stats.early_wakeup_count;
                total.residency += stats.residency;
                states.push(state_report(state, stats));
            }
            if mode != ProfileMode::Summary {
                cpus.push(CpuReport { cpu, states });
            }
        }

        // Totals are relative to the combined time of every CPU
        let nr_cpus = self.cpus.len().max(1) as f64;
        let totals = IdleState::ALL
            .into_iter()
            .filter(|s| mode.covers(*s))
            .map(|s| {
                let mut report = state_report(s, &totals[s.index()]);
                report.residency_percent /= nr_cpus;
                report
            })
            .collect();

        ProfileReport {
            mode,
            active,
            started_at: session.map(|s| s.started_at),
            duration_ms: duration.as_millis() as u64,
            cpus,
            totals,
        }
    }
}
