//! Idle state gate
//!
//! Picks the deepest legal idle state on every idle entry. LPM (system
//! low-power mode) is legal only while every secondary CPU is offline and the
//! display is off; anything else falls back to the next usable shallower
//! state, with C1 as the floor. The read side takes no locks and tolerates a
//! topology that is one transition stale.

use crate::error::{GovernorError, Result};
use crate::platform::{IdleBackend, IdleStateControl};
use crate::profiler::IdleProfiler;
use crate::topology::{CpuId, Topology};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Idle depth, shallowest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    /// Wait for interrupt
    C1,
    /// Core power gated
    C2,
    /// System low-power mode
    Lpm,
}

impl IdleState {
    pub const COUNT: usize = 3;
    pub const ALL: [IdleState; Self::COUNT] = [Self::C1, Self::C2, Self::Lpm];

    pub fn index(self) -> usize {
        match self {
            Self::C1 => 0,
            Self::C2 => 1,
            Self::Lpm => 2,
        }
    }

    /// Next state up toward C1
    pub fn shallower(self) -> Option<IdleState> {
        match self {
            Self::C1 => None,
            Self::C2 => Some(Self::C1),
            Self::Lpm => Some(Self::C2),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::C1 => "c1",
            Self::C2 => "c2",
            Self::Lpm => "lpm",
        }
    }
}

impl fmt::Display for IdleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one idle entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEntry {
    pub state: IdleState,
    pub early_wakeup: bool,
}

/// Idle state gate shared by every CPU's idle path
pub struct CpuidleGate {
    topology: Arc<Topology>,
    display_on: Arc<AtomicBool>,
    supported: [bool; IdleState::COUNT],
    disabled: [AtomicBool; IdleState::COUNT],
    profiler: Option<Arc<IdleProfiler>>,
}

impl CpuidleGate {
    pub fn new(
        topology: Arc<Topology>,
        display_on: Arc<AtomicBool>,
        c2_supported: bool,
        lpm_supported: bool,
    ) -> Self {
        Self {
            topology,
            display_on,
            supported: [true, c2_supported, lpm_supported],
            disabled: Default::default(),
            profiler: None,
        }
    }

    /// Report entries and exits to `profiler`
    pub fn with_profiler(mut self, profiler: Arc<IdleProfiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn profiler(&self) -> Option<&Arc<IdleProfiler>> {
        self.profiler.as_ref()
    }

    /// Administratively disable or re-enable a state; C1 cannot be disabled
    pub fn set_disabled(&self, state: IdleState, disabled: bool) -> Result<()> {
        if state == IdleState::C1 && disabled {
            return Err(GovernorError::InvalidTunable(
                "c1 is the idle floor and cannot be disabled".to_string(),
            ));
        }
        self.disabled[state.index()].store(disabled, Ordering::Relaxed);
        debug!("Idle state {} {}", state, if disabled { "disabled" } else { "enabled" });
        Ok(())
    }

    /// Supported by the platform and not administratively disabled
    pub fn is_usable(&self, state: IdleState) -> bool {
        self.supported[state.index()] && !self.disabled[state.index()].load(Ordering::Relaxed)
    }

    /// Whether the current topology and display state admit LPM
    pub fn lpm_allowed(&self) -> bool {
        self.topology.secondary_online_count() == 0 && !self.display_on.load(Ordering::Relaxed)
    }

    /// Deepest legal state at or above `requested`
    pub fn select_state(&self, requested: IdleState) -> IdleState {
        let legal = match requested {
            IdleState::C1 => return IdleState::C1,
            IdleState::C2 => self.is_usable(IdleState::C2),
            IdleState::Lpm => self.is_usable(IdleState::Lpm) && self.lpm_allowed(),
        };
        if legal {
            return requested;
        }
        match requested.shallower() {
            Some(next) => self.select_state(next),
            None => IdleState::C1,
        }
    }

    /// Run one idle entry on `cpu`; blocks in `commit` until the CPU wakes
    pub fn enter(&self, cpu: CpuId, requested: IdleState, backend: &dyn IdleBackend) -> IdleEntry {
        let state = self.select_state(requested);
        if state != requested {
            trace!("cpu{}: {} not legal, entering {}", cpu, requested, state);
        }
        if let Some(profiler) = &self.profiler {
            profiler.start(cpu, state);
        }

        // C1 has no PM entry/exit hooks, so nothing reports an early wakeup
        let (committed, woke_early) = if state == IdleState::C1 {
            (backend.commit(cpu, state), false)
        } else {
            backend.prepare(cpu, state);
            let committed = backend.commit(cpu, state);
            let woke_early = backend.cleanup(cpu, state);
            (committed, woke_early)
        };

        let early_wakeup = match committed {
            Ok(()) => woke_early,
            Err(errno) => {
                debug!("cpu{}: {} entry aborted: {}", cpu, state, errno);
                backend.flush_tlb(cpu);
                true
            }
        };

        if let Some(profiler) = &self.profiler {
            profiler.finish(cpu, early_wakeup);
        }
        IdleEntry {
            state,
            early_wakeup,
        }
    }

    /// Push the current legality of every state into the platform switches
    pub fn apply_limits(&self, control: &dyn IdleStateControl) -> Result<()> {
        let lpm_allowed = self.lpm_allowed();
        let mut last_err = None;

        for cpu in 0..self.topology.model().nr_cpus() {
            for state in [IdleState::C2, IdleState::Lpm] {
                if !self.supported[state.index()] {
                    continue;
                }
                let disabled =
                    !self.is_usable(state) || (state == IdleState::Lpm && !lpm_allowed);
                if let Err(errno) = control.set_state_disabled(cpu, state, disabled) {
                    warn!("Failed to update cpu{} {} switch: {}", cpu, state, errno);
                    last_err = Some(errno);
                }
            }
        }

        trace!("Idle limits applied (lpm {})", if lpm_allowed { "allowed" } else { "blocked" });
        match last_err {
            Some(errno) => Err(GovernorError::Io(errno.into())),
            None => Ok(()),
        }
    }
}
