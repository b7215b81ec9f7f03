//! Collaborator interfaces and the sysfs/procfs implementation
//!
//! The governor never touches hardware directly. Everything it needs from the
//! OS goes through [`Platform`] (hotplug, cpufreq, QoS, run-queue length) and
//! the cpuidle traits ([`IdleBackend`], [`IdleStateControl`]).

use crate::cpuidle::IdleState;
use crate::topology::{CpuId, BOOT_CPU};
use nix::errno::Errno;
use procfs::{Current, CurrentSI, KernelStats, LoadAverage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Cumulative per-CPU time counters (monotonic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub iowait: u64,
    pub wall: u64,
}

/// Current cpufreq policy of a CPU (kHz)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreqPolicy {
    pub min: u32,
    pub max: u32,
    pub cur: u32,
}

/// Resource classes an external PM-QoS request may pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosClass {
    Cluster0MinFreq,
    Cluster1MinFreq,
}

impl QosClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster0MinFreq => "cluster0_min_freq",
            Self::Cluster1MinFreq => "cluster1_min_freq",
        }
    }
}

/// Which run-queue length signal stands in for the scheduler's `nr_running`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunQueueSignal {
    /// Runnable tasks right now
    #[default]
    Instantaneous,
    /// One-minute load average, rounded
    Averaged,
}

/// OS-level hotplug, cpufreq and scheduler primitives
pub trait Platform: Send + Sync {
    fn cpu_online(&self, cpu: CpuId) -> bool;
    fn cpu_up(&self, cpu: CpuId) -> Result<(), Errno>;
    fn cpu_down(&self, cpu: CpuId) -> Result<(), Errno>;

    /// Cumulative time counters of every online CPU
    fn cpu_times(&self) -> Vec<(CpuId, CpuTimes)>;

    fn cpufreq_policy(&self, cpu: CpuId) -> Option<FreqPolicy>;

    /// Current external floor requested on `class`, 0 when none
    fn pm_qos_request(&self, class: QosClass) -> u32;

    fn nr_running(&self, signal: RunQueueSignal) -> u32;
}

/// Idle entry hooks used by [`crate::cpuidle::CpuidleGate::enter`]
pub trait IdleBackend: Send + Sync {
    /// PM entry notification
    fn prepare(&self, cpu: CpuId, state: IdleState);

    /// Park the CPU in `state` until wakeup
    fn commit(&self, cpu: CpuId, state: IdleState) -> Result<(), Errno>;

    /// PM exit notification; returns whether the CPU woke early
    fn cleanup(&self, cpu: CpuId, state: IdleState) -> bool;

    /// Corrective action after a failed commit
    fn flush_tlb(&self, cpu: CpuId);
}

/// Per-state disable switches of the OS cpuidle driver
pub trait IdleStateControl: Send + Sync {
    fn set_state_disabled(&self, cpu: CpuId, state: IdleState, disabled: bool)
        -> Result<(), Errno>;
}

fn errno_of(e: &std::io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Pair `/proc/stat` rows with CPU ids.
///
/// The rows carry no ids of their own: they list online CPUs in ascending
/// order. `None` when the online set moved between the reads around them.
fn attribute_rows(
    before: &[CpuId],
    after: &[CpuId],
    rows: Vec<CpuTimes>,
) -> Option<Vec<(CpuId, CpuTimes)>> {
    if before != after || after.len() != rows.len() {
        return None;
    }
    Some(after.iter().copied().zip(rows).collect())
}

/// Linux implementation backed by `/sys/devices/system/cpu` and `/proc`
pub struct SysfsPlatform {
    cpu_root: PathBuf,
    qos_dir: PathBuf,
    nr_cpus: usize,
}

impl SysfsPlatform {
    pub const DEFAULT_CPU_ROOT: &'static str = "/sys/devices/system/cpu";

    /// Create a platform rooted at `cpu_root`; QoS floors are read from `qos_dir`
    pub fn new(cpu_root: impl Into<PathBuf>, qos_dir: impl Into<PathBuf>, nr_cpus: usize) -> Self {
        Self {
            cpu_root: cpu_root.into(),
            qos_dir: qos_dir.into(),
            nr_cpus,
        }
    }

    fn cpu_dir(&self, cpu: CpuId) -> PathBuf {
        self.cpu_root.join(format!("cpu{}", cpu))
    }

    fn write_online(&self, cpu: CpuId, value: &str) -> Result<(), Errno> {
        let path = self.cpu_dir(cpu).join("online");
        debug!("Writing {} to {}", value, path.display());
        fs::write(&path, value).map_err(|e| {
            warn!("Failed to write {}: {}", path.display(), e);
            errno_of(&e)
        })
    }

    fn online_list(&self) -> Vec<CpuId> {
        (0..self.nr_cpus).filter(|&c| self.cpu_online(c)).collect()
    }

    fn read_u32(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl Platform for SysfsPlatform {
    fn cpu_online(&self, cpu: CpuId) -> bool {
        if cpu == BOOT_CPU {
            return true;
        }
        match fs::read_to_string(self.cpu_dir(cpu).join("online")) {
            Ok(s) => s.trim() == "1",
            // CPUs without an online switch cannot be hotplugged
            Err(_) => self.cpu_dir(cpu).exists(),
        }
    }

    fn cpu_up(&self, cpu: CpuId) -> Result<(), Errno> {
        self.write_online(cpu, "1")
    }

    fn cpu_down(&self, cpu: CpuId) -> Result<(), Errno> {
        if cpu == BOOT_CPU {
            return Err(Errno::EPERM);
        }
        self.write_online(cpu, "0")
    }

    fn cpu_times(&self) -> Vec<(CpuId, CpuTimes)> {
        let before = self.online_list();
        let stats = match KernelStats::current() {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to read /proc/stat: {}", e);
                return Vec::new();
            }
        };
        let after = self.online_list();

        let rows = stats
            .cpu_time
            .iter()
            .map(|t| {
                let iowait = t.iowait.unwrap_or(0);
                let wall = t.user
                    + t.nice
                    + t.system
                    + t.idle
                    + iowait
                    + t.irq.unwrap_or(0)
                    + t.softirq.unwrap_or(0)
                    + t.steal.unwrap_or(0);
                CpuTimes {
                    idle: t.idle,
                    iowait,
                    wall,
                }
            })
            .collect();

        attribute_rows(&before, &after, rows).unwrap_or_else(|| {
            debug!("CPU set changed while reading /proc/stat, skipping sample");
            Vec::new()
        })
    }

    fn cpufreq_policy(&self, cpu: CpuId) -> Option<FreqPolicy> {
        let dir = self.cpu_dir(cpu).join("cpufreq");
        Some(FreqPolicy {
            min: Self::read_u32(&dir.join("scaling_min_freq"))?,
            max: Self::read_u32(&dir.join("scaling_max_freq"))?,
            cur: Self::read_u32(&dir.join("scaling_cur_freq"))?,
        })
    }

    fn pm_qos_request(&self, class: QosClass) -> u32 {
        Self::read_u32(&self.qos_dir.join(class.as_str())).unwrap_or(0)
    }

    fn nr_running(&self, signal: RunQueueSignal) -> u32 {
        match signal {
            RunQueueSignal::Instantaneous => {
                if let Some(running) = KernelStats::current().ok().and_then(|s| s.procs_running) {
                    return running;
                }
                LoadAverage::current().map(|l| l.cur).unwrap_or(0)
            }
            RunQueueSignal::Averaged => LoadAverage::current()
                .map(|l| l.one.round() as u32)
                .unwrap_or(0),
        }
    }
}

impl IdleStateControl for SysfsPlatform {
    fn set_state_disabled(
        &self,
        cpu: CpuId,
        state: IdleState,
        disabled: bool,
    ) -> Result<(), Errno> {
        let path = self
            .cpu_dir(cpu)
            .join("cpuidle")
            .join(format!("state{}", state.index()))
            .join("disable");
        if !path.exists() {
            trace!("No cpuidle switch at {}", path.display());
            return Ok(());
        }
        fs::write(&path, if disabled { "1" } else { "0" }).map_err(|e| errno_of(&e))
    }
}
