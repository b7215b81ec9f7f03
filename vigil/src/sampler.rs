//! Per-CPU load sampling
//!
//! Each tick reads cumulative idle/iowait/wall counters, turns them into
//! deltas against the previous tick and derives `load_freq`: the fastest
//! clock any busy online CPU is currently running at.

use crate::platform::{CpuTimes, Platform, QosClass, RunQueueSignal};
use crate::topology::{CpuId, TopologyModel, BOOT_CPU};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// Load of a single CPU over the last tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuLoad {
    pub cpu: CpuId,
    /// Busy percentage, `None` when the delta was unusable
    pub load: Option<u32>,
    pub iowait_delta: u64,
    /// Current frequency, `None` without an active policy
    pub cur_freq: Option<u32>,
}

/// Big-cluster frequency state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFreq {
    pub cur: u32,
    pub min: u32,
}

/// One tick's worth of load information; not retained
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub cpus: Vec<CpuLoad>,
    pub load_freq: u32,
    /// Policy maximum of the little cluster, 0 when unknown
    pub cluster0_max_freq: u32,
    /// Big cluster frequency when any big CPU is online
    pub cluster1: Option<ClusterFreq>,
    /// External floor on the big cluster
    pub cluster1_qos_min: u32,
    pub nr_running: u32,
}

/// Load sampler holding the previous sample of every CPU
#[derive(Debug, Default)]
pub struct LoadSampler {
    prev: HashMap<CpuId, CpuTimes>,
    load_report_threshold: u32,
}

impl LoadSampler {
    /// Create a sampler; CPUs below `load_report_threshold` percent do not
    /// contribute to `load_freq` (0 = every active policy counts)
    pub fn new(load_report_threshold: u32) -> Self {
        Self {
            prev: HashMap::new(),
            load_report_threshold,
        }
    }

    pub fn set_load_report_threshold(&mut self, threshold: u32) {
        self.load_report_threshold = threshold;
    }

    /// Busy percentage from two samples, `None` on an unusable delta
    pub fn compute_load(prev: &CpuTimes, now: &CpuTimes) -> Option<u32> {
        let wall = now.wall.checked_sub(prev.wall)?;
        let idle = now.idle.checked_sub(prev.idle)?;
        if wall == 0 || wall < idle {
            return None;
        }
        Some((100 * (wall - idle) / wall) as u32)
    }

    /// Take a sample
    pub fn sample(
        &mut self,
        platform: &dyn Platform,
        model: &TopologyModel,
        signal: RunQueueSignal,
    ) -> LoadSnapshot {
        let mut snapshot = LoadSnapshot::default();

        for (cpu, now) in platform.cpu_times() {
            let prev = self.prev.insert(cpu, now);
            let load = prev.as_ref().and_then(|p| Self::compute_load(p, &now));
            let iowait_delta = prev
                .map(|p| now.iowait.saturating_sub(p.iowait))
                .unwrap_or(0);
            let cur_freq = platform.cpufreq_policy(cpu).map(|p| p.cur);

            let reports = self.load_report_threshold == 0
                || load.is_some_and(|l| l >= self.load_report_threshold);
            if reports {
                if let Some(cur) = cur_freq {
                    snapshot.load_freq = snapshot.load_freq.max(cur);
                }
            }

            trace!("cpu{}: load={:?} freq={:?}", cpu, load, cur_freq);
            snapshot.cpus.push(CpuLoad {
                cpu,
                load,
                iowait_delta,
                cur_freq,
            });
        }

        snapshot.cluster0_max_freq = platform
            .cpufreq_policy(BOOT_CPU)
            .map(|p| p.max)
            .unwrap_or(0);
        snapshot.cluster1 = model
            .big_cpus()
            .find_map(|cpu| platform.cpufreq_policy(cpu))
            .map(|p| ClusterFreq {
                cur: p.cur,
                min: p.min,
            });
        snapshot.cluster1_qos_min = if model.has_big_cluster() {
            platform.pm_qos_request(QosClass::Cluster1MinFreq)
        } else {
            0
        };
        snapshot.nr_running = platform.nr_running(signal);
        snapshot
    }
}
