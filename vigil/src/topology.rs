//! CPU cluster layout and live online/offline map

use crate::error::{GovernorError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

/// Logical CPU index
pub type CpuId = usize;

/// The boot CPU; never taken offline
pub const BOOT_CPU: CpuId = 0;

/// Cluster membership of a CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cluster {
    /// Cluster0, low-power cores
    Little,
    /// Cluster1, high-performance cores
    Big,
}

/// Static cluster layout, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum TopologyModel {
    /// big.LITTLE: CPUs `[0, little)` are Cluster0, `[little, little + big)` Cluster1
    AsymmetricBigLittle {
        little: usize,
        big: usize,
        #[serde(default = "default_low_power_cores")]
        low_power_cores: usize,
    },
    /// Every CPU belongs to one cluster
    Symmetric {
        cpus: usize,
        #[serde(default = "default_low_power_cores")]
        low_power_cores: usize,
    },
}

fn default_low_power_cores() -> usize {
    1
}

impl Default for TopologyModel {
    fn default() -> Self {
        Self::AsymmetricBigLittle {
            little: 4,
            big: 4,
            low_power_cores: 1,
        }
    }
}

impl TopologyModel {
    /// Check the layout is usable
    pub fn validate(&self) -> Result<()> {
        let (little, low_power_cores) = match *self {
            Self::AsymmetricBigLittle {
                little,
                low_power_cores,
                ..
            } => (little, low_power_cores),
            Self::Symmetric {
                cpus,
                low_power_cores,
            } => (cpus, low_power_cores),
        };

        if little == 0 {
            return Err(GovernorError::InvalidTopology(
                "cluster0 must contain the boot CPU".into(),
            ));
        }
        if low_power_cores == 0 || low_power_cores > little {
            return Err(GovernorError::InvalidTopology(format!(
                "low_power_cores must be within 1..={}",
                little
            )));
        }
        Ok(())
    }

    /// Total number of CPUs
    pub fn nr_cpus(&self) -> usize {
        match *self {
            Self::AsymmetricBigLittle { little, big, .. } => little + big,
            Self::Symmetric { cpus, .. } => cpus,
        }
    }

    /// Cluster0 CPU range (includes the boot CPU)
    pub fn little_cpus(&self) -> Range<CpuId> {
        match *self {
            Self::AsymmetricBigLittle { little, .. } => 0..little,
            Self::Symmetric { cpus, .. } => 0..cpus,
        }
    }

    /// Cluster1 CPU range; empty on symmetric layouts
    pub fn big_cpus(&self) -> Range<CpuId> {
        match *self {
            Self::AsymmetricBigLittle { little, big, .. } => little..little + big,
            Self::Symmetric { cpus, .. } => cpus..cpus,
        }
    }

    pub fn has_big_cluster(&self) -> bool {
        !self.big_cpus().is_empty()
    }

    /// Cluster0 cores that stay online in low-power mode
    pub fn min_little_cores(&self) -> usize {
        match *self {
            Self::AsymmetricBigLittle {
                low_power_cores, ..
            }
            | Self::Symmetric {
                low_power_cores, ..
            } => low_power_cores.max(1),
        }
    }

    /// Cluster0 CPUs other than the boot CPU
    pub fn little_secondaries(&self) -> Range<CpuId> {
        let little = self.little_cpus();
        (BOOT_CPU + 1).min(little.end)..little.end
    }

    pub fn cluster_of(&self, cpu: CpuId) -> Option<Cluster> {
        if self.little_cpus().contains(&cpu) {
            Some(Cluster::Little)
        } else if self.big_cpus().contains(&cpu) {
            Some(Cluster::Big)
        } else {
            None
        }
    }
}

/// Live online/offline map.
///
/// Written by the hotplug executor after each successful actuation. Readers
/// (cpuidle gate, controller) load without locking and may observe a value one
/// tick stale.
#[derive(Debug)]
pub struct Topology {
    model: TopologyModel,
    online: Vec<AtomicBool>,
}

impl Topology {
    /// Create a topology with every CPU online
    pub fn new(model: TopologyModel) -> Self {
        let online = (0..model.nr_cpus()).map(|_| AtomicBool::new(true)).collect();
        Self { model, online }
    }

    /// Create a topology seeded from an online predicate
    pub fn from_online(model: TopologyModel, is_online: impl Fn(CpuId) -> bool) -> Self {
        let online = (0..model.nr_cpus())
            .map(|cpu| AtomicBool::new(cpu == BOOT_CPU || is_online(cpu)))
            .collect();
        Self { model, online }
    }

    pub fn model(&self) -> &TopologyModel {
        &self.model
    }

    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.online
            .get(cpu)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub(crate) fn set_online(&self, cpu: CpuId, online: bool) {
        if cpu == BOOT_CPU && !online {
            return;
        }
        if let Some(c) = self.online.get(cpu) {
            c.store(online, Ordering::Release);
        }
    }

    /// CPUs currently online, ascending
    pub fn online_cpus(&self) -> Vec<CpuId> {
        (0..self.online.len()).filter(|&c| self.is_online(c)).collect()
    }

    pub fn online_count(&self) -> usize {
        self.online_cpus().len()
    }

    /// Number of non-boot CPUs online
    pub fn secondary_online_count(&self) -> usize {
        (BOOT_CPU + 1..self.online.len())
            .filter(|&c| self.is_online(c))
            .count()
    }

    pub fn all_online(&self) -> bool {
        self.online.iter().all(|c| c.load(Ordering::Acquire))
    }

    /// Whether any Cluster0 secondary is offline
    pub fn little_secondary_offline(&self) -> bool {
        self.model
            .little_secondaries()
            .any(|c| !self.is_online(c))
    }

    pub fn big_online_count(&self) -> usize {
        self.model.big_cpus().filter(|&c| self.is_online(c)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asymmetric_ranges() {
        let model = TopologyModel::AsymmetricBigLittle {
            little: 4,
            big: 4,
            low_power_cores: 1,
        };
        assert_eq!(model.nr_cpus(), 8);
        assert_eq!(model.little_cpus(), 0..4);
        assert_eq!(model.big_cpus(), 4..8);
        assert_eq!(model.little_secondaries(), 1..4);
        assert!(model.has_big_cluster());
        assert_eq!(model.cluster_of(5), Some(Cluster::Big));
        assert_eq!(model.cluster_of(8), None);
    }

    #[test]
    fn test_symmetric_has_no_big_cluster() {
        let model = TopologyModel::Symmetric {
            cpus: 4,
            low_power_cores: 2,
        };
        assert!(!model.has_big_cluster());
        assert_eq!(model.min_little_cores(), 2);
        assert!(model.big_cpus().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_low_power_cores() {
        let model = TopologyModel::Symmetric {
            cpus: 2,
            low_power_cores: 3,
        };
        assert!(model.validate().is_err());
        let model = TopologyModel::AsymmetricBigLittle {
            little: 0,
            big: 4,
            low_power_cores: 1,
        };
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_boot_cpu_stays_online() {
        let topo = Topology::new(TopologyModel::default());
        topo.set_online(BOOT_CPU, false);
        assert!(topo.is_online(BOOT_CPU));

        topo.set_online(3, false);
        assert!(topo.little_secondary_offline());
        assert_eq!(topo.secondary_online_count(), 6);
        assert!(!topo.all_online());
    }

    #[test]
    fn test_from_online() {
        let topo = Topology::from_online(TopologyModel::default(), |cpu| cpu < 2);
        assert_eq!(topo.online_cpus(), vec![0, 1]);
        assert_eq!(topo.big_online_count(), 0);
    }
}
