//! Hotplug executor
//!
//! Applies a [`HotplugCommand`] by bringing CPUs online or offline in a fixed
//! order. A failed `cpu_up`/`cpu_down` aborts the rest of the command and the
//! partial progress stands; the controller retries on its next tick.
//!
//! Actuation is serialized per cluster, not globally: `cluster1_lock` guards
//! only Cluster1 transitions and `cluster0_lock` guards only Cluster0
//! transitions. The two are never held together, so a thermal caller driving
//! the big cluster does not wait for the poll loop working on the little one.

use crate::decision::HotplugCommand;
use crate::error::{Actuation, GovernorError, Result};
use crate::platform::Platform;
use crate::topology::{CpuId, Topology, BOOT_CPU};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Flags that turn `Normal`/`LowPower` into no-ops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecContext {
    pub hotplug_disabled: bool,
    pub suspend_prepared: bool,
}

impl ExecContext {
    /// Whether `cmd` would be skipped under this context
    pub fn skips(&self, cmd: HotplugCommand) -> bool {
        matches!(cmd, HotplugCommand::Normal | HotplugCommand::LowPower)
            && (self.hotplug_disabled || self.suspend_prepared)
    }
}

/// Cluster1 state guarded by `cluster1_lock`
#[derive(Debug, Default)]
struct Cluster1Pin {
    /// Set by an external Cluster1Out; keeps `Normal` from re-onlining the cluster
    hotplugged: bool,
}

/// Hotplug executor
pub struct HotplugExecutor {
    platform: Arc<dyn Platform>,
    topology: Arc<Topology>,
    cluster1_lock: Mutex<Cluster1Pin>,
    cluster0_lock: Mutex<()>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HotplugExecutor {
    pub fn new(platform: Arc<dyn Platform>, topology: Arc<Topology>) -> Self {
        Self {
            platform,
            topology,
            cluster1_lock: Mutex::new(Cluster1Pin::default()),
            cluster0_lock: Mutex::new(()),
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Whether the big cluster is pinned offline by an external request
    pub fn cluster1_hotplugged(&self) -> bool {
        relock(&self.cluster1_lock).hotplugged
    }

    /// Apply `cmd`
    pub fn execute(&self, cmd: HotplugCommand, ctx: ExecContext) -> Result<()> {
        debug!("Executing {}", cmd);
        let result = match cmd {
            _ if ctx.skips(cmd) => {
                debug!("Hotplug disabled or suspend prepared, skipping {}", cmd);
                return Ok(());
            }
            HotplugCommand::Normal => self.normal(),
            HotplugCommand::LowPower => self.low_power(),
            HotplugCommand::Cluster1Out => {
                let mut pin = relock(&self.cluster1_lock);
                let result = self.big_out();
                if result.is_ok() {
                    pin.hotplugged = true;
                }
                result
            }
            HotplugCommand::Cluster1In => {
                let mut pin = relock(&self.cluster1_lock);
                pin.hotplugged = false;
                self.big_in()
            }
            HotplugCommand::Cluster0In => {
                let _guard = relock(&self.cluster0_lock);
                self.little_in()
            }
            HotplugCommand::Cluster0OneIn => {
                let _guard = relock(&self.cluster0_lock);
                self.one_in()
            }
            HotplugCommand::Cluster0OneOut => {
                let _guard = relock(&self.cluster0_lock);
                self.one_out()
            }
        };

        match &result {
            Ok(()) => info!(
                "Applied {} ({} CPUs online)",
                cmd,
                self.topology.online_count()
            ),
            Err(e) => warn!("Failed to apply {}: {}", cmd, e),
        }
        result
    }

    /// Take the big cluster offline and pin it there (thermal entry point)
    pub fn cluster1_out(&self) -> Result<()> {
        self.execute(HotplugCommand::Cluster1Out, ExecContext::default())
    }

    /// Release the pin and bring the big cluster back
    pub fn cluster1_in(&self) -> Result<()> {
        self.execute(HotplugCommand::Cluster1In, ExecContext::default())
    }

    pub fn cluster0_one_in(&self) -> Result<()> {
        self.execute(HotplugCommand::Cluster0OneIn, ExecContext::default())
    }

    pub fn cluster0_one_out(&self) -> Result<()> {
        self.execute(HotplugCommand::Cluster0OneOut, ExecContext::default())
    }

    fn normal(&self) -> Result<()> {
        {
            let _guard = relock(&self.cluster0_lock);
            self.little_in()?;
        }
        let pin = relock(&self.cluster1_lock);
        if pin.hotplugged {
            debug!("Cluster1 pinned offline, leaving it out");
            return Ok(());
        }
        self.big_in()
    }

    fn low_power(&self) -> Result<()> {
        {
            let _pin = relock(&self.cluster1_lock);
            self.big_out()?;
        }
        let _guard = relock(&self.cluster0_lock);
        let model = self.topology.model();
        let keep = model.min_little_cores();
        for cpu in model.little_cpus().skip(keep).rev() {
            self.down(cpu)?;
        }
        Ok(())
    }

    /// Caller holds `cluster1_lock`
    fn big_out(&self) -> Result<()> {
        for cpu in self.topology.model().big_cpus().rev() {
            self.down(cpu)?;
        }
        Ok(())
    }

    /// Caller holds `cluster1_lock`
    fn big_in(&self) -> Result<()> {
        for cpu in self.topology.model().big_cpus() {
            self.up(cpu)?;
        }
        Ok(())
    }

    /// Caller holds `cluster0_lock`
    fn little_in(&self) -> Result<()> {
        for cpu in self.topology.model().little_secondaries() {
            self.up(cpu)?;
        }
        Ok(())
    }

    /// Caller holds `cluster0_lock`
    fn one_in(&self) -> Result<()> {
        let target = self
            .topology
            .model()
            .little_secondaries()
            .find(|&cpu| !self.platform.cpu_online(cpu));
        match target {
            Some(cpu) => self.up(cpu),
            None => {
                debug!("No offline little core to bring in");
                Ok(())
            }
        }
    }

    /// Caller holds `cluster0_lock`
    fn one_out(&self) -> Result<()> {
        let target = self
            .topology
            .model()
            .little_secondaries()
            .rev()
            .find(|&cpu| self.platform.cpu_online(cpu));
        match target {
            Some(cpu) => self.down(cpu),
            None => {
                debug!("No online little secondary to take out");
                Ok(())
            }
        }
    }

    fn up(&self, cpu: CpuId) -> Result<()> {
        if self.platform.cpu_online(cpu) {
            self.topology.set_online(cpu, true);
            return Ok(());
        }
        self.platform.cpu_up(cpu).map_err(|errno| GovernorError::Actuation {
            cpu,
            op: Actuation::Up,
            errno,
        })?;
        self.topology.set_online(cpu, true);
        debug!("cpu{} online", cpu);
        Ok(())
    }

    fn down(&self, cpu: CpuId) -> Result<()> {
        if cpu == BOOT_CPU {
            warn!("Refusing to take the boot CPU offline");
            return Ok(());
        }
        if !self.platform.cpu_online(cpu) {
            self.topology.set_online(cpu, false);
            return Ok(());
        }
        self.platform.cpu_down(cpu).map_err(|errno| GovernorError::Actuation {
            cpu,
            op: Actuation::Down,
            errno,
        })?;
        self.topology.set_online(cpu, false);
        debug!("cpu{} offline", cpu);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FreqPolicy;
    use crate::sim::SimPlatform;
    use crate::topology::TopologyModel;
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Duration;

    const MODEL: TopologyModel = TopologyModel::AsymmetricBigLittle {
        little: 4,
        big: 4,
        low_power_cores: 1,
    };

    fn setup() -> (Arc<SimPlatform>, HotplugExecutor) {
        let platform = Arc::new(SimPlatform::new(
            &MODEL,
            FreqPolicy {
                min: 400_000,
                max: 1_300_000,
                cur: 400_000,
            },
        ));
        let topology = Arc::new(Topology::new(MODEL));
        let executor = HotplugExecutor::new(platform.clone(), topology);
        (platform, executor)
    }

    #[test]
    fn test_low_power_keeps_boot_cpu() {
        let (platform, executor) = setup();
        executor
            .execute(HotplugCommand::LowPower, ExecContext::default())
            .unwrap();
        assert_eq!(platform.online_cpus(), vec![0]);
        assert_eq!(executor.topology().online_cpus(), vec![0]);
    }

    #[test]
    fn test_normal_is_idempotent() {
        let (platform, executor) = setup();
        platform.force_online(2, false);
        platform.force_online(6, false);

        executor
            .execute(HotplugCommand::Normal, ExecContext::default())
            .unwrap();
        let first = platform.online_cpus();
        let ups = platform.up_calls();
        assert_eq!(first.len(), 8);
        assert_eq!(ups, 2);

        executor
            .execute(HotplugCommand::Normal, ExecContext::default())
            .unwrap();
        assert_eq!(platform.online_cpus(), first);
        assert_eq!(platform.up_calls(), ups);
        assert_eq!(platform.down_calls(), 0);
    }

    #[test]
    fn test_cluster1_out_stops_at_first_failure() {
        let (platform, executor) = setup();
        platform.fail_down(5);

        let err = executor.cluster1_out().unwrap_err();
        assert!(matches!(
            err,
            GovernorError::Actuation {
                cpu: 5,
                op: Actuation::Down,
                ..
            }
        ));
        // 7 and 6 went down first, 4 was never attempted
        assert_eq!(platform.online_cpus(), vec![0, 1, 2, 3, 4, 5]);
        assert!(!executor.cluster1_hotplugged());
    }

    #[test]
    fn test_cluster1_pin_survives_normal() {
        let (platform, executor) = setup();
        executor.cluster1_out().unwrap();
        assert!(executor.cluster1_hotplugged());

        executor
            .execute(HotplugCommand::Normal, ExecContext::default())
            .unwrap();
        assert_eq!(platform.online_cpus(), vec![0, 1, 2, 3]);

        executor.cluster1_in().unwrap();
        assert!(!executor.cluster1_hotplugged());
        assert_eq!(platform.online_cpus().len(), 8);
    }

    #[test]
    fn test_one_in_one_out() {
        let (platform, executor) = setup();
        executor.cluster0_one_out().unwrap();
        executor.cluster0_one_out().unwrap();
        assert_eq!(platform.online_cpus(), vec![0, 1, 4, 5, 6, 7]);

        executor.cluster0_one_in().unwrap();
        assert_eq!(platform.online_cpus(), vec![0, 1, 2, 4, 5, 6, 7]);
    }

    #[test]
    fn test_one_out_never_takes_boot_cpu() {
        let (platform, executor) = setup();
        for _ in 0..6 {
            executor.cluster0_one_out().unwrap();
        }
        assert_eq!(platform.online_cpus(), vec![0, 4, 5, 6, 7]);
    }

    #[test]
    fn test_disabled_context_skips_mode_commands() {
        let (platform, executor) = setup();
        let ctx = ExecContext {
            hotplug_disabled: true,
            suspend_prepared: false,
        };
        executor.execute(HotplugCommand::LowPower, ctx).unwrap();
        assert_eq!(platform.online_cpus().len(), 8);
        assert_eq!(platform.down_calls(), 0);

        let ctx = ExecContext {
            hotplug_disabled: false,
            suspend_prepared: true,
        };
        platform.force_online(3, false);
        executor.execute(HotplugCommand::Normal, ctx).unwrap();
        assert!(!platform.online_cpus().contains(&3));
    }

    /// Parks `cpu_up` of one CPU until the test releases it
    struct GatedPlatform {
        inner: SimPlatform,
        gated_cpu: CpuId,
        entered: Barrier,
        release: Barrier,
    }

    impl Platform for GatedPlatform {
        fn cpu_online(&self, cpu: CpuId) -> bool {
            self.inner.cpu_online(cpu)
        }

        fn cpu_up(&self, cpu: CpuId) -> std::result::Result<(), nix::errno::Errno> {
            if cpu == self.gated_cpu {
                self.entered.wait();
                self.release.wait();
            }
            self.inner.cpu_up(cpu)
        }

        fn cpu_down(&self, cpu: CpuId) -> std::result::Result<(), nix::errno::Errno> {
            self.inner.cpu_down(cpu)
        }

        fn cpu_times(&self) -> Vec<(CpuId, crate::platform::CpuTimes)> {
            self.inner.cpu_times()
        }

        fn cpufreq_policy(&self, cpu: CpuId) -> Option<FreqPolicy> {
            self.inner.cpufreq_policy(cpu)
        }

        fn pm_qos_request(&self, class: crate::platform::QosClass) -> u32 {
            self.inner.pm_qos_request(class)
        }

        fn nr_running(&self, signal: crate::platform::RunQueueSignal) -> u32 {
            self.inner.nr_running(signal)
        }
    }

    #[test]
    fn test_clusters_actuate_independently() {
        let inner = SimPlatform::new(
            &MODEL,
            FreqPolicy {
                min: 400_000,
                max: 1_300_000,
                cur: 400_000,
            },
        );
        inner.force_online(1, false);
        let platform = Arc::new(GatedPlatform {
            inner,
            gated_cpu: 1,
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let topology = Arc::new(Topology::new(MODEL));
        topology.set_online(1, false);
        let executor = HotplugExecutor::new(platform.clone(), topology);

        thread::scope(|scope| {
            let little = scope.spawn(|| executor.cluster0_one_in());
            // cluster0_lock is now held with cpu_up(1) parked
            platform.entered.wait();

            let (tx, rx) = mpsc::channel();
            let executor = &executor;
            let big = scope.spawn(move || tx.send(executor.cluster1_out()));
            let big_result = rx.recv_timeout(Duration::from_secs(5));

            platform.release.wait();
            little.join().unwrap().unwrap();
            big.join().unwrap().unwrap();

            big_result
                .expect("cluster1_out waited on the little cluster")
                .unwrap();
        });

        assert_eq!(platform.inner.online_cpus(), vec![0, 1, 2, 3]);
        assert!(executor.cluster1_hotplugged());
    }

    #[test]
    fn test_cluster1_in_aborts_on_failure() {
        let (platform, executor) = setup();
        executor.cluster1_out().unwrap();
        platform.fail_up(5);

        assert!(executor.cluster1_in().is_err());
        assert_eq!(platform.online_cpus(), vec![0, 1, 2, 3, 4]);
    }
}
