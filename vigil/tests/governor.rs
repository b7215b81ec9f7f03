//! End-to-end governor behaviour against the simulated platform

use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vigil::platform::{FreqPolicy, QosClass};
use vigil::{
    CpuidleGate, Governor, GovernorOptions, HotplugCommand, IdleState, Knob, NotifierChain,
    PowerEvent, SimPlatform, Topology, TopologyModel, Tunables,
};

const MODEL: TopologyModel = TopologyModel::AsymmetricBigLittle {
    little: 4,
    big: 4,
    low_power_cores: 1,
};

const POLICY: FreqPolicy = FreqPolicy {
    min: 400_000,
    max: 1_300_000,
    cur: 400_000,
};

struct Harness {
    platform: Arc<SimPlatform>,
    gate: Arc<CpuidleGate>,
    notifier: Arc<NotifierChain>,
    governor: Arc<Governor>,
    // Dropped last so the governor's tasks outlive every other field
    _runtime: tokio::runtime::Runtime,
}

impl Harness {
    /// Governor without a running worker, so every tick is driven by the test
    fn new(tunables: Tunables, forced_hotplug: bool, watchdog_interval: Duration) -> Self {
        Self::build(tunables, forced_hotplug, watchdog_interval, false)
    }

    /// Governor subscribed to the notifier with its worker parked on a long poll
    fn started(tunables: Tunables) -> Self {
        Self::build(tunables, false, Duration::from_secs(3600), true)
    }

    fn build(
        tunables: Tunables,
        forced_hotplug: bool,
        watchdog_interval: Duration,
        start: bool,
    ) -> Self {
        let platform = Arc::new(SimPlatform::new(&MODEL, POLICY));
        let topology = Arc::new(Topology::new(MODEL));
        let options = GovernorOptions {
            forced_hotplug,
            tunables: Tunables {
                out_delay_ms: 3_600_000,
                in_delay_ms: 3_600_000,
                ..tunables
            },
            watchdog_interval,
            ..GovernorOptions::default()
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let governor = Governor::new(
            platform.clone(),
            Arc::clone(&topology),
            options,
            runtime.handle().clone(),
        );
        let gate = Arc::new(CpuidleGate::new(topology, governor.display_flag(), true, true));
        let notifier = Arc::new(NotifierChain::new());
        let governor = governor.with_idle_limits(Arc::clone(&gate), platform.clone());
        let governor = if start {
            governor.start(Arc::clone(&notifier)).unwrap()
        } else {
            Arc::new(governor)
        };

        Self {
            platform,
            gate,
            notifier,
            governor,
            _runtime: runtime,
        }
    }

    fn event(&self, event: PowerEvent) {
        self.governor.handle_event(event);
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.governor.shutdown();
    }
}

fn zero_stay() -> Tunables {
    Tunables {
        stay_threshold: 0,
        ..Tunables::default()
    }
}

#[test]
fn test_display_off_light_load_reaches_low_power() {
    let h = Harness::new(zero_stay(), false, Duration::from_secs(3600));
    h.event(PowerEvent::DisplayBlank);

    assert_eq!(h.governor.tick().unwrap(), Some(HotplugCommand::LowPower));
    let status = h.governor.status();
    assert_eq!(status.hysteresis.low_stay, 1);
    assert!(status.in_low_power_mode);
    assert_eq!(h.platform.online_cpus(), vec![0]);

    // Only the boot CPU is left and the display is dark: LPM is legal
    assert!(h.gate.lpm_allowed());
    assert_eq!(h.gate.select_state(IdleState::Lpm), IdleState::Lpm);
    assert!(!h.platform.is_state_disabled(0, IdleState::Lpm));
}

#[test]
fn test_display_on_blocks_low_power() {
    let h = Harness::new(zero_stay(), false, Duration::from_secs(3600));
    for _ in 0..5 {
        h.governor.tick().unwrap();
    }
    assert_eq!(h.governor.status().applied, HotplugCommand::Cluster0In);
    assert_eq!(h.platform.online_cpus().len(), 8);
    assert!(h.platform.is_state_disabled(0, IdleState::Lpm));
}

#[test]
fn test_display_blank_forces_normal_and_runs_watchdog() {
    let h = Harness::new(Tunables::default(), false, Duration::from_millis(5));

    h.event(PowerEvent::DisplayBlank);
    let status = h.governor.status();
    assert!(!status.lcd_on);
    assert_eq!(status.applied, HotplugCommand::Normal);
    assert!(status.watchdog_running);
    // Already at Normal: nothing toggled
    assert_eq!(h.platform.up_calls(), 0);
    assert_eq!(h.platform.online_cpus().len(), 8);

    let before = status.executions;
    thread::sleep(Duration::from_millis(100));
    assert!(h.governor.status().executions > before);
    assert_eq!(h.platform.up_calls(), 0);
    assert_eq!(h.platform.down_calls(), 0);

    h.event(PowerEvent::DisplayUnblank);
    let status = h.governor.status();
    assert!(status.lcd_on);
    assert!(!status.watchdog_running);
}

#[test]
fn test_executor_runs_only_on_transitions() {
    let h = Harness::new(Tunables::default(), false, Duration::from_secs(3600));
    let executions = || h.governor.status().executions;

    // Light load: Normal -> Cluster0In
    assert_eq!(h.governor.tick().unwrap(), Some(HotplugCommand::Cluster0In));
    assert_eq!(executions(), 1);
    for _ in 0..3 {
        assert_eq!(h.governor.tick().unwrap(), None);
    }
    assert_eq!(executions(), 1);

    // Little cluster saturated: Cluster0In -> Normal
    h.platform.set_cur_freq(0..8, POLICY.max);
    assert_eq!(h.governor.tick().unwrap(), Some(HotplugCommand::Normal));
    assert_eq!(h.governor.tick().unwrap(), None);
    assert_eq!(executions(), 2);

    // Back to light load
    h.platform.set_cur_freq(0..8, POLICY.min);
    assert_eq!(h.governor.tick().unwrap(), Some(HotplugCommand::Cluster0In));
    assert_eq!(executions(), 3);
    assert_eq!(h.governor.status().ticks, 7);
}

#[test]
fn test_run_queue_pressure_brings_one_little_core() {
    let h = Harness::new(zero_stay(), true, Duration::from_secs(3600));
    assert_eq!(h.governor.tick().unwrap(), Some(HotplugCommand::LowPower));
    assert_eq!(h.platform.online_cpus(), vec![0]);

    h.platform.set_nr_running(3);
    assert_eq!(h.governor.tick().unwrap(), Some(HotplugCommand::Cluster0OneIn));
    assert_eq!(h.platform.online_cpus(), vec![0, 1]);
    assert!(h.governor.status().in_low_power_mode);
}

#[test]
fn test_qos_floor_leaves_low_power() {
    let h = Harness::new(zero_stay(), true, Duration::from_secs(3600));
    h.governor.tick().unwrap();
    assert!(h.governor.status().in_low_power_mode);

    // A floor above the big cluster minimum counts as load
    h.platform.set_qos(QosClass::Cluster1MinFreq, 800_000);
    h.governor.store_knob(Knob::ForcedHotplug, "0").unwrap();
    assert_eq!(h.governor.tick().unwrap(), Some(HotplugCommand::Cluster0In));
    assert_eq!(h.platform.online_cpus(), vec![0, 1, 2, 3]);
    assert!(!h.governor.status().in_low_power_mode);
}

#[test]
fn test_thermal_pin_survives_forced_normal() {
    let h = Harness::new(Tunables::default(), false, Duration::from_secs(3600));
    h.governor.cluster1_out().unwrap();
    assert_eq!(h.platform.online_cpus(), vec![0, 1, 2, 3]);

    h.event(PowerEvent::DisplayBlank);
    assert_eq!(h.platform.online_cpus(), vec![0, 1, 2, 3]);
    assert!(h.governor.status().cluster1_hotplugged);

    h.governor.cluster1_in().unwrap();
    assert_eq!(h.platform.online_cpus().len(), 8);
}

#[test]
fn test_invalid_nr_running_keeps_previous_values() {
    let h = Harness::new(Tunables::default(), false, Duration::from_secs(3600));
    h.governor.store_knob(Knob::NrRunning, "4 3").unwrap();

    let err = h.governor.store_knob(Knob::NrRunning, "1 1").unwrap_err();
    assert!(err.is_validation());
    let tunables = h.governor.tunables();
    assert_eq!(tunables.nr_running_threshold, 4);
    assert_eq!(tunables.nr_running_range, 3);
}

#[test]
fn test_suspend_resume_cycle() {
    let h = Harness::new(Tunables::default(), false, Duration::from_secs(3600));

    h.event(PowerEvent::SuspendPrepare);
    assert_eq!(h.platform.online_cpus(), vec![0]);
    assert_eq!(h.governor.tick().unwrap(), None);
    assert_eq!(h.governor.status().ticks, 0);

    h.event(PowerEvent::PostResume);
    let status = h.governor.status();
    assert!(status.enabled);
    assert!(!status.suspend_prepared);
    assert!(status.worker_running);
    assert_eq!(h.governor.tick().unwrap(), Some(HotplugCommand::Cluster0In));
}

#[test]
fn test_notifier_drives_started_governor() {
    let h = Harness::started(Tunables::default());
    assert_eq!(h.notifier.len(), 1);
    assert!(h.governor.status().worker_running);

    h.notifier.notify(PowerEvent::SuspendPrepare);
    let status = h.governor.status();
    assert!(status.suspend_prepared);
    assert!(!status.worker_running);

    h.notifier.notify(PowerEvent::PostResume);
    h.notifier.notify(PowerEvent::Reboot);
    let status = h.governor.status();
    assert!(!status.enabled);
    assert!(!status.worker_running);

    h.governor.shutdown();
    assert!(h.notifier.is_empty());
}

proptest! {
    #[test]
    fn prop_disable_count_never_negative(ops in proptest::collection::vec(any::<bool>(), 0..32)) {
        let platform = Arc::new(SimPlatform::new(&MODEL, POLICY));
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let governor = Governor::new(
            platform,
            Arc::new(Topology::new(MODEL)),
            GovernorOptions::default(),
            runtime.handle().clone(),
        );

        let mut expected: u32 = 0;
        for enable in ops {
            if enable {
                governor.enable();
                expected = expected.saturating_sub(1);
            } else {
                governor.disable();
                expected += 1;
            }
            prop_assert_eq!(governor.status().disable_count, expected);
            prop_assert_eq!(governor.is_enabled(), expected == 0);
        }
    }
}
