//! Mode controller
//!
//! Owns the mode flags and the hysteresis state, runs the poll worker and the
//! display-off watchdog as tasks on a multi-threaded tokio runtime, and reacts
//! to power events delivered through the notifier chain. Sampling and
//! actuation block, so each tick runs through `spawn_blocking`.
//!
//! Locking: `toggle_lock` serializes worker start/stop, then the global state
//! mutex guards flags, counters and tunables. The executor's cluster locks are
//! only ever taken after the state mutex. Worker and watchdog joins happen
//! with the state mutex released, and never from inside the runtime's async
//! context.

use crate::cpuidle::CpuidleGate;
use crate::decision::{decide, parse_switch, DecisionInput, HotplugCommand, HysteresisCounters, Tunables};
use crate::error::{GovernorError, Result};
use crate::executor::{ExecContext, HotplugExecutor};
use crate::notifier::{NotifierChain, NotifierId, PowerEvent};
use crate::platform::{IdleStateControl, Platform, RunQueueSignal};
use crate::sampler::LoadSampler;
use crate::timer::{ArmMode, PollTimer, WaitOutcome};
use crate::topology::{CpuId, Topology};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WORKER_NAME: &str = "vigil-hotplug";
const WATCHDOG_NAME: &str = "vigil-watchdog";

/// Startup options of a [`Governor`]
#[derive(Debug, Clone)]
pub struct GovernorOptions {
    pub enabled: bool,
    pub forced_hotplug: bool,
    pub tunables: Tunables,
    pub scheduling: ArmMode,
    pub down_sample: Duration,
    pub watchdog_interval: Duration,
}

impl Default for GovernorOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            forced_hotplug: false,
            tunables: Tunables::default(),
            scheduling: ArmMode::Periodic,
            down_sample: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(1),
        }
    }
}

impl From<&crate::config::GovernorConfig> for GovernorOptions {
    fn from(config: &crate::config::GovernorConfig) -> Self {
        Self {
            enabled: config.enabled,
            forced_hotplug: config.forced_hotplug,
            tunables: config.tunables(),
            scheduling: config.scheduling,
            down_sample: Duration::from_millis(config.down_sample_ms),
            watchdog_interval: Duration::from_millis(config.watchdog_interval_ms),
        }
    }
}

/// Runtime knob addressable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Knob {
    Enable,
    StayThreshold,
    /// `"<out_delay_ms> <in_delay_ms>"`
    Delays,
    /// `"<threshold> <range>"`
    NrRunning,
    NormalMinFreq,
    Cluster1BusyFreq,
    LoadReportThreshold,
    RunQueueSignal,
    OneCoreIn,
    ForcedHotplug,
}

impl Knob {
    pub const ALL: [Knob; 10] = [
        Self::Enable,
        Self::StayThreshold,
        Self::Delays,
        Self::NrRunning,
        Self::NormalMinFreq,
        Self::Cluster1BusyFreq,
        Self::LoadReportThreshold,
        Self::RunQueueSignal,
        Self::OneCoreIn,
        Self::ForcedHotplug,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::StayThreshold => "stay_threshold",
            Self::Delays => "delays",
            Self::NrRunning => "nr_running",
            Self::NormalMinFreq => "normal_min_freq",
            Self::Cluster1BusyFreq => "cluster1_busy_freq",
            Self::LoadReportThreshold => "load_report_threshold",
            Self::RunQueueSignal => "run_queue_signal",
            Self::OneCoreIn => "one_core_in",
            Self::ForcedHotplug => "forced_hotplug",
        }
    }
}

impl fmt::Display for Knob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Knob {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| GovernorError::InvalidTunable(format!("unknown knob '{}'", s)))
    }
}

fn parse_freq(name: &str, input: &str) -> Result<u32> {
    input
        .trim()
        .parse::<u32>()
        .map_err(|e| GovernorError::InvalidTunable(format!("{}: {}", name, e)))
}

/// Point-in-time view of the governor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorStatus {
    pub enabled: bool,
    pub disable_count: u32,
    pub lcd_on: bool,
    pub in_low_power_mode: bool,
    pub suspend_prepared: bool,
    pub forced_hotplug: bool,
    pub one_core_in_request: bool,
    /// Last command that was applied successfully
    pub applied: HotplugCommand,
    /// Result of the most recent decision
    pub last_decided: Option<HotplugCommand>,
    pub hysteresis: HysteresisCounters,
    pub online_cpus: Vec<CpuId>,
    pub cluster1_hotplugged: bool,
    pub ticks: u64,
    /// Number of executor invocations
    pub executions: u64,
    pub worker_running: bool,
    pub watchdog_running: bool,
    pub last_error: Option<String>,
}

/// State behind the global mutex
#[derive(Debug)]
struct GovernorState {
    disable_count: u32,
    in_low_power_mode: bool,
    suspend_prepared: bool,
    forced_hotplug: bool,
    hysteresis: HysteresisCounters,
    tunables: Tunables,
    applied: HotplugCommand,
    last_decided: Option<HotplugCommand>,
    sampler: LoadSampler,
    ticks: u64,
    executions: u64,
    last_error: Option<String>,
}

impl GovernorState {
    fn exec_context(&self) -> ExecContext {
        ExecContext {
            hotplug_disabled: self.disable_count > 0,
            suspend_prepared: self.suspend_prepared,
        }
    }

    fn disable(&mut self) {
        match self.disable_count.checked_add(1) {
            Some(count) => self.disable_count = count,
            None => warn!("Hotplug disable count overflow"),
        }
    }

    /// Returns true when the count reached zero
    fn enable(&mut self) -> bool {
        if self.disable_count == 0 {
            warn!("Hotplug enable without a matching disable");
            return false;
        }
        self.disable_count -= 1;
        self.disable_count == 0
    }
}

type IdleLimits = (Arc<CpuidleGate>, Arc<dyn IdleStateControl>);

/// Dynamic hotplug governor
pub struct Governor {
    platform: Arc<dyn Platform>,
    topology: Arc<Topology>,
    executor: HotplugExecutor,
    display_on: Arc<AtomicBool>,
    idle_limits: Option<IdleLimits>,
    state: Mutex<GovernorState>,
    toggle_lock: Mutex<()>,
    timer: PollTimer,
    watchdog_timer: PollTimer,
    watchdog_interval: Duration,
    runtime: Handle,
    worker: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<(Arc<NotifierChain>, NotifierId)>>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Governor {
    /// Create a stopped governor whose tasks will run on `runtime`
    pub fn new(
        platform: Arc<dyn Platform>,
        topology: Arc<Topology>,
        options: GovernorOptions,
        runtime: Handle,
    ) -> Self {
        let state = GovernorState {
            disable_count: if options.enabled { 0 } else { 1 },
            in_low_power_mode: false,
            suspend_prepared: false,
            forced_hotplug: options.forced_hotplug,
            hysteresis: HysteresisCounters::default(),
            sampler: LoadSampler::new(options.tunables.load_report_threshold),
            tunables: options.tunables,
            applied: HotplugCommand::Normal,
            last_decided: None,
            ticks: 0,
            executions: 0,
            last_error: None,
        };

        Self {
            executor: HotplugExecutor::new(Arc::clone(&platform), Arc::clone(&topology)),
            platform,
            topology,
            display_on: Arc::new(AtomicBool::new(true)),
            idle_limits: None,
            state: Mutex::new(state),
            toggle_lock: Mutex::new(()),
            timer: PollTimer::new(options.scheduling, options.down_sample),
            watchdog_timer: PollTimer::new(ArmMode::Periodic, options.watchdog_interval),
            watchdog_interval: options.watchdog_interval,
            runtime,
            worker: Mutex::new(None),
            watchdog: Mutex::new(None),
            registration: Mutex::new(None),
        }
    }

    /// Keep the cpuidle switches in step with topology and display changes
    pub fn with_idle_limits(mut self, gate: Arc<CpuidleGate>, control: Arc<dyn IdleStateControl>) -> Self {
        self.idle_limits = Some((gate, control));
        self
    }

    /// Display flag shared with the cpuidle gate
    pub fn display_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.display_on)
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn executor(&self) -> &HotplugExecutor {
        &self.executor
    }

    /// Spawn the poll worker, then subscribe to `notifier`.
    ///
    /// Stopping joins tasks synchronously, which a current-thread runtime
    /// cannot drive; such a runtime fails the start and nothing is subscribed.
    pub fn start(self, notifier: Arc<NotifierChain>) -> Result<Arc<Self>> {
        if self.runtime.runtime_flavor() != RuntimeFlavor::MultiThread {
            return Err(GovernorError::UnsupportedRuntime);
        }
        let governor = Arc::new(self);
        governor.spawn_worker();

        let weak = Arc::downgrade(&governor);
        let id = notifier.register(move |event| {
            if let Some(governor) = weak.upgrade() {
                governor.handle_event(event);
            }
        });
        *relock(&governor.registration) = Some((notifier, id));

        governor.refresh_idle_limits();
        info!(
            "Hotplug governor started ({} CPUs, {:?} scheduling)",
            governor.topology.model().nr_cpus(),
            governor.timer.mode()
        );
        Ok(governor)
    }

    /// Unsubscribe and stop every task; safe to call more than once.
    ///
    /// Blocks until the tasks finish, so it must not be called from async code.
    pub fn shutdown(&self) {
        if let Some((notifier, id)) = relock(&self.registration).take() {
            notifier.unregister(id);
        }
        let _toggle = relock(&self.toggle_lock);
        self.stop_watchdog();
        self.stop_worker();
        info!("Hotplug governor stopped");
    }

    fn lock_state(&self) -> MutexGuard<'_, GovernorState> {
        relock(&self.state)
    }

    // Worker

    fn spawn_worker(self: &Arc<Self>) {
        let mut slot = relock(&self.worker);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.timer.rearm();
        *slot = Some(self.runtime.spawn(Arc::clone(self).run_worker()));
    }

    fn stop_worker(&self) {
        self.timer.cancel();
        let handle = relock(&self.worker).take();
        self.join_task(handle, WORKER_NAME);
    }

    async fn run_worker(self: Arc<Self>) {
        debug!("Hotplug worker running");
        loop {
            let wait = self.next_wait();
            if self.timer.wait(wait).await == WaitOutcome::Cancelled {
                break;
            }
            let governor = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || governor.tick()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_transient() => {}
                Ok(Err(e)) => error!("Hotplug tick failed: {}", e),
                Err(e) => error!("Hotplug tick aborted: {}", e),
            }
        }
        debug!("Hotplug worker exiting");
    }

    /// Wait for a stopped task to finish
    fn join_task(&self, handle: Option<JoinHandle<()>>, name: &str) {
        let Some(handle) = handle else {
            return;
        };
        match self.runtime.block_on(handle) {
            Ok(()) => debug!("{} task joined", name),
            Err(e) if e.is_panic() => error!("{} task panicked", name),
            Err(e) => warn!("{} task cancelled: {}", name, e),
        }
    }

    fn next_wait(&self) -> Duration {
        let state = self.lock_state();
        let poll = Duration::from_millis(state.tunables.poll_delay_ms(state.in_low_power_mode));
        let steady = self.topology.all_online() && state.last_decided == Some(state.applied);
        self.timer.next_interval(poll, steady)
    }

    /// One sample-decide-execute iteration.
    ///
    /// Returns the command applied, or `None` when nothing changed or the
    /// governor is disabled.
    pub fn tick(&self) -> Result<Option<HotplugCommand>> {
        let mut state = self.lock_state();
        if state.disable_count > 0 || state.suspend_prepared {
            return Ok(None);
        }

        let model = self.topology.model();
        let signal = state.tunables.run_queue_signal;
        let snapshot = state.sampler.sample(self.platform.as_ref(), model, signal);
        let input = DecisionInput {
            has_big_cluster: model.has_big_cluster(),
            little_secondary_offline: self.topology.little_secondary_offline(),
            lcd_on: self.display_on.load(Ordering::Acquire),
            forced_hotplug: state.forced_hotplug,
            in_low_power_mode: state.in_low_power_mode,
            ..DecisionInput::from_snapshot(&snapshot)
        };

        let state = &mut *state;
        let cmd = decide(&input, &state.tunables, &mut state.hysteresis);
        state.ticks += 1;
        state.last_decided = Some(cmd);

        if cmd == state.applied {
            return Ok(None);
        }
        debug!(
            "Transition {} -> {} (load_freq {} kHz, low_stay {})",
            state.applied, cmd, input.load_freq, state.hysteresis.low_stay
        );
        self.apply_locked(state, cmd)?;
        Ok(Some(cmd))
    }

    /// Run `cmd` through the executor and record it on success.
    ///
    /// Returns false when the current mode flags skip the command.
    fn apply_locked(&self, state: &mut GovernorState, cmd: HotplugCommand) -> Result<bool> {
        let ctx = state.exec_context();
        if ctx.skips(cmd) {
            debug!("Skipping {} while disabled or suspend prepared", cmd);
            return Ok(false);
        }

        state.executions += 1;
        if let Err(e) = self.executor.execute(cmd, ctx) {
            state.last_error = Some(e.to_string());
            return Err(e);
        }

        state.last_error = None;
        state.applied = cmd;
        match cmd {
            HotplugCommand::LowPower => state.in_low_power_mode = true,
            HotplugCommand::Normal | HotplugCommand::Cluster0In | HotplugCommand::Cluster1In => {
                state.in_low_power_mode = false
            }
            _ => {}
        }
        self.refresh_idle_limits();
        Ok(true)
    }

    /// Apply `cmd` now, whatever was applied before
    fn force(&self, cmd: HotplugCommand) {
        let mut state = self.lock_state();
        if let Err(e) = self.apply_locked(&mut state, cmd) {
            warn!("Forced {} failed: {}", cmd, e);
        }
    }

    /// Push LPM legality into the cpuidle switches, if configured
    pub fn refresh_idle_limits(&self) {
        if let Some((gate, control)) = &self.idle_limits {
            if let Err(e) = gate.apply_limits(control.as_ref()) {
                warn!("Failed to update idle limits: {}", e);
            }
        }
    }

    /// Wake the worker for an early tick
    pub fn kick(&self) {
        self.timer.kick();
    }

    // Watchdog

    fn start_watchdog(self: &Arc<Self>) {
        let mut slot = relock(&self.watchdog);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.watchdog_timer.rearm();
        *slot = Some(self.runtime.spawn(Arc::clone(self).run_watchdog()));
    }

    fn stop_watchdog(&self) {
        self.watchdog_timer.cancel();
        let handle = relock(&self.watchdog).take();
        self.join_task(handle, WATCHDOG_NAME);
    }

    async fn run_watchdog(self: Arc<Self>) {
        debug!("Display-off watchdog running");
        loop {
            if self.watchdog_timer.wait(self.watchdog_interval).await == WaitOutcome::Cancelled {
                break;
            }
            if self.display_on.load(Ordering::Acquire) {
                break;
            }
            let governor = Arc::clone(&self);
            if let Err(e) = tokio::task::spawn_blocking(move || governor.reapply_normal()).await {
                error!("Watchdog re-apply aborted: {}", e);
            }
        }
        debug!("Display-off watchdog exiting");
    }

    /// Re-apply `Normal` unless something else has been applied since
    fn reapply_normal(&self) {
        let mut state = self.lock_state();
        if state.applied != HotplugCommand::Normal {
            return;
        }
        if let Err(e) = self.apply_locked(&mut state, HotplugCommand::Normal) {
            warn!("Watchdog re-apply of normal failed: {}", e);
        }
    }

    // Events

    /// React to a power event
    pub fn handle_event(self: &Arc<Self>, event: PowerEvent) {
        info!("Power event: {}", event);
        match event {
            PowerEvent::DisplayBlank => {
                self.display_on.store(false, Ordering::Release);
                self.force(HotplugCommand::Normal);
                self.refresh_idle_limits();
                self.start_watchdog();
            }
            PowerEvent::DisplayUnblank => {
                self.display_on.store(true, Ordering::Release);
                self.stop_watchdog();
                self.refresh_idle_limits();
                self.kick();
            }
            PowerEvent::SuspendPrepare => {
                let _toggle = relock(&self.toggle_lock);
                {
                    let mut state = self.lock_state();
                    if let Err(e) = self.apply_locked(&mut state, HotplugCommand::LowPower) {
                        warn!("Suspend low-power entry failed: {}", e);
                    }
                    state.disable();
                    state.suspend_prepared = true;
                }
                self.stop_worker();
            }
            PowerEvent::PostResume => {
                let _toggle = relock(&self.toggle_lock);
                {
                    let mut state = self.lock_state();
                    state.enable();
                    state.suspend_prepared = false;
                }
                self.spawn_worker();
            }
            PowerEvent::Reboot => {
                let _toggle = relock(&self.toggle_lock);
                self.lock_state().disable();
                self.stop_watchdog();
                self.stop_worker();
            }
        }
    }

    // Control surface

    /// Drop one disable reference
    pub fn enable(&self) {
        let _toggle = relock(&self.toggle_lock);
        let resumed = self.lock_state().enable();
        if resumed {
            info!("Hotplug governor enabled");
            self.kick();
        }
    }

    /// Bring every core back and take a disable reference
    pub fn disable(&self) {
        let _toggle = relock(&self.toggle_lock);
        let mut state = self.lock_state();
        if let Err(e) = self.apply_locked(&mut state, HotplugCommand::Normal) {
            warn!("Failed to restore cores before disabling: {}", e);
        }
        state.disable();
        info!("Hotplug governor disabled (count {})", state.disable_count);
    }

    pub fn is_enabled(&self) -> bool {
        self.lock_state().disable_count == 0
    }

    pub fn set_forced_hotplug(&self, forced: bool) {
        self.lock_state().forced_hotplug = forced;
        info!("Forced hotplug {}", if forced { "on" } else { "off" });
        self.kick();
    }

    /// Request (or withdraw) extra little cores regardless of run-queue pressure
    pub fn set_one_core_in(&self, request: bool) {
        let _toggle = relock(&self.toggle_lock);
        self.lock_state().tunables.one_core_in_request = request;
        self.kick();
    }

    /// Copy of the current tunables
    pub fn tunables(&self) -> Tunables {
        self.lock_state().tunables.clone()
    }

    /// Modify tunables through `f`; the change is discarded if `f` fails
    pub fn update_tunables<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Tunables) -> Result<()>,
    {
        let mut state = self.lock_state();
        let mut tunables = state.tunables.clone();
        f(&mut tunables)?;
        tunables.validate()?;
        state.sampler.set_load_report_threshold(tunables.load_report_threshold);
        state.tunables = tunables;
        Ok(())
    }

    /// Set a knob from its text form
    pub fn store_knob(&self, knob: Knob, value: &str) -> Result<()> {
        match knob {
            Knob::Enable => {
                if parse_switch(knob.name(), value)? {
                    self.enable();
                } else {
                    self.disable();
                }
                return Ok(());
            }
            Knob::OneCoreIn => {
                self.set_one_core_in(parse_switch(knob.name(), value)?);
                return Ok(());
            }
            Knob::ForcedHotplug => {
                self.set_forced_hotplug(parse_switch(knob.name(), value)?);
                return Ok(());
            }
            _ => {}
        }

        self.update_tunables(|t| match knob {
            Knob::StayThreshold => t.store_stay_threshold(value),
            Knob::Delays => t.store_delays(value),
            Knob::NrRunning => t.store_nr_running(value),
            Knob::NormalMinFreq => {
                t.normal_min_freq = parse_freq(knob.name(), value)?;
                Ok(())
            }
            Knob::Cluster1BusyFreq => {
                t.cluster1_busy_freq = parse_freq(knob.name(), value)?;
                Ok(())
            }
            Knob::LoadReportThreshold => {
                t.load_report_threshold = parse_freq(knob.name(), value)?;
                Ok(())
            }
            Knob::RunQueueSignal => {
                t.run_queue_signal = match value.trim() {
                    "instantaneous" => RunQueueSignal::Instantaneous,
                    "averaged" => RunQueueSignal::Averaged,
                    other => {
                        return Err(GovernorError::InvalidTunable(format!(
                            "run_queue_signal must be 'instantaneous' or 'averaged', got '{}'",
                            other
                        )))
                    }
                };
                Ok(())
            }
            Knob::Enable | Knob::OneCoreIn | Knob::ForcedHotplug => Ok(()),
        })?;
        debug!("Knob {} set to {:?}", knob, value.trim());
        Ok(())
    }

    /// External cluster requests (thermal, boosters)
    pub fn cluster1_out(&self) -> Result<()> {
        let result = self.executor.cluster1_out();
        self.refresh_idle_limits();
        result
    }

    pub fn cluster1_in(&self) -> Result<()> {
        let result = self.executor.cluster1_in();
        self.refresh_idle_limits();
        result
    }

    pub fn cluster0_one_in(&self) -> Result<()> {
        let result = self.executor.cluster0_one_in();
        self.refresh_idle_limits();
        result
    }

    pub fn cluster0_one_out(&self) -> Result<()> {
        let result = self.executor.cluster0_one_out();
        self.refresh_idle_limits();
        result
    }

    pub fn status(&self) -> GovernorStatus {
        let worker_running = relock(&self.worker).as_ref().is_some_and(|h| !h.is_finished());
        let watchdog_running = relock(&self.watchdog)
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        let state = self.lock_state();
        GovernorStatus {
            enabled: state.disable_count == 0,
            disable_count: state.disable_count,
            lcd_on: self.display_on.load(Ordering::Acquire),
            in_low_power_mode: state.in_low_power_mode,
            suspend_prepared: state.suspend_prepared,
            forced_hotplug: state.forced_hotplug,
            one_core_in_request: state.tunables.one_core_in_request,
            applied: state.applied,
            last_decided: state.last_decided,
            hysteresis: state.hysteresis,
            online_cpus: self.topology.online_cpus(),
            cluster1_hotplugged: self.executor.cluster1_hotplugged(),
            ticks: state.ticks,
            executions: state.executions,
            worker_running,
            watchdog_running,
            last_error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FreqPolicy;
    use crate::sim::SimPlatform;
    use crate::topology::TopologyModel;
    use std::sync::OnceLock;

    const MODEL: TopologyModel = TopologyModel::AsymmetricBigLittle {
        little: 4,
        big: 4,
        low_power_cores: 1,
    };

    fn runtime() -> Handle {
        static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
        RUNTIME
            .get_or_init(|| {
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                    .unwrap()
            })
            .handle()
            .clone()
    }

    fn governor() -> (Arc<SimPlatform>, Governor) {
        let platform = Arc::new(SimPlatform::new(
            &MODEL,
            FreqPolicy {
                min: 400_000,
                max: 1_300_000,
                cur: 400_000,
            },
        ));
        let topology = Arc::new(Topology::new(MODEL));
        let governor = Governor::new(
            platform.clone(),
            topology,
            GovernorOptions::default(),
            runtime(),
        );
        (platform, governor)
    }

    #[test]
    fn test_tick_executes_only_on_transition() {
        let (_platform, governor) = governor();

        // Normal -> cluster0_in on the first light tick
        assert_eq!(governor.tick().unwrap(), Some(HotplugCommand::Cluster0In));
        assert_eq!(governor.status().executions, 1);

        // Display on: the light load never reaches low power
        for _ in 0..10 {
            assert_eq!(governor.tick().unwrap(), None);
        }
        let status = governor.status();
        assert_eq!(status.executions, 1);
        assert_eq!(status.ticks, 11);
        assert_eq!(status.applied, HotplugCommand::Cluster0In);
    }

    #[test]
    fn test_disabled_governor_does_not_tick() {
        let (platform, governor) = governor();
        governor.disable();
        assert!(!governor.is_enabled());
        assert_eq!(governor.tick().unwrap(), None);
        assert_eq!(governor.status().ticks, 0);

        // Extra enable is a warned no-op
        governor.enable();
        governor.enable();
        assert!(governor.is_enabled());
        assert_eq!(governor.status().disable_count, 0);
        assert_eq!(platform.down_calls(), 0);
    }

    #[test]
    fn test_failed_transition_keeps_applied() {
        let (platform, governor) = governor();
        governor.set_forced_hotplug(true);
        governor.store_knob(Knob::StayThreshold, "0").unwrap();
        platform.fail_down(7);

        // Forced hotplug with a zero threshold goes straight for low power
        assert!(governor.tick().is_err());
        let status = governor.status();
        assert_eq!(status.applied, HotplugCommand::Normal);
        assert_eq!(status.executions, 1);
        assert!(status.last_error.is_some());
        assert_eq!(platform.online_cpus().len(), 8);

        platform.clear_failures();
        assert_eq!(governor.tick().unwrap(), Some(HotplugCommand::LowPower));
        assert_eq!(platform.online_cpus(), vec![0]);
        assert!(governor.status().in_low_power_mode);
    }

    #[test]
    fn test_store_knob_validation() {
        let (_platform, governor) = governor();
        let before = governor.tunables();

        assert!(governor.store_knob(Knob::NrRunning, "1 1").is_err());
        assert!(governor.store_knob(Knob::StayThreshold, "-3").is_err());
        assert!(governor.store_knob(Knob::Delays, "100").is_err());
        assert!(governor.store_knob(Knob::RunQueueSignal, "sometimes").is_err());
        assert_eq!(governor.tunables(), before);

        governor.store_knob(Knob::NrRunning, "3 4").unwrap();
        governor.store_knob(Knob::Delays, "200 20").unwrap();
        governor.store_knob(Knob::RunQueueSignal, "averaged").unwrap();
        let after = governor.tunables();
        assert_eq!((after.nr_running_threshold, after.nr_running_range), (3, 4));
        assert_eq!((after.out_delay_ms, after.in_delay_ms), (200, 20));
        assert_eq!(after.run_queue_signal, RunQueueSignal::Averaged);
    }

    #[test]
    fn test_knob_names() {
        for knob in Knob::ALL {
            assert_eq!(knob.name().parse::<Knob>().unwrap(), knob);
        }
        assert!("bogus".parse::<Knob>().is_err());
    }

    #[test]
    fn test_enable_knob_toggles_refcount() {
        let (_platform, governor) = governor();
        governor.store_knob(Knob::Enable, "0").unwrap();
        governor.store_knob(Knob::Enable, "0").unwrap();
        assert_eq!(governor.status().disable_count, 2);
        governor.store_knob(Knob::Enable, "1").unwrap();
        assert!(!governor.is_enabled());
        governor.store_knob(Knob::Enable, "1").unwrap();
        assert!(governor.is_enabled());
    }

    #[test]
    fn test_disable_restores_cores() {
        let (platform, governor) = governor();
        governor.set_forced_hotplug(true);
        governor.store_knob(Knob::StayThreshold, "0").unwrap();
        governor.tick().unwrap();
        governor.tick().unwrap();
        assert_eq!(platform.online_cpus(), vec![0]);

        governor.disable();
        assert_eq!(platform.online_cpus().len(), 8);
        assert_eq!(governor.status().applied, HotplugCommand::Normal);
    }

    #[test]
    fn test_suspend_and_resume() {
        let (platform, governor) = governor();
        let notifier = Arc::new(NotifierChain::new());
        let governor = governor.start(Arc::clone(&notifier)).unwrap();
        assert!(governor.status().worker_running);

        notifier.notify(PowerEvent::SuspendPrepare);
        let status = governor.status();
        assert!(status.suspend_prepared);
        assert_eq!(status.disable_count, 1);
        assert!(!status.worker_running);
        assert_eq!(platform.online_cpus(), vec![0]);

        notifier.notify(PowerEvent::PostResume);
        let status = governor.status();
        assert!(!status.suspend_prepared);
        assert_eq!(status.disable_count, 0);
        assert!(status.worker_running);

        governor.shutdown();
        assert!(notifier.is_empty());
        assert!(!governor.status().worker_running);
    }

    #[test]
    fn test_start_rejects_current_thread_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let platform = Arc::new(SimPlatform::new(
            &MODEL,
            FreqPolicy {
                min: 400_000,
                max: 1_300_000,
                cur: 400_000,
            },
        ));
        let governor = Governor::new(
            platform,
            Arc::new(Topology::new(MODEL)),
            GovernorOptions::default(),
            runtime.handle().clone(),
        );
        let notifier = Arc::new(NotifierChain::new());
        let err = governor.start(Arc::clone(&notifier)).err().unwrap();
        assert!(matches!(err, GovernorError::UnsupportedRuntime));
        assert!(notifier.is_empty());
    }
}
