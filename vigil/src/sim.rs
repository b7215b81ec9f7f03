//! In-memory platform for dry runs and tests
//!
//! `SimPlatform` keeps its own online map, time counters, cpufreq policies and
//! QoS floors, and can be told to fail specific hotplug calls. `vigild
//! --simulate` drives the governor against it.

use crate::cpuidle::IdleState;
use crate::platform::{
    CpuTimes, FreqPolicy, IdleBackend, IdleStateControl, Platform, QosClass, RunQueueSignal,
};
use crate::topology::{CpuId, TopologyModel, BOOT_CPU};
use nix::errno::Errno;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct SimState {
    online: Vec<bool>,
    times: Vec<CpuTimes>,
    policies: Vec<Option<FreqPolicy>>,
    qos: HashMap<QosClass, u32>,
    nr_running: u32,
    load_average: u32,
    fail_up: HashSet<CpuId>,
    fail_down: HashSet<CpuId>,
    up_calls: usize,
    down_calls: usize,
    idle: IdleCounters,
    disabled_states: HashSet<(CpuId, IdleState)>,
}

/// Observed cpuidle backend activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdleCounters {
    pub prepares: usize,
    pub commits: usize,
    pub cleanups: usize,
    pub tlb_flushes: usize,
    pub fail_commit: bool,
    pub early_wakeup: bool,
}

/// Simulated SoC
pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl SimPlatform {
    /// All CPUs online with the given policy on every CPU
    pub fn new(model: &TopologyModel, policy: FreqPolicy) -> Self {
        let n = model.nr_cpus();
        Self {
            state: Mutex::new(SimState {
                online: vec![true; n],
                times: vec![CpuTimes::default(); n],
                policies: vec![Some(policy); n],
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_policy(&self, cpu: CpuId, policy: Option<FreqPolicy>) {
        if let Some(slot) = self.lock().policies.get_mut(cpu) {
            *slot = policy;
        }
    }

    /// Set the current frequency of every CPU in `cpus`
    pub fn set_cur_freq(&self, cpus: impl IntoIterator<Item = CpuId>, cur: u32) {
        let mut state = self.lock();
        for cpu in cpus {
            if let Some(Some(policy)) = state.policies.get_mut(cpu) {
                policy.cur = cur;
            }
        }
    }

    /// Advance a CPU's counters by `wall` ticks, `idle` of them idle
    pub fn advance(&self, cpu: CpuId, wall: u64, idle: u64) {
        if let Some(t) = self.lock().times.get_mut(cpu) {
            t.wall += wall;
            t.idle += idle;
        }
    }

    pub fn set_qos(&self, class: QosClass, value: u32) {
        self.lock().qos.insert(class, value);
    }

    pub fn set_nr_running(&self, running: u32) {
        self.lock().nr_running = running;
    }

    pub fn set_load_average(&self, load: u32) {
        self.lock().load_average = load;
    }

    /// Make every future cpu_up of `cpu` fail
    pub fn fail_up(&self, cpu: CpuId) {
        self.lock().fail_up.insert(cpu);
    }

    /// Make every future cpu_down of `cpu` fail
    pub fn fail_down(&self, cpu: CpuId) {
        self.lock().fail_down.insert(cpu);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_up.clear();
        state.fail_down.clear();
    }

    /// Force a CPU state behind the governor's back
    pub fn force_online(&self, cpu: CpuId, online: bool) {
        if let Some(slot) = self.lock().online.get_mut(cpu) {
            *slot = online;
        }
    }

    pub fn online_cpus(&self) -> Vec<CpuId> {
        let state = self.lock();
        (0..state.online.len()).filter(|&c| state.online[c]).collect()
    }

    /// Successful and failed cpu_up calls that changed or tried to change state
    pub fn up_calls(&self) -> usize {
        self.lock().up_calls
    }

    pub fn down_calls(&self) -> usize {
        self.lock().down_calls
    }

    pub fn idle_counters(&self) -> IdleCounters {
        self.lock().idle.clone()
    }

    pub fn set_idle_behavior(&self, fail_commit: bool, early_wakeup: bool) {
        let mut state = self.lock();
        state.idle.fail_commit = fail_commit;
        state.idle.early_wakeup = early_wakeup;
    }

    pub fn is_state_disabled(&self, cpu: CpuId, idle: IdleState) -> bool {
        self.lock().disabled_states.contains(&(cpu, idle))
    }
}

impl Platform for SimPlatform {
    fn cpu_online(&self, cpu: CpuId) -> bool {
        self.lock().online.get(cpu).copied().unwrap_or(false)
    }

    fn cpu_up(&self, cpu: CpuId) -> Result<(), Errno> {
        let mut state = self.lock();
        if cpu >= state.online.len() {
            return Err(Errno::ENODEV);
        }
        state.up_calls += 1;
        if state.fail_up.contains(&cpu) {
            return Err(Errno::EIO);
        }
        state.online[cpu] = true;
        Ok(())
    }

    fn cpu_down(&self, cpu: CpuId) -> Result<(), Errno> {
        let mut state = self.lock();
        if cpu >= state.online.len() {
            return Err(Errno::ENODEV);
        }
        if cpu == BOOT_CPU {
            return Err(Errno::EPERM);
        }
        state.down_calls += 1;
        if state.fail_down.contains(&cpu) {
            return Err(Errno::EBUSY);
        }
        state.online[cpu] = false;
        Ok(())
    }

    fn cpu_times(&self) -> Vec<(CpuId, CpuTimes)> {
        let state = self.lock();
        state
            .times
            .iter()
            .enumerate()
            .filter(|(cpu, _)| state.online[*cpu])
            .map(|(cpu, t)| (cpu, *t))
            .collect()
    }

    fn cpufreq_policy(&self, cpu: CpuId) -> Option<FreqPolicy> {
        let state = self.lock();
        if !state.online.get(cpu).copied().unwrap_or(false) {
            return None;
        }
        state.policies.get(cpu).copied().flatten()
    }

    fn pm_qos_request(&self, class: QosClass) -> u32 {
        self.lock().qos.get(&class).copied().unwrap_or(0)
    }

    fn nr_running(&self, signal: RunQueueSignal) -> u32 {
        let state = self.lock();
        match signal {
            RunQueueSignal::Instantaneous => state.nr_running,
            RunQueueSignal::Averaged => state.load_average,
        }
    }
}

impl IdleBackend for SimPlatform {
    fn prepare(&self, _cpu: CpuId, _state: IdleState) {
        self.lock().idle.prepares += 1;
    }

    fn commit(&self, _cpu: CpuId, _state: IdleState) -> Result<(), Errno> {
        let mut state = self.lock();
        state.idle.commits += 1;
        if state.idle.fail_commit {
            return Err(Errno::EAGAIN);
        }
        Ok(())
    }

    fn cleanup(&self, _cpu: CpuId, _state: IdleState) -> bool {
        let mut state = self.lock();
        state.idle.cleanups += 1;
        state.idle.early_wakeup
    }

    fn flush_tlb(&self, _cpu: CpuId) {
        self.lock().idle.tlb_flushes += 1;
    }
}

impl IdleStateControl for SimPlatform {
    fn set_state_disabled(
        &self,
        cpu: CpuId,
        idle: IdleState,
        disabled: bool,
    ) -> Result<(), Errno> {
        let mut state = self.lock();
        if disabled {
            state.disabled_states.insert((cpu, idle));
        } else {
            state.disabled_states.remove(&(cpu, idle));
        }
        Ok(())
    }
}
