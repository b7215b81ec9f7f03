//! Hotplug decision engine
//!
//! Turns one load sample plus mode flags into a [`HotplugCommand`]. The only
//! state it touches is the [`HysteresisCounters`] handed to it.

use crate::error::{GovernorError, Result};
use crate::platform::RunQueueSignal;
use crate::sampler::{ClusterFreq, LoadSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Target CPU configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotplugCommand {
    /// Every core online (big cluster unless externally pinned out)
    Normal,
    /// Shrink to the minimum core count
    LowPower,
    Cluster1In,
    Cluster1Out,
    /// Every little core online
    Cluster0In,
    /// One more little core online
    Cluster0OneIn,
    /// One little core offline
    Cluster0OneOut,
}

impl fmt::Display for HotplugCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::LowPower => "low_power",
            Self::Cluster1In => "cluster1_in",
            Self::Cluster1Out => "cluster1_out",
            Self::Cluster0In => "cluster0_in",
            Self::Cluster0OneIn => "cluster0_one_in",
            Self::Cluster0OneOut => "cluster0_one_out",
        };
        f.write_str(name)
    }
}

/// Counters persisting across ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HysteresisCounters {
    /// Consecutive ticks at or below `normal_min_freq`, capped at threshold + 1
    pub low_stay: u32,
    /// Run-queue pressure, within `[0, nr_running_range]`
    pub nr_running_count: u32,
}

/// Runtime-tunable thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunables {
    /// Frequency (kHz) at or below which the system counts as lightly loaded
    pub normal_min_freq: u32,
    /// Big-cluster frequency (kHz) at or above which it counts as busy; 0 disables
    pub cluster1_busy_freq: u32,
    pub stay_threshold: u32,
    /// Poll interval outside low-power mode (ms)
    pub out_delay_ms: u64,
    /// Poll interval in low-power mode (ms)
    pub in_delay_ms: u64,
    pub nr_running_threshold: u32,
    pub nr_running_range: u32,
    pub run_queue_signal: RunQueueSignal,
    pub load_report_threshold: u32,
    /// Explicit request to keep pulling little cores in
    pub one_core_in_request: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            normal_min_freq: 1_000_000,
            cluster1_busy_freq: 1_200_000,
            stay_threshold: 5,
            out_delay_ms: 100,
            in_delay_ms: 40,
            nr_running_threshold: 2,
            nr_running_range: 2,
            run_queue_signal: RunQueueSignal::Instantaneous,
            load_report_threshold: 0,
            one_core_in_request: false,
        }
    }
}

fn non_negative(name: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        GovernorError::InvalidTunable(format!("{} must be a non-negative integer, got {}", name, value))
    })
}

fn parse_ints<const N: usize>(name: &str, input: &str) -> Result<[i64; N]> {
    let values: Vec<i64> = input
        .split_whitespace()
        .map(|s| s.parse::<i64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| GovernorError::InvalidTunable(format!("{}: {}", name, e)))?;
    values.try_into().map_err(|v: Vec<i64>| {
        GovernorError::InvalidTunable(format!("{} expects {} values, got {}", name, N, v.len()))
    })
}

impl Tunables {
    /// Check every field against the same rules as the setters
    pub fn validate(&self) -> Result<()> {
        Self::check_nr_running(self.nr_running_threshold as i64, self.nr_running_range as i64)?;
        if self.load_report_threshold > 100 {
            return Err(GovernorError::InvalidTunable(format!(
                "load_report_threshold must be within 0..=100, got {}",
                self.load_report_threshold
            )));
        }
        Ok(())
    }

    fn check_nr_running(threshold: i64, range: i64) -> Result<()> {
        if threshold <= 1 {
            return Err(GovernorError::InvalidTunable(format!(
                "nr_running threshold must be greater than 1, got {}",
                threshold
            )));
        }
        if range < 1 {
            return Err(GovernorError::InvalidTunable(format!(
                "nr_running range must be at least 1, got {}",
                range
            )));
        }
        Ok(())
    }

    pub fn set_stay_threshold(&mut self, value: i64) -> Result<()> {
        self.stay_threshold = non_negative("stay_threshold", value)?;
        Ok(())
    }

    pub fn set_delays(&mut self, out_delay_ms: i64, in_delay_ms: i64) -> Result<()> {
        let out = non_negative("out_delay", out_delay_ms)?;
        let inn = non_negative("in_delay", in_delay_ms)?;
        self.out_delay_ms = out as u64;
        self.in_delay_ms = inn as u64;
        Ok(())
    }

    pub fn set_nr_running(&mut self, threshold: i64, range: i64) -> Result<()> {
        Self::check_nr_running(threshold, range)?;
        let threshold = non_negative("nr_running threshold", threshold)?;
        let range = non_negative("nr_running range", range)?;
        self.nr_running_threshold = threshold;
        self.nr_running_range = range;
        Ok(())
    }

    /// `"<threshold>"`
    pub fn store_stay_threshold(&mut self, input: &str) -> Result<()> {
        let [value] = parse_ints::<1>("stay_threshold", input)?;
        self.set_stay_threshold(value)
    }

    /// `"<out_delay_ms> <in_delay_ms>"`
    pub fn store_delays(&mut self, input: &str) -> Result<()> {
        let [out, inn] = parse_ints::<2>("delay", input)?;
        self.set_delays(out, inn)
    }

    /// `"<threshold> <range>"`
    pub fn store_nr_running(&mut self, input: &str) -> Result<()> {
        let [threshold, range] = parse_ints::<2>("nr_running", input)?;
        self.set_nr_running(threshold, range)
    }

    /// Poll interval for the current mode
    pub fn poll_delay_ms(&self, in_low_power_mode: bool) -> u64 {
        if in_low_power_mode {
            self.in_delay_ms
        } else {
            self.out_delay_ms
        }
    }
}

/// Parse a sysfs-style boolean (`0` = false, any other integer = true)
pub fn parse_switch(name: &str, input: &str) -> Result<bool> {
    let [value] = parse_ints::<1>(name, input)?;
    Ok(non_negative(name, value)? != 0)
}

/// Everything one decision looks at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionInput {
    pub load_freq: u32,
    pub cluster0_max_freq: u32,
    pub cluster1: Option<ClusterFreq>,
    pub cluster1_qos_min: u32,
    pub nr_running: u32,
    pub has_big_cluster: bool,
    pub little_secondary_offline: bool,
    pub lcd_on: bool,
    pub forced_hotplug: bool,
    pub in_low_power_mode: bool,
}

impl DecisionInput {
    /// Fill the load half from a snapshot; mode and topology fields stay default
    pub fn from_snapshot(snapshot: &LoadSnapshot) -> Self {
        Self {
            load_freq: snapshot.load_freq,
            cluster0_max_freq: snapshot.cluster0_max_freq,
            cluster1: snapshot.cluster1,
            cluster1_qos_min: snapshot.cluster1_qos_min,
            nr_running: snapshot.nr_running,
            ..Default::default()
        }
    }
}

/// Derive the target command for this tick
pub fn decide(
    input: &DecisionInput,
    tunables: &Tunables,
    hysteresis: &mut HysteresisCounters,
) -> HotplugCommand {
    let normal_min = tunables.normal_min_freq;

    let mut cmd = if input.has_big_cluster {
        HotplugCommand::Cluster0In
    } else {
        HotplugCommand::Normal
    };

    // Little cluster saturated: prefer the big cluster
    let saturated = input.cluster0_max_freq > 0 && input.load_freq >= input.cluster0_max_freq;
    if saturated {
        cmd = HotplugCommand::Normal;
    }

    let big_busy = tunables.cluster1_busy_freq > 0
        && input
            .cluster1
            .is_some_and(|c| c.cur >= tunables.cluster1_busy_freq);
    // A QoS floor on the big cluster counts as load even when frequency is low
    let qos_pinned = input.cluster1_qos_min > input.cluster1.map(|c| c.min).unwrap_or(0);

    if input.load_freq > normal_min || big_busy || qos_pinned {
        if input.in_low_power_mode && !saturated {
            cmd = HotplugCommand::Cluster0In;
        }
        hysteresis.low_stay = 0;
    } else if input.load_freq <= normal_min && hysteresis.low_stay <= tunables.stay_threshold {
        hysteresis.low_stay += 1;
    }

    if hysteresis.low_stay > tunables.stay_threshold && (!input.lcd_on || input.forced_hotplug) {
        cmd = HotplugCommand::LowPower;
    }

    let range = tunables.nr_running_range;
    hysteresis.nr_running_count = if input.nr_running >= tunables.nr_running_threshold {
        (hysteresis.nr_running_count + 1).min(range)
    } else {
        hysteresis.nr_running_count.saturating_sub(1).min(range)
    };

    // Queued work on the little cluster beats the aggregate frequency heuristic
    if (hysteresis.nr_running_count > 0 || tunables.one_core_in_request)
        && input.little_secondary_offline
        && input.load_freq <= normal_min
    {
        cmd = HotplugCommand::Cluster0OneIn;
    }

    cmd
}
