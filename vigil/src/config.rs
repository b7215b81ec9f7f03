//! Configuration for the Vigil governor daemon

use crate::decision::Tunables;
use crate::platform::{RunQueueSignal, SysfsPlatform};
use crate::profiler::MAX_PERIOD_SECS;
use crate::timer::ArmMode;
use crate::topology::TopologyModel;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default config location
pub const DEFAULT_CONFIG_PATH: &str = "/grimoire/system/vigil.yaml";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Cluster layout
    #[serde(default)]
    pub topology: TopologyModel,

    /// Hotplug governor settings
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Idle state settings
    #[serde(default)]
    pub idle: IdleConfig,

    /// Idle profiler settings
    #[serde(default)]
    pub profiler: ProfilerConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Hotplug governor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Start with the governor enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allow low-power mode while the display is on
    #[serde(default)]
    pub forced_hotplug: bool,

    /// Poll timer mode
    #[serde(default)]
    pub scheduling: ArmMode,

    /// Poll interval (ms) of a deferrable timer while nothing changes
    #[serde(default = "default_down_sample_ms")]
    pub down_sample_ms: u64,

    /// Period (ms) of the display-off watchdog
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_interval_ms: u64,

    /// Light-load frequency ceiling (kHz)
    #[serde(default = "default_normal_min_freq")]
    pub normal_min_freq: u32,

    /// Busy big-cluster frequency (kHz), 0 disables the check
    #[serde(default = "default_cluster1_busy_freq")]
    pub cluster1_busy_freq: u32,

    /// Light-load ticks before low-power mode
    #[serde(default = "default_stay_threshold")]
    pub stay_threshold: u32,

    /// Poll interval outside low-power mode (ms)
    #[serde(default = "default_out_delay_ms")]
    pub out_delay_ms: u64,

    /// Poll interval in low-power mode (ms)
    #[serde(default = "default_in_delay_ms")]
    pub in_delay_ms: u64,

    /// Run-queue length counted as pressure
    #[serde(default = "default_nr_running_threshold")]
    pub nr_running_threshold: u32,

    /// Upper bound of the run-queue pressure counter
    #[serde(default = "default_nr_running_range")]
    pub nr_running_range: u32,

    /// Which run-queue length the pressure counter watches
    #[serde(default)]
    pub run_queue_signal: RunQueueSignal,

    /// Minimum per-CPU load (%) for a CPU's frequency to count
    #[serde(default)]
    pub load_report_threshold: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            forced_hotplug: false,
            scheduling: ArmMode::default(),
            down_sample_ms: default_down_sample_ms(),
            watchdog_interval_ms: default_watchdog_ms(),
            normal_min_freq: default_normal_min_freq(),
            cluster1_busy_freq: default_cluster1_busy_freq(),
            stay_threshold: default_stay_threshold(),
            out_delay_ms: default_out_delay_ms(),
            in_delay_ms: default_in_delay_ms(),
            nr_running_threshold: default_nr_running_threshold(),
            nr_running_range: default_nr_running_range(),
            run_queue_signal: RunQueueSignal::default(),
            load_report_threshold: 0,
        }
    }
}

impl GovernorConfig {
    /// Initial runtime tunables
    pub fn tunables(&self) -> Tunables {
        Tunables {
            normal_min_freq: self.normal_min_freq,
            cluster1_busy_freq: self.cluster1_busy_freq,
            stay_threshold: self.stay_threshold,
            out_delay_ms: self.out_delay_ms,
            in_delay_ms: self.in_delay_ms,
            nr_running_threshold: self.nr_running_threshold,
            nr_running_range: self.nr_running_range,
            run_queue_signal: self.run_queue_signal,
            load_report_threshold: self.load_report_threshold,
            one_core_in_request: false,
        }
    }
}

/// Idle state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Platform implements core power gating
    #[serde(default = "default_true")]
    pub c2_supported: bool,

    /// Platform implements system low-power mode
    #[serde(default = "default_true")]
    pub lpm_supported: bool,

    /// Mirror LPM legality into the cpuidle sysfs switches
    #[serde(default = "default_true")]
    pub apply_limits: bool,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            c2_supported: true,
            lpm_supported: true,
            apply_limits: true,
        }
    }
}

/// Idle profiler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Session length (seconds) when a start request names none
    #[serde(default = "default_profile_period")]
    pub default_period_secs: u32,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            default_period_secs: default_profile_period(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// sysfs CPU directory
    #[serde(default = "default_cpu_root")]
    pub cpu_root: String,

    /// Directory holding one file per PM-QoS frequency floor
    #[serde(default = "default_qos_dir")]
    pub qos_dir: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            cpu_root: default_cpu_root(),
            qos_dir: default_qos_dir(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_down_sample_ms() -> u64 {
    1000
}

fn default_watchdog_ms() -> u64 {
    1000
}

fn default_normal_min_freq() -> u32 {
    Tunables::default().normal_min_freq
}

fn default_cluster1_busy_freq() -> u32 {
    Tunables::default().cluster1_busy_freq
}

fn default_stay_threshold() -> u32 {
    Tunables::default().stay_threshold
}

fn default_out_delay_ms() -> u64 {
    Tunables::default().out_delay_ms
}

fn default_in_delay_ms() -> u64 {
    Tunables::default().in_delay_ms
}

fn default_nr_running_threshold() -> u32 {
    Tunables::default().nr_running_threshold
}

fn default_nr_running_range() -> u32 {
    Tunables::default().nr_running_range
}

fn default_profile_period() -> u32 {
    10
}

fn default_socket_path() -> String {
    "/run/vigil/vigil.sock".to_string()
}

fn default_cpu_root() -> String {
    SysfsPlatform::DEFAULT_CPU_ROOT.to_string()
}

fn default_qos_dir() -> String {
    "/run/vigil/qos".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl VigilConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Self = serde_yaml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply the same checks the control surface applies at runtime
    pub fn validate(&self) -> Result<()> {
        self.topology.validate()?;
        self.governor.tunables().validate()?;
        if self.profiler.default_period_secs > MAX_PERIOD_SECS {
            bail!(
                "profiler.default_period_secs must be at most {}, got {}",
                MAX_PERIOD_SECS,
                self.profiler.default_period_secs
            );
        }
        Ok(())
    }
}
