//! Vigil - CPU hotplug and idle governor for DaemonOS
//!
//! Provides:
//! - Load-driven hotplug of big.LITTLE or symmetric CPU clusters
//! - Display, suspend and reboot aware mode control
//! - Idle state gating (C1/C2/LPM) with idle profiling
//! - Unix socket control surface

pub mod config;
pub mod controller;
pub mod cpuidle;
pub mod decision;
pub mod error;
pub mod executor;
pub mod ipc;
pub mod notifier;
pub mod platform;
pub mod profiler;
pub mod sampler;
pub mod sim;
pub mod timer;
pub mod topology;

pub use controller::{Governor, GovernorOptions, GovernorStatus, Knob};
pub use cpuidle::{CpuidleGate, IdleState};
pub use decision::{HotplugCommand, Tunables};
pub use error::{GovernorError, Result};
pub use notifier::{NotifierChain, PowerEvent};
pub use platform::{IdleBackend, IdleStateControl, Platform, SysfsPlatform};
pub use profiler::{IdleProfiler, ProfileMode};
pub use sim::SimPlatform;
pub use topology::{Topology, TopologyModel};
