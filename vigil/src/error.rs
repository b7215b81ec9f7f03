//! Error types for governor operations

use crate::topology::CpuId;
use nix::errno::Errno;
use thiserror::Error;

/// Direction of a hotplug actuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuation {
    Up,
    Down,
}

impl std::fmt::Display for Actuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "cpu_up"),
            Self::Down => write!(f, "cpu_down"),
        }
    }
}

/// Governor error types
#[derive(Debug, Error)]
pub enum GovernorError {
    /// A cpu_up/cpu_down call failed; remaining steps of the command were skipped
    #[error("{op}({cpu}) failed: {errno}")]
    Actuation {
        cpu: CpuId,
        op: Actuation,
        errno: Errno,
    },

    /// Rejected tunable value
    #[error("Invalid tunable: {0}")]
    InvalidTunable(String),

    /// Invalid topology description
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// A profiling session is already running
    #[error("Profiling session already in progress")]
    ProfilerBusy,

    /// Profiling period outside the accepted range
    #[error("Invalid profiling period: {0}s (max {max}s)", max = crate::profiler::MAX_PERIOD_SECS)]
    InvalidProfilePeriod(u32),

    /// Unknown profiler report mode
    #[error("Invalid profiler mode: {0}")]
    InvalidProfileMode(u8),

    /// Governor tasks need a multi-threaded tokio runtime
    #[error("Hotplug governor requires a multi-threaded runtime")]
    UnsupportedRuntime,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for governor operations
pub type Result<T> = std::result::Result<T, GovernorError>;

impl GovernorError {
    /// Check if this error is retried on the next poll tick
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Actuation { .. })
    }

    /// Check if this error came from rejected user input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTunable(_)
                | Self::InvalidTopology(_)
                | Self::InvalidProfilePeriod(_)
                | Self::InvalidProfileMode(_)
        )
    }
}
