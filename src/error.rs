//! Error kinds surfaced at component boundaries (see the error-handling
//! design table this crate implements). Lower-level failures (`EspError`,
//! `std::io::Error`) are wrapped with `anyhow::Context` at the call site and
//! only promoted to one of these kinds where the supervisor needs to branch
//! on it.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentError {
    /// HTTP failure, radio association timeout. Logged; never fatal.
    Transient,
    /// Hash mismatch, partition-write failure, or `apply` failure.
    CorruptedUpdate,
    /// No stored Wi-Fi credentials.
    ConfigMissing,
    /// Post-update health check probe 1 or 2 failed.
    PostUpdateRegression,
    /// Supervisor state variable held an unreachable value.
    UnknownState,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Transient => write!(f, "transient I/O failure"),
            AgentError::CorruptedUpdate => write!(f, "corrupted update"),
            AgentError::ConfigMissing => write!(f, "required configuration missing"),
            AgentError::PostUpdateRegression => write!(f, "post-update regression detected"),
            AgentError::UnknownState => write!(f, "supervisor reached an unknown state"),
        }
    }
}

impl std::error::Error for AgentError {}
