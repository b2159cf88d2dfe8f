//! Shared types, configuration loading, telemetry and error taxonomy used by every
//! subsystem of the control plane core.

pub mod config;
pub mod error;
pub mod ids;
pub mod retry;
pub mod telemetry;

pub use error::{CoreError, CoreResult};

/// Implemented by configuration types that may carry secrets, so logs and error
/// messages never print them verbatim.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
