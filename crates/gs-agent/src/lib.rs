//! The machine agent: the process that owns every runtime instance
//! scheduled onto one machine.
//!
//! It exposes an HTTP API the meta controller drives (`run`, `stop`,
//! `change_out`, `ping`), materializes action binaries from the
//! [`gs_kvstore::ActionStore`] into sandboxed temp files, and supervises
//! each one as a [`gs_runtime::lifecycle::run`] task. A background loop
//! pings every owned runtime's control socket on an interval and declares
//! one dead (stopping it and dropping it from the table) after a
//! configurable run of consecutive failures.

pub mod config;
pub mod http;
pub mod state;
pub mod telemetry;

pub use config::AgentConfig;
pub use state::AgentState;
pub use telemetry::{RuntimeTelemetry, TelemetryStatus};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("runtime {0} is already running")]
    AlreadyRunning(String),
    #[error("runtime {0} is not running")]
    NotRunning(String),
    #[error("action store error: {0}")]
    Store(#[from] gs_kvstore::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] gs_runtime::RuntimeError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("the runtime never answered a ping within the dial budget")]
    DialTimedOut,
    #[error("malformed address: {0}")]
    BadAddress(String),
}
