//! The runtime supervisor: owns one child operator process plus the
//! `gs-net` forwarder/receiver pair that gives it upstream-backup
//! delivery.
//!
//! [`sandbox`] isolates the child under a throwaway identity and firewall
//! chain; [`control`] is the local control socket the machine agent drives
//! (`Ping`, `ChangeOut`); [`lifecycle`] is the supervisor loop itself.

pub mod control;
pub mod lifecycle;
pub mod sandbox;

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use gs_lang::{Address, RuntimeName};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("net error: {0}")]
    Net(#[from] gs_net::NetError),
    #[error("sandbox error: {0}")]
    Sandbox(String),
    #[error("child process exited unexpectedly")]
    ChildExited,
    #[error("control protocol error: {0}")]
    ControlProtocol(String),
}

/// Everything the supervisor needs to run one operator instance, resolved
/// by the machine agent from a [`gs_lang::PlanNode`] before spawning.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub runtime_name: RuntimeName,
    pub binary_path: PathBuf,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub listen_addr: SocketAddr,
    /// Declared upstream names (the compiled plan's `in` set).
    pub inbound: HashSet<RuntimeName>,
    /// Declared downstream addresses (the compiled plan's `out` set), in
    /// plan order; index in this vec is the downstream_index `change_out`
    /// addresses by address, not index, so order only matters for the
    /// initial connect sequence.
    pub outbound: Vec<Address>,
    pub control_socket_path: PathBuf,
    pub sandbox_allowlist: Vec<String>,
    pub ack_period: Duration,
    pub kill_timeout: Duration,
    /// Where this runtime's child stderr is persisted, truncated on every
    /// start. `None` disables the file sink; stderr still reaches the
    /// process's own structured log either way.
    pub log_path: Option<PathBuf>,
}
