//! TOML-loaded agent configuration, mirroring how `gs-runtime`'s caller
//! resolves per-runtime settings but at the whole-agent scope.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:7800".parse().unwrap()
}
fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/gs-agent/bin")
}
fn default_control_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/gs-agent/control")
}
fn default_ping_period_ms() -> u64 {
    2_000
}
fn default_ping_failure_threshold() -> u32 {
    3
}
fn default_ack_period_ms() -> u64 {
    1_000
}
fn default_kill_timeout_ms() -> u64 {
    5_000
}
fn default_control_dial_max_attempts() -> u32 {
    20
}
fn default_control_dial_retry_ms() -> u64 {
    100
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/gs-agent/logs")
}
fn default_sandbox_allowlist() -> Vec<String> {
    vec!["127.0.0.1".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_control_socket_dir")]
    pub control_socket_dir: PathBuf,
    #[serde(default = "default_ping_period_ms")]
    pub ping_period_ms: u64,
    #[serde(default = "default_ping_failure_threshold")]
    pub ping_failure_threshold: u32,
    #[serde(default = "default_ack_period_ms")]
    pub ack_period_ms: u64,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    /// Destinations the sandboxed child's firewall chain permits outbound
    /// traffic to. Defaults to loopback only — enough for the runtime's own
    /// forwarder/receiver/control-socket traffic and nothing else.
    #[serde(default = "default_sandbox_allowlist")]
    pub sandbox_allowlist: Vec<String>,
    #[serde(default = "default_control_dial_max_attempts")]
    pub control_dial_max_attempts: u32,
    #[serde(default = "default_control_dial_retry_ms")]
    pub control_dial_retry_ms: u64,
    /// Directory each supervised runtime's persisted stderr log file is
    /// written under, named by runtime name and truncated on every start.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Use the real `useradd`/`nft` sandbox. Off by default so tests and
    /// non-Linux development machines get [`gs_runtime::sandbox::NullSandbox`].
    #[serde(default)]
    pub use_linux_sandbox: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        toml::from_str("").expect("every field has a default")
    }
}

impl AgentConfig {
    pub fn ping_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_period_ms)
    }
    pub fn ack_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ack_period_ms)
    }
    pub fn kill_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.kill_timeout_ms)
    }
    pub fn control_dial_retry(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.control_dial_retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let config = AgentConfig::default();
        assert_eq!(config.ping_failure_threshold, 3);
    }

    #[test]
    fn partial_toml_fills_remaining_defaults() {
        let config: AgentConfig = toml::from_str("ping_failure_threshold = 5\n").unwrap();
        assert_eq!(config.ping_failure_threshold, 5);
        assert_eq!(config.ack_period_ms, 1_000);
    }

    #[test]
    fn sandbox_allowlist_defaults_to_loopback_only() {
        let config = AgentConfig::default();
        assert_eq!(config.sandbox_allowlist, vec!["127.0.0.1".to_string()]);
    }
}
