//! The agent's in-memory table of runtimes it owns, and the operations
//! the HTTP API exposes over it: `run`, `stop`, `change_out`, and the
//! periodic ping loop that feeds `GET /v1/ping`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use gs_kvstore::ActionStore;
use gs_lang::{Address, RuntimeName};
use gs_runtime::sandbox::Sandbox;
use gs_runtime::RuntimeConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::telemetry::{RuntimeTelemetry, TelemetryStatus};
use crate::AgentError;

/// The body of `POST /v1/run`: everything the agent needs to materialize
/// and spawn one runtime, resolved by the meta controller from a compiled
/// [`gs_lang::Plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub scheme: String,
    pub node: String,
    pub action: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub listen_addr: SocketAddr,
    #[serde(default)]
    pub inbound: Vec<String>,
    #[serde(default)]
    pub outbound: Vec<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub runtime_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeOutRequest {
    pub runtime_name: String,
    pub old_addr: Address,
    pub new_addr: Address,
}

struct RunEntry {
    scheme: String,
    node: String,
    action: String,
    control_socket_path: PathBuf,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), gs_runtime::RuntimeError>>,
    consecutive_failures: u32,
    status: TelemetryStatus,
    oldest_output: u32,
}

pub struct AgentState {
    config: AgentConfig,
    action_store: Arc<dyn ActionStore>,
    sandbox: Arc<dyn Sandbox>,
    runtimes: Mutex<HashMap<RuntimeName, RunEntry>>,
}

impl AgentState {
    pub fn new(config: AgentConfig, action_store: Arc<dyn ActionStore>) -> Arc<Self> {
        let sandbox: Arc<dyn Sandbox> = if config.use_linux_sandbox {
            Arc::new(gs_runtime::sandbox::LinuxSandbox)
        } else {
            Arc::new(gs_runtime::sandbox::NullSandbox)
        };
        Arc::new(Self { config, action_store, sandbox, runtimes: Mutex::new(HashMap::new()) })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Materializes the action binary, spawns the runtime under the
    /// agent's sandbox, and blocks until its control socket answers a
    /// `Ping` (or the dial budget is exhausted, in which case the
    /// half-started runtime is torn down and the error propagated).
    pub async fn run(self: &Arc<Self>, req: RunRequest) -> Result<(), AgentError> {
        let runtime_name = RuntimeName::new(&req.scheme, &req.node);
        {
            let runtimes = self.runtimes.lock().await;
            if runtimes.contains_key(&runtime_name) {
                return Err(AgentError::AlreadyRunning(runtime_name.to_string()));
            }
        }

        let binary_path = self.materialize_action(&runtime_name, &req.action).await?;
        let control_socket_path = self.config.control_socket_dir.join(format!("{runtime_name}.sock"));

        let runtime_config = RuntimeConfig {
            runtime_name: runtime_name.clone(),
            binary_path: binary_path.clone(),
            argv: req.argv,
            env: req.env,
            listen_addr: req.listen_addr,
            inbound: req.inbound.iter().map(|n| RuntimeName(n.clone())).collect::<HashSet<_>>(),
            outbound: req.outbound,
            control_socket_path: control_socket_path.clone(),
            sandbox_allowlist: self.config.sandbox_allowlist.clone(),
            ack_period: self.config.ack_period(),
            kill_timeout: self.config.kill_timeout(),
            log_path: Some(self.config.log_dir.join(format!("{runtime_name}.log"))),
        };

        let cancel = CancellationToken::new();
        let sandbox = Arc::clone(&self.sandbox);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { gs_runtime::lifecycle::run(runtime_config, sandbox, task_cancel).await });

        if let Err(err) = self.wait_for_control_socket(&control_socket_path).await {
            cancel.cancel();
            let _ = task.await;
            return Err(err);
        }

        let entry = RunEntry {
            scheme: req.scheme,
            node: req.node,
            action: req.action,
            control_socket_path,
            cancel,
            task,
            consecutive_failures: 0,
            status: TelemetryStatus::Ok,
            oldest_output: 0,
        };
        self.runtimes.lock().await.insert(runtime_name.clone(), entry);
        info!(runtime = %runtime_name, "agent: runtime started");
        Ok(())
    }

    pub async fn stop(&self, runtime_name: &str) -> Result<(), AgentError> {
        let entry = self.runtimes.lock().await.remove(&RuntimeName(runtime_name.to_string()));
        let entry = entry.ok_or_else(|| AgentError::NotRunning(runtime_name.to_string()))?;
        entry.cancel.cancel();
        let result = entry.task.await;
        let _ = tokio::fs::remove_file(&entry.control_socket_path).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(runtime = runtime_name, %err, "agent: runtime exited with error on stop"),
            Err(join_err) => warn!(runtime = runtime_name, %join_err, "agent: runtime task panicked on stop"),
        }
        info!(runtime = runtime_name, "agent: runtime stopped");
        Ok(())
    }

    pub async fn change_out(&self, req: &ChangeOutRequest) -> Result<(), AgentError> {
        let path = {
            let runtimes = self.runtimes.lock().await;
            let entry = runtimes
                .get(&RuntimeName(req.runtime_name.clone()))
                .ok_or_else(|| AgentError::NotRunning(req.runtime_name.clone()))?;
            entry.control_socket_path.clone()
        };
        let ok = gs_runtime::control::request_change_out(&path, &req.old_addr, &req.new_addr).await?;
        if ok {
            Ok(())
        } else {
            Err(AgentError::BadAddress(format!("runtime {} rejected change_out", req.runtime_name)))
        }
    }

    pub async fn telemetry_snapshot(&self) -> Vec<RuntimeTelemetry> {
        self.runtimes
            .lock()
            .await
            .values()
            .map(|e| RuntimeTelemetry {
                scheme: e.scheme.clone(),
                node: e.node.clone(),
                action: e.action.clone(),
                status: e.status,
                oldest_output: e.oldest_output,
            })
            .collect()
    }

    async fn materialize_action(&self, runtime_name: &RuntimeName, action: &str) -> Result<PathBuf, AgentError> {
        let compressed = self.action_store.get(action).await?;
        let bytes = zstd::stream::decode_all(std::io::Cursor::new(compressed)).map_err(AgentError::Io)?;
        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        let path = self.config.temp_dir.join(runtime_name.to_string());
        tokio::fs::write(&path, &bytes).await?;
        let mut perms = tokio::fs::metadata(&path).await?.permissions();
        perms.set_mode(0o700);
        tokio::fs::set_permissions(&path, perms).await?;
        Ok(path)
    }

    async fn wait_for_control_socket(&self, path: &PathBuf) -> Result<(), AgentError> {
        for _ in 0..self.config.control_dial_max_attempts {
            if gs_runtime::control::ping(path).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(self.config.control_dial_retry()).await;
        }
        Err(AgentError::DialTimedOut)
    }

    /// Pings every owned runtime once. A runtime whose consecutive
    /// failure count reaches the configured threshold is declared dead:
    /// removed from the table and stopped (best-effort — it may already
    /// be gone).
    pub async fn ping_tick(self: &Arc<Self>) {
        let names: Vec<RuntimeName> = self.runtimes.lock().await.keys().cloned().collect();
        for name in names {
            let path = {
                let runtimes = self.runtimes.lock().await;
                match runtimes.get(&name) {
                    Some(e) => e.control_socket_path.clone(),
                    None => continue,
                }
            };
            match gs_runtime::control::ping(&path).await {
                Ok(Some(oldest)) => {
                    let mut runtimes = self.runtimes.lock().await;
                    if let Some(entry) = runtimes.get_mut(&name) {
                        entry.consecutive_failures = 0;
                        entry.status = TelemetryStatus::Ok;
                        entry.oldest_output = oldest;
                    }
                }
                Ok(None) | Err(_) => {
                    let declared_dead = {
                        let mut runtimes = self.runtimes.lock().await;
                        if let Some(entry) = runtimes.get_mut(&name) {
                            entry.consecutive_failures += 1;
                            if entry.consecutive_failures >= self.config.ping_failure_threshold {
                                true
                            } else {
                                entry.status = TelemetryStatus::Pending;
                                false
                            }
                        } else {
                            false
                        }
                    };
                    if declared_dead {
                        warn!(runtime = %name, "agent: runtime declared dead after consecutive ping failures");
                        if let Err(err) = self.stop(&name.to_string()).await {
                            warn!(runtime = %name, %err, "agent: stop of dead runtime failed");
                        }
                    }
                }
            }
        }
    }
}

/// Runs [`AgentState::ping_tick`] on `config.ping_period()` until `cancel`
/// fires.
pub async fn ping_loop(state: Arc<AgentState>, cancel: CancellationToken) {
    let period = state.config().ping_period();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(period) => state.ping_tick().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gs_kvstore::MemActionStore;

    fn test_config(dir: &std::path::Path) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.temp_dir = dir.join("bin");
        config.control_socket_dir = dir.join("control");
        config.log_dir = dir.join("logs");
        config.control_dial_max_attempts = 50;
        config.control_dial_retry_ms = 20;
        config
    }

    // `/bin/cat` rather than `/bin/true`: a source runtime never writes to
    // its child's stdin, so a binary that exits immediately would race the
    // control-socket dial loop against the runtime's own teardown. `cat`
    // blocks reading stdin forever, keeping the runtime up until `stop`.
    async fn put_compressed_long_running_binary(store: &MemActionStore, name: &str) {
        let bytes = std::fs::read("/bin/cat").unwrap();
        let compressed = zstd::stream::encode_all(std::io::Cursor::new(bytes), 0).unwrap();
        store.put(name, compressed).await.unwrap();
    }

    #[tokio::test]
    async fn run_then_stop_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemActionStore::new());
        put_compressed_long_running_binary(&store, "noop").await;
        let state = AgentState::new(test_config(dir.path()), store);

        let req = RunRequest {
            scheme: "s".into(),
            node: "a".into(),
            action: "noop".into(),
            argv: vec![],
            env: BTreeMap::new(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            inbound: vec![],
            outbound: vec![],
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), state.run(req)).await.unwrap().unwrap();

        let telemetry = state.telemetry_snapshot().await;
        assert_eq!(telemetry.len(), 1);
        assert_eq!(telemetry[0].scheme, "s");
        assert_eq!(telemetry[0].node, "a");

        state.stop("s_a").await.unwrap();
        assert!(state.telemetry_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn running_the_same_runtime_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemActionStore::new());
        put_compressed_long_running_binary(&store, "noop").await;
        let state = AgentState::new(test_config(dir.path()), store);

        let req = RunRequest {
            scheme: "s".into(),
            node: "a".into(),
            action: "noop".into(),
            argv: vec![],
            env: BTreeMap::new(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            inbound: vec![],
            outbound: vec![],
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), state.run(req.clone())).await.unwrap().unwrap();
        let err = state.run(req).await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyRunning(_)));
        state.stop("s_a").await.unwrap();
    }

    #[tokio::test]
    async fn stopping_an_unknown_runtime_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemActionStore::new());
        let state = AgentState::new(test_config(dir.path()), store);
        let err = state.stop("s_missing").await.unwrap_err();
        assert!(matches!(err, AgentError::NotRunning(_)));
    }
}
