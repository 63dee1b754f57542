//! The registry of actions and schemes, plus the table of currently
//! running plans and their watcher tasks.

use std::collections::HashMap;
use std::sync::Arc;

use gs_kvstore::{keys, ActionStore, KvStore};
use gs_lang::{build_plan, Plan, Scheme};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent_client::AgentClient;
use crate::config::MetaConfig;
use crate::MetaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[repr(u8)]
pub enum SchemeStatus {
    Stopped = 0,
    Running = 1,
}

#[derive(Debug, serde::Serialize)]
pub struct SchemeSummary {
    pub name: String,
    pub status: SchemeStatus,
}

pub(crate) struct RunningPlan {
    /// Its own `Arc<Mutex<_>>` rather than a bare `Mutex<Plan>` owned by
    /// the table: `fix_action` needs to hold this lock only across the
    /// short mutation steps, not across the network calls in between, and
    /// must release the *table* lock (`MetaState::running`) before it even
    /// starts — cloning the `Arc` out first is what makes that possible.
    pub plan: Arc<Mutex<Plan>>,
    pub cancel: CancellationToken,
    pub watcher_task: JoinHandle<()>,
    /// Graph snapshots published for `send_dashboard` websocket clients;
    /// lagging subscribers just miss intermediate frames.
    pub dashboard_tx: broadcast::Sender<String>,
}

pub struct MetaState {
    pub(crate) config: MetaConfig,
    pub(crate) plan_store: Arc<dyn KvStore>,
    pub(crate) action_store: Arc<dyn ActionStore>,
    pub(crate) agent_client: AgentClient,
    pub(crate) running: Mutex<HashMap<String, RunningPlan>>,
}

impl MetaState {
    pub fn new(config: MetaConfig, plan_store: Arc<dyn KvStore>, action_store: Arc<dyn ActionStore>) -> Arc<Self> {
        let agent_client = AgentClient::new(config.agent_port);
        Arc::new(Self { config, plan_store, action_store, agent_client, running: Mutex::new(HashMap::new()) })
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    // ---- actions ----

    pub async fn list_actions(&self) -> Result<Vec<String>, MetaError> {
        let keys = self.action_store.list().await?;
        Ok(keys)
    }

    pub async fn get_action(&self, name: &str) -> Result<Vec<u8>, MetaError> {
        match self.action_store.get(name).await {
            Ok(bytes) => Ok(bytes),
            Err(gs_kvstore::StoreError::NotFound(_)) => Err(MetaError::NotFound(format!("action {name}"))),
            Err(e) => Err(e.into()),
        }
    }

    /// `raw` is the uncompressed binary; it is zstd-compressed here so
    /// callers (the CLI, the HTTP multipart handler) never have to think
    /// about the at-rest encoding.
    pub async fn put_action(&self, name: &str, raw: &[u8]) -> Result<(), MetaError> {
        let compressed = zstd::stream::encode_all(std::io::Cursor::new(raw), 0).map_err(|e| MetaError::Internal(e.to_string()))?;
        self.action_store.put(name, compressed).await?;
        Ok(())
    }

    pub async fn delete_action(&self, name: &str) -> Result<(), MetaError> {
        match self.action_store.delete(name).await {
            Ok(()) => Ok(()),
            Err(gs_kvstore::StoreError::NotFound(_)) => Err(MetaError::NotFound(format!("action {name}"))),
            Err(e) => Err(e.into()),
        }
    }

    // ---- schemes / plans ----

    pub async fn list_schemes(&self) -> Result<Vec<SchemeSummary>, MetaError> {
        let keys = self.plan_store.list_prefix(keys::PLAN_PREFIX).await?;
        let running = self.running.lock().await;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let name = key.trim_start_matches(keys::PLAN_PREFIX).to_string();
            let status = if running.contains_key(&name) { SchemeStatus::Running } else { SchemeStatus::Stopped };
            out.push(SchemeSummary { name, status });
        }
        Ok(out)
    }

    pub async fn get_scheme(&self, name: &str) -> Result<Scheme, MetaError> {
        let plan = self.load_plan(name).await?;
        Ok(plan.scheme)
    }

    /// Validates, plans, and persists a scheme. Rejects overwriting a
    /// scheme that is currently running — stop it first.
    pub async fn put_scheme(&self, scheme: Scheme) -> Result<(), MetaError> {
        let name = scheme.name.clone();
        if self.running.lock().await.contains_key(&name) {
            return Err(MetaError::Conflict(format!("scheme {name} is running; stop it before redefining")));
        }
        let plan = build_plan(scheme)?;
        let bytes = serde_json::to_vec(&plan)?;
        self.plan_store.put(&keys::plan(&name), bytes).await?;
        Ok(())
    }

    pub async fn delete_scheme(&self, name: &str) -> Result<(), MetaError> {
        if self.running.lock().await.contains_key(name) {
            return Err(MetaError::Conflict(format!("scheme {name} is running; stop it before deleting")));
        }
        match self.plan_store.delete_if_exists(&keys::plan(name)).await {
            Ok(()) => Ok(()),
            Err(gs_kvstore::StoreError::NotFound(_)) => Err(MetaError::NotFound(format!("scheme {name}"))),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn load_plan(&self, name: &str) -> Result<Plan, MetaError> {
        match self.plan_store.get(&keys::plan(name)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(MetaError::from),
            Err(gs_kvstore::StoreError::NotFound(_)) => Err(MetaError::NotFound(format!("scheme {name}"))),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn save_plan(&self, plan: &Plan) -> Result<(), MetaError> {
        let bytes = serde_json::to_vec(plan)?;
        self.plan_store.put(&keys::plan(&plan.name), bytes).await?;
        Ok(())
    }

    pub fn agent_client(&self) -> &AgentClient {
        &self.agent_client
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.running.lock().await.contains_key(name)
    }
}
