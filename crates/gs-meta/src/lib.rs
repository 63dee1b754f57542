//! The cluster controller: the action/scheme registry, the planner
//! front-end, and the plan watcher that keeps a running plan's nodes
//! alive across machine failures.

pub mod agent_client;
pub mod api;
pub mod config;
pub mod state;
pub mod watcher;

pub use config::MetaConfig;
pub use state::MetaState;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Store(#[from] gs_kvstore::StoreError),
    #[error("machine error: {0}")]
    Machine(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<gs_lang::PlanError> for MetaError {
    fn from(err: gs_lang::PlanError) -> Self {
        MetaError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(err: serde_json::Error) -> Self {
        MetaError::Validation(err.to_string())
    }
}
