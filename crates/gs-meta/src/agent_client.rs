//! Thin `reqwest` client for one machine agent's HTTP surface, speaking
//! the same JSON DTOs `gs-agent` defines so the two crates never drift.

use gs_agent::state::{ChangeOutRequest, RunRequest, StopRequest};
use gs_agent::RuntimeTelemetry;
use gs_lang::Address;

use crate::MetaError;

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    agent_port: u16,
}

impl AgentClient {
    pub fn new(agent_port: u16) -> Self {
        Self { http: reqwest::Client::new(), agent_port }
    }

    fn base_url(&self, host: &str) -> String {
        format!("http://{host}:{port}", port = self.agent_port)
    }

    /// The agent responsible for `addr` is the one colocated with its
    /// host (see [`crate::MetaConfig::agent_port`]).
    pub async fn run(&self, addr: &Address, req: &RunRequest) -> Result<(), MetaError> {
        let url = format!("{}/v1/run", self.base_url(&addr.host));
        let response = self.http.post(url).json(req).send().await.map_err(to_machine_error)?;
        ensure_success(response).await
    }

    pub async fn stop(&self, host: &str, runtime_name: &str) -> Result<(), MetaError> {
        let url = format!("{}/v1/stop", self.base_url(host));
        let response = self
            .http
            .post(url)
            .json(&StopRequest { runtime_name: runtime_name.to_string() })
            .send()
            .await
            .map_err(to_machine_error)?;
        ensure_success(response).await
    }

    pub async fn change_out(&self, host: &str, req: &ChangeOutRequest) -> Result<(), MetaError> {
        let url = format!("{}/v1/change_out", self.base_url(host));
        let response = self.http.post(url).json(req).send().await.map_err(to_machine_error)?;
        ensure_success(response).await
    }

    pub async fn ping(&self, host: &str) -> Result<Vec<RuntimeTelemetry>, MetaError> {
        let url = format!("{}/v1/ping", self.base_url(host));
        let response = self.http.get(url).send().await.map_err(to_machine_error)?;
        if !response.status().is_success() {
            return Err(MetaError::Machine(format!("ping {host} returned {}", response.status())));
        }
        response.json().await.map_err(to_machine_error)
    }
}

fn to_machine_error(err: reqwest::Error) -> MetaError {
    MetaError::Machine(err.to_string())
}

async fn ensure_success(response: reqwest::Response) -> Result<(), MetaError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(MetaError::Machine(format!("agent returned {}", response.status())))
    }
}
