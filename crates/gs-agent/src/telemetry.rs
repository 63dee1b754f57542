//! The `{scheme, action, status, oldest_output}` telemetry record the
//! data model names, reported per runtime on `GET /v1/ping`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryStatus {
    /// The last control-socket ping within the failure window succeeded.
    Ok,
    /// One or more consecutive pings have failed, but fewer than the
    /// configured threshold — the meta controller's plan watcher treats
    /// this as "not yet actionable" rather than dead.
    Pending,
}

/// One runtime's telemetry snapshot. `node` is carried alongside `scheme`
/// and `action` (beyond the data model's literal field list) because a
/// scheme can have more than one node running the same action, and the
/// plan watcher needs to correlate a telemetry row back to the specific
/// `<scheme>_<node>` runtime it polled rather than just the scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeTelemetry {
    pub scheme: String,
    pub node: String,
    pub action: String,
    pub status: TelemetryStatus,
    pub oldest_output: u32,
}
