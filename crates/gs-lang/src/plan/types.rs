//! The data model shared by the meta controller and the runtime: the
//! user-facing [`Scheme`] and the compiled [`Plan`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A `(host, port)` pair. Kept as a plain tuple-struct rather than
/// `SocketAddr` because hostnames (not just IPs) are valid here — the
/// actual connection resolves DNS at dial time, in `gs-net`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One node description within a [`Scheme`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub action: String,
    /// Candidate addresses; `addresses[0]` is the initial placement, the
    /// rest are failover slots consumed in order by the plan watcher.
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The user-level spec: a named set of [`Node`]s plus a dataflow expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheme {
    pub name: String,
    pub nodes: Vec<Node>,
    pub dataflow: String,
}

/// The canonical identifier `<scheme>_<node>`, used both as the wire-level
/// hello token and as the `in` entry of a [`PlanNode`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuntimeName(pub String);

impl RuntimeName {
    pub fn new(scheme: &str, node: &str) -> Self {
        RuntimeName(format!("{scheme}_{node}"))
    }
}

impl std::fmt::Display for RuntimeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One compiled node of a [`Plan`]: a [`Node`] plus resolved edges and the
/// currently active address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
    pub node: Node,
    /// Resolved upstream peers, as `<scheme>_<peer_node>` tags.
    pub inbound: Vec<RuntimeName>,
    /// Resolved downstream peers, as the *current* active address of each
    /// successor — mutated in place by the plan watcher on failover.
    pub outbound: Vec<Address>,
    /// Index into `node.addresses` of the currently active placement.
    pub addr_index: usize,
}

impl PlanNode {
    pub fn active_address(&self) -> &Address {
        &self.node.addresses[self.addr_index]
    }

    pub fn runtime_name(&self, scheme: &str) -> RuntimeName {
        RuntimeName::new(scheme, &self.node.name)
    }
}

/// The compiled, persisted graph of a [`Scheme`]: a topologically ordered
/// sequence of [`PlanNode`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub scheme: Scheme,
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn node(&self, name: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.node.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut PlanNode> {
        self.nodes.iter_mut().find(|n| n.node.name == name)
    }
}
