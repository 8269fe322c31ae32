//! Domain types for the catalog state store.
//!
//! These types represent registered nodes, the services they run, their
//! health checks and key/value entries. Every row carries the index it was
//! created at and the index it was last modified at. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique name of a node in the catalog.
pub type NodeName = String;

// ── Node ──────────────────────────────────────────────────────────

/// A registered cluster member.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub node: NodeName,
    pub address: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

// ── Service ───────────────────────────────────────────────────────

/// A service instance owned by a single node, identified by `id` within it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeService {
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

/// The services registered on one node, with version metadata covering all
/// of them.
///
/// `create_index`/`modify_index` are the highest values among the services,
/// or the node's own indices when it has none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeServices {
    pub node: Node,
    pub services: BTreeMap<String, NodeService>,
    pub create_index: u64,
    pub modify_index: u64,
}

/// A service row joined with the address of the node providing it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceNode {
    pub node: NodeName,
    pub node_address: String,
    pub service_id: String,
    pub service_name: String,
    pub service_tags: Vec<String>,
    pub service_address: String,
    pub service_port: u16,
    pub create_index: u64,
    pub modify_index: u64,
}

impl ServiceNode {
    pub(crate) fn join(node: &Node, svc: NodeService) -> Self {
        Self {
            node: node.node.clone(),
            node_address: node.address.clone(),
            service_id: svc.id,
            service_name: svc.service,
            service_tags: svc.tags,
            service_address: svc.address,
            service_port: svc.port,
            create_index: svc.create_index,
            modify_index: svc.modify_index,
        }
    }
}

// ── Health check ──────────────────────────────────────────────────

/// Reported state of a health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Passing,
    Warning,
    #[default]
    Critical,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A health check owned by a node. A non-empty `service_id` ties the check
/// to one of that node's services.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    #[serde(default)]
    pub node: NodeName,
    pub check_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

// ── Registration ──────────────────────────────────────────────────

/// A node registration with an optional service and any number of checks,
/// applied atomically by [`StateStore::ensure_registration`].
///
/// Checks with an empty `node` are attributed to `node`.
///
/// [`StateStore::ensure_registration`]: crate::StateStore::ensure_registration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    pub node: NodeName,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub service: Option<NodeService>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

impl RegisterRequest {
    pub(crate) fn to_node(&self) -> Node {
        Node {
            node: self.node.clone(),
            address: self.address.clone(),
            meta: self.meta.clone(),
            ..Default::default()
        }
    }
}

// ── Key/value ─────────────────────────────────────────────────────

/// An entry in the key/value table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DirEntry {
    pub key: String,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}
