//! Point-in-time catalog dump.

use std::collections::BTreeMap;

use serde::Serialize;

use catalog_state::{HealthCheck, Node, NodeService, StateResult, StateStore, Table};

#[derive(Debug, Serialize)]
pub struct CatalogSnapshot {
    /// Current index of every table.
    pub indexes: BTreeMap<&'static str, u64>,
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Serialize)]
pub struct NodeEntry {
    #[serde(flatten)]
    pub node: Node,
    pub services: Vec<NodeService>,
    pub checks: Vec<HealthCheck>,
}

/// Collect every node with its services and checks.
///
/// Each table is read separately, so a write landing mid-dump may show up in
/// some sections and not others. The indices are read first and are never
/// newer than the rows that follow.
pub fn snapshot(store: &StateStore) -> StateResult<CatalogSnapshot> {
    let mut indexes = BTreeMap::new();
    for table in Table::ALL {
        indexes.insert(table.as_str(), store.max_index(table)?);
    }

    let mut nodes = Vec::new();
    for node in store.nodes()? {
        let services: Vec<NodeService> = store
            .node_services(&node.node)?
            .map(|ns| ns.services.into_values().collect())
            .unwrap_or_default();
        let checks = store.node_checks(&node.node)?;
        nodes.push(NodeEntry {
            node,
            services,
            checks,
        });
    }

    Ok(CatalogSnapshot { indexes, nodes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_state::CatalogConfig;

    #[test]
    fn snapshot_of_seeded_catalog() {
        let config = CatalogConfig::parse(
            r#"
[[register]]
index = 3
node = "web1"
address = "10.0.0.3"

[register.service]
id = "web"
service = "web"
port = 80

[[register.checks]]
check_id = "web-http"
service_id = "web"

[[register]]
index = 4
node = "db1"
address = "10.0.0.4"
"#,
        )
        .unwrap();
        let store = config.open_store().unwrap();
        config.apply_seeds(&store).unwrap();

        let snap = snapshot(&store).unwrap();
        assert_eq!(snap.indexes["nodes"], 4);
        assert_eq!(snap.indexes["services"], 3);
        assert_eq!(snap.indexes["checks"], 3);
        assert_eq!(snap.indexes["kvs"], 0);

        let names: Vec<&str> = snap.nodes.iter().map(|n| n.node.node.as_str()).collect();
        assert_eq!(names, vec!["db1", "web1"]);
        assert!(snap.nodes[0].services.is_empty());
        assert_eq!(snap.nodes[1].services[0].port, 80);
        assert_eq!(snap.nodes[1].checks[0].check_id, "web-http");

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["nodes"][1]["address"], "10.0.0.3");
    }

    #[test]
    fn sample_config_seeds_a_healthy_service() {
        let config = CatalogConfig::parse(include_str!("../catalog.toml")).unwrap();
        let store = config.open_store().unwrap();
        config.apply_seeds(&store).unwrap();

        let snap = snapshot(&store).unwrap();
        assert_eq!(snap.nodes.len(), 1);
        assert_eq!(snap.nodes[0].services[0].tags, vec!["primary"]);
        assert_eq!(snap.nodes[0].checks[0].node, "node1");
        assert_eq!(snap.nodes[0].checks[0].status, catalog_state::HealthStatus::Passing);
    }

    #[test]
    fn snapshot_of_empty_catalog() {
        let store = StateStore::open_in_memory().unwrap();
        let snap = snapshot(&store).unwrap();
        assert!(snap.nodes.is_empty());
        assert!(snap.indexes.values().all(|&i| i == 0));
    }
}
