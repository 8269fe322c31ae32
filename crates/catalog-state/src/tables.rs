//! redb table definitions for the catalog state store.
//!
//! Row tables use JSON-serialized `&[u8]` values. Per-node rows are keyed by
//! `(node, id)` tuples so that everything a node owns is one contiguous range.

use std::fmt;
use std::str::FromStr;

use redb::TableDefinition;

use crate::error::StateError;

/// Nodes keyed by node name.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Services keyed by `(node, service_id)`.
pub const SERVICES: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("services");

/// Health checks keyed by `(node, check_id)`.
pub const CHECKS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("checks");

/// Key/value entries keyed by their full key.
pub const KVS: TableDefinition<&str, &[u8]> = TableDefinition::new("kvs");

/// Highest index written to each logical table, keyed by [`Table::as_str`].
pub const INDEX: TableDefinition<&str, u64> = TableDefinition::new("index");

/// A logical catalog table. Each one has its own version index and its own
/// full-table watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Nodes,
    Services,
    Checks,
    Kvs,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Nodes, Table::Services, Table::Checks, Table::Kvs];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Nodes => "nodes",
            Table::Services => "services",
            Table::Checks => "checks",
            Table::Kvs => "kvs",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StateError::UnknownTable(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_round_trip() {
        for table in Table::ALL {
            assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
        }
    }

    #[test]
    fn unknown_table_name_is_rejected() {
        let err = "sessions".parse::<Table>().unwrap_err();
        assert!(matches!(err, StateError::UnknownTable(name) if name == "sessions"));
    }
}
