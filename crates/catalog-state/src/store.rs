//! StateStore: redb-backed service catalog.
//!
//! Holds the node, service, health check and key/value tables. Every write
//! runs in a single redb write transaction: preconditions are checked, rows
//! are stamped with the caller's index, the per-table index is advanced and
//! the touched tables' watches are armed. Watches fire only after the
//! transaction commits, so a woken reader always sees the new state. A
//! failed write aborts the transaction and fires nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::watch::{
    DumbWatchManager, FullTableWatch, PrefixSubwatch, PrefixWatch, TableWatches, table_watches,
};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Decode every row owned by `node` from a `(node, id)` keyed table.
fn scan_node<T, R>(table: &R, node: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<(&'static str, &'static str), &'static [u8]>,
{
    let mut rows = Vec::new();
    for entry in table.range((node, "")..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().0 != node {
            break;
        }
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

/// Decode every row of a table.
fn scan_all<K, T, R>(table: &R) -> StateResult<Vec<T>>
where
    K: redb::Key + 'static,
    T: DeserializeOwned,
    R: ReadableTable<K, &'static [u8]>,
{
    let mut rows = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

/// Keys of every key/value entry under `prefix`.
fn kvs_keys_under<R>(table: &R, prefix: &str) -> StateResult<Vec<String>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

#[derive(Debug)]
struct Watches {
    tables: TableWatches,
    kvs: PrefixWatch,
}

/// Thread-safe catalog store backed by redb.
///
/// Cloning is cheap; clones share the database and the watches.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    watches: Arc<Watches>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> StateResult<Self> {
        let store = Self {
            db: Arc::new(db),
            watches: Arc::new(Watches {
                tables: table_watches(),
                kvs: PrefixWatch::new(),
            }),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(CHECKS).map_err(map_err!(Table))?;
        txn.open_table(KVS).map_err(map_err!(Table))?;
        txn.open_table(INDEX).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside one write transaction. Commits and fires the armed
    /// watches on success; aborts and fires nothing on error.
    fn update<T>(&self, f: impl FnOnce(&mut WriteTxn<'_>) -> StateResult<T>) -> StateResult<T> {
        let mut txn = WriteTxn {
            txn: self.db.begin_write().map_err(map_err!(Transaction))?,
            manager: DumbWatchManager::new(&self.watches.tables),
            prefixes: Vec::new(),
            kvs_watch: &self.watches.kvs,
        };
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = txn.txn.abort() {
                    warn!(error = %abort_err, "failed to abort write transaction");
                }
                Err(err)
            }
        }
    }

    // ── Watches and indices ────────────────────────────────────────

    /// The watch that fires whenever `table` changes.
    pub fn table_watch(&self, table: Table) -> &FullTableWatch {
        &self.watches.tables[&table]
    }

    /// The watch for key/value changes at or above `prefix`.
    pub fn kvs_watch(&self, prefix: &str) -> PrefixSubwatch<'_> {
        self.watches.kvs.subscribe(prefix)
    }

    /// Highest index written to `table`, or 0 if it was never written.
    pub fn max_index(&self, table: Table) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(INDEX).map_err(map_err!(Table))?;
        let value = index
            .get(table.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(value)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn ensure_node(&self, index: u64, node: &Node) -> StateResult<()> {
        self.update(|txn| txn.ensure_node(index, node))?;
        debug!(node = %node.node, index, "node registered");
        Ok(())
    }

    /// Get a node by name.
    pub fn get_node(&self, name: &str) -> StateResult<Option<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all nodes, ordered by name.
    pub fn nodes(&self) -> StateResult<Vec<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        scan_all(&table)
    }

    /// Delete a node along with its services and checks. Returns true if it
    /// existed.
    pub fn delete_node(&self, index: u64, name: &str) -> StateResult<bool> {
        let existed = self.update(|txn| txn.delete_node(index, name))?;
        debug!(node = name, index, existed, "node deleted");
        Ok(existed)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service on an existing node.
    pub fn ensure_service(&self, index: u64, node: &str, svc: &NodeService) -> StateResult<()> {
        self.update(|txn| txn.ensure_service(index, node, svc))?;
        debug!(node, service_id = %svc.id, index, "service registered");
        Ok(())
    }

    /// All services on `node`, or `None` if the node is not registered.
    pub fn node_services(&self, node: &str) -> StateResult<Option<NodeServices>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
        let node: Node = match nodes.get(node).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value())?,
            None => return Ok(None),
        };

        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let rows: Vec<NodeService> = scan_node(&table, &node.node)?;

        let (create_index, modify_index) = if rows.is_empty() {
            (node.create_index, node.modify_index)
        } else {
            (
                rows.iter().map(|s| s.create_index).max().unwrap_or_default(),
                rows.iter().map(|s| s.modify_index).max().unwrap_or_default(),
            )
        };
        let services = rows.into_iter().map(|s| (s.id.clone(), s)).collect();

        Ok(Some(NodeServices {
            node,
            services,
            create_index,
            modify_index,
        }))
    }

    /// Every service name in the catalog with the union of its tags.
    pub fn services(&self) -> StateResult<BTreeMap<String, Vec<String>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let rows: Vec<NodeService> = scan_all(&table)?;

        let mut tags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for svc in rows {
            tags.entry(svc.service).or_default().extend(svc.tags);
        }
        Ok(tags
            .into_iter()
            .map(|(name, set)| (name, set.into_iter().collect()))
            .collect())
    }

    /// Every instance of the named service, joined with its node's address.
    pub fn service_nodes(&self, service: &str) -> StateResult<Vec<ServiceNode>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;

        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let svc: NodeService = decode(value.value())?;
            if svc.service != service {
                continue;
            }
            let (node_name, _) = key.value();
            if let Some(guard) = nodes.get(node_name).map_err(map_err!(Read))? {
                let node: Node = decode(guard.value())?;
                results.push(ServiceNode::join(&node, svc));
            }
        }
        Ok(results)
    }

    /// Remove a service and the checks tied to it. Returns true if it
    /// existed.
    pub fn delete_node_service(&self, index: u64, node: &str, service_id: &str) -> StateResult<bool> {
        let existed = self.update(|txn| txn.delete_node_service(index, node, service_id))?;
        debug!(node, service_id, index, existed, "service deleted");
        Ok(existed)
    }

    // ── Checks ─────────────────────────────────────────────────────

    /// Insert or update a health check.
    pub fn ensure_check(&self, index: u64, check: &HealthCheck) -> StateResult<()> {
        self.update(|txn| txn.ensure_check(index, check))?;
        debug!(node = %check.node, check_id = %check.check_id, index, "check registered");
        Ok(())
    }

    /// All checks on `node`, ordered by check ID. Empty if the node has none
    /// or does not exist.
    pub fn node_checks(&self, node: &str) -> StateResult<Vec<HealthCheck>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKS).map_err(map_err!(Table))?;
        scan_node(&table, node)
    }

    /// All checks attached to instances of the named service.
    pub fn service_checks(&self, service: &str) -> StateResult<Vec<HealthCheck>> {
        self.filter_checks(|check| check.service_name == service)
    }

    /// All checks in `status`, or every check when `status` is `None`.
    pub fn checks_in_state(&self, status: Option<HealthStatus>) -> StateResult<Vec<HealthCheck>> {
        self.filter_checks(|check| status.is_none_or(|s| check.status == s))
    }

    fn filter_checks(&self, keep: impl Fn(&HealthCheck) -> bool) -> StateResult<Vec<HealthCheck>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKS).map_err(map_err!(Table))?;
        let checks: Vec<HealthCheck> = scan_all(&table)?;
        Ok(checks.into_iter().filter(|c| keep(c)).collect())
    }

    /// Remove a single check. Returns true if it existed.
    pub fn delete_check(&self, index: u64, node: &str, check_id: &str) -> StateResult<bool> {
        let existed = self.update(|txn| txn.delete_check(index, node, check_id))?;
        debug!(node, check_id, index, existed, "check deleted");
        Ok(existed)
    }

    // ── Registration ───────────────────────────────────────────────

    /// Register a node, its service and its checks in one transaction.
    pub fn ensure_registration(&self, index: u64, req: &RegisterRequest) -> StateResult<()> {
        self.update(|txn| {
            txn.ensure_node(index, &req.to_node())?;
            if let Some(svc) = &req.service {
                txn.ensure_service(index, &req.node, svc)?;
            }
            for check in &req.checks {
                if check.node.is_empty() {
                    let mut check = check.clone();
                    check.node = req.node.clone();
                    txn.ensure_check(index, &check)?;
                } else {
                    txn.ensure_check(index, check)?;
                }
            }
            Ok(())
        })?;
        debug!(node = %req.node, index, checks = req.checks.len(), "registration applied");
        Ok(())
    }

    // ── Key/value ──────────────────────────────────────────────────

    /// Insert or update a key/value entry.
    pub fn kvs_set(&self, index: u64, entry: &DirEntry) -> StateResult<()> {
        self.update(|txn| txn.kvs_set(index, entry))?;
        debug!(key = %entry.key, index, "kv entry set");
        Ok(())
    }

    pub fn kvs_get(&self, key: &str) -> StateResult<Option<DirEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KVS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn kvs_list(&self, prefix: &str) -> StateResult<Vec<DirEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KVS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Delete one key. Returns true if it existed.
    pub fn kvs_delete(&self, index: u64, key: &str) -> StateResult<bool> {
        let existed = self.update(|txn| txn.kvs_delete(index, key))?;
        debug!(key, index, existed, "kv entry deleted");
        Ok(existed)
    }

    /// Delete every key under `prefix`. Returns the number deleted.
    pub fn kvs_delete_tree(&self, index: u64, prefix: &str) -> StateResult<usize> {
        let count = self.update(|txn| txn.kvs_delete_tree(index, prefix))?;
        debug!(prefix, index, count, "kv tree deleted");
        Ok(count)
    }
}

/// One write transaction plus the watches it has armed.
struct WriteTxn<'a> {
    txn: WriteTransaction,
    manager: DumbWatchManager<'a>,
    prefixes: Vec<(String, bool)>,
    kvs_watch: &'a PrefixWatch,
}

impl WriteTxn<'_> {
    fn commit(self) -> StateResult<()> {
        self.txn.commit().map_err(map_err!(Transaction))?;
        self.manager.notify();
        for (prefix, subtree) in &self.prefixes {
            self.kvs_watch.notify(prefix, *subtree);
        }
        Ok(())
    }

    /// Record that `table` was written at `index`: advance its index and
    /// arm its watch.
    fn touch(&mut self, table: Table, index: u64) -> StateResult<()> {
        {
            let mut indexes = self.txn.open_table(INDEX).map_err(map_err!(Table))?;
            let current = indexes
                .get(table.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            if index > current {
                indexes
                    .insert(table.as_str(), index)
                    .map_err(map_err!(Write))?;
            }
        }
        self.manager.arm(table);
        Ok(())
    }

    fn node_exists(&self, name: &str) -> StateResult<bool> {
        let table = self.txn.open_table(NODES).map_err(map_err!(Table))?;
        let exists = table.get(name).map_err(map_err!(Read))?.is_some();
        Ok(exists)
    }

    fn ensure_node(&mut self, index: u64, node: &Node) -> StateResult<()> {
        {
            let mut table = self.txn.open_table(NODES).map_err(map_err!(Table))?;
            let existing: Option<Node> = match table.get(node.node.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let mut entry = node.clone();
            entry.create_index = existing.map_or(index, |n| n.create_index);
            entry.modify_index = index;
            let value = encode(&entry)?;
            table
                .insert(entry.node.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        self.touch(Table::Nodes, index)
    }

    /// Cascade order: checks, then services, then the node itself.
    fn delete_node(&mut self, index: u64, name: &str) -> StateResult<bool> {
        if !self.node_exists(name)? {
            return Ok(false);
        }

        let checks_removed = {
            let mut table = self.txn.open_table(CHECKS).map_err(map_err!(Table))?;
            let checks: Vec<HealthCheck> = scan_node(&table, name)?;
            for check in &checks {
                table
                    .remove((name, check.check_id.as_str()))
                    .map_err(map_err!(Write))?;
            }
            !checks.is_empty()
        };
        if checks_removed {
            self.touch(Table::Checks, index)?;
        }

        let services_removed = {
            let mut table = self.txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let services: Vec<NodeService> = scan_node(&table, name)?;
            for svc in &services {
                table
                    .remove((name, svc.id.as_str()))
                    .map_err(map_err!(Write))?;
            }
            !services.is_empty()
        };
        if services_removed {
            self.touch(Table::Services, index)?;
        }

        {
            let mut table = self.txn.open_table(NODES).map_err(map_err!(Table))?;
            table.remove(name).map_err(map_err!(Write))?;
        }
        self.touch(Table::Nodes, index)?;
        Ok(true)
    }

    fn ensure_service(&mut self, index: u64, node: &str, svc: &NodeService) -> StateResult<()> {
        if !self.node_exists(node)? {
            return Err(StateError::MissingNode);
        }
        {
            let mut table = self.txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let existing: Option<NodeService> =
                match table.get((node, svc.id.as_str())).map_err(map_err!(Read))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                };
            let mut entry = svc.clone();
            entry.create_index = existing.map_or(index, |s| s.create_index);
            entry.modify_index = index;
            let value = encode(&entry)?;
            table
                .insert((node, entry.id.as_str()), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        self.touch(Table::Services, index)
    }

    /// Cascade order: checks tied to the service, then the service.
    fn delete_node_service(&mut self, index: u64, node: &str, service_id: &str) -> StateResult<bool> {
        let exists = {
            let table = self.txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let found = table.get((node, service_id)).map_err(map_err!(Read))?.is_some();
            found
        };
        if !exists {
            return Ok(false);
        }

        let checks_removed = {
            let mut table = self.txn.open_table(CHECKS).map_err(map_err!(Table))?;
            let checks: Vec<HealthCheck> = scan_node(&table, node)?;
            let mut removed = 0usize;
            for check in checks.iter().filter(|c| c.service_id == service_id) {
                table
                    .remove((node, check.check_id.as_str()))
                    .map_err(map_err!(Write))?;
                removed += 1;
            }
            removed > 0
        };
        if checks_removed {
            self.touch(Table::Checks, index)?;
        }

        {
            let mut table = self.txn.open_table(SERVICES).map_err(map_err!(Table))?;
            table.remove((node, service_id)).map_err(map_err!(Write))?;
        }
        self.touch(Table::Services, index)?;
        Ok(true)
    }

    fn ensure_check(&mut self, index: u64, check: &HealthCheck) -> StateResult<()> {
        let node = check.node.as_str();
        if !self.node_exists(node)? {
            return Err(StateError::MissingNode);
        }
        if !check.service_id.is_empty() {
            let table = self.txn.open_table(SERVICES).map_err(map_err!(Table))?;
            if table
                .get((node, check.service_id.as_str()))
                .map_err(map_err!(Read))?
                .is_none()
            {
                return Err(StateError::MissingService);
            }
        }
        {
            let mut table = self.txn.open_table(CHECKS).map_err(map_err!(Table))?;
            let existing: Option<HealthCheck> =
                match table.get((node, check.check_id.as_str())).map_err(map_err!(Read))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                };
            let mut entry = check.clone();
            entry.create_index = existing.map_or(index, |c| c.create_index);
            entry.modify_index = index;
            let value = encode(&entry)?;
            table
                .insert((node, entry.check_id.as_str()), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        self.touch(Table::Checks, index)
    }

    fn delete_check(&mut self, index: u64, node: &str, check_id: &str) -> StateResult<bool> {
        let existed = {
            let mut table = self.txn.open_table(CHECKS).map_err(map_err!(Table))?;
            let removed = table.remove((node, check_id)).map_err(map_err!(Write))?.is_some();
            removed
        };
        if existed {
            self.touch(Table::Checks, index)?;
        }
        Ok(existed)
    }

    fn kvs_set(&mut self, index: u64, entry: &DirEntry) -> StateResult<()> {
        {
            let mut table = self.txn.open_table(KVS).map_err(map_err!(Table))?;
            let existing: Option<DirEntry> = match table.get(entry.key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let mut row = entry.clone();
            row.create_index = existing.map_or(index, |e| e.create_index);
            row.modify_index = index;
            let value = encode(&row)?;
            table
                .insert(row.key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        self.touch(Table::Kvs, index)?;
        self.prefixes.push((entry.key.clone(), false));
        Ok(())
    }

    fn kvs_delete(&mut self, index: u64, key: &str) -> StateResult<bool> {
        let existed = {
            let mut table = self.txn.open_table(KVS).map_err(map_err!(Table))?;
            let removed = table.remove(key).map_err(map_err!(Write))?.is_some();
            removed
        };
        if existed {
            self.touch(Table::Kvs, index)?;
            self.prefixes.push((key.to_string(), false));
        }
        Ok(existed)
    }

    fn kvs_delete_tree(&mut self, index: u64, prefix: &str) -> StateResult<usize> {
        let removed = {
            let mut table = self.txn.open_table(KVS).map_err(map_err!(Table))?;
            let keys = kvs_keys_under(&table, prefix)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            keys.len()
        };
        if removed > 0 {
            self.touch(Table::Kvs, index)?;
            self.prefixes.push((prefix.to_string(), true));
        }
        Ok(removed)
    }
}
