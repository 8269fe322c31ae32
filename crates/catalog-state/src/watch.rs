//! Change notification for the catalog store.
//!
//! Every flavor of watch is built on [`NotifyGroup`], a one-shot fan-out:
//! firing it signals every registered channel once and then forgets them.
//! A waiter that wants to keep watching registers again after each wake,
//! then re-reads the store.
//!
//! To avoid missing a change, a waiter registers *before* reading the
//! state it is interested in, and only then blocks on its channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use crate::prefix_map::PrefixMap;
use crate::tables::Table;

/// Wake channel handed to a watch. Signals are sent with `try_send`, so a
/// slow or departed receiver never blocks the writer.
pub type NotifyCh = mpsc::Sender<()>;

/// Create a wake channel with room for exactly one pending signal.
pub fn notify_channel() -> (NotifyCh, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

/// The interface common to all watch flavors.
pub trait Watch: Send + Sync {
    /// Register `notify_ch` to be signaled the next time the watch fires.
    fn wait(&self, notify_ch: &NotifyCh);

    /// Deregister `notify_ch`. Safe to call after the watch already fired.
    fn clear(&self, notify_ch: &NotifyCh);
}

// ── NotifyGroup ───────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NotifyGroup {
    waiters: Mutex<Vec<NotifyCh>>,
}

impl NotifyGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. Registering the same channel twice is a no-op.
    pub fn wait(&self, notify_ch: &NotifyCh) {
        let mut waiters = self.waiters.lock().expect("notify group lock");
        if !waiters.iter().any(|ch| ch.same_channel(notify_ch)) {
            waiters.push(notify_ch.clone());
        }
    }

    pub fn clear(&self, notify_ch: &NotifyCh) {
        let mut waiters = self.waiters.lock().expect("notify group lock");
        waiters.retain(|ch| !ch.same_channel(notify_ch));
    }

    /// Signal every registered channel and drop all registrations.
    pub fn notify(&self) {
        let mut waiters = self.waiters.lock().expect("notify group lock");
        for ch in waiters.drain(..) {
            // Full means a wake is already pending; closed means the waiter left.
            let _ = ch.try_send(());
        }
    }

    /// Number of channels currently registered.
    pub fn len(&self) -> usize {
        self.waiters.lock().expect("notify group lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Watch for NotifyGroup {
    fn wait(&self, notify_ch: &NotifyCh) {
        NotifyGroup::wait(self, notify_ch);
    }

    fn clear(&self, notify_ch: &NotifyCh) {
        NotifyGroup::clear(self, notify_ch);
    }
}

// ── FullTableWatch ────────────────────────────────────────────────

/// Fires whenever anything in one table changes.
#[derive(Debug, Default)]
pub struct FullTableWatch {
    group: NotifyGroup,
}

impl FullTableWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every watcher of this table.
    pub fn notify(&self) {
        self.group.notify();
    }
}

impl Watch for FullTableWatch {
    fn wait(&self, notify_ch: &NotifyCh) {
        self.group.wait(notify_ch);
    }

    fn clear(&self, notify_ch: &NotifyCh) {
        self.group.clear(notify_ch);
    }
}

/// One full-table watch per logical table.
pub type TableWatches = HashMap<Table, FullTableWatch>;

/// Build a watch for every table in [`Table::ALL`].
pub fn table_watches() -> TableWatches {
    Table::ALL
        .into_iter()
        .map(|table| (table, FullTableWatch::new()))
        .collect()
}

// ── DumbWatchManager ──────────────────────────────────────────────

/// Collects the tables touched by one write transaction so that each
/// table's watch fires once at commit, no matter how many times nested
/// code armed it.
///
/// A manager belongs to a single transaction; [`notify`](Self::notify)
/// consumes it.
#[derive(Debug)]
pub struct DumbWatchManager<'a> {
    table_watches: &'a TableWatches,
    armed: BTreeSet<Table>,
}

impl<'a> DumbWatchManager<'a> {
    pub fn new(table_watches: &'a TableWatches) -> Self {
        Self {
            table_watches,
            armed: BTreeSet::new(),
        }
    }

    /// Mark `table` as changed. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if the manager was built without a watch for `table`.
    pub fn arm(&mut self, table: Table) {
        assert!(
            self.table_watches.contains_key(&table),
            "no watch registered for table {table}"
        );
        self.armed.insert(table);
    }

    pub fn is_armed(&self, table: Table) -> bool {
        self.armed.contains(&table)
    }

    /// Fire the watch of every armed table exactly once.
    pub fn notify(self) {
        for table in &self.armed {
            if let Some(watch) = self.table_watches.get(table) {
                trace!(%table, "firing table watch");
                watch.notify();
            }
        }
    }
}

// ── PrefixWatch ───────────────────────────────────────────────────

/// Maintains a notify group per key prefix, for watches narrower than a
/// whole table.
#[derive(Debug, Default)]
pub struct PrefixWatch {
    watches: Mutex<PrefixMap<Arc<NotifyGroup>>>,
}

impl PrefixWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the group registered at exactly `prefix`, creating it if
    /// needed.
    pub fn get_subwatch(&self, prefix: &str) -> Arc<NotifyGroup> {
        let mut watches = self.watches.lock().expect("prefix watch lock");
        if let Some(group) = watches.get(prefix) {
            return group.clone();
        }
        let group = Arc::new(NotifyGroup::new());
        watches.insert(prefix, group.clone());
        group
    }

    /// Wake the watchers of `prefix` and of every ancestor prefix. With
    /// `subtree`, also wake every watcher below `prefix` (used when a whole
    /// tree is removed).
    ///
    /// Fired groups are dropped from the map, except the root group at
    /// `""`; a later [`get_subwatch`](Self::get_subwatch) creates a fresh
    /// one.
    pub fn notify(&self, prefix: &str, subtree: bool) {
        let mut watches = self.watches.lock().expect("prefix watch lock");

        let mut cleanup: Vec<String> = Vec::new();
        let mut fire = |key: &str, group: &Arc<NotifyGroup>| {
            group.notify();
            if !key.is_empty() {
                cleanup.push(key.to_string());
            }
        };

        watches.walk_path(prefix, &mut fire);
        if subtree {
            watches.walk_prefix(prefix, &mut fire);
        }
        trace!(prefix, subtree, fired = cleanup.len(), "prefix watch notified");

        for key in cleanup.iter().rev() {
            watches.remove(key);
        }
    }

    /// Number of prefixes that currently hold a group.
    pub fn len(&self) -> usize {
        self.watches.lock().expect("prefix watch lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A [`Watch`] on `prefix` that stays usable across wakes.
    pub fn subscribe(&self, prefix: &str) -> PrefixSubwatch<'_> {
        PrefixSubwatch {
            watches: self,
            prefix: prefix.to_string(),
            group: Mutex::new(None),
        }
    }
}

/// A watch on one prefix of a [`PrefixWatch`].
///
/// Firing a prefix drops its group from the map, so a handle to the group
/// itself goes dead after one wake. This looks the group up again on every
/// `wait` and remembers it for `clear`.
#[derive(Debug)]
pub struct PrefixSubwatch<'a> {
    watches: &'a PrefixWatch,
    prefix: String,
    group: Mutex<Option<Arc<NotifyGroup>>>,
}

impl Watch for PrefixSubwatch<'_> {
    fn wait(&self, notify_ch: &NotifyCh) {
        let group = self.watches.get_subwatch(&self.prefix);
        group.wait(notify_ch);
        let mut current = self.group.lock().expect("prefix subwatch lock");
        let previous = current.replace(group.clone());
        if let Some(previous) = previous.filter(|p| !Arc::ptr_eq(p, &group)) {
            previous.clear(notify_ch);
        }
    }

    fn clear(&self, notify_ch: &NotifyCh) {
        let group = self.group.lock().expect("prefix subwatch lock").take();
        if let Some(group) = group {
            group.clear(notify_ch);
        }
    }
}
