//! catalog-state: versioned service catalog with change notification.
//!
//! Backed by [redb](https://docs.rs/redb), tracks cluster nodes, the
//! services they run, their health checks and a key/value table, and wakes
//! watchers when data they care about changes.
//!
//! # Architecture
//!
//! Each write is one redb write transaction. It stamps rows with the
//! caller-supplied index, advances the per-table index kept in the `index`
//! table and arms watches through a per-transaction [`DumbWatchManager`].
//! Armed watches fire after commit. Readers work from redb snapshots and
//! block on [`Watch`] channels, re-reading after every wake.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod blocking;
pub mod config;
pub mod error;
pub mod prefix_map;
pub mod store;
pub mod tables;
pub mod types;
pub mod watch;

pub use blocking::{QueryResult, blocking_query};
pub use config::CatalogConfig;
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use tables::Table;
pub use types::*;
pub use watch::{
    DumbWatchManager, FullTableWatch, NotifyCh, NotifyGroup, PrefixSubwatch, PrefixWatch, Watch,
    notify_channel,
};
