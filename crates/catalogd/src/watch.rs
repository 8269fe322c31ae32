//! One-shot blocking watch on a catalog table.

use std::time::Duration;

use anyhow::anyhow;
use serde::Serialize;
use tracing::info;

use catalog_state::config::parse_duration;
use catalog_state::{CatalogConfig, StateStore, Table, blocking_query};

#[derive(Debug, Serialize, PartialEq)]
pub struct WatchOutcome {
    pub table: String,
    pub index: u64,
    pub timed_out: bool,
}

/// Parse the `--wait` flag and clamp it to the configured limits.
pub fn requested_wait(config: &CatalogConfig, wait: &str) -> anyhow::Result<Duration> {
    let requested = parse_duration(wait).ok_or_else(|| anyhow!("invalid wait duration: {wait:?}"))?;
    Ok(config.query.clamp_wait(requested)?)
}

/// Wait until `table` moves past `min_index` or `wait` runs out.
pub async fn run(
    store: &StateStore,
    table: Table,
    min_index: u64,
    wait: Duration,
) -> anyhow::Result<WatchOutcome> {
    info!(%table, min_index, ?wait, "watching table");
    let result = blocking_query(&[store.table_watch(table)], min_index, wait, || {
        Ok((store.max_index(table)?, ()))
    })
    .await?;
    info!(%table, index = result.index, timed_out = result.timed_out, "watch returned");
    Ok(WatchOutcome {
        table: table.to_string(),
        index: result.index,
        timed_out: result.timed_out,
    })
}
