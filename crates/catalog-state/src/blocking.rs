//! Blocking ("long-poll") queries over the catalog.
//!
//! A caller that already holds a result at index `N` asks to be answered
//! only once something newer than `N` exists, or once its wait runs out.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::trace;

use crate::error::StateResult;
use crate::watch::{NotifyCh, Watch, notify_channel};

/// The answer to a blocking query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    /// Index the value was read at.
    pub index: u64,
    pub value: T,
    /// True when the wait expired without the index passing `min_index`.
    pub timed_out: bool,
}

/// Run `query` until its index exceeds `min_index` or `wait` elapses.
///
/// `query` returns the current index alongside the value. With
/// `min_index == 0` it runs once and returns immediately. Otherwise the
/// caller's channel is registered on every watch before each query run, so
/// a commit landing between the read and the wait still wakes it. On
/// timeout the latest result is returned with `timed_out` set.
pub async fn blocking_query<T, F>(
    watches: &[&dyn Watch],
    min_index: u64,
    wait: Duration,
    mut query: F,
) -> StateResult<QueryResult<T>>
where
    F: FnMut() -> StateResult<(u64, T)>,
{
    let (notify_ch, mut notify_rx) = notify_channel();
    let deadline = Instant::now() + wait;

    let result = run(watches, &notify_ch, &mut notify_rx, min_index, deadline, &mut query).await;

    for watch in watches {
        watch.clear(&notify_ch);
    }
    result
}

async fn run<T, F>(
    watches: &[&dyn Watch],
    notify_ch: &NotifyCh,
    notify_rx: &mut mpsc::Receiver<()>,
    min_index: u64,
    deadline: Instant,
    query: &mut F,
) -> StateResult<QueryResult<T>>
where
    F: FnMut() -> StateResult<(u64, T)>,
{
    loop {
        for watch in watches {
            watch.wait(notify_ch);
        }

        let (index, value) = query()?;
        if min_index == 0 || index > min_index {
            return Ok(QueryResult {
                index,
                value,
                timed_out: false,
            });
        }

        if timeout_at(deadline, notify_rx.recv()).await.is_err() {
            trace!(min_index, index, "blocking query timed out");
            return Ok(QueryResult {
                index,
                value,
                timed_out: true,
            });
        }
        trace!(min_index, "blocking query woken");
    }
}
