//! Periodic purge of old terminal jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::io::job_store::JobStore;

/// Purge once now. Returns how many jobs were removed.
pub fn sweep_once(store: &JobStore, retention: Duration) -> Result<usize> {
    let purged = store.purge_older_than(retention, Utc::now())?;
    if !purged.is_empty() {
        info!(
            purged = purged.len(),
            retention_secs = retention.as_secs(),
            "purged expired jobs"
        );
    }
    Ok(purged.len())
}

/// Sweep every `interval` until `shutdown` fires. The first sweep runs
/// immediately.
pub async fn run_retention_loop(
    store: Arc<JobStore>,
    retention: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(err) = sweep_once(&store, retention) {
            warn!(err = %format!("{err:#}"), "retention sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::JobState;
    use crate::core::types::{TransferOp, TransferSpec};

    fn spec() -> TransferSpec {
        TransferSpec {
            op: TransferOp::Move,
            source: "a:".to_string(),
            destination: "b:".to_string(),
            flags: Vec::new(),
        }
    }

    #[test]
    fn sweep_keeps_recent_jobs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (store, _) = JobStore::open(temp.path()).expect("open");
        let job = store.create(spec()).expect("create");
        store
            .compare_and_transition(job.id, JobState::Pending, JobState::Canceled, |_| {})
            .expect("cancel");

        assert_eq!(sweep_once(&store, Duration::from_secs(60)).expect("sweep"), 0);
        assert!(store.load(job.id).is_some());
    }

    #[test]
    fn zero_window_purges_terminal_but_not_pending() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (store, _) = JobStore::open(temp.path()).expect("open");
        let done = store.create(spec()).expect("create");
        let pending = store.create(spec()).expect("create");
        store
            .compare_and_transition(done.id, JobState::Pending, JobState::Canceled, |_| {})
            .expect("cancel");
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(sweep_once(&store, Duration::ZERO).expect("sweep"), 1);
        assert!(store.load(done.id).is_none());
        assert!(store.load(pending.id).is_some());
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (store, _) = JobStore::open(temp.path()).expect("open");
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_retention_loop(
            Arc::new(store),
            Duration::from_secs(60),
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        handle.await.expect("join");
    }
}
