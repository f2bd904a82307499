//! Anti-entropy catch-up over a fresh upstream link
//!
//! On connecting to an upstream, a node asks for every record created since
//! its own newest one (bounded by the lookback window) and replays the answer
//! through the broadcaster with catch-up freshness. One page per connection.

use crate::broadcast::{Freshness, GossipBroadcaster, Outcome};
use crate::storage::{RecordFilter, RecordStore, SortOrder, StorageError};
use sharemesh_net::{GetHistory, History};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Catch-up errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("No history within {0:?}")]
    Timeout(Duration),
    #[error("Upstream link closed before answering")]
    ChannelClosed,
    #[error("History answers request {got}, expected {expected}")]
    RequestMismatch { expected: u64, got: u64 },
}

/// Catch-up tuning
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Largest page requested or served
    pub page_size: u32,
    /// Oldest `created` a catch-up reaches back to, in seconds
    pub lookback_secs: i64,
    /// How long to wait for a `History` answer
    pub history_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            lookback_secs: 24 * 60 * 60,
            history_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of replaying one page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub received: usize,
    pub stored: usize,
    pub duplicate: usize,
    pub rejected: usize,
    /// Held back until the store is reachable
    pub deferred: usize,
}

/// Requests, serves and replays history pages
pub struct AntiEntropy {
    broadcaster: Arc<GossipBroadcaster>,
    options: SyncOptions,
    next_request: AtomicU64,
}

impl AntiEntropy {
    pub fn new(broadcaster: Arc<GossipBroadcaster>, options: SyncOptions) -> Self {
        Self {
            broadcaster,
            options,
            next_request: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    fn store(&self) -> &RecordStore {
        self.broadcaster.store()
    }

    fn horizon(&self, now: i64) -> i64 {
        now.saturating_sub(self.options.lookback_secs)
    }

    /// Build the request sent to a new upstream: everything from our newest
    /// record on, never older than the lookback window.
    pub async fn request(&self, now: i64) -> Result<GetHistory, SyncError> {
        let latest = self
            .store()
            .find_latest()
            .await?
            .and_then(|record| record.created);
        let from = latest.map_or(self.horizon(now), |created| created.max(self.horizon(now)));

        Ok(GetHistory {
            request_id: self.next_request.fetch_add(1, Ordering::Relaxed),
            from,
            limit: self.options.page_size,
        })
    }

    /// Answer a downstream's request, oldest first
    pub async fn serve(&self, request: &GetHistory, now: i64) -> Result<History, SyncError> {
        let from = request.from.max(self.horizon(now));
        let limit = request.limit.min(self.options.page_size) as usize;
        let records = self
            .store()
            .find(&RecordFilter::since(from), SortOrder::CreatedAsc, limit)
            .await?;

        debug!(
            "Serving {} record(s) from {} for request {}",
            records.len(),
            from,
            request.request_id
        );
        Ok(History {
            request_id: request.request_id,
            records,
        })
    }

    /// Feed a received page through the broadcaster
    pub async fn replay(&self, history: History) -> Result<ReplayReport, SyncError> {
        let mut report = ReplayReport::default();
        let page = self.options.page_size as usize;
        if history.records.len() > page {
            warn!(
                "History page of {} exceeds {}, truncating",
                history.records.len(),
                page
            );
        }

        for record in history.records.into_iter().take(page) {
            report.received += 1;
            match self.broadcaster.receive(record, Freshness::CatchUp).await? {
                Outcome::Stored => report.stored += 1,
                Outcome::Duplicate => report.duplicate += 1,
                Outcome::Rejected(_) | Outcome::Incomplete => report.rejected += 1,
                Outcome::Deferred => report.deferred += 1,
            }
        }

        if report.stored > 0 {
            info!(
                "Catch-up stored {} of {} record(s)",
                report.stored, report.received
            );
        }
        Ok(report)
    }

    /// Wait for the answer to `request`, then replay it
    pub async fn await_history(
        &self,
        request: &GetHistory,
        rx: oneshot::Receiver<History>,
    ) -> Result<ReplayReport, SyncError> {
        let wait = self.options.history_timeout;
        let history = timeout(wait, rx)
            .await
            .map_err(|_| SyncError::Timeout(wait))?
            .map_err(|_| SyncError::ChannelClosed)?;

        if history.request_id != request.request_id {
            return Err(SyncError::RequestMismatch {
                expected: request.request_id,
                got: history.request_id,
            });
        }
        self.replay(history).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastOptions;
    use crate::link::LinkManager;
    use crate::storage::StoreOptions;
    use sharemesh_core::{unix_now, SharedRecord};
    use tempfile::{tempdir, TempDir};

    fn node(page_size: u32) -> (AntiEntropy, TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::new(dir.path(), StoreOptions::default()));
        let broadcaster = Arc::new(GossipBroadcaster::new(
            store,
            Arc::new(LinkManager::new()),
            BroadcastOptions::default(),
        ));
        let options = SyncOptions {
            page_size,
            history_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        (AntiEntropy::new(broadcaster, options), dir)
    }

    fn record(id: &str, created: i64) -> SharedRecord {
        let mut record = SharedRecord::new("https://example.org/a", "text/html");
        record.id = Some(id.to_string());
        record.created = Some(created);
        record
    }

    async fn seed(sync: &AntiEntropy, records: &[(&str, i64)]) {
        for (id, created) in records {
            sync.store().create(record(id, *created)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_cursor() {
        let (sync, _dir) = node(100);
        let now = unix_now();

        let empty = sync.request(now).await.unwrap();
        assert_eq!(empty.from, now - sync.options().lookback_secs);
        assert_eq!(empty.limit, 100);

        seed(&sync, &[("a", now - 600)]).await;
        let cursor = sync.request(now).await.unwrap();
        assert_eq!(cursor.from, now - 600);
        assert_ne!(cursor.request_id, empty.request_id);

        // Anything older than the lookback window is clamped
        let (old, _old_dir) = node(100);
        seed(&old, &[("b", now - 3 * 24 * 60 * 60)]).await;
        assert_eq!(old.request(now).await.unwrap().from, now - old.options().lookback_secs);
    }

    #[tokio::test]
    async fn test_serve_is_bounded_by_page_size() {
        let (sync, _dir) = node(3);
        let now = unix_now();
        let records: Vec<(String, i64)> = (0..5).map(|i| (format!("r{i}"), now - 100 + i)).collect();
        for (id, created) in &records {
            sync.store().create(record(id, *created)).await.unwrap();
        }

        let request = GetHistory { request_id: 7, from: 0, limit: 50 };
        let history = sync.serve(&request, now).await.unwrap();
        assert_eq!(history.request_id, 7);
        let ids: Vec<_> = history.records.iter().filter_map(|r| r.id.as_deref()).collect();
        assert_eq!(ids, vec!["r0", "r1", "r2"]);

        let narrow = GetHistory { request_id: 8, from: now - 97, limit: 1 };
        let history = sync.serve(&narrow, now).await.unwrap();
        assert_eq!(history.records[0].id.as_deref(), Some("r3"));
        assert_eq!(history.records.len(), 1);
    }

    #[tokio::test]
    async fn test_late_joiner_catches_up() {
        let now = unix_now();
        let (upstream, _up_dir) = node(100);
        let (joiner, _join_dir) = node(100);
        seed(&upstream, &[("x", now - 300), ("y", now - 200), ("z", now - 100)]).await;
        seed(&joiner, &[("x", now - 300)]).await;

        let request = joiner.request(now).await.unwrap();
        let history = upstream.serve(&request, now).await.unwrap();
        let report = joiner.replay(history).await.unwrap();

        assert_eq!(
            report,
            ReplayReport {
                received: 3,
                stored: 2,
                duplicate: 1,
                rejected: 0,
                deferred: 0,
            }
        );
        assert_eq!(joiner.store().len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_empty_joiner_receives_identical_records() {
        let now = unix_now();
        let (upstream, _up_dir) = node(100);
        let (joiner, _join_dir) = node(100);
        for (id, created) in [("x", now - 300), ("y", now - 200), ("z", now - 100)] {
            let mut shared = record(id, created);
            shared.public_key = Some(format!("key-{id}"));
            shared.external_ref = Some(format!("ref-{id}"));
            upstream.store().create(shared).await.unwrap();
        }

        let request = joiner.request(now).await.unwrap();
        assert_eq!(request.from, now - joiner.options().lookback_secs);
        let history = upstream.serve(&request, now).await.unwrap();
        let report = joiner.replay(history).await.unwrap();
        assert_eq!((report.received, report.stored), (3, 3));

        for id in ["x", "y", "z"] {
            let original = upstream.store().get(id).await.unwrap();
            assert!(original.is_some());
            assert_eq!(joiner.store().get(id).await.unwrap(), original);
        }
        assert_eq!(joiner.store().len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_replay_truncates_oversized_page() {
        let (sync, _dir) = node(2);
        let now = unix_now();
        let history = History {
            request_id: 1,
            records: (0..4).map(|i| record(&format!("p{i}"), now - i)).collect(),
        };

        let report = sync.replay(history).await.unwrap();
        assert_eq!(report.received, 2);
        assert_eq!(sync.store().len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_await_history_outcomes() {
        let (sync, _dir) = node(10);
        let request = sync.request(unix_now()).await.unwrap();

        let (_tx, rx) = oneshot::channel::<History>();
        assert!(matches!(
            sync.await_history(&request, rx).await,
            Err(SyncError::Timeout(_))
        ));

        let (tx, rx) = oneshot::channel::<History>();
        drop(tx);
        assert!(matches!(
            sync.await_history(&request, rx).await,
            Err(SyncError::ChannelClosed)
        ));

        let (tx, rx) = oneshot::channel();
        tx.send(History { request_id: request.request_id, records: vec![] }).unwrap();
        assert_eq!(sync.await_history(&request, rx).await.unwrap(), ReplayReport::default());
    }
}
