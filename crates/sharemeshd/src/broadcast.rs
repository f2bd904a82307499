//! Ingestion and fan-out of shared records
//!
//! Every record, whether submitted locally, gossiped by the upstream, or
//! replayed during catch-up, enters through [`GossipBroadcaster::receive`].
//! A record is forwarded only after it was newly stored; a duplicate stops
//! there, which is what keeps records from circling the mesh.

use crate::link::LinkManager;
use crate::storage::{RecordStore, StorageError};
use parking_lot::Mutex;
use sharemesh_core::{authenticate, unix_now, validate, SharedRecord, ValidateOptions};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the subscriber fan-out channel
pub const SUBSCRIBER_CAPACITY: usize = 1024;

/// Validated records held back while the store is unavailable
pub const DEFERRED_CAPACITY: usize = 1024;

/// Freshness window a record is judged by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Live gossip: the submission window
    Live,
    /// Catch-up replay: the lookback window
    CatchUp,
}

/// What became of a received record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stored,
    Duplicate,
    Rejected(Vec<String>),
    /// Missing `id` or `created`
    Incomplete,
    /// Valid, but the store is not reachable yet; held for
    /// [`GossipBroadcaster::retry_deferred`]
    Deferred,
}

/// Direct submission failures
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Authentication failed: {0}")]
    Authentication(#[source] sharemesh_core::Error),
    #[error("Malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid record: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("Record id already taken: {0}")]
    Conflict(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SubmitError {
    /// Whether the submitter is at fault (as opposed to this node)
    pub fn is_caller_fault(&self) -> bool {
        !matches!(self, SubmitError::Storage(_))
    }
}

/// Ingestion tuning
#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    /// Oldest accepted `created` for submissions and live gossip
    pub submission_max_age_secs: i64,
    /// Oldest accepted `created` for catch-up replay
    pub lookback_secs: i64,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            submission_max_age_secs: sharemesh_core::validate::SUBMISSION_MAX_AGE_SECS,
            lookback_secs: 24 * 60 * 60,
        }
    }
}

/// Ingestion counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub stored: u64,
    pub duplicate: u64,
    pub rejected: u64,
    pub incomplete: u64,
    pub deferred: u64,
}

/// Stores new records and passes them on
pub struct GossipBroadcaster {
    store: Arc<RecordStore>,
    links: Arc<LinkManager>,
    subscribers: broadcast::Sender<SharedRecord>,
    options: BroadcastOptions,
    stored: AtomicU64,
    duplicate: AtomicU64,
    rejected: AtomicU64,
    incomplete: AtomicU64,
    deferred: Mutex<VecDeque<SharedRecord>>,
}

impl GossipBroadcaster {
    pub fn new(store: Arc<RecordStore>, links: Arc<LinkManager>, options: BroadcastOptions) -> Self {
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            store,
            links,
            subscribers,
            options,
            stored: AtomicU64::new(0),
            duplicate: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            incomplete: AtomicU64::new(0),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn options(&self) -> &BroadcastOptions {
        &self.options
    }

    /// Live feed of newly stored records, for downstream subscriber sessions
    pub fn subscribe(&self) -> broadcast::Receiver<SharedRecord> {
        self.subscribers.subscribe()
    }

    /// Ingest a record from a peer. A valid record that meets an unavailable
    /// store is deferred; other storage failures besides a duplicate id are
    /// returned as errors.
    pub async fn receive(&self, record: SharedRecord, freshness: Freshness) -> Result<Outcome, StorageError> {
        if !record.is_self_describing() {
            debug!("Dropping record without id or created");
            self.incomplete.fetch_add(1, Ordering::Relaxed);
            return Ok(Outcome::Incomplete);
        }

        let violations = validate(&record, &self.window(freshness, unix_now()));
        if !violations.is_empty() {
            debug!("Rejected record {:?}: {}", record.id, violations.join("; "));
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(Outcome::Rejected(violations));
        }

        // Kept for deferral; the store consumes its copy
        let pending = record.clone();
        match self.store.create(record).await {
            Ok(stored) => {
                self.forward(stored);
                Ok(Outcome::Stored)
            }
            Err(StorageError::Duplicate(id)) => {
                debug!("Duplicate record {}", id);
                self.duplicate.fetch_add(1, Ordering::Relaxed);
                Ok(Outcome::Duplicate)
            }
            Err(e @ StorageError::Unavailable { .. }) => {
                debug!("Deferring record {:?}: {}", pending.id, e);
                self.defer(pending);
                Ok(Outcome::Deferred)
            }
            Err(e) => Err(e),
        }
    }

    /// Accept a signed submission from a client. `raw` is the exact body the
    /// signature covers.
    pub async fn submit(
        &self,
        raw: &[u8],
        public_key_b64: &str,
        signature_b64: &str,
    ) -> Result<SharedRecord, SubmitError> {
        let key = authenticate(raw, public_key_b64, signature_b64).map_err(SubmitError::Authentication)?;
        let mut record: SharedRecord = serde_json::from_slice(raw)?;

        let now = unix_now();
        record.public_key = Some(key.as_base64().to_string());
        record.created.get_or_insert(now);

        let violations = validate(
            &record,
            &ValidateOptions::submission(now, self.options.submission_max_age_secs),
        );
        if !violations.is_empty() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::Validation(violations));
        }

        let stored = match self.store.create(record).await {
            Ok(stored) => stored,
            Err(StorageError::Duplicate(id)) => return Err(SubmitError::Conflict(id)),
            Err(e) => return Err(e.into()),
        };
        info!("Accepted submission {:?} from {}", stored.id, key.as_base64());
        self.forward(stored.clone());
        Ok(stored)
    }

    /// Store records deferred while the store was unavailable, in arrival
    /// order. Stops at the first failure and keeps the rest for next time.
    /// Returns how many were newly stored.
    pub async fn retry_deferred(&self) -> Result<usize, StorageError> {
        let pending: Vec<SharedRecord> = self.deferred.lock().drain(..).collect();
        let mut stored = 0;
        let mut pending = pending.into_iter();

        while let Some(record) = pending.next() {
            match self.store.create(record.clone()).await {
                Ok(record) => {
                    self.forward(record);
                    stored += 1;
                }
                Err(StorageError::Duplicate(id)) => {
                    debug!("Deferred record {} arrived meanwhile", id);
                    self.duplicate.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let mut deferred = self.deferred.lock();
                    for record in std::iter::once(record).chain(pending).rev() {
                        deferred.push_front(record);
                    }
                    return Err(e);
                }
            }
        }

        if stored > 0 {
            info!("Stored {} deferred record(s)", stored);
        }
        Ok(stored)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            stored: self.stored.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            incomplete: self.incomplete.load(Ordering::Relaxed),
            deferred: self.deferred.lock().len() as u64,
        }
    }

    fn defer(&self, record: SharedRecord) {
        let mut deferred = self.deferred.lock();
        if deferred.len() >= DEFERRED_CAPACITY {
            if let Some(dropped) = deferred.pop_front() {
                warn!("Deferred queue full, dropping record {:?}", dropped.id);
            }
        }
        deferred.push_back(record);
    }

    fn window(&self, freshness: Freshness, now: i64) -> ValidateOptions {
        match freshness {
            Freshness::Live => ValidateOptions::submission(now, self.options.submission_max_age_secs),
            Freshness::CatchUp => ValidateOptions::catch_up(now, self.options.lookback_secs),
        }
    }

    fn forward(&self, record: SharedRecord) {
        self.stored.fetch_add(1, Ordering::Relaxed);
        self.links.forward_downstream(&record);
        // No subscribers is not an error
        let _ = self.subscribers.send(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreOptions;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::{Signature, SigningKey};
    use rand::rngs::OsRng;
    use sha2::{Digest, Sha256};
    use sharemesh_net::PeerRole;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::mpsc;

    fn broadcaster() -> (GossipBroadcaster, TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::new(dir.path(), StoreOptions::default()));
        let broadcaster = GossipBroadcaster::new(store, Arc::new(LinkManager::new()), BroadcastOptions::default());
        (broadcaster, dir)
    }

    fn record(id: &str, created: i64) -> SharedRecord {
        let mut record = SharedRecord::new("https://example.org/a", "text/html");
        record.id = Some(id.to_string());
        record.created = Some(created);
        record
    }

    fn signed(key: &SigningKey, body: &[u8]) -> (String, String) {
        let signature: Signature = key.sign_prehash(&Sha256::digest(body)).unwrap();
        let public = STANDARD.encode(key.verifying_key().to_encoded_point(true).as_bytes());
        (public, STANDARD.encode(signature.to_bytes()))
    }

    #[tokio::test]
    async fn test_receive_is_idempotent() {
        let (broadcaster, _dir) = broadcaster();
        let mut feed = broadcaster.subscribe();
        let now = unix_now();

        assert_eq!(broadcaster.receive(record("x", now), Freshness::Live).await.unwrap(), Outcome::Stored);
        assert_eq!(broadcaster.receive(record("x", now), Freshness::Live).await.unwrap(), Outcome::Duplicate);

        assert_eq!(broadcaster.store().len().await.unwrap(), 1);
        assert_eq!(feed.recv().await.unwrap().id.as_deref(), Some("x"));
        assert!(feed.try_recv().is_err());

        let stats = broadcaster.stats();
        assert_eq!((stats.stored, stats.duplicate), (1, 1));
    }

    #[tokio::test]
    async fn test_echo_is_not_forwarded_again() {
        let (broadcaster, _dir) = broadcaster();
        let (tx, mut rx) = mpsc::channel(8);
        let links = &broadcaster.links;
        let generation = links.begin_connect(PeerRole::Downstream, "b:1").unwrap();
        links.mark_connected(PeerRole::Downstream, generation, Some(tx));

        let now = unix_now();
        broadcaster.receive(record("r1", now), Freshness::Live).await.unwrap();
        // The record comes back around the ring
        let echo = broadcaster.receive(record("r1", now), Freshness::Live).await.unwrap();
        assert_eq!(echo, Outcome::Duplicate);

        assert_eq!(rx.recv().await.unwrap().id.as_deref(), Some("r1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_incomplete_and_invalid_records_dropped() {
        let (broadcaster, _dir) = broadcaster();
        let now = unix_now();

        let mut anonymous = record("x", now);
        anonymous.id = None;
        assert_eq!(broadcaster.receive(anonymous, Freshness::Live).await.unwrap(), Outcome::Incomplete);

        let stale = record("old", now - 3600);
        let Outcome::Rejected(violations) = broadcaster.receive(stale.clone(), Freshness::Live).await.unwrap() else {
            panic!("stale live record accepted");
        };
        assert_eq!(violations, vec!["\"created\" date is too old".to_string()]);

        // The same record is fine inside the catch-up window
        assert_eq!(broadcaster.receive(stale, Freshness::CatchUp).await.unwrap(), Outcome::Stored);

        let stats = broadcaster.stats();
        assert_eq!((stats.incomplete, stats.rejected, stats.stored), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_extreme_created_rejected() {
        let (broadcaster, _dir) = broadcaster();

        for freshness in [Freshness::Live, Freshness::CatchUp] {
            let outcome = broadcaster.receive(record("early", i64::MIN), freshness).await.unwrap();
            assert_eq!(outcome, Outcome::Rejected(vec!["\"created\" date is too old".to_string()]));

            let outcome = broadcaster.receive(record("late", i64::MAX), freshness).await.unwrap();
            assert_eq!(outcome, Outcome::Rejected(vec!["\"created\" date is in the future".to_string()]));
        }
        assert_eq!(broadcaster.store().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gossip_deferred_until_store_reachable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        std::fs::write(&path, b"not a directory").unwrap();
        let store = Arc::new(RecordStore::new(
            &path,
            StoreOptions {
                provision_attempts: 1,
                provision_backoff: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        let broadcaster = GossipBroadcaster::new(store, Arc::new(LinkManager::new()), BroadcastOptions::default());
        let mut feed = broadcaster.subscribe();
        let now = unix_now();

        assert_eq!(broadcaster.receive(record("a", now), Freshness::Live).await.unwrap(), Outcome::Deferred);
        assert_eq!(broadcaster.receive(record("b", now), Freshness::Live).await.unwrap(), Outcome::Deferred);
        assert_eq!(broadcaster.stats().deferred, 2);

        // Still unreachable: nothing is lost
        assert!(broadcaster.retry_deferred().await.is_err());
        assert_eq!(broadcaster.stats().deferred, 2);

        std::fs::remove_file(&path).unwrap();
        assert_eq!(broadcaster.retry_deferred().await.unwrap(), 2);
        assert_eq!(broadcaster.store().len().await.unwrap(), 2);
        assert_eq!(feed.recv().await.unwrap().id.as_deref(), Some("a"));
        assert_eq!(feed.recv().await.unwrap().id.as_deref(), Some("b"));

        let stats = broadcaster.stats();
        assert_eq!((stats.stored, stats.deferred), (2, 0));
        assert_eq!(broadcaster.retry_deferred().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submit_with_taken_id_is_caller_fault() {
        let (broadcaster, _dir) = broadcaster();
        let key = SigningKey::random(&mut OsRng);
        let body = br#"{"id":"fixed","content":{"url":"https://example.org/a","mimeType":"text/html"}}"#;
        let (public, signature) = signed(&key, body);

        broadcaster.submit(body, &public, &signature).await.unwrap();
        let err = broadcaster.submit(body, &public, &signature).await.unwrap_err();
        assert!(matches!(&err, SubmitError::Conflict(id) if id == "fixed"));
        assert!(err.is_caller_fault());
        assert_eq!(broadcaster.store().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_submit_stamps_key_and_created() {
        let (broadcaster, _dir) = broadcaster();
        let key = SigningKey::random(&mut OsRng);
        let body = br#"{"content":{"url":"https://example.org/a","mimeType":"text/html"}}"#;
        let (public, signature) = signed(&key, body);

        let stored = broadcaster.submit(body, &public, &signature).await.unwrap();
        assert_eq!(stored.public_key.as_deref(), Some(public.as_str()));
        assert!(stored.id.is_some());
        assert!((stored.created.unwrap() - unix_now()).abs() <= 5);

        let fetched = broadcaster.store().get(stored.id.as_deref().unwrap()).await.unwrap();
        assert_eq!(fetched, Some(stored));
    }

    #[tokio::test]
    async fn test_tampered_submission_never_stored() {
        let (broadcaster, _dir) = broadcaster();
        let key = SigningKey::random(&mut OsRng);
        let body = br#"{"content":{"url":"https://example.org/a","mimeType":"text/html"}}"#.to_vec();
        let (public, signature) = signed(&key, &body);

        let mut tampered = body.clone();
        let last = tampered.len() - 3;
        tampered[last] ^= 0x01;

        let err = broadcaster.submit(&tampered, &public, &signature).await.unwrap_err();
        assert!(matches!(err, SubmitError::Authentication(_)));
        assert!(err.is_caller_fault());
        assert_eq!(broadcaster.store().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_records() {
        let (broadcaster, _dir) = broadcaster();
        let key = SigningKey::random(&mut OsRng);

        let unknown_field = br#"{"content":{"url":"https://a.org","mimeType":"text/html"},"bogus":1}"#;
        let (public, signature) = signed(&key, unknown_field);
        assert!(matches!(
            broadcaster.submit(unknown_field, &public, &signature).await,
            Err(SubmitError::Malformed(_))
        ));

        let both = br#"{"content":{"url":"https://a.org","mimeType":"text/html","width":10,"widthRange":{"gte":5}}}"#;
        let (public, signature) = signed(&key, both);
        let Err(SubmitError::Validation(violations)) = broadcaster.submit(both, &public, &signature).await else {
            panic!("conflicting width accepted");
        };
        assert_eq!(violations.len(), 1);
        assert_eq!(broadcaster.store().len().await.unwrap(), 0);
    }
}
