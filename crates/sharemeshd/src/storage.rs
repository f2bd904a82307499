//! Time-sharded record store using sled
//!
//! Records live in one sled tree per UTC day of `created` (`shard/YYYY-MM-DD`).
//! Keys are `created || id` so every shard iterates in time order, and shards
//! partition time, so a sorted scan can stop as soon as it has enough
//! records. A global `index` tree maps every id to its key and makes `id` the
//! single deduplication key.
//!
//! The database is opened lazily: the first call provisions it (open, check
//! or write the shard template) and later calls retry until that succeeds once.

use chrono::{DateTime, Days, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sharemesh_core::SharedRecord;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tree name prefix of day shards
pub const SHARD_PREFIX: &str = "shard/";
const SHARD_DATE_FORMAT: &str = "%Y-%m-%d";
const TEMPLATE_KEY: &[u8] = b"template";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    #[error("Record has no created timestamp")]
    MissingCreated,
    #[error("Created timestamp out of range: {0}")]
    InvalidCreated(i64),
    #[error("Shard template mismatch: stored version {0}")]
    TemplateMismatch(u32),
    #[error("Store unavailable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },
}

/// Layout shared by every shard, persisted once at provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTemplate {
    pub version: u32,
    pub key_layout: String,
    pub encoding: String,
}

impl ShardTemplate {
    pub fn current() -> Self {
        Self {
            version: 1,
            key_layout: "created_be64||id".to_string(),
            encoding: "json".to_string(),
        }
    }
}

/// Store tuning
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Retention window in days
    pub max_days: u32,
    /// Provisioning attempts per call before giving up
    pub provision_attempts: u32,
    /// Delay between provisioning attempts
    pub provision_backoff: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_days: 7,
            provision_attempts: 5,
            provision_backoff: Duration::from_millis(500),
        }
    }
}

/// Query filter, all conditions must hold
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Inclusive lower bound on `created`
    pub created_from: Option<i64>,
    /// Exclusive upper bound on `created`
    pub created_before: Option<i64>,
    pub public_key: Option<String>,
    pub external_ref: Option<String>,
    pub tag: Option<String>,
}

impl RecordFilter {
    pub fn since(created_from: i64) -> Self {
        Self {
            created_from: Some(created_from),
            ..Default::default()
        }
    }

    fn matches(&self, record: &SharedRecord) -> bool {
        let created = record.created.unwrap_or_default();
        self.created_from.map_or(true, |from| created >= from)
            && self.created_before.map_or(true, |before| created < before)
            && self
                .public_key
                .as_ref()
                .map_or(true, |key| record.public_key.as_ref() == Some(key))
            && self
                .external_ref
                .as_ref()
                .map_or(true, |r| record.external_ref.as_ref() == Some(r))
            && self
                .tag
                .as_ref()
                .map_or(true, |tag| record.tags().contains(tag))
    }

    fn may_match_day(&self, day: NaiveDate) -> bool {
        let after_start = match self.created_from.and_then(utc_day) {
            Some(first) => day >= first,
            None => true,
        };
        let before_end = match self.created_before.and_then(utc_day) {
            Some(last) => day <= last,
            None => true,
        };
        after_start && before_end
    }
}

/// Sort order on `created`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    CreatedAsc,
    CreatedDesc,
}

#[derive(Clone)]
struct Backend {
    db: Db,
    index: Tree,
}

/// Time-sharded persistence for shared records
pub struct RecordStore {
    path: PathBuf,
    options: StoreOptions,
    backend: RwLock<Option<Backend>>,
    provisioning: Mutex<()>,
}

impl RecordStore {
    /// Create a store rooted at `path`. Nothing is opened until first use.
    pub fn new(path: impl AsRef<Path>, options: StoreOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options,
            backend: RwLock::new(None),
            provisioning: Mutex::new(()),
        }
    }

    /// Retention window in days
    pub fn max_days(&self) -> u32 {
        self.options.max_days
    }

    /// Whether provisioning has succeeded
    pub fn is_provisioned(&self) -> bool {
        self.backend.read().is_some()
    }

    /// Insert a new record. A caller-supplied id that already exists yields
    /// `Duplicate`; a missing id is minted. Returns the stored record.
    pub async fn create(&self, mut record: SharedRecord) -> Result<SharedRecord, StorageError> {
        let created = record.created.ok_or(StorageError::MissingCreated)?;
        let day = utc_day(created).ok_or(StorageError::InvalidCreated(created))?;
        let backend = self.backend().await?;

        let id = match &record.id {
            Some(id) => id.clone(),
            None => {
                let id = mint_id(created);
                record.id = Some(id.clone());
                id
            }
        };

        let shard = backend.db.open_tree(shard_name(day))?;
        let key = record_key(created, &id);
        let value = serde_json::to_vec(&record)?;

        let result = (&backend.index, &shard).transaction(|(index, shard)| {
            if index.get(id.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(()));
            }
            index.insert(id.as_bytes(), key.as_slice())?;
            shard.insert(key.as_slice(), value.as_slice())?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(record),
            Err(TransactionError::Abort(())) => Err(StorageError::Duplicate(id)),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Look up one record by id
    pub async fn get(&self, id: &str) -> Result<Option<SharedRecord>, StorageError> {
        let backend = self.backend().await?;
        let Some(key) = backend.index.get(id.as_bytes())? else {
            return Ok(None);
        };
        let created = key_created(&key);
        let day = utc_day(created).ok_or(StorageError::InvalidCreated(created))?;
        let shard = backend.db.open_tree(shard_name(day))?;
        match shard.get(&key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Query all shards as one collection
    pub async fn find(
        &self,
        filter: &RecordFilter,
        sort: SortOrder,
        limit: usize,
    ) -> Result<Vec<SharedRecord>, StorageError> {
        let backend = self.backend().await?;
        let mut records = Vec::new();
        if limit == 0 {
            return Ok(records);
        }

        let mut days = shard_days(&backend.db);
        if sort == SortOrder::CreatedDesc {
            days.reverse();
        }

        for day in days.into_iter().filter(|day| filter.may_match_day(*day)) {
            let shard = backend.db.open_tree(shard_name(day))?;
            let entries: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
                match sort {
                    SortOrder::CreatedAsc => Box::new(shard.iter()),
                    SortOrder::CreatedDesc => Box::new(shard.iter().rev()),
                };
            for entry in entries {
                let (_, bytes) = entry?;
                let record: SharedRecord = serde_json::from_slice(&bytes)?;
                if filter.matches(&record) {
                    records.push(record);
                    if records.len() >= limit {
                        return Ok(records);
                    }
                }
            }
        }

        Ok(records)
    }

    /// Most recently created record
    pub async fn find_latest(&self) -> Result<Option<SharedRecord>, StorageError> {
        let mut latest = self
            .find(&RecordFilter::default(), SortOrder::CreatedDesc, 1)
            .await?;
        Ok(latest.pop())
    }

    /// Number of stored records
    pub async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.backend().await?.index.len())
    }

    /// Days that currently have a shard, oldest first
    pub async fn shard_days(&self) -> Result<Vec<NaiveDate>, StorageError> {
        Ok(shard_days(&self.backend().await?.db))
    }

    /// Drop every shard outside `[today - max_days, today]`. Returns the
    /// evicted days.
    pub async fn evict(&self, today: NaiveDate) -> Result<Vec<NaiveDate>, StorageError> {
        let backend = self.backend().await?;
        let oldest = today
            .checked_sub_days(Days::new(u64::from(self.options.max_days)))
            .unwrap_or(NaiveDate::MIN);

        let mut evicted = Vec::new();
        for day in shard_days(&backend.db) {
            if day >= oldest && day <= today {
                continue;
            }
            let name = shard_name(day);
            let shard = backend.db.open_tree(&name)?;
            for key in shard.iter().keys() {
                let key = key?;
                let id = &key[8..];
                if backend.index.get(id)?.as_deref() == Some(&key[..]) {
                    backend.index.remove(id)?;
                }
            }
            backend.db.drop_tree(&name)?;
            debug!("Evicted shard {}", name);
            evicted.push(day);
        }

        if !evicted.is_empty() {
            info!("Evicted {} shard(s) older than {}", evicted.len(), oldest);
        }
        Ok(evicted)
    }

    /// Flush all pending writes
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.backend().await?.db.flush_async().await?;
        Ok(())
    }

    /// Provisioned backend, provisioning (with deferral) if needed
    async fn backend(&self) -> Result<Backend, StorageError> {
        if let Some(backend) = self.backend.read().as_ref() {
            return Ok(backend.clone());
        }

        let attempts = self.options.provision_attempts.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match self.provision() {
                Ok(backend) => return Ok(backend),
                Err(e) => {
                    warn!(
                        "Store at {} not ready (attempt {}/{}): {}",
                        self.path.display(),
                        attempt,
                        attempts,
                        e
                    );
                    reason = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.provision_backoff).await;
            }
        }

        Err(StorageError::Unavailable { attempts, reason })
    }

    fn provision(&self) -> Result<Backend, StorageError> {
        let _guard = self.provisioning.lock();
        if let Some(backend) = self.backend.read().as_ref() {
            return Ok(backend.clone());
        }

        let db = sled::open(&self.path)?;
        let meta = db.open_tree("meta")?;
        let template = ShardTemplate::current();
        match meta.get(TEMPLATE_KEY)? {
            Some(bytes) => {
                let stored: ShardTemplate = serde_json::from_slice(&bytes)?;
                if stored != template {
                    return Err(StorageError::TemplateMismatch(stored.version));
                }
            }
            None => {
                meta.insert(TEMPLATE_KEY, serde_json::to_vec(&template)?)?;
            }
        }
        let index = db.open_tree("index")?;

        let backend = Backend { db, index };
        *self.backend.write() = Some(backend.clone());
        info!("Record store provisioned at {}", self.path.display());
        Ok(backend)
    }
}

/// UTC calendar day of a unix timestamp
pub fn utc_day(created: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(created, 0).map(|dt| dt.date_naive())
}

fn shard_name(day: NaiveDate) -> String {
    format!("{SHARD_PREFIX}{}", day.format(SHARD_DATE_FORMAT))
}

fn shard_days(db: &Db) -> Vec<NaiveDate> {
    let mut days: Vec<NaiveDate> = db
        .tree_names()
        .iter()
        .filter_map(|name| std::str::from_utf8(name).ok())
        .filter_map(|name| name.strip_prefix(SHARD_PREFIX))
        .filter_map(|day| NaiveDate::parse_from_str(day, SHARD_DATE_FORMAT).ok())
        .collect();
    days.sort();
    days
}

/// Sign-flipped big-endian `created` so byte order matches numeric order
fn record_key(created: i64, id: &str) -> Vec<u8> {
    let mut key = ((created as u64) ^ (1 << 63)).to_be_bytes().to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn key_created(key: &[u8]) -> i64 {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&key[..8]);
    (u64::from_be_bytes(prefix) ^ (1 << 63)) as i64
}

/// Roughly time-ordered id: hex `created` followed by random bytes
fn mint_id(created: i64) -> String {
    format!(
        "{:016x}{}",
        created.max(0) as u64,
        hex::encode(rand::random::<[u8; 8]>())
    )
}
