//! Per-user HNSW index service with buffered ingestion.
//!
//! Writes land in a per-user pending buffer and become searchable
//! immediately; a background ticker (and an immediate trigger when the
//! buffer crosses `max_batch_size`) flushes batches into the persisted
//! structure and writes a fresh snapshot blob plus its sidecar record.
//! A failed flush leaves the buffer untouched; the next tick retries.

use crate::error::{Error, Result};
use crate::index::{self, UserIndex};
use memvault_core::config::{BatchSettings, IndexSettings};
use memvault_store::{BlobId, BlobMeta, BlobStore, KeyedStore, Namespace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Service configuration: index tuning plus buffering policy.
#[derive(Debug, Clone, Default)]
pub struct IndexServiceConfig {
    /// HNSW parameters
    pub index: IndexSettings,
    /// Buffering and eviction policy
    pub batch: BatchSettings,
    /// Deadline for each storage call, in milliseconds
    pub op_timeout_ms: u64,
}

impl IndexServiceConfig {
    /// Build from the two settings sections.
    pub fn new(index: IndexSettings, batch: BatchSettings, op_timeout_ms: u64) -> Self {
        Self {
            index,
            batch,
            op_timeout_ms,
        }
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_millis(if self.op_timeout_ms == 0 {
            10_000
        } else {
            self.op_timeout_ms
        })
    }
}

/// Metadata predicate applied to candidates before results are returned.
pub type MetadataFilter = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// Search parameters.
#[derive(Clone, Default)]
pub struct SearchOptions {
    /// Number of results to return; 0 means the default of 10
    pub k: usize,
    /// Search expansion override (used as the candidate fetch bound)
    pub ef_search: Option<usize>,
    /// Optional metadata predicate
    pub filter: Option<MetadataFilter>,
}

/// Search output: parallel id/distance/similarity/metadata columns.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    /// Matched vector ids, best first
    pub ids: Vec<u32>,
    /// Raw distances in the index space
    pub distances: Vec<f32>,
    /// `1 − d` for cosine, `1/(1+d)` otherwise
    pub similarities: Vec<f32>,
    /// Metadata for each match (`Null` when none was supplied)
    pub metadata: Vec<serde_json::Value>,
}

/// Result of [`HnswIndexService::create_index`].
pub struct CreatedIndex {
    /// The owning user
    pub user_id: String,
    /// Serialized snapshot of the freshly allocated structure
    pub serialized: Vec<u8>,
}

/// Why a flush is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Buffer crossed `max_batch_size`; drains the triggering batch
    Size,
    /// Periodic tick or pending-age trigger; drains everything
    Timer,
    /// Explicit `force_flush`; drains everything
    Force,
    /// Explicit `save_index`; always writes a snapshot
    Save,
}

struct PendingVector {
    vector: Vec<f32>,
    queued_at: Instant,
}

struct UserEntry {
    index: UserIndex,
    /// Sidecar metadata for flushed vectors
    metadata: HashMap<u32, serde_json::Value>,
    /// Buffered vectors, ascending id == arrival order
    pending: BTreeMap<u32, PendingVector>,
    pending_meta: HashMap<u32, serde_json::Value>,
    tombstones: HashSet<u32>,
    version: u64,
    next_vector_id: u32,
    last_access: Instant,
    last_blob: Option<BlobId>,
    immediate_flush: bool,
    flush_in_progress: bool,
    /// Tombstone/metadata changes awaiting persistence
    dirty: bool,
}

impl UserEntry {
    fn fresh(index: UserIndex) -> Self {
        Self {
            index,
            metadata: HashMap::new(),
            pending: BTreeMap::new(),
            pending_meta: HashMap::new(),
            tombstones: HashSet::new(),
            version: 0,
            next_vector_id: 0,
            last_access: Instant::now(),
            last_blob: None,
            immediate_flush: false,
            flush_in_progress: false,
            dirty: false,
        }
    }

    fn oldest_pending_age(&self) -> Option<Duration> {
        self.pending
            .values()
            .next()
            .map(|p| p.queued_at.elapsed())
    }
}

/// Persisted snapshot sidecar, one record per user in the `indices`
/// namespace. The raw usearch bytes live in the blob store under
/// `blob_id`; a fresh blob id is written per version.
#[derive(Debug, Serialize, Deserialize)]
struct IndexSidecar {
    schema_version: u64,
    user_id: String,
    blob_id: String,
    metadata: HashMap<u32, serde_json::Value>,
    tombstones: Vec<u32>,
    next_vector_id: u32,
    version: u64,
    dimension: usize,
    space: String,
    updated_at: i64,
}

struct Inner {
    config: IndexServiceConfig,
    blobs: Arc<dyn BlobStore>,
    keyed: Arc<dyn KeyedStore>,
    users: RwLock<HashMap<String, Arc<Mutex<UserEntry>>>>,
    flush_failures: AtomicU64,
    ticker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Per-user approximate-nearest-neighbour index service.
#[derive(Clone)]
pub struct HnswIndexService {
    inner: Arc<Inner>,
}

impl HnswIndexService {
    /// Create the service and start its background flush ticker.
    pub fn new(
        config: IndexServiceConfig,
        blobs: Arc<dyn BlobStore>,
        keyed: Arc<dyn KeyedStore>,
    ) -> Self {
        let inner = Arc::new(Inner {
            config,
            blobs,
            keyed,
            users: RwLock::new(HashMap::new()),
            flush_failures: AtomicU64::new(0),
            ticker: std::sync::Mutex::new(None),
        });
        let service = Self { inner };
        service.spawn_ticker();
        service
    }

    fn spawn_ticker(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.batch.batch_delay();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                Inner::tick(&inner).await;
            }
        });
        let mut guard = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(handle);
    }

    /// Allocate a fresh index for `user_id`, replacing any cached one.
    pub async fn create_index(
        &self,
        user_id: &str,
        options: Option<IndexSettings>,
    ) -> Result<CreatedIndex> {
        let settings = options.unwrap_or_else(|| self.inner.config.index.clone());
        if settings.dimension != self.inner.config.index.dimension {
            return Err(Error::Index(format!(
                "index dimension {} does not match service dimension {}",
                settings.dimension, self.inner.config.index.dimension
            )));
        }
        let index = UserIndex::new(&settings)?;
        let serialized = index.to_bytes()?;
        let entry = Arc::new(Mutex::new(UserEntry::fresh(index)));
        self.inner
            .users
            .write()
            .await
            .insert(user_id.to_string(), entry);
        info!(user_id, "Created index");
        Ok(CreatedIndex {
            user_id: user_id.to_string(),
            serialized,
        })
    }

    /// Append a vector to the user's pending buffer.
    ///
    /// Validation failures are fatal to the call; the append itself
    /// never blocks on I/O. Crossing `max_batch_size` schedules exactly
    /// one immediate flush.
    pub async fn add_vector_batched(
        &self,
        user_id: &str,
        vector_id: u32,
        vector: &[f32],
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        self.validate_vector(vector)?;
        let entry = self.entry_or_create(user_id).await?;
        let mut e = entry.lock().await;
        // metadata alone is not enough here: a flushed vector without
        // metadata lives only in the index structure itself
        if e.pending.contains_key(&vector_id)
            || e.tombstones.contains(&vector_id)
            || e.index.contains(vector_id)
        {
            return Err(Error::Validation(format!(
                "vector id {vector_id} already used for user {user_id}"
            )));
        }
        e.pending.insert(
            vector_id,
            PendingVector {
                vector: vector.to_vec(),
                queued_at: Instant::now(),
            },
        );
        if let Some(meta) = metadata {
            e.pending_meta.insert(vector_id, meta);
        }
        e.next_vector_id = e.next_vector_id.max(vector_id + 1);
        e.last_access = Instant::now();

        let max_batch = self.inner.config.batch.max_batch_size;
        if e.pending.len() >= max_batch && !e.immediate_flush && !e.flush_in_progress {
            e.immediate_flush = true;
            let inner = Arc::clone(&self.inner);
            let user = user_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = Inner::flush_user(&inner, &user, FlushReason::Size).await {
                    warn!(user_id = %user, error = %err, "Immediate flush failed");
                }
            });
            debug!(user_id, pending = e.pending.len(), "Scheduled immediate flush");
        }
        Ok(())
    }

    /// Search the union of the persisted structure and the pending
    /// buffer. Every buffered vector is visible before it is durable.
    pub async fn search_vectors(
        &self,
        user_id: &str,
        query: &[f32],
        options: SearchOptions,
    ) -> Result<SearchResults> {
        self.validate_vector(query)?;
        let entry = self
            .load_entry(user_id)
            .await?
            .ok_or_else(|| Error::Search(format!("no index for user {user_id}")))?;
        let mut e = entry.lock().await;
        e.last_access = Instant::now();

        let k = if options.k == 0 { 10 } else { options.k };
        let ef = options
            .ef_search
            .unwrap_or(self.inner.config.index.ef_search);
        let fetch = ef.max(2 * k) + e.tombstones.len();

        let mut candidates: Vec<(u32, f32)> = Vec::new();
        if !e.index.is_empty() {
            candidates.extend(e.index.search(query, fetch.min(e.index.len()))?);
        }
        let space = self.inner.config.index.space;
        for (id, pending) in &e.pending {
            candidates.push((*id, index::distance(space, query, &pending.vector)));
        }
        index::sort_by_distance(&mut candidates);

        let mut results = SearchResults::default();
        let mut seen: HashSet<u32> = HashSet::new();
        for (id, dist) in candidates {
            if results.ids.len() >= k {
                break;
            }
            if e.tombstones.contains(&id) || !seen.insert(id) {
                continue;
            }
            let meta = e
                .pending_meta
                .get(&id)
                .or_else(|| e.metadata.get(&id))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            if let Some(filter) = &options.filter {
                if !filter(&meta) {
                    continue;
                }
            }
            results.ids.push(id);
            results.distances.push(dist);
            results
                .similarities
                .push(index::similarity_from_distance(space, dist));
            results.metadata.push(meta);
        }
        Ok(results)
    }

    /// Restore a user's index from a snapshot blob.
    pub async fn load_index(&self, blob_id: &BlobId, user_id: &str) -> Result<()> {
        let timeout = self.inner.config.op_timeout();
        let bytes = with_timeout(timeout, self.inner.blobs.get(blob_id)).await?;
        let sidecar = Inner::load_sidecar(&self.inner, user_id).await?;

        let index = UserIndex::from_bytes(&bytes, &self.inner.config.index)?;
        let mut entry = UserEntry::fresh(index);
        entry.last_blob = Some(blob_id.clone());
        if let Some(sidecar) = sidecar {
            entry.metadata = sidecar.metadata;
            entry.tombstones = sidecar.tombstones.into_iter().collect();
            entry.next_vector_id = sidecar.next_vector_id;
            entry.version = sidecar.version;
        } else {
            entry.next_vector_id = entry.index.len() as u32;
        }
        self.inner
            .users
            .write()
            .await
            .insert(user_id.to_string(), Arc::new(Mutex::new(entry)));
        info!(user_id, blob_id = %blob_id, "Loaded index from snapshot");
        Ok(())
    }

    /// Persist the user's current index; always writes a snapshot.
    pub async fn save_index(&self, user_id: &str) -> Result<BlobId> {
        self.load_entry(user_id)
            .await?
            .ok_or_else(|| Error::Search(format!("no index for user {user_id}")))?;
        Inner::flush_user(&self.inner, user_id, FlushReason::Save)
            .await?
            .ok_or_else(|| Error::Index(format!("snapshot for user {user_id} was not written")))
    }

    /// Synchronously drain the pending buffer. Idempotent when empty.
    pub async fn force_flush(&self, user_id: &str) -> Result<()> {
        Inner::flush_user(&self.inner, user_id, FlushReason::Force)
            .await
            .map(|_| ())
    }

    /// Drain every user's pending buffer (shutdown path).
    pub async fn flush_all(&self) -> Result<()> {
        let users: Vec<String> = self.inner.users.read().await.keys().cloned().collect();
        for user_id in users {
            Inner::flush_user(&self.inner, &user_id, FlushReason::Force).await?;
        }
        Ok(())
    }

    /// Tombstone a vector; later searches never return it.
    pub async fn remove_vector(&self, user_id: &str, vector_id: u32) -> Result<()> {
        let entry = self
            .load_entry(user_id)
            .await?
            .ok_or_else(|| Error::Search(format!("no index for user {user_id}")))?;
        let mut e = entry.lock().await;
        e.pending.remove(&vector_id);
        e.pending_meta.remove(&vector_id);
        e.metadata.remove(&vector_id);
        e.tombstones.insert(vector_id);
        e.dirty = true;
        e.last_access = Instant::now();
        debug!(user_id, vector_id, "Tombstoned vector");
        Ok(())
    }

    /// Drop the user's index and all persisted rows. Space held by
    /// tombstones is reclaimed here, on this version boundary.
    pub async fn clear_user_index(&self, user_id: &str) -> Result<()> {
        self.inner.users.write().await.remove(user_id);
        let timeout = self.inner.config.op_timeout();
        with_timeout(
            timeout,
            self.inner.keyed.delete(Namespace::Indices, user_id),
        )
        .await?;
        let keys = with_timeout(
            timeout,
            self.inner
                .keyed
                .list_keys(Namespace::Vectors, &format!("{user_id}:")),
        )
        .await?;
        for key in keys {
            with_timeout(timeout, self.inner.keyed.delete(Namespace::Vectors, &key)).await?;
        }
        info!(user_id, "Cleared user index");
        Ok(())
    }

    /// Stop the flush ticker and drop all cached entries.
    pub async fn destroy(&self) {
        let handle = {
            let mut guard = self
                .inner
                .ticker
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner.users.write().await.clear();
    }

    /// The next unused vector id for a user (0 when nothing exists).
    pub async fn next_vector_id(&self, user_id: &str) -> Result<u32> {
        match self.load_entry(user_id).await? {
            Some(entry) => Ok(entry.lock().await.next_vector_id),
            None => Ok(0),
        }
    }

    /// Buffered (not yet durable) vector count for a user.
    pub async fn pending_len(&self, user_id: &str) -> usize {
        match self.inner.users.read().await.get(user_id) {
            Some(entry) => entry.lock().await.pending.len(),
            None => 0,
        }
    }

    /// Current snapshot version for a user (0 before the first flush).
    pub async fn version(&self, user_id: &str) -> u64 {
        match self.inner.users.read().await.get(user_id) {
            Some(entry) => entry.lock().await.version,
            None => 0,
        }
    }

    /// Total flush failures since startup.
    pub fn flush_failures(&self) -> u64 {
        self.inner.flush_failures.load(Ordering::Relaxed)
    }

    /// Number of user entries currently cached in memory.
    pub async fn cached_users(&self) -> usize {
        self.inner.users.read().await.len()
    }

    fn validate_vector(&self, vector: &[f32]) -> Result<()> {
        let expected = self.inner.config.index.dimension;
        if vector.len() != expected {
            return Err(Error::Validation(format!(
                "vector dimension {} does not match index dimension {expected}",
                vector.len()
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::Validation(
                "vector contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    async fn entry_or_create(&self, user_id: &str) -> Result<Arc<Mutex<UserEntry>>> {
        if let Some(entry) = self.load_entry(user_id).await? {
            return Ok(entry);
        }
        let index = UserIndex::new(&self.inner.config.index)?;
        let entry = Arc::new(Mutex::new(UserEntry::fresh(index)));
        let mut users = self.inner.users.write().await;
        Ok(Arc::clone(
            users
                .entry(user_id.to_string())
                .or_insert_with(|| entry),
        ))
    }

    /// Cached entry, or an attempt to restore it from persistence.
    async fn load_entry(&self, user_id: &str) -> Result<Option<Arc<Mutex<UserEntry>>>> {
        if let Some(entry) = self.inner.users.read().await.get(user_id) {
            return Ok(Some(Arc::clone(entry)));
        }
        let Some(sidecar) = Inner::load_sidecar(&self.inner, user_id).await? else {
            return Ok(None);
        };
        let timeout = self.inner.config.op_timeout();
        let blob_id = BlobId::new(sidecar.blob_id.clone());
        let bytes = with_timeout(timeout, self.inner.blobs.get(&blob_id)).await?;
        let index = UserIndex::from_bytes(&bytes, &self.inner.config.index)?;

        let mut entry = UserEntry::fresh(index);
        entry.metadata = sidecar.metadata;
        entry.tombstones = sidecar.tombstones.into_iter().collect();
        entry.next_vector_id = sidecar.next_vector_id;
        entry.version = sidecar.version;
        entry.last_blob = Some(blob_id);

        let mut users = self.inner.users.write().await;
        let entry = users
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(entry)));
        debug!(user_id, "Restored index entry from persistence");
        Ok(Some(Arc::clone(entry)))
    }
}

impl Inner {
    async fn load_sidecar(inner: &Arc<Inner>, user_id: &str) -> Result<Option<IndexSidecar>> {
        let timeout = inner.config.op_timeout();
        let record = with_timeout(timeout, inner.keyed.get(Namespace::Indices, user_id)).await?;
        match record {
            Some(record) => {
                let payload = memvault_store::migrate_payload(record.payload)?;
                let sidecar: IndexSidecar = serde_json::from_value(payload)?;
                Ok(Some(sidecar))
            }
            None => Ok(None),
        }
    }

    /// One pass of the background ticker: flush what is due, then evict
    /// idle entries.
    async fn tick(inner: &Arc<Inner>) {
        let users: Vec<(String, Arc<Mutex<UserEntry>>)> = inner
            .users
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let max_batch = inner.config.batch.max_batch_size;
        let max_age = inner.config.batch.batch_delay();
        for (user_id, entry) in &users {
            let due = {
                let e = entry.lock().await;
                if e.flush_in_progress {
                    false
                } else {
                    e.pending.len() >= max_batch
                        || e.dirty
                        || e.oldest_pending_age().map(|a| a >= max_age).unwrap_or(false)
                }
            };
            if due {
                if let Err(err) = Self::flush_user(inner, user_id, FlushReason::Timer).await {
                    warn!(user_id = %user_id, error = %err, "Scheduled flush failed; will retry next tick");
                }
            }
        }

        Self::evict(inner, &users).await;
    }

    async fn evict(inner: &Arc<Inner>, users: &[(String, Arc<Mutex<UserEntry>>)]) {
        let ttl = inner.config.batch.cache_ttl();
        let max_cached = inner.config.batch.max_cache_size;

        let mut evictable: Vec<(String, Instant)> = Vec::new();
        for (user_id, entry) in users {
            let e = entry.lock().await;
            if e.pending.is_empty() && !e.dirty && !e.flush_in_progress {
                evictable.push((user_id.clone(), e.last_access));
            }
        }

        let mut to_remove: Vec<String> = evictable
            .iter()
            .filter(|(_, last)| last.elapsed() >= ttl)
            .map(|(u, _)| u.clone())
            .collect();

        let over = users.len().saturating_sub(max_cached);
        if over > to_remove.len() {
            let mut by_age = evictable.clone();
            by_age.sort_by_key(|(_, last)| *last);
            for (user, _) in by_age {
                if to_remove.len() >= over {
                    break;
                }
                if !to_remove.contains(&user) {
                    to_remove.push(user);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut map = inner.users.write().await;
            for user in &to_remove {
                map.remove(user);
            }
            info!(evicted = to_remove.len(), "Evicted idle index entries");
        }
    }

    /// Flush a user's pending vectors into the persisted structure.
    ///
    /// The entry lock is dropped during blob/sidecar I/O; a
    /// `flush_in_progress` guard keeps flushes from overlapping. On
    /// storage failure the freshly inserted vectors are rolled back out
    /// of the in-memory structure and the buffer is left untouched.
    async fn flush_user(
        inner: &Arc<Inner>,
        user_id: &str,
        reason: FlushReason,
    ) -> Result<Option<BlobId>> {
        let Some(entry) = inner.users.read().await.get(user_id).map(Arc::clone) else {
            return Ok(None);
        };

        // Phase 1: take a batch and build the snapshot under the lock.
        let (taken, bytes, mut sidecar, new_version) = {
            let mut e = entry.lock().await;
            if e.flush_in_progress {
                return Ok(None);
            }
            let take_ids: Vec<u32> = match reason {
                FlushReason::Size => e
                    .pending
                    .keys()
                    .take(inner.config.batch.max_batch_size)
                    .copied()
                    .collect(),
                _ => e.pending.keys().copied().collect(),
            };
            if take_ids.is_empty() && !e.dirty && reason != FlushReason::Save {
                e.immediate_flush = false;
                return Ok(None);
            }

            let mut inserted: Vec<u32> = Vec::with_capacity(take_ids.len());
            let mut failure: Option<Error> = None;
            for id in &take_ids {
                let vector = &e.pending[id].vector;
                match e.index.insert(*id, vector) {
                    Ok(()) => inserted.push(*id),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            let built = match failure {
                None => e.index.to_bytes(),
                Some(err) => Err(err),
            };
            match built {
                Ok(bytes) => {
                    let mut metadata = e.metadata.clone();
                    for id in &take_ids {
                        if let Some(meta) = e.pending_meta.get(id) {
                            metadata.insert(*id, meta.clone());
                        }
                    }
                    let new_version = e.version + 1;
                    let sidecar = IndexSidecar {
                        schema_version: memvault_store::SCHEMA_VERSION,
                        user_id: user_id.to_string(),
                        blob_id: String::new(),
                        metadata,
                        tombstones: e.tombstones.iter().copied().collect(),
                        next_vector_id: e.next_vector_id,
                        version: new_version,
                        dimension: inner.config.index.dimension,
                        space: inner.config.index.space.to_string(),
                        updated_at: chrono::Utc::now().timestamp_millis(),
                    };
                    e.flush_in_progress = true;
                    (take_ids, bytes, sidecar, new_version)
                }
                Err(err) => {
                    for id in &inserted {
                        let _ = e.index.remove(*id);
                    }
                    e.immediate_flush = false;
                    inner.flush_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            }
        };

        // Phase 2: persist without holding the entry lock.
        let timeout = inner.config.op_timeout();
        let mut blob_meta = BlobMeta::new();
        blob_meta.insert("kind".to_string(), "hnsw-snapshot".to_string());
        blob_meta.insert("user_id".to_string(), user_id.to_string());
        blob_meta.insert("version".to_string(), new_version.to_string());

        let persisted: Result<BlobId> = async {
            let blob_id = with_timeout(timeout, inner.blobs.put(&bytes, &blob_meta)).await?;
            sidecar.blob_id = blob_id.as_str().to_string();
            let payload = serde_json::to_value(&sidecar)?;
            with_timeout(
                timeout,
                inner
                    .keyed
                    .put(Namespace::Indices, user_id, payload, new_version),
            )
            .await?;
            if inner.config.batch.persist_raw_vectors {
                let e = entry.lock().await;
                for id in &taken {
                    if let Some(pending) = e.pending.get(id) {
                        let row = serde_json::json!({
                            "schema_version": memvault_store::SCHEMA_VERSION,
                            "vector": pending.vector,
                            "metadata": e.pending_meta.get(id).cloned().unwrap_or(serde_json::Value::Null),
                            "timestamp": chrono::Utc::now().timestamp_millis(),
                        });
                        with_timeout(
                            timeout,
                            inner.keyed.put(
                                Namespace::Vectors,
                                &format!("{user_id}:{id}"),
                                row,
                                new_version,
                            ),
                        )
                        .await?;
                    }
                }
            }
            Ok(blob_id)
        }
        .await;

        // Phase 3: commit or roll back under the lock.
        let mut e = entry.lock().await;
        match persisted {
            Ok(blob_id) => {
                for id in &taken {
                    e.pending.remove(id);
                    if let Some(meta) = e.pending_meta.remove(id) {
                        e.metadata.insert(*id, meta);
                    }
                }
                e.version = new_version;
                e.dirty = false;
                e.last_blob = Some(blob_id.clone());
                e.flush_in_progress = false;
                e.immediate_flush = false;
                debug!(
                    user_id,
                    flushed = taken.len(),
                    version = new_version,
                    reason = ?reason,
                    "Flushed pending vectors"
                );
                Ok(Some(blob_id))
            }
            Err(err) => {
                for id in &taken {
                    let _ = e.index.remove(*id);
                }
                e.flush_in_progress = false;
                e.immediate_flush = false;
                inner.flush_failures.fetch_add(1, Ordering::Relaxed);
                warn!(user_id, error = %err, "Flush failed; buffer retained for retry");
                Err(err)
            }
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = std::result::Result<T, memvault_store::Error>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout(timeout.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memvault_store::{LocalBlobStore, MemoryKeyedStore};

    async fn service(dimension: usize, max_batch: usize) -> HnswIndexService {
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::in_memory().await.unwrap());
        let keyed: Arc<dyn KeyedStore> = Arc::new(MemoryKeyedStore::new());
        let config = IndexServiceConfig {
            index: IndexSettings {
                dimension,
                max_elements: 64,
                ..IndexSettings::default()
            },
            batch: BatchSettings {
                max_batch_size: max_batch,
                batch_delay_ms: 60_000, // keep the ticker quiet in tests
                ..BatchSettings::default()
            },
            op_timeout_ms: 5_000,
        };
        HnswIndexService::new(config, blobs, keyed)
    }

    fn unit(dimension: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[axis] = 1.0;
        v
    }

    #[tokio::test]
    async fn test_buffered_vector_is_searchable_before_flush() {
        let svc = service(4, 50).await;
        svc.add_vector_batched("u1", 0, &unit(4, 0), None).await.unwrap();

        let results = svc
            .search_vectors("u1", &unit(4, 0), SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.ids, vec![0]);
        assert!(results.similarities[0] > 1.0 - 1e-6);
        assert_eq!(svc.version("u1").await, 0); // not yet durable
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_validation_error() {
        let svc = service(4, 50).await;
        let err = svc.add_vector_batched("u1", 0, &[1.0, 0.0], None).await;
        assert!(matches!(err, Err(Error::Validation(_))));

        svc.add_vector_batched("u1", 0, &unit(4, 0), None).await.unwrap();
        let err = svc.search_vectors("u1", &[1.0], SearchOptions::default()).await;
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_non_finite_vector_rejected() {
        let svc = service(4, 50).await;
        let err = svc
            .add_vector_batched("u1", 0, &[f32::NAN, 0.0, 0.0, 0.0], None)
            .await;
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_duplicate_vector_id_rejected() {
        let svc = service(4, 50).await;
        svc.add_vector_batched("u1", 3, &unit(4, 0), None).await.unwrap();
        let err = svc.add_vector_batched("u1", 3, &unit(4, 1), None).await;
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_after_metadata_less_flush() {
        let svc = service(4, 50).await;
        // no metadata supplied, so after the flush the id lives only in
        // the index structure itself
        svc.add_vector_batched("u1", 0, &unit(4, 0), None).await.unwrap();
        svc.force_flush("u1").await.unwrap();
        assert_eq!(svc.pending_len("u1").await, 0);

        let err = svc.add_vector_batched("u1", 0, &unit(4, 1), None).await;
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_search_without_index_fails() {
        let svc = service(4, 50).await;
        let err = svc
            .search_vectors("nobody", &unit(4, 0), SearchOptions::default())
            .await;
        assert!(matches!(err, Err(Error::Search(_))));
    }

    #[tokio::test]
    async fn test_force_flush_empty_is_noop() {
        let svc = service(4, 50).await;
        svc.create_index("u1", None).await.unwrap();
        svc.force_flush("u1").await.unwrap();
        assert_eq!(svc.version("u1").await, 0);
    }

    #[tokio::test]
    async fn test_flush_bumps_version_and_persists() {
        let svc = service(4, 50).await;
        svc.add_vector_batched("u1", 0, &unit(4, 0), None).await.unwrap();
        svc.add_vector_batched("u1", 1, &unit(4, 1), None).await.unwrap();

        svc.force_flush("u1").await.unwrap();
        assert_eq!(svc.version("u1").await, 1);
        assert_eq!(svc.pending_len("u1").await, 0);

        svc.add_vector_batched("u1", 2, &unit(4, 2), None).await.unwrap();
        svc.force_flush("u1").await.unwrap();
        assert_eq!(svc.version("u1").await, 2);

        // still fully searchable after both flushes
        let results = svc
            .search_vectors("u1", &unit(4, 1), SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.ids[0], 1);
    }

    #[tokio::test]
    async fn test_immediate_flush_on_batch_crossing() {
        let svc = service(4, 3).await;
        for i in 0..4u32 {
            svc.add_vector_batched("u1", i, &unit(4, (i % 4) as usize), None)
                .await
                .unwrap();
        }
        // the spawned size-triggered flush drains the first 3
        for _ in 0..100 {
            if svc.version("u1").await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(svc.version("u1").await, 1);
        assert_eq!(svc.pending_len("u1").await, 1);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::in_memory().await.unwrap());
        let keyed: Arc<dyn KeyedStore> = Arc::new(MemoryKeyedStore::new());
        let config = IndexServiceConfig {
            index: IndexSettings {
                dimension: 4,
                max_elements: 64,
                ..IndexSettings::default()
            },
            batch: BatchSettings {
                batch_delay_ms: 60_000,
                ..BatchSettings::default()
            },
            op_timeout_ms: 5_000,
        };
        let svc = HnswIndexService::new(config.clone(), Arc::clone(&blobs), Arc::clone(&keyed));

        svc.add_vector_batched("u1", 0, &unit(4, 0), None).await.unwrap();
        svc.add_vector_batched("u1", 1, &unit(4, 1), None).await.unwrap();
        let blob_id = svc.save_index("u1").await.unwrap();

        // a second service instance restores the same results
        let svc2 = HnswIndexService::new(config, blobs, keyed);
        svc2.load_index(&blob_id, "u1").await.unwrap();
        let results = svc2
            .search_vectors("u1", &unit(4, 0), SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.ids[0], 0);
        assert!(results.similarities[0] > 1.0 - 1e-6);
        assert_eq!(svc2.next_vector_id("u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remove_vector_excluded_before_and_after_flush() {
        let svc = service(4, 50).await;
        svc.add_vector_batched("u1", 0, &unit(4, 0), None).await.unwrap();
        svc.add_vector_batched("u1", 1, &unit(4, 1), None).await.unwrap();

        // removed while still pending
        svc.remove_vector("u1", 1).await.unwrap();
        let results = svc
            .search_vectors("u1", &unit(4, 1), SearchOptions::default())
            .await
            .unwrap();
        assert!(!results.ids.contains(&1));

        // removed after flush
        svc.force_flush("u1").await.unwrap();
        svc.remove_vector("u1", 0).await.unwrap();
        let results = svc
            .search_vectors("u1", &unit(4, 0), SearchOptions::default())
            .await
            .unwrap();
        assert!(results.ids.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_filter() {
        let svc = service(4, 50).await;
        svc.add_vector_batched("u1", 0, &unit(4, 0), Some(serde_json::json!({"category": "work"})))
            .await
            .unwrap();
        svc.add_vector_batched("u1", 1, &unit(4, 0), Some(serde_json::json!({"category": "home"})))
            .await
            .unwrap();

        let filter: MetadataFilter = Arc::new(|meta| meta["category"] == "home");
        let results = svc
            .search_vectors(
                "u1",
                &unit(4, 0),
                SearchOptions {
                    k: 10,
                    ef_search: None,
                    filter: Some(filter),
                },
            )
            .await
            .unwrap();
        assert_eq!(results.ids, vec![1]);
        assert_eq!(results.metadata[0]["category"], "home");
    }

    #[tokio::test]
    async fn test_equal_distance_tie_breaks_by_lower_id() {
        let svc = service(4, 50).await;
        // two identical vectors at different ids
        svc.add_vector_batched("u1", 5, &unit(4, 0), None).await.unwrap();
        svc.add_vector_batched("u1", 2, &unit(4, 0), None).await.unwrap();

        let results = svc
            .search_vectors(
                "u1",
                &unit(4, 0),
                SearchOptions {
                    k: 2,
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.ids, vec![2, 5]);
    }

    #[tokio::test]
    async fn test_clear_user_index() {
        let svc = service(4, 50).await;
        svc.add_vector_batched("u1", 0, &unit(4, 0), None).await.unwrap();
        svc.force_flush("u1").await.unwrap();
        svc.clear_user_index("u1").await.unwrap();

        let err = svc
            .search_vectors("u1", &unit(4, 0), SearchOptions::default())
            .await;
        assert!(matches!(err, Err(Error::Search(_))));
    }

    #[tokio::test]
    async fn test_raw_vectors_persisted_when_enabled() {
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::in_memory().await.unwrap());
        let keyed: Arc<dyn KeyedStore> = Arc::new(MemoryKeyedStore::new());
        let config = IndexServiceConfig {
            index: IndexSettings {
                dimension: 4,
                max_elements: 64,
                ..IndexSettings::default()
            },
            batch: BatchSettings {
                batch_delay_ms: 60_000,
                persist_raw_vectors: true,
                ..BatchSettings::default()
            },
            op_timeout_ms: 5_000,
        };
        let svc = HnswIndexService::new(config, blobs, Arc::clone(&keyed));

        svc.add_vector_batched("u1", 0, &unit(4, 0), Some(serde_json::json!({"k": "v"})))
            .await
            .unwrap();
        svc.force_flush("u1").await.unwrap();

        let row = keyed
            .get(Namespace::Vectors, "u1:0")
            .await
            .unwrap()
            .expect("raw vector row written");
        assert_eq!(row.payload["metadata"]["k"], "v");
        assert_eq!(row.payload["vector"][0], 1.0);
    }

    #[tokio::test]
    async fn test_create_index_dimension_mismatch() {
        let svc = service(4, 50).await;
        let bad = IndexSettings {
            dimension: 8,
            ..IndexSettings::default()
        };
        assert!(matches!(
            svc.create_index("u1", Some(bad)).await,
            Err(Error::Index(_))
        ));
    }
}
