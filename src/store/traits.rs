//! `ThreadStore` trait — async interface to the authoritative thread mirror.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

/// A mirror thread record.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub id: Uuid,
    pub group_id: String,
    pub title: String,
    /// Key linking this thread to its external counterpart,
    /// e.g. `support:1378031356453589073`.
    pub search_key: String,
    pub created_at: DateTime<Utc>,
}

/// A message already persisted in a mirror thread. Append-only: once written
/// it is never mutated or deleted.
#[derive(Debug, Clone)]
pub struct MirrorMessage {
    pub thread_id: Uuid,
    /// Alternative lane within the thread; the relay only writes one.
    pub alt: i64,
    /// Strictly increasing, gap-free per (thread, alt).
    pub seq: i64,
    pub role: String,
    pub content: String,
    /// JSON provenance; carries the external message id for deduplication.
    pub provenance: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A message queued for a durable append.
#[derive(Debug, Clone)]
pub struct NewMirrorMessage {
    pub alt: i64,
    pub seq: i64,
    pub role: String,
    pub content: String,
    pub provenance: serde_json::Value,
}

/// Backend-agnostic thread store.
///
/// `append_batch` is atomic: either every message in the batch is durable or
/// none is. Callers rely on this for safe whole-batch retries.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Create tables if they do not exist.
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// Threads captured under `search_key` in a group. Normally 0 or 1.
    async fn find_threads_by_search_key(
        &self,
        group_id: &str,
        search_key: &str,
    ) -> Result<Vec<ThreadRecord>, StoreError>;

    /// Get a thread by id.
    async fn get_thread(&self, id: Uuid) -> Result<Option<ThreadRecord>, StoreError>;

    /// Create a new mirror thread.
    async fn create_thread(
        &self,
        group_id: &str,
        title: &str,
        search_key: &str,
    ) -> Result<ThreadRecord, StoreError>;

    /// All messages of a thread, ordered by (alt, seq).
    async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<MirrorMessage>, StoreError>;

    /// Durably append a batch in one transaction.
    async fn append_batch(
        &self,
        thread_id: Uuid,
        batch: Vec<NewMirrorMessage>,
    ) -> Result<(), StoreError>;
}
