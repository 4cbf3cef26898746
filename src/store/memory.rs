//! In-memory `ThreadStore` for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::traits::{MirrorMessage, NewMirrorMessage, ThreadRecord, ThreadStore};

/// Hash-map backed store. Counts append calls and can be told to reject the
/// next append, so tests can check batching and failure behaviour.
#[derive(Default)]
pub struct MemoryThreadStore {
    inner: Mutex<Inner>,
    append_calls: AtomicUsize,
    fail_next_append: AtomicBool,
}

#[derive(Default)]
struct Inner {
    threads: Vec<ThreadRecord>,
    messages: HashMap<Uuid, Vec<MirrorMessage>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `append_batch` calls that reached the store, including
    /// rejected ones.
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// Make the next `append_batch` fail without writing anything.
    pub fn fail_next_append(&self) {
        self.fail_next_append.store(true, Ordering::SeqCst);
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).threads.len()
    }
}

fn lock(inner: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_threads_by_search_key(
        &self,
        group_id: &str,
        search_key: &str,
    ) -> Result<Vec<ThreadRecord>, StoreError> {
        Ok(lock(&self.inner)
            .threads
            .iter()
            .filter(|t| t.group_id == group_id && t.search_key == search_key)
            .cloned()
            .collect())
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<ThreadRecord>, StoreError> {
        Ok(lock(&self.inner).threads.iter().find(|t| t.id == id).cloned())
    }

    async fn create_thread(
        &self,
        group_id: &str,
        title: &str,
        search_key: &str,
    ) -> Result<ThreadRecord, StoreError> {
        let record = ThreadRecord {
            id: Uuid::new_v4(),
            group_id: group_id.to_string(),
            title: title.to_string(),
            search_key: search_key.to_string(),
            created_at: Utc::now(),
        };
        let mut inner = lock(&self.inner);
        inner.threads.push(record.clone());
        inner.messages.insert(record.id, Vec::new());
        Ok(record)
    }

    async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<MirrorMessage>, StoreError> {
        let mut messages = lock(&self.inner)
            .messages
            .get(&thread_id)
            .cloned()
            .unwrap_or_default();
        messages.sort_by_key(|m| (m.alt, m.seq));
        Ok(messages)
    }

    async fn append_batch(
        &self,
        thread_id: Uuid,
        batch: Vec<NewMirrorMessage>,
    ) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_append.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Query("injected append failure".into()));
        }

        let mut inner = lock(&self.inner);
        let existing = inner.messages.entry(thread_id).or_default();
        // Atomicity: validate the whole batch before writing any of it.
        for msg in &batch {
            if existing.iter().any(|m| m.alt == msg.alt && m.seq == msg.seq) {
                return Err(StoreError::Constraint(format!(
                    "duplicate (alt, seq) = ({}, {})",
                    msg.alt, msg.seq
                )));
            }
        }
        let now = Utc::now();
        for msg in batch {
            existing.push(MirrorMessage {
                thread_id,
                alt: msg.alt,
                seq: msg.seq,
                role: msg.role,
                content: msg.content,
                provenance: Some(msg.provenance),
                created_at: now,
            });
        }
        Ok(())
    }
}
