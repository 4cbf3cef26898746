//! Thread sync merger — reconciles an external thread's full history into
//! its append-only mirror.
//!
//! The merge is idempotent: every external message lands in the mirror
//! exactly once, keyed by its surface-native id, no matter how often or in
//! what order sync runs.

use std::collections::HashSet;

use serde_json::json;
use uuid::Uuid;

use crate::error::SyncError;
use crate::feed::event::MIRRORED_ROLE;
use crate::store::{MirrorMessage, NewMirrorMessage, ThreadRecord, ThreadStore};
use crate::surface::{ExternalMessage, ExternalThreadRef};

/// The alternative lane the relay writes mirrored messages into. Other lanes
/// of the same thread belong to other writers and are never touched.
pub const MIRROR_ALT: i64 = 100;

/// Prefix of the search key linking a mirror thread to its external thread.
pub const SEARCH_KEY_PREFIX: &str = "support:";

pub fn search_key_for(external_thread_id: &str) -> String {
    format!("{SEARCH_KEY_PREFIX}{external_thread_id}")
}

/// Provenance recorded on every mirrored message. The external id is what
/// deduplication keys on.
pub fn provenance_for(external_id: &str) -> serde_json::Value {
    json!({ "external_id": external_id, "source": "support_relay" })
}

/// External id a mirrored message was captured from, if it carries one.
pub fn external_id_of(message: &MirrorMessage) -> Option<&str> {
    message
        .provenance
        .as_ref()?
        .get("external_id")?
        .as_str()
}

/// In-memory view of one mirror thread, rebuilt from the store on first
/// touch and advanced only after durable appends.
#[derive(Debug)]
pub struct MirrorState {
    pub thread_id: Uuid,
    pub search_key: String,
    known_external_ids: HashSet<String>,
    high_water_seq: i64,
}

impl MirrorState {
    /// Rebuild state from what the store already holds. Messages in other
    /// alt lanes contribute neither ids nor the high-water mark.
    pub fn seed(thread: &ThreadRecord, messages: &[MirrorMessage]) -> Self {
        let mut known_external_ids = HashSet::new();
        let mut high_water_seq = 0;
        for msg in messages {
            if msg.alt != MIRROR_ALT {
                continue;
            }
            if msg.seq > high_water_seq {
                high_water_seq = msg.seq;
            }
            if let Some(id) = external_id_of(msg) {
                known_external_ids.insert(id.to_string());
            }
        }
        Self {
            thread_id: thread.id,
            search_key: thread.search_key.clone(),
            known_external_ids,
            high_water_seq,
        }
    }

    pub fn high_water_seq(&self) -> i64 {
        self.high_water_seq
    }

    pub fn knows(&self, external_id: &str) -> bool {
        self.known_external_ids.contains(external_id)
    }
}

/// Plan which external messages need mirroring. Pure: no store access, no
/// state mutation.
///
/// Skipped (and consuming no sequence number): messages already mirrored,
/// repeated ids within the batch after their first occurrence, and messages
/// whose content is empty after trimming.
pub fn plan_batch(state: &MirrorState, history: &[ExternalMessage]) -> Vec<NewMirrorMessage> {
    let mut seen_in_batch: HashSet<&str> = HashSet::new();
    let mut next_seq = state.high_water_seq + 1;
    let mut batch = Vec::new();

    for msg in history {
        if state.knows(&msg.external_id) {
            continue;
        }
        if !seen_in_batch.insert(&msg.external_id) {
            continue;
        }
        let content = msg.content.trim();
        if content.is_empty() {
            continue;
        }

        batch.push(NewMirrorMessage {
            alt: MIRROR_ALT,
            seq: next_seq,
            role: MIRRORED_ROLE.to_string(),
            content: content.to_string(),
            provenance: provenance_for(&msg.external_id),
        });
        next_seq += 1;
    }

    batch
}

/// Merge one observed history into the mirror. Returns how many messages
/// were appended.
///
/// State advances only after the append is durable; on failure the state is
/// untouched, so the next merge retries the same messages.
pub async fn merge_history(
    store: &dyn ThreadStore,
    state: &mut MirrorState,
    history: &[ExternalMessage],
) -> Result<usize, SyncError> {
    let batch = plan_batch(state, history);
    if batch.is_empty() {
        return Ok(0);
    }

    let appended = batch.len();
    store
        .append_batch(state.thread_id, batch.clone())
        .await
        .map_err(SyncError::Append)?;

    for msg in &batch {
        if let Some(id) = msg.provenance.get("external_id").and_then(|v| v.as_str()) {
            state.known_external_ids.insert(id.to_string());
        }
    }
    state.high_water_seq += appended as i64;
    tracing::debug!(
        thread = %state.thread_id,
        appended,
        high_water = state.high_water_seq,
        "Mirrored external messages"
    );
    Ok(appended)
}

/// Find the mirror thread for an external thread, creating it when it does
/// not exist yet, and rebuild its state from the store.
///
/// More than one matching thread means the capture invariant is broken and
/// the sync refuses to guess.
pub async fn ensure_state(
    store: &dyn ThreadStore,
    group_id: &str,
    thread: &ExternalThreadRef,
) -> Result<MirrorState, SyncError> {
    let search_key = search_key_for(&thread.id);
    let mut matches = store
        .find_threads_by_search_key(group_id, &search_key)
        .await?;

    match matches.len() {
        0 => {
            let record = store
                .create_thread(group_id, &thread.title, &search_key)
                .await?;
            tracing::info!(thread = %record.id, search_key = %search_key, "Captured new mirror thread");
            Ok(MirrorState::seed(&record, &[]))
        }
        1 => {
            let record = matches.remove(0);
            let messages = store.list_messages(record.id).await?;
            Ok(MirrorState::seed(&record, &messages))
        }
        count => Err(SyncError::AmbiguousThread { search_key, count }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryThreadStore;
    use chrono::Utc;

    fn external(id: &str, content: &str) -> ExternalMessage {
        ExternalMessage {
            external_id: id.to_string(),
            author: "alice".into(),
            content: content.to_string(),
            observed_at: Utc::now(),
        }
    }

    fn thread_ref(id: &str) -> ExternalThreadRef {
        ExternalThreadRef {
            id: id.to_string(),
            title: format!("thread {id}"),
        }
    }

    async fn fresh_state(store: &MemoryThreadStore) -> MirrorState {
        ensure_state(store, "grp", &thread_ref("42")).await.unwrap()
    }

    #[tokio::test]
    async fn first_merge_assigns_contiguous_seqs() {
        let store = MemoryThreadStore::new();
        let mut state = fresh_state(&store).await;

        let history = vec![external("a", "one"), external("b", "two")];
        let appended = merge_history(&store, &mut state, &history).await.unwrap();
        assert_eq!(appended, 2);

        let messages = store.list_messages(state.thread_id).await.unwrap();
        assert_eq!(
            messages.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(messages.iter().all(|m| m.alt == MIRROR_ALT));
        assert!(messages.iter().all(|m| m.role == MIRRORED_ROLE));
    }

    #[tokio::test]
    async fn remerge_is_idempotent() {
        let store = MemoryThreadStore::new();
        let mut state = fresh_state(&store).await;
        let history = vec![external("a", "one"), external("b", "two")];

        merge_history(&store, &mut state, &history).await.unwrap();
        let again = merge_history(&store, &mut state, &history).await.unwrap();
        assert_eq!(again, 0);
        // Second merge had nothing to do and never reached the store.
        assert_eq!(store.append_calls(), 1);
        assert_eq!(store.list_messages(state.thread_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_ids_in_one_batch_kept_once() {
        let store = MemoryThreadStore::new();
        let mut state = fresh_state(&store).await;

        let history = vec![
            external("a", "first"),
            external("b", "middle"),
            external("a", "echo of first"),
        ];
        let appended = merge_history(&store, &mut state, &history).await.unwrap();
        assert_eq!(appended, 2);

        let messages = store.list_messages(state.thread_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].content, "middle");
    }

    #[tokio::test]
    async fn empty_content_consumes_no_seq() {
        let store = MemoryThreadStore::new();
        let mut state = fresh_state(&store).await;

        let history = vec![
            external("a", "   "),
            external("b", "real"),
        ];
        let appended = merge_history(&store, &mut state, &history).await.unwrap();
        assert_eq!(appended, 1);

        let messages = store.list_messages(state.thread_id).await.unwrap();
        assert_eq!(messages[0].seq, 1);
        assert_eq!(messages[0].content, "real");
    }

    #[tokio::test]
    async fn failed_append_leaves_state_retryable() {
        let store = MemoryThreadStore::new();
        let mut state = fresh_state(&store).await;
        let history = vec![external("a", "one")];

        store.fail_next_append();
        let err = merge_history(&store, &mut state, &history).await;
        assert!(matches!(err, Err(SyncError::Append(_))));
        assert_eq!(state.high_water_seq(), 0);
        assert!(!state.knows("a"));

        // Retry with the same history succeeds and lands once.
        let appended = merge_history(&store, &mut state, &history).await.unwrap();
        assert_eq!(appended, 1);
        assert_eq!(store.list_messages(state.thread_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn seed_ignores_other_alt_lanes() {
        let store = MemoryThreadStore::new();
        let record = store.create_thread("grp", "t", "support:42").await.unwrap();
        store
            .append_batch(
                record.id,
                vec![
                    NewMirrorMessage {
                        alt: MIRROR_ALT,
                        seq: 3,
                        role: MIRRORED_ROLE.into(),
                        content: "mirrored".into(),
                        provenance: provenance_for("m-3"),
                    },
                    NewMirrorMessage {
                        alt: 0,
                        seq: 9,
                        role: "assistant".into(),
                        content: "other lane".into(),
                        provenance: json!({}),
                    },
                ],
            )
            .await
            .unwrap();

        let state = ensure_state(&store, "grp", &thread_ref("42")).await.unwrap();
        assert_eq!(state.high_water_seq(), 3);
        assert!(state.knows("m-3"));
    }

    #[tokio::test]
    async fn ensure_state_creates_thread_once() {
        let store = MemoryThreadStore::new();
        let first = ensure_state(&store, "grp", &thread_ref("42")).await.unwrap();
        let second = ensure_state(&store, "grp", &thread_ref("42")).await.unwrap();
        assert_eq!(first.thread_id, second.thread_id);
        assert_eq!(store.thread_count(), 1);
    }

    #[tokio::test]
    async fn ambiguous_capture_is_an_error() {
        let store = MemoryThreadStore::new();
        store.create_thread("grp", "a", "support:42").await.unwrap();
        store.create_thread("grp", "b", "support:42").await.unwrap();

        let err = ensure_state(&store, "grp", &thread_ref("42")).await;
        assert!(matches!(
            err,
            Err(SyncError::AmbiguousThread { count: 2, .. })
        ));
    }
}
