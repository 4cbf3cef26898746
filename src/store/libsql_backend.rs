//! libSQL backend — async `ThreadStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::traits::{MirrorMessage, NewMirrorMessage, ThreadRecord, ThreadStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS threads (
    id          TEXT PRIMARY KEY,
    group_id    TEXT NOT NULL,
    title       TEXT NOT NULL,
    search_key  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_threads_search
    ON threads (group_id, search_key);
CREATE TABLE IF NOT EXISTS thread_messages (
    thread_id   TEXT NOT NULL,
    alt         INTEGER NOT NULL,
    seq         INTEGER NOT NULL,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    provenance  TEXT,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (thread_id, alt, seq)
);
";

/// libSQL thread store.
pub struct LibSqlThreadStore {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl LibSqlThreadStore {
    /// Open (or create) a local database file and create the schema.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Thread store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn query_err(op: &str, e: libsql::Error) -> StoreError {
    let text = e.to_string();
    if text.contains("UNIQUE") || text.contains("constraint") {
        StoreError::Constraint(format!("{op}: {text}"))
    } else {
        StoreError::Query(format!("{op}: {text}"))
    }
}

/// Column order: 0:id, 1:group_id, 2:title, 3:search_key, 4:created_at
fn row_to_thread(row: &libsql::Row) -> Result<ThreadRecord, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("thread row parse: {e}")))?;
    let group_id: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("thread row parse: {e}")))?;
    let title: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("thread row parse: {e}")))?;
    let search_key: String = row
        .get(3)
        .map_err(|e| StoreError::Query(format!("thread row parse: {e}")))?;
    let created_str: String = row
        .get(4)
        .map_err(|e| StoreError::Query(format!("thread row parse: {e}")))?;

    Ok(ThreadRecord {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| StoreError::Query(format!("thread id parse: {e}")))?,
        group_id,
        title,
        search_key,
        created_at: parse_datetime(&created_str),
    })
}

/// Column order: 0:thread_id, 1:alt, 2:seq, 3:role, 4:content, 5:provenance, 6:created_at
fn row_to_message(row: &libsql::Row) -> Result<MirrorMessage, StoreError> {
    let thread_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("message row parse: {e}")))?;
    let alt: i64 = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("message row parse: {e}")))?;
    let seq: i64 = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("message row parse: {e}")))?;
    let role: String = row
        .get(3)
        .map_err(|e| StoreError::Query(format!("message row parse: {e}")))?;
    let content: String = row
        .get(4)
        .map_err(|e| StoreError::Query(format!("message row parse: {e}")))?;
    let provenance_str: Option<String> = row.get(5).ok();
    let created_str: String = row
        .get(6)
        .map_err(|e| StoreError::Query(format!("message row parse: {e}")))?;

    let provenance = provenance_str
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok());

    Ok(MirrorMessage {
        thread_id: Uuid::parse_str(&thread_str)
            .map_err(|e| StoreError::Query(format!("message thread id parse: {e}")))?,
        alt,
        seq,
        role,
        content,
        provenance,
        created_at: parse_datetime(&created_str),
    })
}

#[async_trait]
impl ThreadStore for LibSqlThreadStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(SCHEMA)
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create schema: {e}")))?;
        Ok(())
    }

    async fn find_threads_by_search_key(
        &self,
        group_id: &str,
        search_key: &str,
    ) -> Result<Vec<ThreadRecord>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, group_id, title, search_key, created_at
                 FROM threads WHERE group_id = ?1 AND search_key = ?2
                 ORDER BY created_at ASC",
                params![group_id, search_key],
            )
            .await
            .map_err(|e| query_err("find_threads_by_search_key", e))?;

        let mut threads = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("find_threads_by_search_key", e))?
        {
            threads.push(row_to_thread(&row)?);
        }
        Ok(threads)
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<ThreadRecord>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, group_id, title, search_key, created_at
                 FROM threads WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| query_err("get_thread", e))?;

        match rows.next().await.map_err(|e| query_err("get_thread", e))? {
            Some(row) => Ok(Some(row_to_thread(&row)?)),
            None => Ok(None),
        }
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
        self.conn
            .execute(
                "INSERT INTO threads (id, group_id, title, search_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id.to_string(),
                    record.group_id.clone(),
                    record.title.clone(),
                    record.search_key.clone(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| query_err("create_thread", e))?;
        Ok(record)
    }

    async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<MirrorMessage>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT thread_id, alt, seq, role, content, provenance, created_at
                 FROM thread_messages WHERE thread_id = ?1
                 ORDER BY alt ASC, seq ASC",
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| query_err("list_messages", e))?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| query_err("list_messages", e))? {
            messages.push(row_to_message(&row)?);
        }
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

        self.conn
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| query_err("append_batch begin", e))?;

        let now = Utc::now().to_rfc3339();
        for msg in &batch {
            let provenance = serde_json::to_string(&msg.provenance)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let inserted = self
                .conn
                .execute(
                    "INSERT INTO thread_messages
                     (thread_id, alt, seq, role, content, provenance, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        thread_id.to_string(),
                        msg.alt,
                        msg.seq,
                        msg.role.clone(),
                        msg.content.clone(),
                        provenance,
                        now.clone(),
                    ],
                )
                .await
                .map_err(|e| query_err("append_batch insert", e));
            if let Err(e) = inserted {
                // Roll back so a partial batch never becomes visible.
                let _ = self.conn.execute("ROLLBACK", ()).await;
                return Err(e);
            }
        }

        self.conn
            .execute("COMMIT", ())
            .await
            .map_err(|e| query_err("append_batch commit", e))?;
        Ok(())
    }
}
