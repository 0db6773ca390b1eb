//! SQLite conversation store.
//!
//! Implements `ConversationPersistence` from `runloop-core` using sqlx with
//! split read/write pools. Records live in `conversation_messages`; threads
//! are ordered lists of record ids in `thread_messages`, with the tip
//! tracked on `conversation_threads`. Each write runs in one transaction on
//! the single writer connection.

use chrono::{DateTime, Utc};
use runloop_core::repository::ConversationPersistence;
use runloop_types::conversation::{ConversationChain, ConversationMessage, Summary, new_id};
use runloop_types::error::RepositoryError;
use runloop_types::message::{Message, Meta};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ConversationPersistence`.
pub struct SqliteConversationStore {
    pool: DatabasePool,
}

impl SqliteConversationStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Ids of the threads of `conversation_id`, oldest first.
    pub async fn list_threads(
        &self,
        namespace: &str,
        conversation_id: &str,
    ) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT thread_id FROM conversation_threads
             WHERE namespace = ? AND conversation_id = ?
             ORDER BY created_at, thread_id",
        )
        .bind(namespace)
        .bind(conversation_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Tip record id of `thread_id`.
    pub async fn thread_tip(
        &self,
        namespace: &str,
        thread_id: &str,
    ) -> Result<Option<String>, RepositoryError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT tip_message_id FROM conversation_threads WHERE namespace = ? AND thread_id = ?",
        )
        .bind(namespace)
        .bind(thread_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;
        Ok(row.map(|(tip,)| tip))
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct MessageRow {
    message_id: String,
    thread_id: String,
    conversation_id: String,
    previous_message_id: Option<String>,
    messages: String,
    meta: String,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            message_id: row.try_get("message_id")?,
            thread_id: row.try_get("thread_id")?,
            conversation_id: row.try_get("conversation_id")?,
            previous_message_id: row.try_get("previous_message_id")?,
            messages: row.try_get("messages")?,
            meta: row.try_get("meta")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_record(self) -> Result<ConversationMessage, RepositoryError> {
        Ok(ConversationMessage {
            messages: decode_json(&self.messages, "messages")?,
            meta: decode_json(&self.meta, "meta")?,
            created_at: parse_datetime(&self.created_at)?,
            message_id: self.message_id,
            thread_id: self.thread_id,
            conversation_id: self.conversation_id,
            previous_message_id: self.previous_message_id,
        })
    }
}

struct SummaryRow {
    id: String,
    thread_id: String,
    summary_message: String,
    last_summarized_message_id: String,
    meta: String,
    created_at: String,
}

impl SummaryRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            thread_id: row.try_get("thread_id")?,
            summary_message: row.try_get("summary_message")?,
            last_summarized_message_id: row.try_get("last_summarized_message_id")?,
            meta: row.try_get("meta")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_summary(self) -> Result<Summary, RepositoryError> {
        Ok(Summary {
            summary_message: decode_json(&self.summary_message, "summary_message")?,
            meta: decode_json(&self.meta, "meta")?,
            created_at: parse_datetime(&self.created_at)?,
            id: self.id,
            thread_id: self.thread_id,
            last_summarized_message_id: self.last_summarized_message_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn decode_json<T: serde::de::DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

fn encode_json<T: serde::Serialize>(value: &T, column: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("serialize {column}: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// ConversationPersistence impl
// ---------------------------------------------------------------------------

impl ConversationPersistence for SqliteConversationStore {
    async fn new_conversation_id(&self) -> Result<String, RepositoryError> {
        Ok(new_id("conv"))
    }

    async fn new_run_id(&self) -> Result<String, RepositoryError> {
        Ok(new_id("msg"))
    }

    async fn load_messages(
        &self,
        namespace: &str,
        previous_message_id: Option<&str>,
    ) -> Result<ConversationChain, RepositoryError> {
        let Some(cursor) = previous_message_id else {
            return Ok(ConversationChain::default());
        };

        // Home thread of the cursor and its position there.
        let located: Option<(String, i64)> = sqlx::query_as(
            "SELECT m.thread_id, tm.position
             FROM conversation_messages m
             JOIN thread_messages tm
               ON tm.namespace = m.namespace
              AND tm.thread_id = m.thread_id
              AND tm.message_id = m.message_id
             WHERE m.namespace = ? AND m.message_id = ?",
        )
        .bind(namespace)
        .bind(cursor)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;
        let Some((thread_id, position)) = located else {
            return Ok(ConversationChain::default());
        };

        // A summary applies when its boundary lies strictly before the cursor.
        let summary_row = sqlx::query(
            "SELECT s.*, tm.position AS boundary
             FROM conversation_summaries s
             JOIN thread_messages tm
               ON tm.namespace = s.namespace
              AND tm.thread_id = s.thread_id
              AND tm.message_id = s.last_summarized_message_id
             WHERE s.namespace = ? AND s.thread_id = ? AND tm.position < ?",
        )
        .bind(namespace)
        .bind(&thread_id)
        .bind(position)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let (start, summary) = match summary_row {
            Some(row) => {
                let boundary: i64 = row.try_get("boundary").map_err(query_err)?;
                let summary = SummaryRow::from_row(&row).map_err(query_err)?.into_summary()?;
                (boundary + 1, Some(summary))
            }
            None => (0, None),
        };

        let rows = sqlx::query(
            "SELECT m.*
             FROM thread_messages tm
             JOIN conversation_messages m
               ON m.namespace = tm.namespace AND m.message_id = tm.message_id
             WHERE tm.namespace = ? AND tm.thread_id = ? AND tm.position BETWEEN ? AND ?
             ORDER BY tm.position",
        )
        .bind(namespace)
        .bind(&thread_id)
        .bind(start)
        .bind(position)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(MessageRow::from_row(row).map_err(query_err)?.into_record()?);
        }
        Ok(ConversationChain { records, summary })
    }

    async fn save_messages(
        &self,
        namespace: &str,
        message_id: &str,
        previous_message_id: Option<&str>,
        conversation_id: &str,
        messages: &[Message],
        meta: &Meta,
    ) -> Result<String, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let existing: Option<(String, String, String)> = sqlx::query_as(
            "SELECT messages, meta, thread_id FROM conversation_messages
             WHERE namespace = ? AND message_id = ?",
        )
        .bind(namespace)
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_err)?;

        if let Some((stored_messages, stored_meta, thread_id)) = existing {
            let mut stored: Vec<Message> = decode_json(&stored_messages, "messages")?;
            let stored_meta: Meta = decode_json(&stored_meta, "meta")?;
            if stored.ends_with(messages) && &stored_meta == meta {
                tracing::debug!(namespace, message_id, "replayed checkpoint ignored");
                return Ok(thread_id);
            }
            stored.extend_from_slice(messages);

            sqlx::query(
                "UPDATE conversation_messages SET messages = ?, meta = ?
                 WHERE namespace = ? AND message_id = ?",
            )
            .bind(encode_json(&stored, "messages")?)
            .bind(encode_json(meta, "meta")?)
            .bind(namespace)
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

            tx.commit().await.map_err(query_err)?;
            return Ok(thread_id);
        }

        let now = format_datetime(&Utc::now());
        let thread_id = match previous_message_id {
            None => {
                let thread_id = new_id("thread");
                sqlx::query(
                    "INSERT INTO conversation_threads
                     (namespace, thread_id, conversation_id, parent_thread_id, tip_message_id, created_at)
                     VALUES (?, ?, ?, NULL, ?, ?)",
                )
                .bind(namespace)
                .bind(&thread_id)
                .bind(conversation_id)
                .bind(message_id)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
                insert_thread_entry(&mut tx, namespace, &thread_id, 0, message_id).await?;
                thread_id
            }
            Some(previous) => {
                let parent: Option<(String, i64, String)> = sqlx::query_as(
                    "SELECT m.thread_id, tm.position, t.tip_message_id
                     FROM conversation_messages m
                     JOIN thread_messages tm
                       ON tm.namespace = m.namespace
                      AND tm.thread_id = m.thread_id
                      AND tm.message_id = m.message_id
                     JOIN conversation_threads t
                       ON t.namespace = m.namespace AND t.thread_id = m.thread_id
                     WHERE m.namespace = ? AND m.message_id = ?",
                )
                .bind(namespace)
                .bind(previous)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_err)?;
                let (parent_id, position, tip) = parent.ok_or(RepositoryError::NotFound)?;

                if tip == previous {
                    insert_thread_entry(&mut tx, namespace, &parent_id, position + 1, message_id)
                        .await?;
                    sqlx::query(
                        "UPDATE conversation_threads SET tip_message_id = ?
                         WHERE namespace = ? AND thread_id = ?",
                    )
                    .bind(message_id)
                    .bind(namespace)
                    .bind(&parent_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_err)?;
                    parent_id
                } else {
                    fork_thread(
                        &mut tx,
                        namespace,
                        conversation_id,
                        &parent_id,
                        position,
                        message_id,
                        &now,
                    )
                    .await?
                }
            }
        };

        sqlx::query(
            "INSERT INTO conversation_messages
             (namespace, message_id, thread_id, conversation_id, previous_message_id, messages, meta, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(namespace)
        .bind(message_id)
        .bind(&thread_id)
        .bind(conversation_id)
        .bind(previous_message_id)
        .bind(encode_json(&messages, "messages")?)
        .bind(encode_json(meta, "meta")?)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(thread_id)
    }

    async fn save_summary(&self, namespace: &str, summary: &Summary) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation_summaries
             (namespace, thread_id, id, summary_message, last_summarized_message_id, meta, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (namespace, thread_id) DO UPDATE SET
                id = excluded.id,
                summary_message = excluded.summary_message,
                last_summarized_message_id = excluded.last_summarized_message_id,
                meta = excluded.meta,
                created_at = excluded.created_at",
        )
        .bind(namespace)
        .bind(&summary.thread_id)
        .bind(&summary.id)
        .bind(encode_json(&summary.summary_message, "summary_message")?)
        .bind(&summary.last_summarized_message_id)
        .bind(encode_json(&summary.meta, "meta")?)
        .bind(format_datetime(&summary.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("FOREIGN KEY") {
                    return RepositoryError::NotFound;
                }
            }
            query_err(e)
        })?;
        Ok(())
    }
}

async fn insert_thread_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    namespace: &str,
    thread_id: &str,
    position: i64,
    message_id: &str,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO thread_messages (namespace, thread_id, position, message_id) VALUES (?, ?, ?, ?)",
    )
    .bind(namespace)
    .bind(thread_id)
    .bind(position)
    .bind(message_id)
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;
    Ok(())
}

/// Copy `parent_id` up to and including `position` into a new thread ending
/// at `message_id`. The parent's summary comes along when its boundary lies
/// inside the copied prefix.
async fn fork_thread(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    namespace: &str,
    conversation_id: &str,
    parent_id: &str,
    position: i64,
    message_id: &str,
    now: &str,
) -> Result<String, RepositoryError> {
    let thread_id = new_id("thread");
    tracing::debug!(namespace, parent = parent_id, thread_id = %thread_id, "forking thread");

    sqlx::query(
        "INSERT INTO conversation_threads
         (namespace, thread_id, conversation_id, parent_thread_id, tip_message_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(namespace)
    .bind(&thread_id)
    .bind(conversation_id)
    .bind(parent_id)
    .bind(message_id)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;

    sqlx::query(
        "INSERT INTO thread_messages (namespace, thread_id, position, message_id)
         SELECT namespace, ?, position, message_id FROM thread_messages
         WHERE namespace = ? AND thread_id = ? AND position <= ?",
    )
    .bind(&thread_id)
    .bind(namespace)
    .bind(parent_id)
    .bind(position)
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;

    insert_thread_entry(tx, namespace, &thread_id, position + 1, message_id).await?;

    sqlx::query(
        "INSERT INTO conversation_summaries
         (namespace, thread_id, id, summary_message, last_summarized_message_id, meta, created_at)
         SELECT s.namespace, ?, ?, s.summary_message, s.last_summarized_message_id, s.meta, s.created_at
         FROM conversation_summaries s
         JOIN thread_messages tm
           ON tm.namespace = s.namespace
          AND tm.thread_id = s.thread_id
          AND tm.message_id = s.last_summarized_message_id
         WHERE s.namespace = ? AND s.thread_id = ? AND tm.position <= ?",
    )
    .bind(&thread_id)
    .bind(new_id("sum"))
    .bind(namespace)
    .bind(parent_id)
    .bind(position)
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;

    Ok(thread_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store() -> (SqliteConversationStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteConversationStore::new(pool), dir)
    }

    async fn save(store: &SqliteConversationStore, id: &str, prev: Option<&str>, text: &str) -> String {
        store
            .save_messages("ns", id, prev, "conv_1", &[Message::user(text)], &Meta::new())
            .await
            .unwrap()
    }

    fn ids(chain: &ConversationChain) -> Vec<&str> {
        chain.records.iter().map(|r| r.message_id.as_str()).collect()
    }

    fn summary(thread_id: &str, boundary: &str) -> Summary {
        Summary {
            id: "sum_1".into(),
            thread_id: thread_id.into(),
            summary_message: Message::system("earlier"),
            last_summarized_message_id: boundary.into(),
            meta: Meta::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let (store, _dir) = test_store().await;
        let mut meta = Meta::new();
        meta.insert("run_state".into(), json!({"current_step": "complete"}));
        store
            .save_messages(
                "ns",
                "m1",
                None,
                "conv_1",
                &[Message::user("hi"), Message::assistant("a1", "hello")],
                &meta,
            )
            .await
            .unwrap();

        let chain = store.load_messages("ns", Some("m1")).await.unwrap();
        assert_eq!(chain.records.len(), 1);
        let record = &chain.records[0];
        assert_eq!(record.conversation_id, "conv_1");
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.meta, meta);
        assert!(record.previous_message_id.is_none());
    }

    #[tokio::test]
    async fn test_linear_thread_advances_tip() {
        let (store, _dir) = test_store().await;
        save(&store, "m1", None, "one").await;
        save(&store, "m2", Some("m1"), "two").await;
        save(&store, "m3", Some("m2"), "three").await;

        let chain = store.load_messages("ns", Some("m3")).await.unwrap();
        assert_eq!(ids(&chain), vec!["m1", "m2", "m3"]);
        let thread_id = chain.records[0].thread_id.clone();
        assert_eq!(store.thread_tip("ns", &thread_id).await.unwrap().as_deref(), Some("m3"));

        let chain = store.load_messages("ns", Some("m2")).await.unwrap();
        assert_eq!(ids(&chain), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_branching_copies_prefix() {
        let (store, _dir) = test_store().await;
        save(&store, "m1", None, "one").await;
        save(&store, "m2", Some("m1"), "two").await;
        let main_thread = save(&store, "m3", Some("m2"), "three").await;
        let fork_thread = save(&store, "b3", Some("m2"), "branch").await;
        assert_ne!(main_thread, fork_thread);
        assert_eq!(save(&store, "b4", Some("b3"), "more").await, fork_thread);

        let original = store.load_messages("ns", Some("m3")).await.unwrap();
        let branch = store.load_messages("ns", Some("b4")).await.unwrap();
        assert_eq!(ids(&original), vec!["m1", "m2", "m3"]);
        assert_eq!(ids(&branch), vec!["m1", "m2", "b3", "b4"]);
        assert_eq!(branch.records[3].thread_id, fork_thread);
        assert_eq!(store.list_threads("ns", "conv_1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replayed_checkpoint_is_noop() {
        let (store, _dir) = test_store().await;
        let msgs = [Message::user("hi")];
        store
            .save_messages("ns", "m1", None, "conv_1", &msgs, &Meta::new())
            .await
            .unwrap();
        store
            .save_messages("ns", "m1", None, "conv_1", &msgs, &Meta::new())
            .await
            .unwrap();
        store
            .save_messages("ns", "m1", None, "conv_1", &[Message::assistant("a1", "yo")], &Meta::new())
            .await
            .unwrap();

        let chain = store.load_messages("ns", Some("m1")).await.unwrap();
        assert_eq!(chain.records[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn test_summary_applies_before_cursor_and_is_inherited() {
        let (store, _dir) = test_store().await;
        save(&store, "m1", None, "one").await;
        save(&store, "m2", Some("m1"), "two").await;
        save(&store, "m3", Some("m2"), "three").await;
        let thread_id = store.load_messages("ns", Some("m1")).await.unwrap().records[0]
            .thread_id
            .clone();
        store.save_summary("ns", &summary(&thread_id, "m1")).await.unwrap();

        let chain = store.load_messages("ns", Some("m3")).await.unwrap();
        assert_eq!(ids(&chain), vec!["m2", "m3"]);
        assert_eq!(chain.summary.as_ref().unwrap().summary_message, Message::system("earlier"));

        let at_boundary = store.load_messages("ns", Some("m1")).await.unwrap();
        assert!(at_boundary.summary.is_none());

        save(&store, "b3", Some("m2"), "branch").await;
        let branch = store.load_messages("ns", Some("b3")).await.unwrap();
        assert_eq!(ids(&branch), vec!["m2", "b3"]);
        let inherited = branch.summary.unwrap();
        assert_ne!(inherited.thread_id, thread_id);
        assert_ne!(inherited.id, "sum_1");
    }

    #[tokio::test]
    async fn test_unknown_previous_is_not_found() {
        let (store, _dir) = test_store().await;
        let err = store
            .save_messages("ns", "m1", Some("ghost"), "conv_1", &[], &Meta::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
        assert!(store.load_messages("ns", Some("ghost")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summary_for_unknown_thread_is_not_found() {
        let (store, _dir) = test_store().await;
        let err = store
            .save_summary("ns", &summary("thread_ghost", "m1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }
}
