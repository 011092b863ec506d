use crate::Database;
use crate::models::{MessageRow, ThreadRow};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

use atelier_types::api::WireMessage;
use atelier_types::models::{Message, MessagePatch};
use atelier_types::validate;

/// Why a message update was refused.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("message {0} not found")]
    NotFound(String),
    #[error("message {0} is deleted")]
    Tombstoned(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Database {
    // -- Threads --

    /// Create the thread row on first access. Idempotent.
    pub fn ensure_thread(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO threads (id, created_at) VALUES (?1, ?2)",
                rusqlite::params![id, now.timestamp_micros()],
            )?;
            Ok(())
        })
    }

    pub fn add_participant(&self, thread_id: &str, user_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO thread_participants (thread_id, user_id) VALUES (?1, ?2)",
                (thread_id, user_id),
            )?;
            Ok(())
        })
    }

    pub fn get_thread(&self, id: &str) -> Result<Option<ThreadRow>> {
        self.with_conn(|conn| query_thread(conn, id))
    }

    // -- Messages --

    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let row = MessageRow::from_message(message)?;
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, thread_id, author_id, content, attachments, reactions, created_at, edited_at, tombstoned)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    row.id,
                    row.thread_id,
                    row.author_id,
                    row.content,
                    row.attachments,
                    row.reactions,
                    row.created_at,
                    row.edited_at,
                    row.tombstoned,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<WireMessage>> {
        self.with_conn(|conn| Ok(query_message(conn, id)?.map(|row| row.to_wire())))
    }

    /// Newest-first window of `limit` messages strictly older than `before`
    /// (`(created_at micros, id)`), returned oldest first.
    pub fn get_page(
        &self,
        thread_id: &str,
        before: Option<(i64, &str)>,
        limit: u32,
    ) -> Result<Vec<WireMessage>> {
        self.with_conn(|conn| {
            let mut rows = query_page(conn, thread_id, before, limit)?;
            rows.reverse();
            Ok(rows.iter().map(MessageRow::to_wire).collect())
        })
    }

    /// Apply a patch to a stored message and return the new row.
    ///
    /// Deleted messages are frozen: any update to them is refused. Content or
    /// attachment changes stamp `edited_at` with `now`.
    pub fn update_message(
        &self,
        id: &str,
        patch: &MessagePatch,
        now: DateTime<Utc>,
    ) -> Result<WireMessage, UpdateError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(row) = query_message(&tx, id)? else {
                return Ok(Err(UpdateError::NotFound(id.to_string())));
            };
            if row.tombstoned {
                return Ok(Err(UpdateError::Tombstoned(id.to_string())));
            }

            let mut message = validate::message(row.to_wire()).value;
            let edited = MessagePatch {
                edited_at: None,
                ..patch.clone()
            };
            let before = message.clone();
            message.apply_patch(&edited);
            if !message.tombstoned
                && (message.content != before.content || message.attachments != before.attachments)
            {
                message.edited_at = Some(now);
            }

            let updated = MessageRow::from_message(&message)?;
            tx.execute(
                "UPDATE messages
                 SET content = ?2, attachments = ?3, reactions = ?4, edited_at = ?5, tombstoned = ?6
                 WHERE id = ?1",
                rusqlite::params![
                    updated.id,
                    updated.content,
                    updated.attachments,
                    updated.reactions,
                    updated.edited_at,
                    updated.tombstoned,
                ],
            )?;
            tx.commit()?;

            Ok(Ok(updated.to_wire()))
        })?
    }
}

fn query_thread(conn: &Connection, id: &str) -> Result<Option<ThreadRow>> {
    let mut stmt = conn.prepare("SELECT id, topic, created_at FROM threads WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(ThreadRow {
                id: row.get(0)?,
                topic: row.get(1)?,
                created_at: row.get(2)?,
                participant_ids: Vec::new(),
            })
        })
        .optional()?;

    let Some(mut thread) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT user_id FROM thread_participants WHERE thread_id = ?1 ORDER BY user_id",
    )?;
    thread.participant_ids = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    Ok(Some(thread))
}

const MESSAGE_COLUMNS: &str =
    "id, thread_id, author_id, content, attachments, reactions, created_at, edited_at, tombstoned";

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        author_id: row.get(2)?,
        content: row.get(3)?,
        attachments: row.get(4)?,
        reactions: row.get(5)?,
        created_at: row.get(6)?,
        edited_at: row.get(7)?,
        tombstoned: row.get(8)?,
    })
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt.query_row([id], map_message).optional()?)
}

fn query_page(
    conn: &Connection,
    thread_id: &str,
    before: Option<(i64, &str)>,
    limit: u32,
) -> Result<Vec<MessageRow>> {
    // Compound cursor: equal timestamps fall back to the id so a page
    // boundary inside a burst of same-instant messages neither skips nor
    // repeats anything.
    let rows = match before {
        Some((created_at, id)) => {
            let sql = format!(
                "SELECT {} FROM messages
                 WHERE thread_id = ?1 AND (created_at < ?2 OR (created_at = ?2 AND id < ?3))
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?4",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(rusqlite::params![thread_id, created_at, id, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let sql = format!(
                "SELECT {} FROM messages
                 WHERE thread_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(rusqlite::params![thread_id, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
