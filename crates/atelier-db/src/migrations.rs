use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS threads (
            id          TEXT PRIMARY KEY,
            topic       TEXT NOT NULL DEFAULT '',
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS thread_participants (
            thread_id   TEXT NOT NULL REFERENCES threads(id),
            user_id     TEXT NOT NULL,
            PRIMARY KEY (thread_id, user_id)
        );

        -- created_at / edited_at are microseconds since the epoch so that
        -- ORDER BY created_at, id gives the same total order as the clients.
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            thread_id       TEXT NOT NULL REFERENCES threads(id),
            author_id       TEXT NOT NULL,
            content         TEXT NOT NULL,
            attachments     TEXT NOT NULL DEFAULT '[]',
            reactions       TEXT NOT NULL DEFAULT '[]',
            created_at      INTEGER NOT NULL,
            edited_at       INTEGER,
            tombstoned      INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_thread_order
            ON messages(thread_id, created_at, id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
