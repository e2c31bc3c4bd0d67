use crate::error::Result;
use rusqlite::Connection;

/// Install the schema. Every statement is idempotent.
pub(super) fn migrate(conn: &Connection, on_disk: bool) -> Result<()> {
    if on_disk {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            "#,
        )?;
    }
    conn.pragma_update(None, "foreign_keys", true)?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
          id INTEGER PRIMARY KEY,
          name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS segments (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          slug TEXT NOT NULL UNIQUE
        );

        -- ttl: microseconds since the Unix epoch, NULL = permanent
        CREATE TABLE IF NOT EXISTS user_segments (
          user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
          segment_id INTEGER NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
          ttl INTEGER,
          UNIQUE (user_id, segment_id)
        );

        CREATE TABLE IF NOT EXISTS user_segments_history (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          user_id INTEGER NOT NULL,
          segment_slug TEXT NOT NULL,
          operation_type TEXT NOT NULL CHECK (operation_type IN ('ADD', 'DELETE')),
          operation_date INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_user_date
          ON user_segments_history(user_id, operation_date);

        CREATE TABLE IF NOT EXISTS outbox_events (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          topic TEXT NOT NULL,
          key TEXT NOT NULL,
          payload BLOB NOT NULL,
          attempts INTEGER NOT NULL DEFAULT 0,
          last_error TEXT,
          created_at INTEGER NOT NULL,
          sent_at INTEGER,
          failed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_pending
          ON outbox_events(seq) WHERE sent_at IS NULL AND failed_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_outbox_sent
          ON outbox_events(sent_at) WHERE sent_at IS NOT NULL;

        CREATE TABLE IF NOT EXISTS expiry_schedule (
          user_id INTEGER NOT NULL,
          segment_slug TEXT NOT NULL,
          ttl INTEGER NOT NULL,
          scheduled_at INTEGER NOT NULL,
          PRIMARY KEY (user_id, segment_slug, ttl)
        );
        CREATE INDEX IF NOT EXISTS idx_expiry_schedule_ttl
          ON expiry_schedule(ttl);

        CREATE TABLE IF NOT EXISTS consumer_offsets (
          topic TEXT NOT NULL,
          partition_id INTEGER NOT NULL,
          next_offset INTEGER NOT NULL,
          PRIMARY KEY (topic, partition_id)
        );
        "#,
    )?;

    Ok(())
}
