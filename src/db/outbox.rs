//! Outbox rows. Inserted by [`MembershipStore::apply`]; drained by the
//! dispatcher.
//!
//! [`MembershipStore::apply`]: crate::capabilities::MembershipStore::apply

use super::Database;
use crate::capabilities::{OutboxEvent, OutboxStore};
use crate::error::Result;
use crate::events::OutboundMessage;
use crate::types::Timestamp;
use rusqlite::params;

impl Database {
    /// Dead-lettered events, oldest first.
    pub fn dead_letters(&self) -> Result<Vec<OutboxEvent>> {
        self.select_events("WHERE failed_at IS NOT NULL ORDER BY seq", usize::MAX)
    }

    /// Sent events not yet pruned.
    pub fn sent_events(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbox_events WHERE sent_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn select_events(&self, filter: &str, limit: usize) -> Result<Vec<OutboxEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            r#"
            SELECT seq, topic, key, payload, attempts, last_error, created_at
            FROM outbox_events
            {filter}
            LIMIT ?1
            "#
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok(OutboxEvent {
                seq: row.get(0)?,
                message: OutboundMessage {
                    topic: row.get(1)?,
                    key: row.get(2)?,
                    payload: row.get(3)?,
                },
                attempts: row.get(4)?,
                last_error: row.get(5)?,
                created_at: Timestamp(row.get(6)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl OutboxStore for Database {
    fn pending(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        self.select_events(
            "WHERE sent_at IS NULL AND failed_at IS NULL ORDER BY seq",
            limit,
        )
    }

    fn mark_sent(&self, seq: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE outbox_events SET sent_at = ?2 WHERE seq = ?1",
            params![seq, Timestamp::now().0],
        )?;
        Ok(())
    }

    fn record_failure(&self, seq: i64, error: &str) -> Result<u32> {
        let conn = self.conn.lock();
        let attempts = conn.query_row(
            r#"
            UPDATE outbox_events
            SET attempts = attempts + 1, last_error = ?2
            WHERE seq = ?1
            RETURNING attempts
            "#,
            params![seq, error],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    fn mark_dead_letter(&self, seq: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE outbox_events SET failed_at = ?2 WHERE seq = ?1",
            params![seq, Timestamp::now().0],
        )?;
        Ok(())
    }

    fn prune_sent(&self, before: Timestamp) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM outbox_events WHERE sent_at IS NOT NULL AND sent_at <= ?1",
            params![before.0],
        )?;
        Ok(deleted)
    }
}
