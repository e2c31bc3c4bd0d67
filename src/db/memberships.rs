//! Membership rows and the atomic mutation batch.

use super::{transaction_error, Database};
use crate::capabilities::{MembershipBatch, MembershipStore, RemovalGuard, RemovalOutcome};
use crate::error::Result;
use crate::types::{Membership, SegmentId, Slug, Timestamp, UserId};
use rusqlite::{params, OptionalExtension, Row, Transaction};

const MEMBERSHIP_COLUMNS: &str = r#"
    SELECT us.user_id, us.segment_id, s.slug, us.ttl
    FROM user_segments us
    JOIN segments s ON s.id = us.segment_id
"#;

impl Database {
    /// Every membership row, ordered by user then slug.
    pub fn all_memberships(&self) -> Result<Vec<Membership>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{MEMBERSHIP_COLUMNS} ORDER BY us.user_id, s.slug"
        ))?;
        let rows = stmt.query_map([], membership_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        user_id: UserId(row.get(0)?),
        segment_id: SegmentId(row.get(1)?),
        segment: Slug::new(row.get::<_, String>(2)?),
        ttl: row.get::<_, Option<i64>>(3)?.map(Timestamp),
    })
}

/// Upserts, then deletes, then outbox rows.
fn write_batch(tx: &Transaction<'_>, batch: &MembershipBatch) -> rusqlite::Result<()> {
    let user_id = batch.user_id.0;
    let ttl = batch.ttl.map(|t| t.0);

    let mut upsert = tx.prepare_cached(
        r#"
        INSERT INTO user_segments(user_id, segment_id, ttl) VALUES (?1, ?2, ?3)
        ON CONFLICT(user_id, segment_id) DO UPDATE SET ttl = excluded.ttl
        "#,
    )?;
    for segment_id in &batch.upserts {
        upsert.execute(params![user_id, segment_id.0, ttl])?;
    }

    let mut delete =
        tx.prepare_cached("DELETE FROM user_segments WHERE user_id = ?1 AND segment_id = ?2")?;
    for segment_id in &batch.deletes {
        delete.execute(params![user_id, segment_id.0])?;
    }

    if !batch.outbox.is_empty() {
        let now = Timestamp::now().0;
        let mut enqueue = tx.prepare_cached(
            "INSERT INTO outbox_events(topic, key, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for message in &batch.outbox {
            enqueue.execute(params![message.topic, message.key, message.payload, now])?;
        }
    }

    Ok(())
}

impl MembershipStore for Database {
    fn apply(&self, batch: &MembershipBatch) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(transaction_error)?;
        write_batch(&tx, batch).map_err(transaction_error)?;
        tx.commit().map_err(transaction_error)
    }

    fn memberships_of(&self, user_id: UserId) -> Result<Vec<Membership>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{MEMBERSHIP_COLUMNS} WHERE us.user_id = ?1 ORDER BY s.slug"
        ))?;
        let rows = stmt.query_map(params![user_id.0], membership_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn remove_membership(
        &self,
        user_id: UserId,
        segment_id: SegmentId,
        guard: RemovalGuard,
    ) -> Result<RemovalOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current: Option<Option<i64>> = tx
            .query_row(
                "SELECT ttl FROM user_segments WHERE user_id = ?1 AND segment_id = ?2",
                params![user_id.0, segment_id.0],
                |row| row.get(0),
            )
            .optional()?;

        // Permanent rows have no deadline; no guard removes them.
        let outcome = match (current, guard) {
            (None, _) => RemovalOutcome::Absent,
            (Some(None), _) => RemovalOutcome::Superseded,
            (Some(Some(ttl)), RemovalGuard::ExpiringBy(deadline)) if ttl > deadline.0 => {
                RemovalOutcome::Superseded
            }
            (Some(Some(_)), _) => {
                tx.execute(
                    "DELETE FROM user_segments WHERE user_id = ?1 AND segment_id = ?2",
                    params![user_id.0, segment_id.0],
                )?;
                RemovalOutcome::Removed
            }
        };

        tx.commit()?;
        Ok(outcome)
    }
}
