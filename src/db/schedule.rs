use super::Database;
use crate::capabilities::ExpirySchedule;
use crate::error::Result;
use crate::events::ExpiryInstruction;
use crate::types::{Slug, Timestamp, UserId};
use rusqlite::params;

impl Database {
    /// Number of deferred instructions, due or not.
    pub fn scheduled_expiries(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM expiry_schedule", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl ExpirySchedule for Database {
    fn defer(&self, instruction: &ExpiryInstruction) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO expiry_schedule(user_id, segment_slug, ttl, scheduled_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, segment_slug, ttl) DO NOTHING
            "#,
            params![
                instruction.user_id.0,
                instruction.segment.as_str(),
                instruction.ttl.0,
                Timestamp::now().0
            ],
        )?;
        Ok(())
    }

    fn due(&self, now: Timestamp, limit: usize) -> Result<Vec<ExpiryInstruction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT user_id, segment_slug, ttl
            FROM expiry_schedule
            WHERE ttl <= ?1
            ORDER BY ttl, user_id, segment_slug
            LIMIT ?2
            "#,
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![now.0, limit], |row| {
            Ok(ExpiryInstruction {
                user_id: UserId(row.get(0)?),
                segment: Slug::new(row.get::<_, String>(1)?),
                ttl: Timestamp(row.get(2)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn complete(&self, instruction: &ExpiryInstruction) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM expiry_schedule WHERE user_id = ?1 AND segment_slug = ?2 AND ttl = ?3",
            params![
                instruction.user_id.0,
                instruction.segment.as_str(),
                instruction.ttl.0
            ],
        )?;
        Ok(())
    }
}
