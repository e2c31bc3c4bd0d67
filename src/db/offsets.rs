use super::Database;
use crate::capabilities::OffsetStore;
use crate::error::Result;
use rusqlite::{params, OptionalExtension};

impl OffsetStore for Database {
    fn committed(&self, topic: &str, partition: u32) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let offset: Option<i64> = conn
            .query_row(
                "SELECT next_offset FROM consumer_offsets WHERE topic = ?1 AND partition_id = ?2",
                params![topic, partition],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.map(|o| o as u64))
    }

    fn commit(&self, topic: &str, partition: u32, next_offset: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO consumer_offsets(topic, partition_id, next_offset) VALUES (?1, ?2, ?3)
            ON CONFLICT(topic, partition_id) DO UPDATE SET next_offset = excluded.next_offset
            "#,
            params![topic, partition, next_offset as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_overwrites() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.committed("segment_expiry", 0).unwrap(), None);

        db.commit("segment_expiry", 0, 3).unwrap();
        db.commit("segment_expiry", 0, 7).unwrap();
        db.commit("segment_expiry", 1, 1).unwrap();

        assert_eq!(db.committed("segment_expiry", 0).unwrap(), Some(7));
        assert_eq!(db.committed("segment_expiry", 1).unwrap(), Some(1));
    }
}
