use super::Database;
use crate::capabilities::HistoryRecorder;
use crate::error::Result;
use crate::types::{HistoryEntry, Slug, Timestamp, UserId};
use rusqlite::params;

impl HistoryRecorder for Database {
    fn record(&self, entry: &HistoryEntry) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO user_segments_history(user_id, segment_slug, operation_type, operation_date)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                entry.user_id.0,
                entry.segment_slug.as_str(),
                entry.operation_type.as_str(),
                entry.operation_date.0
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn query_range(
        &self,
        user_id: UserId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT id, segment_slug, operation_type, operation_date
            FROM user_segments_history
            WHERE user_id = ?1 AND operation_date BETWEEN ?2 AND ?3
            ORDER BY operation_date, id
            "#,
        )?;

        let rows = stmt.query_map(params![user_id.0, start.0, end.0], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        rows.map(|row| -> Result<HistoryEntry> {
            let (id, slug, operation, date) = row?;
            Ok(HistoryEntry {
                id: Some(id),
                user_id,
                segment_slug: Slug::new(slug),
                operation_type: operation.parse()?,
                operation_date: Timestamp(date),
            })
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;

    fn entry(user: i64, slug: &str, op: Operation, at: i64) -> HistoryEntry {
        HistoryEntry {
            id: None,
            user_id: UserId(user),
            segment_slug: Slug::from(slug),
            operation_type: op,
            operation_date: Timestamp(at),
        }
    }

    #[test]
    fn test_range_is_inclusive_and_ordered() {
        let db = Database::open_in_memory().unwrap();
        db.record(&entry(1, "B", Operation::Delete, 300)).unwrap();
        db.record(&entry(1, "A", Operation::Add, 100)).unwrap();
        db.record(&entry(1, "C", Operation::Add, 500)).unwrap();
        db.record(&entry(2, "A", Operation::Add, 200)).unwrap();

        let found = db.query_range(UserId(1), Timestamp(100), Timestamp(300)).unwrap();
        let slugs: Vec<&str> = found.iter().map(|e| e.segment_slug.as_str()).collect();
        assert_eq!(slugs, vec!["A", "B"]);
        assert_eq!(found[1].operation_type, Operation::Delete);
        assert!(found.iter().all(|e| e.id.is_some()));
    }

    #[test]
    fn test_record_returns_increasing_ids() {
        let db = Database::open_in_memory().unwrap();
        let first = db.record(&entry(1, "A", Operation::Add, 1)).unwrap();
        let second = db.record(&entry(1, "A", Operation::Add, 1)).unwrap();
        assert!(second > first);
    }
}
