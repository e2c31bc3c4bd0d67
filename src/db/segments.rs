//! Subjects and segments: existence checks, slug resolution, seeding.

use super::Database;
use crate::capabilities::{Resolution, SegmentResolver, SubjectDirectory};
use crate::error::Result;
use crate::types::{SegmentId, Slug, UserId};
use rusqlite::{params, OptionalExtension};

impl Database {
    /// Create or rename a subject.
    pub fn insert_user(&self, user_id: UserId, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO users(id, name) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            "#,
            params![user_id.0, name],
        )?;
        Ok(())
    }

    /// Create a segment if missing; returns its id either way.
    pub fn insert_segment(&self, slug: &Slug) -> Result<SegmentId> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO segments(slug) VALUES (?1) ON CONFLICT(slug) DO NOTHING",
            params![slug.as_str()],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM segments WHERE slug = ?1",
            params![slug.as_str()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(SegmentId(id))
    }
}

impl SubjectDirectory for Database {
    fn subject_exists(&self, user_id: UserId) -> Result<bool> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![user_id.0],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }
}

impl SegmentResolver for Database {
    fn lookup(&self, slugs: &[Slug]) -> Result<Resolution> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT id FROM segments WHERE slug = ?1")?;

        let mut resolution = Resolution::default();
        for slug in slugs {
            let id: Option<i64> = stmt
                .query_row(params![slug.as_str()], |row| row.get(0))
                .optional()?;
            match id {
                Some(id) => resolution.resolved.push((slug.clone(), SegmentId(id))),
                None => resolution.missing.push(slug.clone()),
            }
        }
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CohortError;

    #[test]
    fn test_subject_exists() {
        let db = Database::open_in_memory().unwrap();
        db.insert_user(UserId(42), "bob").unwrap();
        assert!(db.subject_exists(UserId(42)).unwrap());
        assert!(!db.subject_exists(UserId(43)).unwrap());
    }

    #[test]
    fn test_insert_segment_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let first = db.insert_segment(&Slug::from("PROMO")).unwrap();
        let again = db.insert_segment(&Slug::from("PROMO")).unwrap();
        let other = db.insert_segment(&Slug::from("VIP")).unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
    }

    #[test]
    fn test_lookup_reports_every_miss() {
        let db = Database::open_in_memory().unwrap();
        let promo = db.insert_segment(&Slug::from("PROMO")).unwrap();

        let resolution = db
            .lookup(&[Slug::from("PROMO"), Slug::from("GONE"), Slug::from("NOPE")])
            .unwrap();
        assert_eq!(resolution.resolved, vec![(Slug::from("PROMO"), promo)]);
        assert_eq!(resolution.missing, vec![Slug::from("GONE"), Slug::from("NOPE")]);

        match db.resolve_many(&[Slug::from("PROMO"), Slug::from("GONE")]) {
            Err(CohortError::SegmentNotFound(missing)) => {
                assert_eq!(missing, vec![Slug::from("GONE")])
            }
            other => panic!("expected SegmentNotFound, got {:?}", other),
        }
    }
}
