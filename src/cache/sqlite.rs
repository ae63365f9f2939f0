// SQLite-backed metadata store.

use std::path::Path;

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::metadata::{MetadataStore, ResourceRecord, SessionRecord};

const SESSION_COLUMNS: &str = "session_id, etag, template_tag, html_digest, html_size, \
     template_update_time, cache_expired_time, unavailable_until, hit_count";

const RESOURCE_COLUMNS: &str = "resource_id, digest, size, expired_time";

pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open(db_path)?),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_data (
                session_id TEXT PRIMARY KEY,
                etag TEXT NOT NULL,
                template_tag TEXT NOT NULL DEFAULT '',
                html_digest TEXT NOT NULL,
                html_size INTEGER NOT NULL DEFAULT 0,
                template_update_time INTEGER NOT NULL DEFAULT 0,
                cache_expired_time INTEGER NOT NULL DEFAULT 0,
                unavailable_until INTEGER NOT NULL DEFAULT 0,
                hit_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_session_hit_count ON session_data(hit_count)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS resource_data (
                resource_id TEXT PRIMARY KEY,
                digest TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                expired_time INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        Ok(())
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        session_id: row.get(0)?,
        etag: row.get(1)?,
        template_tag: row.get(2)?,
        html_digest: row.get(3)?,
        html_size: row.get::<_, i64>(4)?.max(0) as u64,
        template_update_time: row.get(5)?,
        cache_expired_time: row.get(6)?,
        unavailable_until: row.get(7)?,
        hit_count: row.get::<_, i64>(8)?.max(0) as u32,
    })
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<ResourceRecord> {
    Ok(ResourceRecord {
        resource_id: row.get(0)?,
        digest: row.get(1)?,
        size: row.get::<_, i64>(2)?.max(0) as u64,
        expired_time: row.get(3)?,
    })
}

impl MetadataStore for SqliteMetadataStore {
    fn session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM session_data WHERE session_id = ?1", SESSION_COLUMNS),
                params![session_id],
                session_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn put_session(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO session_data ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                SESSION_COLUMNS
            ),
            params![
                &record.session_id,
                &record.etag,
                &record.template_tag,
                &record.html_digest,
                record.html_size as i64,
                record.template_update_time,
                record.cache_expired_time,
                record.unavailable_until,
                i64::from(record.hit_count),
            ],
        )?;
        Ok(())
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM session_data WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM session_data ORDER BY hit_count ASC, session_id ASC",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map([], session_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn increment_hit_count(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE session_data SET hit_count = hit_count + 1 WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    fn clear_sessions(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM session_data", [])?;
        Ok(())
    }

    fn resource(&self, resource_id: &str) -> Result<Option<ResourceRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM resource_data WHERE resource_id = ?1", RESOURCE_COLUMNS),
                params![resource_id],
                resource_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn put_resource(&self, record: &ResourceRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO resource_data ({}) VALUES (?1, ?2, ?3, ?4)",
                RESOURCE_COLUMNS
            ),
            params![
                &record.resource_id,
                &record.digest,
                record.size as i64,
                record.expired_time,
            ],
        )?;
        Ok(())
    }

    fn remove_resource(&self, resource_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM resource_data WHERE resource_id = ?1",
            params![resource_id],
        )?;
        Ok(())
    }

    fn list_resources(&self) -> Result<Vec<ResourceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM resource_data ORDER BY expired_time ASC, resource_id ASC",
            RESOURCE_COLUMNS
        ))?;
        let rows = stmt.query_map([], resource_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::metadata::{save_session, set_unavailable_until};

    #[test]
    fn test_session_crud() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let record = SessionRecord {
            session_id: "s1".into(),
            etag: "e1".into(),
            template_tag: "t1".into(),
            html_digest: "d1".into(),
            html_size: 42,
            cache_expired_time: 1000,
            ..SessionRecord::default()
        };
        store.put_session(&record).unwrap();
        assert_eq!(store.session("s1").unwrap(), Some(record.clone()));

        store.increment_hit_count("s1").unwrap();
        store.increment_hit_count("s1").unwrap();
        let mut updated = record.clone();
        updated.etag = "e2".into();
        save_session(&store, &updated).unwrap();
        let stored = store.session("s1").unwrap().unwrap();
        assert_eq!(stored.etag, "e2");
        assert_eq!(stored.hit_count, 2);

        store.remove_session("s1").unwrap();
        assert!(store.session("s1").unwrap().is_none());
    }

    #[test]
    fn test_unavailable_and_ordering() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        set_unavailable_until(&store, "busy", 99).unwrap();
        let mut hot = SessionRecord::new("hot");
        hot.hit_count = 5;
        store.put_session(&hot).unwrap();

        let ids: Vec<_> = store
            .list_sessions()
            .unwrap()
            .into_iter()
            .map(|r| r.session_id)
            .collect();
        assert_eq!(ids, vec!["busy".to_string(), "hot".to_string()]);
        assert_eq!(store.session("busy").unwrap().unwrap().unavailable_until, 99);

        store.clear_sessions().unwrap();
        assert!(store.list_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_resource_crud() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        for (id, expiry) in [("late", 200), ("early", 100)] {
            store
                .put_resource(&ResourceRecord {
                    resource_id: id.into(),
                    digest: "d".into(),
                    size: 3,
                    expired_time: expiry,
                })
                .unwrap();
        }
        let ids: Vec<_> = store
            .list_resources()
            .unwrap()
            .into_iter()
            .map(|r| r.resource_id)
            .collect();
        assert_eq!(ids, vec!["early".to_string(), "late".to_string()]);
        store.remove_resource("early").unwrap();
        assert!(store.resource("early").unwrap().is_none());
        assert_eq!(store.resource("late").unwrap().unwrap().size, 3);
    }
}
