use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use directories::ProjectDirs;
use rusqlite::{Connection, params};

use crate::api::models::Message;
use crate::{Error, Result};

fn db_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("com", "example", "MarketChat")?;
    Some(proj.data_dir().join("cache.sqlite"))
}

// Caches the last fetched history per conversation so something can be
// shown while the backend is unreachable.
pub struct MessageCache {
    conn: Connection,
}

impl MessageCache {
    pub fn open_default() -> Result<Self> {
        let path = db_path().ok_or_else(|| Error::Config("no data directory available".into()))?;
        Self::open(&path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                channel TEXT NOT NULL,
                seq INTEGER NOT NULL,
                raw_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (channel, seq)
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Replace the cached history of `channel`.
    pub fn store_history(&mut self, channel: &str, messages: &[Message]) -> Result<()> {
        let now = Utc::now().timestamp();
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE channel = ?1", params![channel])?;
        for (seq, message) in messages.iter().enumerate() {
            let raw = serde_json::to_string(message)?;
            tx.execute(
                "INSERT INTO messages (channel, seq, raw_json, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![channel, seq as i64, raw, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_history(&self, channel: &str) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare("SELECT raw_json FROM messages WHERE channel = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![channel], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_loads_in_order() {
        let mut cache = MessageCache::open_in_memory().unwrap();
        let history = vec![Message::outgoing("a", "b", "one"), Message::outgoing("b", "a", "two")];
        cache.store_history("private-chat-a-b", &history).unwrap();
        assert_eq!(cache.load_history("private-chat-a-b").unwrap(), history);
        assert!(cache.load_history("private-chat-a-c").unwrap().is_empty());
    }

    #[test]
    fn store_replaces_previous_history() {
        let mut cache = MessageCache::open_in_memory().unwrap();
        cache
            .store_history("c", &[Message::outgoing("a", "b", "old"), Message::outgoing("a", "b", "older")])
            .unwrap();
        cache.store_history("c", &[Message::outgoing("a", "b", "new")]).unwrap();
        let loaded = cache.load_history("c").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "new");
    }

    #[test]
    fn persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("cache.sqlite");
        {
            let mut cache = MessageCache::open(&path).unwrap();
            cache.store_history("c", &[Message::outgoing("a", "b", "kept")]).unwrap();
        }
        let cache = MessageCache::open(&path).unwrap();
        assert_eq!(cache.load_history("c").unwrap()[0].content, "kept");
    }
}
