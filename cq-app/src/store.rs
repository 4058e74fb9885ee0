use crate::session::Session;
use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Durable session storage: one JSON blob per session, written only at
/// turn boundaries.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening session store at {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
CREATE TABLE IF NOT EXISTS codequill_sessions (
    id TEXT PRIMARY KEY,
    session_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#,
            [],
        )?;
        Ok(())
    }

    pub fn upsert(&self, session: &Session) -> Result<()> {
        let session_json = serde_json::to_string(session)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
INSERT INTO codequill_sessions (id, session_json, updated_at)
VALUES (?1, ?2, CURRENT_TIMESTAMP)
ON CONFLICT(id) DO UPDATE
SET session_json = excluded.session_json,
    updated_at = CURRENT_TIMESTAMP
"#,
            rusqlite::params![session.id.to_string(), session_json],
        )?;
        Ok(())
    }

    pub fn load_all(&self) -> Result<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT session_json FROM codequill_sessions")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let session_json = row?;
            match serde_json::from_str::<Session>(&session_json) {
                Ok(mut session) => {
                    // a row written between tool turns can still carry the
                    // next placeholder; it is dead after a restart
                    let before = session.messages.len();
                    session.messages.retain(|m| !m.is_thinking);
                    if session.messages.len() < before {
                        tracing::debug!(
                            session_id = %session.id,
                            "dropped stale in-flight placeholder on load"
                        );
                    }
                    out.push(session);
                }
                Err(e) => {
                    tracing::warn!(%e, "skipping undecodable session row");
                }
            }
        }
        Ok(out)
    }

    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "DELETE FROM codequill_sessions WHERE id = ?1",
            rusqlite::params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("session store lock poisoned"))
    }
}
