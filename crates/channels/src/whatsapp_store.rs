use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use switchboard_core::{Error, Result};
use tracing::{debug, info};

/// Paired WhatsApp device as persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub jid: String,
    #[serde(default)]
    pub push_name: Option<String>,
    /// Opaque session blob handed back to the bridge on resume.
    pub credentials: serde_json::Value,
}

/// SQLite-backed store holding at most one paired device.
#[derive(Clone)]
pub struct DeviceStore {
    inner: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl DeviceStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Resource(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Resource(format!("Failed to open WhatsApp device db: {}", e)))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS whatsapp_device (
                id          INTEGER PRIMARY KEY CHECK (id = 1),
                jid         TEXT NOT NULL,
                push_name   TEXT,
                credentials TEXT NOT NULL,
                paired_at   TEXT NOT NULL
            );",
        )
        .map_err(|e| Error::Resource(format!("Failed to initialise WhatsApp device db: {}", e)))?;

        debug!(path = %db_path.display(), "WhatsApp device store opened");
        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .lock()
            .map_err(|e| Error::Resource(format!("WhatsApp device db lock poisoned: {}", e)))
    }

    pub fn load(&self) -> Result<Option<DeviceRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT jid, push_name, credentials FROM whatsapp_device WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::Resource(format!("Failed to read WhatsApp device: {}", e)))?;

        match row {
            Some((jid, push_name, credentials)) => Ok(Some(DeviceRecord {
                jid,
                push_name,
                credentials: serde_json::from_str(&credentials)?,
            })),
            None => Ok(None),
        }
    }

    pub fn save(&self, device: &DeviceRecord) -> Result<()> {
        let credentials = serde_json::to_string(&device.credentials)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO whatsapp_device (id, jid, push_name, credentials, paired_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                jid = excluded.jid,
                push_name = excluded.push_name,
                credentials = excluded.credentials,
                paired_at = excluded.paired_at",
            params![device.jid, device.push_name, credentials, chrono::Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::Resource(format!("Failed to save WhatsApp device: {}", e)))?;
        info!(jid = %device.jid, "WhatsApp device stored");
        Ok(())
    }

    /// Forgets the paired device. The next start pairs from scratch.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM whatsapp_device", [])
            .map_err(|e| Error::Resource(format!("Failed to clear WhatsApp device: {}", e)))?;
        Ok(())
    }
}
