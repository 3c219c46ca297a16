//! Tenant and quota persistence.
//!
//! One SQLite database holds the `users` and `quota` tables. Every mutation
//! runs inside its own short transaction; no transaction ever spans a call
//! to the container runtime or GPU telemetry.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use api_types::Quota;
use api_types::QuotaUpdate;
use api_types::Tenant;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use sha2::Digest;
use sha2::Sha256;
use tracing::info;

use crate::error::Result;
use crate::error::WardenError;
use crate::naming::validate_identifier;
use crate::naming::RESERVED_NAMES;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    credential TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS quota (
    username TEXT PRIMARY KEY,
    max_pods INTEGER NOT NULL DEFAULT -1,
    gpu_count INTEGER NOT NULL DEFAULT -1,
    memory_limit INTEGER NOT NULL DEFAULT -1,
    storage_size INTEGER NOT NULL DEFAULT -1,
    shm_size INTEGER NOT NULL DEFAULT -1
);
";

/// Hash used for request-time identity: exact match on
/// `sha256("{username}:{password}")`, hex-encoded.
pub fn hash_credential(username: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{username}:{password}").as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Open the state database and hand out the two stores sharing its
/// connection. `defaults` is the process-wide quota fallback snapshot.
pub fn open_state_db(path: &Path, defaults: Quota) -> Result<(UserStore, QuotaStore)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    let conn = Arc::new(Mutex::new(conn));
    Ok((
        UserStore { conn: conn.clone() },
        QuotaStore { conn, defaults },
    ))
}

/// Tenant records and credentials.
pub struct UserStore {
    conn: Arc<Mutex<Connection>>,
}

impl UserStore {
    pub fn add_user(&self, username: &str, password: &str, is_admin: bool) -> Result<Tenant> {
        validate_identifier(username, RESERVED_NAMES)?;
        let conn = self.conn.lock().expect("poisoned");
        conn.execute(
            "INSERT INTO users (username, credential, is_admin) VALUES (?1, ?2, ?3)",
            params![username, hash_credential(username, password), is_admin],
        )?;
        let userid = conn.last_insert_rowid();
        info!(username, userid, "user added");
        Ok(Tenant {
            userid,
            name: username.to_string(),
            is_admin,
        })
    }

    pub fn get_user(&self, username: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().expect("poisoned");
        let row = conn
            .query_row(
                "SELECT id, username, is_admin FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(Tenant {
                        userid: row.get(0)?,
                        name: row.get(1)?,
                        is_admin: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Identity at request time: exact credential-hash match.
    pub fn authenticate(&self, credential_hash: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().expect("poisoned");
        let row = conn
            .query_row(
                "SELECT id, username, is_admin FROM users WHERE credential = ?1",
                params![credential_hash],
                |row| {
                    Ok(Tenant {
                        userid: row.get(0)?,
                        name: row.get(1)?,
                        is_admin: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_users(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("poisoned");
        let mut stmt = conn.prepare("SELECT username FROM users ORDER BY id")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    pub fn set_password(&self, username: &str, password: &str) -> Result<()> {
        let conn = self.conn.lock().expect("poisoned");
        let changed = conn.execute(
            "UPDATE users SET credential = ?1 WHERE username = ?2",
            params![hash_credential(username, password), username],
        )?;
        if changed == 0 {
            return Err(WardenError::NotFound(format!("user {username}")));
        }
        Ok(())
    }

    pub fn set_admin(&self, username: &str, is_admin: bool) -> Result<()> {
        let conn = self.conn.lock().expect("poisoned");
        let changed = conn.execute(
            "UPDATE users SET is_admin = ?1 WHERE username = ?2",
            params![is_admin, username],
        )?;
        if changed == 0 {
            return Err(WardenError::NotFound(format!("user {username}")));
        }
        Ok(())
    }

    /// Remove the user and their quota row in one transaction.
    pub fn delete_user(&self, username: &str) -> Result<()> {
        let mut conn = self.conn.lock().expect("poisoned");
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM users WHERE username = ?1", params![username])?;
        tx.execute("DELETE FROM quota WHERE username = ?1", params![username])?;
        tx.commit()?;
        info!(username, "user deleted");
        Ok(())
    }
}

/// Per-tenant resource limits with default fallback.
pub struct QuotaStore {
    conn: Arc<Mutex<Connection>>,
    defaults: Quota,
}

impl QuotaStore {
    /// The configured fallback snapshot, immutable for the process lifetime.
    pub fn defaults(&self) -> &Quota {
        &self.defaults
    }

    /// Raw stored row; all-unset when the tenant has no row.
    pub fn get_stored(&self, username: &str) -> Result<Quota> {
        let conn = self.conn.lock().expect("poisoned");
        let row = conn
            .query_row(
                "SELECT max_pods, gpu_count, memory_limit, storage_size, shm_size
                 FROM quota WHERE username = ?1",
                params![username],
                |row| {
                    Ok(Quota {
                        max_pods: row.get(0)?,
                        gpu_count: row.get(1)?,
                        memory_limit: row.get(2)?,
                        storage_size: row.get(3)?,
                        shm_size: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_default())
    }

    /// Effective quota: stored row with every unset field replaced by the
    /// configured default.
    pub fn get(&self, username: &str) -> Result<Quota> {
        Ok(self.get_stored(username)?.with_defaults(&self.defaults))
    }

    /// Upsert: create an all-unset row if absent, then apply only the
    /// fields present in `update`. One atomic transaction.
    pub fn set(&self, username: &str, update: &QuotaUpdate) -> Result<()> {
        let mut conn = self.conn.lock().expect("poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO quota (username) VALUES (?1)",
            params![username],
        )?;
        let fields: [(&str, Option<i64>); 5] = [
            ("max_pods", update.max_pods),
            ("gpu_count", update.gpu_count),
            ("memory_limit", update.memory_limit),
            ("storage_size", update.storage_size),
            ("shm_size", update.shm_size),
        ];
        for (column, value) in fields {
            if let Some(value) = value {
                tx.execute(
                    &format!("UPDATE quota SET {column} = ?1 WHERE username = ?2"),
                    params![value, username],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Idempotent: deleting a missing row is a no-op.
    pub fn delete(&self, username: &str) -> Result<()> {
        let conn = self.conn.lock().expect("poisoned");
        conn.execute("DELETE FROM quota WHERE username = ?1", params![username])?;
        Ok(())
    }
}
