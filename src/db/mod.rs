//! Embedded SQLite store shared with the bot: users, bans, owner logins,
//! the outbound message queue and the owner audit log.

pub mod backup;
pub mod browser;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::health::DbPing;
use crate::utils::now_iso;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    chat_id TEXT PRIMARY KEY,
    profile_name TEXT,
    user_role TEXT NOT NULL DEFAULT 'user',
    level INTEGER NOT NULL DEFAULT 1,
    xp INTEGER NOT NULL DEFAULT 0,
    phn INTEGER NOT NULL DEFAULT 0,
    level_role TEXT,
    created_at TEXT,
    wallet_address TEXT,
    profile_bio TEXT,
    profile_photo_url TEXT
);
CREATE TABLE IF NOT EXISTS bans (
    chat_id TEXT PRIMARY KEY,
    reason TEXT,
    expires_at TEXT,
    banned_by TEXT,
    created_at TEXT
);
CREATE TABLE IF NOT EXISTS owner_auth (
    chat_id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    password_salt TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS owner_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    target_jid TEXT,
    scope TEXT,
    message TEXT NOT NULL,
    signature TEXT,
    created_by TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT,
    sent_at TEXT,
    error TEXT
);
CREATE TABLE IF NOT EXISTS owner_audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor_chat_id TEXT NOT NULL,
    command TEXT NOT NULL,
    target_id TEXT,
    payload TEXT,
    created_at TEXT
);
";

#[derive(Debug, Clone, PartialEq)]
pub struct OwnerAuth {
    pub chat_id: String,
    /// Profile name when the owner has a users row, else the login name.
    pub display_name: String,
    pub password_hash: String,
    pub password_salt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserRow {
    pub chat_id: String,
    pub profile_name: Option<String>,
    pub user_role: Option<String>,
    pub level: Option<i64>,
    pub xp: Option<i64>,
    pub phn: Option<i64>,
    pub level_role: Option<String>,
    pub created_at: Option<String>,
    pub wallet_address: Option<String>,
    pub profile_bio: Option<String>,
    pub profile_photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub chat_id: String,
    pub profile_name: Option<String>,
    pub user_role: Option<String>,
    pub level: Option<i64>,
    pub xp: Option<i64>,
    pub phn: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRef {
    pub chat_id: String,
    pub profile_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BanRow {
    pub chat_id: String,
    pub profile_name: Option<String>,
    pub reason: Option<String>,
    pub expires_at: Option<String>,
    pub banned_by: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxRow {
    pub id: i64,
    pub kind: String,
    pub target_jid: Option<String>,
    pub scope: Option<String>,
    pub message: String,
    pub signature: Option<String>,
    pub created_by: Option<String>,
    pub status: String,
    pub created_at: Option<String>,
    pub sent_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub actor_chat_id: String,
    pub command: String,
    pub target_id: Option<String>,
    pub payload: Option<String>,
    pub created_at: Option<String>,
}

/// Message kinds the bot drains from `owner_outbox`.
pub enum OutboxEntry<'a> {
    Single { jid: &'a str },
    Broadcast { scope: &'a str },
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).with_context(|| format!("open {}", path.display()))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        tracing::info!("Opened database {} (journal_mode={})", path.display(), mode);
        Self::bootstrap(conn, Some(path.to_path_buf()))
    }

    pub fn in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?, None)
    }

    fn bootstrap(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("create schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), path })
    }

    /// `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// `PRAGMA integrity_check`; returns the first result line.
    pub async fn integrity_check(&self) -> Result<String> {
        let conn = self.conn.lock().await;
        let result: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
        Ok(result.trim().to_string())
    }

    pub async fn counts(&self) -> Result<(i64, i64)> {
        let conn = self.conn.lock().await;
        let users = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        let bans = conn.query_row("SELECT COUNT(*) FROM bans", [], |r| r.get(0))?;
        Ok((users, bans))
    }

    pub async fn owner_auth(&self, username: &str) -> Result<Option<OwnerAuth>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT a.chat_id, COALESCE(u.profile_name, a.username), a.password_hash, a.password_salt
                 FROM owner_auth a LEFT JOIN users u ON u.chat_id = a.chat_id
                 WHERE a.username = ?1",
                params![username],
                |r| {
                    Ok(OwnerAuth {
                        chat_id: r.get(0)?,
                        display_name: r.get(1)?,
                        password_hash: r.get(2)?,
                        password_salt: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Creates or replaces the login for `chat_id` with a fresh random salt.
    pub async fn set_owner_password(&self, chat_id: &str, username: &str, password: &str) -> Result<()> {
        use rand::RngCore;
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = hex::encode(salt);
        let hash = crate::auth::hash_password(password, &salt);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO owner_auth (chat_id, username, password_hash, password_salt)
             VALUES (?1, ?2, ?3, ?4)",
            params![chat_id, username, hash, salt],
        )?;
        Ok(())
    }

    pub async fn user(&self, chat_id: &str) -> Result<Option<UserRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT chat_id, profile_name, user_role, level, xp, phn, level_role, created_at,
                        wallet_address, profile_bio, profile_photo_url
                 FROM users WHERE chat_id = ?1",
                params![chat_id],
                |r| {
                    Ok(UserRow {
                        chat_id: r.get(0)?,
                        profile_name: r.get(1)?,
                        user_role: r.get(2)?,
                        level: r.get(3)?,
                        xp: r.get(4)?,
                        phn: r.get(5)?,
                        level_role: r.get(6)?,
                        created_at: r.get(7)?,
                        wallet_address: r.get(8)?,
                        profile_bio: r.get(9)?,
                        profile_photo_url: r.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub async fn set_bio(&self, chat_id: &str, bio: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (chat_id, profile_bio, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET profile_bio = excluded.profile_bio",
            params![chat_id, bio, now_iso()],
        )?;
        Ok(())
    }

    pub async fn list_users(&self, limit: usize) -> Result<Vec<UserSummary>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT chat_id, profile_name, user_role, level, xp, phn FROM users
             ORDER BY level DESC, xp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(UserSummary {
                chat_id: r.get(0)?,
                profile_name: r.get(1)?,
                user_role: r.get(2)?,
                level: r.get(3)?,
                xp: r.get(4)?,
                phn: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Returns how many rows changed (0 when the user is unknown).
    pub async fn set_user_role(&self, chat_id: &str, role: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("UPDATE users SET user_role = ?1 WHERE chat_id = ?2", params![role, chat_id])?)
    }

    /// Matches `<digits>@…` first, then any chat id containing the digits.
    pub async fn find_user_by_phone(&self, digits: &str) -> Result<Option<UserRef>> {
        if digits.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT chat_id, profile_name FROM users
                 WHERE chat_id LIKE ?1 OR chat_id LIKE ?2
                 ORDER BY CASE WHEN chat_id LIKE ?1 THEN 0 ELSE 1 END
                 LIMIT 1",
                params![format!("{}@%", digits), format!("%{}%", digits)],
                |r| Ok(UserRef { chat_id: r.get(0)?, profile_name: r.get(1)? }),
            )
            .optional()?;
        Ok(row)
    }

    pub async fn set_ban(
        &self,
        chat_id: &str,
        reason: Option<&str>,
        expires_at: Option<&str>,
        banned_by: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO bans (chat_id, reason, expires_at, banned_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chat_id, reason, expires_at, banned_by, now_iso()],
        )?;
        Ok(())
    }

    pub async fn clear_ban(&self, chat_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM bans WHERE chat_id = ?1", params![chat_id])?)
    }

    pub async fn list_bans(&self) -> Result<Vec<BanRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT b.chat_id, u.profile_name, b.reason, b.expires_at, b.banned_by, b.created_at
             FROM bans b LEFT JOIN users u ON u.chat_id = b.chat_id
             ORDER BY b.created_at DESC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(BanRow {
                chat_id: r.get(0)?,
                profile_name: r.get(1)?,
                reason: r.get(2)?,
                expires_at: r.get(3)?,
                banned_by: r.get(4)?,
                created_at: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn queue_message(
        &self,
        entry: OutboxEntry<'_>,
        message: &str,
        signature: &str,
        created_by: &str,
    ) -> Result<i64> {
        let (kind, jid, scope) = match entry {
            OutboxEntry::Single { jid } => ("single", Some(jid), None),
            OutboxEntry::Broadcast { scope } => ("broadcast", None, Some(scope)),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO owner_outbox (kind, target_jid, scope, message, signature, created_by, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![kind, jid, scope, message, signature, created_by, now_iso()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// `status` of `all` (or empty) lists every entry.
    pub async fn list_outbox(&self, status: &str, limit: usize) -> Result<Vec<OutboxRow>> {
        let status = status.trim().to_lowercase();
        let filter = if status.is_empty() || status == "all" { None } else { Some(status) };
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, kind, target_jid, scope, message, signature, created_by, status, created_at, sent_at, error
             FROM owner_outbox WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![filter, limit as i64], |r| {
            Ok(OutboxRow {
                id: r.get(0)?,
                kind: r.get(1)?,
                target_jid: r.get(2)?,
                scope: r.get(3)?,
                message: r.get(4)?,
                signature: r.get(5)?,
                created_by: r.get(6)?,
                status: r.get(7)?,
                created_at: r.get(8)?,
                sent_at: r.get(9)?,
                error: r.get(10)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn add_audit(
        &self,
        actor: &str,
        command: &str,
        target_id: Option<&str>,
        payload: Option<&serde_json::Value>,
    ) -> Result<()> {
        let payload = payload.map(|p| p.to_string());
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO owner_audit_log (actor_chat_id, command, target_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![actor, command, target_id, payload, now_iso()],
        )?;
        Ok(())
    }

    pub async fn list_audit(&self, limit: usize) -> Result<Vec<AuditRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, actor_chat_id, command, target_id, payload, created_at
             FROM owner_audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(AuditRow {
                id: r.get(0)?,
                actor_chat_id: r.get(1)?,
                command: r.get(2)?,
                target_id: r.get(3)?,
                payload: r.get(4)?,
                created_at: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[cfg(test)]
    pub(crate) async fn exec(&self, sql: &str) -> Result<()> {
        self.conn.lock().await.execute_batch(sql)?;
        Ok(())
    }
}

#[async_trait]
impl DbPing for Database {
    async fn ping(&self) -> Result<(), String> {
        let conn = self.conn.lock().await;
        match conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)) {
            Ok(1) => Ok(()),
            Ok(other) => Err(format!("unexpected ping result {}", other)),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> Database {
        let db = Database::in_memory().unwrap();
        db.exec(
            "INSERT INTO users (chat_id, profile_name, user_role, level, xp, phn) VALUES
                ('4915112345678@s.whatsapp.net', 'Mia', 'user', 3, 120, 50),
                ('72271934840903@lid', 'Boss', 'owner', 9, 900, 0),
                ('120363000000@g.us', 'Group 4915112345678', 'user', 1, 0, 0);",
        )
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_ping_and_integrity() {
        let db = Database::in_memory().unwrap();
        assert!(db.ping().await.is_ok());
        assert_eq!(db.integrity_check().await.unwrap(), "ok");
        assert!(db.path().is_none());
    }

    #[tokio::test]
    async fn test_owner_login_row() {
        let db = seeded().await;
        db.set_owner_password("72271934840903@lid", "boss", "secret").await.unwrap();
        let auth = db.owner_auth("boss").await.unwrap().unwrap();
        assert_eq!(auth.display_name, "Boss");
        assert!(crate::auth::verify_password("secret", &auth.password_salt, &auth.password_hash));
        assert!(db.owner_auth("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_phone_lookup_prefers_exact_prefix() {
        let db = seeded().await;
        let hit = db.find_user_by_phone("4915112345678").await.unwrap().unwrap();
        assert_eq!(hit.chat_id, "4915112345678@s.whatsapp.net");
        assert!(db.find_user_by_phone("").await.unwrap().is_none());
        assert!(db.find_user_by_phone("999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bans_and_counts() {
        let db = seeded().await;
        db.set_ban("4915112345678@s.whatsapp.net", Some("spam"), None, "72271934840903@lid").await.unwrap();
        assert_eq!(db.counts().await.unwrap(), (3, 1));
        let bans = db.list_bans().await.unwrap();
        assert_eq!(bans[0].profile_name.as_deref(), Some("Mia"));
        assert_eq!(db.clear_ban("4915112345678@s.whatsapp.net").await.unwrap(), 1);
        assert!(db.list_bans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outbox_filter() {
        let db = seeded().await;
        db.queue_message(OutboxEntry::Single { jid: "1@s.whatsapp.net" }, "hi", "— Boss", "owner").await.unwrap();
        db.queue_message(OutboxEntry::Broadcast { scope: "groups" }, "news", "— Boss", "owner").await.unwrap();
        db.exec("UPDATE owner_outbox SET status = 'sent' WHERE kind = 'single'").await.unwrap();

        let all = db.list_outbox("all", 100).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, "broadcast");
        assert_eq!(all[0].scope.as_deref(), Some("groups"));
        let pending = db.list_outbox("pending", 100).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(db.list_outbox("", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_roles_bio_audit() {
        let db = seeded().await;
        assert_eq!(db.set_user_role("4915112345678@s.whatsapp.net", "admin").await.unwrap(), 1);
        assert_eq!(db.set_user_role("missing", "admin").await.unwrap(), 0);
        db.set_bio("72271934840903@lid", Some("hello")).await.unwrap();
        assert_eq!(db.user("72271934840903@lid").await.unwrap().unwrap().profile_bio.as_deref(), Some("hello"));

        db.add_audit("72271934840903@lid", "set_user_role", Some("x"), Some(&serde_json::json!({"role": "admin"})))
            .await
            .unwrap();
        let audit = db.list_audit(10).await.unwrap();
        assert_eq!(audit[0].payload.as_deref(), Some(r#"{"role":"admin"}"#));

        let users = db.list_users(2).await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].profile_name.as_deref(), Some("Boss"));
    }
}
