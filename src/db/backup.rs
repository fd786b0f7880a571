use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use rusqlite::params;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::Database;

pub const BACKUP_PREFIX: &str = "cipherphantom-";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub name: String,
    pub size_bytes: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub size_bytes: u64,
    pub updated_at: Option<String>,
}

fn mtime_iso(meta: &std::fs::Metadata) -> Option<String> {
    meta.modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Millis, true))
}

pub fn file_meta(path: &Path) -> Option<FileMeta> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileMeta { size_bytes: meta.len(), updated_at: mtime_iso(&meta) })
}

/// `cipherphantom-<ISO timestamp with ':' and '.' as '-'>.db`
pub fn backup_name(at: DateTime<Utc>) -> String {
    let stamp = at.to_rfc3339_opts(SecondsFormat::Millis, true).replace([':', '.'], "-");
    format!("{}{}.db", BACKUP_PREFIX, stamp)
}

pub fn is_safe_backup_name(name: &str) -> bool {
    static BACKUP_NAME: OnceLock<Option<Regex>> = OnceLock::new();
    BACKUP_NAME
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9._-]+\.db$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
        && !name.contains("..")
}

/// Newest first. `limit` is clamped to 1..=500.
pub fn list_backups(dir: &Path, limit: usize) -> Result<Vec<BackupInfo>> {
    std::fs::create_dir_all(dir)?;
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".db") {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().ok();
        entries.push((modified, BackupInfo {
            name,
            size_bytes: meta.len(),
            created_at: mtime_iso(&meta).unwrap_or_default(),
        }));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.name.cmp(&a.1.name)));
    Ok(entries.into_iter().take(limit.clamp(1, 500)).map(|(_, info)| info).collect())
}

/// Deletes everything past the newest `keep` backups (at least one is kept).
pub fn rotate_backups(dir: &Path, keep: usize) -> Result<usize> {
    let all = list_backups(dir, 500)?;
    let mut removed = 0;
    for stale in all.iter().skip(keep.max(1)) {
        match std::fs::remove_file(dir.join(&stale.name)) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Could not remove old backup {}: {}", stale.name, e),
        }
    }
    Ok(removed)
}

/// Resolves a downloadable backup; `Ok(None)` when it does not exist.
pub fn backup_file(dir: &Path, name: &str) -> Result<Option<PathBuf>> {
    let name = name.trim();
    if !is_safe_backup_name(name) {
        bail!("Invalid backup file name");
    }
    let full = dir.join(name);
    Ok(full.is_file().then_some(full))
}

impl Database {
    /// Checkpoints the WAL, writes a consistent copy with `VACUUM INTO`, then
    /// rotates the directory down to `keep` files.
    pub async fn create_backup(&self, dir: &Path, keep: usize) -> Result<BackupInfo> {
        std::fs::create_dir_all(dir)?;
        let name = backup_name(Utc::now());
        let full = dir.join(&name);
        {
            let conn = self.conn.lock().await;
            conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
            conn.execute("VACUUM INTO ?1", params![full.to_string_lossy().into_owned()])
                .with_context(|| format!("write backup {}", full.display()))?;
        }
        let meta = std::fs::metadata(&full)?;
        let removed = rotate_backups(dir, keep)?;
        tracing::info!("Database backup {} written ({} bytes, {} rotated out)", name, meta.len(), removed);
        Ok(BackupInfo { name, size_bytes: meta.len(), created_at: mtime_iso(&meta).unwrap_or_default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_name_shape() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T10:20:30.456Z").unwrap().with_timezone(&Utc);
        let name = backup_name(at);
        assert_eq!(name, "cipherphantom-2026-03-01T10-20-30-456Z.db");
        assert!(is_safe_backup_name(&name));
    }

    #[test]
    fn test_unsafe_names_rejected() {
        assert!(!is_safe_backup_name("../etc/passwd.db"));
        assert!(!is_safe_backup_name("a/b.db"));
        assert!(!is_safe_backup_name("backup.sqlite"));
        assert!(!is_safe_backup_name(".."));
        let dir = tempfile::tempdir().unwrap();
        assert!(backup_file(dir.path(), "../x.db").is_err());
        assert!(backup_file(dir.path(), "missing.db").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backup_and_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("live.db")).unwrap();
        db.exec("INSERT INTO users (chat_id, profile_name) VALUES ('1@s.whatsapp.net', 'Ada');").await.unwrap();

        let backups = dir.path().join("backups");
        std::fs::create_dir_all(&backups).unwrap();
        for i in 0..3u64 {
            let path = backups.join(format!("old-{}.db", i));
            std::fs::write(&path, b"x").unwrap();
            let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600 * (i + 1));
            std::fs::File::options().write(true).open(&path).unwrap().set_modified(past).unwrap();
        }
        std::fs::write(backups.join("notes.txt"), b"keep me").unwrap();

        let info = db.create_backup(&backups, 2).await.unwrap();
        assert!(info.size_bytes > 0);

        let listed = list_backups(&backups, 50).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, info.name);
        assert_eq!(listed[1].name, "old-0.db");
        assert!(backups.join("notes.txt").exists());
        assert!(backup_file(&backups, &info.name).unwrap().is_some());

        let copy = Database::open(&backups.join(&info.name)).unwrap();
        assert_eq!(copy.counts().await.unwrap().0, 1);
    }
}
