//! Whole-document JSON persistence for the small state files
//! (sessions, admin flags, admin jobs).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[async_trait]
pub trait JsonPort: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<Value>>;
    async fn save(&self, value: &Value) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileJsonPort {
    path: PathBuf,
}

impl FileJsonPort {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JsonPort for FileJsonPort {
    async fn load(&self) -> Result<Option<Value>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", self.path.display()))?;
        Ok(Some(value))
    }

    async fn save(&self, value: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("write {}", self.path.display()))?;
        tracing::debug!("Saved {}", self.path.display());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryJsonPort {
    value: Mutex<Option<Value>>,
}

impl MemoryJsonPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: Value) -> Self {
        Self { value: Mutex::new(Some(value)) }
    }
}

#[async_trait]
impl JsonPort for MemoryJsonPort {
    async fn load(&self) -> Result<Option<Value>> {
        let guard = self.value.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.clone())
    }

    async fn save(&self, value: &Value) -> Result<()> {
        let mut guard = self.value.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(value.clone());
        Ok(())
    }
}

/// Load and fall back to `None` on unreadable content, logging the cause.
pub async fn load_or_warn(port: &dyn JsonPort, what: &str) -> Option<Value> {
    match port.load().await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Ignoring unreadable {} state: {:#}", what, e);
            None
        }
    }
}
