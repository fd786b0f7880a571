use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::AdminError;
use crate::persist::{load_or_warn, JsonPort};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminFlags {
    pub deploy_enabled: bool,
    pub apk_build_enabled: bool,
    pub reboot_enabled: bool,
    pub log_stream_enabled: bool,
    pub alerts_enabled: bool,
}

impl AdminFlags {
    /// `reboot_enabled` follows the server-reboot config switch.
    pub fn defaults(allow_server_reboot: bool) -> Self {
        Self {
            deploy_enabled: true,
            apk_build_enabled: true,
            reboot_enabled: allow_server_reboot,
            log_stream_enabled: true,
            alerts_enabled: true,
        }
    }
}

/// Flags are stored as one JSON object. Reads merge it over the defaults;
/// writes merge a partial patch over the current value and store the result.
pub struct FlagStore {
    port: Arc<dyn JsonPort>,
    defaults: AdminFlags,
    lock: Mutex<()>,
}

impl FlagStore {
    pub fn new(port: Arc<dyn JsonPort>, defaults: AdminFlags) -> Self {
        Self {
            port,
            defaults,
            lock: Mutex::new(()),
        }
    }

    async fn merged(&self, patch: Option<&Value>) -> Result<AdminFlags, AdminError> {
        let mut base = serde_json::to_value(&self.defaults).map_err(anyhow::Error::from)?;
        let stored = load_or_warn(self.port.as_ref(), "admin flags").await;
        for layer in [stored.as_ref(), patch].into_iter().flatten() {
            if let (Some(base_obj), Some(layer_obj)) = (base.as_object_mut(), layer.as_object()) {
                for (k, v) in layer_obj {
                    base_obj.insert(k.clone(), v.clone());
                }
            }
        }
        serde_json::from_value(base).map_err(|e| AdminError::InvalidFlags(e.to_string()))
    }

    pub async fn get(&self) -> AdminFlags {
        let _guard = self.lock.lock().await;
        self.merged(None).await.unwrap_or_else(|e| {
            tracing::warn!("Stored admin flags unusable ({}), using defaults", e);
            self.defaults.clone()
        })
    }

    pub async fn patch(&self, patch: &Value) -> Result<AdminFlags, AdminError> {
        if !patch.is_object() {
            return Err(AdminError::InvalidFlags("expected a JSON object".to_string()));
        }
        let _guard = self.lock.lock().await;
        let next = self.merged(Some(patch)).await?;
        self.port.save(&serde_json::to_value(&next).map_err(anyhow::Error::from)?).await?;
        tracing::info!("Admin flags updated: {:?}", next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryJsonPort;
    use serde_json::json;

    #[tokio::test]
    async fn test_defaults_follow_reboot_switch() {
        let store = FlagStore::new(Arc::new(MemoryJsonPort::new()), AdminFlags::defaults(false));
        let flags = store.get().await;
        assert!(flags.deploy_enabled);
        assert!(!flags.reboot_enabled);
        assert!(AdminFlags::defaults(true).reboot_enabled);
    }

    #[tokio::test]
    async fn test_stored_values_merge_over_defaults() {
        let port = Arc::new(MemoryJsonPort::with_value(json!({"deployEnabled": false})));
        let store = FlagStore::new(port, AdminFlags::defaults(false));
        let flags = store.get().await;
        assert!(!flags.deploy_enabled);
        assert!(flags.alerts_enabled);
    }

    #[tokio::test]
    async fn test_patch_persists_whole_object() {
        let port = Arc::new(MemoryJsonPort::new());
        let store = FlagStore::new(port.clone(), AdminFlags::defaults(false));
        let flags = store.patch(&json!({"alertsEnabled": false})).await.unwrap();
        assert!(!flags.alerts_enabled);
        assert!(flags.apk_build_enabled);

        let saved = port.load().await.unwrap().unwrap();
        assert_eq!(saved["alertsEnabled"], false);
        assert_eq!(saved["logStreamEnabled"], true);

        let err = store.patch(&json!({"deployEnabled": "yes"})).await.unwrap_err();
        assert_eq!(err.error_code(), Some("INVALID_FLAGS"));
        assert!(store.patch(&json!([1, 2])).await.is_err());
    }
}
