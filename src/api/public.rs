//! Endpoints reachable without a session: health, metrics, app update
//! metadata, the APK download and avatar images.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path as FsPath, PathBuf};

use super::ConsoleServer;
use crate::config::ConsoleConfig;
use crate::error::ApiError;
use crate::health::metrics;

pub async fn healthz(State(state): State<ConsoleServer>) -> impl IntoResponse {
    let snapshot = state.health.snapshot().await;
    let status = if snapshot.ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(snapshot))
}

pub async fn metrics(State(state): State<ConsoleServer>) -> impl IntoResponse {
    let snapshot = state.health.snapshot().await;
    (
        [
            (header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        metrics::render(&snapshot),
    )
}

/// `KEY=VALUE` lines of the android `local.properties`; `#` starts a comment.
pub(crate) fn read_local_props(path: &FsPath) -> HashMap<String, String> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn prop<'a>(props: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    props.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn under_root(config: &ConsoleConfig, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() { p } else { config.project_root.join(p) }
}

/// First existing file of: `OWNER_APK_FILE` property, configured file,
/// `data/releases/latest.apk`, the debug build output. With none present
/// the first candidate is returned.
pub(crate) fn resolve_apk_file(config: &ConsoleConfig, props: &HashMap<String, String>) -> PathBuf {
    let mut candidates = Vec::new();
    if let Some(v) = prop(props, "OWNER_APK_FILE") {
        candidates.push(under_root(config, v));
    }
    if let Some(f) = &config.apk.file {
        candidates.push(under_root(config, &f.to_string_lossy()));
    }
    candidates.push(config.data_dir().join("releases").join("latest.apk"));
    candidates.push(config.default_apk_file());

    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .unwrap_or_else(|| candidates[0].clone())
}

async fn apk_integrity(path: &FsPath) -> (Option<String>, Option<u64>) {
    match tokio::fs::read(path).await {
        Ok(bytes) => (Some(hex::encode(Sha256::digest(&bytes))), Some(bytes.len() as u64)),
        Err(_) => (None, None),
    }
}

/// Configured public URL, else `x-forwarded-proto` (or http) plus `Host`.
pub(crate) fn public_base_url(config: &ConsoleConfig, headers: &HeaderMap) -> Option<String> {
    if let Some(url) = config.public_base_url.as_deref().filter(|u| !u.is_empty()) {
        return Some(url.trim_end_matches('/').to_string());
    }
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok()).map(str::trim).filter(|h| !h.is_empty())?;
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or("http");
    Some(format!("{}://{}", proto, host))
}

fn positive(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|v| v.parse::<u32>().ok()).filter(|n| *n > 0)
}

pub async fn app_meta(State(state): State<ConsoleServer>, headers: HeaderMap) -> impl IntoResponse {
    let config = &state.config;
    let props_path = config.local_properties();
    let props = read_local_props(&props_path);
    let apk = resolve_apk_file(config, &props);
    let (sha, size) = apk_integrity(&apk).await;
    let base = public_base_url(config, &headers);

    let latest = positive(prop(&props, "OWNER_APK_VERSION_CODE")).unwrap_or(config.apk.latest_version_code);
    let min = positive(prop(&props, "OWNER_MIN_APK_VERSION")).unwrap_or(config.apk.min_version_code);
    let download = prop(&props, "OWNER_APK_DOWNLOAD_URL")
        .map(str::to_string)
        .or_else(|| config.apk.download_url.clone().filter(|u| !u.is_empty()))
        .or_else(|| base.as_ref().map(|b| format!("{}/downloads/latest.apk", b)));
    let ts = crate::db::backup::file_meta(&props_path).and_then(|m| m.updated_at);

    Json(json!({
        "ok": true,
        "panelVersion": env!("CARGO_PKG_VERSION"),
        "latestVersionCode": latest,
        "minVersionCode": min,
        "apkDownloadUrl": download,
        "apkSha256": sha,
        "apkSizeBytes": size,
        "serverUrl": base.unwrap_or_else(|| format!("http://{}:{}", config.host, config.port)),
        "ts": ts,
    }))
}

/// GET and HEAD; HEAD answers with headers only.
pub async fn download_apk(State(state): State<ConsoleServer>, method: Method) -> Result<Response, ApiError> {
    let props = read_local_props(&state.config.local_properties());
    let apk = resolve_apk_file(&state.config, &props);
    if !apk.is_file() {
        return Err(ApiError::not_found("APK not found"));
    }
    let len = tokio::fs::metadata(&apk).await.map_err(anyhow::Error::from)?.len();
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(tokio::fs::read(&apk).await.map_err(anyhow::Error::from)?)
    };
    tracing::info!("Serving APK {} ({} bytes)", apk.display(), len);
    Ok((
        [
            (header::CONTENT_TYPE, "application/vnd.android.package-archive".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"cipherphantom-owner-latest.apk\"".to_string(),
            ),
        ],
        body,
    )
        .into_response())
}

/// Joins `rel` below `root`, refusing anything that would climb out.
pub(crate) fn contained(root: &FsPath, rel: &str) -> Option<PathBuf> {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return None;
    }
    let rel = FsPath::new(rel);
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(root.join(rel))
}

fn image_mime(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

pub async fn avatar(State(state): State<ConsoleServer>, Path(rel): Path<String>) -> Result<Response, ApiError> {
    let full = contained(&state.config.avatar_dir(), rel.trim()).ok_or_else(|| ApiError::bad_request("Bad path"))?;
    if !full.is_file() {
        return Err(ApiError::not_found("Avatar not found"));
    }
    let bytes = tokio::fs::read(&full).await.map_err(anyhow::Error::from)?;
    Ok((
        [(header::CONTENT_TYPE, image_mime(&full)), (header::CACHE_CONTROL, "public, max-age=60")],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::harness;
    use crate::testing::ScriptedRunner;
    use axum::http::Request;
    use tower::ServiceExt;

    fn config_in(root: &FsPath) -> ConsoleConfig {
        ConsoleConfig { project_root: root.to_path_buf(), ..Default::default() }
    }

    #[test]
    fn test_local_props_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.properties");
        std::fs::write(&path, "# comment\nsdk.dir=/opt/android\nOWNER_APK_VERSION_CODE = 7\n=broken\nnoequals\n").unwrap();
        let props = read_local_props(&path);
        assert_eq!(props.get("OWNER_APK_VERSION_CODE").map(String::as_str), Some("7"));
        assert_eq!(props.get("sdk.dir").map(String::as_str), Some("/opt/android"));
        assert_eq!(props.len(), 2);
        assert!(read_local_props(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_apk_candidates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut props = HashMap::new();
        props.insert("OWNER_APK_FILE".to_string(), "dist/owner.apk".to_string());

        assert_eq!(resolve_apk_file(&config, &props), dir.path().join("dist/owner.apk"));

        let release = dir.path().join("data/releases/latest.apk");
        std::fs::create_dir_all(release.parent().unwrap()).unwrap();
        std::fs::write(&release, b"apk").unwrap();
        assert_eq!(resolve_apk_file(&config, &props), release);
    }

    #[test]
    fn test_public_base_url_sources() {
        let mut headers = HeaderMap::new();
        let mut config = ConsoleConfig::default();
        assert_eq!(public_base_url(&config, &headers), None);
        headers.insert(header::HOST, "panel.example:8787".parse().unwrap());
        headers.insert("x-forwarded-proto", "https, http".parse().unwrap());
        assert_eq!(public_base_url(&config, &headers).as_deref(), Some("https://panel.example:8787"));
        config.public_base_url = Some("https://owner.example/".to_string());
        assert_eq!(public_base_url(&config, &headers).as_deref(), Some("https://owner.example"));
    }

    #[test]
    fn test_contained_paths() {
        let root = FsPath::new("/data/avatars");
        assert_eq!(contained(root, "123_lid/a.jpg"), Some(PathBuf::from("/data/avatars/123_lid/a.jpg")));
        assert_eq!(contained(root, "../secrets"), None);
        assert_eq!(contained(root, ""), None);
        assert_eq!(contained(root, "a/./b"), Some(PathBuf::from("/data/avatars/a/b")));
    }

    #[tokio::test]
    async fn test_app_meta_and_apk_download() {
        let dir = tempfile::tempdir().unwrap();
        let release = dir.path().join("data/releases/latest.apk");
        std::fs::create_dir_all(release.parent().unwrap()).unwrap();
        std::fs::write(&release, b"PK-apk-bytes").unwrap();

        let h = harness(ScriptedRunner::missing_pm2(), config_in(dir.path())).await;
        let req = Request::get("/api/app-meta").header("host", "10.0.0.5:8787").body(Body::empty()).unwrap();
        let (status, body) = h.call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["apkDownloadUrl"], "http://10.0.0.5:8787/downloads/latest.apk");
        assert_eq!(body["apkSizeBytes"], 12);
        assert_eq!(body["apkSha256"].as_str().unwrap().len(), 64);
        assert_eq!(body["latestVersionCode"], 1);

        let res = h
            .server
            .router()
            .oneshot(Request::head("/downloads/latest.apk").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "application/vnd.android.package-archive");
        assert_eq!(res.headers()[header::CONTENT_LENGTH], "12");
    }

    #[tokio::test]
    async fn test_healthz_and_metrics_are_public() {
        let h = harness(ScriptedRunner::missing_pm2(), ConsoleConfig::default()).await;
        let (status, body) = h.call(Request::get("/api/healthz").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["pm2"]["mode"], "unmanaged");

        let res = h.server.router().oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        let text = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("owner_app_up 1\n"));
    }
}
