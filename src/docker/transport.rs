//! HTTP/1.1 over the Docker engine's unix socket.

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;

use crate::error::ControlError;

#[derive(Debug, Clone, PartialEq)]
pub struct DockerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl DockerResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// One raw request against the engine API. `path` includes any version
/// prefix and query string.
#[async_trait]
pub trait DockerTransport: Send + Sync {
    async fn request(&self, method: Method, path: &str) -> Result<DockerResponse, ControlError>;
}

pub struct UnixSocketTransport {
    socket: PathBuf,
    timeout: Duration,
}

impl UnixSocketTransport {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: Duration::from_secs(15),
        }
    }

    async fn send(&self, method: Method, path: &str) -> Result<DockerResponse, ControlError> {
        let failed = |e: &dyn std::fmt::Display| ControlError::DockerFailed(e.to_string());

        let stream = UnixStream::connect(&self.socket).await.map_err(|e| failed(&e))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| failed(&e))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("docker connection closed: {}", e);
            }
        });

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "docker")
            .body(Full::new(Bytes::new()))
            .map_err(|e| failed(&e))?;
        let res = sender.send_request(req).await.map_err(|e| failed(&e))?;
        let status = res.status().as_u16();
        let body = res
            .into_body()
            .collect()
            .await
            .map_err(|e| failed(&e))?
            .to_bytes();
        Ok(DockerResponse { status, body: body.to_vec() })
    }
}

#[async_trait]
impl DockerTransport for UnixSocketTransport {
    async fn request(&self, method: Method, path: &str) -> Result<DockerResponse, ControlError> {
        tracing::debug!("docker {} {}", method, path);
        match tokio::time::timeout(self.timeout, self.send(method, path)).await {
            Ok(res) => res,
            Err(_) => Err(ControlError::DockerFailed(format!(
                "docker request timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}
