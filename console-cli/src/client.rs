use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::forge::{ForgeApi, ForgeError, HttpReply};

pub const DEFAULT_URL: &str = "http://127.0.0.1:8787";

#[derive(Debug, Clone)]
pub struct ConsoleClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ConsoleClient {
    pub fn new(base_url: Option<&str>, token: Option<String>) -> anyhow::Result<Self> {
        let base_url = base_url.unwrap_or(DEFAULT_URL).trim_end_matches('/').to_string();
        // restarts and APK downloads can take a while
        let client = reqwest::Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self { client, base_url, token: token.filter(|t| !t.trim().is_empty()) })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Exchanges owner credentials for a session token and keeps it.
    pub async fn login(&mut self, username: &str, password: &str) -> anyhow::Result<()> {
        let url = format!("{}/api/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body.get("error").and_then(Value::as_str).unwrap_or("login failed");
            anyhow::bail!("Login rejected ({}): {}", status.as_u16(), message);
        }
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Login response carried no token"))?;
        self.token = Some(token.to_string());
        tracing::info!("Logged in as {}", username);
        Ok(())
    }
}

#[async_trait]
impl ForgeApi for ConsoleClient {
    async fn send(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<String>,
    ) -> Result<HttpReply, ForgeError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ForgeError::InvalidWorkflow(format!("bad HTTP method '{}'", method)))?;
        let mut request = self.client.request(method, format!("{}{}", self.base_url, path));
        let own_auth = headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("authorization"));
        if let (Some(token), false) = (&self.token, own_auth) {
            request = request.bearer_auth(token);
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| ForgeError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| ForgeError::Network(e.to_string()))?;
        Ok(HttpReply { status, body })
    }
}
