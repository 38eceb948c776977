//! HTTP client for the control plane's gateway endpoints.

use crate::error::{AgentError, AgentResult};
use otter_core::config::DownloadConfig;
use otter_core::{
    CommandMessage, FailureKind, GatewayId, ProgressMessage, ProgressReport, TerminalReport,
    UpdateId,
};
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    gateway_id: GatewayId,
    download: DownloadConfig,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        gateway_id: GatewayId,
        download: DownloadConfig,
    ) -> AgentResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| AgentError::Config(format!("invalid API URL {base_url:?}: {e}")))?;
        // Endpoint paths are joined relative to the base, keeping any prefix.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(download.timeout())
            .build()?;
        Ok(Self {
            http,
            base_url,
            token: token.map(str::to_string),
            gateway_id,
            download,
        })
    }

    pub fn gateway_id(&self) -> &GatewayId {
        &self.gateway_id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// WebSocket URL of this gateway's command channel.
    pub fn channel_url(&self) -> AgentResult<Url> {
        let mut url = self.url(&format!("v1/gateways/{}/channel", self.gateway_id))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| AgentError::Config(format!("cannot derive channel URL from {url}")))?;
        Ok(url)
    }

    fn url(&self, path: &str) -> AgentResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| AgentError::Config(format!("failed to build API URL: {e}")))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> AgentResult<T> {
        let url = self.url(path)?;
        let response = self.authorize(self.http.post(url).json(body)).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AgentError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Ask for the next command. `None` when there is nothing to do.
    pub async fn check(&self, current_version: &str) -> AgentResult<Option<CommandMessage>> {
        let mut url = self.url("updates/check")?;
        url.query_pairs_mut()
            .append_pair("gateway_id", self.gateway_id.as_str())
            .append_pair("current_version", current_version);

        let response = self.authorize(self.http.get(url)).send().await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AgentError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Some(serde_json::from_str(&body)?))
    }

    /// Mirror a progress event over REST.
    pub async fn progress(&self, message: &ProgressMessage) -> AgentResult<serde_json::Value> {
        let report = ProgressReport {
            gateway_id: self.gateway_id.clone(),
            message: message.clone(),
        };
        self.post_json("updates/progress", &report).await
    }

    pub async fn success(
        &self,
        version: &str,
        update_id: Option<UpdateId>,
        log: Option<String>,
    ) -> AgentResult<serde_json::Value> {
        let report = TerminalReport {
            gateway_id: self.gateway_id.clone(),
            version: version.to_string(),
            update_id,
            error: None,
            error_kind: None,
            log,
        };
        self.post_json("updates/success", &report).await
    }

    pub async fn failure(
        &self,
        version: &str,
        update_id: Option<UpdateId>,
        error: &str,
        kind: FailureKind,
    ) -> AgentResult<serde_json::Value> {
        let report = TerminalReport {
            gateway_id: self.gateway_id.clone(),
            version: version.to_string(),
            update_id,
            error: Some(error.to_string()),
            error_kind: Some(kind),
            log: None,
        };
        self.post_json("updates/failure", &report).await
    }

    /// Fetch an artifact, retrying transport errors and 5xx responses.
    ///
    /// Client errors are not retried. Exhausting the attempts raises
    /// [`AgentError::Download`].
    pub async fn fetch_artifact(&self, url: &str) -> AgentResult<Vec<u8>> {
        let url = Url::parse(url)
            .map_err(|e| AgentError::Download(format!("invalid artifact URL {url:?}: {e}")))?;
        let attempts = self.download.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.http.get(url.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.bytes().await {
                        Ok(bytes) => return Ok(bytes.to_vec()),
                        Err(e) => last_error = e.to_string(),
                    }
                }
                Ok(response) if response.status().is_client_error() => {
                    return Err(AgentError::Download(format!(
                        "{url}: server returned {}",
                        response.status()
                    )));
                }
                Ok(response) => last_error = format!("server returned {}", response.status()),
                Err(e) => last_error = e.to_string(),
            }

            if attempt < attempts {
                tracing::warn!(
                    url = %url,
                    attempt,
                    error = %last_error,
                    "Artifact download failed, retrying"
                );
                tokio::time::sleep(self.download.retry_delay()).await;
            }
        }

        Err(AgentError::Download(format!(
            "{url}: giving up after {attempts} attempts: {last_error}"
        )))
    }
}
