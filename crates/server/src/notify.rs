//! Delivery of CRITICAL escalations to humans.

use crate::error::{FleetError, FleetResult};
use async_trait::async_trait;
use otter_core::config::NotifyConfig;
use otter_metadata::models::EscalationRow;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;

/// Pushes escalations somewhere an operator will see them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, escalation: &EscalationRow) -> FleetResult<()>;
}

/// Writes escalations to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, escalation: &EscalationRow) -> FleetResult<()> {
        tracing::error!(
            critical = true,
            escalation_id = %escalation.escalation_id,
            gateway_id = %escalation.gateway_id,
            update_id = %escalation.update_id,
            message = %escalation.message,
            "Escalation requires manual intervention"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EscalationPayload<'a> {
    escalation_id: String,
    severity: &'a str,
    gateway_id: &'a str,
    manifest_id: String,
    update_id: String,
    message: &'a str,
    created_at: String,
}

/// POSTs escalations as JSON to a webhook, and logs them.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> FleetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::Notify(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, escalation: &EscalationRow) -> FleetResult<()> {
        LogNotifier.notify(escalation).await?;

        let payload = EscalationPayload {
            escalation_id: escalation.escalation_id.to_string(),
            severity: &escalation.severity,
            gateway_id: &escalation.gateway_id,
            manifest_id: escalation.manifest_id.to_string(),
            update_id: escalation.update_id.to_string(),
            message: &escalation.message,
            created_at: escalation
                .created_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| escalation.created_at.to_string()),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FleetError::Notify(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FleetError::Notify(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Build the notifier described by the configuration.
pub fn from_config(config: &NotifyConfig) -> FleetResult<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Escalations will be posted to webhook");
            Ok(Arc::new(WebhookNotifier::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}
