//! Best-effort reporting to the control plane.
//!
//! Reporting never changes the local outcome: a gateway that updated
//! successfully stays updated even if the success report is lost. The local
//! `VERSION` file is authoritative.

use crate::api_client::ApiClient;
use crate::error::AgentError;
use async_trait::async_trait;
use otter_core::{ProgressMessage, UpdateId};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn progress(&self, message: &ProgressMessage);

    async fn success(&self, version: &str, update_id: Option<UpdateId>, log: Option<String>);

    async fn failure(&self, version: &str, update_id: Option<UpdateId>, error: &AgentError);
}

#[async_trait]
impl Reporter for ApiClient {
    async fn progress(&self, message: &ProgressMessage) {
        if let Err(e) = ApiClient::progress(self, message).await {
            tracing::warn!(
                update_id = %message.update_id,
                state = %message.state,
                error = %e,
                "Failed to report progress"
            );
        }
    }

    async fn success(&self, version: &str, update_id: Option<UpdateId>, log: Option<String>) {
        if let Err(e) = ApiClient::success(self, version, update_id, log).await {
            tracing::warn!(version, error = %e, "Failed to report success");
        }
    }

    async fn failure(&self, version: &str, update_id: Option<UpdateId>, error: &AgentError) {
        let kind = error.failure_kind();
        if let Err(e) = ApiClient::failure(self, version, update_id, &error.to_string(), kind).await
        {
            tracing::warn!(version, kind = %kind, error = %e, "Failed to report failure");
        }
    }
}

/// Sends progress over the live command channel while one is attached and
/// over REST otherwise. Terminal reports always go over REST.
pub struct ChannelReporter {
    client: ApiClient,
    channel: Mutex<Option<mpsc::Sender<ProgressMessage>>>,
}

impl ChannelReporter {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            channel: Mutex::new(None),
        }
    }

    pub fn attach(&self, sender: mpsc::Sender<ProgressMessage>) {
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    pub fn detach(&self) {
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn sender(&self) -> Option<mpsc::Sender<ProgressMessage>> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Reporter for ChannelReporter {
    async fn progress(&self, message: &ProgressMessage) {
        if let Some(sender) = self.sender() {
            match sender.try_send(message.clone()) {
                Ok(()) => return,
                Err(e) => tracing::debug!(
                    update_id = %message.update_id,
                    error = %e,
                    "Channel unavailable, reporting progress over REST"
                ),
            }
        }
        Reporter::progress(&self.client, message).await;
    }

    async fn success(&self, version: &str, update_id: Option<UpdateId>, log: Option<String>) {
        Reporter::success(&self.client, version, update_id, log).await;
    }

    async fn failure(&self, version: &str, update_id: Option<UpdateId>, error: &AgentError) {
        Reporter::failure(&self.client, version, update_id, error).await;
    }
}
