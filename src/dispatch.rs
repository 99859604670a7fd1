//! Forwarding of normalized events to the downstream service.

use crate::{config::DEFAULT_DISPATCH_URL, error::Result, types::ConversationEvent, RelayError};
use reqwest::Client;
use tracing::{info, warn};

/// Status and body of a downstream reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub status: u16,
    pub body: String,
}

/// Posts [`ConversationEvent`]s to one fixed endpoint.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
    endpoint: String,
}

impl Dispatcher {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Dispatcher for the sidecar reachable as `svc` inside the environment.
    pub fn sidecar(client: Client) -> Self {
        Self::new(client, DEFAULT_DISPATCH_URL)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST the event as JSON. A transport failure or a non-2xx status is a
    /// [`RelayError::Dispatch`]; the reply body is not interpreted.
    pub async fn send(&self, event: &ConversationEvent) -> Result<DispatchOutcome> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await
            .map_err(|e| RelayError::Dispatch {
                status: None,
                body: format!("Failed to reach {}: {}", self.endpoint, e),
            })?;

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            warn!(status, body = %body, endpoint = %self.endpoint, "downstream rejected event");
            return Err(RelayError::Dispatch {
                status: Some(status),
                body,
            });
        }

        info!(status, body = %body, endpoint = %self.endpoint, "event dispatched");
        Ok(DispatchOutcome { status, body })
    }
}
