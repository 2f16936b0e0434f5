use anyhow::{Context, Result};
use async_nats::Client;
use tracing::info;

use super::messages::events_subject;
use crate::session::SessionEvent;

/// Event bus connection used to report session status
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client })
    }

    /// Underlying client, shared with the voice transport
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Publish a session event as JSON
    pub async fn publish_event(&self, event: &SessionEvent) -> Result<()> {
        let subject = events_subject(event.session());
        let payload = serde_json::to_vec(event)?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .context("Failed to publish session event")?;

        info!("Published session event to {}", subject);

        Ok(())
    }

    /// Flush pending publishes before shutdown
    pub async fn close(self) -> Result<()> {
        info!("Closing NATS connection");
        self.client
            .flush()
            .await
            .context("Failed to flush NATS connection")?;
        Ok(())
    }
}
