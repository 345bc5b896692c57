//! NATS JetStream broker.

use async_nats::HeaderMap;
use async_nats::jetstream::{self, Context};
use async_trait::async_trait;

use crate::broker::{Broker, BrokerError, PublishedEvent};

/// Publishes to JetStream and waits for the stream's acknowledgement.
///
/// The `Nats-Msg-Id` header carries the dedup key, so JetStream's own
/// duplicate window drops redeliveries that arrive within it.
#[derive(Clone)]
pub struct JetStreamBroker {
    jetstream: Context,
}

impl JetStreamBroker {
    /// Connects to a NATS server.
    pub async fn connect(nats_url: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self::new(jetstream::new(client)))
    }

    pub fn new(jetstream: Context) -> Self {
        Self { jetstream }
    }
}

#[async_trait]
impl Broker for JetStreamBroker {
    async fn publish(&self, subject: &str, event: &PublishedEvent) -> Result<(), BrokerError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| BrokerError::Nack(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert("Nats-Msg-Id", event.dedup_key.as_str());

        self.jetstream
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Nack(e.to_string()))?;

        Ok(())
    }
}

impl std::fmt::Debug for JetStreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JetStreamBroker").finish_non_exhaustive()
    }
}
