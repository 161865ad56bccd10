use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use turbine_core::{MessageAck, RuntimeMessage};
use url::Url;

use crate::ExtractError;

pub const MESSAGES_PATH: &str = "/v1/messages";

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination for runtime messages produced by the page watcher.
///
/// Delivery is fire-and-forget: implementations swallow failures after logging.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: RuntimeMessage);
}

/// In-process hand-off to an aggregator task.
#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<RuntimeMessage>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<RuntimeMessage>) -> Self {
        Self { sender }
    }

    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RuntimeMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl MessageSink for ChannelSink {
    fn deliver(&self, message: RuntimeMessage) {
        if self.sender.send(message).is_err() {
            tracing::debug!("runtime message dropped: receiver closed");
        }
    }
}

#[derive(Deserialize)]
struct ServiceEnvelope<T> {
    data: T,
}

/// Posts runtime messages to a running `turbine-service`.
#[derive(Clone)]
pub struct HttpMessageSink {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpMessageSink {
    /// # Errors
    /// Returns [`ExtractError::Delivery`] when `service_url` is not an absolute URL.
    pub fn new(service_url: &str) -> Result<Self, ExtractError> {
        let endpoint = Url::parse(service_url)
            .and_then(|base| base.join(MESSAGES_PATH))
            .map_err(|err| {
                ExtractError::Delivery(format!("invalid service url {service_url}: {err}"))
            })?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            agent: ureq::AgentBuilder::new().timeout(DELIVERY_TIMEOUT).build(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Post one message and wait for the aggregator's acknowledgment.
    ///
    /// # Errors
    /// Returns [`ExtractError::Delivery`] on transport failure, a non-success
    /// status, or an undecodable response body.
    pub fn post(&self, message: &RuntimeMessage) -> Result<MessageAck, ExtractError> {
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(message)
            .map_err(|err| ExtractError::Delivery(err.to_string()))?;
        let envelope: ServiceEnvelope<MessageAck> = response
            .into_json()
            .map_err(|err| ExtractError::Delivery(format!("invalid acknowledgment: {err}")))?;
        Ok(envelope.data)
    }
}

impl MessageSink for HttpMessageSink {
    fn deliver(&self, message: RuntimeMessage) {
        let sink = self.clone();
        let send = move || match sink.post(&message) {
            Ok(ack) if !ack.success => {
                tracing::debug!(error = ?ack.error, "aggregator rejected runtime message");
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(error = %err, "runtime message delivery failed"),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(send);
            }
            Err(_) => send(),
        }
    }
}
