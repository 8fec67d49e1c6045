use std::sync::Arc;

use futures::future::{self, BoxFuture};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::DispatcherConfig,
    dto::{delivery::Delivery, sse::ServerEvent},
    state::SseHub,
};

/// Header naming the delivery's event so receivers can route without parsing.
const EVENT_HEADER: &str = "x-scheduler-event";

/// Failures reported by a dispatcher. The row stays pending on any of them.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to reach the delivery endpoint")]
    Transport(#[source] reqwest::Error),
    #[error("delivery endpoint answered {status}")]
    Rejected { status: StatusCode },
    #[error("no delivery subscriber is connected")]
    NoSubscribers,
    #[error("failed to encode delivery")]
    Encode(#[source] serde_json::Error),
}

/// Outbound boundary of the daemon.
///
/// `Ok` means the downstream side durably accepted the delivery.
pub trait Dispatcher: Send + Sync {
    /// Hand one delivery to the downstream side.
    fn dispatch(&self, delivery: Delivery) -> BoxFuture<'static, Result<(), DispatchError>>;
}

/// POSTs deliveries to a message bus endpoint.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: Client,
    url: Arc<str>,
    bearer_token: Option<Arc<str>>,
}

impl WebhookDispatcher {
    /// Build a client posting to `url` with the configured timeout and token.
    pub fn new(url: &str, config: &DispatcherConfig) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(DispatchError::Transport)?;

        Ok(Self {
            client,
            url: Arc::from(url),
            bearer_token: config.bearer_token.as_deref().map(Arc::from),
        })
    }
}

impl Dispatcher for WebhookDispatcher {
    fn dispatch(&self, delivery: Delivery) -> BoxFuture<'static, Result<(), DispatchError>> {
        let dispatcher = self.clone();
        Box::pin(async move {
            let mut builder = dispatcher
                .client
                .post(dispatcher.url.as_ref())
                .header(EVENT_HEADER, delivery.event.as_str())
                .json(&delivery);
            if let Some(token) = dispatcher.bearer_token.as_deref() {
                builder = builder.bearer_auth(token);
            }

            let response = builder.send().await.map_err(DispatchError::Transport)?;
            let status = response.status();
            if !status.is_success() {
                return Err(DispatchError::Rejected { status });
            }

            debug!(event_id = %delivery.event_id, %status, "delivery accepted by webhook");
            Ok(())
        })
    }
}

/// Publishes deliveries on the in-process SSE hub.
#[derive(Clone)]
pub struct BroadcastDispatcher {
    hub: SseHub,
}

impl BroadcastDispatcher {
    /// Publish on `hub`.
    pub fn new(hub: SseHub) -> Self {
        Self { hub }
    }
}

impl Dispatcher for BroadcastDispatcher {
    fn dispatch(&self, delivery: Delivery) -> BoxFuture<'static, Result<(), DispatchError>> {
        let result = ServerEvent::json(Some(delivery.event.clone()), &delivery)
            .map_err(DispatchError::Encode)
            .and_then(|event| match self.hub.broadcast(event) {
                0 => Err(DispatchError::NoSubscribers),
                _ => Ok(()),
            });
        Box::pin(future::ready(result))
    }
}

/// Webhook when a URL is configured, SSE hub otherwise.
pub fn build_dispatcher(
    config: &DispatcherConfig,
    hub: SseHub,
) -> Result<Arc<dyn Dispatcher>, DispatchError> {
    match config.webhook_url.as_deref() {
        Some(url) => {
            info!(url, "delivering through webhook");
            Ok(Arc::new(WebhookDispatcher::new(url, config)?))
        }
        None => {
            info!("delivering through the /deliveries/stream SSE hub");
            Ok(Arc::new(BroadcastDispatcher::new(hub)))
        }
    }
}
