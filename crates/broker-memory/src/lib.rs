//! In-memory implementation of the broker crate.
//!
//! A [`MemoryBroker`] plays the role of the shared external store: every
//! [`MemoryBrokerClient`] handed out by the same broker sees the same
//! channels, so server instances in one process can fan messages out to each
//! other exactly as they would through a networked broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use relay_broker::{Broker, Subscription};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Options for the in-memory broker.
#[derive(Clone, Debug)]
pub struct MemoryBrokerOptions {
    /// Number of messages buffered per channel before slow subscribers lag.
    pub channel_capacity: usize,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Shared in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Bytes>>>>,
    options: MemoryBrokerOptions,
}

impl MemoryBroker {
    /// Creates a new broker with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(MemoryBrokerOptions::default())
    }

    /// Creates a new broker with the given options.
    #[must_use]
    pub fn with_options(options: MemoryBrokerOptions) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            options,
        }
    }

    /// Hands out a new, not yet connected, client of this broker.
    #[must_use]
    pub fn client(&self) -> MemoryBrokerClient {
        MemoryBrokerClient {
            broker: self.clone(),
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Number of live subscriptions on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.options.channel_capacity).0)
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("channels", &self.channels.lock().len())
            .field("options", &self.options)
            .finish()
    }
}

/// A client handle to a [`MemoryBroker`].
///
/// Clones share the same connection state.
#[derive(Clone)]
pub struct MemoryBrokerClient {
    broker: MemoryBroker,
    /// Present while connected. Cancelled on quit to end subscriptions.
    session: Arc<RwLock<Option<CancellationToken>>>,
}

impl MemoryBrokerClient {
    fn session(&self) -> Result<CancellationToken, Error> {
        self.session.read().clone().ok_or(Error::NotConnected)
    }
}

impl Debug for MemoryBrokerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBrokerClient")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Broker for MemoryBrokerClient {
    type Error = Error;

    async fn connect(&self) -> Result<(), Self::Error> {
        let mut session = self.session.write();
        if session.is_some() {
            return Err(Error::AlreadyConnected);
        }
        *session = Some(CancellationToken::new());
        drop(session);

        debug!("memory broker client connected");
        Ok(())
    }

    async fn quit(&self) -> Result<(), Self::Error> {
        let token = self.session.write().take().ok_or(Error::NotConnected)?;
        token.cancel();

        debug!("memory broker client quit");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.read().is_some()
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), Self::Error> {
        self.session()?;

        // No subscribers is not an error, the message is simply dropped.
        let _ = self.broker.sender(channel).send(payload);

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, Self::Error> {
        let session = self.session()?;
        let receiver = self.broker.sender(channel).subscribe();
        let channel = channel.to_string();

        let stream = BroadcastStream::new(receiver)
            .filter_map(move |message| {
                let payload = match message {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!("subscriber on {} lagged, skipped {} messages", channel, skipped);
                        None
                    }
                };
                futures::future::ready(payload)
            })
            .take_until(session.cancelled_owned());

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn test_publish_reaches_other_clients() {
        let _ = tracing_subscriber::fmt::try_init();

        let broker = MemoryBroker::new();
        let publisher = broker.client();
        let subscriber = broker.client();
        publisher.connect().await.unwrap();
        subscriber.connect().await.unwrap();

        let mut subscription = subscriber.subscribe("room#/#").await.unwrap();
        publisher
            .publish("room#/#", Bytes::from("hello"))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), subscription.next())
            .await
            .unwrap();
        assert_eq!(received, Some(Bytes::from("hello")));
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let broker = MemoryBroker::new();
        let client = broker.client();
        client.connect().await.unwrap();

        let mut subscription = client.subscribe("a").await.unwrap();
        client.publish("b", Bytes::from("other")).await.unwrap();
        client.publish("a", Bytes::from("mine")).await.unwrap();

        assert_eq!(subscription.next().await, Some(Bytes::from("mine")));
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let broker = MemoryBroker::new();
        let client = broker.client();

        assert!(!client.is_connected());
        assert!(matches!(
            client.publish("a", Bytes::new()).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            client.subscribe("a").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(client.quit().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_double_connect() {
        let client = MemoryBroker::new().client();
        client.connect().await.unwrap();

        assert!(matches!(
            client.connect().await,
            Err(Error::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_quit_ends_subscriptions() {
        let broker = MemoryBroker::new();
        let client = broker.client();
        client.connect().await.unwrap();

        let mut subscription = client.subscribe("a").await.unwrap();
        assert_eq!(broker.subscriber_count("a"), 1);

        client.quit().await.unwrap();
        assert!(!client.is_connected());

        let next = timeout(Duration::from_secs(1), subscription.next())
            .await
            .unwrap();
        assert_eq!(next, None);
    }
}
