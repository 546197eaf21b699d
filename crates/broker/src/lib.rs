//! Abstract interface for the shared broker that server instances use to
//! synchronize with each other.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// Marker trait for broker errors
pub trait BrokerError: Error + Send + Sync + 'static {}

/// Stream of payloads published on a subscribed channel.
///
/// The stream ends once the owning client quits.
pub type Subscription = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// A client handle to a shared broker.
///
/// Handles start disconnected. `connect` must complete before any other
/// operation is used, and `quit` releases the handle for good.
#[async_trait]
pub trait Broker
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the broker.
    type Error: BrokerError;

    /// Connects the handle to the broker.
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Releases the handle and ends all of its subscriptions.
    async fn quit(&self) -> Result<(), Self::Error>;

    /// Whether the handle is currently connected.
    fn is_connected(&self) -> bool;

    /// Publishes a payload to every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), Self::Error>;

    /// Subscribes to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, Self::Error>;
}
