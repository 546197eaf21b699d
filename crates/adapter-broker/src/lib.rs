//! Adapter that ties realtime server instances together through a shared
//! broker.
//!
//! Every namespace adapter subscribes to a broker channel named after the
//! namespace. Broadcasts are delivered to local sockets and published on that
//! channel, and each peer instance applies what it receives to its own local
//! sockets. Room membership stays local to each instance.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use relay_broker::Broker;
use relay_realtime::{
    Adapter, AdapterError, AdapterFactory, BroadcastOptions, LocalAdapter, Packet, PacketSink,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Options for broker-backed adapters.
#[derive(Clone, Debug)]
pub struct BrokerAdapterOptions {
    /// Prefix of the broker channels.
    pub key: String,
}

impl Default for BrokerAdapterOptions {
    fn default() -> Self {
        Self {
            key: "relay".to_string(),
        }
    }
}

/// What travels over the broker for each broadcast.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    uid: String,
    packet: Packet,
    opts: BroadcastOptions,
}

/// Builds a factory producing one [`BrokerAdapter`] per namespace, all
/// sharing the given connected broker client.
pub fn create_adapter<B: Broker>(broker: B) -> BrokerAdapterFactory<B> {
    create_adapter_with_options(broker, BrokerAdapterOptions::default())
}

/// Like [`create_adapter`], with explicit options.
pub fn create_adapter_with_options<B: Broker>(
    broker: B,
    options: BrokerAdapterOptions,
) -> BrokerAdapterFactory<B> {
    BrokerAdapterFactory { broker, options }
}

/// Factory for [`BrokerAdapter`]s.
#[derive(Clone, Debug)]
pub struct BrokerAdapterFactory<B: Broker> {
    broker: B,
    options: BrokerAdapterOptions,
}

impl<B: Broker> AdapterFactory for BrokerAdapterFactory<B> {
    fn create(&self, namespace: &str) -> Arc<dyn Adapter> {
        Arc::new(BrokerAdapter::new(
            self.broker.clone(),
            namespace,
            &self.options,
        ))
    }
}

/// Namespace adapter synchronizing broadcasts through a broker.
#[derive(Debug)]
pub struct BrokerAdapter<B: Broker> {
    uid: String,
    channel: String,
    broker: B,
    local: Arc<LocalAdapter>,
    initialized: AtomicBool,
    closed: AtomicBool,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<B: Broker> BrokerAdapter<B> {
    /// Creates an adapter for `namespace`. Nothing is subscribed until
    /// [`Adapter::init`] runs.
    pub fn new(broker: B, namespace: &str, options: &BrokerAdapterOptions) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            channel: format!("{}#{}#", options.key, namespace),
            broker,
            local: Arc::new(LocalAdapter::new(namespace)),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Identifier distinguishing this adapter's messages from its peers'.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Broker channel this adapter publishes and listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether [`Adapter::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn subscribe(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        let mut subscription = self
            .broker
            .subscribe(&self.channel)
            .await
            .map_err(|e| Error::Broker(Box::new(e)))?;

        let uid = self.uid.clone();
        let local = self.local.clone();
        let shutdown_token = self.shutdown_token.clone();
        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown_token.cancelled() => break,
                    payload = subscription.next() => match payload {
                        Some(payload) => apply_remote(&uid, &local, &payload),
                        None => break,
                    },
                }
            }

            debug!("stopped listening for broadcasts of {}", local.namespace());
        });

        info!("adapter {} subscribed to {}", self.uid, self.channel);

        Ok(())
    }

    async fn publish(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        self.local.deliver(&packet, &opts);

        if opts.local {
            return Ok(());
        }

        let envelope = Envelope {
            uid: self.uid.clone(),
            packet,
            opts,
        };
        let payload = Bytes::from(serde_json::to_vec(&envelope)?);

        self.broker
            .publish(&self.channel, payload)
            .await
            .map_err(|e| Error::Broker(Box::new(e)))
    }
}

fn apply_remote(uid: &str, local: &LocalAdapter, payload: &[u8]) {
    let envelope: Envelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("ignoring malformed broadcast on {}: {}", local.namespace(), e);
            return;
        }
    };

    if envelope.uid == uid {
        return;
    }

    let delivered = local.deliver(&envelope.packet, &envelope.opts);
    debug!(
        "applied broadcast from {} to {} local sockets",
        envelope.uid, delivered
    );
}

#[async_trait]
impl<B: Broker> Adapter for BrokerAdapter<B> {
    async fn init(&self) -> Result<(), AdapterError> {
        Ok(self.subscribe().await?)
    }

    fn add_socket(&self, sid: &str, sink: PacketSink) {
        self.local.add_socket(sid, sink);
    }

    fn remove_socket(&self, sid: &str) {
        self.local.remove_socket(sid);
    }

    fn add_all(&self, sid: &str, rooms: &[String]) {
        self.local.add_all(sid, rooms);
    }

    fn del(&self, sid: &str, room: &str) {
        self.local.del(sid, room);
    }

    fn rooms(&self, sid: &str) -> HashSet<String> {
        self.local.rooms(sid)
    }

    fn sockets(&self, rooms: &HashSet<String>) -> HashSet<String> {
        self.local.sockets(rooms)
    }

    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), AdapterError> {
        Ok(self.publish(packet, opts).await?)
    }

    async fn close(&self) -> Result<(), AdapterError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("adapter {} closed", self.uid);

        Ok(())
    }
}
