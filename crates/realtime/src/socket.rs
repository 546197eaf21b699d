use crate::adapter::PacketSink;
use crate::error::Error;
use crate::namespace::{BroadcastOperator, Namespace};
use crate::packet::{Event, Packet};

use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Server side of an accepted connection.
#[derive(Clone)]
pub struct ServerSocket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    id: String,
    namespace: Namespace,
    sink: PacketSink,
    incoming: Mutex<mpsc::UnboundedReceiver<Event>>,
    shutdown_token: CancellationToken,
}

impl ServerSocket {
    pub(crate) fn new(
        id: String,
        namespace: Namespace,
        sink: PacketSink,
        incoming: mpsc::UnboundedReceiver<Event>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id,
                namespace,
                sink,
                incoming: Mutex::new(incoming),
                shutdown_token,
            }),
        }
    }

    /// Connection id, shared with the client.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The namespace the connection belongs to.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    /// Joins a room.
    pub fn join(&self, room: impl Into<String>) {
        self.inner
            .namespace
            .adapter()
            .add_all(&self.inner.id, &[room.into()]);
    }

    /// Leaves a room.
    pub fn leave(&self, room: &str) {
        self.inner.namespace.adapter().del(&self.inner.id, room);
    }

    /// Rooms the connection is in, including its own id.
    #[must_use]
    pub fn rooms(&self) -> HashSet<String> {
        self.inner.namespace.adapter().rooms(&self.inner.id)
    }

    /// Sends an event to this connection only.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the
    /// connection is gone.
    pub fn emit<T>(&self, event: &str, data: &T) -> Result<(), Error>
    where
        T: Serialize + ?Sized,
    {
        let packet = Packet::event(event, serde_json::to_value(data)?);
        self.inner
            .sink
            .send(packet)
            .map_err(|_| Error::Disconnected)
    }

    /// Broadcasts to every other connection in the namespace.
    #[must_use]
    pub fn broadcast(&self) -> BroadcastOperator {
        BroadcastOperator::new(self.inner.namespace.adapter().clone()).except(self.inner.id.clone())
    }

    /// Broadcasts to a room, skipping this connection.
    #[must_use]
    pub fn to(&self, room: impl Into<String>) -> BroadcastOperator {
        self.broadcast().to(room)
    }

    /// Waits for the next event sent by the client.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn recv(&self) -> Option<Event> {
        self.inner.incoming.lock().await.recv().await
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.inner.shutdown_token.is_cancelled()
    }

    /// Closes the connection from the server side.
    pub fn disconnect(&self) {
        self.inner.shutdown_token.cancel();
    }
}

impl Debug for ServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocket")
            .field("id", &self.inner.id)
            .field("namespace", &self.inner.namespace.name())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
