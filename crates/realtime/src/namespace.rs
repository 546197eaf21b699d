use crate::adapter::{Adapter, BroadcastOptions, PacketSink};
use crate::error::Error;
use crate::packet::Packet;
use crate::socket::ServerSocket;

use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

type ConnectionHandler = Arc<dyn Fn(ServerSocket) + Send + Sync>;

/// A named group of connections sharing one adapter.
#[derive(Clone)]
pub struct Namespace {
    inner: Arc<NamespaceInner>,
}

struct NamespaceInner {
    name: String,
    adapter: Arc<dyn Adapter>,
    handlers: RwLock<Vec<ConnectionHandler>>,
}

impl Namespace {
    pub(crate) fn new(name: impl Into<String>, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            inner: Arc::new(NamespaceInner {
                name: name.into(),
                adapter,
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// The namespace name, `/` for the default one.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The adapter serving this namespace.
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.inner.adapter
    }

    /// Registers a handler invoked once per accepted connection.
    pub fn on_connection<F>(&self, handler: F)
    where
        F: Fn(ServerSocket) + Send + Sync + 'static,
    {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    /// Ids of the connections currently attached to this instance.
    #[must_use]
    pub fn socket_ids(&self) -> HashSet<String> {
        self.inner.adapter.sockets(&HashSet::new())
    }

    /// Targets a room.
    #[must_use]
    pub fn to(&self, room: impl Into<String>) -> BroadcastOperator {
        BroadcastOperator::new(self.inner.adapter.clone()).to(room)
    }

    /// Skips the members of a room.
    #[must_use]
    pub fn except(&self, room: impl Into<String>) -> BroadcastOperator {
        BroadcastOperator::new(self.inner.adapter.clone()).except(room)
    }

    /// Restricts the broadcast to this server instance.
    #[must_use]
    pub fn local(&self) -> BroadcastOperator {
        BroadcastOperator::new(self.inner.adapter.clone()).local()
    }

    /// Sends an event to every connection in the namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the adapter
    /// fails to broadcast.
    pub async fn emit<T>(&self, event: &str, data: &T) -> Result<(), Error>
    where
        T: Serialize + Sync + ?Sized,
    {
        BroadcastOperator::new(self.inner.adapter.clone())
            .emit(event, data)
            .await
    }

    pub(crate) fn attach(&self, socket: &ServerSocket, sink: PacketSink) {
        let sid = socket.id();
        self.inner.adapter.add_socket(sid, sink);
        self.inner.adapter.add_all(sid, &[sid.to_string()]);

        debug!("socket {} joined namespace {}", sid, self.inner.name);

        let handlers = self.inner.handlers.read().clone();
        for handler in handlers {
            handler(socket.clone());
        }
    }

    pub(crate) fn detach(&self, sid: &str) {
        self.inner.adapter.remove_socket(sid);

        debug!("socket {} left namespace {}", sid, self.inner.name);
    }
}

impl Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.inner.name)
            .field("adapter", &self.inner.adapter)
            .finish_non_exhaustive()
    }
}

/// Builder for a broadcast routed through a namespace adapter.
#[derive(Clone, Debug)]
pub struct BroadcastOperator {
    adapter: Arc<dyn Adapter>,
    opts: BroadcastOptions,
}

impl BroadcastOperator {
    pub(crate) fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            adapter,
            opts: BroadcastOptions::default(),
        }
    }

    /// Adds a target room.
    #[must_use]
    pub fn to(mut self, room: impl Into<String>) -> Self {
        self.opts.rooms.insert(room.into());
        self
    }

    /// Adds a room whose members are skipped.
    #[must_use]
    pub fn except(mut self, room: impl Into<String>) -> Self {
        self.opts.except.insert(room.into());
        self
    }

    /// Restricts the broadcast to this server instance.
    #[must_use]
    pub const fn local(mut self) -> Self {
        self.opts.local = true;
        self
    }

    /// Sends the event.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the adapter
    /// fails to broadcast.
    pub async fn emit<T>(self, event: &str, data: &T) -> Result<(), Error>
    where
        T: Serialize + Sync + ?Sized,
    {
        let packet = Packet::event(event, serde_json::to_value(data)?);
        self.adapter.broadcast(packet, self.opts).await?;
        Ok(())
    }
}
