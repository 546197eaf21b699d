use crate::error::AdapterError;
use crate::packet::Packet;

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound queue of a single connection.
pub type PacketSink = mpsc::UnboundedSender<Packet>;

/// Selects which sockets a broadcast reaches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOptions {
    /// Rooms to target. Empty means every socket in the namespace.
    pub rooms: HashSet<String>,

    /// Members of these rooms are skipped.
    pub except: HashSet<String>,

    /// Do not forward to other server instances.
    #[serde(default)]
    pub local: bool,
}

/// Room bookkeeping and packet delivery for one namespace.
///
/// Adapters that synchronize several server instances forward broadcasts
/// to their peers in addition to delivering them locally.
#[async_trait]
pub trait Adapter: Debug + Send + Sync + 'static {
    /// Prepares the adapter before the server accepts connections.
    async fn init(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Registers a local connection.
    fn add_socket(&self, sid: &str, sink: PacketSink);

    /// Forgets a local connection and all of its room memberships.
    fn remove_socket(&self, sid: &str);

    /// Adds a connection to rooms.
    fn add_all(&self, sid: &str, rooms: &[String]);

    /// Removes a connection from a room.
    fn del(&self, sid: &str, room: &str);

    /// Rooms a local connection is in.
    fn rooms(&self, sid: &str) -> HashSet<String>;

    /// Local connections in any of `rooms`, or all of them if `rooms` is empty.
    fn sockets(&self, rooms: &HashSet<String>) -> HashSet<String>;

    /// Delivers a packet to the sockets selected by `opts`.
    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), AdapterError>;

    /// Releases resources held by the adapter.
    async fn close(&self) -> Result<(), AdapterError>;
}

/// Creates one adapter per namespace.
pub trait AdapterFactory: Debug + Send + Sync + 'static {
    /// Creates the adapter for `namespace`.
    fn create(&self, namespace: &str) -> Arc<dyn Adapter>;
}

#[derive(Debug, Default)]
struct Rooms {
    rooms: HashMap<String, HashSet<String>>,
    sids: HashMap<String, HashSet<String>>,
    sinks: HashMap<String, PacketSink>,
}

/// Single-instance adapter keeping rooms in memory.
#[derive(Debug)]
pub struct LocalAdapter {
    namespace: String,
    state: RwLock<Rooms>,
}

impl LocalAdapter {
    /// Creates an empty adapter for `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: RwLock::new(Rooms::default()),
        }
    }

    /// The namespace this adapter serves.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Delivers a packet to matching local sockets only.
    ///
    /// Returns the number of sockets the packet was queued for.
    pub fn deliver(&self, packet: &Packet, opts: &BroadcastOptions) -> usize {
        let state = self.state.read();

        let targets = Self::select(&state, &opts.rooms);
        let excluded = Self::select_rooms(&state, &opts.except);

        let mut delivered = 0;
        for sid in targets.difference(&excluded) {
            if let Some(sink) = state.sinks.get(sid) {
                if sink.send(packet.clone()).is_ok() {
                    delivered += 1;
                } else {
                    debug!("socket {} in {} is gone", sid, self.namespace);
                }
            }
        }

        delivered
    }

    fn select(state: &Rooms, rooms: &HashSet<String>) -> HashSet<String> {
        if rooms.is_empty() {
            state.sinks.keys().cloned().collect()
        } else {
            Self::select_rooms(state, rooms)
        }
    }

    fn select_rooms(state: &Rooms, rooms: &HashSet<String>) -> HashSet<String> {
        rooms
            .iter()
            .filter_map(|room| state.rooms.get(room))
            .flatten()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn add_socket(&self, sid: &str, sink: PacketSink) {
        self.state.write().sinks.insert(sid.to_string(), sink);
    }

    fn remove_socket(&self, sid: &str) {
        let mut state = self.state.write();
        state.sinks.remove(sid);

        if let Some(rooms) = state.sids.remove(sid) {
            for room in rooms {
                if let Some(members) = state.rooms.get_mut(&room) {
                    members.remove(sid);
                    if members.is_empty() {
                        state.rooms.remove(&room);
                    }
                }
            }
        }
    }

    fn add_all(&self, sid: &str, rooms: &[String]) {
        let mut state = self.state.write();
        for room in rooms {
            state
                .sids
                .entry(sid.to_string())
                .or_default()
                .insert(room.clone());
            state
                .rooms
                .entry(room.clone())
                .or_default()
                .insert(sid.to_string());
        }
    }

    fn del(&self, sid: &str, room: &str) {
        let mut state = self.state.write();
        if let Some(rooms) = state.sids.get_mut(sid) {
            rooms.remove(room);
        }
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(sid);
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
    }

    fn rooms(&self, sid: &str) -> HashSet<String> {
        self.state.read().sids.get(sid).cloned().unwrap_or_default()
    }

    fn sockets(&self, rooms: &HashSet<String>) -> HashSet<String> {
        Self::select(&self.state.read(), rooms)
    }

    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), AdapterError> {
        self.deliver(&packet, &opts);
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Factory for [`LocalAdapter`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalAdapterFactory;

impl AdapterFactory for LocalAdapterFactory {
    fn create(&self, namespace: &str) -> Arc<dyn Adapter> {
        Arc::new(LocalAdapter::new(namespace))
    }
}
