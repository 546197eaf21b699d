//! Realtime messaging over WebSocket.
//!
//! A [`Server`] accepts WebSocket connections on an HTTP path and groups them
//! into [`Namespace`]s. Every namespace delegates room bookkeeping and packet
//! delivery to an [`Adapter`], which is where several server instances can be
//! tied together. [`ClientSocket`] is the matching client.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod adapter;
mod client;
mod error;
mod namespace;
mod packet;
mod server;
mod socket;

pub use adapter::{
    Adapter, AdapterFactory, BroadcastOptions, LocalAdapter, LocalAdapterFactory, PacketSink,
};
pub use client::{ClientOptions, ClientSocket};
pub use error::{AdapterError, Error};
pub use namespace::{BroadcastOperator, Namespace};
pub use packet::{Event, Packet};
pub use server::{DEFAULT_NAMESPACE, DEFAULT_PATH, Server, ServerOptions};
pub use socket::ServerSocket;
