use crate::adapter::{AdapterFactory, LocalAdapterFactory};
use crate::error::Error;
use crate::namespace::Namespace;
use crate::packet::{Event, Packet};
use crate::socket::ServerSocket;

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name of the namespace every server starts with.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Path WebSocket upgrades are served on unless configured otherwise.
pub const DEFAULT_PATH: &str = "/realtime";

/// Options for [`Server`].
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Builds the adapter of each namespace.
    pub adapter: Arc<dyn AdapterFactory>,

    /// HTTP path WebSocket upgrades are served on.
    pub path: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            adapter: Arc::new(LocalAdapterFactory),
            path: DEFAULT_PATH.to_string(),
        }
    }
}

/// A realtime server instance.
///
/// Cheap to clone; clones refer to the same instance.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    options: ServerOptions,
    namespaces: RwLock<HashMap<String, Namespace>>,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    nsp: Option<String>,
}

impl Server {
    /// Creates a server with the default namespace in place.
    #[must_use]
    pub fn new(options: ServerOptions) -> Self {
        let server = Self {
            inner: Arc::new(ServerInner {
                options,
                namespaces: RwLock::new(HashMap::new()),
                local_addr: RwLock::new(None),
                shutdown_token: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
            }),
        };
        server.of(DEFAULT_NAMESPACE);
        server
    }

    /// Returns the namespace called `name`, creating it on first use.
    ///
    /// Adapters of namespaces created after [`Server::listen`] are
    /// initialized in the background.
    pub fn of(&self, name: &str) -> Namespace {
        if let Some(namespace) = self.inner.namespaces.read().get(name) {
            return namespace.clone();
        }

        let namespace = {
            let mut namespaces = self.inner.namespaces.write();
            if let Some(namespace) = namespaces.get(name) {
                return namespace.clone();
            }
            let namespace = Namespace::new(name, self.inner.options.adapter.create(name));
            namespaces.insert(name.to_string(), namespace.clone());
            namespace
        };

        if self.is_listening() {
            let adapter = namespace.adapter().clone();
            let name = name.to_string();
            self.inner.task_tracker.spawn(async move {
                if let Err(e) = adapter.init().await {
                    error!("failed to initialize adapter for {}: {}", name, e);
                }
            });
        }

        namespace
    }

    /// The address the server is bound to, once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    /// Whether [`Server::listen`] has completed.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.inner.local_addr.read().is_some()
    }

    /// Whether [`Server::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown_token.is_cancelled()
    }

    /// Initializes every namespace adapter and starts accepting
    /// connections on `listener`.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is closed or already listening, if the
    /// listener address cannot be read, or if an adapter fails to initialize.
    pub async fn listen(&self, listener: TcpListener) -> Result<SocketAddr, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.is_listening() {
            return Err(Error::AlreadyListening);
        }

        let adapters: Vec<_> = self
            .inner
            .namespaces
            .read()
            .values()
            .map(|namespace| namespace.adapter().clone())
            .collect();
        for adapter in adapters {
            adapter.init().await?;
        }

        let local_addr = listener.local_addr()?;
        {
            let mut bound = self.inner.local_addr.write();
            if bound.is_some() {
                return Err(Error::AlreadyListening);
            }
            *bound = Some(local_addr);
        }

        let router = Router::new()
            .route(&self.inner.options.path, get(upgrade))
            .with_state(self.clone());

        let shutdown_token = self.inner.shutdown_token.clone();
        self.inner.task_tracker.spawn(async move {
            tokio::select! {
                e = axum::serve(listener, router).into_future() => {
                    info!("realtime server exited {:?}", e);
                }
                () = shutdown_token.cancelled() => {}
            };
        });

        info!("realtime server listening on {}", local_addr);

        Ok(local_addr)
    }

    /// Stops accepting connections.
    ///
    /// Connections that are already open stay open until either side
    /// disconnects.
    pub async fn close(&self) {
        info!("realtime server shutting down...");

        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;

        info!("realtime server shutdown");
    }

    fn existing(&self, name: &str) -> Option<Namespace> {
        self.inner.namespaces.read().get(name).cloned()
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn upgrade(
    State(server): State<Server>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let name = query.nsp.as_deref().unwrap_or(DEFAULT_NAMESPACE);

    if server.is_closed() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match server.existing(name) {
        Some(namespace) => ws.on_upgrade(move |socket| handle_socket(socket, namespace)),
        None => {
            debug!("rejecting connection to unknown namespace {}", name);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, namespace: Namespace) {
    let sid = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let hello = match (Packet::Connect { sid: sid.clone() }).encode() {
        Ok(hello) => hello,
        Err(e) => {
            error!("failed to encode connect packet: {}", e);
            return;
        }
    };
    if let Err(e) = sender.send(Message::Text(hello.into())).await {
        debug!("connection dropped during handshake: {}", e);
        return;
    }

    let (sink, mut outbound) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let shutdown_token = CancellationToken::new();

    let server_socket = ServerSocket::new(
        sid.clone(),
        namespace.clone(),
        sink.clone(),
        incoming_rx,
        shutdown_token.clone(),
    );
    namespace.attach(&server_socket, sink);

    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            Some(packet) = outbound.recv() => {
                let frame = match packet.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("dropping unencodable packet for {}: {}", sid, e);
                        continue;
                    }
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => match Packet::decode(text.as_str()) {
                    Ok(packet) => {
                        if let Some(event) = Event::from_packet(packet) {
                            let _ = incoming_tx.send(event);
                        }
                    }
                    Err(e) => warn!("invalid packet from {}: {}", sid, e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("connection {} failed: {}", sid, e);
                    break;
                }
            },
        }
    }

    shutdown_token.cancel();
    namespace.detach(&sid);
}
