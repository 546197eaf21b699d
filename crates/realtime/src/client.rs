use crate::error::Error;
use crate::packet::{Event, Packet};
use crate::server::{DEFAULT_NAMESPACE, DEFAULT_PATH};

use std::fmt::{self, Debug};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

/// Options for [`ClientSocket::connect_with_options`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Namespace to join.
    pub namespace: String,

    /// Path the server serves WebSocket upgrades on.
    pub path: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            path: DEFAULT_PATH.to_string(),
        }
    }
}

/// Client side of a realtime connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ClientSocket {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: String,
    url: Url,
    outbound: mpsc::UnboundedSender<Packet>,
    incoming: Mutex<mpsc::UnboundedReceiver<Event>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl ClientSocket {
    /// Connects to the default namespace of the server at `url`.
    ///
    /// # Errors
    ///
    /// See [`ClientSocket::connect_with_options`].
    pub async fn connect(url: &str) -> Result<Self, Error> {
        Self::connect_with_options(url, ClientOptions::default()).await
    }

    /// Connects to the server at `url`, an `http(s)://` or `ws(s)://` base.
    ///
    /// Completes once the server has acknowledged the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the WebSocket connection
    /// fails, or the server does not open with a `connect` packet.
    pub async fn connect_with_options(url: &str, options: ClientOptions) -> Result<Self, Error> {
        let url = websocket_url(url, &options)?;

        debug!("connecting to {}", url);

        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(Box::new)?;
        let (mut sender, mut receiver) = ws_stream.split();

        let id = loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => match Packet::decode(text.as_str())? {
                    Packet::Connect { sid } => break sid,
                    Packet::Event { event, .. } => {
                        return Err(Error::Handshake(format!(
                            "expected connect packet, got event {event}"
                        )));
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::Handshake("connection closed".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Box::new(e).into()),
            }
        };

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Packet>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let token = shutdown_token.clone();
        let sid = id.clone();
        task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    Some(packet) = outbound_rx.recv() => {
                        let frame = match packet.encode() {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("dropping unencodable packet from {}: {}", sid, e);
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
                            Err(e) => warn!("invalid packet for {}: {}", sid, e),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("client {} failed: {}", sid, e);
                            break;
                        }
                    },
                }
            }

            token.cancel();
        });
        task_tracker.close();

        info!("client {} connected to {}", id, url);

        Ok(Self {
            inner: Arc::new(ClientInner {
                id,
                url,
                outbound,
                incoming: Mutex::new(incoming),
                shutdown_token,
                task_tracker,
            }),
        })
    }

    /// Connection id assigned by the server.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The WebSocket URL this client connected to.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.inner.shutdown_token.is_cancelled()
    }

    /// Sends an event to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the
    /// connection is closed.
    pub fn emit<T>(&self, event: &str, data: &T) -> Result<(), Error>
    where
        T: Serialize + ?Sized,
    {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        let packet = Packet::event(event, serde_json::to_value(data)?);
        self.inner
            .outbound
            .send(packet)
            .map_err(|_| Error::Disconnected)
    }

    /// Waits for the next event from the server.
    ///
    /// Returns `None` once the connection is closed and drained.
    pub async fn recv(&self) -> Option<Event> {
        self.inner.incoming.lock().await.recv().await
    }

    /// Closes the connection and waits for it to wind down.
    pub async fn disconnect(&self) {
        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.wait().await;

        debug!("client {} disconnected", self.inner.id);
    }
}

impl Debug for ClientSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocket")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url.as_str())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

fn websocket_url(base: &str, options: &ClientOptions) -> Result<Url, Error> {
    let mut url = Url::parse(base)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::UnsupportedScheme(scheme.to_string()))?;

    url.set_path(&options.path);
    if options.namespace != DEFAULT_NAMESPACE {
        url.query_pairs_mut()
            .append_pair("nsp", &options.namespace);
    }

    Ok(url)
}
