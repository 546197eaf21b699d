//! Cluster bootstrap and teardown.

use crate::error::Error;
use crate::times::{Times, times};

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_broker::Broker;
use relay_broker_memory::{MemoryBroker, MemoryBrokerClient};
use relay_realtime::{
    AdapterFactory, ClientSocket, DEFAULT_NAMESPACE, Server, ServerOptions, ServerSocket,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Options for [`ClusterBootstrap`].
#[derive(Clone, Debug)]
pub struct ClusterOptions {
    /// Number of nodes to start.
    pub nodes: usize,

    /// Pause after the last handshake, giving the broker time to propagate
    /// subscriptions before the cluster is handed out.
    pub settle_delay: Duration,

    /// How long to wait for every node to complete its handshake.
    pub timeout: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            nodes: 3,
            settle_delay: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        }
    }
}

/// A ready cluster.
///
/// The three vectors are index-aligned: `server_sockets[i]` is the
/// connection `servers[i]` accepted from `client_sockets[i]`. Order follows
/// handshake completion, not node start order.
#[derive(Debug)]
pub struct TestContext<B: Broker = MemoryBrokerClient> {
    /// One server per node.
    pub servers: Vec<Server>,

    /// The connection each server accepted.
    pub server_sockets: Vec<ServerSocket>,

    /// The client each server accepted.
    pub client_sockets: Vec<ClientSocket>,

    /// Releases everything the bootstrap created.
    pub cleanup: Cleanup<B>,
}

/// Releases every resource created by a bootstrap.
///
/// Consumed by [`Cleanup::run`], so it runs at most once.
#[derive(Debug)]
pub struct Cleanup<B: Broker> {
    servers: Vec<Server>,
    client_sockets: Vec<ClientSocket>,
    brokers: Vec<B>,
}

impl<B: Broker> Cleanup<B> {
    /// Closes every server listener and its default namespace adapter, then
    /// disconnects every client, then quits every broker client.
    ///
    /// # Errors
    ///
    /// Returns the first failure; later steps are skipped.
    pub async fn run(self) -> Result<(), Error> {
        for server in &self.servers {
            server.close().await;
            server.of(DEFAULT_NAMESPACE).adapter().close().await?;
        }

        for client in &self.client_sockets {
            client.disconnect().await;
        }

        for broker in &self.brokers {
            broker.quit().await.map_err(|e| Error::Broker(Box::new(e)))?;
        }

        info!("cluster of {} nodes torn down", self.servers.len());

        Ok(())
    }
}

type Quorum = Times<Box<dyn FnOnce() + Send>>;

/// Per-node results collected as handshakes complete.
struct Accumulator<B> {
    servers: Vec<Server>,
    server_sockets: Vec<ServerSocket>,
    client_sockets: Vec<ClientSocket>,
    brokers: Vec<B>,
    quorum: Quorum,
}

impl<B: Broker> Accumulator<B> {
    fn new(expected: usize, ready: oneshot::Sender<()>) -> Self {
        Self {
            servers: Vec::with_capacity(expected),
            server_sockets: Vec::with_capacity(expected),
            client_sockets: Vec::with_capacity(expected),
            brokers: Vec::with_capacity(expected),
            quorum: times(
                expected,
                Box::new(move || {
                    let _ = ready.send(());
                }),
            ),
        }
    }

    /// Appends one node's results and counts it towards the quorum.
    fn push(
        &mut self,
        server: Server,
        server_socket: ServerSocket,
        client_socket: ClientSocket,
        broker: B,
    ) -> Result<(), Error> {
        self.servers.push(server);
        self.server_sockets.push(server_socket);
        self.client_sockets.push(client_socket);
        self.brokers.push(broker);

        self.quorum.call()
    }

    fn len(&self) -> usize {
        self.servers.len()
    }

    fn take(&mut self) -> (Vec<Server>, Vec<ServerSocket>, Vec<ClientSocket>, Vec<B>) {
        (
            std::mem::take(&mut self.servers),
            std::mem::take(&mut self.server_sockets),
            std::mem::take(&mut self.client_sockets),
            std::mem::take(&mut self.brokers),
        )
    }
}

/// Starts a cluster of realtime servers sharing one broker and connects one
/// client to each.
#[derive(Clone, Debug, Default)]
pub struct ClusterBootstrap {
    options: ClusterOptions,
}

impl ClusterBootstrap {
    /// Creates a bootstrap with the given options.
    #[must_use]
    pub const fn new(options: ClusterOptions) -> Self {
        Self { options }
    }

    /// Starts every node concurrently and resolves once each has accepted
    /// its client.
    ///
    /// `new_broker` hands out one unconnected broker client per node;
    /// `make_adapter` turns the connected client into the adapter factory
    /// the node's server is configured with.
    ///
    /// # Errors
    ///
    /// Returns the first node failure, or [`Error::Timeout`] if the cluster
    /// is not ready within [`ClusterOptions::timeout`]. Remaining node tasks
    /// are aborted and the nodes that were already ready are torn down
    /// before the error is returned.
    pub async fn start<B, A, S, M>(
        &self,
        new_broker: S,
        make_adapter: M,
    ) -> Result<TestContext<B>, Error>
    where
        B: Broker,
        A: AdapterFactory,
        S: Fn() -> B,
        M: Fn(B) -> A + Send + Sync + 'static,
    {
        let expected = self.options.nodes;
        if expected == 0 {
            return Err(Error::EmptyCluster);
        }

        let started = Instant::now();
        let (ready_tx, mut ready_rx) = oneshot::channel();
        let accumulator = Arc::new(Mutex::new(Accumulator::new(expected, ready_tx)));
        let make_adapter = Arc::new(make_adapter);

        let mut nodes = JoinSet::new();
        for index in 0..expected {
            nodes.spawn(bootstrap_node(
                index,
                new_broker(),
                make_adapter.clone(),
                accumulator.clone(),
            ));
        }

        let deadline = tokio::time::sleep(self.options.timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                _ = &mut ready_rx => break Ok(()),
                Some(joined) = nodes.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(Error::Join(e)),
                },
                () = &mut deadline => {
                    break Err(Error::Timeout {
                        accepted: accumulator.lock().len(),
                        expected,
                        elapsed: started.elapsed(),
                    });
                }
            }
        };

        if let Err(e) = outcome {
            nodes.shutdown().await;
            release(&accumulator).await;
            return Err(e);
        }

        info!(
            "all {} nodes ready after {:?}, settling for {:?}",
            expected,
            started.elapsed(),
            self.options.settle_delay
        );
        crate::sleep(self.options.settle_delay).await;

        let (servers, server_sockets, client_sockets, brokers) = accumulator.lock().take();

        Ok(TestContext {
            servers: servers.clone(),
            server_sockets,
            client_sockets: client_sockets.clone(),
            cleanup: Cleanup {
                servers,
                client_sockets,
                brokers,
            },
        })
    }
}

/// Tears down the nodes that completed before the bootstrap failed.
async fn release<B: Broker>(accumulator: &Mutex<Accumulator<B>>) {
    let (servers, _, client_sockets, brokers) = accumulator.lock().take();
    let released = servers.len();

    let cleanup = Cleanup {
        servers,
        client_sockets,
        brokers,
    };
    if let Err(e) = cleanup.run().await {
        warn!("failed to release {} ready nodes: {}", released, e);
    }
}

async fn bootstrap_node<B, A, M>(
    index: usize,
    broker: B,
    make_adapter: Arc<M>,
    accumulator: Arc<Mutex<Accumulator<B>>>,
) -> Result<(), Error>
where
    B: Broker,
    A: AdapterFactory,
    M: Fn(B) -> A + Send + Sync + 'static,
{
    broker
        .connect()
        .await
        .map_err(|e| Error::Broker(Box::new(e)))?;

    let server = Server::new(ServerOptions {
        adapter: Arc::new(make_adapter(broker.clone())),
        ..ServerOptions::default()
    });

    let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
    server.of(DEFAULT_NAMESPACE).on_connection(move |socket| {
        let _ = accepted_tx.send(socket);
    });

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(Error::Bind)?;
    let addr = server.listen(listener).await?;

    debug!("node {} listening on port {}", index, addr.port());

    let client = ClientSocket::connect(&format!("http://localhost:{}", addr.port())).await?;

    let server_socket = loop {
        let socket = accepted_rx.recv().await.ok_or(Error::NodeStopped(index))?;
        if socket.id() == client.id() {
            break socket;
        }
        warn!("node {} accepted unexpected connection {}", index, socket.id());
    };

    debug!("node {} accepted client {}", index, client.id());

    accumulator
        .lock()
        .push(server, server_socket, client, broker)
}

/// Starts the reference cluster: three nodes on a fresh in-memory broker,
/// each using the broker adapter.
///
/// # Errors
///
/// See [`ClusterBootstrap::start`].
pub async fn setup() -> Result<TestContext, Error> {
    setup_with_options(ClusterOptions::default()).await
}

/// Like [`setup`], with explicit options.
///
/// # Errors
///
/// See [`ClusterBootstrap::start`].
pub async fn setup_with_options(options: ClusterOptions) -> Result<TestContext, Error> {
    let broker = MemoryBroker::new();

    ClusterBootstrap::new(options)
        .start(
            move || broker.client(),
            relay_adapter_broker::create_adapter::<MemoryBrokerClient>,
        )
        .await
}
