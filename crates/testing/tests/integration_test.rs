//! Cluster bootstrap against real servers

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_adapter_broker::{BrokerAdapterFactory, create_adapter};
use relay_broker::{Broker, BrokerError, Subscription};
use relay_broker_memory::{MemoryBroker, MemoryBrokerClient};
use relay_realtime::{
    Adapter, AdapterError, AdapterFactory, BroadcastOptions, ClientSocket, LocalAdapter, Packet,
    PacketSink,
};
use relay_testing::{ClusterBootstrap, ClusterOptions, Error, setup, setup_with_options};
use serde_json::json;
use tokio::time::{Instant, timeout};

fn quick(nodes: usize) -> ClusterOptions {
    ClusterOptions {
        nodes,
        settle_delay: Duration::from_millis(20),
        ..ClusterOptions::default()
    }
}

#[tokio::test]
async fn test_setup_aligns_nodes() {
    let _ = tracing_subscriber::fmt::try_init();

    let ctx = setup().await.unwrap();

    assert_eq!(ctx.servers.len(), 3);
    assert_eq!(ctx.server_sockets.len(), 3);
    assert_eq!(ctx.client_sockets.len(), 3);

    for i in 0..3 {
        let sid = ctx.client_sockets[i].id();
        assert_eq!(ctx.server_sockets[i].id(), sid);
        assert!(ctx.servers[i].of("/").socket_ids().contains(sid));
        assert!(ctx.client_sockets[i].is_connected());
        assert!(ctx.servers[i].is_listening());
    }

    let ports: HashSet<_> = ctx
        .servers
        .iter()
        .map(|server| server.local_addr().unwrap().port())
        .collect();
    assert_eq!(ports.len(), 3);

    ctx.cleanup.run().await.unwrap();
}

#[tokio::test]
async fn test_pairs_talk_to_each_other() {
    let _ = tracing_subscriber::fmt::try_init();

    let ctx = setup_with_options(quick(3)).await.unwrap();

    for (i, (client, socket)) in ctx
        .client_sockets
        .iter()
        .zip(&ctx.server_sockets)
        .enumerate()
    {
        client.emit("ping", &i).unwrap();
        let event = timeout(Duration::from_secs(1), socket.recv())
            .await
            .expect("event not received")
            .unwrap();
        assert_eq!(event.name, "ping");
        assert_eq!(event.data, json!(i));
    }

    ctx.cleanup.run().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_every_node() {
    let _ = tracing_subscriber::fmt::try_init();

    let ctx = setup().await.unwrap();

    ctx.servers[0]
        .of("/")
        .emit("hello", &json!({"from": 0}))
        .await
        .unwrap();

    for client in &ctx.client_sockets {
        let event = timeout(Duration::from_secs(1), client.recv())
            .await
            .expect("broadcast not received")
            .unwrap();
        assert_eq!(event.name, "hello");
        assert_eq!(event.data, json!({"from": 0}));
    }

    ctx.server_sockets[1].join("room1");
    ctx.servers[2]
        .of("/")
        .to("room1")
        .emit("scoped", &())
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(1), ctx.client_sockets[1].recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "scoped");
    for i in [0, 2] {
        assert!(
            timeout(Duration::from_millis(100), ctx.client_sockets[i].recv())
                .await
                .is_err()
        );
    }

    ctx.cleanup.run().await.unwrap();
}

#[tokio::test]
async fn test_cleanup_releases_everything() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let source = broker.clone();
    let ctx = ClusterBootstrap::new(quick(2))
        .start(move || source.client(), create_adapter::<MemoryBrokerClient>)
        .await
        .unwrap();

    assert_eq!(broker.subscriber_count("relay#/#"), 2);

    let servers = ctx.servers.clone();
    let clients = ctx.client_sockets.clone();
    let urls: Vec<_> = servers
        .iter()
        .map(|server| format!("http://localhost:{}", server.local_addr().unwrap().port()))
        .collect();

    ctx.cleanup.run().await.unwrap();

    assert_eq!(broker.subscriber_count("relay#/#"), 0);

    for server in &servers {
        assert!(server.is_closed());
        assert!(matches!(
            server
                .of("/")
                .adapter()
                .broadcast(Packet::event("late", json!(null)), BroadcastOptions::default())
                .await,
            Err(AdapterError::Closed)
        ));
    }
    for client in &clients {
        assert!(!client.is_connected());
    }
    for url in &urls {
        assert!(ClientSocket::connect(url).await.is_err());
    }
}

#[tokio::test]
async fn test_single_node() {
    let ctx = setup_with_options(quick(1)).await.unwrap();

    assert_eq!(ctx.servers.len(), 1);
    assert_eq!(ctx.server_sockets[0].id(), ctx.client_sockets[0].id());

    ctx.cleanup.run().await.unwrap();
}

#[tokio::test]
async fn test_larger_cluster() {
    let ctx = setup_with_options(quick(5)).await.unwrap();

    assert_eq!(ctx.servers.len(), 5);
    let ids: HashSet<_> = ctx.client_sockets.iter().map(ClientSocket::id).collect();
    assert_eq!(ids.len(), 5);
    for (socket, client) in ctx.server_sockets.iter().zip(&ctx.client_sockets) {
        assert_eq!(socket.id(), client.id());
    }

    ctx.cleanup.run().await.unwrap();
}

#[tokio::test]
async fn test_empty_cluster_is_rejected() {
    assert!(matches!(
        setup_with_options(quick(0)).await,
        Err(Error::EmptyCluster)
    ));
}

#[derive(Debug, thiserror::Error)]
#[error("broker unavailable")]
struct Unavailable;

impl BrokerError for Unavailable {}

#[derive(Clone, Debug)]
struct UnavailableBroker;

#[async_trait]
impl Broker for UnavailableBroker {
    type Error = Unavailable;

    async fn connect(&self) -> Result<(), Unavailable> {
        Err(Unavailable)
    }

    async fn quit(&self) -> Result<(), Unavailable> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), Unavailable> {
        Err(Unavailable)
    }

    async fn subscribe(&self, _channel: &str) -> Result<Subscription, Unavailable> {
        Err(Unavailable)
    }
}

#[tokio::test]
async fn test_broker_failure_is_reported() {
    let _ = tracing_subscriber::fmt::try_init();

    let result = ClusterBootstrap::new(quick(3))
        .start(|| UnavailableBroker, create_adapter::<UnavailableBroker>)
        .await;

    match result {
        Err(Error::Broker(e)) => assert_eq!(e.to_string(), "broker unavailable"),
        other => panic!("unexpected result: {other:?}"),
    }
}

/// Adapter whose initialization never completes.
#[derive(Debug)]
struct StuckAdapter;

#[async_trait]
impl Adapter for StuckAdapter {
    async fn init(&self) -> Result<(), AdapterError> {
        std::future::pending().await
    }

    fn add_socket(&self, _sid: &str, _sink: PacketSink) {}

    fn remove_socket(&self, _sid: &str) {}

    fn add_all(&self, _sid: &str, _rooms: &[String]) {}

    fn del(&self, _sid: &str, _room: &str) {}

    fn rooms(&self, _sid: &str) -> HashSet<String> {
        HashSet::new()
    }

    fn sockets(&self, _rooms: &HashSet<String>) -> HashSet<String> {
        HashSet::new()
    }

    async fn broadcast(&self, _packet: Packet, _opts: BroadcastOptions) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[derive(Debug)]
struct StuckAdapterFactory;

impl AdapterFactory for StuckAdapterFactory {
    fn create(&self, _namespace: &str) -> Arc<dyn Adapter> {
        Arc::new(StuckAdapter)
    }
}

#[tokio::test]
async fn test_stuck_node_times_out() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let options = ClusterOptions {
        timeout: Duration::from_millis(200),
        ..quick(2)
    };

    let result = ClusterBootstrap::new(options)
        .start(move || broker.client(), |_: MemoryBrokerClient| StuckAdapterFactory)
        .await;

    match result {
        Err(Error::Timeout {
            accepted,
            expected,
            elapsed,
        }) => {
            assert_eq!(accepted, 0);
            assert_eq!(expected, 2);
            assert!(elapsed >= Duration::from_millis(200));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

type Log = Arc<Mutex<Vec<&'static str>>>;

#[derive(Clone, Debug)]
struct RecordingBroker {
    inner: MemoryBrokerClient,
    log: Log,
}

#[async_trait]
impl Broker for RecordingBroker {
    type Error = relay_broker_memory::Error;

    async fn connect(&self) -> Result<(), Self::Error> {
        self.inner.connect().await
    }

    async fn quit(&self) -> Result<(), Self::Error> {
        self.log.lock().push("broker");
        self.inner.quit().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), Self::Error> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, Self::Error> {
        self.inner.subscribe(channel).await
    }
}

#[derive(Debug)]
struct RecordingAdapter {
    local: LocalAdapter,
    log: Log,
}

#[async_trait]
impl Adapter for RecordingAdapter {
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
        self.local.broadcast(packet, opts).await
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.log.lock().push("adapter");
        Ok(())
    }
}

#[derive(Debug)]
struct RecordingAdapterFactory {
    log: Log,
}

impl AdapterFactory for RecordingAdapterFactory {
    fn create(&self, namespace: &str) -> Arc<dyn Adapter> {
        Arc::new(RecordingAdapter {
            local: LocalAdapter::new(namespace),
            log: self.log.clone(),
        })
    }
}

#[tokio::test]
async fn test_cleanup_closes_adapters_before_quitting_brokers() {
    let _ = tracing_subscriber::fmt::try_init();

    let log = Log::default();
    let broker = MemoryBroker::new();

    let broker_log = log.clone();
    let adapter_log = log.clone();
    let ctx = ClusterBootstrap::new(quick(3))
        .start(
            move || RecordingBroker {
                inner: broker.client(),
                log: broker_log.clone(),
            },
            move |_: RecordingBroker| RecordingAdapterFactory {
                log: adapter_log.clone(),
            },
        )
        .await
        .unwrap();

    assert!(log.lock().is_empty());

    let servers = ctx.servers.clone();
    let clients = ctx.client_sockets.clone();
    ctx.cleanup.run().await.unwrap();

    assert_eq!(
        *log.lock(),
        vec!["adapter", "adapter", "adapter", "broker", "broker", "broker"]
    );
    assert!(servers.iter().all(relay_realtime::Server::is_closed));
    assert!(clients.iter().all(|client| !client.is_connected()));
}

/// First node gets a working broker adapter, the others never become ready.
#[derive(Debug)]
enum FirstReady {
    Ready(BrokerAdapterFactory<MemoryBrokerClient>),
    Stuck,
}

impl AdapterFactory for FirstReady {
    fn create(&self, namespace: &str) -> Arc<dyn Adapter> {
        match self {
            Self::Ready(factory) => factory.create(namespace),
            Self::Stuck => Arc::new(StuckAdapter),
        }
    }
}

#[tokio::test]
async fn test_timeout_releases_ready_nodes() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let source = broker.clone();
    let issued = Arc::new(Mutex::new(Vec::new()));
    let clients = issued.clone();
    let handed_out = Arc::new(AtomicUsize::new(0));

    let options = ClusterOptions {
        timeout: Duration::from_millis(500),
        ..quick(2)
    };
    let result = ClusterBootstrap::new(options)
        .start(
            move || {
                let client = source.client();
                clients.lock().push(client.clone());
                client
            },
            move |client: MemoryBrokerClient| {
                if handed_out.fetch_add(1, Ordering::SeqCst) == 0 {
                    FirstReady::Ready(create_adapter(client))
                } else {
                    FirstReady::Stuck
                }
            },
        )
        .await;

    assert!(matches!(
        result,
        Err(Error::Timeout {
            accepted: 1,
            expected: 2,
            ..
        })
    ));
    assert_eq!(broker.subscriber_count("relay#/#"), 0);

    // The stuck node never finished, so only its client is left connected.
    let connected = issued.lock().iter().filter(|c| c.is_connected()).count();
    assert_eq!(connected, 1);
}

#[tokio::test]
async fn test_settle_delay_runs_after_quorum() {
    let _ = tracing_subscriber::fmt::try_init();

    let settle_delay = Duration::from_millis(300);
    let started = Instant::now();
    let ctx = setup_with_options(ClusterOptions {
        nodes: 2,
        settle_delay,
        ..ClusterOptions::default()
    })
    .await
    .unwrap();

    assert!(started.elapsed() >= settle_delay);
    assert_eq!(ctx.servers.len(), 2);

    ctx.cleanup.run().await.unwrap();
}
