//! Relays driven end to end over in-memory pipes and loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use interpose_core::{Destination, Options};
use interpose_endpoint::{Endpoint, ListenerTemplate, MemoryTemplate, TcpListenTemplate, TcpTemplate};
use interpose_module::{ChainFactory, build_chain};
use interpose_relay::{FixedPeer, MultiClientRelay, Relay};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn options(value: serde_json::Value) -> Options {
    value.as_object().cloned().unwrap_or_default()
}

/// Echo server that answers each connection until it closes.
async fn echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn zero_rate_corruption_is_an_identity_relay() {
    let (first, mut first_far) = MemoryTemplate::pair("first");
    let (second, mut second_far) = MemoryTemplate::pair("second");
    let corrupt = options(serde_json::json!({"rate": 0.0, "seed": 11}));
    let modules = build_chain([("corrupt", &corrupt)]).unwrap();
    let relay = Relay::new(
        Endpoint::from_template(Arc::new(first)),
        Endpoint::from_template(Arc::new(second)),
        modules,
    );
    let running = tokio::spawn(relay.run(CancellationToken::new()));

    let request: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    first_far.write_all(&request).await.unwrap();
    let mut received = vec![0u8; request.len()];
    second_far.read_exact(&mut received).await.unwrap();
    assert_eq!(received, request);

    let response = b"\x00\x01\x02 response \xff".to_vec();
    second_far.write_all(&response).await.unwrap();
    let mut received = vec![0u8; response.len()];
    first_far.read_exact(&mut received).await.unwrap();
    assert_eq!(received, response);

    drop(first_far);
    let summary = tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.a_to_b.bytes, 4096);
    assert_eq!(summary.b_to_a.bytes, response.len() as u64);

    let mut rest = Vec::new();
    second_far.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn relay_reports_unreachable_peer() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let (first, _far) = MemoryTemplate::pair("first");
    let first = Endpoint::from_template(Arc::new(first));
    let second = Endpoint::from_template(Arc::new(TcpTemplate::new(addr.into())));
    let err = Relay::new(first, second, ChainFactory::default())
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), interpose_core::ERROR_CONNECT);
}

#[tokio::test]
async fn closing_one_pair_leaves_the_others_running() {
    let upstream = echo_server().await;
    let template = TcpListenTemplate::new(Destination::new("127.0.0.1", 0));
    let listener = template.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let relay = MultiClientRelay::new(
        Arc::new(template),
        Arc::new(FixedPeer(Arc::new(TcpTemplate::new(upstream.into())))),
        ChainFactory::default(),
    );
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn({
        let relay = relay.clone();
        let shutdown = shutdown.clone();
        async move { relay.serve(listener, shutdown).await }
    });

    let mut one = TcpStream::connect(addr).await.unwrap();
    let mut two = TcpStream::connect(addr).await.unwrap();
    echo(&mut one, b"first client").await;
    echo(&mut two, b"second client").await;
    assert_eq!(relay.active_count(), 2);

    drop(one);
    wait_for(|| relay.active_count() == 1).await;
    echo(&mut two, b"still here").await;

    // New connections are still accepted.
    let mut three = TcpStream::connect(addr).await.unwrap();
    echo(&mut three, b"third client").await;

    shutdown.cancel();
    tokio::time::timeout(WAIT, serving).await.unwrap().unwrap().unwrap();
    assert_eq!(relay.active_count(), 0);
    let mut buf = [0u8; 1];
    assert_eq!(two.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn peer_failure_only_drops_that_connection() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = unused.local_addr().unwrap();
    drop(unused);

    let template = TcpListenTemplate::new(Destination::new("127.0.0.1", 0));
    let listener = template.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = MultiClientRelay::new(
        Arc::new(template),
        Arc::new(FixedPeer(Arc::new(TcpTemplate::new(dead.into())))),
        ChainFactory::default(),
    );
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn({
        let relay = relay.clone();
        let shutdown = shutdown.clone();
        async move { relay.serve(listener, shutdown).await }
    });

    for _ in 0..2 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(WAIT, client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
    assert_eq!(relay.active_count(), 0);
    assert!(!serving.is_finished());

    shutdown.cancel();
    tokio::time::timeout(WAIT, serving).await.unwrap().unwrap().unwrap();
}
