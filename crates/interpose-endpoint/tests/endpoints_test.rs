//! Endpoint kinds exercised over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use interpose_cert::{CertificateAuthority, CertificateMinter};
use interpose_core::Destination;
use interpose_endpoint::tls::{Verification, VersionRange, build_client_config, build_server_config};
use interpose_endpoint::{
    Endpoint, EndpointTemplate, InterceptListenTemplate, ListenerTemplate, TcpListenTemplate,
    TcpTemplate, TemplateOverrides, TlsListenTemplate, TlsTemplate, TunnelProtocol,
    TunnelTemplate, UdpListenTemplate, UdpTemplate, UnixAddress, UnixListenTemplate,
    UnixTemplate,
};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> Destination {
    Destination::new("127.0.0.1", 0)
}

async fn read_all(ep: &Endpoint, expected: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < expected {
        let frames = tokio::time::timeout(WAIT, ep.read_frames())
            .await
            .expect("read timed out")
            .expect("stream closed early");
        for f in frames {
            out.extend_from_slice(&f);
        }
    }
    out
}

#[tokio::test]
async fn tcp_listener_and_client_exchange_frames() {
    let mut listener = TcpListenTemplate::new(loopback()).bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = Endpoint::from_template(Arc::new(TcpTemplate::new(addr.into())));
    client.init().await.unwrap();
    let server = listener.accept().await.unwrap().handshake.await.unwrap();
    assert!(server.destination.is_none());

    client.write_frame(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(read_all(&server.endpoint, 4).await, b"ping");
    server.endpoint.write_frame(Bytes::from_static(b"pong")).await.unwrap();
    assert_eq!(read_all(&client, 4).await, b"pong");

    client.close().await;
    assert!(server.endpoint.read_frames().await.unwrap_err().is_stream_closed());
}

#[tokio::test]
async fn tcp_clone_with_overrides_connects_elsewhere() {
    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let template = Arc::new(TcpTemplate::new(first.local_addr().unwrap().into()));
    let original = Endpoint::from_template(template);

    let moved = original
        .clone_with(&TemplateOverrides::destination(second.local_addr().unwrap().into()))
        .unwrap();
    moved.init().await.unwrap();
    let (_stream, _) = tokio::time::timeout(WAIT, second.accept()).await.unwrap().unwrap();
}

#[tokio::test]
async fn udp_listener_gives_each_peer_its_own_endpoint() {
    let mut listener = UdpListenTemplate::new(loopback()).bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let a = Endpoint::from_template(Arc::new(UdpTemplate::new(addr.into())));
    a.init().await.unwrap();
    a.write_frame(Bytes::from_static(b"from-a")).await.unwrap();
    let accepted_a = listener.accept().await.unwrap().handshake.await.unwrap();
    assert_eq!(read_all(&accepted_a.endpoint, 6).await, b"from-a");

    let b = Endpoint::from_template(Arc::new(UdpTemplate::new(addr.into())));
    b.init().await.unwrap();
    b.write_frame(Bytes::from_static(b"from-b")).await.unwrap();
    let accepted_b = listener.accept().await.unwrap().handshake.await.unwrap();
    assert_eq!(read_all(&accepted_b.endpoint, 6).await, b"from-b");

    accepted_a.endpoint.write_frame(Bytes::from_static(b"to-a")).await.unwrap();
    assert_eq!(read_all(&a, 4).await, b"to-a");
}

#[tokio::test]
async fn udp_empty_datagram_keeps_endpoint_open() {
    let mut listener = UdpListenTemplate::new(loopback()).bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = Endpoint::from_template(Arc::new(UdpTemplate::new(addr.into())));
    client.init().await.unwrap();
    client.write_frame(Bytes::from_static(b"hello")).await.unwrap();
    let accepted = listener.accept().await.unwrap().handshake.await.unwrap();
    assert_eq!(read_all(&accepted.endpoint, 5).await, b"hello");

    client.write_frame(Bytes::new()).await.unwrap();
    client.write_frame(Bytes::from_static(b"hi")).await.unwrap();
    assert_eq!(read_all(&accepted.endpoint, 2).await, b"hi");
    assert!(!accepted.endpoint.is_closing());
}

#[tokio::test]
async fn unix_listener_removes_socket_file_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.sock");
    let address = UnixAddress::Path(path.clone());

    let template = UnixListenTemplate {
        address: address.clone(),
        codec: Default::default(),
    };
    let mut listener = template.bind().await.unwrap();
    let client = Endpoint::from_template(Arc::new(UnixTemplate {
        address,
        codec: Default::default(),
    }));
    client.init().await.unwrap();
    let server = listener.accept().await.unwrap().handshake.await.unwrap();

    client.write_frame(Bytes::from_static(b"unix")).await.unwrap();
    assert_eq!(read_all(&server.endpoint, 4).await, b"unix");

    drop(listener);
    assert!(!path.exists());
}

#[tokio::test]
async fn tls_listener_with_self_signed_certificate() {
    let server_config = build_server_config(None, VersionRange::default()).unwrap();
    let mut listener = TlsListenTemplate::new(TcpListenTemplate::new(loopback()), Arc::new(server_config))
        .bind()
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let client_config =
        build_client_config(&Verification::Insecure, None, VersionRange::default()).unwrap();
    let mut client_template = TlsTemplate::new(TcpTemplate::new(addr.into()), Arc::new(client_config));
    client_template.sni = Some("localhost".into());
    let client = Endpoint::from_template(Arc::new(client_template));

    let incoming = listener.accept();
    let (connected, accepted) = tokio::join!(client.init(), async {
        incoming.await.unwrap().handshake.await
    });
    connected.unwrap();
    let server = accepted.unwrap();

    client.write_frame(Bytes::from_static(b"secret")).await.unwrap();
    assert_eq!(read_all(&server.endpoint, 6).await, b"secret");
    server.endpoint.write_frame(Bytes::from_static(b"reply")).await.unwrap();
    assert_eq!(read_all(&client, 5).await, b"reply");
}

#[tokio::test]
async fn intercept_listener_serves_minted_certificate() {
    let ca = Arc::new(CertificateAuthority::generate("test CA").unwrap());
    let minter: Arc<dyn CertificateMinter> = ca.clone();
    let mut listener = InterceptListenTemplate::new(TcpListenTemplate::new(loopback()), minter)
        .bind()
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let trusted = ca.cert_pem().to_string();
    let client = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"CONNECT intercepted.test:8443 HTTP/1.1\r\nHost: intercepted.test\r\n\r\n")
            .await
            .unwrap();
        let mut reply = vec![0u8; interpose_proto::http::CONNECT_ESTABLISHED.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, interpose_proto::http::CONNECT_ESTABLISHED);

        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut trusted.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from("intercepted.test").unwrap();
        let mut tls = connector.connect(name, stream).await.unwrap();
        tls.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 2];
        tls.read_exact(&mut buf).await.unwrap();
        buf
    });

    let accepted = tokio::time::timeout(WAIT, async {
        listener.accept().await.unwrap().handshake.await
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(accepted.destination, Some(Destination::new("intercepted.test", 8443)));
    assert_eq!(read_all(&accepted.endpoint, 18).await, b"GET / HTTP/1.1\r\n\r\n");
    accepted.endpoint.write_frame(Bytes::from_static(b"ok")).await.unwrap();
    assert_eq!(&client.await.unwrap(), b"ok");
    assert_eq!(ca.cached(), 1);
}

#[tokio::test]
async fn intercept_handshake_failure_is_isolated() {
    let minter: Arc<dyn CertificateMinter> = Arc::new(CertificateAuthority::generate("ca").unwrap());
    let mut listener = InterceptListenTemplate::new(TcpListenTemplate::new(loopback()), minter)
        .bind()
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let mut bad = TcpStream::connect(addr).await.unwrap();
    bad.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let result = listener.accept().await.unwrap().handshake.await;
    assert!(result.is_err());

    // The listener keeps accepting.
    let _good = TcpStream::connect(addr).await.unwrap();
    assert!(listener.accept().await.is_ok());
}

#[tokio::test]
async fn http_connect_tunnel_keeps_early_bytes() {
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    let mock = tokio::spawn(async move {
        let (mut stream, _) = proxy.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nearly")
            .await
            .unwrap();
        let mut rest = [0u8; 4];
        stream.read_exact(&mut rest).await.unwrap();
        (String::from_utf8(head).unwrap(), rest)
    });

    let template = TunnelTemplate::new(
        TcpTemplate::new(proxy_addr.into()),
        Destination::new("upstream.test", 80),
        TunnelProtocol::HttpConnect {
            user_agent: "interpose-test".into(),
        },
    );
    let ep = Endpoint::from_template(Arc::new(template));
    ep.init().await.unwrap();
    assert_eq!(read_all(&ep, 5).await, b"early");
    ep.write_frame(Bytes::from_static(b"data")).await.unwrap();

    let (head, rest) = mock.await.unwrap();
    assert!(head.starts_with("CONNECT upstream.test:80 HTTP/1.1\r\n"));
    assert!(head.contains("User-Agent: interpose-test\r\n"));
    assert_eq!(&rest, b"data");
}

#[tokio::test]
async fn connect_failure_is_resource_error() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let ep = Endpoint::from_template(Arc::new(TcpTemplate::new(addr.into())));
    let err = ep.init().await.unwrap_err();
    assert_eq!(err.error_type(), interpose_core::ERROR_CONNECT);
}
