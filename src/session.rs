//! Turning a validated configuration into something that runs.

use std::sync::Arc;

use interpose_config::{Config, EndpointSpec, ProxySpec, RelaySpec, SessionConfig, resolve_codec};
use interpose_endpoint::{Endpoint, EndpointError, EndpointKind, EndpointTemplate, ListenerTemplate, build_endpoint};
use interpose_module::{ChainFactory, ModuleError, build_chain};
use interpose_proto::CodecError;
use interpose_proxy::{Proxy, ProxyError, build_proxy};
use interpose_relay::{FixedPeer, MultiClientRelay, Relay, RelayError};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("endpoint: {0}")]
    Endpoint(#[from] EndpointError),
    #[error("module: {0}")]
    Module(#[from] ModuleError),
    #[error("relay: {0}")]
    Relay(#[from] RelayError),
    #[error("proxy: {0}")]
    Proxy(#[from] ProxyError),
}

impl SessionError {
    pub fn error_type(&self) -> &'static str {
        match self {
            SessionError::Endpoint(e) => e.error_type(),
            SessionError::Relay(e) => e.error_type(),
            SessionError::Proxy(e) => e.error_type(),
            SessionError::Module(e) => e.error_type(),
            SessionError::Codec(_) => interpose_core::ERROR_CONFIG,
        }
    }
}

/// A session ready to run.
#[derive(Debug)]
pub enum Session {
    /// Two endpoints forwarded as one pair.
    Pair(Relay),
    /// Serve the first client of a listener, then stop.
    Single {
        listener: Arc<dyn ListenerTemplate>,
        peer: Arc<dyn EndpointTemplate>,
        modules: ChainFactory,
    },
    /// Serve every client of a listener.
    Multi(MultiClientRelay),
    Proxy(Proxy),
}

/// Resolve every name in `config` and build the session. Nothing is bound
/// or connected yet.
pub fn build_session(config: &Config) -> Result<Session, SessionError> {
    let modules = build_chain(
        config
            .modules
            .iter()
            .map(|m| (m.name.as_str(), &m.options)),
    )?;
    match &config.session {
        SessionConfig::Relay(relay) => build_relay(relay, modules),
        SessionConfig::Proxy(proxy) => build_proxy_session(proxy, modules),
    }
}

fn endpoint(spec: &EndpointSpec) -> Result<EndpointKind, SessionError> {
    let codec = resolve_codec(spec.codec.as_ref())?;
    Ok(build_endpoint(&spec.kind, codec, &spec.options)?)
}

fn build_relay(relay: &RelaySpec, modules: ChainFactory) -> Result<Session, SessionError> {
    let peer = endpoint(&relay.second)?.into_connect()?;
    match endpoint(&relay.first)? {
        EndpointKind::Listen(listener) if relay.multi => Ok(Session::Multi(
            MultiClientRelay::new(listener, Arc::new(FixedPeer(peer)), modules),
        )),
        EndpointKind::Listen(listener) => Ok(Session::Single {
            listener,
            peer,
            modules,
        }),
        EndpointKind::Connect(first) => Ok(Session::Pair(Relay::new(
            Endpoint::from_template(first),
            Endpoint::from_template(peer),
            modules,
        ))),
    }
}

fn build_proxy_session(proxy: &ProxySpec, modules: ChainFactory) -> Result<Session, SessionError> {
    let codec = resolve_codec(proxy.codec.as_ref())?;
    Ok(Session::Proxy(build_proxy(
        &proxy.kind,
        &proxy.options,
        codec,
        modules,
    )?))
}

impl Session {
    pub fn describe(&self) -> &'static str {
        match self {
            Session::Pair(_) => "relay",
            Session::Single { .. } => "single-client relay",
            Session::Multi(_) => "multi-client relay",
            Session::Proxy(proxy) => proxy.kind(),
        }
    }

    /// Run until the session ends on its own or `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SessionError> {
        match self {
            Session::Pair(relay) => {
                let summary = relay.run(shutdown).await?;
                info!(?summary, "relay finished");
            }
            Session::Single {
                listener,
                peer,
                modules,
            } => {
                let mut bound = listener.bind().await?;
                info!(listener = %listener.describe(), addr = ?bound.local_addr(), "waiting for a client");
                let incoming = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Ok(()),
                    incoming = bound.accept() => incoming?,
                };
                drop(bound);
                interpose_metrics::record_connection_accepted();
                let accepted = incoming.handshake.await?;
                let relay = Relay::new(accepted.endpoint, Endpoint::from_template(peer), modules);
                let summary = relay.run(shutdown).await?;
                info!(?summary, "relay finished");
            }
            Session::Multi(relay) => relay.run(shutdown).await?,
            Session::Proxy(proxy) => proxy.run(shutdown).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn connecting_first_endpoint_builds_a_pair() {
        let session = build_session(&config(
            r#"
            [session]
            mode = "relay"
            first = { kind = "devnull" }
            second = { kind = "tcp", port = 9 }
            "#,
        ))
        .unwrap();
        assert!(matches!(session, Session::Pair(_)));
    }

    #[test]
    fn listening_first_endpoint_honours_multi() {
        let single = build_session(&config(
            r#"
            [session]
            mode = "relay"
            first = { kind = "tcp-listen", port = 0 }
            second = { kind = "tcp", port = 9 }
            "#,
        ))
        .unwrap();
        assert_eq!(single.describe(), "single-client relay");

        let multi = build_session(&config(
            r#"
            [session]
            mode = "relay"
            multi = true
            first = { kind = "tcp-listen", port = 0 }
            second = { kind = "tcp", port = 9 }
            "#,
        ))
        .unwrap();
        assert_eq!(multi.describe(), "multi-client relay");
    }

    #[test]
    fn listening_second_endpoint_is_rejected() {
        let err = build_session(&config(
            r#"
            [session]
            mode = "relay"
            first = { kind = "tcp", port = 9 }
            second = { kind = "tcp-listen", port = 0 }
            "#,
        ))
        .unwrap_err();
        assert!(matches!(err, SessionError::Endpoint(EndpointError::Config(_))));
    }

    #[test]
    fn proxy_mode_builds_the_named_proxy() {
        let session = build_session(&config(
            r#"
            [[modules]]
            name = "corrupt"
            options = { count = 1, seed = 1 }

            [session]
            mode = "proxy"
            kind = "udp"
            port = 0
            "#,
        ))
        .unwrap();
        assert_eq!(session.describe(), "udp");
    }

    #[tokio::test]
    async fn configured_pair_relays_between_two_servers() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        let client = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_port = client.local_addr().unwrap().port();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            format!(
                r#"
                [session]
                mode = "relay"
                first = {{ kind = "tcp", host = "127.0.0.1", port = {client_port} }}
                second = {{ kind = "tcp", host = "127.0.0.1", port = {echo_port} }}
                "#
            ),
        )
        .unwrap();
        let config = interpose_config::load_config(&path).unwrap();
        interpose_config::validate_config(&config).unwrap();
        let session = build_session(&config).unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(session.run(shutdown.clone()));

        let (mut stream, _) = client.accept().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(stream);
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
