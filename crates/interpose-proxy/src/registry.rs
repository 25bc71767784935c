//! Proxy registry: configuration name → proxy constructor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use interpose_cert::CertificateAuthority;
use interpose_core::{Destination, Options, Registry, defaults, parse_options};
use interpose_endpoint::tls::{build_client_config, build_server_config};
use interpose_endpoint::{
    EndpointTemplate, InterceptListenTemplate, TcpListenTemplate, TcpTemplate,
    TlsListenTemplate, TlsTemplate, TlsVersion, UdpListenTemplate, UdpTemplate, UnixAddress,
    UnixListenTemplate, UnixTemplate, Verification, VersionRange,
};
use interpose_module::ChainFactory;
use interpose_net::{BridgeOptions, Protocol, TproxyOptions, bridge_configurator, tproxy_configurator};
use interpose_proto::CodecSpec;
use interpose_relay::FixedPeer;
use serde::Deserialize;

use crate::error::ProxyError;
use crate::layer4::{Layer4Policy, SourcePort, Target};
use crate::network::NetworkSetup;
use crate::proxy::Proxy;

/// Builds a proxy from its options, the codec both sides speak and the
/// module chain applied to every pair.
pub type ProxyConstructor = fn(&Options, CodecSpec, ChainFactory) -> Result<Proxy, ProxyError>;

// ── Option tables ──

fn default_listen_host() -> String {
    defaults::DEFAULT_LISTEN_HOST.to_string()
}

fn default_listen_port() -> u16 {
    defaults::DEFAULT_LISTEN_PORT
}

fn default_server_host() -> String {
    defaults::DEFAULT_SERVER_HOST.to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_version() -> String {
    defaults::DEFAULT_TLS_MIN_VERSION.to_string()
}

fn default_max_version() -> String {
    defaults::DEFAULT_TLS_MAX_VERSION.to_string()
}

/// Listening side, upstream and interception settings shared by the
/// socket-based proxies.
#[derive(Debug, Clone, Deserialize)]
pub struct Layer4Options {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    #[serde(default = "default_server_host")]
    pub server_host: String,
    /// Defaults to the listening port.
    #[serde(default)]
    pub server_port: Option<u16>,
    #[serde(default)]
    pub source_port: Option<u16>,
    /// Connect upstream from the client's own source port.
    #[serde(default)]
    pub mirror: bool,
    /// Accept intercepted traffic and connect to its original destination.
    #[serde(default)]
    pub transparent: bool,
    /// Install the TPROXY rules for the duration of the run.
    #[serde(default = "default_true")]
    pub netfilter: bool,
    #[serde(default)]
    pub tproxy: TproxyOptions,
    /// Bridge the client and server interfaces for the duration of the run.
    #[serde(default)]
    pub bridge: Option<BridgeOptions>,
    /// Keep going when a network command fails.
    #[serde(default)]
    pub force: bool,
}

impl Layer4Options {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.mirror && self.source_port.is_some() {
            return Err(ProxyError::Config(
                "'mirror' and 'source_port' are mutually exclusive".into(),
            ));
        }
        if self.bridge.is_some() && !self.transparent {
            return Err(ProxyError::Config("'bridge' requires 'transparent'".into()));
        }
        Ok(())
    }

    fn bind(&self) -> Destination {
        Destination::new(&self.host, self.port)
    }

    fn upstream(&self) -> Destination {
        Destination::new(&self.server_host, self.server_port.unwrap_or(self.port))
    }

    fn tcp_listener(&self, codec: CodecSpec) -> TcpListenTemplate {
        let t = TcpListenTemplate::new(self.bind()).with_codec(codec);
        if self.transparent { t.transparent() } else { t }
    }

    fn tcp_upstream(&self, codec: CodecSpec) -> TcpTemplate {
        let mut t = TcpTemplate::new(self.upstream()).with_codec(codec);
        t.transparent = self.transparent;
        t
    }

    fn policy(&self, base: Arc<dyn EndpointTemplate>) -> Layer4Policy {
        let target = if self.transparent {
            Target::Transparent
        } else {
            Target::Static
        };
        let source = match (self.mirror, self.source_port) {
            (true, _) => SourcePort::Mirror,
            (false, Some(port)) => SourcePort::Fixed(port),
            (false, None) => SourcePort::Ephemeral,
        };
        Layer4Policy::new(base).with_target(target).with_source(source)
    }

    /// Bridge first, TPROXY rules second; reverted the other way round.
    pub fn network(&self, protocol: Protocol) -> NetworkSetup {
        let mut setup = NetworkSetup::new().force(self.force);
        if !self.transparent {
            return setup;
        }
        if let Some(bridge) = &self.bridge {
            setup.push(bridge_configurator(bridge));
        }
        if self.netfilter {
            setup.push(tproxy_configurator(self.port, protocol, &self.tproxy));
        }
        setup
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsProxyOptions {
    #[serde(flatten)]
    pub net: Layer4Options,
    /// Listener identity; a self-signed certificate when absent.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Identity presented to the server.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default = "default_min_version")]
    pub min_version: String,
    #[serde(default = "default_max_version")]
    pub max_version: String,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub sni: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpsProxyOptions {
    #[serde(flatten)]
    pub net: Layer4Options,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub ca_key: Option<PathBuf>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default = "default_min_version")]
    pub min_version: String,
    #[serde(default = "default_max_version")]
    pub max_version: String,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnixProxyOptions {
    path: String,
    #[serde(default, rename = "abstract")]
    is_abstract: bool,
    server_path: String,
    #[serde(default)]
    server_abstract: bool,
}

fn versions(min: &str, max: &str) -> Result<VersionRange, ProxyError> {
    Ok(VersionRange {
        min: TlsVersion::parse(min)?,
        max: TlsVersion::parse(max)?,
    })
}

fn verification(verify: bool, ca_file: &Option<PathBuf>) -> Verification {
    match (ca_file, verify) {
        (Some(path), _) => Verification::CaFile(path.clone()),
        (None, true) => Verification::WebPki,
        (None, false) => Verification::Insecure,
    }
}

fn identity<'a>(
    what: &str,
    cert: &'a Option<PathBuf>,
    key: &'a Option<PathBuf>,
) -> Result<Option<(&'a Path, &'a Path)>, ProxyError> {
    match (cert, key) {
        (Some(c), Some(k)) => Ok(Some((c.as_path(), k.as_path()))),
        (None, None) => Ok(None),
        _ => Err(ProxyError::Config(format!(
            "{what} certificate and key must be given together"
        ))),
    }
}

// ── Constructors ──

fn layer4(name: &str, options: &Options) -> Result<Layer4Options, ProxyError> {
    let opts: Layer4Options = parse_options(name, options)?;
    opts.validate()?;
    Ok(opts)
}

fn tcp(options: &Options, codec: CodecSpec, modules: ChainFactory) -> Result<Proxy, ProxyError> {
    let opts = layer4("tcp", options)?;
    let listener = Arc::new(opts.tcp_listener(codec));
    let policy = opts.policy(Arc::new(opts.tcp_upstream(codec)));
    Ok(Proxy::new("tcp", listener, Arc::new(policy), modules).with_network(opts.network(Protocol::Tcp)))
}

fn udp(options: &Options, codec: CodecSpec, modules: ChainFactory) -> Result<Proxy, ProxyError> {
    let opts = layer4("udp", options)?;
    let mut listener = UdpListenTemplate::new(opts.bind());
    listener.codec = codec;
    if opts.transparent {
        listener = listener.transparent();
    }
    let mut upstream = UdpTemplate::new(opts.upstream());
    upstream.codec = codec;
    upstream.transparent = opts.transparent;
    let policy = opts.policy(Arc::new(upstream));
    Ok(Proxy::new("udp", Arc::new(listener), Arc::new(policy), modules)
        .with_network(opts.network(Protocol::Udp)))
}

fn unix(options: &Options, codec: CodecSpec, modules: ChainFactory) -> Result<Proxy, ProxyError> {
    let opts: UnixProxyOptions = parse_options("unix", options)?;
    let listener = UnixListenTemplate {
        address: UnixAddress::new(opts.path, opts.is_abstract),
        codec,
    };
    let upstream = UnixTemplate {
        address: UnixAddress::new(opts.server_path, opts.server_abstract),
        codec,
    };
    Ok(Proxy::new(
        "unix",
        Arc::new(listener),
        Arc::new(FixedPeer(Arc::new(upstream))),
        modules,
    ))
}

fn tls(options: &Options, codec: CodecSpec, modules: ChainFactory) -> Result<Proxy, ProxyError> {
    let opts: TlsProxyOptions = parse_options("tls", options)?;
    opts.net.validate()?;
    let versions = versions(&opts.min_version, &opts.max_version)?;
    let server = build_server_config(identity("listener", &opts.cert, &opts.key)?, versions)?;
    let client = build_client_config(
        &verification(opts.verify, &opts.ca_file),
        identity("client", &opts.client_cert, &opts.client_key)?,
        versions,
    )?;

    let listener = TlsListenTemplate::new(opts.net.tcp_listener(codec), Arc::new(server));
    let mut upstream = TlsTemplate::new(opts.net.tcp_upstream(codec), Arc::new(client));
    upstream.sni = opts.sni.clone();
    let policy = opts.net.policy(Arc::new(upstream));
    Ok(Proxy::new("tls", Arc::new(listener), Arc::new(policy), modules)
        .with_network(opts.net.network(Protocol::Tcp)))
}

fn https(options: &Options, codec: CodecSpec, modules: ChainFactory) -> Result<Proxy, ProxyError> {
    let opts: HttpsProxyOptions = parse_options("https", options)?;
    opts.net.validate()?;
    let versions = versions(&opts.min_version, &opts.max_version)?;
    let (ca_cert, ca_key) = match (&opts.ca_cert, &opts.ca_key) {
        (Some(c), Some(k)) => (c.clone(), k.clone()),
        (None, None) => CertificateAuthority::default_paths()?,
        _ => {
            return Err(ProxyError::Config(
                "'ca_cert' and 'ca_key' must be given together".into(),
            ));
        }
    };
    let ca = CertificateAuthority::load_or_bootstrap(&ca_cert, &ca_key)?;
    let client = build_client_config(
        &verification(opts.verify, &opts.ca_file),
        identity("client", &opts.client_cert, &opts.client_key)?,
        versions,
    )?;

    let mut listener = InterceptListenTemplate::new(opts.net.tcp_listener(codec), Arc::new(ca));
    listener.versions = versions;
    let upstream = TlsTemplate::new(opts.net.tcp_upstream(codec), Arc::new(client));
    // Every intercepted connection names its own upstream in CONNECT.
    let policy = opts
        .net
        .policy(Arc::new(upstream))
        .with_target(Target::Transparent);
    Ok(Proxy::new("https", Arc::new(listener), Arc::new(policy), modules)
        .with_network(opts.net.network(Protocol::Tcp)))
}

/// The built-in proxy kinds.
pub fn proxies() -> Registry<ProxyConstructor> {
    let mut reg: Registry<ProxyConstructor> = Registry::new("proxy");
    reg.register(
        "tcp",
        "TCP proxy (host, port, server_host, server_port, mirror, transparent)",
        tcp,
    )
    .register("udp", "UDP proxy, one pair per client address", udp)
    .register("unix", "Unix stream proxy (path, server_path)", unix)
    .register("tls", "TLS-terminating proxy (cert, key, verify, sni)", tls)
    .register(
        "https",
        "HTTP CONNECT proxy intercepting TLS with minted certificates (ca_cert, ca_key)",
        https,
    );
    reg
}

/// Resolve `kind` + `options` to a proxy.
pub fn build_proxy(
    kind: &str,
    options: &Options,
    codec: CodecSpec,
    modules: ChainFactory,
) -> Result<Proxy, ProxyError> {
    let reg = proxies();
    let ctor = reg.lookup(kind)?;
    ctor(options, codec, modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(value: serde_json::Value) -> Options {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn build(kind: &str, value: serde_json::Value) -> Result<Proxy, ProxyError> {
        build_proxy(kind, &opts(value), CodecSpec::Passthrough, ChainFactory::default())
    }

    #[test]
    fn test_registry_lists_proxy_kinds() {
        assert_eq!(proxies().names().collect::<Vec<_>>(), ["https", "tcp", "tls", "udp", "unix"]);
    }

    #[test]
    fn test_unknown_proxy_kind() {
        let err = build("quic", json!({})).unwrap_err();
        assert!(matches!(err, ProxyError::Unknown(_)));
    }

    #[test]
    fn test_defaults_need_no_network_setup() {
        let proxy = build("tcp", json!({})).unwrap();
        assert_eq!(proxy.kind(), "tcp");
        assert!(proxy.network().is_empty());
    }

    #[test]
    fn test_server_port_defaults_to_listen_port() {
        let l4: Layer4Options = parse_options("tcp", &opts(json!({"port": 9443}))).unwrap();
        assert_eq!(l4.upstream(), Destination::new("127.0.0.1", 9443));
    }

    #[test]
    fn test_mirror_conflicts_with_source_port() {
        let err = build("tcp", json!({"mirror": true, "source_port": 4000})).unwrap_err();
        assert_eq!(err.error_type(), interpose_core::ERROR_CONFIG);
    }

    #[test]
    fn test_bridge_requires_transparent() {
        assert!(build("udp", json!({"bridge": {}})).is_err());
    }

    #[test]
    fn test_transparent_network_setup() {
        let bridged: Layer4Options = parse_options(
            "tcp",
            &opts(json!({"transparent": true, "bridge": {"bridge": "br9"}})),
        )
        .unwrap();
        assert_eq!(bridged.network(Protocol::Tcp).names().len(), 2);

        let manual: Layer4Options = parse_options(
            "tcp",
            &opts(json!({"transparent": true, "netfilter": false})),
        )
        .unwrap();
        assert!(manual.network(Protocol::Tcp).is_empty());
    }

    #[test]
    fn test_tls_identity_must_be_complete() {
        let err = build("tls", json!({"cert": "/tmp/only-cert.pem"})).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn test_tls_self_signed_listener() {
        let proxy = build("tls", json!({"port": 0, "min_version": "tls13"})).unwrap();
        assert_eq!(proxy.kind(), "tls");
    }

    #[test]
    fn test_https_bootstraps_ca() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("ca.pem");
        let key = dir.path().join("ca-key.pem");
        build(
            "https",
            json!({"port": 0, "ca_cert": cert.clone(), "ca_key": key.clone()}),
        )
        .unwrap();
        assert!(cert.exists() && key.exists());
    }

    #[test]
    fn test_https_rejects_half_ca() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("ca.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        let err = build(
            "https",
            json!({"ca_cert": cert, "ca_key": dir.path().join("missing.pem")}),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Cert(_)));
    }
}
