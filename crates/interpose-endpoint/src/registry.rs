//! Endpoint registry: configuration name → template constructor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use interpose_cert::CertificateAuthority;
use interpose_core::{Destination, Options, Registry, defaults, parse_options};
use interpose_proto::CodecSpec;
use serde::Deserialize;

use crate::error::EndpointError;
use crate::exec::ExecTemplate;
use crate::intercept::InterceptListenTemplate;
use crate::socket::{
    TcpListenTemplate, TcpTemplate, UdpListenTemplate, UdpTemplate, UnixAddress,
    UnixListenTemplate, UnixTemplate,
};
use crate::standard::{FileTemplate, StdioMode, StdioTemplate};
use crate::template::EndpointKind;
use crate::tls::{
    TlsListenTemplate, TlsTemplate, TlsVersion, Verification, VersionRange, build_client_config,
    build_server_config,
};
use crate::tunnel::{TunnelProtocol, TunnelTemplate, TunnelTls};

/// Builds an endpoint kind from its options and codec.
pub type EndpointConstructor = fn(&Options, CodecSpec) -> Result<EndpointKind, EndpointError>;

// ── Option tables ──

fn default_listen_host() -> String {
    defaults::DEFAULT_LISTEN_HOST.to_string()
}

fn default_server_host() -> String {
    defaults::DEFAULT_SERVER_HOST.to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    defaults::DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_backlog() -> u32 {
    defaults::DEFAULT_CONNECTION_BACKLOG
}

fn default_min_version() -> String {
    defaults::DEFAULT_TLS_MIN_VERSION.to_string()
}

fn default_max_version() -> String {
    defaults::DEFAULT_TLS_MAX_VERSION.to_string()
}

fn default_user_id() -> String {
    defaults::DEFAULT_SOCKS4_USER_ID.to_string()
}

fn default_user_agent() -> String {
    defaults::DEFAULT_HTTP_USER_AGENT.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectOptions {
    #[serde(default = "default_server_host")]
    host: String,
    port: u16,
    #[serde(default)]
    source_port: Option<u16>,
    #[serde(default)]
    transparent: bool,
    #[serde(default = "default_true")]
    nodelay: bool,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_secs: u64,
}

impl ConnectOptions {
    fn tcp(&self, codec: CodecSpec) -> TcpTemplate {
        let mut t = TcpTemplate::new(Destination::new(&self.host, self.port)).with_codec(codec);
        t.source_port = self.source_port;
        t.transparent = self.transparent;
        t.nodelay = self.nodelay;
        t.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        t
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListenOptions {
    #[serde(default = "default_listen_host")]
    host: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    transparent: bool,
    #[serde(default = "default_backlog")]
    backlog: u32,
}

impl ListenOptions {
    fn tcp(&self, codec: CodecSpec) -> TcpListenTemplate {
        let mut t = TcpListenTemplate::new(Destination::new(&self.host, self.port)).with_codec(codec);
        if self.transparent {
            t = t.transparent();
        }
        t.backlog = self.backlog;
        t
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnixOptions {
    path: String,
    #[serde(default, rename = "abstract")]
    is_abstract: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TlsClientOptions {
    #[serde(default = "default_server_host")]
    host: String,
    port: u16,
    #[serde(default)]
    source_port: Option<u16>,
    #[serde(default)]
    transparent: bool,
    #[serde(default)]
    sni: Option<String>,
    /// Check the server certificate against the webpki roots.
    #[serde(default)]
    verify: bool,
    /// Check the server certificate against this bundle instead.
    #[serde(default)]
    ca_file: Option<PathBuf>,
    #[serde(default)]
    cert: Option<PathBuf>,
    #[serde(default)]
    key: Option<PathBuf>,
    #[serde(default = "default_min_version")]
    min_version: String,
    #[serde(default = "default_max_version")]
    max_version: String,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TlsListenOptions {
    #[serde(default = "default_listen_host")]
    host: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    transparent: bool,
    #[serde(default = "default_backlog")]
    backlog: u32,
    #[serde(default)]
    cert: Option<PathBuf>,
    #[serde(default)]
    key: Option<PathBuf>,
    #[serde(default = "default_min_version")]
    min_version: String,
    #[serde(default = "default_max_version")]
    max_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InterceptOptions {
    #[serde(default = "default_listen_host")]
    host: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    transparent: bool,
    #[serde(default = "default_backlog")]
    backlog: u32,
    #[serde(default)]
    ca_cert: Option<PathBuf>,
    #[serde(default)]
    ca_key: Option<PathBuf>,
    #[serde(default = "default_min_version")]
    min_version: String,
    #[serde(default = "default_max_version")]
    max_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TunnelOptions {
    proxy_host: String,
    proxy_port: u16,
    host: String,
    port: u16,
    #[serde(default)]
    source_port: Option<u16>,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_secs: u64,
    // http-connect
    #[serde(default = "default_user_agent")]
    user_agent: String,
    #[serde(default)]
    tls: bool,
    #[serde(default)]
    sni: Option<String>,
    #[serde(default)]
    verify: bool,
    // socks4
    #[serde(default = "default_user_id")]
    user_id: String,
    // socks5
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoOptions {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOptions {
    path: PathBuf,
    #[serde(default)]
    append: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecOptions {
    command: String,
}

fn versions(min: &str, max: &str) -> Result<VersionRange, EndpointError> {
    Ok(VersionRange {
        min: TlsVersion::parse(min)?,
        max: TlsVersion::parse(max)?,
    })
}

/// Both or neither; one without the other is a configuration error.
fn identity<'a>(
    cert: &'a Option<PathBuf>,
    key: &'a Option<PathBuf>,
) -> Result<Option<(&'a std::path::Path, &'a std::path::Path)>, EndpointError> {
    match (cert, key) {
        (Some(c), Some(k)) => Ok(Some((c.as_path(), k.as_path()))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(EndpointError::Config("'cert' given without 'key'".into())),
        (None, Some(_)) => Err(EndpointError::Config("'key' given without 'cert'".into())),
    }
}

// ── Constructors ──

fn tcp(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: ConnectOptions = parse_options("tcp", options)?;
    Ok(EndpointKind::Connect(Arc::new(opts.tcp(codec))))
}

fn tcp_listen(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: ListenOptions = parse_options("tcp-listen", options)?;
    Ok(EndpointKind::Listen(Arc::new(opts.tcp(codec))))
}

fn udp(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: ConnectOptions = parse_options("udp", options)?;
    let mut t = UdpTemplate::new(Destination::new(&opts.host, opts.port));
    t.source_port = opts.source_port;
    t.transparent = opts.transparent;
    t.codec = codec;
    Ok(EndpointKind::Connect(Arc::new(t)))
}

fn udp_listen(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: ListenOptions = parse_options("udp-listen", options)?;
    let mut t = UdpListenTemplate::new(Destination::new(&opts.host, opts.port));
    if opts.transparent {
        t = t.transparent();
    }
    t.codec = codec;
    Ok(EndpointKind::Listen(Arc::new(t)))
}

fn unix(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: UnixOptions = parse_options("unix", options)?;
    Ok(EndpointKind::Connect(Arc::new(UnixTemplate {
        address: UnixAddress::new(opts.path, opts.is_abstract),
        codec,
    })))
}

fn unix_listen(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: UnixOptions = parse_options("unix-listen", options)?;
    Ok(EndpointKind::Listen(Arc::new(UnixListenTemplate {
        address: UnixAddress::new(opts.path, opts.is_abstract),
        codec,
    })))
}

fn tls(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: TlsClientOptions = parse_options("tls", options)?;
    let verification = match (&opts.ca_file, opts.verify) {
        (Some(path), _) => Verification::CaFile(path.clone()),
        (None, true) => Verification::WebPki,
        (None, false) => Verification::Insecure,
    };
    let config = build_client_config(
        &verification,
        identity(&opts.cert, &opts.key)?,
        versions(&opts.min_version, &opts.max_version)?,
    )?;
    let tcp = ConnectOptions {
        host: opts.host,
        port: opts.port,
        source_port: opts.source_port,
        transparent: opts.transparent,
        nodelay: true,
        connect_timeout_secs: opts.connect_timeout_secs,
    }
    .tcp(codec);
    let mut t = TlsTemplate::new(tcp, Arc::new(config));
    t.sni = opts.sni;
    Ok(EndpointKind::Connect(Arc::new(t)))
}

fn tls_listen(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: TlsListenOptions = parse_options("tls-listen", options)?;
    let config = build_server_config(
        identity(&opts.cert, &opts.key)?,
        versions(&opts.min_version, &opts.max_version)?,
    )?;
    let tcp = ListenOptions {
        host: opts.host,
        port: opts.port,
        transparent: opts.transparent,
        backlog: opts.backlog,
    }
    .tcp(codec);
    Ok(EndpointKind::Listen(Arc::new(TlsListenTemplate::new(tcp, Arc::new(config)))))
}

fn https_intercept_listen(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: InterceptOptions = parse_options("https-intercept-listen", options)?;
    let (cert, key) = match (&opts.ca_cert, &opts.ca_key) {
        (Some(c), Some(k)) => (c.clone(), k.clone()),
        (None, None) => CertificateAuthority::default_paths()?,
        _ => {
            return Err(EndpointError::Config(
                "'ca_cert' and 'ca_key' must be given together".into(),
            ));
        }
    };
    let ca = CertificateAuthority::load_or_bootstrap(&cert, &key)?;
    let tcp = ListenOptions {
        host: opts.host,
        port: opts.port,
        transparent: opts.transparent,
        backlog: opts.backlog,
    }
    .tcp(codec);
    let mut t = InterceptListenTemplate::new(tcp, Arc::new(ca));
    t.versions = versions(&opts.min_version, &opts.max_version)?;
    Ok(EndpointKind::Listen(Arc::new(t)))
}

fn tunnel(
    name: &'static str,
    options: &Options,
    codec: CodecSpec,
) -> Result<EndpointKind, EndpointError> {
    let opts: TunnelOptions = parse_options(name, options)?;
    let protocol = match name {
        "socks4" => TunnelProtocol::Socks4 {
            user_id: opts.user_id,
        },
        "socks5" => TunnelProtocol::Socks5 {
            credentials: match (opts.username, opts.password) {
                (Some(u), Some(p)) => Some((u, p)),
                (None, None) => None,
                _ => {
                    return Err(EndpointError::Config(
                        "socks5 needs both 'username' and 'password'".into(),
                    ));
                }
            },
        },
        _ => TunnelProtocol::HttpConnect {
            user_agent: opts.user_agent,
        },
    };
    let proxy = ConnectOptions {
        host: opts.proxy_host,
        port: opts.proxy_port,
        source_port: opts.source_port,
        transparent: false,
        nodelay: true,
        connect_timeout_secs: opts.connect_timeout_secs,
    }
    .tcp(CodecSpec::Passthrough);
    let mut t = TunnelTemplate::new(proxy, Destination::new(opts.host, opts.port), protocol);
    t.codec = codec;
    if opts.tls {
        let verification = if opts.verify {
            Verification::WebPki
        } else {
            Verification::Insecure
        };
        let config = build_client_config(&verification, None, VersionRange::default())?;
        t = t.with_tls(TunnelTls {
            config: Arc::new(config),
            sni: opts.sni,
        });
    }
    Ok(EndpointKind::Connect(Arc::new(t)))
}

fn http_connect(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    tunnel("http-connect", options, codec)
}

fn socks4(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    tunnel("socks4", options, codec)
}

fn socks5(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    tunnel("socks5", options, codec)
}

fn stdio_mode(
    name: &'static str,
    mode: StdioMode,
    options: &Options,
    codec: CodecSpec,
) -> Result<EndpointKind, EndpointError> {
    let _: NoOptions = parse_options(name, options)?;
    Ok(EndpointKind::Connect(Arc::new(StdioTemplate { mode, codec })))
}

fn stdio(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    stdio_mode("stdio", StdioMode::Both, options, codec)
}

fn stdin(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    stdio_mode("stdin", StdioMode::Stdin, options, codec)
}

fn stdout(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    stdio_mode("stdout", StdioMode::Stdout, options, codec)
}

fn devnull(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    stdio_mode("devnull", StdioMode::Null, options, codec)
}

fn file(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: FileOptions = parse_options("file", options)?;
    Ok(EndpointKind::Connect(Arc::new(FileTemplate {
        path: opts.path,
        append: opts.append,
        codec,
    })))
}

fn exec(options: &Options, codec: CodecSpec) -> Result<EndpointKind, EndpointError> {
    let opts: ExecOptions = parse_options("exec", options)?;
    let mut t = ExecTemplate::new(opts.command);
    t.codec = codec;
    Ok(EndpointKind::Connect(Arc::new(t)))
}

/// The built-in endpoint kinds.
pub fn endpoints() -> Registry<EndpointConstructor> {
    let mut reg: Registry<EndpointConstructor> = Registry::new("endpoint");
    reg.register("tcp", "TCP client (host, port, source_port, transparent)", tcp)
        .register("tcp-listen", "TCP server (host, port, transparent)", tcp_listen)
        .register("udp", "UDP client (host, port, source_port, transparent)", udp)
        .register("udp-listen", "UDP server, one endpoint per peer", udp_listen)
        .register("unix", "Unix stream client (path, abstract)", unix)
        .register("unix-listen", "Unix stream server (path, abstract)", unix_listen)
        .register("tls", "TLS client (host, port, sni, verify, ca_file)", tls)
        .register("tls-listen", "TLS server (cert, key; self-signed if absent)", tls_listen)
        .register(
            "https-intercept-listen",
            "HTTP CONNECT server answering TLS with minted certificates",
            https_intercept_listen,
        )
        .register(
            "http-connect",
            "client through an HTTP CONNECT proxy (proxy_host, proxy_port, tls)",
            http_connect,
        )
        .register("socks4", "client through a SOCKS4 proxy", socks4)
        .register("socks5", "client through a SOCKS5 proxy (username, password)", socks5)
        .register("stdio", "read stdin, write stdout", stdio)
        .register("stdin", "read stdin", stdin)
        .register("stdout", "write stdout", stdout)
        .register("devnull", "discard everything", devnull)
        .register("file", "write to a file (path, append)", file)
        .register("exec", "child process stdin/stdout (command)", exec);
    reg
}

/// Resolve `kind` + `options` to a template.
pub fn build_endpoint(
    kind: &str,
    codec: CodecSpec,
    options: &Options,
) -> Result<EndpointKind, EndpointError> {
    let reg = endpoints();
    let ctor = reg.lookup(kind)?;
    ctor(options, codec)
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

    #[test]
    fn test_tcp_connect_template() {
        let kind = build_endpoint(
            "tcp",
            CodecSpec::Passthrough,
            &opts(json!({"host": "10.0.0.5", "port": 9000, "source_port": 4000})),
        )
        .unwrap();
        let t = kind.into_connect().unwrap();
        assert_eq!(t.kind(), "tcp");
        assert_eq!(t.destination(), Some(&Destination::new("10.0.0.5", 9000)));
    }

    #[test]
    fn test_listen_kind_is_not_connect() {
        let kind = build_endpoint("tcp-listen", CodecSpec::Passthrough, &opts(json!({"port": 0})))
            .unwrap();
        assert!(kind.clone().into_connect().is_err());
        assert_eq!(kind.into_listen().unwrap().kind(), "tcp-listen");
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = build_endpoint("tcp", CodecSpec::Passthrough, &opts(json!({"port": 1, "prot": 2})))
            .unwrap_err();
        assert!(matches!(err, EndpointError::Options(_)));
    }

    #[test]
    fn test_unknown_kind_lists_alternatives() {
        let err = build_endpoint("tun", CodecSpec::Passthrough, &Options::new()).unwrap_err();
        let EndpointError::Unknown(unknown) = err else {
            panic!("expected lookup error");
        };
        assert!(unknown.available.contains("tcp-listen"));
    }

    #[test]
    fn test_tls_listen_needs_both_cert_and_key() {
        let err = build_endpoint(
            "tls-listen",
            CodecSpec::Passthrough,
            &opts(json!({"cert": "/tmp/only-cert.pem"})),
        )
        .unwrap_err();
        assert!(matches!(err, EndpointError::Config(_)));
    }

    #[test]
    fn test_socks5_partial_credentials_rejected() {
        let err = build_endpoint(
            "socks5",
            CodecSpec::Passthrough,
            &opts(json!({
                "proxy_host": "127.0.0.1", "proxy_port": 1080,
                "host": "example.com", "port": 80, "username": "u"
            })),
        )
        .unwrap_err();
        assert!(matches!(err, EndpointError::Config(_)));
    }

    #[test]
    fn test_intercept_bootstraps_ca_in_given_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("ca.pem");
        let key = dir.path().join("ca-key.pem");
        let kind = build_endpoint(
            "https-intercept-listen",
            CodecSpec::Passthrough,
            &opts(json!({"port": 0, "ca_cert": cert, "ca_key": key})),
        )
        .unwrap();
        assert_eq!(kind.kind(), "https-intercept-listen");
        assert!(cert.exists() && key.exists());
    }

    #[test]
    fn test_every_kind_is_listed() {
        let names: Vec<_> = endpoints().names().collect();
        for kind in ["tcp", "udp-listen", "unix", "tls", "socks4", "exec", "file", "devnull"] {
            assert!(names.contains(&kind), "{kind} missing");
        }
    }
}
