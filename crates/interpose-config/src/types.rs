//! Configuration sections.

use std::collections::HashMap;

use interpose_core::Options;
use interpose_proto::{CodecError, CodecSpec, build_codec};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: Option<String>,
    /// Log format: json, pretty, or compact. Default: pretty.
    pub format: Option<String>,
    /// Output target: stdout or stderr. Default: stderr.
    pub output: Option<String>,
    /// Per-module log level filters (e.g., {"interpose_relay": "debug", "rustls": "warn"}).
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus exporter listen address, e.g. 127.0.0.1:9100.
    pub listen: Option<String>,
}

/// One entry of the ordered module chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub name: String,
    #[serde(default)]
    pub options: Options,
}

/// A codec given either by name or as `{ name, options }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodecRef {
    Name(String),
    Table {
        name: String,
        #[serde(default)]
        options: Options,
    },
}

impl CodecRef {
    pub fn name(&self) -> &str {
        match self {
            CodecRef::Name(name) | CodecRef::Table { name, .. } => name,
        }
    }

    pub fn build(&self) -> Result<CodecSpec, CodecError> {
        match self {
            CodecRef::Name(name) => build_codec(name, &Options::new()),
            CodecRef::Table { name, options } => build_codec(name, options),
        }
    }
}

/// Resolve an optional codec reference; none means passthrough.
pub fn resolve_codec(codec: Option<&CodecRef>) -> Result<CodecSpec, CodecError> {
    codec.map_or(Ok(CodecSpec::Passthrough), CodecRef::build)
}

/// An endpoint: its registry `kind`, an optional codec, and the kind's own
/// options as the remaining keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub kind: String,
    #[serde(default)]
    pub codec: Option<CodecRef>,
    #[serde(flatten)]
    pub options: Options,
}

/// A proxy: its registry `kind`, an optional codec for both sides, and the
/// kind's own options as the remaining keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySpec {
    pub kind: String,
    #[serde(default)]
    pub codec: Option<CodecRef>,
    #[serde(flatten)]
    pub options: Options,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySpec {
    pub first: EndpointSpec,
    pub second: EndpointSpec,
    /// Keep accepting clients on a listening `first` endpoint instead of
    /// serving a single one.
    #[serde(default)]
    pub multi: bool,
}

/// What the process runs, selected by `mode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SessionConfig {
    Relay(RelaySpec),
    Proxy(ProxySpec),
}

impl SessionConfig {
    pub fn mode(&self) -> &'static str {
        match self {
            SessionConfig::Relay(_) => "relay",
            SessionConfig::Proxy(_) => "proxy",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_by_name_or_table() {
        #[derive(Deserialize)]
        struct Holder {
            codec: CodecRef,
        }
        let by_name: Holder = toml::from_str(r#"codec = "length""#).unwrap();
        assert_eq!(by_name.codec.name(), "length");

        let table: Holder = toml::from_str(
            r#"
            [codec]
            name = "length"
            options = { prefix_size = 4 }
            "#,
        )
        .unwrap();
        assert_eq!(table.codec.name(), "length");
        assert_ne!(table.codec.build().unwrap(), by_name.codec.build().unwrap());
    }

    #[test]
    fn missing_codec_is_passthrough() {
        assert_eq!(resolve_codec(None).unwrap(), CodecSpec::Passthrough);
    }

    #[test]
    fn endpoint_keeps_extra_keys_as_options() {
        let spec: EndpointSpec = toml::from_str(
            r#"
            kind = "tcp"
            host = "10.0.0.5"
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(spec.kind, "tcp");
        assert!(spec.codec.is_none());
        assert_eq!(spec.options.len(), 2);
        assert_eq!(spec.options["port"], 9000);
        assert!(!spec.options.contains_key("kind"));
    }

    #[test]
    fn session_mode_selects_variant() {
        let relay: SessionConfig = toml::from_str(
            r#"
            mode = "relay"
            first = { kind = "stdio" }
            second = { kind = "tcp", port = 22 }
            "#,
        )
        .unwrap();
        let SessionConfig::Relay(relay) = relay else {
            panic!("expected relay");
        };
        assert!(!relay.multi);
        assert_eq!(relay.second.kind, "tcp");

        let proxy: SessionConfig = toml::from_str(
            r#"
            mode = "proxy"
            kind = "tcp"
            port = 8443
            "#,
        )
        .unwrap();
        let SessionConfig::Proxy(proxy) = proxy else {
            panic!("expected proxy");
        };
        assert_eq!(proxy.kind, "tcp");
        assert!(!proxy.options.contains_key("mode"));
        assert_eq!(proxy.options["port"], 8443);
    }
}
