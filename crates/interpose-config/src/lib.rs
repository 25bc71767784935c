//! Configuration loading, validation and CLI overrides.
//!
//! A configuration file names a session to run plus the ambient settings
//! around it:
//!
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [[modules]]
//! name = "logger"
//!
//! [session]
//! mode = "relay"
//! first = { kind = "tcp-listen", port = 9000 }
//! second = { kind = "tcp", host = "example.com", port = 80 }
//! ```
//!
//! Endpoint, codec, module and proxy names are resolved through the static
//! registries of the crates that implement them.

mod cli;
mod defaults;
mod loader;
mod types;
mod validate;

use serde::{Deserialize, Serialize};

pub use cli::{CliOverrides, apply_overrides};
pub use loader::{ConfigError, load_config};
pub use types::{
    CodecRef, EndpointSpec, LoggingConfig, MetricsConfig, ModuleSpec, ProxySpec, RelaySpec,
    SessionConfig, resolve_codec,
};
pub use validate::validate_config;

use crate::defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Ordered module chain applied to every forwarded pair.
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    /// How long active pairs get to wind down after a stop signal.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    pub session: SessionConfig,
}

impl Config {
    /// The configured log level, or the default.
    pub fn log_level(&self) -> String {
        self.logging.level.clone().unwrap_or_else(default_log_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RELAY: &str = r#"
        [logging]
        level = "debug"
        filters = { rustls = "warn" }

        [[modules]]
        name = "corrupt"
        options = { rate = 0.5, seed = 7 }

        [[modules]]
        name = "logger"

        [session]
        mode = "relay"
        multi = true
        first = { kind = "tcp-listen", port = 9000 }
        second = { kind = "tcp", host = "10.0.0.5", port = 80, codec = "length" }
    "#;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    fn proxy(body: &str) -> Config {
        parse(&format!("[session]\nmode = \"proxy\"\n{body}"))
    }

    fn validation_message(config: &Config) -> String {
        match validate_config(config) {
            Err(ConfigError::Validation(msg)) => msg,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn relay_config_parses_and_validates() {
        let config = parse(RELAY);
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.logging.filters["rustls"], "warn");
        assert_eq!(config.shutdown_timeout_secs, 5);
        let names: Vec<_> = config.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["corrupt", "logger"]);
        assert_eq!(config.session.mode(), "relay");
        validate_config(&config).unwrap();
    }

    #[test]
    fn defaults_apply_without_ambient_sections() {
        let config = proxy("kind = \"tcp\"");
        assert_eq!(config.log_level(), "info");
        assert!(config.metrics.listen.is_none());
        assert!(config.modules.is_empty());
        validate_config(&config).unwrap();
    }

    #[test]
    fn unknown_names_are_rejected() {
        let mut config = parse(RELAY);
        config.modules[0].name = "eval".into();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Unknown(e)) if e.kind == "module"
        ));

        let config = proxy("kind = \"socks\"");
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Unknown(e)) if e.kind == "proxy"
        ));

        let mut config = parse(RELAY);
        let SessionConfig::Relay(relay) = &mut config.session else {
            unreachable!()
        };
        relay.second.codec = Some(CodecRef::Name("base64".into()));
        assert!(matches!(validate_config(&config), Err(ConfigError::Codec(_))));
    }

    #[test]
    fn relay_shape_is_checked() {
        let mut config = parse(RELAY);
        let SessionConfig::Relay(relay) = &mut config.session else {
            unreachable!()
        };
        relay.first.kind = "tcp".into();
        assert!(validation_message(&config).contains("multi"));

        let SessionConfig::Relay(relay) = &mut config.session else {
            unreachable!()
        };
        relay.multi = false;
        relay.second.kind = "udp-listen".into();
        assert!(validation_message(&config).contains("connecting"));
    }

    #[test]
    fn conflicting_proxy_options_are_rejected() {
        let config = proxy("kind = \"tcp\"\nmirror = true\nsource_port = 4000");
        assert!(matches!(validate_config(&config), Err(ConfigError::Proxy(_))));

        let config = proxy("kind = \"https\"\nca_cert = \"/tmp/ca.pem\"");
        assert!(validation_message(&config).contains("ca_key"));

        let config = proxy("kind = \"tls\"\nmin_version = \"tls13\"\nmax_version = \"tls12\"");
        assert!(validation_message(&config).contains("min_version"));

        let config = proxy("kind = \"udp\"\nport = \"eighty\"");
        assert!(matches!(validate_config(&config), Err(ConfigError::Options(_))));
    }

    #[test]
    fn ambient_sections_are_checked() {
        let mut config = parse(RELAY);
        config.logging.format = Some("xml".into());
        assert!(validation_message(&config).contains("logging.format"));

        let mut config = parse(RELAY);
        config.metrics.listen = Some("localhost".into());
        assert!(validation_message(&config).contains("metrics.listen"));

        let mut config = parse(RELAY);
        config.shutdown_timeout_secs = 0;
        assert!(validation_message(&config).contains("shutdown_timeout_secs"));
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = parse(RELAY);
        apply_overrides(
            &mut config,
            &CliOverrides {
                log_level: Some("trace".into()),
                metrics_listen: Some("127.0.0.1:9100".into()),
                ..Default::default()
            },
        );
        assert_eq!(config.log_level(), "trace");
        assert_eq!(config.metrics.listen.as_deref(), Some("127.0.0.1:9100"));
        validate_config(&config).unwrap();
    }

    #[test]
    fn loads_every_supported_format() {
        let dir = tempfile::tempdir().unwrap();

        let jsonc = dir.path().join("cfg.jsonc");
        std::fs::write(
            &jsonc,
            r#"{
                // ordered chain
                "modules": [{"name": "logger"}],
                "session": {"mode": "proxy", "kind": "udp", "port": 5353}
            }"#,
        )
        .unwrap();
        let config = load_config(&jsonc).unwrap();
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.session.mode(), "proxy");

        let yaml = dir.path().join("cfg.yaml");
        let mut file = std::fs::File::create(&yaml).unwrap();
        writeln!(
            file,
            "session:\n  mode: relay\n  first: {{kind: stdio}}\n  second: {{kind: tcp, port: 22}}"
        )
        .unwrap();
        let config = load_config(&yaml).unwrap();
        validate_config(&config).unwrap();

        let toml_path = dir.path().join("cfg.toml");
        std::fs::write(&toml_path, RELAY).unwrap();
        assert!(load_config(&toml_path).is_ok());

        let ini = dir.path().join("cfg.ini");
        std::fs::write(&ini, "").unwrap();
        assert!(matches!(load_config(&ini), Err(ConfigError::UnsupportedFormat)));
    }
}
