//! Configuration validation.
//!
//! Everything here is free of side effects: names are looked up in the
//! registries and options are parsed, but no template, module or CA is
//! built. Failures surface before any listener opens.

use std::net::SocketAddr;

use interpose_core::parse_options;
use interpose_endpoint::{TlsVersion, endpoints};
use interpose_module::modules;
use interpose_proxy::{HttpsProxyOptions, Layer4Options, TlsProxyOptions, proxies};

use crate::Config;
use crate::loader::ConfigError;
use crate::types::{EndpointSpec, ProxySpec, RelaySpec, SessionConfig, resolve_codec};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["json", "pretty", "compact"];
const LOG_OUTPUTS: [&str; 2] = ["stdout", "stderr"];

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let logging = &config.logging;
    if let Some(level) = &logging.level
        && !LOG_LEVELS.contains(&level.as_str())
    {
        return Err(ConfigError::Validation(format!(
            "logging.level must be one of: {:?}",
            LOG_LEVELS
        )));
    }
    if let Some(format) = &logging.format
        && !LOG_FORMATS.contains(&format.as_str())
    {
        return Err(ConfigError::Validation(format!(
            "logging.format must be one of: {:?}",
            LOG_FORMATS
        )));
    }
    if let Some(output) = &logging.output
        && !LOG_OUTPUTS.contains(&output.as_str())
    {
        return Err(ConfigError::Validation(format!(
            "logging.output must be one of: {:?}",
            LOG_OUTPUTS
        )));
    }
    if let Some(listen) = &config.metrics.listen
        && listen.parse::<SocketAddr>().is_err()
    {
        return Err(ConfigError::Validation(format!(
            "metrics.listen '{listen}' is not a socket address"
        )));
    }
    if config.shutdown_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "shutdown_timeout_secs must be > 0".into(),
        ));
    }

    let registry = modules();
    for module in &config.modules {
        registry.lookup(&module.name)?;
    }

    match &config.session {
        SessionConfig::Relay(relay) => validate_relay(relay),
        SessionConfig::Proxy(proxy) => validate_proxy(proxy),
    }
}

fn validate_endpoint(side: &str, spec: &EndpointSpec) -> Result<(), ConfigError> {
    if spec.kind.trim().is_empty() {
        return Err(ConfigError::Validation(format!("session.{side}.kind is empty")));
    }
    endpoints().lookup(&spec.kind)?;
    resolve_codec(spec.codec.as_ref())?;
    Ok(())
}

fn validate_relay(relay: &RelaySpec) -> Result<(), ConfigError> {
    validate_endpoint("first", &relay.first)?;
    validate_endpoint("second", &relay.second)?;
    if relay.second.kind.ends_with("-listen") {
        return Err(ConfigError::Validation(
            "session.second must be a connecting endpoint".into(),
        ));
    }
    if relay.multi && !relay.first.kind.ends_with("-listen") {
        return Err(ConfigError::Validation(
            "session.multi requires a listening first endpoint".into(),
        ));
    }
    Ok(())
}

fn validate_versions(min: &str, max: &str) -> Result<(), ConfigError> {
    if TlsVersion::parse(min)? > TlsVersion::parse(max)? {
        return Err(ConfigError::Validation(
            "min_version cannot be greater than max_version".into(),
        ));
    }
    Ok(())
}

fn validate_proxy(proxy: &ProxySpec) -> Result<(), ConfigError> {
    proxies().lookup(&proxy.kind)?;
    resolve_codec(proxy.codec.as_ref())?;
    let kind = proxy.kind.as_str();
    match kind {
        "tcp" | "udp" => {
            let opts: Layer4Options = parse_options(kind, &proxy.options)?;
            opts.validate()?;
        }
        "tls" => {
            let opts: TlsProxyOptions = parse_options(kind, &proxy.options)?;
            opts.net.validate()?;
            if opts.cert.is_some() != opts.key.is_some() {
                return Err(ConfigError::Validation(
                    "'cert' and 'key' must be given together".into(),
                ));
            }
            if opts.client_cert.is_some() != opts.client_key.is_some() {
                return Err(ConfigError::Validation(
                    "'client_cert' and 'client_key' must be given together".into(),
                ));
            }
            validate_versions(&opts.min_version, &opts.max_version)?;
        }
        "https" => {
            let opts: HttpsProxyOptions = parse_options(kind, &proxy.options)?;
            opts.net.validate()?;
            if opts.ca_cert.is_some() != opts.ca_key.is_some() {
                return Err(ConfigError::Validation(
                    "'ca_cert' and 'ca_key' must be given together".into(),
                ));
            }
            if opts.client_cert.is_some() != opts.client_key.is_some() {
                return Err(ConfigError::Validation(
                    "'client_cert' and 'client_key' must be given together".into(),
                ));
            }
            validate_versions(&opts.min_version, &opts.max_version)?;
        }
        // Remaining kinds check their options when built.
        _ => {}
    }
    Ok(())
}
