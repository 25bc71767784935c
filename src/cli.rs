//! Subcommand implementations for the `interpose` binary.

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use interpose_config::{CliOverrides, LoggingConfig, apply_overrides, load_config, validate_config};
use interpose_core::Registry;
use interpose_net::{BridgeOptions, Configurator, Protocol, TproxyOptions, bridge_configurator, tproxy_configurator};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::session::build_session;

/// Arguments of `interpose run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Config file path (json/jsonc/yaml/toml)
    #[arg(short, long, default_value = "interpose.toml")]
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: CliOverrides,
}

/// Arguments of `interpose bpf`.
#[derive(Args, Debug, Clone)]
pub struct BpfArgs {
    /// Address of the intercepted host
    #[arg(long)]
    pub host: Ipv4Addr,
    /// Port whose traffic the filter rejects
    #[arg(long)]
    pub port: u16,
}

#[derive(Subcommand, Debug, Clone)]
pub enum NetCommands {
    /// TPROXY rules redirecting traffic to a local port.
    Tproxy {
        #[command(subcommand)]
        action: NetAction,
        /// Local port the proxy listens on
        #[arg(long, default_value_t = interpose_core::DEFAULT_LISTEN_PORT)]
        port: u16,
        /// Redirect UDP instead of TCP
        #[arg(long)]
        udp: bool,
        #[arg(long, default_value = interpose_core::DEFAULT_CLIENT_IFACE)]
        client_iface: String,
        #[arg(long, default_value = interpose_core::DEFAULT_SERVER_IFACE)]
        server_iface: String,
        /// Extra iptables match narrowing what gets redirected
        #[arg(long, default_value = "")]
        filter: String,
    },
    /// A bridge joining the client and server interfaces.
    Bridge {
        #[command(subcommand)]
        action: NetAction,
        #[arg(long, default_value = interpose_core::DEFAULT_BRIDGE_NAME)]
        bridge: String,
        #[arg(long, default_value = interpose_core::DEFAULT_CLIENT_IFACE)]
        client_iface: String,
        #[arg(long, default_value = interpose_core::DEFAULT_SERVER_IFACE)]
        server_iface: String,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetAction {
    Up,
    Down,
}

/// Arguments of `interpose net`.
#[derive(Args, Debug, Clone)]
pub struct NetArgs {
    #[command(subcommand)]
    pub command: NetCommands,
    /// Keep going when a command fails
    #[arg(long)]
    pub force: bool,
}

/// Load, validate and run a configured session until it ends or a stop
/// signal arrives.
pub async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(&args.config)?;
    apply_overrides(&mut config, &args.overrides);
    validate_config(&config)?;

    init_tracing(&config.logging);

    if let Some(listen) = &config.metrics.listen {
        match interpose_metrics::init_prometheus(listen) {
            Ok(()) => info!("metrics exporter listening on {}", listen),
            Err(e) => warn!("failed to start metrics exporter: {}", e),
        }
    }

    let session = build_session(&config)?;
    info!(session = session.describe(), "session configured");

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    let grace = Duration::from_secs(config.shutdown_timeout_secs);
    let stopping = shutdown.clone();
    tokio::select! {
        result = session.run(shutdown) => {
            if let Err(e) = &result {
                interpose_metrics::record_error(e.error_type());
            }
            result?;
        }
        _ = async {
            stopping.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(timeout_secs = grace.as_secs(), "shutdown timed out, abandoning active pairs");
        }
    }
    Ok(())
}

/// Print every registry with its descriptions.
pub fn list() {
    section("endpoints", &interpose_endpoint::endpoints());
    section("codecs", &interpose_proto::codecs());
    section("modules", &interpose_module::modules());
    section("proxies", &interpose_proxy::proxies());
}

fn section<C>(title: &str, registry: &Registry<C>) {
    println!("{title}:");
    for entry in registry.entries() {
        println!("  {:<24} {}", entry.name, entry.description);
    }
}

/// Print the compiled packet filter, one instruction per line.
pub fn bpf(args: &BpfArgs) -> Result<(), Box<dyn std::error::Error>> {
    let program = interpose_net::compile(args.host, args.port)?;
    for f in program.filters() {
        println!("{{ 0x{:02x}, {}, {}, 0x{:08x} }},", f.code, f.jt, f.jf, f.k);
    }
    Ok(())
}

/// Apply or remove host network configuration outside of a proxy run.
pub fn net(args: &NetArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&LoggingConfig::default());

    let (mut configurator, action): (Configurator, NetAction) = match &args.command {
        NetCommands::Tproxy {
            action,
            port,
            udp,
            client_iface,
            server_iface,
            filter,
        } => {
            let opts = TproxyOptions {
                client_iface: client_iface.clone(),
                server_iface: server_iface.clone(),
                filter: filter.clone(),
                ..Default::default()
            };
            let protocol = if *udp { Protocol::Udp } else { Protocol::Tcp };
            (tproxy_configurator(*port, protocol, &opts), *action)
        }
        NetCommands::Bridge {
            action,
            bridge,
            client_iface,
            server_iface,
        } => {
            let opts = BridgeOptions {
                bridge: bridge.clone(),
                client_iface: client_iface.clone(),
                server_iface: server_iface.clone(),
                ..Default::default()
            };
            (bridge_configurator(&opts), *action)
        }
    };

    match action {
        NetAction::Up => configurator.configure(args.force)?,
        NetAction::Down => {
            configurator.assume_applied();
            configurator.deconfigure(args.force)?;
        }
    }
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initialize tracing with the given logging configuration.
///
/// `level` and the per-module `filters` build the `EnvFilter`; `format` is
/// json, pretty (default) or compact; `output` is stdout or stderr (default).
pub fn init_tracing(config: &LoggingConfig) {
    let base_level = config
        .level
        .as_deref()
        .unwrap_or(interpose_core::DEFAULT_LOG_LEVEL);
    let mut filter_str = base_level.to_string();
    for (module, level) in &config.filters {
        filter_str.push_str(&format!(",{module}={level}"));
    }
    let filter = EnvFilter::try_new(&filter_str).unwrap_or_else(|_| EnvFilter::new("info"));

    let format = config.format.as_deref().unwrap_or("pretty");
    let output = config.output.as_deref().unwrap_or("stderr");

    match (format, output) {
        ("json", "stdout") => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stdout))
            .init(),
        ("json", _) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
        ("compact", "stdout") => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(io::stdout))
            .init(),
        ("compact", _) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(io::stderr))
            .init(),
        (_, "stdout") => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::stdout))
            .init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::stderr))
            .init(),
    }
}
