//! The `interpose` command-line interface.
//!
//! - `interpose run -c cfg.toml` - run a configured relay or proxy
//! - `interpose list` - show the registered endpoints, codecs, modules and proxies
//! - `interpose cert ca|mint` - manage the interception CA
//! - `interpose bpf --host --port` - print the compiled packet filter
//! - `interpose net tproxy|bridge up|down` - apply or remove network configuration

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use interpose::cli::{BpfArgs, NetArgs, RunArgs};

#[derive(Parser)]
#[command(
    name = "interpose",
    version,
    about = "Relay, proxy and tamper with byte streams",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a configured relay or proxy.
    Run(RunArgs),

    /// List the registered endpoints, codecs, modules and proxies.
    List,

    /// Manage the interception CA.
    Cert(interpose_cert::CertArgs),

    /// Print the packet filter excluding a host/port from interception.
    Bpf(BpfArgs),

    /// Apply or remove host network configuration.
    Net(NetArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => interpose::cli::run(args).await,
        Commands::List => {
            interpose::cli::list();
            Ok(())
        }
        Commands::Cert(args) => interpose_cert::run(args).map_err(Into::into),
        Commands::Bpf(args) => interpose::cli::bpf(&args),
        Commands::Net(args) => interpose::cli::net(&args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
