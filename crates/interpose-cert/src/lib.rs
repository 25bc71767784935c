//! Certificate service for TLS interception.
//!
//! A [`CertificateAuthority`] is loaded from (or bootstrapped into) a pair of
//! PEM files and mints a leaf certificate per intercepted host name. The
//! TLS-intercepting listener only sees the [`CertificateMinter`] trait.
//!
//! # Usage
//!
//! ```bash
//! interpose cert ca
//! interpose cert mint --cn example.com --output ./certs
//! ```

pub mod authority;
pub mod cli;
pub mod error;

pub use authority::{CertificateAuthority, CertificateMinter, MintedCert, generate_certificate};
pub use cli::{CaArgs, CertArgs, CertCommands, MintArgs};
pub use error::CertError;

/// Run the cert CLI with the given arguments.
pub fn run(args: CertArgs) -> Result<(), CertError> {
    match args.command {
        CertCommands::Ca(args) => cli::show_ca(&args),
        CertCommands::Mint(args) => cli::mint(&args),
    }
}
