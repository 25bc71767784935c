//! CLI definitions for certificate management.

use std::fs;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::authority::{CertificateAuthority, CertificateMinter};
use crate::error::CertError;

/// Certificate management for TLS interception.
#[derive(Parser, Debug, Clone)]
#[command(name = "interpose-cert", version, about = "CA and certificate management")]
pub struct CertArgs {
    #[command(subcommand)]
    pub command: CertCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CertCommands {
    /// Bootstrap the interception CA if needed and print its certificate.
    Ca(CaArgs),
    /// Mint a leaf certificate signed by the interception CA.
    Mint(MintArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct CaArgs {
    /// CA certificate path (default: ~/.interpose/ca.pem).
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// CA private key path (default: ~/.interpose/ca-key.pem).
    #[arg(long)]
    pub ca_key: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct MintArgs {
    /// Common name (host name or IP) of the certificate.
    #[arg(long)]
    pub cn: String,

    #[command(flatten)]
    pub ca: CaArgs,

    /// Output directory for certificate and key files.
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,
}

impl CaArgs {
    pub fn resolve(&self) -> Result<(PathBuf, PathBuf), CertError> {
        let (default_cert, default_key) = match (&self.ca_cert, &self.ca_key) {
            (Some(c), Some(k)) => return Ok((c.clone(), k.clone())),
            _ => CertificateAuthority::default_paths()?,
        };
        Ok((
            self.ca_cert.clone().unwrap_or(default_cert),
            self.ca_key.clone().unwrap_or(default_key),
        ))
    }
}

pub fn show_ca(args: &CaArgs) -> Result<(), CertError> {
    let (cert, key) = args.resolve()?;
    let ca = CertificateAuthority::load_or_bootstrap(&cert, &key)?;
    println!("CA certificate: {}", cert.display());
    print!("{}", ca.cert_pem());
    Ok(())
}

pub fn mint(args: &MintArgs) -> Result<(), CertError> {
    let (cert, key) = args.ca.resolve()?;
    let ca = CertificateAuthority::load_or_bootstrap(&cert, &key)?;
    let minted = ca.mint(&args.cn)?;

    fs::create_dir_all(&args.output)?;
    let file_stem = args.cn.replace([':', '/'], "_");
    let cert_path = args.output.join(format!("{}.pem", file_stem));
    let key_path = args.output.join(format!("{}-key.pem", file_stem));
    fs::write(&cert_path, minted.chain_pem())?;
    fs::write(&key_path, &minted.key_pem)?;

    println!("Certificate minted:");
    println!("  Certificate: {}", cert_path.display());
    println!("  Private key: {}", key_path.display());
    println!("  Issuer:      {}", cert.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_writes_chain_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let args = MintArgs {
            cn: "intercept.test".into(),
            ca: CaArgs {
                ca_cert: Some(dir.path().join("ca.pem")),
                ca_key: Some(dir.path().join("ca-key.pem")),
            },
            output: dir.path().join("out"),
        };
        mint(&args).unwrap();

        let chain = fs::read_to_string(dir.path().join("out/intercept.test.pem")).unwrap();
        assert_eq!(chain.matches("BEGIN CERTIFICATE").count(), 2);
        assert!(dir.path().join("out/intercept.test-key.pem").exists());
    }
}
