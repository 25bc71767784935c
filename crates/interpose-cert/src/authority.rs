//! CA material and leaf minting.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use interpose_core::defaults;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType, SerialNumber,
};
use tracing::{debug, info};

use crate::error::CertError;

/// A certificate and its private key, PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedCert {
    pub cert_pem: String,
    pub key_pem: String,
    /// PEM of the signing CA; `None` for self-signed certificates.
    pub issuer_pem: Option<String>,
}

impl MintedCert {
    /// Leaf followed by its issuer, ready to serve as a TLS chain.
    pub fn chain_pem(&self) -> String {
        match &self.issuer_pem {
            Some(issuer) => format!("{}{}", self.cert_pem, issuer),
            None => self.cert_pem.clone(),
        }
    }
}

/// Source of per-host certificates for TLS interception.
pub trait CertificateMinter: Send + Sync {
    fn mint(&self, common_name: &str) -> Result<Arc<MintedCert>, CertError>;
}

static SERIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Millisecond timestamp in the high bits, a process-wide sequence in the low
/// 16 so two certificates minted in the same millisecond still differ.
fn next_serial() -> SerialNumber {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let seq = SERIAL_SEQ.fetch_add(1, Ordering::Relaxed) & 0xffff;
    SerialNumber::from((millis << 16) | seq)
}

fn base_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    let validity = time::Duration::days(defaults::DEFAULT_CERT_VALIDITY_DAYS);
    params.not_before = now - validity;
    params.not_after = now + validity;
    params.serial_number = Some(next_serial());
    params
}

fn subject_alt_name(common_name: &str) -> Result<SanType, CertError> {
    if let Ok(ip) = common_name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name = common_name
        .to_string()
        .try_into()
        .map_err(|_| CertError::InvalidCommonName(common_name.to_string()))?;
    Ok(SanType::DnsName(name))
}

/// Create a certificate for `common_name`.
///
/// Without an issuer the result is a self-signed CA certificate; with one it
/// is a server leaf (SAN = `common_name`) signed by that CA.
pub fn generate_certificate(
    common_name: &str,
    issuer: Option<&CertificateAuthority>,
) -> Result<MintedCert, CertError> {
    if common_name.trim().is_empty() {
        return Err(CertError::InvalidCommonName(common_name.to_string()));
    }
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CertError::KeyGeneration(e.to_string()))?;
    let mut params = base_params(common_name);

    match issuer {
        None => {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
            let cert = params
                .self_signed(&key_pair)
                .map_err(|e| CertError::CertGeneration(e.to_string()))?;
            Ok(MintedCert {
                cert_pem: cert.pem(),
                key_pem: key_pair.serialize_pem(),
                issuer_pem: None,
            })
        }
        Some(ca) => {
            params.is_ca = IsCa::ExplicitNoCa;
            params.subject_alt_names = vec![subject_alt_name(common_name)?];
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
            let cert = params
                .signed_by(&key_pair, &ca.issuer)
                .map_err(|e| CertError::CertGeneration(e.to_string()))?;
            Ok(MintedCert {
                cert_pem: cert.pem(),
                key_pem: key_pair.serialize_pem(),
                issuer_pem: Some(ca.cert_pem.clone()),
            })
        }
    }
}

/// A signing CA plus a per-host cache of minted leaves.
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
    issuer: Issuer<'static, KeyPair>,
    cache: Mutex<HashMap<String, Arc<MintedCert>>>,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertError> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| CertError::InvalidCa(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)
            .map_err(|e| CertError::InvalidCa(e.to_string()))?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            issuer,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Fresh in-memory CA.
    pub fn generate(common_name: &str) -> Result<Self, CertError> {
        let root = generate_certificate(common_name, None)?;
        Self::from_pem(&root.cert_pem, &root.key_pem)
    }

    /// `~/.interpose/ca.pem` and `~/.interpose/ca-key.pem`.
    pub fn default_paths() -> Result<(PathBuf, PathBuf), CertError> {
        let dir = dirs::home_dir()
            .ok_or(CertError::NoHomeDir)?
            .join(defaults::DEFAULT_CA_DIR);
        Ok((
            dir.join(defaults::DEFAULT_CA_CERT_FILE),
            dir.join(defaults::DEFAULT_CA_KEY_FILE),
        ))
    }

    /// Load the CA from disk, creating it when neither file exists.
    ///
    /// Exactly one file present is corrupt state and is reported as
    /// [`CertError::IncompleteCa`] without touching the disk.
    pub fn load_or_bootstrap(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                let cert_pem = fs::read_to_string(cert_path)?;
                let key_pem = fs::read_to_string(key_path)?;
                debug!(cert = %cert_path.display(), "loaded CA");
                Self::from_pem(&cert_pem, &key_pem)
            }
            (true, false) => Err(CertError::IncompleteCa {
                present: "certificate",
                missing: "key",
                path: cert_path.to_path_buf(),
            }),
            (false, true) => Err(CertError::IncompleteCa {
                present: "key",
                missing: "certificate",
                path: key_path.to_path_buf(),
            }),
            (false, false) => {
                let ca = Self::generate(defaults::DEFAULT_CA_COMMON_NAME)?;
                for path in [cert_path, key_path] {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                }
                fs::write(cert_path, &ca.cert_pem)?;
                write_private(key_path, &ca.key_pem)?;
                info!(cert = %cert_path.display(), "bootstrapped new CA");
                Ok(ca)
            }
        }
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Number of distinct hosts minted so far.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl CertificateMinter for CertificateAuthority {
    fn mint(&self, common_name: &str) -> Result<Arc<MintedCert>, CertError> {
        if let Some(hit) = self.cache.lock().get(common_name) {
            return Ok(hit.clone());
        }
        let minted = Arc::new(generate_certificate(common_name, Some(self))?);
        debug!(cn = common_name, "minted certificate");
        interpose_metrics::record_cert_minted();
        Ok(self
            .cache
            .lock()
            .entry(common_name.to_string())
            .or_insert(minted)
            .clone())
    }
}

fn write_private(path: &Path, pem: &str) -> std::io::Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)?.write_all(pem.as_bytes())
}
