//! Certificate material for the join endpoint

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::digest::{digest, SHA256};
use tracing::info;
use wtransport::Identity;

const DEV_CERT_DIR: &str = "certs";

/// Where the certificate and key PEM files come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertSource {
    Configured { cert: PathBuf, key: PathBuf },
    /// `certs/cert.pem` and `certs/key.pem` under the working directory
    DevDirectory { cert: PathBuf, key: PathBuf },
}

impl CertSource {
    /// Configured paths win; otherwise the dev directory if both files exist
    pub fn resolve(cert_path: Option<&str>, key_path: Option<&str>, dev_dir: &Path) -> Result<Self> {
        if let (Some(cert), Some(key)) = (cert_path, key_path) {
            return Ok(CertSource::Configured {
                cert: cert.into(),
                key: key.into(),
            });
        }

        let cert = dev_dir.join("cert.pem");
        let key = dev_dir.join("key.pem");
        if !cert.exists() || !key.exists() {
            bail!(
                "no TLS certificate: set TLS_CERT_PATH and TLS_KEY_PATH or place cert.pem and key.pem in {}",
                dev_dir.display()
            );
        }
        Ok(CertSource::DevDirectory { cert, key })
    }

    fn paths(&self) -> (&Path, &Path) {
        match self {
            CertSource::Configured { cert, key } | CertSource::DevDirectory { cert, key } => {
                (cert.as_path(), key.as_path())
            }
        }
    }
}

/// TLS identity plus the hash clients pin it by
pub struct TlsConfig {
    pub identity: Identity,
    /// Base64 SHA-256 of the leaf certificate (DER)
    pub cert_hash: String,
}

impl TlsConfig {
    pub async fn load(cert_path: Option<&str>, key_path: Option<&str>) -> Result<Self> {
        let source = CertSource::resolve(cert_path, key_path, Path::new(DEV_CERT_DIR))?;
        let (cert, key) = source.paths();
        info!("Loading TLS certificate from {}", cert.display());

        let identity = Identity::load_pemfiles(cert, key)
            .await
            .with_context(|| format!("failed to load {} / {}", cert.display(), key.display()))?;
        let cert_hash = identity
            .certificate_chain()
            .as_slice()
            .first()
            .map(|leaf| der_hash(leaf.der()))
            .unwrap_or_default();

        Ok(Self {
            identity,
            cert_hash,
        })
    }
}

fn der_hash(der: &[u8]) -> String {
    STANDARD.encode(digest(&SHA256, der).as_ref())
}
