//! Self-signed certificate lifecycle: load-or-generate on startup, then
//! regenerate roughly an hour before expiry on a background timer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;

const CERT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);
const RENEW_BEFORE: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("failed to parse certificate PEM")]
    Pem,
    #[error("tls config error: {0}")]
    Rustls(#[from] rustls::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct CertStore {
    dir: PathBuf,
    config: RwLock<Arc<rustls::ServerConfig>>,
}

impl CertStore {
    /// Loads the certificate from `<root>/.fly`, generating a fresh
    /// self-signed one if none exists or the existing one is close to
    /// expiry, then spawns a background task that regenerates it again
    /// an hour before the next expiry.
    pub async fn load_or_generate(root: &Path) -> Result<Arc<CertStore>> {
        let dir = root.join(".fly");
        tokio::fs::create_dir_all(&dir).await?;

        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");

        if !cert_path.exists() || expires_soon(&cert_path).await? {
            generate_cert(&cert_path, &key_path).await?;
        }

        let config = build_server_config(&cert_path, &key_path).await?;
        let store = Arc::new(CertStore { dir, config: RwLock::new(Arc::new(config)) });

        let recheck = store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(600)).await;
                if let Err(err) = recheck.renew_if_needed().await {
                    tracing::error!(?err, "failed to renew TLS certificate");
                }
            }
        });

        Ok(store)
    }

    async fn renew_if_needed(&self) -> Result<()> {
        let cert_path = self.dir.join("cert.pem");
        let key_path = self.dir.join("key.pem");

        if expires_soon(&cert_path).await? {
            generate_cert(&cert_path, &key_path).await?;
            let config = build_server_config(&cert_path, &key_path).await?;
            *self.config.write().await = Arc::new(config);
            tracing::info!("regenerated TLS certificate");
        }

        Ok(())
    }

    pub async fn current(&self) -> Arc<rustls::ServerConfig> {
        self.config.read().await.clone()
    }
}

/// Expiry is tracked in a sidecar file written next to the certificate at
/// generation time, rather than re-parsed out of the PEM on every check.
async fn expires_soon(cert_path: &Path) -> Result<bool> {
    let expiry_path = cert_path.with_file_name("cert.expiry");

    let expiry = match tokio::fs::read_to_string(&expiry_path).await {
        Ok(text) => text.trim().parse::<i64>().ok().and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
        Err(_) => None,
    };

    let threshold = OffsetDateTime::now_utc() + RENEW_BEFORE;
    Ok(expiry.map(|e| e < threshold).unwrap_or(true))
}

async fn generate_cert(cert_path: &Path, key_path: &Path) -> Result<()> {
    let subject_alt_names = vec!["localhost".to_string()];
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(subject_alt_names)?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let cert_tmp = cert_path.with_extension("pem~");
    let key_tmp = key_path.with_extension("pem~");

    tokio::fs::write(&cert_tmp, cert_pem).await?;
    tokio::fs::write(&key_tmp, key_pem).await?;
    tokio::fs::rename(&cert_tmp, cert_path).await?;
    tokio::fs::rename(&key_tmp, key_path).await?;

    // Stash the expiry alongside the cert so `expires_soon` doesn't need a
    // full x509 parser: rcgen's default validity is the constant above.
    let expiry_path = cert_path.with_file_name("cert.expiry");
    let expiry = OffsetDateTime::now_utc() + CERT_VALIDITY;
    tokio::fs::write(&expiry_path, expiry.unix_timestamp().to_string()).await?;

    Ok(())
}

async fn build_server_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let cert_pem = tokio::fs::read(cert_path).await?;
    let key_pem = tokio::fs::read(key_path).await?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::Pem)?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|_| Error::Pem)?
        .ok_or(Error::Pem)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(config)
}

/// SHA-256 fingerprint of the DER-encoded certificate, for clients to
/// verify against a known-hosts table on first connect.
pub fn fingerprint(cert_der: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(cert_der);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
