//! Certificate authority for TLS interception.
//!
//! Owns a root signing key/certificate pair persisted on disk and issues
//! per-hostname leaf certificates on demand. Leaves are cached for the
//! process lifetime (or until their validity window runs out) so repeated
//! CONNECTs to the same host do not pay the signing cost again.
//!
//! Clients must be told to trust the root certificate out-of-band; the
//! [`root_cert_pem`](CertificateAuthority::root_cert_pem) and
//! [`root_cert_der`](CertificateAuthority::root_cert_der) accessors exist
//! for that trust-bootstrap flow.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::error::CertificateError;

/// Root certificate and key file names.
const ROOT_CERT_FILENAME: &str = "spyglass-root.crt";
const ROOT_KEY_FILENAME: &str = "spyglass-root.key";

/// Subject of the root certificate.
const ROOT_SUBJECT: &str = "Spyglass Root CA";

/// Validity window for issued leaves.
const LEAF_VALIDITY: Duration = Duration::days(90);

/// Leaves closer than this to expiry are regenerated instead of served
/// from the cache.
const LEAF_RENEW_MARGIN: Duration = Duration::hours(1);

/// A per-hostname certificate issued by the root.
#[derive(Debug)]
pub struct LeafCert {
    hostname: String,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    expires_at: OffsetDateTime,
}

impl LeafCert {
    /// The hostname this leaf was issued for.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The certificate chain: leaf first, then the signing root.
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// A copy of the leaf's private key (PKCS#8).
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Builds a rustls server config presenting this leaf.
    ///
    /// Only `http/1.1` is offered via ALPN so clients negotiate down from
    /// HTTP/2; the pipeline speaks HTTP/1 on decrypted streams.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, CertificateError> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.private_key())
            .map_err(|e| CertificateError::Generation(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    fn needs_renewal(&self) -> bool {
        OffsetDateTime::now_utc() + LEAF_RENEW_MARGIN >= self.expires_at
    }
}

/// Loaded root material, kept in memory after the first issuance.
struct RootMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
}

/// Issues and caches leaf certificates signed by a persistent local root.
///
/// Safe to share across connection tasks: the leaf cache is a lock-protected
/// map, concurrent misses for the same hostname may both sign but the last
/// writer wins and the cache is never torn.
pub struct CertificateAuthority {
    root_dir: PathBuf,
    root: RwLock<Option<Arc<RootMaterial>>>,
    leaves: RwLock<HashMap<String, Arc<LeafCert>>>,
}

impl CertificateAuthority {
    /// Creates an authority rooted at the given directory.
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
            root: RwLock::new(None),
            leaves: RwLock::new(HashMap::new()),
        }
    }

    /// Creates an authority using the default Spyglass data directory.
    pub fn with_default_dir() -> Result<Self, CertificateError> {
        let project_dirs = directories::ProjectDirs::from("io", "spyglass", "Spyglass")
            .ok_or_else(|| CertificateError::Generation("failed to resolve project dirs".into()))?;
        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    /// Path to the root certificate file.
    pub fn root_cert_path(&self) -> PathBuf {
        self.root_dir.join(ROOT_CERT_FILENAME)
    }

    /// Path to the root private key file.
    pub fn root_key_path(&self) -> PathBuf {
        self.root_dir.join(ROOT_KEY_FILENAME)
    }

    /// Whether root key/certificate material is present on durable storage.
    pub fn root_exists(&self) -> bool {
        self.root_cert_path().exists() && self.root_key_path().exists()
    }

    /// Generates a new root key pair and self-signed certificate.
    ///
    /// Bootstrap path, invoked outside of proxy startup; after it returns,
    /// [`root_exists`](Self::root_exists) is true. Overwrites any previous
    /// root and drops cached leaves, which would no longer chain to it.
    pub fn generate_root(&self) -> Result<(), CertificateError> {
        fs::create_dir_all(&self.root_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CertificateError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(vec![ROOT_SUBJECT.to_string()])
            .map_err(|e| CertificateError::Generation(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, ROOT_SUBJECT);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertificateError::Generation(e.to_string()))?;

        fs::write(self.root_cert_path(), cert.pem())?;
        fs::write(self.root_key_path(), key_pair.serialize_pem())?;

        *self.root.write() = None;
        self.leaves.write().clear();

        tracing::info!(path = %self.root_cert_path().display(), "generated root CA certificate");
        Ok(())
    }

    /// Generates the root only when it is missing.
    pub fn ensure_root(&self) -> Result<(), CertificateError> {
        if !self.root_exists() {
            self.generate_root()?;
        }
        Ok(())
    }

    /// The root certificate as PEM, for trust-store installation.
    pub fn root_cert_pem(&self) -> Result<String, CertificateError> {
        self.read_root_file(&self.root_cert_path())
    }

    /// The root certificate as DER bytes.
    pub fn root_cert_der(&self) -> Result<CertificateDer<'static>, CertificateError> {
        let pem = self.root_cert_pem()?;
        parse_cert_pem(pem.as_bytes())
    }

    /// Returns a certificate for `hostname`, issuing and caching one when
    /// no valid cached leaf exists.
    ///
    /// Fails with [`CertificateError::RootMissing`] when no root material
    /// is on disk, or [`CertificateError::InvalidHostname`] when the name
    /// cannot go into a SAN.
    pub fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCert>, CertificateError> {
        let hostname = normalize_hostname(hostname)?;

        if let Some(leaf) = self.leaves.read().get(&hostname) {
            if !leaf.needs_renewal() {
                tracing::debug!(host = %hostname, "leaf certificate cache hit");
                return Ok(Arc::clone(leaf));
            }
        }

        let root = self.load_root()?;
        let leaf = Arc::new(self.sign_leaf(&hostname, &root)?);

        // Last writer wins: a racing issuer for the same hostname may have
        // inserted already; both leaves are valid, only one stays cached.
        self.leaves
            .write()
            .insert(hostname.clone(), Arc::clone(&leaf));
        tracing::debug!(host = %hostname, "issued leaf certificate");
        Ok(leaf)
    }

    /// Number of cached leaves.
    pub fn cached_leaves(&self) -> usize {
        self.leaves.read().len()
    }

    /// Drops all cached leaves.
    pub fn clear_leaf_cache(&self) {
        self.leaves.write().clear();
    }

    fn sign_leaf(&self, hostname: &str, root: &RootMaterial) -> Result<LeafCert, CertificateError> {
        let key_pair =
            KeyPair::generate().map_err(|e| CertificateError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(vec![hostname.to_string()])
            .map_err(|e| CertificateError::InvalidHostname(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, hostname);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        let not_after = now + LEAF_VALIDITY;
        params.not_before = now - Duration::days(1);
        params.not_after = not_after;
        params.serial_number = Some(leaf_serial().into());

        let cert = params
            .signed_by(&key_pair, &root.issuer)
            .map_err(|e| CertificateError::Generation(e.to_string()))?;

        Ok(LeafCert {
            hostname: hostname.to_string(),
            chain: vec![cert.der().clone(), root.cert_der.clone()],
            key: PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
            expires_at: not_after,
        })
    }

    fn load_root(&self) -> Result<Arc<RootMaterial>, CertificateError> {
        if let Some(root) = self.root.read().as_ref() {
            return Ok(Arc::clone(root));
        }

        let cert_pem = self.read_root_file(&self.root_cert_path())?;
        let key_pem = self.read_root_file(&self.root_key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CertificateError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        let cert_der = parse_cert_pem(cert_pem.as_bytes())?;

        let root = Arc::new(RootMaterial { issuer, cert_der });
        *self.root.write() = Some(Arc::clone(&root));
        Ok(root)
    }

    fn read_root_file(&self, path: &Path) -> Result<String, CertificateError> {
        fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CertificateError::RootMissing(self.root_dir.display().to_string())
            } else {
                CertificateError::Io(e)
            }
        })
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root_dir", &self.root_dir)
            .field("cached_leaves", &self.leaves.read().len())
            .finish()
    }
}

fn parse_cert_pem(pem: &[u8]) -> Result<CertificateDer<'static>, CertificateError> {
    let mut reader = std::io::BufReader::new(pem);
    let result = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| CertificateError::Parse("no certificate in PEM".into()))?
        .map_err(|e| CertificateError::Parse(e.to_string()));
    result
}

fn normalize_hostname(hostname: &str) -> Result<String, CertificateError> {
    let hostname = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    if hostname.is_empty()
        || hostname
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/')
    {
        return Err(CertificateError::InvalidHostname(hostname));
    }
    Ok(hostname)
}

/// Unique serial: seconds-timestamp in the high half, random low half.
fn leaf_serial() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;
    ((timestamp_part as u64) << 32) | (random_part as u64)
}
