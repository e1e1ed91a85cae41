/// Credential Provider
///
/// Two authentication forms exist for APNs and nothing else:
/// - **Certificate**: a TLS client identity presented once per connection
/// - **Token**: a short-lived ES256 provider token sent as a bearer header
///
/// Token credentials cache the signed token and regenerate it once it is
/// older than the configured lifetime. Regeneration happens under a write
/// lock so concurrent senders see either the previous token or the new one.
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::DEFAULT_TOKEN_LIFETIME;
use crate::errors::{CredentialError, Result};

/// Source of the current time, replaceable in tests
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Per-request authentication produced by [`Credentials::auth_context`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    /// The TLS client certificate on the connection authenticates every request
    ClientCertificate,
    /// Signed provider token
    Bearer(String),
}

impl AuthContext {
    pub fn authorization_header(&self) -> Option<String> {
        match self {
            AuthContext::ClientCertificate => None,
            AuthContext::Bearer(token) => Some(format!("bearer {token}")),
        }
    }
}

/// Raw client identity as loaded from disk
#[derive(Clone, PartialEq, Eq)]
pub enum CertificateMaterial {
    /// PKCS#12 archive (`.p12` / `.pfx`)
    Pkcs12 { der: Vec<u8>, password: String },
    /// PEM certificate chain and a PKCS#8 private key
    Pem { certificate: Vec<u8>, key: Vec<u8> },
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateMaterial::Pkcs12 { der, .. } => f
                .debug_struct("Pkcs12")
                .field("len", &der.len())
                .finish_non_exhaustive(),
            CertificateMaterial::Pem { certificate, .. } => f
                .debug_struct("Pem")
                .field("certificate_len", &certificate.len())
                .finish_non_exhaustive(),
        }
    }
}

/// A client certificate whose TLS identity has already been parsed.
///
/// Constructors fail with [`CredentialError::Certificate`] on a malformed
/// archive, a wrong password or a key the TLS backend cannot use, so a bad
/// certificate never reaches the connector.
#[derive(Clone)]
pub struct CertificateCredentials {
    material: CertificateMaterial,
    tls_identity: reqwest::Identity,
    identity: String,
}

impl fmt::Debug for CertificateCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateCredentials")
            .field("material", &self.material)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl CertificateCredentials {
    pub fn from_pkcs12(der: Vec<u8>, password: Option<&str>) -> std::result::Result<Self, CredentialError> {
        if der.is_empty() {
            return Err(CredentialError::Certificate("empty PKCS#12 archive".into()));
        }
        let identity = format!("certificate:{}", fingerprint(&[der.as_slice()]));
        Self::build(
            CertificateMaterial::Pkcs12 {
                der,
                password: password.unwrap_or_default().to_string(),
            },
            identity,
        )
    }

    /// Accepts a PEM bundle holding the certificate chain and a PKCS#8 key.
    pub fn from_pem(pem_bytes: &[u8]) -> std::result::Result<Self, CredentialError> {
        let mut certificates = Vec::new();
        let mut keys = Vec::new();
        for block in parse_pem(pem_bytes)? {
            let tag = block.tag().to_string();
            match tag.as_str() {
                "CERTIFICATE" => certificates.push(block),
                "PRIVATE KEY" => keys.push(block),
                "ENCRYPTED PRIVATE KEY" => {
                    return Err(CredentialError::Certificate(
                        "encrypted PEM keys are not supported; use a PKCS#12 archive".into(),
                    ));
                }
                tag if tag.ends_with("PRIVATE KEY") => {
                    return Err(CredentialError::Certificate(format!(
                        "{tag} blocks are not supported; convert the key to PKCS#8"
                    )));
                }
                tag => debug!("Ignoring PEM block {}", tag),
            }
        }

        if certificates.is_empty() {
            return Err(CredentialError::Certificate("no certificate found in PEM".into()));
        }
        let key = match keys.as_slice() {
            [key] => pem::encode(key).into_bytes(),
            [] => {
                return Err(CredentialError::Certificate("no private key found in PEM".into()));
            }
            _ => {
                return Err(CredentialError::Certificate(
                    "more than one private key found in PEM".into(),
                ));
            }
        };
        let certificate = pem::encode_many(&certificates).into_bytes();

        let identity = format!(
            "certificate:{}",
            fingerprint(&[certificate.as_slice(), key.as_slice()])
        );
        Self::build(CertificateMaterial::Pem { certificate, key }, identity)
    }

    /// Append intermediate certificates to a PEM identity
    pub fn with_chain(self, chain_pem: &[u8]) -> std::result::Result<Self, CredentialError> {
        let CertificateMaterial::Pem { mut certificate, key } = self.material else {
            return Err(CredentialError::Certificate(
                "PKCS#12 archives already carry their chain".into(),
            ));
        };

        let chain = parse_pem(chain_pem)?;
        if chain.is_empty() {
            return Err(CredentialError::Certificate(
                "no certificate found in chain PEM".into(),
            ));
        }
        if let Some(block) = chain.iter().find(|block| block.tag() != "CERTIFICATE") {
            return Err(CredentialError::Certificate(format!(
                "unexpected {} block in chain PEM",
                block.tag()
            )));
        }
        certificate.extend_from_slice(pem::encode_many(&chain).as_bytes());

        let identity = format!(
            "certificate:{}",
            fingerprint(&[certificate.as_slice(), key.as_slice()])
        );
        Self::build(CertificateMaterial::Pem { certificate, key }, identity)
    }

    pub fn material(&self) -> &CertificateMaterial {
        &self.material
    }

    /// Parsed identity presented during the TLS handshake
    pub fn tls_identity(&self) -> &reqwest::Identity {
        &self.tls_identity
    }

    fn build(
        material: CertificateMaterial,
        identity: String,
    ) -> std::result::Result<Self, CredentialError> {
        let tls_identity = match &material {
            CertificateMaterial::Pkcs12 { der, password } => {
                reqwest::Identity::from_pkcs12_der(der, password)
            }
            CertificateMaterial::Pem { certificate, key } => {
                reqwest::Identity::from_pkcs8_pem(certificate, key)
            }
        }
        .map_err(|e| CredentialError::Certificate(error_chain(&e)))?;

        Ok(Self {
            material,
            tls_identity,
            identity,
        })
    }
}

fn parse_pem(bytes: &[u8]) -> std::result::Result<Vec<pem::Pem>, CredentialError> {
    pem::parse_many(bytes).map_err(|e| CredentialError::Certificate(format!("malformed PEM: {e}")))
}

/// Render an error with its sources, `outer: inner: root`
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Signing algorithms APNs accepts for provider tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigningAlgorithm {
    #[default]
    ES256,
    ES384,
}

impl From<SigningAlgorithm> for Algorithm {
    fn from(alg: SigningAlgorithm) -> Self {
        match alg {
            SigningAlgorithm::ES256 => Algorithm::ES256,
            SigningAlgorithm::ES384 => Algorithm::ES384,
        }
    }
}

#[derive(Debug, Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    issued_at: DateTime<Utc>,
}

pub struct TokenCredentials {
    signing_key: EncodingKey,
    key_id: String,
    team_id: String,
    algorithm: SigningAlgorithm,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
    cached: RwLock<Option<CachedToken>>,
    identity: String,
}

impl fmt::Debug for TokenCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCredentials")
            .field("key_id", &self.key_id)
            .field("team_id", &self.team_id)
            .field("algorithm", &self.algorithm)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenCredentials {
    /// Create token credentials from a PKCS#8 EC signing key (`AuthKey_XXXX.p8`)
    pub fn new(
        signing_key_pem: &[u8],
        key_id: impl Into<String>,
        team_id: impl Into<String>,
    ) -> std::result::Result<Self, CredentialError> {
        let signing_key = EncodingKey::from_ec_pem(signing_key_pem)
            .map_err(|e| CredentialError::KeyParse(e.to_string()))?;
        let key_id = key_id.into();
        let team_id = team_id.into();
        let identity = format!(
            "token:{}:{}:{}",
            team_id,
            key_id,
            fingerprint(&[signing_key_pem])
        );

        Ok(Self {
            signing_key,
            key_id,
            team_id,
            algorithm: SigningAlgorithm::default(),
            lifetime: DEFAULT_TOKEN_LIFETIME,
            clock: Arc::new(SystemClock),
            cached: RwLock::new(None),
            identity,
        })
    }

    pub fn with_algorithm(mut self, algorithm: SigningAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Age after which the cached token is regenerated
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    /// Return the cached provider token, signing a new one if it is missing or stale
    pub fn bearer_token(&self) -> std::result::Result<String, CredentialError> {
        {
            let cached = self.cached.read();
            if let Some(token) = cached.as_ref().filter(|t| !self.is_stale(t)) {
                return Ok(token.token.clone());
            }
        }

        let mut cached = self.cached.write();
        // Another caller may have refreshed while we waited for the lock
        if let Some(token) = cached.as_ref().filter(|t| !self.is_stale(t)) {
            return Ok(token.token.clone());
        }

        let issued_at = self.clock.now();
        let token = self.sign(issued_at)?;
        debug!(
            "Generated APNs provider token (key_id={}, team_id={})",
            self.key_id, self.team_id
        );
        *cached = Some(CachedToken {
            token: token.clone(),
            issued_at,
        });
        Ok(token)
    }

    /// Drop the cached token so the next call signs a fresh one
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    /// Drop the cached token only if it is still `token`.
    ///
    /// Returns false when another caller already replaced it, so a late
    /// rejection of an old token never discards its successor.
    pub fn invalidate_if(&self, token: &str) -> bool {
        let mut cached = self.cached.write();
        if cached.as_ref().is_some_and(|current| current.token == token) {
            *cached = None;
            true
        } else {
            false
        }
    }

    pub fn has_fresh_token(&self) -> bool {
        self.cached
            .read()
            .as_ref()
            .map(|t| !self.is_stale(t))
            .unwrap_or(false)
    }

    fn is_stale(&self, token: &CachedToken) -> bool {
        self.clock
            .now()
            .signed_duration_since(token.issued_at)
            .to_std()
            .map(|age| age > self.lifetime)
            .unwrap_or(false)
    }

    fn sign(&self, issued_at: DateTime<Utc>) -> std::result::Result<String, CredentialError> {
        let mut header = Header::new(self.algorithm.into());
        header.kid = Some(self.key_id.clone());

        let claims = ProviderClaims {
            iss: &self.team_id,
            iat: issued_at.timestamp(),
        };

        encode(&header, &claims, &self.signing_key)
            .map_err(|e| CredentialError::Signing(e.to_string()))
    }
}

/// APNs credentials: the closed set of authentication forms
#[derive(Debug)]
pub enum Credentials {
    Certificate(CertificateCredentials),
    Token(TokenCredentials),
}

impl Credentials {
    /// Load a client certificate from a `.p12` archive or a PEM bundle.
    ///
    /// `chain_path` names a PEM file of intermediate certificates appended
    /// to a PEM identity; PKCS#12 archives carry their own chain.
    pub fn certificate_from_file(
        path: impl AsRef<Path>,
        password: Option<&str>,
        chain_path: Option<&Path>,
    ) -> Result<Self> {
        let bytes = read_file(path.as_ref())?;
        let mut credentials = if bytes.windows(10).any(|w| w == b"-----BEGIN") {
            CertificateCredentials::from_pem(&bytes)?
        } else {
            CertificateCredentials::from_pkcs12(bytes, password)?
        };
        if let Some(chain_path) = chain_path {
            credentials = credentials.with_chain(&read_file(chain_path)?)?;
        }
        Ok(Credentials::Certificate(credentials))
    }

    /// Load a provider signing key (`.p8`)
    pub fn token_from_file(path: impl AsRef<Path>, key_id: &str, team_id: &str) -> Result<Self> {
        let pem = read_file(path.as_ref())?;
        Ok(Credentials::Token(TokenCredentials::new(&pem, key_id, team_id)?))
    }

    /// Produce the authentication to attach to the next requests
    pub fn auth_context(&self) -> std::result::Result<AuthContext, CredentialError> {
        match self {
            Credentials::Certificate(_) => Ok(AuthContext::ClientCertificate),
            Credentials::Token(token) => token.bearer_token().map(AuthContext::Bearer),
        }
    }

    /// Stable identifier used to key connections
    pub fn identity(&self) -> &str {
        match self {
            Credentials::Certificate(cert) => &cert.identity,
            Credentials::Token(token) => &token.identity,
        }
    }

    /// Whether the credential can authenticate without regenerating anything
    pub fn is_valid(&self) -> bool {
        match self {
            Credentials::Certificate(_) => true,
            Credentials::Token(token) => token.has_fresh_token(),
        }
    }

    /// Discard cached auth state unconditionally
    pub fn invalidate(&self) {
        if let Credentials::Token(token) = self {
            token.invalidate();
        }
    }

    /// Discard the cached token after APNs rejected the request signed with `auth`.
    ///
    /// A token regenerated since `auth` was issued is kept. Returns whether
    /// anything was discarded.
    pub fn invalidate_rejected(&self, auth: &AuthContext) -> bool {
        match (self, auth) {
            (Credentials::Token(token), AuthContext::Bearer(rejected)) => {
                token.invalidate_if(rejected)
            }
            _ => false,
        }
    }

    pub fn client_certificate(&self) -> Option<&CertificateCredentials> {
        match self {
            Credentials::Certificate(cert) => Some(cert),
            Credentials::Token(_) => None,
        }
    }
}

impl From<CertificateCredentials> for Credentials {
    fn from(value: CertificateCredentials) -> Self {
        Credentials::Certificate(value)
    }
}

impl From<TokenCredentials> for Credentials {
    fn from(value: TokenCredentials) -> Self {
        Credentials::Token(value)
    }
}

fn read_file(path: &Path) -> std::result::Result<Vec<u8>, CredentialError> {
    fs::read(path).map_err(|e| CredentialError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn fingerprint(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}
