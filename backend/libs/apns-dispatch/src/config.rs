use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::credentials::Credentials;
use crate::errors::{ApnsError, Result};

pub const DEFAULT_PORT: u16 = 443;
pub const ALTERNATIVE_PORT: u16 = 2197;

/// Provider tokens are refreshed well before APNs rejects them at 60 minutes.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(2700);

/// APNs environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Production,
    Sandbox,
}

impl Endpoint {
    pub fn host(&self) -> &'static str {
        match self {
            Endpoint::Production => "api.push.apple.com",
            Endpoint::Sandbox => "api.sandbox.push.apple.com",
        }
    }
}

/// Connection and dispatch tuning for one client instance
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub use_alternative_port: bool,
    /// Applies once per new connection
    pub connect_timeout: Duration,
    /// Applies independently to every in-flight request
    pub request_timeout: Duration,
    /// Requests beyond this limit queue until a stream frees up
    pub max_concurrent_streams: usize,
    /// Optional `host:port` of an HTTP CONNECT proxy
    pub proxy: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Production,
            use_alternative_port: false,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_concurrent_streams: 1000,
            proxy: None,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    pub fn with_alternative_port(mut self, enabled: bool) -> Self {
        self.use_alternative_port = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_streams(mut self, limit: usize) -> Self {
        self.max_concurrent_streams = limit.max(1);
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn host(&self) -> &'static str {
        self.endpoint.host()
    }

    pub fn port(&self) -> u16 {
        if self.use_alternative_port {
            ALTERNATIVE_PORT
        } else {
            DEFAULT_PORT
        }
    }
}

/// How the client authenticates with APNs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    Certificate {
        certificate_path: String,
        certificate_passphrase: Option<String>,
        /// PEM intermediates appended to a PEM identity
        certificate_chain_path: Option<String>,
    },
    Token {
        key_path: String,
        key_id: String,
        team_id: String,
    },
}

/// APNs Configuration
#[derive(Debug, Clone)]
pub struct ApnsConfig {
    pub auth: AuthConfig,
    pub bundle_id: String,
    pub is_production: bool,
    pub use_alternative_port: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_concurrent_streams: usize,
    pub proxy: Option<String>,
}

impl ApnsConfig {
    /// Create certificate-based configuration
    pub fn certificate(certificate_path: String, bundle_id: String, is_production: bool) -> Self {
        Self::with_auth(
            AuthConfig::Certificate {
                certificate_path,
                certificate_passphrase: None,
                certificate_chain_path: None,
            },
            bundle_id,
            is_production,
        )
    }

    /// Create token-based configuration
    pub fn token(
        key_path: String,
        key_id: String,
        team_id: String,
        bundle_id: String,
        is_production: bool,
    ) -> Self {
        Self::with_auth(
            AuthConfig::Token {
                key_path,
                key_id,
                team_id,
            },
            bundle_id,
            is_production,
        )
    }

    fn with_auth(auth: AuthConfig, bundle_id: String, is_production: bool) -> Self {
        let defaults = ClientConfig::default();
        Self {
            auth,
            bundle_id,
            is_production,
            use_alternative_port: defaults.use_alternative_port,
            connect_timeout: defaults.connect_timeout,
            request_timeout: defaults.request_timeout,
            max_concurrent_streams: defaults.max_concurrent_streams,
            proxy: None,
        }
    }

    /// Set certificate passphrase (ignored for token auth)
    pub fn with_passphrase(mut self, passphrase: String) -> Self {
        if let AuthConfig::Certificate {
            certificate_passphrase,
            ..
        } = &mut self.auth
        {
            *certificate_passphrase = Some(passphrase);
        }
        self
    }

    /// Set the intermediate certificate file (ignored for token auth)
    pub fn with_chain_path(mut self, chain_path: String) -> Self {
        if let AuthConfig::Certificate {
            certificate_chain_path,
            ..
        } = &mut self.auth
        {
            *certificate_chain_path = Some(chain_path);
        }
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        if self.is_production {
            Endpoint::Production
        } else {
            Endpoint::Sandbox
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.endpoint())
            .with_alternative_port(self.use_alternative_port)
            .with_connect_timeout(self.connect_timeout)
            .with_request_timeout(self.request_timeout)
            .with_max_concurrent_streams(self.max_concurrent_streams);
        if let Some(proxy) = &self.proxy {
            config = config.with_proxy(proxy.clone());
        }
        config
    }

    /// Read the credential files named by this configuration
    pub fn load_credentials(&self) -> Result<Credentials> {
        match &self.auth {
            AuthConfig::Certificate {
                certificate_path,
                certificate_passphrase,
                certificate_chain_path,
            } => Credentials::certificate_from_file(
                certificate_path,
                certificate_passphrase.as_deref(),
                certificate_chain_path.as_deref().map(Path::new),
            ),
            AuthConfig::Token {
                key_path,
                key_id,
                team_id,
            } => Credentials::token_from_file(key_path, key_id, team_id),
        }
    }

    /// Load configuration from the process environment (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bundle_id = non_empty("APNS_BUNDLE_ID")
            .ok_or_else(|| ApnsError::Config("APNS_BUNDLE_ID missing".into()))?;

        let auth = match (
            non_empty("APNS_KEY_PATH"),
            non_empty("APNS_KEY_ID"),
            non_empty("APNS_TEAM_ID"),
        ) {
            (Some(key_path), Some(key_id), Some(team_id)) => AuthConfig::Token {
                key_path,
                key_id,
                team_id,
            },
            (Some(_), _, _) => {
                return Err(ApnsError::Config(
                    "APNS_KEY_PATH requires APNS_KEY_ID and APNS_TEAM_ID".into(),
                ))
            }
            _ => match non_empty("APNS_CERTIFICATE_PATH") {
                Some(certificate_path) => AuthConfig::Certificate {
                    certificate_path,
                    certificate_passphrase: lookup("APNS_CERTIFICATE_PASSPHRASE"),
                    certificate_chain_path: non_empty("APNS_CERTIFICATE_CHAIN_PATH"),
                },
                None => {
                    return Err(ApnsError::Config(
                        "either APNS_KEY_PATH or APNS_CERTIFICATE_PATH must be set".into(),
                    ))
                }
            },
        };

        let flag = |key: &str| {
            non_empty(key)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false)
        };

        let defaults = ClientConfig::default();

        Ok(Self {
            auth,
            bundle_id,
            is_production: flag("APNS_IS_PRODUCTION"),
            use_alternative_port: flag("APNS_USE_ALTERNATIVE_PORT"),
            connect_timeout: parse_or(&non_empty, "APNS_CONNECT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            request_timeout: parse_or(&non_empty, "APNS_REQUEST_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_concurrent_streams: parse_or(&non_empty, "APNS_MAX_CONCURRENT_STREAMS")?
                .unwrap_or(defaults.max_concurrent_streams),
            proxy: non_empty("APNS_PROXY"),
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ApnsError::Config(format!("{key} has invalid value {raw:?}")))
        })
        .transpose()
}
