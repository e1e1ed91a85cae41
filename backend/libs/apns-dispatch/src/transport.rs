/// HTTP/2 transport seam
///
/// The dispatch core talks to APNs through two traits:
/// - [`Connector`] opens one multiplexed connection for a target
/// - [`Transport`] sends a request on that connection and returns the response
///
/// [`ReqwestConnector`] is the production implementation; tests plug in fakes.
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::errors::ConnectionError;
use crate::request::ApnsRequest;

/// Connection key: one live connection per (host, port, credential)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub credential_id: String,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16, credential_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            credential_id: credential_id.into(),
        }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Raw APNs response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApnsResponse {
    pub status: u16,
    /// `apns-id` response header
    pub apns_id: Option<String>,
    pub body: Bytes,
}

impl ApnsResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            apns_id: None,
            body: body.into(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request; many calls may be outstanding at once
    async fn send(&self, request: ApnsRequest) -> Result<ApnsResponse, ConnectionError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &Target,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Transport>, ConnectionError>;
}

/// Opens HTTP/2 connections with reqwest
#[derive(Debug, Clone)]
pub struct ReqwestConnector {
    connect_timeout: Duration,
    proxy: Option<String>,
}

impl ReqwestConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            proxy: config.proxy.clone(),
        }
    }
}

#[async_trait]
impl Connector for ReqwestConnector {
    async fn connect(
        &self,
        target: &Target,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Transport>, ConnectionError> {
        let connect_error = |message: String| ConnectionError::Connect {
            target: target.authority(),
            message,
        };

        let mut builder = reqwest::Client::builder()
            .use_native_tls()
            .http2_prior_knowledge()
            .http2_keep_alive_interval(Duration::from_secs(60))
            .http2_keep_alive_while_idle(true)
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(Duration::from_secs(600));

        // Parsed when the credentials were loaded, so this cannot fail here
        if let Some(certificate) = credentials.client_certificate() {
            builder = builder.identity(certificate.tls_identity().clone());
        }

        if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(format!("http://{proxy}"))
                .map_err(|e| connect_error(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| connect_error(e.to_string()))?;

        info!("Opened APNs HTTP/2 client for {}", target.authority());

        Ok(Arc::new(ReqwestTransport {
            client,
            base_url: format!("https://{}", target.authority()),
            authority: target.authority(),
        }))
    }
}

/// One reqwest client per target.
///
/// reqwest's pool keeps a single HTTP/2 connection underneath and redials it
/// on its own after a GOAWAY, so stream-level refusals stay `Request` errors
/// for that request alone. A dropped socket or a closed connection is
/// reported as `Closed` and the manager replaces the whole client.
struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    authority: String,
}

impl ReqwestTransport {
    fn classify(&self, err: reqwest::Error) -> ConnectionError {
        if err.is_connect() {
            ConnectionError::Connect {
                target: self.authority.clone(),
                message: err.to_string(),
            }
        } else if is_connection_lost(&err) {
            ConnectionError::Closed(err.to_string())
        } else {
            ConnectionError::Request(err.to_string())
        }
    }
}

/// Whether `err`, or anything in its source chain, means the connection is gone
fn is_connection_lost(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            if hyper_err.is_closed() || hyper_err.is_canceled() || hyper_err.is_incomplete_message()
            {
                return true;
            }
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        current = err.source();
    }
    false
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: ApnsRequest) -> Result<ApnsResponse, ConnectionError> {
        let url = format!("{}{}", self.base_url, request.path);

        let response = self
            .client
            .post(&url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let apns_id = response
            .headers()
            .get("apns-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        debug!(
            "APNs responded {} for token {} (apns_id: {:?})",
            status,
            request.device_token.prefix(),
            apns_id
        );

        Ok(ApnsResponse {
            status,
            apns_id,
            body,
        })
    }
}
