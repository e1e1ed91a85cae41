#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use apns_dispatch::{
    ApnsClient, ApnsRequest, ApnsResponse, ClientConfig, ConnectionError, Connector, Credentials,
    Notification, Payload, Target, TokenCredentials, Transport,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

pub const TOPIC: &str = "com.example.App";
const AUTH_KEY: &str = include_str!("../fixtures/auth_key.p8");

type Handler =
    Arc<dyn Fn(ApnsRequest) -> BoxFuture<'static, Result<ApnsResponse, ConnectionError>> + Send + Sync>;

/// Counters shared by every transport a [`FakeConnector`] hands out
#[derive(Debug, Default)]
pub struct TransportStats {
    pub connects: AtomicUsize,
    pub calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl TransportStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most requests observed in flight at the same time
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveGuard<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        ActiveGuard(self)
    }
}

struct ActiveGuard<'a>(&'a TransportStats);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector whose transports answer every request with `handler`
pub struct FakeConnector {
    handler: Handler,
    pub stats: Arc<TransportStats>,
}

impl FakeConnector {
    pub fn new<F, Fut>(handler: F) -> Arc<Self>
    where
        F: Fn(ApnsRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApnsResponse, ConnectionError>> + Send + 'static,
    {
        Arc::new(Self {
            handler: Arc::new(move |request| handler(request).boxed()),
            stats: Arc::new(TransportStats::default()),
        })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _target: &Target,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn Transport>, ConnectionError> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeTransport {
            handler: self.handler.clone(),
            stats: self.stats.clone(),
        }))
    }
}

struct FakeTransport {
    handler: Handler,
    stats: Arc<TransportStats>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: ApnsRequest) -> Result<ApnsResponse, ConnectionError> {
        let _active = self.stats.enter();
        (self.handler)(request).await
    }
}

pub fn credentials() -> Credentials {
    TokenCredentials::new(AUTH_KEY.as_bytes(), "1QBCDJ9RST", "3Z24IP123A")
        .expect("fixture key parses")
        .into()
}

pub fn client(connector: &Arc<FakeConnector>, config: ClientConfig) -> ApnsClient {
    ApnsClient::with_connector(credentials(), config, connector.clone())
}

/// Distinct, valid device token for `n`
pub fn token(n: u8) -> String {
    format!("{n:02x}").repeat(32)
}

pub fn alert(device_token: &str) -> Notification {
    Notification::new(device_token, &Payload::new().with_alert("Hello")).expect("valid notification")
}

pub fn ok() -> Result<ApnsResponse, ConnectionError> {
    Ok(ApnsResponse::new(200, Vec::new()))
}

pub fn reject(status: u16, body: &str) -> Result<ApnsResponse, ConnectionError> {
    Ok(ApnsResponse::new(status, body.as_bytes().to_vec()))
}
