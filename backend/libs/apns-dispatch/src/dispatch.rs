/// Dispatch Engine
///
/// Sends one notification or a batch over the shared connection for the
/// client's target. A batch is issued all at once: every request is handed
/// to the connection manager before any response is awaited, so the batch
/// is multiplexed over a single HTTP/2 connection.
///
/// Every submitted notification produces exactly one [`NotificationResult`],
/// including duplicates of the same device token. Per-notification failures
/// are values; only failures that prevent the batch from starting at all
/// (credential signing, connecting) are returned as `Err`.
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::{ApnsConfig, ClientConfig};
use crate::connection::{Connection, ConnectionManager};
use crate::credentials::Credentials;
use crate::errors::{ApnsError, Result};
use crate::notification::{DeviceToken, Notification};
use crate::payload::{Payload, PayloadAlert};
use crate::request::{encode_request, ApnsRequest};
use crate::response::{map_response, DispatchResult, ErrorReason};
use crate::transport::{Connector, ReqwestConnector, Target};

/// Outcome of one notification in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationResult {
    /// Position of the notification in the submitted batch
    pub index: usize,
    pub device_token: DeviceToken,
    pub result: DispatchResult,
}

/// Results of a batch, in submission order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResults {
    results: Vec<NotificationResult>,
}

impl BatchResults {
    fn from_unordered(mut results: Vec<NotificationResult>) -> Self {
        results.sort_by_key(|r| r.index);
        Self { results }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// First result recorded for `device_token`
    pub fn get(&self, device_token: &str) -> Option<&DispatchResult> {
        self.results
            .iter()
            .find(|r| r.device_token.as_str() == device_token)
            .map(|r| &r.result)
    }

    /// Every outcome per token; duplicate tokens keep all of theirs
    pub fn by_token(&self) -> HashMap<String, Vec<DispatchResult>> {
        let mut grouped: HashMap<String, Vec<DispatchResult>> = HashMap::new();
        for r in &self.results {
            grouped
                .entry(r.device_token.to_string())
                .or_default()
                .push(r.result.clone());
        }
        grouped
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.result.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.len() - self.success_count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NotificationResult> {
        self.results.iter()
    }
}

impl IntoIterator for BatchResults {
    type Item = NotificationResult;
    type IntoIter = std::vec::IntoIter<NotificationResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

/// In-flight requests of one batch, keyed by submission index
#[derive(Debug, Default)]
struct CorrelationTable {
    pending: HashMap<usize, DeviceToken>,
}

impl CorrelationTable {
    fn register(&mut self, index: usize, device_token: DeviceToken) {
        self.pending.insert(index, device_token);
    }

    fn resolve(&mut self, index: usize) -> Option<DeviceToken> {
        self.pending.remove(&index)
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Results of a batch in completion order
///
/// Dropping the stream abandons every request still in flight. Their stream
/// permits are released and the connection stays usable for later calls.
pub struct BatchStream<'a> {
    rejected: VecDeque<NotificationResult>,
    in_flight: FuturesUnordered<BoxFuture<'a, (usize, DispatchResult)>>,
    correlation: CorrelationTable,
}

impl BatchStream<'_> {
    fn empty() -> Self {
        Self {
            rejected: VecDeque::new(),
            in_flight: FuturesUnordered::new(),
            correlation: CorrelationTable::default(),
        }
    }

    /// Requests sent but not yet answered
    pub fn pending(&self) -> usize {
        self.correlation.len()
    }
}

impl Stream for BatchStream<'_> {
    type Item = NotificationResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(rejected) = this.rejected.pop_front() {
            return Poll::Ready(Some(rejected));
        }

        loop {
            match this.in_flight.poll_next_unpin(cx) {
                Poll::Ready(Some((index, result))) => match this.correlation.resolve(index) {
                    Some(device_token) => {
                        return Poll::Ready(Some(NotificationResult {
                            index,
                            device_token,
                            result,
                        }))
                    }
                    None => error!("APNs response for unknown batch index {}", index),
                },
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.rejected.len() + self.in_flight.len();
        (remaining, Some(remaining))
    }
}

/// Failure APNs itself would have answered for a request rejected locally
fn local_rejection(err: &ApnsError) -> DispatchResult {
    match err {
        ApnsError::PayloadTooLarge { .. } => {
            DispatchResult::rejected(413, ErrorReason::PayloadTooLarge)
        }
        ApnsError::InvalidHeader {
            header: "apns-collapse-id",
            ..
        } => DispatchResult::rejected(400, ErrorReason::BadCollapseId),
        ApnsError::InvalidHeader {
            header: "apns-topic",
            ..
        } => DispatchResult::rejected(400, ErrorReason::BadTopic),
        _ => DispatchResult::rejected(400, ErrorReason::Unknown),
    }
}

/// APNs delivery client
///
/// Owns its credentials and connection manager; several independently
/// configured clients can live in one process.
pub struct ApnsClient {
    credentials: Credentials,
    connections: ConnectionManager,
    config: ClientConfig,
}

impl ApnsClient {
    /// Client that connects to APNs over reqwest's HTTP/2 stack
    pub fn new(credentials: Credentials, config: ClientConfig) -> Self {
        let connector = Arc::new(ReqwestConnector::new(&config));
        Self::with_connector(credentials, config, connector)
    }

    pub fn with_connector(
        credentials: Credentials,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let connections = ConnectionManager::new(connector, &config);
        Self {
            credentials,
            connections,
            config,
        }
    }

    /// Load credentials named by `config` and build a client for its endpoint
    pub fn from_config(config: &ApnsConfig) -> Result<Self> {
        let credentials = config.load_credentials()?;
        info!(
            "Initialized APNs client for bundle_id={}, production={}",
            config.bundle_id, config.is_production
        );
        Ok(Self::new(credentials, config.client_config()))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Connection key for this client's endpoint and credential
    pub fn target(&self) -> Target {
        Target::new(
            self.config.host(),
            self.config.port(),
            self.credentials.identity(),
        )
    }

    /// Send a single notification.
    ///
    /// Returns `Err` when the notification cannot be encoded, when the
    /// credential cannot produce an auth context, or when no connection can
    /// be opened. Every response from APNs is an `Ok` result.
    pub async fn send_one(&self, notification: Notification, topic: &str) -> Result<DispatchResult> {
        let auth = self.credentials.auth_context()?;
        let request = encode_request(&notification, topic, &auth)?;
        let connection = self.connection().await?;
        Ok(self.deliver(connection, request).await)
    }

    /// Send every notification concurrently and wait for all results
    pub async fn send_batch(
        &self,
        notifications: Vec<Notification>,
        topic: &str,
    ) -> Result<BatchResults> {
        let total = notifications.len();
        let started = Instant::now();
        info!("Sending APNs batch of {} notifications to {}", total, topic);

        let stream = self.send_batch_stream(notifications, topic).await?;
        let results = BatchResults::from_unordered(stream.collect().await);

        info!(
            "APNs batch finished in {:?}: {} succeeded, {} failed",
            started.elapsed(),
            results.success_count(),
            results.failure_count()
        );
        Ok(results)
    }

    /// Issue every notification and yield each result as it arrives.
    ///
    /// Notifications rejected locally (oversized payload, invalid collapse-id)
    /// are yielded first with the failure APNs would have returned, and never
    /// reach the network.
    pub async fn send_batch_stream(
        &self,
        notifications: Vec<Notification>,
        topic: &str,
    ) -> Result<BatchStream<'_>> {
        if notifications.is_empty() {
            return Ok(BatchStream::empty());
        }

        let auth = self.credentials.auth_context()?;

        let mut stream = BatchStream::empty();
        let mut requests = Vec::with_capacity(notifications.len());
        for (index, notification) in notifications.iter().enumerate() {
            match encode_request(notification, topic, &auth) {
                Ok(request) => requests.push((index, request)),
                Err(err) => {
                    warn!(
                        "Rejected APNs notification for token {} before sending: {}",
                        notification.device_token().prefix(),
                        err
                    );
                    stream.rejected.push_back(NotificationResult {
                        index,
                        device_token: notification.device_token().clone(),
                        result: local_rejection(&err),
                    });
                }
            }
        }

        if requests.is_empty() {
            return Ok(stream);
        }

        let connection = self.connection().await?;
        for (index, request) in requests {
            stream
                .correlation
                .register(index, request.device_token.clone());
            let connection = connection.clone();
            stream.in_flight.push(
                async move { (index, self.deliver(connection, request).await) }.boxed(),
            );
        }

        debug!(
            "Issued {} APNs requests on connection {}",
            stream.pending(),
            connection.id()
        );
        Ok(stream)
    }

    /// Close the live connection; the next send opens a new one
    pub async fn close(&self) {
        self.connections.close_all().await;
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let target = self.target();
        let connection = self
            .connections
            .get_connection(&target, &self.credentials)
            .await?;
        Ok(connection)
    }

    async fn deliver(&self, connection: Arc<Connection>, request: ApnsRequest) -> DispatchResult {
        let device_token = request.device_token.clone();
        let auth = request.auth.clone();

        let result = match self.connections.send(&connection, request).await {
            Ok(response) => map_response(&response),
            Err(err) => DispatchResult::from(&err),
        };

        match &result {
            DispatchResult::Success { apns_id } => {
                debug!(
                    "APNs notification delivered to token {} (apns_id: {:?})",
                    device_token.prefix(),
                    apns_id
                );
            }
            DispatchResult::Failure {
                status, reason, ..
            } => {
                debug!(
                    "APNs rejected notification for token {}: {} {}",
                    device_token.prefix(),
                    status,
                    reason
                );
                if reason.is_provider_token_rejected() {
                    if self.credentials.invalidate_rejected(&auth) {
                        warn!("APNs rejected the provider token ({}), regenerating", reason);
                    } else {
                        debug!("APNs rejected a provider token that was already replaced");
                    }
                }
            }
            DispatchResult::ConnectionError { cause } => {
                debug!(
                    "APNs notification for token {} failed on connection: {}",
                    device_token.prefix(),
                    cause
                );
            }
        }

        result
    }
}

/// Trait for push notification providers
#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Sends an alert with `title`, `body` and an optional badge to one device
    async fn send(
        &self,
        device_token: String,
        title: String,
        body: String,
        badge: Option<u32>,
    ) -> Result<DispatchResult>;
}

pub type DynPushProvider = Box<dyn PushProvider>;

/// [`PushProvider`] bound to one app topic
#[derive(Clone)]
pub struct ApnsPush {
    client: Arc<ApnsClient>,
    topic: String,
}

impl ApnsPush {
    pub fn new(client: Arc<ApnsClient>, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }

    pub fn from_config(config: &ApnsConfig) -> Result<Self> {
        let client = ApnsClient::from_config(config)?;
        Ok(Self::new(Arc::new(client), config.bundle_id.clone()))
    }

    pub fn client(&self) -> &ApnsClient {
        &self.client
    }
}

#[async_trait]
impl PushProvider for ApnsPush {
    async fn send(
        &self,
        device_token: String,
        title: String,
        body: String,
        badge: Option<u32>,
    ) -> Result<DispatchResult> {
        let mut payload = Payload::new()
            .with_alert(PayloadAlert::new().title(title).body(body))
            .with_sound("default");
        if let Some(badge) = badge {
            payload = payload.with_badge(badge);
        }

        let notification = Notification::new(&device_token, &payload)?;
        self.client.send_one(notification, &self.topic).await
    }
}
