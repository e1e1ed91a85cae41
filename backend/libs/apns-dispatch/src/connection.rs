/// Connection Manager
///
/// Owns at most one live multiplexed connection per [`Target`]. Connections
/// are shared by every in-flight send and replaced wholesale, never repaired:
/// a fatal transport error marks the connection dead, wakes every request
/// still waiting on it with `ConnectionError::Closed`, and the next
/// `get_connection` opens a fresh one.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::errors::ConnectionError;
use crate::request::ApnsRequest;
use crate::transport::{ApnsResponse, Connector, Target, Transport};

pub struct Connection {
    id: u64,
    target: Target,
    transport: Arc<dyn Transport>,
    streams: Arc<Semaphore>,
    max_streams: usize,
    in_flight: AtomicUsize,
    closed: watch::Sender<bool>,
}

impl Connection {
    fn new(id: u64, target: Target, transport: Arc<dyn Transport>, max_streams: usize) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            target,
            transport,
            streams: Arc::new(Semaphore::new(max_streams)),
            max_streams,
            in_flight: AtomicUsize::new(0),
            closed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Requests currently holding a stream on this connection
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Streams not currently in use
    pub fn available_streams(&self) -> usize {
        self.streams.available_permits()
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    /// Returns true if this call performed the transition to closed
    fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so an error cannot happen here
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("alive", &self.is_alive())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn track(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<Target, Arc<Connection>>>,
    connect_timeout: Duration,
    request_timeout: Duration,
    max_concurrent_streams: usize,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: &ClientConfig) -> Self {
        Self {
            connector,
            connections: Mutex::new(HashMap::new()),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            max_concurrent_streams: config.max_concurrent_streams.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Return the live connection for `target`, opening one if needed.
    ///
    /// The map lock is held while connecting so concurrent callers share a
    /// single new connection instead of racing to open several.
    pub async fn get_connection(
        &self,
        target: &Target,
        credentials: &Credentials,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.get(target) {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
            connections.remove(target);
        }

        let transport = timeout(self.connect_timeout, self.connector.connect(target, credentials))
            .await
            .map_err(|_| ConnectionError::Connect {
                target: target.authority(),
                message: format!("timed out after {:?}", self.connect_timeout),
            })??;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(Connection::new(
            id,
            target.clone(),
            transport,
            self.max_concurrent_streams,
        ));
        info!(
            "APNs connection {} established to {}",
            id,
            target.authority()
        );
        connections.insert(target.clone(), connection.clone());
        Ok(connection)
    }

    /// Send one request on `connection`.
    ///
    /// Waits for a free stream when the concurrency limit is reached. Fails
    /// with `ConnectionError::Closed` as soon as the connection is torn down,
    /// and with `ConnectionError::Timeout` when this request alone is slow.
    pub async fn send(
        &self,
        connection: &Arc<Connection>,
        request: ApnsRequest,
    ) -> Result<ApnsResponse, ConnectionError> {
        let permit = tokio::select! {
            biased;
            _ = connection.wait_closed() => {
                return Err(ConnectionError::Closed(
                    "connection closed before request was sent".into(),
                ));
            }
            permit = connection.streams.clone().acquire_owned() => {
                permit.map_err(|_| ConnectionError::Closed("stream limiter shut down".into()))?
            }
        };
        let _in_flight = InFlightGuard::track(&connection.in_flight);

        let outcome = tokio::select! {
            biased;
            result = timeout(self.request_timeout, connection.transport.send(request)) => {
                result.unwrap_or(Err(ConnectionError::Timeout(self.request_timeout)))
            }
            _ = connection.wait_closed() => Err(ConnectionError::Closed(
                "connection closed while request was in flight".into(),
            )),
        };
        drop(permit);

        if let Err(err) = &outcome {
            if err.is_fatal() {
                self.discard(connection, err).await;
            }
        }
        outcome
    }

    /// Mark `connection` dead and forget it if it is still the current one
    pub async fn discard(&self, connection: &Arc<Connection>, cause: &ConnectionError) {
        if connection.close() {
            warn!(
                "APNs connection {} to {} torn down: {}",
                connection.id,
                connection.target.authority(),
                cause
            );
        }

        let mut connections = self.connections.lock().await;
        let is_current = connections
            .get(&connection.target)
            .map(|current| Arc::ptr_eq(current, connection))
            .unwrap_or(false);
        if is_current {
            connections.remove(&connection.target);
        }
    }

    /// Close every connection; in-flight requests fail with `Closed`
    pub async fn close_all(&self) {
        let mut connections = self.connections.lock().await;
        for (_, connection) in connections.drain() {
            if connection.close() {
                info!("APNs connection {} closed", connection.id);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}
