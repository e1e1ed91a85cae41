/// Blocking adapter over [`ApnsClient`]
///
/// Runs the async client to completion on a runtime owned by the adapter,
/// so synchronous callers get the same results as async ones. Safe to call
/// from inside another Tokio runtime: the work is then driven from a scoped
/// helper thread instead of the caller's worker thread.
use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::config::{ApnsConfig, ClientConfig};
use crate::credentials::Credentials;
use crate::dispatch::{ApnsClient, BatchResults};
use crate::errors::{ApnsError, Result};
use crate::notification::Notification;
use crate::response::DispatchResult;

pub struct BlockingApnsClient {
    client: ApnsClient,
    runtime: Option<Runtime>,
}

impl BlockingApnsClient {
    pub fn new(credentials: Credentials, config: ClientConfig) -> Result<Self> {
        Self::with_client(ApnsClient::new(credentials, config))
    }

    pub fn from_config(config: &ApnsConfig) -> Result<Self> {
        Self::with_client(ApnsClient::from_config(config)?)
    }

    /// Wrap an already configured async client.
    ///
    /// Connections are opened lazily on the adapter's own runtime.
    pub fn with_client(client: ApnsClient) -> Result<Self> {
        Ok(Self {
            client,
            runtime: Some(build_runtime()?),
        })
    }

    pub fn client(&self) -> &ApnsClient {
        &self.client
    }

    pub fn send_one(&self, notification: Notification, topic: &str) -> Result<DispatchResult> {
        self.run(self.client.send_one(notification, topic))
    }

    pub fn send_batch(&self, notifications: Vec<Notification>, topic: &str) -> Result<BatchResults> {
        self.run(self.client.send_batch(notifications, topic))
    }

    fn run<T, F>(&self, future: F) -> Result<T>
    where
        T: Send,
        F: Future<Output = Result<T>> + Send,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| ApnsError::Runtime("runtime already shut down".into()))?;

        if Handle::try_current().is_err() {
            return runtime.block_on(future);
        }

        debug!("Blocking APNs call made from an async context, using a helper thread");
        std::thread::scope(|scope| {
            scope
                .spawn(|| runtime.block_on(future))
                .join()
                .map_err(|_| ApnsError::Runtime("APNs dispatch thread panicked".into()))?
        })
    }
}

impl Drop for BlockingApnsClient {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn build_runtime() -> Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("apns-dispatch")
        .enable_all()
        .build()
        .map_err(|e| ApnsError::Runtime(format!("failed to start runtime: {e}")))
}
