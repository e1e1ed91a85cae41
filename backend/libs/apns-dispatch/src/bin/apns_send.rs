use std::env;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use apns_dispatch::{ApnsClient, ApnsConfig, DispatchResult, Notification, Payload};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Send one alert to every device token given on the command line.
///
/// Configuration comes from `APNS_*` environment variables (and `.env`);
/// the alert text is read from `APNS_MESSAGE`.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let tokens: Vec<String> = env::args().skip(1).collect();
    if tokens.is_empty() {
        bail!("usage: apns-send <device-token>...");
    }

    let config = ApnsConfig::from_env().context("failed to load APNs configuration")?;
    let message = env::var("APNS_MESSAGE").unwrap_or_else(|_| "Hello".to_string());
    let payload = Payload::new().with_alert(message).with_sound("default");

    let notifications = tokens
        .iter()
        .map(|token| Notification::new(token, &payload))
        .collect::<apns_dispatch::Result<Vec<_>>>()
        .context("invalid device token")?;

    let client = ApnsClient::from_config(&config)?;
    let results = client.send_batch(notifications, &config.bundle_id).await?;

    for item in results.iter() {
        match &item.result {
            DispatchResult::Success { apns_id } => {
                tracing::info!("{}: delivered (apns_id: {:?})", item.device_token, apns_id)
            }
            DispatchResult::Failure {
                status,
                reason,
                timestamp,
            } => tracing::error!(
                "{}: rejected with {} {} (timestamp: {:?})",
                item.device_token,
                status,
                reason,
                timestamp
            ),
            DispatchResult::ConnectionError { cause } => {
                tracing::error!("{}: connection error: {}", item.device_token, cause)
            }
        }
    }

    client.close().await;

    if results.failure_count() > 0 {
        tracing::warn!(
            "{} of {} notifications failed",
            results.failure_count(),
            results.len()
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
