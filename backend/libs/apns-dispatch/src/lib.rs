/// APNs Dispatch Library
///
/// HTTP/2 delivery client for the Apple Push Notification service (APNs).
///
/// It handles:
/// - Certificate and provider-token authentication, with token caching and refresh
/// - Payload building and request encoding with local size checks
/// - One multiplexed connection per endpoint, replaced when it fails
/// - Concurrent batch delivery with one typed result per notification
/// - A blocking adapter for synchronous callers
///
/// # Example: batch send with token auth
///
/// ```rust,no_run
/// use apns_dispatch::{ApnsClient, ClientConfig, Credentials, Endpoint, Notification, Payload};
///
/// #[tokio::main]
/// async fn main() -> apns_dispatch::Result<()> {
///     let credentials = Credentials::token_from_file("AuthKey_ABC123DEFG.p8", "ABC123DEFG", "DEF123GHIJ")?;
///     let client = ApnsClient::new(credentials, ClientConfig::new(Endpoint::Sandbox));
///
///     let payload = Payload::new().with_alert("Hello").with_badge(1);
///     let notifications = vec![Notification::new(
///         "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
///         &payload,
///     )?];
///
///     let results = client.send_batch(notifications, "com.example.App").await?;
///     for result in results {
///         println!("{} -> {:?}", result.device_token, result.result);
///     }
///     Ok(())
/// }
/// ```
pub mod blocking;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatch;
pub mod errors;
pub mod notification;
pub mod payload;
pub mod request;
pub mod response;
pub mod transport;

pub use blocking::BlockingApnsClient;
pub use config::{ApnsConfig, AuthConfig, ClientConfig, Endpoint};
pub use connection::{Connection, ConnectionManager};
pub use credentials::{
    AuthContext, CertificateCredentials, CertificateMaterial, Clock, Credentials,
    SigningAlgorithm, SystemClock, TokenCredentials,
};
pub use dispatch::{
    ApnsClient, ApnsPush, BatchResults, BatchStream, DynPushProvider, NotificationResult,
    PushProvider,
};
pub use errors::{ApnsError, ConnectionError, CredentialError, Result};
pub use notification::{DeviceToken, Notification, Priority, PushType};
pub use payload::{Alert, Payload, PayloadAlert};
pub use request::{encode_request, ApnsRequest};
pub use response::{map_response, DispatchResult, ErrorReason};
pub use transport::{ApnsResponse, Connector, ReqwestConnector, Target, Transport};
