/// Result Mapper
///
/// Interprets an APNs status code and JSON error body as one typed outcome.
/// Mapping is total: any (status, body) pair yields a `DispatchResult`.
use serde::Deserialize;
use serde_json::Value;

use crate::errors::ConnectionError;
use crate::transport::ApnsResponse;

/// `reason` values returned by APNs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    BadCollapseId,
    BadDeviceToken,
    BadExpirationDate,
    BadMessageId,
    BadPriority,
    BadTopic,
    DeviceTokenNotForTopic,
    DuplicateHeaders,
    IdleTimeout,
    InvalidPushType,
    MissingDeviceToken,
    MissingTopic,
    PayloadEmpty,
    TopicDisallowed,
    BadCertificate,
    BadCertificateEnvironment,
    ExpiredProviderToken,
    Forbidden,
    InvalidProviderToken,
    MissingProviderToken,
    UnrelatedKeyIdInToken,
    BadEnvironmentKeyInToken,
    BadPath,
    MethodNotAllowed,
    ExpiredToken,
    Unregistered,
    PayloadTooLarge,
    TooManyProviderTokenUpdates,
    TooManyRequests,
    InternalServerError,
    ServiceUnavailable,
    Shutdown,
    /// Missing or unparseable error body
    Unknown,
    /// Well-formed reason this client does not know yet
    Other(String),
}

impl ErrorReason {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorReason::BadCollapseId => "BadCollapseId",
            ErrorReason::BadDeviceToken => "BadDeviceToken",
            ErrorReason::BadExpirationDate => "BadExpirationDate",
            ErrorReason::BadMessageId => "BadMessageId",
            ErrorReason::BadPriority => "BadPriority",
            ErrorReason::BadTopic => "BadTopic",
            ErrorReason::DeviceTokenNotForTopic => "DeviceTokenNotForTopic",
            ErrorReason::DuplicateHeaders => "DuplicateHeaders",
            ErrorReason::IdleTimeout => "IdleTimeout",
            ErrorReason::InvalidPushType => "InvalidPushType",
            ErrorReason::MissingDeviceToken => "MissingDeviceToken",
            ErrorReason::MissingTopic => "MissingTopic",
            ErrorReason::PayloadEmpty => "PayloadEmpty",
            ErrorReason::TopicDisallowed => "TopicDisallowed",
            ErrorReason::BadCertificate => "BadCertificate",
            ErrorReason::BadCertificateEnvironment => "BadCertificateEnvironment",
            ErrorReason::ExpiredProviderToken => "ExpiredProviderToken",
            ErrorReason::Forbidden => "Forbidden",
            ErrorReason::InvalidProviderToken => "InvalidProviderToken",
            ErrorReason::MissingProviderToken => "MissingProviderToken",
            ErrorReason::UnrelatedKeyIdInToken => "UnrelatedKeyIdInToken",
            ErrorReason::BadEnvironmentKeyInToken => "BadEnvironmentKeyInToken",
            ErrorReason::BadPath => "BadPath",
            ErrorReason::MethodNotAllowed => "MethodNotAllowed",
            ErrorReason::ExpiredToken => "ExpiredToken",
            ErrorReason::Unregistered => "Unregistered",
            ErrorReason::PayloadTooLarge => "PayloadTooLarge",
            ErrorReason::TooManyProviderTokenUpdates => "TooManyProviderTokenUpdates",
            ErrorReason::TooManyRequests => "TooManyRequests",
            ErrorReason::InternalServerError => "InternalServerError",
            ErrorReason::ServiceUnavailable => "ServiceUnavailable",
            ErrorReason::Shutdown => "Shutdown",
            ErrorReason::Unknown => "Unknown",
            ErrorReason::Other(reason) => reason,
        }
    }

    /// The device token should be dropped by the caller
    pub fn is_token_invalid(&self) -> bool {
        matches!(
            self,
            ErrorReason::BadDeviceToken
                | ErrorReason::Unregistered
                | ErrorReason::DeviceTokenNotForTopic
                | ErrorReason::ExpiredToken
        )
    }

    /// The provider token was rejected and must be regenerated
    pub fn is_provider_token_rejected(&self) -> bool {
        matches!(
            self,
            ErrorReason::ExpiredProviderToken | ErrorReason::InvalidProviderToken
        )
    }

    /// Transient service-side condition; sending again later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorReason::TooManyRequests
                | ErrorReason::InternalServerError
                | ErrorReason::ServiceUnavailable
                | ErrorReason::Shutdown
                | ErrorReason::IdleTimeout
        )
    }
}

impl From<&str> for ErrorReason {
    fn from(reason: &str) -> Self {
        match reason {
            "BadCollapseId" => ErrorReason::BadCollapseId,
            "BadDeviceToken" => ErrorReason::BadDeviceToken,
            "BadExpirationDate" => ErrorReason::BadExpirationDate,
            "BadMessageId" => ErrorReason::BadMessageId,
            "BadPriority" => ErrorReason::BadPriority,
            "BadTopic" => ErrorReason::BadTopic,
            "DeviceTokenNotForTopic" => ErrorReason::DeviceTokenNotForTopic,
            "DuplicateHeaders" => ErrorReason::DuplicateHeaders,
            "IdleTimeout" => ErrorReason::IdleTimeout,
            "InvalidPushType" => ErrorReason::InvalidPushType,
            "MissingDeviceToken" => ErrorReason::MissingDeviceToken,
            "MissingTopic" => ErrorReason::MissingTopic,
            "PayloadEmpty" => ErrorReason::PayloadEmpty,
            "TopicDisallowed" => ErrorReason::TopicDisallowed,
            "BadCertificate" => ErrorReason::BadCertificate,
            "BadCertificateEnvironment" => ErrorReason::BadCertificateEnvironment,
            "ExpiredProviderToken" => ErrorReason::ExpiredProviderToken,
            "Forbidden" => ErrorReason::Forbidden,
            "InvalidProviderToken" => ErrorReason::InvalidProviderToken,
            "MissingProviderToken" => ErrorReason::MissingProviderToken,
            "UnrelatedKeyIdInToken" => ErrorReason::UnrelatedKeyIdInToken,
            "BadEnvironmentKeyInToken" => ErrorReason::BadEnvironmentKeyInToken,
            "BadPath" => ErrorReason::BadPath,
            "MethodNotAllowed" => ErrorReason::MethodNotAllowed,
            "ExpiredToken" => ErrorReason::ExpiredToken,
            "Unregistered" => ErrorReason::Unregistered,
            "PayloadTooLarge" => ErrorReason::PayloadTooLarge,
            "TooManyProviderTokenUpdates" => ErrorReason::TooManyProviderTokenUpdates,
            "TooManyRequests" => ErrorReason::TooManyRequests,
            "InternalServerError" => ErrorReason::InternalServerError,
            "ServiceUnavailable" => ErrorReason::ServiceUnavailable,
            "Shutdown" => ErrorReason::Shutdown,
            "Unknown" => ErrorReason::Unknown,
            other => ErrorReason::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one notification, produced exactly once per submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Success {
        apns_id: Option<String>,
    },
    Failure {
        status: u16,
        reason: ErrorReason,
        /// When APNs learned the token was no longer valid (`Unregistered`)
        timestamp: Option<i64>,
    },
    ConnectionError {
        cause: String,
    },
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchResult::Success { .. })
    }

    pub fn reason(&self) -> Option<&ErrorReason> {
        match self {
            DispatchResult::Failure { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Failure detected before the request left the client
    pub(crate) fn rejected(status: u16, reason: ErrorReason) -> Self {
        DispatchResult::Failure {
            status,
            reason,
            timestamp: None,
        }
    }
}

impl From<&ConnectionError> for DispatchResult {
    fn from(err: &ConnectionError) -> Self {
        DispatchResult::ConnectionError {
            cause: err.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    reason: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Map a raw APNs response into a `DispatchResult`
pub fn map_response(response: &ApnsResponse) -> DispatchResult {
    if response.status == 200 {
        return DispatchResult::Success {
            apns_id: response.apns_id.clone(),
        };
    }

    let Ok(body) = serde_json::from_slice::<ErrorBody>(&response.body) else {
        return DispatchResult::rejected(response.status, ErrorReason::Unknown);
    };

    let reason = match body.reason.as_deref() {
        Some(reason) => ErrorReason::from(reason),
        None if response.status == 410 => ErrorReason::Unregistered,
        None => ErrorReason::Unknown,
    };

    let timestamp = if reason == ErrorReason::Unregistered || response.status == 410 {
        body.timestamp.as_ref().and_then(parse_timestamp)
    } else {
        None
    };

    DispatchResult::Failure {
        status: response.status,
        reason,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn respond(status: u16, body: &str) -> DispatchResult {
        map_response(&ApnsResponse::new(status, body.as_bytes().to_vec()))
    }

    #[test]
    fn test_success() {
        assert_eq!(respond(200, ""), DispatchResult::Success { apns_id: None });

        let mut response = ApnsResponse::new(200, Vec::new());
        response.apns_id = Some("EC1BF194-B3B2-424A-89A9-5A918A6E6B5D".into());
        assert_eq!(
            map_response(&response),
            DispatchResult::Success {
                apns_id: Some("EC1BF194-B3B2-424A-89A9-5A918A6E6B5D".into())
            }
        );
    }

    #[test]
    fn test_bad_device_token() {
        assert_eq!(
            respond(400, r#"{"reason":"BadDeviceToken"}"#),
            DispatchResult::Failure {
                status: 400,
                reason: ErrorReason::BadDeviceToken,
                timestamp: None,
            }
        );
    }

    #[test]
    fn test_unregistered_with_timestamp() {
        assert_eq!(
            respond(410, r#"{"reason":"Unregistered","timestamp":1700000000}"#),
            DispatchResult::Failure {
                status: 410,
                reason: ErrorReason::Unregistered,
                timestamp: Some(1_700_000_000),
            }
        );
        // 410 without a reason still means the token is gone
        assert_eq!(
            respond(410, r#"{"timestamp":"1700000000"}"#),
            DispatchResult::Failure {
                status: 410,
                reason: ErrorReason::Unregistered,
                timestamp: Some(1_700_000_000),
            }
        );
    }

    #[test]
    fn test_timestamp_ignored_for_other_reasons() {
        assert_eq!(
            respond(400, r#"{"reason":"TopicDisallowed","timestamp":1700000000}"#),
            DispatchResult::Failure {
                status: 400,
                reason: ErrorReason::TopicDisallowed,
                timestamp: None,
            }
        );
    }

    #[test]
    fn test_malformed_or_missing_body() {
        let unknown = |status| DispatchResult::Failure {
            status,
            reason: ErrorReason::Unknown,
            timestamp: None,
        };
        assert_eq!(respond(500, ""), unknown(500));
        assert_eq!(respond(503, "<html>busy</html>"), unknown(503));
        assert_eq!(respond(400, r#"{"reason":42}"#), unknown(400));
        assert_eq!(respond(400, "{}"), unknown(400));
        assert_eq!(respond(204, ""), unknown(204));
    }

    #[test]
    fn test_unknown_reason_is_forward_compatible() {
        let result = respond(400, r#"{"reason":"SomeFutureReason"}"#);
        assert_eq!(
            result.reason(),
            Some(&ErrorReason::Other("SomeFutureReason".into()))
        );
        assert_eq!(result.reason().unwrap().as_str(), "SomeFutureReason");
    }

    #[test]
    fn test_mapping_is_idempotent() {
        let response = ApnsResponse::new(
            410,
            br#"{"reason":"Unregistered","timestamp":1700000000}"#.to_vec(),
        );
        assert_eq!(map_response(&response), map_response(&response));
    }

    #[test]
    fn test_reason_round_trip_and_classification() {
        for name in ["BadDeviceToken", "PayloadTooLarge", "TooManyRequests", "Shutdown"] {
            assert_eq!(ErrorReason::from(name).as_str(), name);
        }
        assert!(ErrorReason::Unregistered.is_token_invalid());
        assert!(!ErrorReason::TooManyRequests.is_token_invalid());
        assert!(ErrorReason::ServiceUnavailable.is_retryable());
        assert!(ErrorReason::ExpiredProviderToken.is_provider_token_rejected());
        assert!(!ErrorReason::BadTopic.is_provider_token_rejected());
    }

    #[test]
    fn test_connection_error_conversion() {
        let result = DispatchResult::from(&ConnectionError::Closed("GOAWAY".into()));
        assert_eq!(
            result,
            DispatchResult::ConnectionError {
                cause: "Connection closed: GOAWAY".into()
            }
        );
        assert!(!result.is_success());
    }
}
