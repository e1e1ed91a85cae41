/// Request encoding
///
/// Turns a notification plus topic and auth context into the HTTP/2 request
/// APNs expects. All validation happens here, before any connection is used.
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::credentials::AuthContext;
use crate::errors::{ApnsError, Result};
use crate::notification::{DeviceToken, Notification, PushType};

pub const COLLAPSE_ID_MAX_BYTES: usize = 64;

const APNS_TOPIC: HeaderName = HeaderName::from_static("apns-topic");
const APNS_PUSH_TYPE: HeaderName = HeaderName::from_static("apns-push-type");
const APNS_PRIORITY: HeaderName = HeaderName::from_static("apns-priority");
const APNS_EXPIRATION: HeaderName = HeaderName::from_static("apns-expiration");
const APNS_COLLAPSE_ID: HeaderName = HeaderName::from_static("apns-collapse-id");
const APNS_ID: HeaderName = HeaderName::from_static("apns-id");

/// Protocol request for one notification
#[derive(Debug, Clone)]
pub struct ApnsRequest {
    pub device_token: DeviceToken,
    /// `/3/device/{device_token}`
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Authentication the request was encoded with
    pub auth: AuthContext,
}

/// Explicit push type, else topic suffix, else payload content
pub fn resolve_push_type(notification: &Notification, topic: &str) -> PushType {
    notification
        .push_type()
        .or_else(|| PushType::from_topic(topic))
        .unwrap_or_else(|| notification.content_push_type())
}

pub fn encode_request(
    notification: &Notification,
    topic: &str,
    auth: &AuthContext,
) -> Result<ApnsRequest> {
    let push_type = resolve_push_type(notification, topic);

    let size = notification.payload().len();
    let limit = push_type.max_payload_size();
    if size > limit {
        return Err(ApnsError::PayloadTooLarge { size, limit });
    }

    let mut headers = HeaderMap::new();
    headers.insert(APNS_TOPIC, header_value("apns-topic", topic)?);
    headers.insert(APNS_PUSH_TYPE, HeaderValue::from_static(push_type.as_str()));
    headers.insert(
        APNS_PRIORITY,
        HeaderValue::from_static(notification.priority().as_str()),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(expiration) = notification.expiration() {
        headers.insert(APNS_EXPIRATION, HeaderValue::from(expiration.timestamp().max(0)));
    }

    if let Some(collapse_id) = notification.collapse_id() {
        if collapse_id.len() > COLLAPSE_ID_MAX_BYTES {
            return Err(ApnsError::InvalidHeader {
                header: "apns-collapse-id",
                message: format!(
                    "{} bytes exceeds limit of {}",
                    collapse_id.len(),
                    COLLAPSE_ID_MAX_BYTES
                ),
            });
        }
        headers.insert(APNS_COLLAPSE_ID, header_value("apns-collapse-id", collapse_id)?);
    }

    if let Some(apns_id) = notification.apns_id() {
        headers.insert(
            APNS_ID,
            header_value("apns-id", &apns_id.hyphenated().to_string())?,
        );
    }

    if let Some(authorization) = auth.authorization_header() {
        let mut value = header_value("authorization", &authorization)?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(ApnsRequest {
        device_token: notification.device_token().clone(),
        path: format!("/3/device/{}", notification.device_token()),
        headers,
        body: notification.payload().clone(),
        auth: auth.clone(),
    })
}

fn header_value(header: &'static str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ApnsError::InvalidHeader {
        header,
        message: e.to_string(),
    })
}
