use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{ApnsError, Result};
use crate::payload::{Payload, MAX_PAYLOAD_SIZE, MAX_VOIP_PAYLOAD_SIZE};

const DEVICE_TOKEN_LEN: usize = 64;

/// Hex-encoded APNs device token
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceToken(String);

impl DeviceToken {
    /// Validate token format: 64 hexadecimal characters
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.len() != DEVICE_TOKEN_LEN {
            return Err(ApnsError::InvalidDeviceToken(format!(
                "expected {} chars, got {}",
                DEVICE_TOKEN_LEN,
                token.len()
            )));
        }
        if !token.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ApnsError::InvalidDeviceToken(
                "token must be hexadecimal".to_string(),
            ));
        }
        Ok(Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, safe to log
    pub fn prefix(&self) -> &str {
        &self.0[..8]
    }
}

impl FromStr for DeviceToken {
    type Err = ApnsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Value of the `apns-push-type` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushType {
    Alert,
    Background,
    Location,
    VoIP,
    Complication,
    FileProvider,
    MDM,
    LiveActivity,
    PushToTalk,
}

impl PushType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushType::Alert => "alert",
            PushType::Background => "background",
            PushType::Location => "location",
            PushType::VoIP => "voip",
            PushType::Complication => "complication",
            PushType::FileProvider => "fileprovider",
            PushType::MDM => "mdm",
            PushType::LiveActivity => "liveactivity",
            PushType::PushToTalk => "pushtotalk",
        }
    }

    /// Push types implied by the topic suffix
    pub fn from_topic(topic: &str) -> Option<Self> {
        if topic.ends_with(".voip") {
            Some(PushType::VoIP)
        } else if topic.ends_with(".complication") {
            Some(PushType::Complication)
        } else if topic.ends_with(".pushkit.fileprovider") {
            Some(PushType::FileProvider)
        } else if topic.ends_with(".push-type.liveactivity") {
            Some(PushType::LiveActivity)
        } else if topic.ends_with(".voip-ptt") {
            Some(PushType::PushToTalk)
        } else {
            None
        }
    }

    pub fn max_payload_size(&self) -> usize {
        match self {
            PushType::VoIP => MAX_VOIP_PAYLOAD_SIZE,
            _ => MAX_PAYLOAD_SIZE,
        }
    }
}

/// Value of the `apns-priority` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Deliver immediately
    #[default]
    Immediate,
    /// Deliver based on power considerations on the device
    Throttled,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Immediate => "10",
            Priority::Throttled => "5",
        }
    }
}

/// A single outbound notification
///
/// Built once, then handed to the dispatch engine which owns it until a
/// result is produced.
#[derive(Debug, Clone)]
pub struct Notification {
    device_token: DeviceToken,
    payload: Bytes,
    content_push_type: PushType,
    push_type: Option<PushType>,
    priority: Priority,
    expiration: Option<DateTime<Utc>>,
    collapse_id: Option<String>,
    apns_id: Option<Uuid>,
}

impl Notification {
    /// Serialize `payload` for `device_token`
    pub fn new(device_token: &str, payload: &Payload) -> Result<Self> {
        let content_push_type = if payload.has_visible_content() {
            PushType::Alert
        } else {
            PushType::Background
        };
        let mut notification = Self::from_bytes(device_token, payload.to_bytes()?)?;
        notification.content_push_type = content_push_type;
        Ok(notification)
    }

    /// Use an already serialized payload
    pub fn from_bytes(device_token: &str, payload: impl Into<Bytes>) -> Result<Self> {
        Ok(Self {
            device_token: DeviceToken::parse(device_token)?,
            payload: payload.into(),
            content_push_type: PushType::Alert,
            push_type: None,
            priority: Priority::default(),
            expiration: None,
            collapse_id: None,
            apns_id: None,
        })
    }

    pub fn with_push_type(mut self, push_type: PushType) -> Self {
        self.push_type = Some(push_type);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_collapse_id(mut self, collapse_id: impl Into<String>) -> Self {
        self.collapse_id = Some(collapse_id.into());
        self
    }

    pub fn with_apns_id(mut self, apns_id: Uuid) -> Self {
        self.apns_id = Some(apns_id);
        self
    }

    pub fn device_token(&self) -> &DeviceToken {
        &self.device_token
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn push_type(&self) -> Option<PushType> {
        self.push_type
    }

    /// Push type used when neither the caller nor the topic names one
    pub fn content_push_type(&self) -> PushType {
        self.content_push_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    pub fn collapse_id(&self) -> Option<&str> {
        self.collapse_id.as_deref()
    }

    pub fn apns_id(&self) -> Option<Uuid> {
        self.apns_id
    }
}
