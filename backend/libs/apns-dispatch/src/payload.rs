/// Notification payload builder
///
/// Produces the JSON body APNs expects: an `aps` dictionary plus any custom
/// top-level keys. The dispatch engine only sees the serialized bytes.
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::Result;

/// Size limit for every push type except VoIP
pub const MAX_PAYLOAD_SIZE: usize = 4096;
pub const MAX_VOIP_PAYLOAD_SIZE: usize = 5120;

/// Structured alert dictionary
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PayloadAlert {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "title-loc-key", skip_serializing_if = "Option::is_none")]
    pub title_loc_key: Option<String>,
    #[serde(rename = "title-loc-args", skip_serializing_if = "Option::is_none")]
    pub title_loc_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(rename = "subtitle-loc-key", skip_serializing_if = "Option::is_none")]
    pub subtitle_loc_key: Option<String>,
    #[serde(rename = "subtitle-loc-args", skip_serializing_if = "Option::is_none")]
    pub subtitle_loc_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "loc-key", skip_serializing_if = "Option::is_none")]
    pub body_loc_key: Option<String>,
    #[serde(rename = "loc-args", skip_serializing_if = "Option::is_none")]
    pub body_loc_args: Option<Vec<String>>,
    #[serde(rename = "action-loc-key", skip_serializing_if = "Option::is_none")]
    pub action_loc_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(rename = "launch-image", skip_serializing_if = "Option::is_none")]
    pub launch_image: Option<String>,
}

impl PayloadAlert {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn localized_body(mut self, key: impl Into<String>, args: Vec<String>) -> Self {
        self.body_loc_key = Some(key.into());
        self.body_loc_args = (!args.is_empty()).then_some(args);
        self
    }

    pub fn localized_title(mut self, key: impl Into<String>, args: Vec<String>) -> Self {
        self.title_loc_key = Some(key.into());
        self.title_loc_args = (!args.is_empty()).then_some(args);
        self
    }
}

/// `aps.alert` is either a plain string or a dictionary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Alert {
    Text(String),
    Fields(PayloadAlert),
}

impl From<&str> for Alert {
    fn from(value: &str) -> Self {
        Alert::Text(value.to_string())
    }
}

impl From<String> for Alert {
    fn from(value: String) -> Self {
        Alert::Text(value)
    }
}

impl From<PayloadAlert> for Alert {
    fn from(value: PayloadAlert) -> Self {
        Alert::Fields(value)
    }
}

#[derive(Serialize)]
struct Aps<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    alert: Option<&'a Alert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    badge: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'a str>,
    #[serde(rename = "content-available", skip_serializing_if = "Option::is_none")]
    content_available: Option<u8>,
    #[serde(rename = "mutable-content", skip_serializing_if = "Option::is_none")]
    mutable_content: Option<u8>,
    #[serde(rename = "thread-id", skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
    #[serde(rename = "url-args", skip_serializing_if = "Option::is_none")]
    url_args: Option<&'a [String]>,
}

/// Remote notification payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub alert: Option<Alert>,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    pub category: Option<String>,
    pub thread_id: Option<String>,
    pub url_args: Option<Vec<String>>,
    pub content_available: bool,
    pub mutable_content: bool,
    /// Extra top-level keys; a key named `aps` replaces the generated dictionary
    pub custom: Map<String, Value>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alert(mut self, alert: impl Into<Alert>) -> Self {
        self.alert = Some(alert.into());
        self
    }

    pub fn with_badge(mut self, badge: u32) -> Self {
        self.badge = Some(badge);
        self
    }

    pub fn with_sound(mut self, sound: impl Into<String>) -> Self {
        self.sound = Some(sound.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_url_args(mut self, args: Vec<String>) -> Self {
        self.url_args = Some(args);
        self
    }

    pub fn with_content_available(mut self) -> Self {
        self.content_available = true;
        self
    }

    pub fn with_mutable_content(mut self) -> Self {
        self.mutable_content = true;
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }

    /// Alert, badge or sound present: the notification is user-visible
    pub fn has_visible_content(&self) -> bool {
        self.alert.is_some() || self.badge.is_some() || self.sound.is_some()
    }

    pub fn to_value(&self) -> Result<Value> {
        let aps = Aps {
            alert: self.alert.as_ref(),
            badge: self.badge,
            sound: self.sound.as_deref(),
            content_available: self.content_available.then_some(1),
            mutable_content: self.mutable_content.then_some(1),
            thread_id: self.thread_id.as_deref(),
            category: self.category.as_deref(),
            url_args: self.url_args.as_deref(),
        };

        let mut root = Map::new();
        root.insert("aps".to_string(), serde_json::to_value(aps)?);
        // Custom keys win, including a caller-supplied `aps` dictionary
        root.extend(self.custom.iter().map(|(key, value)| (key.clone(), value.clone())));
        Ok(Value::Object(root))
    }

    /// Compact JSON encoding sent as the request body
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.to_value()?)?))
    }
}
