// Notification model, JSON payload layout and per-notification delivery state.
use bytes::Bytes;
use courier_wire::{DeviceToken, ErrorStatus, Frame};
use serde_json::{Map, Value};
use std::time::SystemTime;

use crate::ClientError;

/// Alert shown on the device: plain text or a localized dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    Text(String),
    Dictionary(Map<String, Value>),
}

impl From<&str> for Alert {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Alert {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Map<String, Value>> for Alert {
    fn from(value: Map<String, Value>) -> Self {
        Self::Dictionary(value)
    }
}

/// Where a notification ended up after a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    Pending,
    Sent { at: SystemTime },
    Failed(ErrorStatus),
    /// Rejected locally before transmission.
    Invalid(String),
}

/// One unit of delivery.
///
/// ```
/// use courier_client::Notification;
///
/// let notification = Notification::for_device("<ce8be627 2e43e855>")
///     .with_alert("Houston, we have a problem.")
///     .with_badge(2701);
/// let payload = notification.payload();
/// assert_eq!(payload["aps"]["badge"], 2701);
/// ```
#[derive(Debug, Clone)]
pub struct Notification {
    pub token: DeviceToken,
    pub alert: Option<Alert>,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    pub category: Option<String>,
    pub content_available: bool,
    pub mutable_content: bool,
    /// Top-level payload keys written before `aps`. An `aps` object here is
    /// merged into the generated one.
    pub custom_data: Map<String, Value>,
    /// Seconds since the Unix epoch after which the gateway may drop it.
    pub expiry: Option<u32>,
    pub priority: Option<u8>,
    id: Option<u32>,
    state: DeliveryState,
}

impl Notification {
    pub fn new(token: DeviceToken) -> Self {
        Self {
            token,
            alert: None,
            badge: None,
            sound: None,
            category: None,
            content_available: false,
            mutable_content: false,
            custom_data: Map::new(),
            expiry: None,
            priority: None,
            id: None,
            state: DeliveryState::Pending,
        }
    }

    /// Build from a hex rendering of the device token.
    pub fn for_device(token: &str) -> Self {
        Self::new(DeviceToken::parse(token))
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

    pub fn with_content_available(mut self, content_available: bool) -> Self {
        self.content_available = content_available;
        self
    }

    pub fn with_mutable_content(mut self, mutable_content: bool) -> Self {
        self.mutable_content = mutable_content;
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom_data.insert(key.into(), value.into());
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Preset identifier. A batch replaces it with the notification's
    /// position when delivery starts.
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Sequence identifier assigned when the notification joins a batch.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub(crate) fn assign_id(&mut self, id: u32) {
        self.id = Some(id);
    }

    pub fn state(&self) -> &DeliveryState {
        &self.state
    }

    pub fn is_sent(&self) -> bool {
        matches!(self.state, DeliveryState::Sent { .. })
    }

    pub fn sent_at(&self) -> Option<SystemTime> {
        match self.state {
            DeliveryState::Sent { at } => Some(at),
            _ => None,
        }
    }

    /// Status the gateway rejected this notification with, if any.
    pub fn error(&self) -> Option<ErrorStatus> {
        match self.state {
            DeliveryState::Failed(status) => Some(status),
            _ => None,
        }
    }

    pub fn mark_as_sent(&mut self) {
        self.state = DeliveryState::Sent {
            at: SystemTime::now(),
        };
    }

    pub fn mark_as_unsent(&mut self) {
        self.state = DeliveryState::Pending;
    }

    pub(crate) fn mark_failed(&mut self, status: ErrorStatus) {
        self.state = DeliveryState::Failed(status);
    }

    pub(crate) fn mark_invalid(&mut self, reason: String) {
        self.state = DeliveryState::Invalid(reason);
    }

    /// JSON body: custom keys first, then the `aps` dictionary.
    pub fn payload(&self) -> Value {
        self.payload_with_alert(self.alert.as_ref())
    }

    fn payload_with_alert(&self, alert: Option<&Alert>) -> Value {
        let mut root = self.custom_data.clone();
        let entry = root
            .entry("aps")
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Some(aps) = entry.as_object_mut() {
            match alert {
                Some(Alert::Text(text)) => {
                    aps.insert("alert".into(), Value::String(text.clone()));
                }
                Some(Alert::Dictionary(dictionary)) => {
                    aps.insert("alert".into(), Value::Object(dictionary.clone()));
                }
                None => {}
            }
            if let Some(badge) = self.badge {
                aps.insert("badge".into(), badge.into());
            }
            if let Some(sound) = &self.sound {
                aps.insert("sound".into(), Value::String(sound.clone()));
            }
            if let Some(category) = &self.category {
                aps.insert("category".into(), Value::String(category.clone()));
            }
            if self.content_available {
                aps.insert("content-available".into(), 1.into());
            }
            if self.mutable_content {
                aps.insert("mutable-content".into(), 1.into());
            }
        }
        Value::Object(root)
    }

    /// Serialize the payload, enforcing `max_bytes`.
    ///
    /// With a `truncate_marker`, an oversized text alert is shortened on a
    /// character boundary and suffixed with the marker until it fits. Other
    /// fields are never touched.
    pub fn encode_payload(
        &self,
        max_bytes: usize,
        truncate_marker: Option<&str>,
    ) -> Result<Bytes, ClientError> {
        let encoded = serde_json::to_vec(&self.payload())?;
        if encoded.len() <= max_bytes {
            return Ok(Bytes::from(encoded));
        }
        let too_large = || ClientError::PayloadTooLarge {
            size: encoded.len(),
            max: max_bytes,
        };
        let (Some(marker), Some(Alert::Text(text))) = (truncate_marker, self.alert.as_ref()) else {
            return Err(too_large());
        };

        let overflow = encoded.len() - max_bytes;
        let mut budget = text
            .len()
            .checked_sub(overflow + marker.len())
            .ok_or_else(too_large)?;
        loop {
            let mut cut = budget;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            if cut == 0 {
                return Err(too_large());
            }
            let alert = Alert::Text(format!("{}{marker}", &text[..cut]));
            let candidate = serde_json::to_vec(&self.payload_with_alert(Some(&alert)))?;
            if candidate.len() <= max_bytes {
                return Ok(Bytes::from(candidate));
            }
            // Escapes can make the encoded alert longer than its raw text.
            budget = cut
                .checked_sub(candidate.len() - max_bytes)
                .ok_or_else(too_large)?;
        }
    }

    /// Wire frame carrying the encoded payload and whichever optional items
    /// are set.
    pub fn frame(&self, payload: Bytes) -> Frame {
        let mut frame = Frame::new(self.token, payload);
        frame.identifier = self.id;
        frame.expiry = self.expiry;
        frame.priority = self.priority;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOKEN: &str = "<ce8be627 2e43e855 16033e24 b4c28922 0eeda487 9c477160 b2545e95 b68b5969>";

    fn houston() -> Notification {
        Notification::for_device(TOKEN)
            .with_alert("Houston, we have a problem.")
            .with_badge(2701)
            .with_sound("sosumi.aiff")
            .with_content_available(true)
    }

    #[test]
    fn payload_carries_aps_fields() {
        let payload = houston().payload();
        assert_eq!(
            payload,
            json!({
                "aps": {
                    "alert": "Houston, we have a problem.",
                    "badge": 2701,
                    "sound": "sosumi.aiff",
                    "content-available": 1
                }
            })
        );
    }

    #[test]
    fn payload_puts_custom_keys_first() {
        let notification = Notification::for_device(TOKEN)
            .with_custom("key1", 1)
            .with_custom("key2", "abc")
            .with_alert("Houston, we have a problem.")
            .with_badge(2701)
            .with_sound("sosumi.aiff")
            .with_category("INVITE_CATEGORY")
            .with_content_available(true);
        let encoded = notification
            .encode_payload(2048, None)
            .expect("encode payload");
        assert_eq!(
            std::str::from_utf8(&encoded).expect("utf8"),
            r#"{"key1":1,"key2":"abc","aps":{"alert":"Houston, we have a problem.","badge":2701,"sound":"sosumi.aiff","category":"INVITE_CATEGORY","content-available":1}}"#
        );
        assert_eq!(encoded.len(), 155);
    }

    #[test]
    fn payload_merges_custom_aps_dictionary() {
        let notification = Notification::for_device(TOKEN)
            .with_custom("aps", json!({"thread-id": "ops"}))
            .with_alert("hi")
            .with_mutable_content(true);
        assert_eq!(
            notification.payload(),
            json!({"aps": {"thread-id": "ops", "alert": "hi", "mutable-content": 1}})
        );
    }

    #[test]
    fn dictionary_alert_is_kept_verbatim() {
        let mut body = Map::new();
        body.insert("loc-key".into(), json!("GAME_PLAY_REQUEST_FORMAT"));
        body.insert("loc-args".into(), json!(["Jenna", "Frank"]));
        let notification = Notification::for_device(TOKEN).with_alert(body);
        assert_eq!(
            notification.payload()["aps"]["alert"]["loc-args"],
            json!(["Jenna", "Frank"])
        );
    }

    #[test]
    fn oversized_payload_is_rejected_without_truncation() {
        let notification = Notification::for_device(TOKEN).with_alert("x".repeat(300));
        let err = notification.encode_payload(256, None).expect_err("too large");
        assert!(matches!(err, ClientError::PayloadTooLarge { max: 256, .. }));
    }

    #[test]
    fn truncation_fits_alert_under_limit() {
        let notification = Notification::for_device(TOKEN).with_alert("x".repeat(300));
        let encoded = notification
            .encode_payload(256, Some("..."))
            .expect("truncated");
        assert_eq!(encoded.len(), 256);
        let value: Value = serde_json::from_slice(&encoded).expect("json");
        let alert = value["aps"]["alert"].as_str().expect("alert");
        assert!(alert.ends_with("..."));
    }

    #[test]
    fn truncation_respects_multibyte_characters() {
        let notification = Notification::for_device(TOKEN).with_alert("é".repeat(200));
        let encoded = notification
            .encode_payload(256, Some("…"))
            .expect("truncated");
        assert!(encoded.len() <= 256);
        let value: Value = serde_json::from_slice(&encoded).expect("json");
        let alert = value["aps"]["alert"].as_str().expect("alert");
        assert!(alert.trim_end_matches('…').chars().all(|c| c == 'é'));
    }

    #[test]
    fn truncation_cannot_shrink_other_fields() {
        let notification = Notification::for_device(TOKEN)
            .with_alert("short")
            .with_custom("blob", "y".repeat(400));
        let err = notification
            .encode_payload(256, Some("..."))
            .expect_err("still too large");
        assert!(matches!(err, ClientError::PayloadTooLarge { .. }));
    }

    #[test]
    fn frame_omits_unset_items() {
        let notification = Notification::for_device("<ce8be627 2e43e855>").with_alert("Hi!");
        let payload = notification.encode_payload(2048, None).expect("payload");
        let frame = notification.frame(payload);
        assert_eq!(frame.identifier, None);
        assert_eq!(frame.expiry, None);
        assert_eq!(frame.priority, None);
        assert_eq!(
            &frame.token.as_bytes()[..8],
            &[0xce, 0x8b, 0xe6, 0x27, 0x2e, 0x43, 0xe8, 0x55]
        );
        assert_eq!(&frame.token.as_bytes()[8..], &[0u8; 24]);
    }

    #[test]
    fn frame_carries_assigned_identifier() {
        let mut notification = houston().with_expiry(1_234_567_890).with_priority(10);
        notification.assign_id(42);
        let payload = notification.encode_payload(2048, None).expect("payload");
        let frame = notification.frame(payload);
        assert_eq!(frame.identifier, Some(42));
        assert_eq!(frame.expiry, Some(1_234_567_890));
        assert_eq!(frame.priority, Some(10));
    }

    #[test]
    fn preset_id_reaches_the_frame() {
        let notification = houston().with_id(9);
        assert_eq!(notification.id(), Some(9));
        let payload = notification.encode_payload(2048, None).expect("payload");
        assert_eq!(notification.frame(payload).identifier, Some(9));
    }

    #[test]
    fn sent_flag_round_trips() {
        let mut notification = houston();
        assert!(!notification.is_sent());
        notification.mark_as_sent();
        assert!(notification.is_sent());
        assert!(notification.sent_at().is_some());
        notification.mark_as_unsent();
        assert_eq!(notification.state(), &DeliveryState::Pending);
        notification.mark_failed(ErrorStatus::InvalidToken);
        assert_eq!(notification.error(), Some(ErrorStatus::InvalidToken));
    }
}
