// Message normalization
// REST responses and push payloads disagree on field names and casing. This module is the
// only place that looks at raw payloads; everything past it works on `models::Message`.

use chrono::{DateTime, NaiveDateTime};
use log::debug;
use serde_json::{Map, Value};

use super::identity::{lookup_path, probe_id, ChatId};
use crate::models::{MediaKind, MediaRef, Message};

pub const DEFAULT_TEMP_PREFIX: &str = "temp-";

/// Prefix of ids derived from the content of server records that carry no id.
pub const DERIVED_ID_PREFIX: &str = "derived-";

/// Field name candidates, probed in order.
pub mod fields {
    pub const MESSAGE_ID: &[&str] = &[
        "id", "Id", "ID", "messageId", "MessageId", "messageID", "MessageID", "message_id", "_id",
    ];
    pub const SENDER: &[&str] = &[
        "senderId", "SenderId", "sender_id", "fromUserId", "FromUserId", "from", "From",
        "sender", "Sender",
    ];
    pub const RECEIVER: &[&str] = &[
        "receiverId", "ReceiverId", "receiver_id", "recipientId", "RecipientId", "toUserId",
        "ToUserId", "to", "To", "receiver", "Receiver",
    ];
    pub const GROUP: &[&str] = &["groupId", "GroupId", "group_id", "chatGroupId", "group", "Group"];
    pub const TIMESTAMP: &[&str] = &[
        "timestamp", "Timestamp", "sentAt", "SentAt", "sent_at", "createdAt", "CreatedAt",
        "created_at", "date", "Date", "time", "Time",
    ];
    pub const CONTENT: &[&str] = &["content", "Content", "text", "Text", "body", "Body", "message", "Message"];
    pub const MEDIA_URL: &[&str] = &[
        "media.url", "mediaUrl", "MediaUrl", "media_url", "fileUrl", "FileUrl", "attachmentUrl",
        "AttachmentUrl", "imageUrl", "ImageUrl",
    ];
    pub const MEDIA_KIND: &[&str] = &[
        "media.kind", "mediaType", "MediaType", "media_type", "mediaKind", "fileType", "FileType",
        "attachmentType", "type", "Type",
    ];
    pub const DELIVERED: &[&str] = &["delivered", "Delivered", "isDelivered", "IsDelivered", "is_delivered"];
    pub const READ: &[&str] = &["read", "Read", "isRead", "IsRead", "is_read", "seen", "isSeen", "IsSeen"];
    pub const READ_AT: &[&str] = &["readAt", "ReadAt", "read_at", "seenAt", "SeenAt"];
    pub const SENDER_NAME: &[&str] = &[
        "senderName", "SenderName", "sender.name", "sender.Name", "sender.userName",
        "sender.UserName", "sender.fullName", "Sender.UserName",
    ];
    pub const SENDER_AVATAR: &[&str] = &[
        "senderAvatar", "SenderAvatar", "sender.avatar", "sender.profilePicture",
        "sender.ProfilePicture", "sender.profileImage", "Sender.ProfilePicture",
    ];
}

/// Maps message-like payloads of any recognized shape onto the canonical [`Message`].
#[derive(Debug, Clone)]
pub struct MessageNormalizer {
    temp_prefix: String,
}

impl Default for MessageNormalizer {
    fn default() -> Self {
        MessageNormalizer::new(DEFAULT_TEMP_PREFIX)
    }
}

impl MessageNormalizer {
    pub fn new(temp_prefix: impl Into<String>) -> Self {
        MessageNormalizer {
            temp_prefix: temp_prefix.into(),
        }
    }

    pub fn temp_prefix(&self) -> &str {
        &self.temp_prefix
    }

    /// A fresh temporary id, distinguishable from anything the server hands out.
    pub fn temp_id(&self) -> ChatId {
        ChatId::generated(&self.temp_prefix)
    }

    /// Normalize a payload. Never fails: unrecognized shapes yield best-effort defaults.
    pub fn normalize(&self, value: &Value) -> Message {
        let empty = Map::new();
        let map = match value.as_object() {
            Some(map) => map,
            None => {
                debug!("Normalizing non-object message payload: {}", value);
                &empty
            }
        };

        let sender_id = probe_id(map, fields::SENDER);
        let receiver_id = probe_id(map, fields::RECEIVER);
        let group_id = probe_id(map, fields::GROUP);
        let timestamp = probe_timestamp(map, fields::TIMESTAMP).unwrap_or(0);
        let content = probe_text(map, fields::CONTENT).unwrap_or_default();

        let media = probe_text(map, fields::MEDIA_URL).map(|url| {
            let kind = probe_text(map, fields::MEDIA_KIND)
                .and_then(|hint| MediaKind::from_hint(&hint))
                .unwrap_or_else(|| MediaKind::from_url(&url));
            MediaRef { url, kind }
        });

        // Only `ChatSync::send_message` hands out temporary ids
        let id = probe_id(map, fields::MESSAGE_ID).unwrap_or_else(|| {
            let timestamp = timestamp.to_string();
            let id = ChatId::derived(
                DERIVED_ID_PREFIX,
                &[
                    sender_id.as_ref().map_or("", ChatId::as_str),
                    receiver_id.as_ref().map_or("", ChatId::as_str),
                    group_id.as_ref().map_or("", ChatId::as_str),
                    timestamp.as_str(),
                    content.as_str(),
                    media.as_ref().map_or("", |m| m.url.as_str()),
                ],
            );
            debug!("Payload without a message id, using {}", id);
            id
        });

        let read_at = probe_timestamp(map, fields::READ_AT);
        let read = probe_flag(map, fields::READ) || read_at.is_some();
        let delivered = probe_flag(map, fields::DELIVERED) || read;

        Message {
            id,
            sender_id,
            receiver_id,
            group_id,
            content,
            media,
            timestamp,
            delivered,
            read,
            read_at,
            sender_name: probe_text(map, fields::SENDER_NAME),
            sender_avatar: probe_text(map, fields::SENDER_AVATAR),
        }
    }

    /// Normalize a batch, skipping nothing.
    pub fn normalize_batch(&self, values: &[Value]) -> Vec<Message> {
        values.iter().map(|value| self.normalize(value)).collect()
    }
}

/// First candidate that holds a non-empty string (numbers are stringified).
fn probe_text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| lookup_path(map, key))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// OR over every candidate: any truthy source sets the flag.
fn probe_flag(map: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter()
        .filter_map(|key| lookup_path(map, key))
        .any(is_truthy)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

fn probe_timestamp(map: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .filter_map(|key| lookup_path(map, key))
        .find_map(parse_timestamp)
}

/// Parse a timestamp into unix milliseconds.
///
/// Numbers are taken as milliseconds. Strings may be numeric, RFC 3339, or a naive
/// `YYYY-MM-DDTHH:MM:SS[.fff]` which is read as UTC.
pub fn parse_timestamp(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(ms) = s.parse::<u64>() {
                return Some(ms);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return u64::try_from(dt.timestamp_millis()).ok();
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .and_then(|naive| u64::try_from(naive.and_utc().timestamp_millis()).ok())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> MessageNormalizer {
        MessageNormalizer::default()
    }

    #[test]
    fn test_rest_shape() {
        let msg = normalizer().normalize(&json!({
            "Id": 12,
            "SenderId": 3,
            "ReceiverId": "4",
            "Content": "hello",
            "SentAt": "2024-05-01T10:00:00Z",
            "IsRead": false
        }));
        assert_eq!(msg.id.as_str(), "12");
        assert_eq!(msg.sender_id, ChatId::parse("3"));
        assert_eq!(msg.receiver_id, ChatId::parse("4"));
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.timestamp, 1_714_557_600_000);
        assert!(!msg.read);
        assert!(!msg.delivered);
    }

    #[test]
    fn test_push_shape_with_nested_sender() {
        let msg = normalizer().normalize(&json!({
            "messageId": "77",
            "sender": {"id": 9, "userName": "ana", "profilePicture": "https://cdn/ana.png"},
            "groupId": 2,
            "text": "hi all",
            "createdAt": 1700000000000u64
        }));
        assert_eq!(msg.id.as_str(), "77");
        assert_eq!(msg.sender_id, ChatId::parse("9"));
        assert_eq!(msg.group_id, ChatId::parse("2"));
        assert_eq!(msg.sender_name.as_deref(), Some("ana"));
        assert_eq!(msg.sender_avatar.as_deref(), Some("https://cdn/ana.png"));
        assert_eq!(msg.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_read_at_implies_read_and_delivered() {
        let msg = normalizer().normalize(&json!({
            "id": 1, "senderId": 1, "receiverId": 2, "readAt": "2024-05-01T10:00:00Z"
        }));
        assert!(msg.read);
        assert!(msg.delivered);
        assert!(msg.read_at.is_some());
    }

    #[test]
    fn test_flags_are_or_of_all_sources() {
        let msg = normalizer().normalize(&json!({"id": 1, "isRead": false, "IsRead": true}));
        assert!(msg.read);
        assert!(msg.delivered);
        let msg = normalizer().normalize(&json!({"id": 2, "delivered": "true"}));
        assert!(msg.delivered);
        assert!(!msg.read);
    }

    #[test]
    fn test_missing_id_is_derived_from_content() {
        let n = normalizer();
        let msg = n.normalize(&json!({"senderId": 1, "receiverId": 2, "content": "draft", "timestamp": 5}));
        assert!(msg.has_derived_id());
        assert!(!msg.is_optimistic(n.temp_prefix()));
        let again = n.normalize(&json!({"SenderId": "1", "ReceiverId": 2, "Content": "draft", "Timestamp": 5}));
        assert_eq!(msg.id, again.id);
        let later = n.normalize(&json!({"senderId": 1, "receiverId": 2, "content": "draft", "timestamp": 6}));
        assert_ne!(msg.id, later.id);
    }

    #[test]
    fn test_message_id_spellings() {
        let msg = normalizer().normalize(&json!({"messageID": 7, "senderId": 9}));
        assert_eq!(msg.id.as_str(), "7");
    }

    #[test]
    fn test_malformed_payload_defaults() {
        let n = normalizer();
        let msg = n.normalize(&json!("garbage"));
        assert_eq!(msg.sender_id, None);
        assert_eq!(msg.receiver_id, None);
        assert_eq!(msg.content, "");
        assert_eq!(msg.timestamp, 0);
        assert!(msg.has_derived_id());
        assert!(!msg.is_optimistic(n.temp_prefix()));
    }

    #[test]
    fn test_media_kind_from_hint_or_url() {
        let n = normalizer();
        let msg = n.normalize(&json!({"id": 1, "mediaUrl": "https://cdn/x.mp4"}));
        assert_eq!(msg.media.as_ref().map(|m| m.kind), Some(MediaKind::Video));
        let msg = n.normalize(&json!({"id": 1, "fileUrl": "https://cdn/x", "mediaType": "audio/ogg"}));
        assert_eq!(msg.media.as_ref().map(|m| m.kind), Some(MediaKind::Audio));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let n = normalizer();
        let inputs = [
            json!({"Id": 5, "SenderId": "1", "ReceiverId": 2, "Content": "a", "SentAt": "2024-01-01T00:00:00",
                   "mediaUrl": "https://cdn/pic.jpg", "ReadAt": "2024-01-01T00:01:00Z"}),
            json!({"senderId": 1, "receiverId": 2, "content": "optimistic", "timestamp": 10}),
            json!({"messageId": "x", "sender": {"Id": 4, "name": "bo"}, "groupId": 7, "isDelivered": true}),
            json!(null),
        ];
        for input in inputs.iter() {
            let once = n.normalize(input);
            let value = serde_json::to_value(&once).expect("serialize");
            let twice = n.normalize(&value);
            assert_eq!(once, twice, "not idempotent for {}", input);
        }
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_timestamp(&json!(1234)), Some(1234));
        assert_eq!(parse_timestamp(&json!("1234")), Some(1234));
        assert_eq!(parse_timestamp(&json!("1970-01-01T00:00:01.500")), Some(1500));
        assert_eq!(parse_timestamp(&json!("1970-01-01T01:00:00+01:00")), Some(0));
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }
}
