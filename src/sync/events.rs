// Push channel events
// The real-time hub delivers named events with loosely shaped payloads, in any order and
// possibly more than once. Decoding here turns them into `PushEvent`s.

use log::{debug, warn};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::identity::{lookup_path, normalize_id, probe_id, ChatId};
use super::normalize::{parse_timestamp, MessageNormalizer};
use crate::models::Message;

/// Event names as sent by the hub, compared case-insensitively.
pub mod event_names {
    pub const MESSAGES_READ: &[&str] = &["messagesread", "conversationread"];
    pub const MESSAGE_READ: &[&str] = &["messageread"];
    pub const MESSAGE_DELIVERED: &[&str] = &["messagedelivered", "messagesdelivered"];
    pub const MESSAGE_RECEIVED: &[&str] = &[
        "receivemessage",
        "messagereceived",
        "receivegroupmessage",
        "messagesent",
        "newmessage",
    ];
}

const MESSAGE_IDS_KEYS: &[&str] = &["messageIds", "MessageIds", "message_ids", "ids", "Ids"];
const MESSAGE_ID_KEYS: &[&str] = &["messageId", "MessageId", "message_id", "id", "Id"];
const READER_KEYS: &[&str] = &["readerId", "ReaderId", "receiverId", "ReceiverId", "readBy", "ReadBy", "userId", "UserId"];
const READ_AT_KEYS: &[&str] = &["readAt", "ReadAt", "read_at", "timestamp", "Timestamp"];
const MESSAGE_PAYLOAD_KEYS: &[&str] = &["message", "Message", "data", "Data"];

/// One raw frame from the push transport: event name plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFrame {
    pub event: String,
    pub payload: Value,
}

impl PushFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        PushFrame {
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// A batch of messages was read by `reader_id`.
    MessagesRead {
        reader_id: Option<ChatId>,
        message_ids: Vec<ChatId>,
        read_at: Option<u64>,
    },
    MessageRead {
        message_id: ChatId,
        read_at: Option<u64>,
    },
    MessagesDelivered {
        message_ids: Vec<ChatId>,
    },
    /// A new message, or the echo of one we sent.
    MessageReceived(Message),
}

impl PushEvent {
    /// Decode a frame. Unknown events and unusable payloads yield `None`.
    pub fn decode(frame: &PushFrame, normalizer: &MessageNormalizer) -> Option<PushEvent> {
        let name = frame.event.trim().to_ascii_lowercase();
        let payload = &frame.payload;

        if event_names::MESSAGES_READ.contains(&name.as_str()) {
            let message_ids = id_list(payload);
            if message_ids.is_empty() {
                debug!("Ignoring {} event without message ids", frame.event);
                return None;
            }
            let (reader_id, read_at) = match payload.as_object() {
                Some(map) => (probe_id(map, READER_KEYS), probe_read_at(map)),
                None => (None, None),
            };
            return Some(PushEvent::MessagesRead {
                reader_id,
                message_ids,
                read_at,
            });
        }

        if event_names::MESSAGE_READ.contains(&name.as_str()) {
            let (message_id, read_at) = match payload.as_object() {
                Some(map) => (probe_id(map, MESSAGE_ID_KEYS), probe_read_at(map)),
                None => (normalize_id(payload), None),
            };
            return match message_id {
                Some(message_id) => Some(PushEvent::MessageRead { message_id, read_at }),
                None => {
                    debug!("Ignoring {} event without a message id", frame.event);
                    None
                }
            };
        }

        if event_names::MESSAGE_DELIVERED.contains(&name.as_str()) {
            let mut message_ids = id_list(payload);
            if message_ids.is_empty() {
                let single = match payload.as_object() {
                    Some(map) => probe_id(map, MESSAGE_ID_KEYS),
                    None => normalize_id(payload),
                };
                message_ids.extend(single);
            }
            if message_ids.is_empty() {
                debug!("Ignoring {} event without message ids", frame.event);
                return None;
            }
            return Some(PushEvent::MessagesDelivered { message_ids });
        }

        if event_names::MESSAGE_RECEIVED.contains(&name.as_str()) {
            let record = payload
                .as_object()
                .and_then(|map| {
                    MESSAGE_PAYLOAD_KEYS
                        .iter()
                        .filter_map(|key| map.get(*key))
                        .find(|inner| inner.is_object())
                })
                .unwrap_or(payload);
            if !record.is_object() {
                debug!("Ignoring {} event with non-object payload", frame.event);
                return None;
            }
            return Some(PushEvent::MessageReceived(normalizer.normalize(record)));
        }

        warn!("Unknown push event: {}", frame.event);
        None
    }
}

/// Ids from a bare array payload or from one of the id-list keys.
fn id_list(payload: &Value) -> Vec<ChatId> {
    let list = match payload {
        Value::Array(items) => Some(items),
        Value::Object(map) => MESSAGE_IDS_KEYS
            .iter()
            .filter_map(|key| lookup_path(map, key))
            .find_map(Value::as_array),
        _ => None,
    };
    list.map(|items| items.iter().filter_map(normalize_id).collect())
        .unwrap_or_default()
}

fn probe_read_at(map: &Map<String, Value>) -> Option<u64> {
    READ_AT_KEYS
        .iter()
        .filter_map(|key| map.get(*key))
        .find_map(parse_timestamp)
}

/// A sender for frames and the matching stream to hand to `SyncDriver::run`.
pub fn push_channel(buffer: usize) -> (mpsc::Sender<PushFrame>, ReceiverStream<PushFrame>) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, ReceiverStream::new(rx))
}
