use serde::{Serialize, Serializer};
use std::fmt;

use crate::sync::identity::ChatId;
use crate::sync::normalize::DERIVED_ID_PREFIX;

/// A contact as handed to us by the profile/contacts layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ChatId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Contact {
    pub fn new(id: ChatId, name: impl Into<String>) -> Self {
        Contact {
            id,
            name: name.into(),
            avatar: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    /// Map a loose kind hint ("image", "Video", "image/png", "file") to a kind.
    pub fn from_hint(hint: &str) -> Option<Self> {
        let hint = hint.trim().to_ascii_lowercase();
        let head = hint.split('/').next().unwrap_or("");
        match head {
            "image" | "img" | "photo" | "picture" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "audio" | "voice" => Some(MediaKind::Audio),
            "document" | "doc" | "file" | "application" => Some(MediaKind::Document),
            _ => None,
        }
    }

    /// Guess the kind from a url's file extension, defaulting to a document.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "svg" | "heic" => MediaKind::Image,
            "mp4" | "mov" | "webm" | "mkv" | "avi" => MediaKind::Video,
            "mp3" | "wav" | "ogg" | "m4a" | "aac" | "opus" => MediaKind::Audio,
            _ => MediaKind::Document,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
}

/// Canonical message record. Produced only by the message normalizer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: ChatId,
    pub sender_id: Option<ChatId>,
    pub receiver_id: Option<ChatId>,
    pub group_id: Option<ChatId>,
    pub content: String,
    pub media: Option<MediaRef>,
    /// Milliseconds since the unix epoch, 0 when unknown.
    pub timestamp: u64,
    pub delivered: bool,
    pub read: bool,
    pub read_at: Option<u64>,
    pub sender_name: Option<String>,
    pub sender_avatar: Option<String>,
}

impl Message {
    /// Whether this record is still a locally created optimistic send.
    pub fn is_optimistic(&self, temp_prefix: &str) -> bool {
        self.id.as_str().starts_with(temp_prefix)
    }

    /// Whether the server sent this record without an id of its own.
    pub fn has_derived_id(&self) -> bool {
        self.id.as_str().starts_with(DERIVED_ID_PREFIX)
    }

    pub fn delivery_status(&self, temp_prefix: &str) -> DeliveryStatus {
        if self.read {
            DeliveryStatus::Read
        } else if self.delivered {
            DeliveryStatus::Delivered
        } else if self.is_optimistic(temp_prefix) {
            DeliveryStatus::Sending
        } else {
            DeliveryStatus::Sent
        }
    }

    /// Raise the delivered/read flags to at least those of `other`. Flags never go back to false.
    pub fn absorb_flags(&mut self, delivered: bool, read: bool, read_at: Option<u64>) {
        self.delivered |= delivered || read;
        self.read |= read;
        if self.read_at.is_none() {
            self.read_at = read_at;
        }
        if self.read_at.is_some() {
            self.read = true;
            self.delivered = true;
        }
    }

    /// Which conversation this message belongs to, seen from `me`.
    pub fn conversation_key(&self, me: &ChatId) -> Option<ConversationKey> {
        if let Some(group) = &self.group_id {
            return Some(ConversationKey::Group(group.clone()));
        }
        match (&self.sender_id, &self.receiver_id) {
            (Some(sender), Some(receiver)) if sender == me => {
                Some(ConversationKey::Direct(receiver.clone()))
            }
            (Some(sender), Some(receiver)) if receiver == me => {
                Some(ConversationKey::Direct(sender.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending = 1,   // Optimistic, not confirmed by the server yet
    Sent = 2,      // Confirmed by the server
    Delivered = 4, // Delivered to the recipient
    Read = 5,      // Read by the recipient
}

/// Identifies one conversation: a direct chat with a contact or a group chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationKey {
    Direct(ChatId),
    Group(ChatId),
}

impl ConversationKey {
    pub fn id(&self) -> &ChatId {
        match self {
            ConversationKey::Direct(id) | ConversationKey::Group(id) => id,
        }
    }

    /// Parse the `user:<id>` / `group:<id>` form produced by `Display`. A bare id is a direct chat.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("group:") {
            return ChatId::parse(rest).map(ConversationKey::Group);
        }
        let rest = raw.strip_prefix("user:").unwrap_or(raw);
        ChatId::parse(rest).map(ConversationKey::Direct)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Direct(id) => write!(f, "user:{}", id),
            ConversationKey::Group(id) => write!(f, "group:{}", id),
        }
    }
}

// Serialized as a plain string so it can be used as a JSON map key
impl Serialize for ConversationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
