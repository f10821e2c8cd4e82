// Identity normalization
// Users and messages arrive with ids as numbers, numeric strings, or nested under
// differently-cased keys. Everything is funneled into one canonical string form here.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Candidate keys for the identity of a user-like or message-like object, in probe order.
pub const ID_KEYS: &[&str] = &["id", "Id", "ID", "userId", "UserId", "user_id", "_id"];

// Nesting beyond this is treated as malformed
const MAX_PROBE_DEPTH: usize = 4;

/// Canonical identifier. Never empty, never "null"/"undefined".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    /// Canonicalize a textual id; `None` when it carries no usable identity.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "undefined" || trimmed == "null" {
            return None;
        }
        Some(ChatId(trimmed.to_string()))
    }

    /// A new unique id with the given prefix, for records the server has not seen yet.
    pub fn generated(prefix: &str) -> Self {
        ChatId(format!("{}{}", prefix, Uuid::new_v4()))
    }

    /// A stable id for a server record that arrived without one. The same `parts` always
    /// yield the same id, so repeated fetches of that record collapse into one message.
    pub fn derived(prefix: &str, parts: &[&str]) -> Self {
        let key = parts.join("\u{1f}");
        ChatId(format!("{}{}", prefix, Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChatId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Anything that may carry an identifier.
pub trait ToChatId {
    fn to_chat_id(&self) -> Option<ChatId>;
}

impl ToChatId for ChatId {
    fn to_chat_id(&self) -> Option<ChatId> {
        Some(self.clone())
    }
}

impl ToChatId for str {
    fn to_chat_id(&self) -> Option<ChatId> {
        ChatId::parse(self)
    }
}

impl ToChatId for String {
    fn to_chat_id(&self) -> Option<ChatId> {
        ChatId::parse(self)
    }
}

impl ToChatId for Value {
    fn to_chat_id(&self) -> Option<ChatId> {
        normalize_id(self)
    }
}

impl<T: ToChatId + ?Sized> ToChatId for &T {
    fn to_chat_id(&self) -> Option<ChatId> {
        (**self).to_chat_id()
    }
}

impl<T: ToChatId> ToChatId for Option<T> {
    fn to_chat_id(&self) -> Option<ChatId> {
        self.as_ref().and_then(|inner| inner.to_chat_id())
    }
}

macro_rules! impl_to_chat_id_for_int {
    ($($t:ty),*) => {
        $(impl ToChatId for $t {
            fn to_chat_id(&self) -> Option<ChatId> {
                Some(ChatId(self.to_string()))
            }
        })*
    };
}

impl_to_chat_id_for_int!(i32, i64, u32, u64, usize);

/// Normalize a JSON value into a canonical id.
///
/// Numbers use their decimal form (whole floats drop the fraction, so `5`, `5.0` and `"5"`
/// agree). Strings are trimmed. Objects are probed with [`ID_KEYS`]. Booleans, arrays and
/// null carry no identity.
pub fn normalize_id(value: &Value) -> Option<ChatId> {
    normalize_at_depth(value, 0)
}

fn normalize_at_depth(value: &Value, depth: usize) -> Option<ChatId> {
    if depth > MAX_PROBE_DEPTH {
        return None;
    }
    match value {
        Value::Null | Value::Bool(_) | Value::Array(_) => None,
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(ChatId(i.to_string()))
            } else if let Some(u) = n.as_u64() {
                Some(ChatId(u.to_string()))
            } else {
                let f = n.as_f64()?;
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
                    Some(ChatId(format!("{}", f as i64)))
                } else {
                    ChatId::parse(&n.to_string())
                }
            }
        }
        Value::String(s) => ChatId::parse(s),
        Value::Object(map) => probe_at_depth(map, ID_KEYS, depth + 1),
    }
}

/// Probe `keys` in order and normalize the first one that yields an id.
///
/// A key may be a dotted path (`"sender.id"`) into nested objects. A key whose value is itself
/// an object (`"sender": {"Id": 5}`) is normalized as a user object.
pub fn probe_id(map: &Map<String, Value>, keys: &[&str]) -> Option<ChatId> {
    probe_at_depth(map, keys, 0)
}

fn probe_at_depth(map: &Map<String, Value>, keys: &[&str], depth: usize) -> Option<ChatId> {
    keys.iter()
        .filter_map(|key| lookup_path(map, key))
        .find_map(|value| normalize_at_depth(value, depth))
}

/// Resolve a possibly dotted key path inside an object.
pub fn lookup_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = map.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Identity comparison for ownership checks: an absent id never matches anything,
/// including another absent id.
pub fn same_identity(a: Option<&ChatId>, b: Option<&ChatId>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
