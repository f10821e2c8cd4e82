// Unread accounting
// Per-conversation unread badge count and last-activity timestamp.

use serde::Serialize;

use super::identity::{same_identity, ChatId};
use super::receipts::ReceiptStore;
use crate::models::{ConversationKey, Message};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub unread: usize,
    /// Latest message timestamp in either direction, 0 when there are no messages.
    pub last_activity: u64,
}

/// Summarize a direct conversation with `contact`.
///
/// A message counts as unread only when it was sent by the contact to `me` and neither its
/// own flag nor the receipt store says it was read. Self-authored messages never count.
pub fn summarize_direct(
    history: &[Message],
    me: &ChatId,
    contact: &ChatId,
    store: &ReceiptStore,
) -> ConversationSummary {
    let unread = history
        .iter()
        .filter(|msg| {
            same_identity(msg.sender_id.as_ref(), Some(contact))
                && same_identity(msg.receiver_id.as_ref(), Some(me))
        })
        .filter(|msg| !is_read(msg, store))
        .count();
    ConversationSummary {
        unread,
        last_activity: last_activity(history),
    }
}

/// Summarize a group conversation: unread messages are those with a known sender other than
/// `me` that are not read.
pub fn summarize_group(history: &[Message], me: &ChatId, store: &ReceiptStore) -> ConversationSummary {
    let unread = history
        .iter()
        .filter(|msg| msg.sender_id.is_some() && !same_identity(msg.sender_id.as_ref(), Some(me)))
        .filter(|msg| !is_read(msg, store))
        .count();
    ConversationSummary {
        unread,
        last_activity: last_activity(history),
    }
}

pub fn summarize(
    key: &ConversationKey,
    history: &[Message],
    me: &ChatId,
    store: &ReceiptStore,
) -> ConversationSummary {
    match key {
        ConversationKey::Direct(contact) => summarize_direct(history, me, contact, store),
        ConversationKey::Group(_) => summarize_group(history, me, store),
    }
}

/// Ids of the messages that `summarize` would count as unread.
pub fn unread_ids(key: &ConversationKey, history: &[Message], me: &ChatId, store: &ReceiptStore) -> Vec<ChatId> {
    history
        .iter()
        .filter(|msg| match key {
            ConversationKey::Direct(contact) => {
                same_identity(msg.sender_id.as_ref(), Some(contact))
                    && same_identity(msg.receiver_id.as_ref(), Some(me))
            }
            ConversationKey::Group(_) => {
                msg.sender_id.is_some() && !same_identity(msg.sender_id.as_ref(), Some(me))
            }
        })
        .filter(|msg| !is_read(msg, store))
        .map(|msg| msg.id.clone())
        .collect()
}

fn is_read(msg: &Message, store: &ReceiptStore) -> bool {
    msg.read || store.is_read(&msg.id)
}

fn last_activity(history: &[Message]) -> u64 {
    history.iter().map(|msg| msg.timestamp).max().unwrap_or(0)
}
