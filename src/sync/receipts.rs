// Read/delivery receipt overlay
// Message ids known to be delivered or read, fed by push events and local reads.
// Consulted on every merge so a lagging fetch can never un-read a message.
//
// Entries live for the whole session; there is no eviction.

use log::{debug, trace};
use std::collections::HashSet;

use super::identity::{ChatId, ToChatId};
use crate::models::Message;

#[derive(Debug, Default, Clone)]
pub struct ReceiptStore {
    delivered: HashSet<ChatId>,
    read: HashSet<ChatId>,
}

impl ReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery. Returns whether the id was new to the delivered set.
    pub fn mark_delivered(&mut self, message_id: impl ToChatId) -> bool {
        let Some(id) = message_id.to_chat_id() else {
            debug!("Ignoring delivery receipt without a usable message id");
            return false;
        };
        let inserted = self.delivered.insert(id);
        if inserted {
            trace!("Marked message delivered");
        }
        inserted
    }

    /// Record a read. Also records the delivery. Returns whether the id was new to the read set.
    pub fn mark_read(&mut self, message_id: impl ToChatId) -> bool {
        let Some(id) = message_id.to_chat_id() else {
            debug!("Ignoring read receipt without a usable message id");
            return false;
        };
        self.delivered.insert(id.clone());
        self.read.insert(id)
    }

    /// Mark a batch read, as received in one push event. Returns how many were new.
    pub fn bulk_mark_read<I>(&mut self, message_ids: I) -> usize
    where
        I: IntoIterator,
        I::Item: ToChatId,
    {
        let newly_read = message_ids
            .into_iter()
            .filter(|id| self.mark_read(id))
            .count();
        debug!("Bulk read receipt marked {} new messages read", newly_read);
        newly_read
    }

    /// Read implies delivered, even if the read arrived first.
    pub fn is_delivered(&self, message_id: impl ToChatId) -> bool {
        message_id
            .to_chat_id()
            .map_or(false, |id| self.delivered.contains(&id) || self.read.contains(&id))
    }

    pub fn is_read(&self, message_id: impl ToChatId) -> bool {
        message_id
            .to_chat_id()
            .map_or(false, |id| self.read.contains(&id))
    }

    /// Whether the store has any receipt for this id.
    pub fn knows(&self, message_id: &ChatId) -> bool {
        self.delivered.contains(message_id) || self.read.contains(message_id)
    }

    /// Force the message's flags up to what the store knows.
    pub fn overlay(&self, message: &mut Message) {
        let read = self.read.contains(&message.id);
        let delivered = read || self.delivered.contains(&message.id);
        message.absorb_flags(delivered, read, None);
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.union(&self.read).count()
    }

    pub fn read_count(&self) -> usize {
        self.read.len()
    }
}
