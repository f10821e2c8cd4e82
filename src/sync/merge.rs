// Conversation merging
// Folds a freshly fetched batch into the in-memory history of one conversation, and
// reconciles optimistic sends with their server-confirmed records.

use log::{debug, info};
use std::collections::HashMap;

use super::identity::{same_identity, ChatId};
use super::receipts::ReceiptStore;
use crate::models::Message;

/// What happened to a confirmed record when it was folded into a history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No matching record existed; it was inserted.
    Inserted,
    /// It superseded an optimistic local record.
    ReplacedOptimistic,
    /// A record with the same id already existed and was updated in place.
    Updated,
}

/// Merge a fetched batch with the previous history of the same conversation.
///
/// * every id in `fresh` appears exactly once
/// * receipts in `store` and flags already set on the previous record force flags up
/// * previous records missing from `fresh` survive only when `store` knows them, or when
///   they are unconfirmed optimistic sends that no fresh record supersedes
/// * only records new to this conversation can supersede an optimistic send, each at most one
/// * the result is sorted by timestamp; ties keep prior relative order
pub fn merge_conversation(
    previous: &[Message],
    fresh: Vec<Message>,
    store: &ReceiptStore,
    temp_prefix: &str,
) -> Vec<Message> {
    let previous_index: HashMap<&ChatId, usize> = previous
        .iter()
        .enumerate()
        .map(|(index, msg)| (&msg.id, index))
        .collect();

    let mut merged: Vec<Message> = Vec::with_capacity(fresh.len() + previous.len());
    let mut positions: HashMap<ChatId, usize> = HashMap::new();

    for mut msg in fresh {
        if let Some(&existing) = positions.get(&msg.id) {
            // Duplicate within the batch: keep the first, OR the flags
            let (delivered, read, read_at) = (msg.delivered, msg.read, msg.read_at);
            merged[existing].absorb_flags(delivered, read, read_at);
            continue;
        }
        if let Some(&index) = previous_index.get(&msg.id) {
            let prior = &previous[index];
            msg.absorb_flags(prior.delivered, prior.read, prior.read_at);
        }
        store.overlay(&mut msg);
        positions.insert(msg.id.clone(), merged.len());
        merged.push(msg);
    }

    // Records already loaded before this fetch predate any pending send
    let mut claimable: Vec<usize> = merged
        .iter()
        .enumerate()
        .filter(|(_, msg)| !previous_index.contains_key(&msg.id))
        .map(|(index, _)| index)
        .collect();

    let mut dropped = 0usize;
    for prior in previous {
        if positions.contains_key(&prior.id) {
            continue;
        }
        let keep = if prior.is_optimistic(temp_prefix) {
            match claimable
                .iter()
                .position(|&index| supersedes(&merged[index], prior, temp_prefix))
            {
                Some(slot) => {
                    let index = claimable.remove(slot);
                    debug!("Optimistic message {} confirmed as {}", prior.id, merged[index].id);
                    false
                }
                None => true,
            }
        } else {
            store.knows(&prior.id)
        };
        if keep {
            let mut kept = prior.clone();
            store.overlay(&mut kept);
            positions.insert(kept.id.clone(), merged.len());
            merged.push(kept);
        } else {
            dropped += 1;
        }
    }
    if dropped > 0 {
        debug!("Merge dropped {} records absent from the fetched batch", dropped);
    }

    sort_history(&mut merged, &previous_index);
    merged
}

/// Fold one server-confirmed record (fetch confirmation or push echo) into a history.
///
/// A record whose id is already present updates it. Otherwise the first optimistic record
/// with the same sender, receiver/group and content is replaced. Otherwise it is inserted.
/// Applying the same confirmation twice leaves a single record.
pub fn reconcile_confirmed(
    history: &mut Vec<Message>,
    mut confirmed: Message,
    store: &ReceiptStore,
    temp_prefix: &str,
) -> ReconcileOutcome {
    store.overlay(&mut confirmed);

    if let Some(existing) = history.iter_mut().find(|msg| msg.id == confirmed.id) {
        let (delivered, read, read_at) = (existing.delivered, existing.read, existing.read_at);
        confirmed.absorb_flags(delivered, read, read_at);
        if confirmed.timestamp == 0 {
            confirmed.timestamp = existing.timestamp;
        }
        *existing = confirmed;
        sort_by_timestamp(history);
        return ReconcileOutcome::Updated;
    }

    if let Some(pending) = history
        .iter_mut()
        .find(|msg| supersedes(&confirmed, msg, temp_prefix))
    {
        info!("Optimistic message {} confirmed as {}", pending.id, confirmed.id);
        if confirmed.timestamp == 0 {
            confirmed.timestamp = pending.timestamp;
        }
        *pending = confirmed;
        sort_by_timestamp(history);
        return ReconcileOutcome::ReplacedOptimistic;
    }

    history.push(confirmed);
    sort_by_timestamp(history);
    ReconcileOutcome::Inserted
}

// Allowed disagreement between the local clock and server timestamps
const CLOCK_SKEW_MS: u64 = 5 * 60 * 1000;

/// Whether `confirmed` is the server's version of the optimistic `pending` record.
pub fn supersedes(confirmed: &Message, pending: &Message, temp_prefix: &str) -> bool {
    if !pending.is_optimistic(temp_prefix) || confirmed.is_optimistic(temp_prefix) {
        return false;
    }
    // A record stamped well before the send cannot confirm it
    if confirmed.timestamp != 0 && confirmed.timestamp.saturating_add(CLOCK_SKEW_MS) < pending.timestamp {
        return false;
    }
    if !same_identity(confirmed.sender_id.as_ref(), pending.sender_id.as_ref()) {
        return false;
    }
    let same_target = match (&pending.group_id, &confirmed.group_id) {
        (Some(_), _) | (_, Some(_)) => {
            same_identity(confirmed.group_id.as_ref(), pending.group_id.as_ref())
        }
        (None, None) => same_identity(confirmed.receiver_id.as_ref(), pending.receiver_id.as_ref()),
    };
    same_target && confirmed.content == pending.content && confirmed.media == pending.media
}

/// Flip the flags of a loaded record in place. Returns whether the record was found.
pub fn patch_flags(
    history: &mut [Message],
    message_id: &ChatId,
    delivered: bool,
    read: bool,
    read_at: Option<u64>,
) -> bool {
    match history.iter_mut().find(|msg| &msg.id == message_id) {
        Some(msg) => {
            msg.absorb_flags(delivered, read, read_at);
            true
        }
        None => false,
    }
}

fn sort_history(merged: &mut [Message], previous_index: &HashMap<&ChatId, usize>) {
    let rank_base = previous_index.len();
    let ranks: HashMap<ChatId, usize> = merged
        .iter()
        .enumerate()
        .map(|(arrival, msg)| {
            let rank = previous_index
                .get(&msg.id)
                .copied()
                .unwrap_or(rank_base + arrival);
            (msg.id.clone(), rank)
        })
        .collect();
    merged.sort_by_key(|msg| (msg.timestamp, ranks.get(&msg.id).copied().unwrap_or(usize::MAX)));
}

// slice::sort_by_key is stable, so equal timestamps keep their current order
fn sort_by_timestamp(history: &mut [Message]) {
    history.sort_by_key(|msg| msg.timestamp);
}
