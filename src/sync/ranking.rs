// Conversation list ordering: unread first (more unread first, then most recent),
// then everything else by most recent activity.

use std::cmp::Ordering;

use super::unread::ConversationSummary;

pub fn compare_summaries(a: &ConversationSummary, b: &ConversationSummary) -> Ordering {
    match (a.unread > 0, b.unread > 0) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => b
            .unread
            .cmp(&a.unread)
            .then_with(|| b.last_activity.cmp(&a.last_activity)),
        (false, false) => b.last_activity.cmp(&a.last_activity),
    }
}

/// Order entries for display. Stable: entries that compare equal keep their input order.
pub fn rank<K: Clone>(entries: &[(K, ConversationSummary)]) -> Vec<K> {
    let mut ordered: Vec<&(K, ConversationSummary)> = entries.iter().collect();
    ordered.sort_by(|(_, a), (_, b)| compare_summaries(a, b));
    ordered.into_iter().map(|(key, _)| key.clone()).collect()
}
