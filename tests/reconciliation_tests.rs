// Reconciliation scenarios against the synchronous engine
mod common;

use serde_json::json;

use chatsync::models::DeliveryStatus;
use chatsync::sync::identity::normalize_id;
use chatsync::sync::normalize::MessageNormalizer;
use chatsync::sync::ranking::rank;
use chatsync::sync::unread::{summarize_direct, ConversationSummary};
use chatsync::sync::{same_identity, ChatSync, FetchOutcome, PushFrame, ReceiptStore, SyncAction};
use common::{direct, group, group_message, id, message, pascal_message, setup_logging};

fn engine() -> ChatSync {
    setup_logging();
    let mut sync = ChatSync::new(id("1"));
    sync.set_mark_read_on_open(false);
    sync
}

#[test]
fn test_fetch_counts_unread_from_contact() {
    let mut sync = engine();
    let (ticket, _) = sync.select_conversation(direct("9"));
    let outcome = sync.apply_fetch(
        &ticket,
        &[message(1, 9, 1, "hey", 100), message(2, 9, 1, "there?", 200)],
    );
    assert_eq!(outcome, FetchOutcome::Applied { actions: vec![] });
    assert_eq!(sync.summary(&direct("9")).unread, 2);
    assert_eq!(sync.summary(&direct("9")).last_activity, 200);
}

#[test]
fn test_read_push_survives_stale_poll() {
    let mut sync = engine();
    let (ticket, _) = sync.select_conversation(direct("9"));
    sync.apply_fetch(&ticket, &[message(7, 9, 1, "seen?", 100), message(8, 9, 1, "hello", 110)]);

    sync.handle_push(&PushFrame::new("MessageRead", json!({"messageId": "7", "readAt": 150})));

    let poll = sync.poll_ticket().expect("active conversation");
    sync.apply_fetch(&poll, &[message(7, 9, 1, "seen?", 100), message(8, 9, 1, "hello", 110)]);

    let history = sync.messages(&direct("9"));
    let seven = history.iter().find(|m| m.id.as_str() == "7").expect("message 7");
    assert!(seven.read);
    assert_eq!(seven.read_at, Some(150));
    assert_eq!(sync.summary(&direct("9")).unread, 1);
}

#[test]
fn test_optimistic_send_reconciled_by_echo() {
    let mut sync = engine();
    let (ticket, _) = sync.select_conversation(direct("9"));
    sync.apply_fetch(&ticket, &[message(1, 9, 1, "hi", 100)]);

    let outbound = sync.send_message(direct("9"), "lunch?", None, 200);
    assert!(outbound.temp_id.as_str().starts_with("temp-"));
    let pending = sync.messages(&direct("9")).last().expect("optimistic").clone();
    assert_eq!(pending.delivery_status("temp-"), DeliveryStatus::Sending);

    sync.handle_push(&PushFrame::new("ReceiveMessage", message(55, 1, 9, "lunch?", 201)));
    // Redelivery of the echo, then the send endpoint's confirmation
    sync.handle_push(&PushFrame::new("ReceiveMessage", message(55, 1, 9, "lunch?", 201)));
    sync.confirm_send(&pascal_message(55, 1, 9, "lunch?", 201));

    let ids: Vec<&str> = sync.messages(&direct("9")).iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "55"]);
}

#[test]
fn test_fetch_then_echo_leaves_single_record() {
    let mut sync = engine();
    let (ticket, _) = sync.select_conversation(direct("9"));
    sync.send_message(direct("9"), "on my way", None, 300);

    // The poll sees the server copy before the echo arrives
    sync.apply_fetch(&ticket, &[message(60, 1, 9, "on my way", 301)]);
    sync.handle_push(&PushFrame::new("ReceiveMessage", message(60, 1, 9, "on my way", 301)));

    let history = sync.messages(&direct("9"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id.as_str(), "60");
    assert_eq!(history[0].delivery_status("temp-"), DeliveryStatus::Sent);
}

#[test]
fn test_optimistic_send_survives_fetch_without_echo() {
    let mut sync = engine();
    let (ticket, _) = sync.select_conversation(direct("9"));
    sync.send_message(direct("9"), "pending", None, 300);
    sync.apply_fetch(&ticket, &[message(1, 9, 1, "earlier", 100)]);

    let history = sync.messages(&direct("9"));
    assert_eq!(history.len(), 2);
    assert!(history[1].is_optimistic("temp-"));
}

#[test]
fn test_repeated_polls_of_id_less_record_keep_one_copy() {
    let mut sync = engine();
    let (ticket, _) = sync.select_conversation(direct("9"));
    let batch = [json!({"msgKey": 7, "senderId": 9, "receiverId": 1, "content": "hi", "timestamp": 5})];
    for _ in 0..3 {
        let poll = sync.poll_ticket().expect("active conversation");
        assert_eq!(poll, ticket);
        sync.apply_fetch(&poll, &batch);
    }
    assert_eq!(sync.messages(&direct("9")).len(), 1);
    assert_eq!(sync.summary(&direct("9")).unread, 1);

    // Capitalized id spelling is recognized outright
    let spelled = [json!({"messageID": 8, "senderId": 9, "receiverId": 1, "content": "yo", "timestamp": 6})];
    for _ in 0..3 {
        sync.apply_fetch(&ticket, &spelled);
    }
    let ids: Vec<&str> = sync.messages(&direct("9")).iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["8"]);
}

#[test]
fn test_repeated_text_send_survives_older_poll() {
    let mut sync = engine();
    let (ticket, _) = sync.select_conversation(direct("9"));
    sync.apply_fetch(&ticket, &[message(1, 1, 9, "ok", 100)]);
    sync.send_message(direct("9"), "ok", None, 500);
    assert_eq!(sync.messages(&direct("9")).len(), 2);

    // Snapshot taken before the send reached the server
    sync.apply_fetch(&ticket, &[message(1, 1, 9, "ok", 100)]);
    let history = sync.messages(&direct("9"));
    assert_eq!(history.len(), 2);
    assert!(history[1].is_optimistic("temp-"));

    sync.apply_fetch(&ticket, &[message(1, 1, 9, "ok", 100), message(2, 1, 9, "ok", 501)]);
    let ids: Vec<&str> = sync.messages(&direct("9")).iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2"]);
}

#[test]
fn test_switch_discards_late_fetch() {
    let mut sync = engine();
    let (k_ticket, _) = sync.select_conversation(direct("2"));
    let (l_ticket, _) = sync.select_conversation(direct("3"));

    sync.apply_fetch(&l_ticket, &[message(10, 3, 1, "from L", 100)]);
    let late = sync.apply_fetch(&k_ticket, &[message(20, 2, 1, "from K", 90)]);

    assert_eq!(late, FetchOutcome::Stale);
    let view = sync.view();
    assert_eq!(view.active, Some(direct("3")));
    let ids: Vec<&str> = view.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["10"]);
}

#[test]
fn test_open_and_poll_converge_without_push() {
    setup_logging();
    let mut sync = ChatSync::new(id("1"));
    let (ticket, actions) = sync.select_conversation(direct("9"));
    assert_eq!(actions, vec![SyncAction::MarkConversationRead(direct("9"))]);

    // Server has not processed the mark-read request yet
    let outcome = sync.apply_fetch(&ticket, &[message(1, 9, 1, "a", 100), message(2, 9, 1, "b", 110)]);
    assert_eq!(
        outcome,
        FetchOutcome::Applied {
            actions: vec![SyncAction::MarkConversationRead(direct("9"))]
        }
    );
    assert_eq!(sync.summary(&direct("9")).unread, 0);

    let poll = sync.poll_ticket().expect("active conversation");
    let outcome = sync.apply_fetch(&poll, &[message(1, 9, 1, "a", 100), message(2, 9, 1, "b", 110)]);
    // Nothing new to mark, so no further request
    assert_eq!(outcome, FetchOutcome::Applied { actions: vec![] });
    assert_eq!(sync.view().total_unread(), 0);
}

#[test]
fn test_bulk_read_event_marks_sent_messages() {
    let mut sync = engine();
    let (ticket, _) = sync.select_conversation(direct("9"));
    sync.apply_fetch(&ticket, &[message(1, 1, 9, "a", 100), message(2, 1, 9, "b", 110)]);

    let frame = PushFrame::new("MessagesRead", json!({"readerId": 9, "messageIds": [1, "2"], "readAt": 500}));
    sync.handle_push(&frame);
    sync.handle_push(&frame);

    for msg in sync.messages(&direct("9")) {
        assert_eq!(msg.delivery_status("temp-"), DeliveryStatus::Read);
    }
    assert_eq!(sync.store().read_count(), 2);
}

#[test]
fn test_group_unread_and_ranking() {
    let mut sync = engine();
    let g = sync.refresh_ticket(group("77"));
    sync.apply_fetch(
        &g,
        &[
            group_message(1, 5, 77, "one", 100),
            group_message(2, 6, 77, "two", 120),
            group_message(3, 1, 77, "mine", 130),
        ],
    );
    let d = sync.refresh_ticket(direct("9"));
    sync.apply_fetch(&d, &[message(4, 9, 1, "late", 900)]);

    let view = sync.view();
    assert_eq!(view.unread_for(&group("77")), 2);
    assert_eq!(view.unread_for(&direct("9")), 1);
    assert_eq!(view.ranking, vec![group("77"), direct("9")]);
}

#[test]
fn test_unknown_push_events_are_ignored() {
    let mut sync = engine();
    let before = sync.view();
    assert!(sync.handle_push(&PushFrame::new("UserTyping", json!({"userId": 9}))).is_empty());
    assert!(sync.handle_push(&PushFrame::new("MessageRead", json!({"messageId": null}))).is_empty());
    assert_eq!(sync.view(), before);
}

#[test]
fn test_identity_normalization_properties() {
    assert_eq!(normalize_id(&json!({"id": 5})), normalize_id(&json!({"Id": "5"})));
    assert_eq!(normalize_id(&json!(5)), normalize_id(&json!(" 5 ")));
    assert_eq!(normalize_id(&json!(null)), None);
    assert!(!same_identity(None, None));
    assert!(same_identity(Some(&id("5")), normalize_id(&json!({"userId": 5})).as_ref()));
}

#[test]
fn test_normalizer_is_idempotent() {
    let normalizer = MessageNormalizer::default();
    let raw = json!({
        "Id": 12,
        "From": {"id": "3"},
        "ReceiverId": 1,
        "Text": "photo",
        "CreatedAt": "2024-03-01T10:00:00Z",
        "ImageUrl": "https://cdn.example.com/p.jpg",
        "IsRead": "true",
    });
    let once = normalizer.normalize(&raw);
    let twice = normalizer.normalize(&serde_json::to_value(&once).expect("serialize"));
    assert_eq!(once, twice);
    assert!(once.read);
    assert_eq!(once.sender_id, Some(id("3")));
}

#[test]
fn test_self_authored_history_has_no_unread() {
    let normalizer = MessageNormalizer::default();
    let history = normalizer.normalize_batch(&[
        message(1, 1, 9, "a", 1),
        json!({"id": 2, "senderId": 1, "receiverId": 9, "isRead": false}),
        json!({"id": 3, "senderId": "1", "receiverId": "9", "isRead": true}),
    ]);
    let summary = summarize_direct(&history, &id("1"), &id("9"), &ReceiptStore::new());
    assert_eq!(summary.unread, 0);
    assert_eq!(summary.last_activity, 1);
}

#[test]
fn test_ranking_prefers_unread_then_recency() {
    let entries = vec![
        ("b", ConversationSummary { unread: 0, last_activity: 500 }),
        ("c", ConversationSummary { unread: 1, last_activity: 100 }),
        ("a", ConversationSummary { unread: 2, last_activity: 5 }),
        ("d", ConversationSummary { unread: 0, last_activity: 0 }),
    ];
    assert_eq!(rank(&entries), vec!["a", "c", "b", "d"]);
}
