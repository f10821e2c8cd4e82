// Common test utilities for integration tests
// This module contains shared code for all integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, LevelFilter};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::timeout;

use chatsync::error::BackendError;
use chatsync::models::ConversationKey;
use chatsync::sync::driver::ChatBackend;
use chatsync::sync::identity::normalize_id;
use chatsync::sync::{ChatId, ChatView, OutboundMessage};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

pub fn id(raw: &str) -> ChatId {
    ChatId::parse(raw).expect("valid id")
}

pub fn direct(raw: &str) -> ConversationKey {
    ConversationKey::Direct(id(raw))
}

pub fn group(raw: &str) -> ConversationKey {
    ConversationKey::Group(id(raw))
}

/// A direct message record in the server's camelCase shape.
pub fn message(id: u64, sender: u64, receiver: u64, content: &str, timestamp: u64) -> Value {
    json!({
        "id": id,
        "senderId": sender,
        "receiverId": receiver,
        "content": content,
        "timestamp": timestamp,
        "isRead": false,
    })
}

/// The same record in the PascalCase shape some endpoints return.
pub fn pascal_message(id: u64, sender: u64, receiver: u64, content: &str, timestamp: u64) -> Value {
    json!({
        "Id": id.to_string(),
        "SenderId": sender.to_string(),
        "ReceiverId": receiver.to_string(),
        "Content": content,
        "Timestamp": timestamp,
    })
}

pub fn group_message(id: u64, sender: u64, group: u64, content: &str, timestamp: u64) -> Value {
    json!({
        "id": id,
        "senderId": sender,
        "groupId": group,
        "content": content,
        "timestamp": timestamp,
    })
}

/// Wait until the published view satisfies `pred`, failing the test after five seconds.
pub async fn wait_for_view<F>(rx: &mut watch::Receiver<ChatView>, pred: F) -> ChatView
where
    F: Fn(&ChatView) -> bool,
{
    let waited = timeout(Duration::from_secs(5), async {
        loop {
            {
                let view = rx.borrow_and_update();
                if pred(&view) {
                    return view.clone();
                }
            }
            if rx.changed().await.is_err() {
                panic!("sync driver stopped while waiting for view");
            }
        }
    })
    .await;
    match waited {
        Ok(view) => view,
        Err(_) => panic!("timed out waiting for view; last view: {:?}", &*rx.borrow()),
    }
}

/// In-memory chat server.
pub struct FakeBackend {
    conversations: Mutex<HashMap<ConversationKey, Vec<Value>>>,
    delays: Mutex<HashMap<ConversationKey, Duration>>,
    next_id: AtomicU64,
    confirm_sends: AtomicBool,
    fail_fetches: AtomicBool,
    fetch_calls: Mutex<HashMap<ConversationKey, usize>>,
    mark_read_calls: Mutex<Vec<ConversationKey>>,
    sent: Mutex<Vec<OutboundMessage>>,
    created: Mutex<Vec<Value>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        FakeBackend {
            conversations: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(100),
            confirm_sends: AtomicBool::new(true),
            fail_fetches: AtomicBool::new(false),
            fetch_calls: Mutex::new(HashMap::new()),
            mark_read_calls: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_messages(self, key: ConversationKey, records: Vec<Value>) -> Self {
        self.conversations.lock().unwrap().insert(key, records);
        self
    }

    pub fn with_delay(self, key: ConversationKey, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(key, delay);
        self
    }

    /// Answer sends with nothing, leaving confirmation to the push echo.
    pub fn without_send_confirmation(self) -> Self {
        self.confirm_sends.store(false, Ordering::SeqCst);
        self
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn push_message(&self, key: ConversationKey, record: Value) {
        self.conversations.lock().unwrap().entry(key).or_default().push(record);
    }

    pub fn fetch_calls(&self, key: &ConversationKey) -> usize {
        self.fetch_calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn mark_read_calls(&self) -> Vec<ConversationKey> {
        self.mark_read_calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Records created by sends, as the server stored them.
    pub fn created(&self) -> Vec<Value> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn fetch_conversation(&self, key: &ConversationKey) -> Result<Vec<Value>, BackendError> {
        *self.fetch_calls.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
        let delay = self.delays.lock().unwrap().get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(BackendError::Network("connection refused".to_string()));
        }
        let records = self
            .conversations
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default();
        debug!("Fake fetch for {} returns {} records", key, records.len());
        Ok(records)
    }

    async fn mark_conversation_read(&self, key: &ConversationKey) -> Result<(), BackendError> {
        self.mark_read_calls.lock().unwrap().push(key.clone());
        if let Some(records) = self.conversations.lock().unwrap().get_mut(key) {
            for record in records.iter_mut() {
                if normalize_id(&record["senderId"]).as_ref() == Some(key.id()) {
                    record["isRead"] = json!(true);
                }
            }
        }
        Ok(())
    }

    async fn send_message(&self, outbound: &OutboundMessage) -> Result<Option<Value>, BackendError> {
        self.sent.lock().unwrap().push(outbound.clone());
        let mut record = outbound.to_payload();
        record["id"] = json!(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.push_message(outbound.target.clone(), record.clone());
        self.created.lock().unwrap().push(record.clone());
        if self.confirm_sends.load(Ordering::SeqCst) {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }
}
