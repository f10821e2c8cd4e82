// Client-side chat state reconciliation
// Merges optimistic local sends, periodic fetch snapshots and push events into one view:
// the active conversation's messages, per-conversation unread counts, and the ordering of
// the conversation list.
//
// `ChatSync` is a plain state machine. Every mutation is synchronous, so the next call that
// derives unread counts always sees it. `driver` wraps it for a tokio runtime.

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

pub mod driver;
pub mod events;
pub mod identity;
pub mod merge;
pub mod normalize;
pub mod ranking;
pub mod receipts;
pub mod unread;

pub use events::{PushEvent, PushFrame};
pub use identity::{same_identity, ChatId, ToChatId};
pub use merge::ReconcileOutcome;
pub use normalize::MessageNormalizer;
pub use receipts::ReceiptStore;
pub use unread::ConversationSummary;

use crate::config::SyncConfig;
use crate::error::ConfigError;
use crate::models::{Contact, ConversationKey, MediaRef, Message};

/// Whether a fetch was started for the displayed conversation or only to refresh badges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchScope {
    Active,
    Background,
}

/// Tags an in-flight fetch with the conversation and selection it was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchTicket {
    pub key: ConversationKey,
    pub scope: FetchScope,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied { actions: Vec<SyncAction> },
    /// The selection changed while the fetch was in flight; the batch was discarded.
    Stale,
}

/// Side effects the caller should perform. All are fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    MarkConversationRead(ConversationKey),
}

/// An optimistic send, ready to hand to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub temp_id: ChatId,
    pub sender_id: ChatId,
    pub target: ConversationKey,
    pub content: String,
    pub media: Option<MediaRef>,
    pub timestamp: u64,
}

impl OutboundMessage {
    /// Request body for the send endpoint.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "senderId": self.sender_id,
            "content": self.content,
            "timestamp": self.timestamp,
        });
        let target_field = match &self.target {
            ConversationKey::Direct(_) => "receiverId",
            ConversationKey::Group(_) => "groupId",
        };
        payload[target_field] = json!(self.target.id());
        if let Some(media) = &self.media {
            payload["mediaUrl"] = json!(media.url);
            payload["mediaType"] = json!(media.kind.as_str());
        }
        payload
    }
}

/// Everything the UI renders from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub active: Option<ConversationKey>,
    pub messages: Vec<Message>,
    pub unread: BTreeMap<ConversationKey, usize>,
    pub last_activity: BTreeMap<ConversationKey, u64>,
    pub ranking: Vec<ConversationKey>,
}

impl ChatView {
    pub fn unread_for(&self, key: &ConversationKey) -> usize {
        self.unread.get(key).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> usize {
        self.unread.values().sum()
    }
}

pub struct ChatSync {
    me: ChatId,
    normalizer: MessageNormalizer,
    store: ReceiptStore,
    histories: HashMap<ConversationKey, Vec<Message>>,
    // Display order before ranking: contacts first, then conversations as they appear
    known: Vec<ConversationKey>,
    active: Option<ConversationKey>,
    generation: u64,
    mark_read_on_open: bool,
}

impl ChatSync {
    pub fn new(me: ChatId) -> Self {
        ChatSync {
            me,
            normalizer: MessageNormalizer::default(),
            store: ReceiptStore::new(),
            histories: HashMap::new(),
            known: Vec::new(),
            active: None,
            generation: 0,
            mark_read_on_open: true,
        }
    }

    pub fn with_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        let mut sync = ChatSync::new(config.user_chat_id()?);
        sync.normalizer = MessageNormalizer::new(config.temp_id_prefix.clone());
        sync.mark_read_on_open = config.mark_read_on_open;
        Ok(sync)
    }

    pub fn me(&self) -> &ChatId {
        &self.me
    }

    pub fn store(&self) -> &ReceiptStore {
        &self.store
    }

    pub fn normalizer(&self) -> &MessageNormalizer {
        &self.normalizer
    }

    pub fn active(&self) -> Option<&ConversationKey> {
        self.active.as_ref()
    }

    pub fn set_mark_read_on_open(&mut self, enabled: bool) {
        self.mark_read_on_open = enabled;
    }

    /// Register the contact list so contacts without messages still get ranked.
    pub fn set_contacts(&mut self, contacts: &[Contact]) {
        for contact in contacts {
            self.remember(ConversationKey::Direct(contact.id.clone()));
        }
    }

    fn remember(&mut self, key: ConversationKey) {
        if !self.known.contains(&key) {
            self.known.push(key);
        }
    }

    /// Switch the displayed conversation. Any fetch issued for the previous selection
    /// becomes stale. Returns the ticket for the initial fetch of the new selection.
    pub fn select_conversation(&mut self, key: ConversationKey) -> (FetchTicket, Vec<SyncAction>) {
        self.generation += 1;
        info!("Selecting conversation {} (generation {})", key, self.generation);
        self.remember(key.clone());
        self.active = Some(key.clone());

        let mut actions = Vec::new();
        if self.mark_read_on_open {
            self.mark_read_locally(&key);
            actions.push(SyncAction::MarkConversationRead(key.clone()));
        }
        let ticket = FetchTicket {
            key,
            scope: FetchScope::Active,
            generation: self.generation,
        };
        (ticket, actions)
    }

    /// Stop displaying any conversation. In-flight fetches for it become stale.
    pub fn close_conversation(&mut self) {
        if let Some(key) = self.active.take() {
            info!("Closing conversation {}", key);
        }
        self.generation += 1;
    }

    /// Ticket for the next poll of the displayed conversation, if any.
    pub fn poll_ticket(&self) -> Option<FetchTicket> {
        self.active.as_ref().map(|key| FetchTicket {
            key: key.clone(),
            scope: FetchScope::Active,
            generation: self.generation,
        })
    }

    /// Ticket for refreshing a conversation's history in the background (badge counts).
    pub fn refresh_ticket(&self, key: ConversationKey) -> FetchTicket {
        FetchTicket {
            key,
            scope: FetchScope::Background,
            generation: self.generation,
        }
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        match ticket.scope {
            FetchScope::Active => {
                ticket.generation == self.generation && self.active.as_ref() == Some(&ticket.key)
            }
            FetchScope::Background => true,
        }
    }

    /// Fold a fetched batch into the ticket's conversation.
    pub fn apply_fetch(&mut self, ticket: &FetchTicket, batch: &[Value]) -> FetchOutcome {
        if !self.is_current(ticket) {
            warn!(
                "Discarding stale fetch for {} (generation {}, now {})",
                ticket.key, ticket.generation, self.generation
            );
            return FetchOutcome::Stale;
        }

        let fresh: Vec<Message> = self
            .normalizer
            .normalize_batch(batch)
            .into_iter()
            .filter(|msg| match msg.conversation_key(&self.me) {
                Some(key) if key != ticket.key => {
                    warn!("Fetched message {} belongs to {}, not {}", msg.id, key, ticket.key);
                    false
                }
                _ => true,
            })
            .collect();

        let previous = self.histories.remove(&ticket.key).unwrap_or_default();
        let merged = merge::merge_conversation(
            &previous,
            fresh,
            &self.store,
            self.normalizer.temp_prefix(),
        );
        debug!(
            "Merged fetch for {}: {} -> {} messages",
            ticket.key,
            previous.len(),
            merged.len()
        );
        self.histories.insert(ticket.key.clone(), merged);
        self.remember(ticket.key.clone());

        let mut actions = Vec::new();
        if self.is_displayed(&ticket.key) && self.mark_read_on_open && self.mark_read_locally(&ticket.key) > 0 {
            actions.push(SyncAction::MarkConversationRead(ticket.key.clone()));
        }
        FetchOutcome::Applied { actions }
    }

    /// Decode and apply one push frame. Unknown or malformed frames are ignored.
    pub fn handle_push(&mut self, frame: &PushFrame) -> Vec<SyncAction> {
        match PushEvent::decode(frame, &self.normalizer) {
            Some(event) => self.apply_push(event),
            None => Vec::new(),
        }
    }

    /// Apply a decoded push event. Idempotent under redelivery.
    pub fn apply_push(&mut self, event: PushEvent) -> Vec<SyncAction> {
        match event {
            PushEvent::MessagesRead {
                reader_id,
                message_ids,
                read_at,
            } => {
                debug!("{} messages read by {:?}", message_ids.len(), reader_id);
                self.store.bulk_mark_read(&message_ids);
                for id in &message_ids {
                    self.patch_everywhere(id, true, true, read_at);
                }
                Vec::new()
            }
            PushEvent::MessageRead { message_id, read_at } => {
                debug!("Message {} read", message_id);
                self.store.mark_read(&message_id);
                self.patch_everywhere(&message_id, true, true, read_at);
                Vec::new()
            }
            PushEvent::MessagesDelivered { message_ids } => {
                for id in &message_ids {
                    self.store.mark_delivered(id);
                    self.patch_everywhere(id, true, false, None);
                }
                Vec::new()
            }
            PushEvent::MessageReceived(message) => self.receive(message),
        }
    }

    fn receive(&mut self, message: Message) -> Vec<SyncAction> {
        if message.is_optimistic(self.normalizer.temp_prefix()) || message.has_derived_id() {
            debug!("Ignoring pushed message without a server id");
            return Vec::new();
        }
        let Some(key) = message.conversation_key(&self.me) else {
            warn!(
                "Pushed message {} does not involve us (sender {:?}, receiver {:?})",
                message.id, message.sender_id, message.receiver_id
            );
            return Vec::new();
        };
        let incoming = !same_identity(message.sender_id.as_ref(), Some(&self.me));
        let outcome = self.reconcile(&key, message);
        debug!("Pushed message folded into {}: {:?}", key, outcome);

        let mut actions = Vec::new();
        if incoming && self.is_displayed(&key) && self.mark_read_on_open && self.mark_read_locally(&key) > 0 {
            actions.push(SyncAction::MarkConversationRead(key));
        }
        actions
    }

    fn reconcile(&mut self, key: &ConversationKey, message: Message) -> ReconcileOutcome {
        self.remember(key.clone());
        let history = self.histories.entry(key.clone()).or_default();
        merge::reconcile_confirmed(history, message, &self.store, self.normalizer.temp_prefix())
    }

    /// Add an optimistic message for `target` and return what to send.
    pub fn send_message(
        &mut self,
        target: ConversationKey,
        content: impl Into<String>,
        media: Option<MediaRef>,
        timestamp: u64,
    ) -> OutboundMessage {
        let temp_id = self.normalizer.temp_id();
        let (receiver_id, group_id) = match &target {
            ConversationKey::Direct(id) => (Some(id.clone()), None),
            ConversationKey::Group(id) => (None, Some(id.clone())),
        };
        let content = content.into();
        let optimistic = Message {
            id: temp_id.clone(),
            sender_id: Some(self.me.clone()),
            receiver_id,
            group_id,
            content: content.clone(),
            media: media.clone(),
            timestamp,
            delivered: false,
            read: false,
            read_at: None,
            sender_name: None,
            sender_avatar: None,
        };
        info!("Sending message {} to {}", temp_id, target);
        self.remember(target.clone());
        let history = self.histories.entry(target.clone()).or_default();
        history.push(optimistic);
        history.sort_by_key(|msg| msg.timestamp);

        OutboundMessage {
            temp_id,
            sender_id: self.me.clone(),
            target,
            content,
            media,
            timestamp,
        }
    }

    /// Fold a created-record confirmation from the send endpoint.
    pub fn confirm_send(&mut self, record: &Value) -> Option<ReconcileOutcome> {
        let message = self.normalizer.normalize(record);
        if message.is_optimistic(self.normalizer.temp_prefix()) || message.has_derived_id() {
            warn!("Send confirmation carries no message id; waiting for fetch or echo");
            return None;
        }
        let key = message.conversation_key(&self.me)?;
        Some(self.reconcile(&key, message))
    }

    /// Mark everything unread in `key` as read in the receipt store and the loaded history.
    /// Returns how many messages changed.
    pub fn mark_read_locally(&mut self, key: &ConversationKey) -> usize {
        let Some(history) = self.histories.get_mut(key) else {
            return 0;
        };
        let ids = unread::unread_ids(key, history, &self.me, &self.store);
        for id in &ids {
            self.store.mark_read(id);
            merge::patch_flags(history, id, true, true, None);
        }
        if !ids.is_empty() {
            info!("Marked {} messages read in {}", ids.len(), key);
        }
        ids.len()
    }

    fn patch_everywhere(&mut self, id: &ChatId, delivered: bool, read: bool, read_at: Option<u64>) {
        for history in self.histories.values_mut() {
            if merge::patch_flags(history, id, delivered, read, read_at) {
                break;
            }
        }
    }

    fn is_displayed(&self, key: &ConversationKey) -> bool {
        self.active.as_ref() == Some(key)
    }

    pub fn messages(&self, key: &ConversationKey) -> &[Message] {
        self.histories.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn summary(&self, key: &ConversationKey) -> ConversationSummary {
        unread::summarize(key, self.messages(key), &self.me, &self.store)
    }

    /// Conversation keys in display order.
    pub fn ranking(&self) -> Vec<ConversationKey> {
        let entries: Vec<(ConversationKey, ConversationSummary)> = self
            .known
            .iter()
            .map(|key| (key.clone(), self.summary(key)))
            .collect();
        ranking::rank(&entries)
    }

    pub fn view(&self) -> ChatView {
        let mut unread = BTreeMap::new();
        let mut last_activity = BTreeMap::new();
        let mut entries = Vec::with_capacity(self.known.len());
        for key in &self.known {
            let summary = self.summary(key);
            unread.insert(key.clone(), summary.unread);
            last_activity.insert(key.clone(), summary.last_activity);
            entries.push((key.clone(), summary));
        }
        ChatView {
            active: self.active.clone(),
            messages: self
                .active
                .as_ref()
                .map(|key| self.messages(key).to_vec())
                .unwrap_or_default(),
            unread,
            last_activity,
            ranking: ranking::rank(&entries),
        }
    }
}
