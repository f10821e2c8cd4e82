// Async driver
// One task owns the `ChatSync` engine and multiplexes poll ticks, push frames, UI commands and
// completed network calls. Network calls run in spawned tasks that only report back through a
// channel, so engine state is never touched concurrently.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{ChatSync, ChatView, FetchOutcome, FetchTicket, OutboundMessage, PushFrame, SyncAction};
use crate::config::SyncConfig;
use crate::error::{BackendError, ConfigError};
use crate::models::{Contact, ConversationKey, MediaRef};

/// The REST side of the chat service.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Message-like records exchanged with the conversation's peer or group.
    async fn fetch_conversation(&self, key: &ConversationKey) -> Result<Vec<Value>, BackendError>;

    /// Tell the server the conversation has been read. Not awaited by the engine.
    async fn mark_conversation_read(&self, key: &ConversationKey) -> Result<(), BackendError>;

    /// Send a message. `Some(record)` when the server answers with the created record,
    /// `None` when confirmation arrives later as a push echo.
    async fn send_message(&self, outbound: &OutboundMessage) -> Result<Option<Value>, BackendError>;
}

#[derive(Debug, Clone)]
pub enum Command {
    Select(ConversationKey),
    Close,
    /// Refresh a conversation in the background, e.g. for its unread badge.
    Refresh(ConversationKey),
    SetContacts(Vec<Contact>),
    Send {
        target: ConversationKey,
        content: String,
        media: Option<MediaRef>,
    },
}

enum Completion {
    Fetched {
        ticket: FetchTicket,
        result: Result<Vec<Value>, BackendError>,
    },
    Sent {
        outbound: OutboundMessage,
        result: Result<Option<Value>, BackendError>,
    },
}

pub struct SyncDriver<B: ChatBackend> {
    engine: ChatSync,
    backend: Arc<B>,
    poll_interval: Duration,
    view_tx: watch::Sender<ChatView>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: Option<mpsc::Receiver<Completion>>,
    in_flight: HashSet<FetchTicket>,
}

impl<B: ChatBackend> SyncDriver<B> {
    pub fn new(engine: ChatSync, backend: Arc<B>, poll_interval: Duration) -> (Self, watch::Receiver<ChatView>) {
        let (view_tx, view_rx) = watch::channel(engine.view());
        let (completion_tx, completion_rx) = mpsc::channel(100);
        (
            SyncDriver {
                engine,
                backend,
                poll_interval,
                view_tx,
                completion_tx,
                completion_rx: Some(completion_rx),
                in_flight: HashSet::new(),
            },
            view_rx,
        )
    }

    /// Run until the command channel closes. A closed push stream only disables push
    /// handling; polling continues.
    pub async fn run<S>(mut self, mut commands: mpsc::Receiver<Command>, push: S)
    where
        S: Stream<Item = PushFrame> + Unpin + Send,
    {
        let Some(mut completions) = self.completion_rx.take() else {
            error!("Sync driver started twice");
            return;
        };
        let mut push = push.fuse();
        let mut push_open = true;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Sync driver running for user {}", self.engine.me());
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("Command channel closed, stopping sync driver");
                        break;
                    }
                },
                Some(done) = completions.recv() => self.complete(done),
                frame = push.next(), if push_open => match frame {
                    Some(frame) => {
                        let actions = self.engine.handle_push(&frame);
                        self.perform(actions);
                    }
                    None => {
                        warn!("Push channel closed; continuing with polling only");
                        push_open = false;
                    }
                },
                _ = ticker.tick() => self.poll(),
            }
            self.publish();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Select(key) => {
                let (ticket, actions) = self.engine.select_conversation(key);
                self.perform(actions);
                self.spawn_fetch(ticket);
            }
            Command::Close => self.engine.close_conversation(),
            Command::Refresh(key) => {
                let ticket = self.engine.refresh_ticket(key);
                self.spawn_fetch(ticket);
            }
            Command::SetContacts(contacts) => self.engine.set_contacts(&contacts),
            Command::Send { target, content, media } => {
                let outbound = self.engine.send_message(target, content, media, now_millis());
                self.spawn_send(outbound);
            }
        }
    }

    fn poll(&mut self) {
        match self.engine.poll_ticket() {
            Some(ticket) => self.spawn_fetch(ticket),
            None => debug!("Poll tick with no active conversation"),
        }
    }

    fn spawn_fetch(&mut self, ticket: FetchTicket) {
        if !self.in_flight.insert(ticket.clone()) {
            debug!("Fetch for {} already in flight, skipping", ticket.key);
            return;
        }
        let backend = self.backend.clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = backend.fetch_conversation(&ticket.key).await;
            if tx.send(Completion::Fetched { ticket, result }).await.is_err() {
                debug!("Driver stopped before fetch completed");
            }
        });
    }

    fn spawn_send(&self, outbound: OutboundMessage) {
        let backend = self.backend.clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = backend.send_message(&outbound).await;
            if tx.send(Completion::Sent { outbound, result }).await.is_err() {
                debug!("Driver stopped before send completed");
            }
        });
    }

    fn perform(&self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::MarkConversationRead(key) => {
                    let backend = self.backend.clone();
                    tokio::spawn(async move {
                        match backend.mark_conversation_read(&key).await {
                            Ok(()) => debug!("Server acknowledged read of {}", key),
                            Err(e) => error!("Failed to mark {} read: {}", key, e),
                        }
                    });
                }
            }
        }
    }

    fn complete(&mut self, done: Completion) {
        match done {
            Completion::Fetched { ticket, result } => {
                self.in_flight.remove(&ticket);
                match result {
                    Ok(batch) => match self.engine.apply_fetch(&ticket, &batch) {
                        FetchOutcome::Applied { actions } => self.perform(actions),
                        FetchOutcome::Stale => debug!("Dropped stale fetch for {}", ticket.key),
                    },
                    // Next poll tick retries
                    Err(e) => error!("Fetch for {} failed: {}", ticket.key, e),
                }
            }
            Completion::Sent { outbound, result } => match result {
                Ok(Some(record)) => {
                    let outcome = self.engine.confirm_send(&record);
                    debug!("Send of {} confirmed: {:?}", outbound.temp_id, outcome);
                }
                Ok(None) => debug!("Send of {} accepted, waiting for echo", outbound.temp_id),
                Err(e) => error!("Failed to send message {} to {}: {}", outbound.temp_id, outbound.target, e),
            },
        }
    }

    fn publish(&self) {
        let view = self.engine.view();
        self.view_tx.send_if_modified(move |current| {
            if *current != view {
                *current = view;
                true
            } else {
                false
            }
        });
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Handle to a driver running on the tokio runtime.
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ChatView>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Spawn a driver for `engine` and return a handle to it.
    pub fn spawn<B, S>(engine: ChatSync, backend: Arc<B>, poll_interval: Duration, push: S) -> Self
    where
        B: ChatBackend,
        S: Stream<Item = PushFrame> + Unpin + Send + 'static,
    {
        let (driver, view) = SyncDriver::new(engine, backend, poll_interval);
        let (commands, command_rx) = mpsc::channel(100);
        let task = tokio::spawn(driver.run(command_rx, push));
        SyncHandle { commands, view, task }
    }

    /// Build the engine from `config` and poll at its configured interval.
    pub fn spawn_with_config<B, S>(config: &SyncConfig, backend: Arc<B>, push: S) -> Result<Self, ConfigError>
    where
        B: ChatBackend,
        S: Stream<Item = PushFrame> + Unpin + Send + 'static,
    {
        let engine = ChatSync::with_config(config)?;
        Ok(SyncHandle::spawn(engine, backend, config.poll_interval(), push))
    }

    pub async fn send(&self, command: Command) -> bool {
        match self.commands.send(command).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Sync driver is gone, dropping command {:?}", e.0);
                false
            }
        }
    }

    pub async fn select(&self, key: ConversationKey) -> bool {
        self.send(Command::Select(key)).await
    }

    pub async fn send_text(&self, target: ConversationKey, content: impl Into<String>) -> bool {
        self.send(Command::Send {
            target,
            content: content.into(),
            media: None,
        })
        .await
    }

    /// Latest published view.
    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    /// Close the command channel and wait for the driver to finish.
    pub async fn shutdown(self) {
        let SyncHandle { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            error!("Sync driver task failed: {}", e);
        }
    }
}
