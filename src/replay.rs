// Scripted replay of selects, fetches, pushes and sends against a `ChatSync` engine.
// Fetch responses are supplied inline, so reconciliation can be reproduced without a server.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use chatsync::models::{Contact, ConversationKey, MediaKind, MediaRef};
use chatsync::sync::identity::normalize_id;
use chatsync::sync::{ChatSync, ChatView, FetchOutcome, FetchTicket, PushFrame, SyncAction};

#[derive(Debug, Deserialize)]
pub struct Script {
    /// Local user id, used when neither `--me` nor a config file provides one.
    #[serde(default)]
    pub me: Option<Value>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct ScriptContact {
    pub id: Value,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Contacts {
        contacts: Vec<ScriptContact>,
    },
    /// `label` names the ticket so a later `fetch` can resolve against it after a switch.
    Select {
        conversation: String,
        #[serde(default)]
        label: Option<String>,
    },
    Close,
    Fetch {
        conversation: String,
        messages: Vec<Value>,
        #[serde(default)]
        ticket: Option<String>,
    },
    Push {
        event: String,
        #[serde(default)]
        payload: Value,
    },
    Send {
        conversation: String,
        content: String,
        #[serde(default)]
        media_url: Option<String>,
        #[serde(default)]
        timestamp: u64,
    },
    Confirm {
        record: Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub view: ChatView,
    /// Fire-and-forget requests the engine asked for, in order.
    pub actions: Vec<String>,
    pub stale_fetches: usize,
}

pub fn load_script(path: &Path) -> Result<Script> {
    let file = File::open(path).with_context(|| format!("failed to open script {}", path.display()))?;
    let script = serde_json::from_reader(file).with_context(|| format!("invalid script {}", path.display()))?;
    Ok(script)
}

fn parse_key(raw: &str) -> Result<ConversationKey> {
    ConversationKey::parse(raw).ok_or_else(|| anyhow!("invalid conversation {:?}", raw))
}

pub struct Replay {
    engine: ChatSync,
    tickets: HashMap<String, FetchTicket>,
    actions: Vec<String>,
    stale_fetches: usize,
}

impl Replay {
    pub fn new(engine: ChatSync) -> Self {
        Replay {
            engine,
            tickets: HashMap::new(),
            actions: Vec::new(),
            stale_fetches: 0,
        }
    }

    pub fn run(mut self, steps: &[Step]) -> Result<ReplayReport> {
        for (index, step) in steps.iter().enumerate() {
            debug!("Replaying step {}: {:?}", index, step);
            self.apply(step).with_context(|| format!("step {} failed", index))?;
        }
        info!(
            "Replayed {} steps ({} actions, {} stale fetches)",
            steps.len(),
            self.actions.len(),
            self.stale_fetches
        );
        Ok(ReplayReport {
            view: self.engine.view(),
            actions: self.actions,
            stale_fetches: self.stale_fetches,
        })
    }

    fn apply(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Contacts { contacts } => {
                let contacts: Vec<Contact> = contacts
                    .iter()
                    .filter_map(|c| match normalize_id(&c.id) {
                        Some(id) => Some(Contact::new(id, c.name.clone())),
                        None => {
                            warn!("Skipping contact without a usable id: {}", c.id);
                            None
                        }
                    })
                    .collect();
                self.engine.set_contacts(&contacts);
            }
            Step::Select { conversation, label } => {
                let (ticket, actions) = self.engine.select_conversation(parse_key(conversation)?);
                if let Some(label) = label {
                    self.tickets.insert(label.clone(), ticket);
                }
                self.record(actions);
            }
            Step::Close => self.engine.close_conversation(),
            Step::Fetch {
                conversation,
                messages,
                ticket,
            } => {
                let key = parse_key(conversation)?;
                let ticket = match ticket {
                    Some(label) => self
                        .tickets
                        .get(label)
                        .cloned()
                        .ok_or_else(|| anyhow!("unknown ticket {:?}", label))?,
                    None if self.engine.active() == Some(&key) => self
                        .engine
                        .poll_ticket()
                        .ok_or_else(|| anyhow!("no active conversation to poll"))?,
                    None => self.engine.refresh_ticket(key),
                };
                match self.engine.apply_fetch(&ticket, messages) {
                    FetchOutcome::Applied { actions } => self.record(actions),
                    FetchOutcome::Stale => self.stale_fetches += 1,
                }
            }
            Step::Push { event, payload } => {
                let actions = self.engine.handle_push(&PushFrame::new(event.clone(), payload.clone()));
                self.record(actions);
            }
            Step::Send {
                conversation,
                content,
                media_url,
                timestamp,
            } => {
                let media = media_url.as_ref().map(|url| MediaRef {
                    url: url.clone(),
                    kind: MediaKind::from_url(url),
                });
                let outbound = self
                    .engine
                    .send_message(parse_key(conversation)?, content.clone(), media, *timestamp);
                debug!("Outbound payload: {}", outbound.to_payload());
            }
            Step::Confirm { record } => {
                if self.engine.confirm_send(record).is_none() {
                    warn!("Confirmation could not be routed: {}", record);
                }
            }
        }
        Ok(())
    }

    fn record(&mut self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::MarkConversationRead(key) => self.actions.push(format!("markRead {}", key)),
            }
        }
    }
}
