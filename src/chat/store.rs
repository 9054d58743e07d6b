//! Ordered message sequence of the open conversation.
//!
//! An outgoing message lives here as a `Pending` entry under a temporary id
//! until one of two confirmations lands:
//!
//! - the push channel delivers its server copy, which supersedes the entry
//!   in place ([`ConversationStore::receive`]);
//! - the REST response is recorded with [`ConversationStore::record_echo`] and,
//!   once the grace delay has elapsed, [`ConversationStore::settle`] swaps it in
//!   unless the push copy already arrived.
//!
//! Both paths end in exactly one `Confirmed` entry per server id.

use crate::api::models::{DeliveryState, Message, MessageId, UserId};
use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Appended,
    /// The delivery confirmed a local pending send, identified by its temporary id.
    Superseded { client_ref: MessageId },
    Duplicate,
    OffConversation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoOutcome {
    /// Held until the grace delay elapses.
    AwaitingGrace,
    /// The pending entry was already confirmed (or discarded) by other means.
    AlreadyConfirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    ConfirmedByRest(Message),
    ConfirmedByPush(Message),
    /// Nothing to settle: superseded earlier, failed, or the conversation changed.
    Unknown,
}

#[derive(Debug)]
pub struct ConversationStore {
    me: UserId,
    peer: Option<UserId>,
    messages: Vec<Message>,
    /// REST responses waiting for the grace delay, keyed by temporary id.
    echoes: HashMap<MessageId, Message>,
    pending_window: Duration,
    loading: bool,
}

impl ConversationStore {
    pub fn new(me: UserId, pending_window: Duration) -> Self {
        Self {
            me,
            peer: None,
            messages: Vec::new(),
            echoes: HashMap::new(),
            pending_window,
            loading: false,
        }
    }

    /// Start a fresh conversation with `peer`. Whatever was held for the
    /// previous peer is discarded.
    pub fn open(&mut self, peer: UserId) {
        self.peer = Some(peer);
        self.messages.clear();
        self.echoes.clear();
        self.loading = true;
    }

    pub fn close(&mut self) {
        self.peer = None;
        self.messages.clear();
        self.echoes.clear();
        self.loading = false;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.get(id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_pending()).count()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    /// Replace the sequence with a fetched history page.
    ///
    /// The page is narrowed to the two participants, ordered by `created_at`
    /// and deduplicated by id. Pending sends survive the swap unless the page
    /// already holds their confirmation; those are returned as
    /// `(temporary id, confirmed message)`. Each fetched message confirms at
    /// most one pending send.
    ///
    /// Pushed messages missing from the page are dropped with the rest of the
    /// old sequence; the next re-fetch on `Connected` or retry brings them back.
    pub fn replace_history(&mut self, history: Vec<Message>) -> Vec<(MessageId, Message)> {
        let Some(peer) = self.peer.clone() else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut fetched: Vec<Message> = history
            .into_iter()
            .filter(|m| m.involves(&self.me, &peer))
            .filter(|m| seen.insert(m.id.clone()))
            .map(|mut m| {
                m.delivery_state = DeliveryState::Confirmed;
                m
            })
            .collect();
        fetched.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut pending: Vec<Message> =
            std::mem::take(&mut self.messages).into_iter().filter(Message::is_pending).collect();
        let mut resolved = Vec::new();
        for confirmed in &fetched {
            if let Some(idx) = self.twin_of(&pending, confirmed) {
                let local = pending.remove(idx);
                self.echoes.remove(&local.id);
                resolved.push((local.id, confirmed.clone()));
            }
        }
        fetched.extend(pending);

        self.messages = fetched;
        self.loading = false;
        resolved
    }

    /// Append an optimistic entry for an outgoing message.
    pub fn begin_send(
        &mut self,
        content: String,
        attachment_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Message, ValidationError> {
        let peer = self.peer.clone().ok_or(ValidationError::NoPeerSelected)?;
        if content.trim().is_empty() && attachment_ref.is_none() {
            return Err(ValidationError::EmptyContent);
        }
        let bucket = self.bucket(now);
        let duplicate = self.messages.iter().any(|m| {
            m.is_pending()
                && m.receiver_id == peer
                && m.content == content
                && m.attachment_ref == attachment_ref
                && self.bucket(m.created_at) == bucket
        });
        if duplicate {
            return Err(ValidationError::DuplicatePending);
        }

        let message = Message::pending(self.me.clone(), peer, content, attachment_ref, now);
        self.messages.push(message.clone());
        Ok(message)
    }

    /// Point a pending entry at its uploaded attachment. Returns the updated
    /// entry, or `None` when it is no longer pending.
    pub fn attach(&mut self, client_ref: &MessageId, attachment_ref: String) -> Option<Message> {
        let idx = self.pending_index(client_ref)?;
        self.messages[idx].attachment_ref = Some(attachment_ref);
        Some(self.messages[idx].clone())
    }

    /// Apply a push-delivered message.
    pub fn receive(&mut self, message: Message) -> ReceiveOutcome {
        let Some(peer) = self.peer.as_ref() else {
            return ReceiveOutcome::OffConversation;
        };
        if !message.involves(&self.me, peer) {
            return ReceiveOutcome::OffConversation;
        }
        if self.contains(&message.id) {
            return ReceiveOutcome::Duplicate;
        }

        let mut message = message;
        message.delivery_state = DeliveryState::Confirmed;
        match self.twin_of(&self.messages, &message) {
            Some(idx) => {
                let client_ref = self.messages[idx].id.clone();
                self.echoes.remove(&client_ref);
                self.messages[idx] = message;
                ReceiveOutcome::Superseded { client_ref }
            }
            None => {
                self.messages.push(message);
                ReceiveOutcome::Appended
            }
        }
    }

    /// Hold the REST response for a pending send until [`Self::settle`].
    ///
    /// When the pending entry is already gone the echo is added directly,
    /// unless a copy with the same id is held.
    pub fn record_echo(&mut self, client_ref: &MessageId, echo: Message) -> EchoOutcome {
        let mut echo = echo;
        echo.delivery_state = DeliveryState::Confirmed;
        if self.pending_index(client_ref).is_none() {
            self.insert_confirmed(echo);
            return EchoOutcome::AlreadyConfirmed;
        }
        self.echoes.insert(client_ref.clone(), echo);
        EchoOutcome::AwaitingGrace
    }

    /// Resolve a pending send once its grace delay has elapsed.
    pub fn settle(&mut self, client_ref: &MessageId) -> Settlement {
        let Some(idx) = self.pending_index(client_ref) else {
            if let Some(echo) = self.echoes.remove(client_ref) {
                self.insert_confirmed(echo);
            }
            return Settlement::Unknown;
        };
        let Some(echo) = self.echoes.remove(client_ref) else {
            return Settlement::Unknown;
        };

        let pushed = self
            .messages
            .iter()
            .find(|m| !m.is_pending() && (m.id == echo.id || m.client_ref.as_ref() == Some(client_ref)))
            .cloned();
        match pushed {
            Some(confirmed) => {
                self.messages.remove(idx);
                Settlement::ConfirmedByPush(confirmed)
            }
            None => {
                self.messages[idx] = echo.clone();
                Settlement::ConfirmedByRest(echo)
            }
        }
    }

    /// Roll back a pending send. Returns it marked `Failed`.
    pub fn fail(&mut self, client_ref: &MessageId) -> Option<Message> {
        let idx = self.pending_index(client_ref)?;
        self.echoes.remove(client_ref);
        let mut message = self.messages.remove(idx);
        message.delivery_state = DeliveryState::Failed;
        Some(message)
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let idx = self.messages.iter().position(|m| &m.id == id)?;
        Some(self.messages.remove(idx))
    }

    fn pending_index(&self, client_ref: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.is_pending() && &m.id == client_ref)
    }

    fn bucket(&self, at: DateTime<Utc>) -> i64 {
        let width = self.pending_window.as_secs().max(1) as i64;
        at.timestamp().div_euclid(width)
    }

    /// Add a confirmed message in `created_at` order unless its id is
    /// already held or it belongs to another conversation.
    fn insert_confirmed(&mut self, message: Message) -> bool {
        let Some(peer) = self.peer.as_ref() else {
            return false;
        };
        if !message.involves(&self.me, peer) || self.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .iter()
            .position(|m| m.created_at > message.created_at)
            .unwrap_or(self.messages.len());
        self.messages.insert(at, message);
        true
    }

    /// The pending entry among `entries` that `confirmed` settles.
    ///
    /// An exact pairing wins. A content pairing counts only when a single
    /// pending entry qualifies; otherwise the copy stands alone and
    /// [`Self::settle`] collapses it once the REST echo names its id.
    fn twin_of(&self, entries: &[Message], confirmed: &Message) -> Option<usize> {
        let mut by_content = None;
        let mut ambiguous = false;
        for (idx, local) in entries.iter().enumerate().filter(|(_, m)| m.is_pending()) {
            match self.pairing(local, confirmed) {
                Pairing::Exact => return Some(idx),
                Pairing::Content if by_content.is_none() => by_content = Some(idx),
                Pairing::Content => ambiguous = true,
                Pairing::None => {}
            }
        }
        if ambiguous { None } else { by_content }
    }

    /// How `confirmed` relates to the pending `local` entry. An echoed
    /// temporary id or a recorded REST echo decides outright; without either,
    /// the same sender, receiver and content within one pending window.
    fn pairing(&self, local: &Message, confirmed: &Message) -> Pairing {
        if let Some(client_ref) = &confirmed.client_ref {
            return if client_ref == &local.id { Pairing::Exact } else { Pairing::None };
        }
        if let Some(echo) = self.echoes.get(&local.id) {
            return if echo.id == confirmed.id { Pairing::Exact } else { Pairing::None };
        }
        let window = chrono::Duration::from_std(self.pending_window).unwrap_or(chrono::Duration::zero());
        let same = local.sender_id == confirmed.sender_id
            && local.receiver_id == confirmed.receiver_id
            && local.content == confirmed.content
            && (confirmed.created_at - local.created_at).abs() <= window;
        if same { Pairing::Content } else { Pairing::None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pairing {
    Exact,
    Content,
    None,
}
