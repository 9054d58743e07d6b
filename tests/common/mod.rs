//! Scripted in-memory backend shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use matchchat::api::client::ChatApi;
use matchchat::api::models::{
    AttachmentUpload, DeliveryState, EntitlementFact, Message, MessageId, Reaction,
    ReactionRequest, RecentConversationSummary, SendRequest, UploadedAttachment, UserId,
};
use matchchat::app::SessionTimings;
use matchchat::error::ApiError;
use matchchat::{ChatSession, SessionContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ME: &str = "alice";

pub fn user(id: &str) -> UserId {
    UserId::new(id)
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_772_000_000 + secs, 0).unwrap()
}

pub fn message(id: &str, from: &str, to: &str, content: &str, created_at: DateTime<Utc>) -> Message {
    Message {
        id: MessageId::new(id),
        sender_id: user(from),
        receiver_id: user(to),
        content: content.into(),
        attachment_ref: None,
        created_at,
        client_ref: None,
        delivery_state: DeliveryState::Confirmed,
    }
}

pub fn reaction(message_id: &str, reactor: &str, emoji: &str) -> Reaction {
    Reaction { message_id: MessageId::new(message_id), reactor_id: user(reactor), emoji: emoji.into() }
}

pub fn summary(peer: &str, secs: i64) -> RecentConversationSummary {
    RecentConversationSummary {
        peer_identity: user(peer),
        display_name: peer.to_uppercase(),
        last_message_excerpt: format!("last from {peer}"),
        last_message_at: Some(at(secs)),
        unread_count: 1,
    }
}

pub fn timings() -> SessionTimings {
    SessionTimings {
        confirm_grace: Duration::from_millis(1_500),
        reaction_refetch: Duration::from_millis(600),
        entitlement_refresh: Duration::from_secs(300),
        pending_window: Duration::from_secs(5),
    }
}

pub struct FakeState {
    pub history: Vec<Message>,
    pub reactions: Vec<Reaction>,
    pub recent: Vec<RecentConversationSummary>,
    pub entitlement: EntitlementFact,
    pub next_id: u64,
    pub echo_client_ref: bool,
    pub send_failure: Option<u16>,
    pub recent_failure: bool,
    pub peer_delay: HashMap<UserId, Duration>,
    pub calls: Vec<String>,
}

pub struct FakeApi {
    pub state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                history: Vec::new(),
                reactions: Vec::new(),
                recent: Vec::new(),
                entitlement: EntitlementFact { active: true, remaining_secs: Some(86_400) },
                next_id: 501,
                echo_client_ref: false,
                send_failure: None,
                recent_failure: false,
                peer_delay: HashMap::new(),
                calls: Vec::new(),
            }),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self, prefix: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|c| c.starts_with(prefix)).count())
    }

    fn record(&self, call: String) {
        self.with(|s| s.calls.push(call));
    }

    async fn delay_for(&self, peer: &UserId) {
        let delay = self.with(|s| s.peer_delay.get(peer).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_history(&self, peer: &UserId, me: &UserId) -> Result<Vec<Message>, ApiError> {
        self.record(format!("fetch_history {peer}"));
        self.delay_for(peer).await;
        Ok(self.with(|s| s.history.iter().filter(|m| m.involves(me, peer)).cloned().collect()))
    }

    async fn send_message(&self, request: &SendRequest) -> Result<Message, ApiError> {
        self.record(format!("send_message {}", request.content));
        self.with(|s| {
            if let Some(status) = s.send_failure {
                return Err(ApiError::Status { status, body: "rejected".into() });
            }
            let message = Message {
                id: MessageId::new(s.next_id.to_string()),
                sender_id: request.sender_id.clone(),
                receiver_id: request.receiver_id.clone(),
                content: request.content.clone(),
                attachment_ref: request.attachment_ref.clone(),
                created_at: Utc::now(),
                client_ref: s.echo_client_ref.then(|| request.client_ref.clone()),
                delivery_state: DeliveryState::Confirmed,
            };
            s.next_id += 1;
            s.history.push(message.clone());
            Ok(message)
        })
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), ApiError> {
        self.record(format!("delete_message {id}"));
        self.with(|s| s.history.retain(|m| &m.id != id));
        Ok(())
    }

    async fn fetch_reactions(&self, me: &UserId, peer: &UserId) -> Result<Vec<Reaction>, ApiError> {
        self.record(format!("fetch_reactions {peer}"));
        self.delay_for(peer).await;
        Ok(self.with(|s| {
            let ids: Vec<&MessageId> =
                s.history.iter().filter(|m| m.involves(me, peer)).map(|m| &m.id).collect();
            s.reactions.iter().filter(|r| ids.contains(&&r.message_id)).cloned().collect()
        }))
    }

    async fn add_reaction(&self, request: &ReactionRequest) -> Result<Reaction, ApiError> {
        self.record(format!("add_reaction {}", request.message_id));
        let reaction = Reaction {
            message_id: request.message_id.clone(),
            reactor_id: request.reactor_id.clone(),
            emoji: request.emoji.clone(),
        };
        self.with(|s| {
            s.reactions.retain(|r| {
                !(r.message_id == reaction.message_id && r.reactor_id == reaction.reactor_id)
            });
            s.reactions.push(reaction.clone());
        });
        Ok(reaction)
    }

    async fn fetch_recent_conversations(
        &self,
        _me: &UserId,
    ) -> Result<Vec<RecentConversationSummary>, ApiError> {
        self.record("fetch_recent".into());
        self.with(|s| {
            if s.recent_failure {
                return Err(ApiError::Status { status: 500, body: "unavailable".into() });
            }
            Ok(s.recent.clone())
        })
    }

    async fn fetch_entitlement(&self, _me: &UserId) -> Result<EntitlementFact, ApiError> {
        self.record("fetch_entitlement".into());
        Ok(self.with(|s| s.entitlement.clone()))
    }

    async fn upload_attachment(&self, file: AttachmentUpload) -> Result<UploadedAttachment, ApiError> {
        self.record(format!("upload {}", file.file_name));
        Ok(UploadedAttachment { url: format!("https://cdn.example/{}", file.file_name) })
    }
}

/// A session for `alice`, mounted and settled.
pub async fn mounted(api: &Arc<FakeApi>, deep_link: Option<&str>) -> ChatSession {
    let mut session = ChatSession::new(SessionContext::new(user(ME)), api.clone(), timings());
    session.mount(deep_link.map(user));
    session.run_until_idle().await;
    session
}
