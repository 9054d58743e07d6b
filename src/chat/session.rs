//! The messaging view's event loop.
//!
//! [`ChatSession`] owns every piece of conversation state. REST calls and
//! timers run as spawned tasks that post a [`Completion`] back; completions,
//! push events and user commands are applied one at a time by whoever owns
//! the session, so state is never touched concurrently. Completions carry
//! the [`FetchTarget`] they were issued for and are dropped when that
//! conversation is no longer open.

use crate::api::client::ChatApi;
use crate::api::models::{
    AttachmentUpload, DeliveryState, EntitlementFact, Message, MessageId, Reaction,
    ReactionRequest, RecentConversationSummary, SendRequest, UploadedAttachment, UserId,
};
use crate::app::{Backoff, SessionTimings};
use crate::chat::reactions::ReactionAggregator;
use crate::chat::recent::{IndexStatus, RecentConversationsIndex};
use crate::chat::selector::{ConversationSelector, FetchTarget, Selection, Viewport};
use crate::chat::store::{ConversationStore, EchoOutcome, ReceiveOutcome, Settlement};
use crate::entitlement::EntitlementGate;
use crate::error::{ApiError, ChatError, SendFailure, ValidationError};
use crate::transport::{SessionEvent, TransportSession};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use url::Url;

/// Who the session acts for. Passed in explicitly; nothing reads identity
/// from global storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub identity: UserId,
}

impl SessionContext {
    pub fn new(identity: UserId) -> Self {
        Self { identity }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connecting,
    Online,
    Offline,
}

/// Pending outcome of a write.
#[derive(Debug)]
pub struct Ticket<T> {
    rx: oneshot::Receiver<Result<T, ChatError>>,
}

pub type ReactionTicket = Ticket<Reaction>;
pub type DeleteTicket = Ticket<()>;

impl<T> Ticket<T> {
    fn channel() -> (oneshot::Sender<Result<T, ChatError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub async fn outcome(self) -> Result<T, ChatError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(ChatError::Network("session closed".into())))
    }

    /// The outcome if it has already been decided.
    pub fn try_outcome(&mut self) -> Option<Result<T, ChatError>> {
        self.rx.try_recv().ok()
    }
}

/// Pending outcome of a send. Resolves once the optimistic entry is
/// confirmed (by push or REST) or rolled back.
#[derive(Debug)]
pub struct SendTicket {
    pending: Message,
    rx: oneshot::Receiver<Result<Message, SendFailure>>,
}

impl SendTicket {
    pub fn pending(&self) -> &Message {
        &self.pending
    }

    pub fn client_ref(&self) -> &MessageId {
        &self.pending.id
    }

    pub async fn outcome(self) -> Result<Message, SendFailure> {
        let Self { mut pending, rx } = self;
        rx.await.unwrap_or_else(|_| {
            pending.delivery_state = DeliveryState::Failed;
            Err(SendFailure { message: pending, error: ChatError::Network("session closed".into()) })
        })
    }

    pub fn try_outcome(&mut self) -> Option<Result<Message, SendFailure>> {
        self.rx.try_recv().ok()
    }
}

/// A deletion the user has confirmed. Only [`ChatSession::prepare_delete`]
/// hands these out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteIntent {
    target: FetchTarget,
    message_id: MessageId,
}

impl DeleteIntent {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

struct SendWaiter {
    pending: Message,
    reply: oneshot::Sender<Result<Message, SendFailure>>,
}

enum Completion {
    History { target: FetchTarget, result: Result<Vec<Message>, ApiError> },
    Reactions { target: FetchTarget, result: Result<Vec<Reaction>, ApiError> },
    Uploaded { target: FetchTarget, client_ref: MessageId, result: Result<UploadedAttachment, ApiError> },
    Sent { target: FetchTarget, client_ref: MessageId, result: Result<Message, ApiError> },
    GraceElapsed { target: FetchTarget, client_ref: MessageId, echo: Message },
    Reacted {
        target: FetchTarget,
        reply: oneshot::Sender<Result<Reaction, ChatError>>,
        result: Result<Reaction, ApiError>,
    },
    ReactionRefetchDue { target: FetchTarget },
    Deleted {
        target: FetchTarget,
        message_id: MessageId,
        reply: oneshot::Sender<Result<(), ChatError>>,
        result: Result<(), ApiError>,
    },
    Recent { seq: u64, result: Result<Vec<RecentConversationSummary>, ApiError> },
    Entitlement { result: Result<EntitlementFact, ApiError> },
}

pub struct ChatSession {
    ctx: SessionContext,
    api: Arc<dyn ChatApi>,
    timings: SessionTimings,
    store: ConversationStore,
    reactions: ReactionAggregator,
    recent: RecentConversationsIndex,
    selector: ConversationSelector,
    gate: EntitlementGate,
    transport: Option<TransportSession>,
    connectivity: Connectivity,
    send_waiters: HashMap<MessageId, SendWaiter>,
    history_error: Option<String>,
    entitlement_timer: Option<Interval>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    in_flight: usize,
}

impl ChatSession {
    pub fn new(ctx: SessionContext, api: Arc<dyn ChatApi>, timings: SessionTimings) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let me = ctx.identity.clone();
        Self {
            store: ConversationStore::new(me.clone(), timings.pending_window),
            reactions: ReactionAggregator::new(),
            recent: RecentConversationsIndex::new(),
            selector: ConversationSelector::new(me),
            gate: EntitlementGate::new(),
            transport: None,
            connectivity: Connectivity::Offline,
            send_waiters: HashMap::new(),
            history_error: None,
            entitlement_timer: None,
            completions_tx,
            completions_rx,
            in_flight: 0,
            ctx,
            api,
            timings,
        }
    }

    pub fn identity(&self) -> &UserId {
        &self.ctx.identity
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Initial load: plan state, recent list, and the deep-linked peer if any.
    pub fn mount(&mut self, deep_link: Option<UserId>) {
        self.refresh_entitlement();
        let period = self.timings.entitlement_refresh;
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.entitlement_timer = Some(timer);

        self.refresh_recent();
        if let Some(selection) = self.selector.mount(deep_link) {
            self.open(selection);
        }
    }

    /// Open `peer`'s conversation. `Ok(false)` when it is already open.
    pub fn select(&mut self, peer: UserId) -> Result<bool, ChatError> {
        if peer == self.ctx.identity {
            return Err(ValidationError::SelfConversation.into());
        }
        match self.selector.select(peer) {
            Some(selection) => {
                self.open(selection);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn close_conversation(&mut self) {
        self.selector.close();
        self.store.close();
        self.reactions.clear();
        self.history_error = None;
    }

    fn open(&mut self, selection: Selection) {
        let target = selection.target;
        self.store.open(target.peer.clone());
        self.reactions.reset();
        self.history_error = None;
        self.fetch_conversation(target);
    }

    /// Re-issue the history and reaction fetches for the open conversation.
    pub fn retry(&mut self) {
        if let Some(target) = self.selector.current().cloned() {
            self.store.set_loading(true);
            self.reactions.begin_reload();
            self.fetch_conversation(target);
        }
    }

    fn fetch_conversation(&mut self, target: FetchTarget) {
        let api = self.api.clone();
        let me = self.ctx.identity.clone();
        let t = target.clone();
        self.spawn(async move {
            let result = api.fetch_history(&t.peer, &me).await;
            Completion::History { target: t, result }
        });

        let api = self.api.clone();
        let me = self.ctx.identity.clone();
        self.spawn(async move {
            let result = api.fetch_reactions(&me, &target.peer).await;
            Completion::Reactions { target, result }
        });
    }

    pub fn refresh_recent(&mut self) {
        let seq = self.recent.begin_refresh();
        let api = self.api.clone();
        let me = self.ctx.identity.clone();
        self.spawn(async move {
            let result = api.fetch_recent_conversations(&me).await;
            Completion::Recent { seq, result }
        });
    }

    pub fn refresh_entitlement(&mut self) {
        let api = self.api.clone();
        let me = self.ctx.identity.clone();
        self.spawn(async move {
            let result = api.fetch_entitlement(&me).await;
            Completion::Entitlement { result }
        });
    }

    // ---------------------------------------------------------------------
    // Push channel
    // ---------------------------------------------------------------------

    /// Open the push channel, replacing any channel already held.
    pub fn connect_transport(&mut self, url: Url, backoff: Backoff) {
        let transport = TransportSession::connect(url, self.ctx.identity.clone(), backoff);
        // Identity matches by construction.
        let _ = self.attach_transport(transport);
    }

    /// Adopt an already-built transport session for this identity.
    pub fn attach_transport(&mut self, transport: TransportSession) -> Result<(), ChatError> {
        if transport.identity() != &self.ctx.identity {
            return Err(ChatError::Transport(format!(
                "push session belongs to {}, not {}",
                transport.identity(),
                self.ctx.identity
            )));
        }
        self.disconnect_transport();
        self.transport = Some(transport);
        self.connectivity = Connectivity::Connecting;
        Ok(())
    }

    pub fn disconnect_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
        self.connectivity = Connectivity::Offline;
    }

    pub fn handle_transport(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                self.connectivity = Connectivity::Online;
                // Nothing is replayed over the channel; catch up over REST.
                self.retry();
                self.refresh_recent();
            }
            SessionEvent::Disconnected { reason } => {
                log::debug!("push channel offline: {reason}");
                self.connectivity = Connectivity::Offline;
            }
            SessionEvent::MessageReceived(message) => {
                let delivered = message.clone();
                match self.store.receive(message) {
                    ReceiveOutcome::Superseded { client_ref } => {
                        self.resolve_send(&client_ref, delivered);
                    }
                    ReceiveOutcome::Duplicate => {
                        log::debug!("duplicate delivery of {}", delivered.id);
                    }
                    ReceiveOutcome::OffConversation => {
                        log::debug!("message {} is for another conversation", delivered.id);
                    }
                    ReceiveOutcome::Appended => {}
                }
                self.refresh_recent();
            }
            SessionEvent::ReactionReceived(reaction) => {
                if self.selector.current().is_none() {
                    log::debug!("reaction for {} with no conversation open", reaction.message_id);
                    return;
                }
                self.reactions.upsert(reaction);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    pub fn send(&mut self, content: impl Into<String>) -> Result<SendTicket, ChatError> {
        self.start_send(content.into(), None)
    }

    /// Upload `file`, then send `content` referencing it.
    pub fn send_with_attachment(
        &mut self,
        content: impl Into<String>,
        file: AttachmentUpload,
    ) -> Result<SendTicket, ChatError> {
        self.start_send(content.into(), Some(file))
    }

    fn start_send(
        &mut self,
        content: String,
        file: Option<AttachmentUpload>,
    ) -> Result<SendTicket, ChatError> {
        self.check_entitlement()?;
        let target = self.selector.current().cloned().ok_or(ValidationError::NoPeerSelected)?;
        let placeholder = file.as_ref().map(|f| f.file_name.clone());
        let pending = self.store.begin_send(content, placeholder, Utc::now())?;

        let (reply, rx) = oneshot::channel();
        self.send_waiters
            .insert(pending.id.clone(), SendWaiter { pending: pending.clone(), reply });

        match file {
            Some(file) => {
                let api = self.api.clone();
                let client_ref = pending.id.clone();
                self.spawn(async move {
                    let result = api.upload_attachment(file).await;
                    Completion::Uploaded { target, client_ref, result }
                });
            }
            None => self.dispatch_send(target, SendRequest::for_pending(&pending)),
        }
        Ok(SendTicket { pending, rx })
    }

    fn dispatch_send(&mut self, target: FetchTarget, request: SendRequest) {
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.send_message(&request).await;
            Completion::Sent { target, client_ref: request.client_ref, result }
        });
    }

    pub fn react(
        &mut self,
        message_id: MessageId,
        emoji: impl Into<String>,
    ) -> Result<ReactionTicket, ChatError> {
        self.check_entitlement()?;
        let target = self.selector.current().cloned().ok_or(ValidationError::NoPeerSelected)?;
        let emoji = emoji.into();
        if emoji.trim().is_empty() {
            return Err(ValidationError::EmptyEmoji.into());
        }
        if message_id.is_temporary() {
            return Err(ValidationError::TemporaryMessage(message_id).into());
        }
        if !self.store.contains(&message_id) {
            return Err(ValidationError::UnknownMessage(message_id).into());
        }

        let request = ReactionRequest { message_id, reactor_id: self.ctx.identity.clone(), emoji };
        let (reply, ticket) = Ticket::channel();
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.add_reaction(&request).await;
            Completion::Reacted { target, reply, result }
        });
        Ok(ticket)
    }

    /// First step of a deletion: check the message can be deleted. The
    /// returned intent is passed to [`Self::delete`] once the user confirms.
    pub fn prepare_delete(&self, message_id: MessageId) -> Result<DeleteIntent, ChatError> {
        let target = self.selector.current().cloned().ok_or(ValidationError::NoPeerSelected)?;
        if message_id.is_temporary() {
            return Err(ValidationError::TemporaryMessage(message_id).into());
        }
        if !self.store.contains(&message_id) {
            return Err(ValidationError::UnknownMessage(message_id).into());
        }
        Ok(DeleteIntent { target, message_id })
    }

    pub fn delete(&mut self, intent: DeleteIntent) -> DeleteTicket {
        let (reply, ticket) = Ticket::channel();
        let api = self.api.clone();
        let DeleteIntent { target, message_id } = intent;
        self.spawn(async move {
            let result = api.delete_message(&message_id).await;
            Completion::Deleted { target, message_id, reply, result }
        });
        ticket
    }

    fn check_entitlement(&self) -> Result<(), ChatError> {
        self.gate.check().inspect_err(|_| log::debug!("write refused: no active plan"))
    }

    // ---------------------------------------------------------------------
    // Event loop
    // ---------------------------------------------------------------------

    /// Wait for the next completion, push event or refresh tick and apply it.
    pub async fn turn(&mut self) {
        tokio::select! {
            Some(completion) = self.completions_rx.recv() => self.on_completion(completion),
            Some(event) = next_push_event(&mut self.transport) => self.handle_transport(event),
            _ = next_tick(&mut self.entitlement_timer) => self.refresh_entitlement(),
        }
    }

    /// Apply one completion. `false` when nothing is in flight.
    pub async fn next_completion(&mut self) -> bool {
        if self.in_flight == 0 {
            return false;
        }
        match self.completions_rx.recv().await {
            Some(completion) => {
                self.on_completion(completion);
                true
            }
            None => false,
        }
    }

    /// Apply completions until no request or timer is outstanding.
    pub async fn run_until_idle(&mut self) {
        while self.next_completion().await {}
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.in_flight += 1;
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(task.await);
        });
    }

    fn after(&mut self, delay: std::time::Duration, completion: Completion) {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            completion
        });
    }

    fn on_completion(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match completion {
            Completion::History { target, result } => self.on_history(target, result),
            Completion::Reactions { target, result } => self.on_reactions(target, result),
            Completion::Uploaded { target, client_ref, result } => {
                self.on_uploaded(target, client_ref, result)
            }
            Completion::Sent { target, client_ref, result } => self.on_sent(target, client_ref, result),
            Completion::GraceElapsed { target, client_ref, echo } => {
                if self.selector.is_current(&target) {
                    match self.store.settle(&client_ref) {
                        Settlement::ConfirmedByRest(m) | Settlement::ConfirmedByPush(m) => {
                            self.resolve_send(&client_ref, m)
                        }
                        Settlement::Unknown => self.resolve_send(&client_ref, echo),
                    }
                } else {
                    self.resolve_send(&client_ref, echo);
                }
            }
            Completion::Reacted { target, reply, result } => match result {
                Ok(reaction) => {
                    if let Some(transport) = &self.transport {
                        transport.publish_reaction(reaction.clone());
                    }
                    if self.selector.is_current(&target) {
                        self.after(self.timings.reaction_refetch, Completion::ReactionRefetchDue { target });
                    }
                    let _ = reply.send(Ok(reaction));
                }
                Err(e) => {
                    let error = ChatError::from(e);
                    log_write_failure("reaction", &error);
                    let _ = reply.send(Err(error));
                }
            },
            Completion::ReactionRefetchDue { target } => {
                if self.selector.is_current(&target) {
                    self.reactions.begin_reload();
                    let api = self.api.clone();
                    let me = self.ctx.identity.clone();
                    self.spawn(async move {
                        let result = api.fetch_reactions(&me, &target.peer).await;
                        Completion::Reactions { target, result }
                    });
                }
            }
            Completion::Deleted { target, message_id, reply, result } => match result {
                Ok(()) => {
                    // Reactions on the deleted message stay until the next snapshot.
                    if self.selector.is_current(&target) {
                        self.store.remove(&message_id);
                    }
                    self.refresh_recent();
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let error = ChatError::from(e);
                    log_write_failure("delete", &error);
                    let _ = reply.send(Err(error));
                }
            },
            Completion::Recent { seq, result } => {
                if self.recent.apply(seq, result) {
                    if let Some(selection) = self.selector.auto_select(self.recent.top()) {
                        self.open(selection);
                    }
                }
            }
            Completion::Entitlement { result } => match result {
                Ok(fact) => self.gate.update(fact),
                Err(e) => {
                    log::warn!("plan state unavailable: {e}");
                    self.gate.invalidate();
                }
            },
        }
    }

    fn on_history(&mut self, target: FetchTarget, result: Result<Vec<Message>, ApiError>) {
        if !self.selector.is_current(&target) {
            log::debug!("discarding history for {}: no longer open", target.peer);
            return;
        }
        match result {
            Ok(history) => {
                self.history_error = None;
                for (client_ref, confirmed) in self.store.replace_history(history) {
                    self.resolve_send(&client_ref, confirmed);
                }
            }
            Err(e) => {
                log::warn!("history for {} unavailable: {e}", target.peer);
                self.history_error = Some(e.to_string());
                self.store.set_loading(false);
            }
        }
    }

    fn on_reactions(&mut self, target: FetchTarget, result: Result<Vec<Reaction>, ApiError>) {
        if !self.selector.is_current(&target) {
            log::debug!("discarding reactions for {}: no longer open", target.peer);
            return;
        }
        match result {
            Ok(snapshot) => self.reactions.replace_snapshot(snapshot),
            Err(e) => {
                log::warn!("reactions for {} unavailable: {e}", target.peer);
                self.reactions.snapshot_failed();
            }
        }
    }

    fn on_uploaded(
        &mut self,
        target: FetchTarget,
        client_ref: MessageId,
        result: Result<UploadedAttachment, ApiError>,
    ) {
        match result {
            Ok(uploaded) => {
                if self.selector.is_current(&target) {
                    self.store.attach(&client_ref, uploaded.url.clone());
                }
                let Some(waiter) = self.send_waiters.get_mut(&client_ref) else {
                    return;
                };
                waiter.pending.attachment_ref = Some(uploaded.url);
                let request = SendRequest::for_pending(&waiter.pending);
                self.dispatch_send(target, request);
            }
            Err(e) => self.fail_send(&target, &client_ref, e.into()),
        }
    }

    fn on_sent(&mut self, target: FetchTarget, client_ref: MessageId, result: Result<Message, ApiError>) {
        let echo = match result {
            Ok(echo) => echo,
            Err(e) => return self.fail_send(&target, &client_ref, e.into()),
        };
        self.refresh_recent();
        if !self.selector.is_current(&target) {
            return self.resolve_send(&client_ref, echo);
        }
        match self.store.record_echo(&client_ref, echo.clone()) {
            EchoOutcome::AwaitingGrace => {
                let grace = self.timings.confirm_grace;
                self.after(grace, Completion::GraceElapsed { target, client_ref, echo });
            }
            EchoOutcome::AlreadyConfirmed => self.resolve_send(&client_ref, echo),
        }
    }

    fn fail_send(&mut self, target: &FetchTarget, client_ref: &MessageId, error: ChatError) {
        let rolled_back = if self.selector.is_current(target) { self.store.fail(client_ref) } else { None };
        let Some(waiter) = self.send_waiters.remove(client_ref) else {
            log::warn!("send {client_ref} reported failure after it was confirmed: {error}");
            return;
        };
        log_write_failure("send", &error);
        let message = rolled_back.unwrap_or_else(|| {
            let mut message = waiter.pending;
            message.delivery_state = DeliveryState::Failed;
            message
        });
        let _ = waiter.reply.send(Err(SendFailure { message, error }));
    }

    /// Resolve the ticket of a confirmed send. No-op once already resolved.
    fn resolve_send(&mut self, client_ref: &MessageId, confirmed: Message) {
        if let Some(waiter) = self.send_waiters.remove(client_ref) {
            let _ = waiter.reply.send(Ok(confirmed));
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn reactions_for(&self, message_id: &MessageId) -> &[Reaction] {
        self.reactions.reactions_for(message_id)
    }

    pub fn reaction_tally(&self, message_id: &MessageId) -> BTreeMap<String, usize> {
        self.reactions.tally(message_id)
    }

    pub fn recent(&self) -> &[RecentConversationSummary] {
        self.recent.entries()
    }

    pub fn recent_status(&self) -> &IndexStatus {
        self.recent.status()
    }

    pub fn active_peer(&self) -> Option<&UserId> {
        self.selector.active_peer()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn entitlement(&self) -> &EntitlementGate {
        &self.gate
    }

    /// History or reactions for the open conversation are still loading.
    pub fn is_loading(&self) -> bool {
        self.store.is_loading() || self.reactions.is_loading()
    }

    /// Why the last history fetch failed, if it did. Cleared by a successful fetch.
    pub fn history_error(&self) -> Option<&str> {
        self.history_error.as_deref()
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.selector.set_viewport(viewport);
    }

    pub fn contact_list_visible(&self) -> bool {
        self.selector.contact_list_visible()
    }
}

fn log_write_failure(what: &str, error: &ChatError) {
    if error.is_entitlement_denied() {
        log::debug!("{what} refused: no active plan");
    } else {
        log::warn!("{what} failed: {error}");
    }
}

async fn next_push_event(transport: &mut Option<TransportSession>) -> Option<SessionEvent> {
    match transport {
        Some(transport) => transport.next_event().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
