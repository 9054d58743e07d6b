//! Conversation selection, reactions, deletion, the recent list and the
//! push channel's effect on a running session.

mod common;

use common::{FakeApi, at, message, mounted, reaction, summary, user};
use matchchat::api::events::OutgoingEvent;
use matchchat::api::models::MessageId;
use matchchat::chat::recent::IndexStatus;
use matchchat::chat::selector::Viewport;
use matchchat::transport::{SessionEvent, TransportSession};
use matchchat::{ChatError, Connectivity, ValidationError};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn most_recent_conversation_opens_exactly_once() {
    let api = FakeApi::new();
    api.with(|s| {
        s.recent = vec![summary("carol", 30), summary("bob", 20), summary("dave", 10)];
        s.history.push(message("c1", "carol", "alice", "hi", at(30)));
    });
    let mut session = mounted(&api, None).await;

    assert_eq!(session.active_peer(), Some(&user("carol")));
    assert_eq!(session.recent().len(), 3);
    assert_eq!(session.messages().len(), 1);
    assert_eq!(api.calls("fetch_history"), 1);

    session.refresh_recent();
    session.run_until_idle().await;
    assert_eq!(api.calls("fetch_history"), 1);
    assert_eq!(session.active_peer(), Some(&user("carol")));
}

#[tokio::test(start_paused = true)]
async fn deep_link_wins_over_recent_list() {
    let api = FakeApi::new();
    api.with(|s| s.recent = vec![summary("carol", 30), summary("bob", 20)]);
    let session = mounted(&api, Some("dave")).await;

    assert_eq!(session.active_peer(), Some(&user("dave")));
    assert_eq!(api.calls("fetch_history carol"), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_fetches_for_previous_peer_are_discarded() {
    let api = FakeApi::new();
    api.with(|s| {
        s.history.push(message("b1", "bob", "alice", "from bob", at(0)));
        s.history.push(message("c1", "carol", "alice", "from carol", at(5)));
        s.reactions.push(reaction("b1", "bob", "🔥"));
        s.peer_delay.insert(user("bob"), Duration::from_secs(5));
    });
    let mut session = mounted(&api, None).await;

    session.select(user("bob")).unwrap();
    session.select(user("carol")).unwrap();
    session.run_until_idle().await;

    let ids: Vec<_> = session.messages().iter().map(|m| m.id.as_str().to_owned()).collect();
    assert_eq!(ids, ["c1"]);
    assert!(session.reactions_for(&MessageId::new("b1")).is_empty());
    assert_eq!(api.calls("fetch_history bob"), 1);
}

#[tokio::test(start_paused = true)]
async fn selecting_open_peer_or_self() {
    let api = FakeApi::new();
    let mut session = mounted(&api, Some("bob")).await;

    assert_eq!(session.select(user("bob")), Ok(false));
    assert_eq!(
        session.select(user("alice")),
        Err(ChatError::Validation(ValidationError::SelfConversation))
    );
    session.run_until_idle().await;
    assert_eq!(api.calls("fetch_history"), 1);
}

#[tokio::test(start_paused = true)]
async fn compact_viewport_hides_contacts_while_a_conversation_is_open() {
    let api = FakeApi::new();
    let mut session = mounted(&api, None).await;
    session.set_viewport(Viewport::Compact);
    assert!(session.contact_list_visible());

    session.select(user("bob")).unwrap();
    assert!(!session.contact_list_visible());
    session.close_conversation();
    assert!(session.contact_list_visible());
}

#[tokio::test(start_paused = true)]
async fn reaction_is_broadcast_and_refetched_not_applied_optimistically() {
    let api = FakeApi::new();
    api.with(|s| s.history.push(message("b1", "bob", "alice", "hey", at(0))));
    let mut session = mounted(&api, Some("bob")).await;
    let (transport, mut link) = TransportSession::detached(user("alice"));
    session.attach_transport(transport).unwrap();

    let ticket = session.react(MessageId::new("b1"), "👍").unwrap();
    assert!(session.next_completion().await);
    assert!(session.reactions_for(&MessageId::new("b1")).is_empty());
    match link.outbound.try_recv() {
        Ok(OutgoingEvent::SendReaction(r)) => assert_eq!(r, reaction("b1", "alice", "👍")),
        other => panic!("expected a reaction broadcast, got {other:?}"),
    }

    session.run_until_idle().await;
    assert_eq!(ticket.outcome().await.unwrap().emoji, "👍");
    assert_eq!(session.reactions_for(&MessageId::new("b1")), [reaction("b1", "alice", "👍")]);
    assert_eq!(api.calls("fetch_reactions"), 2);
}

#[tokio::test(start_paused = true)]
async fn pushed_reaction_replaces_earlier_one_from_same_reactor() {
    let api = FakeApi::new();
    api.with(|s| s.history.push(message("b1", "alice", "bob", "dinner?", at(0))));
    let mut session = mounted(&api, Some("bob")).await;

    session.handle_transport(SessionEvent::ReactionReceived(reaction("b1", "bob", "👍")));
    session.handle_transport(SessionEvent::ReactionReceived(reaction("b1", "bob", "❤️")));
    session.handle_transport(SessionEvent::ReactionReceived(reaction("zz", "bob", "👍")));

    assert_eq!(session.reactions_for(&MessageId::new("b1")), [reaction("b1", "bob", "❤️")]);
    assert_eq!(session.reaction_tally(&MessageId::new("b1")).get("❤️"), Some(&1));
    // Deltas are keyed by message alone; one not shown here is simply held.
    assert_eq!(session.reactions_for(&MessageId::new("zz")).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reaction_pushed_while_conversation_loads_survives_the_snapshot() {
    let api = FakeApi::new();
    api.with(|s| {
        s.history.push(message("b1", "alice", "bob", "dinner?", at(0)));
        s.peer_delay.insert(user("bob"), Duration::from_secs(5));
    });
    let mut session = mounted(&api, None).await;

    session.select(user("bob")).unwrap();
    assert!(session.is_loading());
    session.handle_transport(SessionEvent::ReactionReceived(reaction("b1", "bob", "👍")));
    assert!(session.reactions_for(&MessageId::new("b1")).is_empty());

    session.run_until_idle().await;
    assert!(!session.is_loading());
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.reactions_for(&MessageId::new("b1")), [reaction("b1", "bob", "👍")]);
}

#[tokio::test(start_paused = true)]
async fn reaction_pushed_during_reconnect_refetch_is_kept() {
    let api = FakeApi::new();
    api.with(|s| s.history.push(message("b1", "alice", "bob", "dinner?", at(0))));
    let mut session = mounted(&api, Some("bob")).await;
    api.with(|s| {
        s.peer_delay.insert(user("bob"), Duration::from_secs(5));
    });

    session.handle_transport(SessionEvent::Connected);
    session.handle_transport(SessionEvent::ReactionReceived(reaction("b1", "bob", "❤️")));
    session.run_until_idle().await;

    assert_eq!(session.reactions_for(&MessageId::new("b1")), [reaction("b1", "bob", "❤️")]);
}

#[tokio::test(start_paused = true)]
async fn reacting_to_unsent_or_unknown_message_is_rejected() {
    let api = FakeApi::new();
    let mut session = mounted(&api, Some("bob")).await;
    let pending = session.send("hi").unwrap();

    let err = session.react(pending.client_ref().clone(), "👍").unwrap_err();
    assert!(matches!(err, ChatError::Validation(ValidationError::TemporaryMessage(_))));
    let err = session.react(MessageId::new("nope"), "👍").unwrap_err();
    assert!(matches!(err, ChatError::Validation(ValidationError::UnknownMessage(_))));
    let err = session.react(MessageId::new("nope"), " ").unwrap_err();
    assert_eq!(err, ChatError::Validation(ValidationError::EmptyEmoji));
}

#[tokio::test(start_paused = true)]
async fn deletion_needs_an_intent_and_keeps_reactions() {
    let api = FakeApi::new();
    api.with(|s| {
        s.history.push(message("b1", "bob", "alice", "hey", at(0)));
        s.history.push(message("b2", "alice", "bob", "hello", at(1)));
        s.reactions.push(reaction("b1", "alice", "😂"));
    });
    let mut session = mounted(&api, Some("bob")).await;
    assert_eq!(session.reactions_for(&MessageId::new("b1")).len(), 1);

    let intent = session.prepare_delete(MessageId::new("b1")).unwrap();
    assert_eq!(intent.message_id(), &MessageId::new("b1"));
    assert_eq!(api.calls("delete_message"), 0);

    let ticket = session.delete(intent);
    session.run_until_idle().await;
    ticket.outcome().await.unwrap();

    let ids: Vec<_> = session.messages().iter().map(|m| m.id.as_str().to_owned()).collect();
    assert_eq!(ids, ["b2"]);
    assert_eq!(session.reactions_for(&MessageId::new("b1")).len(), 1);
    assert!(session.prepare_delete(MessageId::new("b1")).is_err());
}

#[tokio::test(start_paused = true)]
async fn deletion_is_not_gated_by_plan() {
    let api = FakeApi::new();
    api.with(|s| {
        s.entitlement.active = false;
        s.history.push(message("b1", "alice", "bob", "oops", at(0)));
    });
    let mut session = mounted(&api, Some("bob")).await;
    assert!(!session.entitlement().active());

    let intent = session.prepare_delete(MessageId::new("b1")).unwrap();
    let ticket = session.delete(intent);
    session.run_until_idle().await;
    assert!(ticket.outcome().await.is_ok());
    assert!(session.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn message_for_another_conversation_refreshes_recent_only() {
    let api = FakeApi::new();
    api.with(|s| s.history.push(message("b1", "bob", "alice", "hey", at(0))));
    let mut session = mounted(&api, Some("bob")).await;
    let before = api.calls("fetch_recent");

    api.with(|s| s.recent = vec![summary("carol", 60)]);
    session.handle_transport(SessionEvent::MessageReceived(message(
        "c9", "carol", "alice", "psst", at(60),
    )));
    session.run_until_idle().await;

    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.active_peer(), Some(&user("bob")));
    assert_eq!(api.calls("fetch_recent"), before + 1);
    assert_eq!(session.recent()[0].peer_identity, user("carol"));
}

#[tokio::test(start_paused = true)]
async fn duplicate_push_delivery_is_ignored() {
    let api = FakeApi::new();
    let mut session = mounted(&api, Some("bob")).await;

    let incoming = message("b7", "bob", "alice", "again", at(0));
    session.handle_transport(SessionEvent::MessageReceived(incoming.clone()));
    session.handle_transport(SessionEvent::MessageReceived(incoming));
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_refetches_the_open_conversation() {
    let api = FakeApi::new();
    api.with(|s| s.history.push(message("b1", "bob", "alice", "hey", at(0))));
    let mut session = mounted(&api, Some("bob")).await;
    let (transport, link) = TransportSession::detached(user("alice"));
    session.attach_transport(transport).unwrap();
    assert_eq!(session.connectivity(), Connectivity::Connecting);

    link.events.send(SessionEvent::Connected).unwrap();
    session.turn().await;
    session.run_until_idle().await;
    assert_eq!(session.connectivity(), Connectivity::Online);
    assert_eq!(api.calls("fetch_history bob"), 2);

    link.events.send(SessionEvent::Disconnected { reason: "reset".into() }).unwrap();
    session.turn().await;
    assert_eq!(session.connectivity(), Connectivity::Offline);

    // Sent while the channel was down; only the re-fetch can deliver it.
    api.with(|s| s.history.push(message("b2", "bob", "alice", "you there?", at(10))));
    link.events.send(SessionEvent::Connected).unwrap();
    session.turn().await;
    session.run_until_idle().await;

    let ids: Vec<_> = session.messages().iter().map(|m| m.id.as_str().to_owned()).collect();
    assert_eq!(ids, ["b1", "b2"]);
    assert_eq!(api.calls("fetch_history bob"), 3);
}

#[tokio::test(start_paused = true)]
async fn transport_for_another_identity_is_refused() {
    let api = FakeApi::new();
    let mut session = mounted(&api, None).await;
    let (transport, _link) = TransportSession::detached(user("mallory"));

    assert!(matches!(session.attach_transport(transport), Err(ChatError::Transport(_))));
    assert_eq!(session.connectivity(), Connectivity::Offline);
}

#[tokio::test(start_paused = true)]
async fn failed_recent_refresh_degrades_to_empty_list() {
    let api = FakeApi::new();
    api.with(|s| s.recent = vec![summary("carol", 30)]);
    let mut session = mounted(&api, Some("bob")).await;
    assert_eq!(session.recent_status(), &IndexStatus::Ready);

    api.with(|s| s.recent_failure = true);
    session.refresh_recent();
    session.run_until_idle().await;
    assert!(session.recent().is_empty());
    assert!(matches!(session.recent_status(), IndexStatus::Degraded(_)));

    api.with(|s| s.recent_failure = false);
    session.refresh_recent();
    session.run_until_idle().await;
    assert_eq!(session.recent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn plan_state_is_refreshed_periodically() {
    let api = FakeApi::new();
    let mut session = mounted(&api, Some("bob")).await;
    assert!(session.entitlement().active());
    assert!(session.send("hi").is_ok());
    session.run_until_idle().await;

    api.with(|s| s.entitlement.active = false);
    let before = api.calls("fetch_entitlement");
    // Nothing else is outstanding, so the next turn is the refresh tick.
    session.turn().await;
    session.run_until_idle().await;

    assert_eq!(api.calls("fetch_entitlement"), before + 1);
    assert!(session.send("again").unwrap_err().is_entitlement_denied());
}
