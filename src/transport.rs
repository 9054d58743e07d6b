//! Push channel session: one websocket per identity, reconnecting forever.
//!
//! The worker announces itself with `join(identity)` after every (re)connect
//! and never replays missed frames; the owner re-fetches on `Connected`.

use crate::api::events::{IncomingEvent, OutgoingEvent, PushDelta};
use crate::api::models::{Message, Reaction, UserId};
use crate::app::Backoff;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    MessageReceived(Message),
    ReactionReceived(Reaction),
}

/// Owner went away; the worker should stop.
struct Shutdown;

pub struct TransportSession {
    identity: UserId,
    outbound: mpsc::UnboundedSender<OutgoingEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    worker: Option<JoinHandle<()>>,
}

/// Far end of a detached session: inject events, observe published frames.
pub struct DetachedLink {
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub outbound: mpsc::UnboundedReceiver<OutgoingEvent>,
}

impl TransportSession {
    /// Spawn the connection worker for `identity`. Must be called inside a
    /// Tokio runtime.
    pub fn connect(url: Url, identity: UserId, backoff: Backoff) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(url, identity.clone(), backoff, events_tx, outbound_rx));
        Self { identity, outbound: outbound_tx, events: events_rx, worker: Some(worker) }
    }

    /// A session with no socket behind it.
    pub fn detached(identity: UserId) -> (Self, DetachedLink) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self { identity, outbound: outbound_tx, events: events_rx, worker: None };
        (session, DetachedLink { events: events_tx, outbound: outbound_rx })
    }

    pub fn identity(&self) -> &UserId {
        &self.identity
    }

    /// Advisory broadcast to other observers. Never confirms anything.
    pub fn publish_reaction(&self, reaction: Reaction) {
        if self.outbound.send(OutgoingEvent::SendReaction(reaction)).is_err() {
            log::debug!("push channel closed; reaction broadcast dropped");
        }
    }

    /// Next event from the worker, `None` once it has stopped.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            log::info!("closing push channel for {}", self.identity);
            worker.abort();
        }
        self.events.close();
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

async fn run_worker(
    url: Url,
    identity: UserId,
    backoff: Backoff,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut outbound: mpsc::UnboundedReceiver<OutgoingEvent>,
) {
    let mut attempt: u32 = 0;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                attempt = 0;
                log::info!("push channel connected to {url}");
                if events.send(SessionEvent::Connected).is_err() {
                    return;
                }
                let reason = match pump(ws, &identity, &events, &mut outbound).await {
                    Ok(reason) => reason,
                    Err(Shutdown) => return,
                };
                log::info!("push channel lost: {reason}");
                if events.send(SessionEvent::Disconnected { reason }).is_err() {
                    return;
                }
            }
            Err(e) => log::debug!("push connect attempt {attempt} failed: {e}"),
        }
        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

/// Shuttle frames until the socket drops. `Ok` carries the disconnect reason.
async fn pump(
    ws: PushStream,
    identity: &UserId,
    events: &mpsc::UnboundedSender<SessionEvent>,
    outbound: &mut mpsc::UnboundedReceiver<OutgoingEvent>,
) -> Result<String, Shutdown> {
    let (mut write, mut read) = ws.split();
    match OutgoingEvent::Join(identity.clone()).to_frame() {
        Ok(join) => {
            if let Err(e) = write.send(WsMessage::Text(join)).await {
                return Ok(e.to_string());
            }
        }
        Err(e) => log::warn!("could not encode join frame: {e}"),
    }

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => forward(&text, events)?,
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = write.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok("closed by server".into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Ok(e.to_string()),
            },
            out = outbound.recv() => match out {
                Some(event) => match event.to_frame() {
                    Ok(text) => {
                        if let Err(e) = write.send(WsMessage::Text(text)).await {
                            return Ok(e.to_string());
                        }
                    }
                    Err(e) => log::warn!("could not encode push frame: {e}"),
                },
                None => {
                    let _ = write.close().await;
                    return Err(Shutdown);
                }
            },
        }
    }
}

fn forward(text: &str, events: &mpsc::UnboundedSender<SessionEvent>) -> Result<(), Shutdown> {
    let delta = match IncomingEvent::parse(text) {
        Ok(frame) => frame.into_delta(),
        Err(e) => {
            log::debug!("unparseable push frame: {e}");
            None
        }
    };
    let event = match delta {
        Some(PushDelta::NewMessage(m)) => SessionEvent::MessageReceived(m),
        Some(PushDelta::NewReaction(r)) => SessionEvent::ReactionReceived(r),
        None => return Ok(()),
    };
    events.send(event).map_err(|_| Shutdown)
}
