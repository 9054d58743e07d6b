use matchchat::api::client::{ApiClient, ChatApi};
use matchchat::api::models::{DeliveryState, MessageId, UserId};
use matchchat::app::AppConfig;
use matchchat::chat::session::DeleteIntent;
use matchchat::{ChatError, ChatSession, SessionContext};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "matchchat=info,warn";

fn init_logging() {
    // `log` records from the library reach the subscriber through its bridge.
    let filter = EnvFilter::try_from_env("MATCHCHAT_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    init_logging();
    let config = AppConfig::load();
    if !config.is_complete() {
        eprintln!("matchchat: set base_url and identity in matchchat.toml");
        std::process::exit(2);
    }
    let deep_link = std::env::args().nth(1).map(UserId::new);
    if let Err(e) = matchchat::utils::RUNTIME.block_on(run(config, deep_link)) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig, deep_link: Option<UserId>) -> Result<(), Box<dyn std::error::Error>> {
    let client = ApiClient::new(&config.base_url, config.token.clone())?;
    match client.ping().await {
        Ok(status) => log::info!("server answered ping with HTTP {status}"),
        Err(e) => log::warn!("server unreachable, continuing: {e}"),
    }
    let api: Arc<dyn ChatApi> = Arc::new(client);
    let ctx = SessionContext::new(UserId::new(config.identity.clone()));
    let mut session = ChatSession::new(ctx, api, config.timings());
    session.connect_transport(config.push_endpoint()?, config.backoff());
    session.mount(deep_link);

    let mut shell = Shell { excerpt_chars: config.excerpt_chars, pending_delete: None };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = session.turn() => continue,
        };
        let Some(line) = line else { break };
        shell.handle(&mut session, line.trim());
    }

    session.disconnect_transport();
    session.run_until_idle().await;
    Ok(())
}

struct Shell {
    excerpt_chars: usize,
    /// Deletion awaiting `/confirm`.
    pending_delete: Option<DeleteIntent>,
}

impl Shell {
    fn handle(&mut self, session: &mut ChatSession, line: &str) {
        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(""), None, None) => {}
            (Some("/open"), Some(peer), None) => match session.select(UserId::new(peer)) {
                Ok(true) => {}
                Ok(false) => println!("already open"),
                Err(e) => report(&e),
            },
            (Some("/show"), None, None) => self.show(session),
            (Some("/recent"), None, None) => {
                for s in session.recent() {
                    let name = if s.display_name.is_empty() { s.peer_identity.as_str() } else { s.display_name.as_str() };
                    println!(
                        "{:<20} {:>3} unread  {}",
                        name,
                        s.unread_count,
                        matchchat::utils::excerpt(&s.last_message_excerpt, self.excerpt_chars)
                    );
                }
            }
            (Some("/react"), Some(id), Some(emoji)) => match session.react(MessageId::new(id), emoji) {
                Ok(ticket) => {
                    tokio::spawn(async move {
                        if let Err(e) = ticket.outcome().await {
                            report(&e);
                        }
                    });
                }
                Err(e) => report(&e),
            },
            (Some("/delete"), Some(id), None) => match session.prepare_delete(MessageId::new(id)) {
                Ok(intent) => {
                    println!("delete {}? type /confirm to proceed", intent.message_id());
                    self.pending_delete = Some(intent);
                }
                Err(e) => report(&e),
            },
            (Some("/confirm"), None, None) => match self.pending_delete.take() {
                Some(intent) => {
                    let ticket = session.delete(intent);
                    tokio::spawn(async move {
                        if let Err(e) = ticket.outcome().await {
                            report(&e);
                        }
                    });
                }
                None => println!("nothing to confirm"),
            },
            (Some("/retry"), None, None) => {
                session.retry();
                session.refresh_recent();
            }
            _ => match session.send(line) {
                Ok(ticket) => {
                    tokio::spawn(async move {
                        match ticket.outcome().await {
                            Ok(message) => log::info!("delivered {}", message.id),
                            Err(failure) => {
                                println!("[failed] {}", failure.message.content);
                                report(&failure.error);
                            }
                        }
                    });
                }
                Err(e) => report(&e),
            },
        }
    }

    fn show(&self, session: &ChatSession) {
        if session.is_loading() {
            println!("loading…");
        }
        if let Some(err) = session.history_error() {
            println!("history unavailable ({err}); /retry to try again");
        }
        for m in session.messages() {
            let marker = match m.delivery_state {
                DeliveryState::Pending => "…",
                DeliveryState::Confirmed => " ",
                DeliveryState::Failed => "!",
            };
            let tally: Vec<String> =
                session.reaction_tally(&m.id).into_iter().map(|(e, n)| format!("{e}{n}")).collect();
            println!("{marker} [{}] {}: {} {}", m.id, m.sender_id, m.content, tally.join(" "));
        }
    }
}

fn report(error: &ChatError) {
    match error {
        ChatError::EntitlementDenied { .. } => println!("an active plan is required: upgrade to continue"),
        other => println!("error: {other}"),
    }
}
