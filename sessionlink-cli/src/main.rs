use anyhow::{anyhow, Context, Result};
use clap::Parser;
use sessionlink_core::core_router::metrics::init_metrics;
use sessionlink_core::core_session::Subscription;
use sessionlink_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use sessionlink_core::{
    Config, EventCategory, HandshakeState, LocalKeyPair, MemoryHub, MemoryRecordStore,
    MessageStatus, SessionEvent, SessionHandle, SessionId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sessionlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; `SESSIONLINK_*` variables are used without one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run two in-process sessions through handshake, chat, typing and receipts
    Demo {
        /// Message alice sends once the conversation is ready
        #[arg(default_value = "Hello from SessionLink!")]
        message: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// How long the demo waits for any single step
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    init_logging_with_config(log_config(&args, &config))?;
    init_metrics();

    match args.command {
        Some(Command::Demo { message }) => {
            run_demo(&config, &message).await?;
        }
        Some(Command::Config) => {
            println!("{}", config.to_toml()?);
        }
        None => {
            info!("No command specified. Use --help for usage information.");
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env()?,
    };
    Ok(config)
}

/// The `[logging]` section, with command line flags taking precedence
fn log_config(args: &Args, config: &Config) -> LogConfig {
    let mut log = LogConfig::from_config(&config.logging).unwrap_or_else(|e| {
        eprintln!("{}, using default logging", e);
        LogConfig::default()
    });
    if let Some(level) = &args.log_level {
        match level.parse::<LogLevel>() {
            Ok(level) => log.level = level,
            Err(e) => eprintln!("{}, keeping '{}'", e, log.level.as_str()),
        }
    }
    if args.json_logs {
        log = log.json_format(true);
    }
    log
}

async fn spawn_session(
    name: &str,
    base: &Config,
    hub: &MemoryHub,
) -> Result<(SessionHandle, tokio::task::JoinHandle<()>)> {
    let mut config = base.clone();
    config.session.display_name = name.to_string();
    let session = SessionHandle::spawn(
        SessionId::new(name)?,
        LocalKeyPair::generate(),
        &config,
        Arc::new(hub.transport()),
        Arc::new(MemoryRecordStore::new()),
    )
    .await?;
    Ok(session)
}

/// Wait until `subscription` yields an event accepted by `accept`
async fn wait_for<F>(subscription: &mut Subscription, what: &str, mut accept: F) -> Result<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let step = async {
        while let Some(event) = subscription.recv().await {
            if accept(&event) {
                return Some(event);
            }
        }
        None
    };
    tokio::time::timeout(STEP_TIMEOUT, step)
        .await
        .map_err(|_| anyhow!("timed out waiting for {}", what))?
        .ok_or_else(|| anyhow!("session closed while waiting for {}", what))
}

async fn run_demo(config: &Config, text: &str) -> Result<()> {
    let hub = MemoryHub::new();
    let (alice, alice_task) = spawn_session("alice", config, &hub).await?;
    let (bob, bob_task) = spawn_session("bob", config, &hub).await?;

    let mut alice_events = alice.subscribe(&[
        EventCategory::Handshake,
        EventCategory::Status,
        EventCategory::Typing,
    ]);
    let mut bob_events = bob.subscribe(&[EventCategory::Handshake, EventCategory::Messages]);

    let request_id = alice
        .send_key_exchange_request(bob.local(), "hi bob, it's alice")
        .await?;
    info!(request_id = %request_id, "alice sent key exchange request");

    wait_for(&mut bob_events, "incoming request", |event| {
        matches!(event, SessionEvent::HandshakeChanged { state: HandshakeState::RequestReceived, .. })
    })
    .await?;
    for request in bob.pending_requests().await? {
        info!(from = %request.from_session, phrase = %request.request_phrase, "bob sees pending request");
    }
    bob.respond_to_key_exchange_request(alice.local(), true).await?;

    let ready = wait_for(&mut alice_events, "conversation ready", |event| {
        matches!(event, SessionEvent::ConversationReady { .. })
    })
    .await?;
    if let SessionEvent::ConversationReady { peer, display_name } = ready {
        info!(peer = %peer, display_name = ?display_name, "alice: conversation ready");
    }
    wait_for(&mut bob_events, "conversation ready", |event| {
        matches!(event, SessionEvent::ConversationReady { .. })
    })
    .await?;

    let sent = alice.send_message(bob.local(), text).await?;
    info!(id = %sent.id, status = ?sent.status, "alice sent message");

    let received = wait_for(&mut bob_events, "chat message", |event| {
        matches!(event, SessionEvent::MessageReceived(_))
    })
    .await?;
    let SessionEvent::MessageReceived(message) = received else {
        return Err(anyhow!("unexpected event"));
    };
    info!(id = %message.id, content = %message.content, "bob received message");

    bob.set_typing_state(alice.local(), true).await?;
    wait_for(&mut alice_events, "typing indicator", |event| {
        matches!(event, SessionEvent::Typing(update) if update.is_typing)
    })
    .await?;
    info!("alice sees bob typing");
    bob.set_typing_state(alice.local(), false).await?;

    bob.send_read_receipt(alice.local(), &message.id).await?;
    wait_for(&mut alice_events, "read receipt", |event| {
        matches!(event, SessionEvent::MessageStatusChanged(change) if change.to == MessageStatus::Read)
    })
    .await?;

    for message in alice.conversation(bob.local()).await? {
        info!(id = %message.id, status = ?message.status, content = %message.content, "alice conversation");
    }

    for (session, task) in [(alice, alice_task), (bob, bob_task)] {
        if let Err(e) = session.shutdown().await {
            warn!(session = %session.local(), error = %e, "Shutdown failed");
        }
        task.await?;
    }

    info!("Demo finished");
    Ok(())
}
