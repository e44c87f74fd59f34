use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chatlink_core::{
    ChatSession, ConnectionManager, SessionError, SessionEvent, SessionPhase,
    config::Config,
    model::Role,
    ws_client::WsConnector,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "chatlink streaming chat client", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the WebSocket endpoint
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Use the persona chat request with this persona id
    #[arg(long)]
    persona: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and print the streamed reply
    Send {
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
    /// Interactive chat; `/retry` regenerates the last reply, `/quit` exits
    Repl,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    let manager = ConnectionManager::new(Arc::new(WsConnector::new_default()), cfg.connection.clone());
    let session = ChatSession::new(manager.clone(), cfg.chat.clone());
    let mut events = session.events();

    manager
        .ensure_connected(&cfg.connection.endpoint)
        .await
        .with_context(|| format!("could not connect to {}", cfg.connection.endpoint))?;

    match cli.command {
        Commands::Send { message } => {
            session.send(&message).map_err(rejected)?;
            wait_for_reply(&mut events).await;
        }
        Commands::Repl => repl(&manager, &session, &mut events).await?,
    }

    manager.shutdown();
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(endpoint) = &cli.endpoint {
        cfg.connection.endpoint = endpoint.clone();
    }
    if let Some(model) = &cli.model {
        cfg.chat.model = model.clone();
    }
    if let Some(persona) = &cli.persona {
        cfg.chat.persona_id = Some(persona.clone());
    }
    cfg.validate()?;
    Ok(cfg)
}

fn rejected(err: SessionError) -> anyhow::Error {
    anyhow::anyhow!("message not sent: {err}")
}

async fn repl(
    manager: &ConnectionManager,
    session: &ChatSession,
    events: &mut broadcast::Receiver<SessionEvent>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        // Drop notifications left over from rejected commands.
        while events.try_recv().is_ok() {}
        print!("> ");
        io::stdout().flush().ok();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let result = match line.trim() {
            "/quit" => break,
            "/retry" => {
                let last_reply = session
                    .transcript()
                    .iter()
                    .rev()
                    .find(|t| t.role == Role::Assistant)
                    .map(|t| t.id);
                match last_reply {
                    Some(id) => session.retry(id),
                    None => {
                        eprintln!("[nothing to retry]");
                        continue;
                    }
                }
            }
            text => session.send(text).map(|_| ()),
        };

        match result {
            Ok(()) => wait_for_reply(events).await,
            Err(SessionError::EmptyInput) => {}
            Err(SessionError::NotConnected { .. }) => {
                eprintln!("[not connected; reconnecting]");
                if let Err(e) = manager.ensure_connected(&manager.config().endpoint).await {
                    eprintln!("[{e}]");
                }
            }
            Err(e) => eprintln!("[{e}]"),
        }
    }
    Ok(())
}

/// Print the reply as it streams; returns once the session is idle again.
async fn wait_for_reply(events: &mut broadcast::Receiver<SessionEvent>) {
    let mut streamed = false;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event receiver lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            SessionEvent::Delta { text, .. } => {
                streamed = true;
                print!("{text}");
                io::stdout().flush().ok();
            }
            SessionEvent::TurnAppended(turn) if turn.role == Role::Assistant && !streamed => {
                print!("{}", turn.content);
            }
            SessionEvent::Notice(message) => tracing::info!("{message}"),
            SessionEvent::Failure(message) => eprintln!("[error: {message}]"),
            SessionEvent::PhaseChanged(SessionPhase::Idle) => {
                println!();
                return;
            }
            _ => {}
        }
    }
}
