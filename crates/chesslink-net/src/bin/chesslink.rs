//! ChessLink CLI - connect two players directly and chat over the link
//!
//! Usage:
//!   chesslink host                    Register and print a three-word address
//!   chesslink join <WORD> <WORD> <WORD>
//!   chesslink config                  Print the effective configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chesslink_core::{Config, ConnectionState, FailureReason, Identifier};
use chesslink_net::{NegotiationHandle, Negotiator, Session};

#[derive(Parser)]
#[command(name = "chesslink")]
#[command(about = "Peer-to-peer connections for two-player games", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: platform config directory)
    #[arg(short, long, global = true, env = "CHESSLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Rendezvous server base URL
    #[arg(long, global = true, env = "CHESSLINK_RENDEZVOUS")]
    rendezvous: Option<String>,

    /// STUN server as host:port (repeatable, replaces the configured list)
    #[arg(long = "stun", global = true)]
    stun: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a game and wait for the other player
    Host,

    /// Join a game by its three-word address
    Join {
        /// The address words, e.g. BASK DAWN ALAN
        #[arg(required = true, num_args = 1..)]
        words: Vec<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(url) = cli.rendezvous {
        config.rendezvous.base_url = url;
    }
    if !cli.stun.is_empty() {
        config.stun.servers = cli.stun;
    }

    match cli.command {
        Commands::Host => {
            let session = negotiate(Negotiator::host(config).spawn()).await?;
            chat(session).await?;
        }
        Commands::Join { words } => {
            let identifier: Identifier = match words.join(" ").parse() {
                Ok(identifier) => identifier,
                Err(e) => {
                    error!("{} ({})", e, e.hint());
                    return Err(e.into());
                }
            };
            let session = negotiate(Negotiator::join(config, identifier).spawn()).await?;
            chat(session).await?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Report progress until the attempt ends; Ctrl+C cancels it
async fn negotiate(mut handle: NegotiationHandle) -> Result<Session, FailureReason> {
    let mut states = handle.watch();

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                match &state {
                    ConnectionState::AwaitingPeer { identifier } => {
                        info!("");
                        info!("  Your address: {}", identifier);
                        info!("");
                        info!("  The other player runs:");
                        info!("    chesslink join {}", identifier);
                        info!("");
                    }
                    ConnectionState::Failed { reason } => {
                        error!("{} ({})", reason, reason.hint());
                    }
                    other => info!("{}", other),
                }
                if state.is_terminal() {
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Cancelling...");
                handle.cancel();
            }
        }
    }

    match handle.try_finish() {
        Some(outcome) => outcome,
        None => handle.finish().await,
    }
}

/// Line chat: each stdin line is one datagram, each datagram one line
async fn chat(mut session: Session) -> Result<(), Box<dyn std::error::Error>> {
    let mut incoming = session
        .incoming()
        .ok_or("session receive stream already taken")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("Connected to {}. Type to chat, /quit to leave.", session.peer());

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) if line.is_empty() => {}
                Some(line) => session.send(line.as_bytes()).await?,
                None => break,
            },
            datagram = incoming.next() => match datagram {
                Some(datagram) => println!("peer> {}", String::from_utf8_lossy(&datagram)),
                None => break,
            },
            _ = signal::ctrl_c() => break,
        }
    }

    session.close();
    info!("Disconnected");
    Ok(())
}
