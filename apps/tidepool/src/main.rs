use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use tidepool::config::NodeConfig;
use tidepool::relay::WebSocketDialer;
use tidepool::state::{ChannelConfig, LocalState};
use tidepool::store::memory::MemoryStore;
use tidepool::store::stream::StreamReplicator;
use tidepool::store::DocumentStore;
use tidepool::telemetry::logging::{self, LogConfig, LogLevel};
use tidepool::transport::webrtc::RtcConnector;
use tidepool::{Node, NodeHandle, NodeParts};

#[derive(Parser, Debug)]
#[command(name = "tidepool", about = "Replicate a document store with peers on a channel")]
struct Cli {
    /// Channel (relay subnet) to join.
    #[arg(long, short = 'c', env = "TIDEPOOL_CHANNEL", default_value = "default")]
    channel: String,

    /// Relay base URL; remembered per channel once used.
    #[arg(long, env = "TIDEPOOL_RELAY")]
    relay: Option<String>,

    /// Directory holding the persisted machine identity.
    #[arg(long, env = "TIDEPOOL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, value_enum, env = "TIDEPOOL_LOG_LEVEL", default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, env = "TIDEPOOL_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => LocalState::default_dir()?,
    };
    let mut state = LocalState::load_or_init(&data_dir)
        .with_context(|| format!("loading state from {}", data_dir.display()))?;
    let channel = match cli.relay.as_deref() {
        Some(base) => {
            let config = ChannelConfig::for_channel(base, &cli.channel);
            state.set_channel(&cli.channel, config.clone())?;
            config
        }
        None => state.channel(&cli.channel, None)?,
    };

    let config = NodeConfig::from_env(channel.relay.clone());
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let parts = NodeParts {
        dialer: Arc::new(WebSocketDialer::new()),
        connector: Arc::new(RtcConnector::new(&config)),
        replicator: Arc::new(StreamReplicator::new(store.clone())),
        store,
    };
    let (node, handle) = Node::new(config, state.machine_id.clone(), parts);
    let task = node.spawn();

    eprintln!(
        "tidepool {} on channel {} via {}",
        handle.local(),
        cli.channel,
        channel.relay
    );
    print_help();

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => eprintln!("* {event}"),
                Err(RecvError::Lagged(skipped)) => eprintln!("* {skipped} status events skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(&handle, line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("error: {err:#}"),
        }
    }

    handle.shutdown();
    task.await.context("node task failed")?;
    Ok(())
}

fn print_help() {
    eprintln!("commands: put <id> <json> | get <id> | rm <id> | ls | status | reconnect | quit");
}

/// Executes one console line. Returns `false` when the console should exit.
async fn run_command(handle: &NodeHandle, line: &str) -> Result<bool> {
    let mut words = line.splitn(3, ' ');
    let store = handle.store();
    match (words.next(), words.next(), words.next()) {
        (None | Some(""), _, _) => {}
        (Some("put"), Some(id), Some(body)) => {
            let body: Value = serde_json::from_str(body)
                .or_else(|_| serde_json::to_value(body))
                .context("document body")?;
            let doc = store.put(id, body).await?;
            println!("{} rev {}", doc.id, doc.rev);
        }
        (Some("get"), Some(id), None) => match store.get(id).await? {
            Some(doc) if !doc.deleted => println!("{} rev {}: {}", doc.id, doc.rev, doc.body),
            _ => println!("{id}: not found"),
        },
        (Some("rm"), Some(id), None) => {
            let doc = store.remove(id).await?;
            println!("{} removed at rev {}", doc.id, doc.rev);
        }
        (Some("ls"), None, None) => {
            for doc in store.documents().await?.into_iter().filter(|d| !d.deleted) {
                println!("{} rev {}: {}", doc.id, doc.rev, doc.body);
            }
        }
        (Some("status"), None, None) => {
            let snapshot = handle.snapshot().await?;
            println!(
                "relay {:?}{}",
                snapshot.relay,
                if snapshot.reconnect_pending { " (reconnect pending)" } else { "" }
            );
            for link in &snapshot.links {
                let peer = link.peer.as_ref().map_or("-".to_string(), ToString::to_string);
                println!("  {} {} peer={} {:?}", link.id, link.name, peer, link.state);
            }
            for session in &snapshot.sessions {
                println!(
                    "  session {} links={} {:?}{}",
                    session.peer,
                    session.links.len(),
                    session.state,
                    if session.awaiting_confirmation { " (awaiting <sent>)" } else { "" }
                );
            }
        }
        (Some("reconnect"), None, None) => handle.reconnect_now()?,
        (Some("quit" | "exit"), None, None) => return Ok(false),
        _ => print_help(),
    }
    Ok(true)
}
