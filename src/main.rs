use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use voicecall_rs::client::Client;
use voicecall_rs::config::Config;
use voicecall_rs::logging;
use voicecall_rs::protocol::ParticipantId;
use voicecall_rs::relay::{Delivery, MessageHandler};
use voicecall_rs::session::{RoomRequest, SessionHandle};

#[derive(Parser, Debug)]
#[command(name = "voicecall-rs", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a room and wait for others to join
    Create {
        /// Ask the server for a specific room id
        #[arg(long = "room")]
        room: Option<String>,
    },
    /// Join an existing room (falls back to `room_id` from the config)
    Join { room: Option<String> },
}

struct PrintMessages;

impl MessageHandler for PrintMessages {
    fn on_message(&self, sender: &ParticipantId, message: Value, via: Delivery) {
        let text = match &message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        println!("[{sender} via {via:?}] {text}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (cfg, request) = match cli.command {
        Commands::Create { room } => {
            let cfg = Config::load(&cli.config)?.with_room(room)?;
            let request = RoomRequest::Create(cfg.room_id.clone());
            (cfg, request)
        }
        Commands::Join { room } => {
            let cfg = Config::load(&cli.config)?.with_room(room)?;
            let room = cfg
                .room_id
                .clone()
                .context("join needs a room id (argument or config room_id)")?;
            (cfg, RoomRequest::Join(room))
        }
    };
    logging::init(&cfg.log_path(), cfg.log_level.as_deref())?;

    let client = Client::new(cfg).with_message_handler(Arc::new(PrintMessages));
    let call = client.start(request).await?;
    info!(call_id = %call.call_id(), "call started; type `<participant> <message>`, Ctrl+C to leave");

    let input = tokio::spawn(read_messages(call.handle()));
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("leaving room");
    input.abort();
    call.stop().await
}

async fn read_messages(handle: SessionHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some((target, text)) = line.trim().split_once(' ') else {
                    if !line.trim().is_empty() {
                        warn!("expected `<participant> <message>`");
                    }
                    continue;
                };
                let message = Value::String(text.trim().to_string());
                if !handle.send_message(ParticipantId::new(target), message) {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("stdin: {err}");
                break;
            }
        }
    }
}
