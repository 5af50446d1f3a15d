use clap::Parser;
use client::chat::{ConfirmReply, TellReply};
use client::Client;
use log::{info, warn};
use shared::Value;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Name to log on with
    #[arg(short = 'u', long)]
    username: String,

    /// Send a private line to this user
    #[arg(short = 't', long)]
    tell: Option<String>,

    /// Text sent with --tell
    #[arg(short = 'm', long, default_value = "hello")]
    message: String,

    /// Send a line to everyone
    #[arg(short = 'b', long)]
    broadcast: Option<String>,

    /// Set an away message (empty clears it)
    #[arg(short = 'a', long)]
    away: Option<String>,

    /// How long to wait for each response, in milliseconds
    #[arg(short = 'w', long, default_value = "2000")]
    wait_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let wait = Duration::from_millis(args.wait_ms);

    info!("Connecting to: {}", args.server);
    let client = Client::connect(&args.server, &args.username).await?;
    let chat = client.chat().ok_or("server does not host a chat service")?;

    client.on_message(|_, name, event_args| {
        if let [Value::Str(speaker), Value::Str(line)] = event_args {
            println!("[{}] {}: {}", name, speaker, line);
        }
    })?;
    client.ping()?;

    if let Some(message) = &args.away {
        chat.away(message)?;
    }

    let interactive = args.tell.is_none() && args.broadcast.is_none();

    if let Some(target) = &args.tell {
        let (reply, outcome) = TellReply::channel();
        chat.tell(target, &args.message, reply)?;
        match timeout(wait, outcome).await {
            Ok(Ok(outcome)) => println!("tell {}: {:?}", target, outcome),
            Ok(Err(_)) => warn!("Tell to {} was dropped without an answer", target),
            Err(_) => warn!("No answer to tell within {:?}", wait),
        }
    }

    if let Some(message) = &args.broadcast {
        let (reply, outcome) = ConfirmReply::channel();
        chat.broadcast(message, reply)?;
        match timeout(wait, outcome).await {
            Ok(Ok(outcome)) => println!("broadcast: {:?}", outcome),
            Ok(Err(_)) => warn!("Broadcast was dropped without an answer"),
            Err(_) => warn!("No answer to broadcast within {:?}", wait),
        }
    }

    if interactive {
        info!("Listening for chat, Ctrl+C to quit");
        tokio::signal::ctrl_c().await?;
    }

    client.disconnect().await;
    Ok(())
}
