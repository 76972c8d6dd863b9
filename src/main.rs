//! stagebridge — main entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stagebridge::bus::{MessageBus, OutboundMessage};
use stagebridge::channels::{AvatarChannel, Channel, YouTubeChannel};
use stagebridge::config::Config;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "stagebridge", version, about = "Live-stream chat to avatar bridge")]
struct Cli {
    /// Path to a .env file to load before reading configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Echo inbound chat straight back to the avatar (no agent attached).
    #[arg(long)]
    echo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.config {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stagebridge=info")),
        )
        .init();

    let config = Config::from_env()?;
    let bus = Arc::new(MessageBus::new(64));

    let avatar = config
        .avatar
        .map(|cfg| AvatarChannel::new(cfg, bus.clone()));
    let youtube = config
        .youtube
        .map(|cfg| YouTubeChannel::new(cfg, bus.clone()))
        .transpose()?;

    // Pace accumulation flushes on the avatar's speech cadence.
    if let (Some(youtube), Some(avatar)) = (&youtube, &avatar) {
        youtube.set_tts_ready(avatar.tts_ready_signal());
    }

    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
    if let Some(youtube) = youtube {
        channels.push(Arc::new(youtube));
    }
    if let Some(avatar) = avatar {
        channels.push(Arc::new(avatar));
    }
    if channels.is_empty() {
        anyhow::bail!(
            "no channels configured; set YT_VIDEO_ID or YT_CHANNEL_ID for ingestion, \
             AVATAR_WS_PORT for the avatar server"
        );
    }

    let root = CancellationToken::new();
    for channel in &channels {
        channel.start(&root).await?;
        tracing::info!(channel = channel.name(), "channel started");
    }

    // Route agent replies to their sink channel by name.
    let mut outbound_rx = bus
        .take_outbound()
        .ok_or_else(|| anyhow::anyhow!("outbound receiver already taken"))?;
    let router_channels = channels.clone();
    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            match router_channels.iter().find(|c| c.name() == msg.channel) {
                Some(channel) => {
                    if let Err(e) = channel.send(msg).await {
                        tracing::warn!(error = %e, "outbound delivery failed");
                    }
                }
                None => {
                    tracing::warn!(channel = %msg.channel, "no channel for outbound message");
                }
            }
        }
    });

    // The LLM agent is an external collaborator. Without one we either echo
    // chat back to the avatar (demo mode) or just log it.
    let mut inbound_rx = bus
        .take_inbound()
        .ok_or_else(|| anyhow::anyhow!("inbound receiver already taken"))?;
    let echo = cli.echo;
    let echo_bus = bus.clone();
    tokio::spawn(async move {
        while let Some(msg) = inbound_rx.recv().await {
            if echo {
                echo_bus
                    .publish_outbound(OutboundMessage {
                        channel: "aituber".to_string(),
                        chat_id: String::new(),
                        content: msg.content,
                    })
                    .await;
            } else {
                tracing::info!(
                    channel = %msg.channel,
                    sender_id = %msg.sender_id,
                    content = %msg.content,
                    "inbound chat (no agent attached)"
                );
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    for channel in &channels {
        if let Err(e) = channel.stop().await {
            tracing::warn!(channel = channel.name(), error = %e, "stop failed");
        }
    }
    root.cancel();

    Ok(())
}
