//! Loopback demo: two sessions in one process share an in-memory
//! signaling store and move a file over a real WebRTC connection.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roomdrop::{
    generate_room_id, ConnectionEvent, MemorySignalingStore, Session, TransferEvent,
};

#[derive(Parser, Debug)]
#[command(name = "roomdrop")]
#[command(about = "Peer-to-peer file drop over WebRTC (loopback demo)", long_about = None)]
struct CliArgs {
    /// File to send
    #[arg(long)]
    send: PathBuf,

    /// Directory to write the received file into
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let store = Arc::new(MemorySignalingStore::new());
    let room = generate_room_id();
    info!("demo room: {}", room);

    // The receiving side joins the room as if it had followed a link.
    let (receiver, mut receiver_events) = Session::new(store.clone(), Some(room.clone()));
    receiver.start().await.context("responder start failed")?;

    // The sending side initiates into the same room.
    let (sender, mut sender_events) = Session::new(store.clone(), None);
    sender
        .connect_to(&room)
        .await
        .context("initiator connect failed")?;

    let mut sent = false;
    let received = loop {
        tokio::select! {
            event = sender_events.recv() => {
                let Some(event) = event else { bail!("sender event stream ended") };
                match event {
                    ConnectionEvent::ChannelOpen if !sent => {
                        sent = true;
                        sender.send_file(Some(args.send.clone())).await?;
                    }
                    ConnectionEvent::IceStateChanged(s) => info!("ice: {}", s),
                    ConnectionEvent::Transfer(TransferEvent::SendProgress(p)) => {
                        info!(
                            "sending {}: {:.1}% ({:.2} MB/s)",
                            p.file_name, p.percentage, p.throughput_mbps
                        );
                    }
                    ConnectionEvent::Transfer(TransferEvent::TransferFailed { error, .. }) => {
                        bail!("send failed: {}", error);
                    }
                    _ => {}
                }
            }
            event = receiver_events.recv() => {
                let Some(event) = event else { bail!("receiver event stream ended") };
                match event {
                    ConnectionEvent::Transfer(TransferEvent::ReceiveProgress(p)) => {
                        info!(
                            "receiving {}: {:.1}% ({:.2} MB/s)",
                            p.file_name, p.percentage, p.throughput_mbps
                        );
                    }
                    ConnectionEvent::Transfer(TransferEvent::ReceiveCompleted(file)) => {
                        break file;
                    }
                    ConnectionEvent::Transfer(TransferEvent::TransferFailed { error, .. }) => {
                        bail!("receive failed: {}", error);
                    }
                    _ => {}
                }
            }
        }
    };

    let target = args.output_dir.join(&received.name);
    tokio::fs::write(&target, &received.data)
        .await
        .with_context(|| format!("writing {}", target.display()))?;
    info!(
        "received {} ({} bytes, {:.2} MB/s) -> {}",
        received.name,
        received.data.len(),
        received.throughput_mbps,
        target.display()
    );

    sender.close().await;
    receiver.close().await;
    Ok(())
}
