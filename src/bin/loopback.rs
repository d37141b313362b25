//! Два участника в одном процессе
//!
//! Оба ищут собеседника через общее хранилище в памяти, соединяются
//! настоящими webrtc-rs peer connection с синтетическими треками, держат
//! звонок и кладут трубку.
//!
//! ```bash
//! RUST_LOG=info,yapspace=debug cargo run --bin loopback -- --hold-secs 5
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use yapspace::peer::{RtcPeerFactory, SyntheticMedia};
use yapspace::{CallConfig, CallSession, Collaborators, Identity, MemoryStore, SessionStatus};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file with call settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Traversal credentials endpoint (overrides the config file)
    #[arg(long)]
    credentials_url: Option<String>,

    /// Seconds to wait for both sides to connect
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Seconds to keep the call up before hanging up
    #[arg(long, default_value_t = 3)]
    hold_secs: u64,
}

fn session(
    name: &str,
    store: &MemoryStore,
    config: &CallConfig,
) -> Result<CallSession, Box<dyn std::error::Error>> {
    let deps = Collaborators {
        store: Arc::new(store.clone()),
        media: Arc::new(SyntheticMedia),
        peers: Arc::new(RtcPeerFactory),
        credentials: None,
    };
    Ok(CallSession::new(Identity::new(name)?, deps, config.clone())?)
}

async fn wait_for(session: &CallSession, target: SessionStatus) -> bool {
    let mut status = session.subscribe_status();
    let reached = status.wait_for(|s| *s == target).await.is_ok();
    reached
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    yapspace::logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CallConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => CallConfig::default(),
    };
    if let Some(url) = args.credentials_url {
        config.credentials_url = Some(url);
    }

    let store = MemoryStore::new();
    let alice = session("alice", &store, &config)?;
    let bob = session("bob", &store, &config)?;

    tokio::try_join!(alice.search(), bob.search())?;
    info!("alice: {:?}, bob: {:?}", alice.view(), bob.view());

    let connected = tokio::time::timeout(Duration::from_secs(args.timeout_secs), async {
        tokio::join!(
            wait_for(&alice, SessionStatus::Connected),
            wait_for(&bob, SessionStatus::Connected)
        )
    })
    .await;

    if !matches!(connected, Ok((true, true))) {
        warn!("Sessions did not pair within {} s", args.timeout_secs);
        for side in [&alice, &bob] {
            if side.status() == SessionStatus::Connected {
                side.end_call().await?;
            } else {
                side.cancel_search().await?;
            }
        }
        return Err("pairing timed out".into());
    }
    info!("Both sides connected");

    tokio::time::sleep(Duration::from_secs(args.hold_secs)).await;
    for (name, side) in [("alice", &alice), ("bob", &bob)] {
        let tracks = side
            .remote_stream()
            .borrow()
            .as_ref()
            .map(|s| s.track_ids())
            .unwrap_or_default();
        info!("{name} receives tracks {tracks:?}");
    }

    alice.end_call().await?;
    let hung_up = tokio::time::timeout(
        Duration::from_secs(args.timeout_secs),
        wait_for(&bob, SessionStatus::Disconnected),
    )
    .await
    .unwrap_or(false);
    info!(
        "bob noticed hangup: {hung_up}, records left: {}",
        store.records().len()
    );
    Ok(())
}
