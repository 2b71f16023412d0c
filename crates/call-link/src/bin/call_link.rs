//! Call link command-line peer
//!
//! Joins a signaling server, waits to be paired with a partner and keeps the
//! call alive until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Call bob in room-1 through a local signaling server
//! call_link --peer-id alice --partner bob --room room-1
//!
//! # Behind a restrictive firewall, relay everything through TURN
//! call_link --peer-id alice --partner bob --room room-1 \
//!     --turn-servers turn:turn.example.com:3478:user:pass --force-relay
//!
//! # Enable debug logging
//! RUST_LOG=remotemedia_call_link=debug call_link --peer-id alice --partner bob --room room-1
//! ```

use clap::{Parser, ValueEnum};
use remotemedia_call_link::{
    CallLinkConfig, CallNotice, NetworkType, RtcPeerLinkFactory, SessionDriver, SignalingClient,
    SyntheticMediaSource, TurnServerConfig,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Peer-to-peer call with automatic recovery
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling server URL
    #[arg(long, default_value = "ws://localhost:8080", env = "CALL_LINK_SIGNALING_URL")]
    signaling_url: String,

    /// Local peer id (random if omitted)
    #[arg(long, env = "CALL_LINK_PEER_ID")]
    peer_id: Option<String>,

    /// Partner peer id
    #[arg(long, env = "CALL_LINK_PARTNER")]
    partner: String,

    /// Room shared with the partner
    #[arg(long, env = "CALL_LINK_ROOM")]
    room: String,

    /// STUN server URLs (comma-separated)
    #[arg(
        long,
        default_value = "stun:stun.l.google.com:19302",
        value_delimiter = ',',
        env = "CALL_LINK_STUN_SERVERS"
    )]
    stun_servers: Vec<String>,

    /// TURN servers (comma-separated, format: turn:host:port:username:credential)
    #[arg(long, value_delimiter = ',', env = "CALL_LINK_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Start in relay-only mode
    #[arg(long, env = "CALL_LINK_FORCE_RELAY")]
    force_relay: bool,

    /// Known network classification
    #[arg(long, value_enum, env = "CALL_LINK_NETWORK")]
    network: Option<NetworkArg>,

    /// Capture audio only
    #[arg(long)]
    audio_only: bool,

    /// Emit logs as JSON
    #[arg(long, env = "CALL_LINK_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NetworkArg {
    Open,
    Moderate,
    Restrictive,
}

impl From<NetworkArg> for NetworkType {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Open => NetworkType::Open,
            NetworkArg::Moderate => NetworkType::Moderate,
            NetworkArg::Restrictive => NetworkType::Restrictive,
        }
    }
}

/// Parse TURN server string (format: turn:host:port:username:credential)
fn parse_turn_server(s: &str) -> Option<TurnServerConfig> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() >= 5 {
        Some(TurnServerConfig {
            url: format!("{}:{}:{}", parts[0], parts[1], parts[2]),
            username: parts[3].to_string(),
            credential: parts[4..].join(":"),
        })
    } else {
        None
    }
}

fn build_config_from_args(args: &Args) -> CallLinkConfig {
    let mut config = if args.audio_only {
        CallLinkConfig::audio_only_preset(&args.signaling_url)
    } else {
        CallLinkConfig {
            signaling_url: args.signaling_url.clone(),
            ..Default::default()
        }
    };

    config.stun_servers = args.stun_servers.clone();
    config.force_relay = args.force_relay;

    let turn_servers: Vec<TurnServerConfig> = args
        .turn_servers
        .iter()
        .filter_map(|s| {
            let parsed = parse_turn_server(s);
            if parsed.is_none() {
                warn!("Ignoring malformed TURN server: {}", s);
            }
            parsed
        })
        .collect();
    config = config.with_turn_servers(turn_servers);

    if let Some(peer_id) = &args.peer_id {
        config = config.with_peer_id(peer_id);
    }
    if let Some(network) = args.network {
        config = config.with_network_hint(network.into());
    }

    config
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(args.json_logs);

    info!("Starting call link v{}", remotemedia_call_link::version());

    let stop = CancellationToken::new();
    let stop_signal = stop.clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, hanging up...");
        stop_signal.cancel();
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("call-link-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, stop))
}

async fn async_main(args: Args, stop: CancellationToken) -> anyhow::Result<()> {
    let config = build_config_from_args(&args);
    config.validate()?;

    let peer_id = config
        .peer_id
        .clone()
        .unwrap_or_else(|| format!("peer-{}", uuid::Uuid::new_v4()));

    info!("Configuration:");
    info!("  Peer ID: {}", peer_id);
    info!("  Partner: {}", args.partner);
    info!("  Room: {}", args.room);
    info!("  Signaling: {}", config.signaling_url);
    info!("  STUN servers: {:?}", config.stun_servers);
    info!("  TURN servers: {}", config.turn_servers.len());
    info!("  Relay only: {}", config.force_relay);

    let (signaling, mut inbound) = SignalingClient::connect(&config.signaling_url, &peer_id).await?;

    let (driver, handle, mut notices) = SessionDriver::new(
        &config,
        &peer_id,
        Arc::new(RtcPeerLinkFactory::new(&config)),
        Arc::new(SyntheticMediaSource::new(&peer_id)),
        Arc::new(signaling),
    );
    let driver_task = tokio::spawn(driver.run());

    let forward = handle.clone();
    tokio::spawn(async move {
        while let Some(signal) = inbound.recv().await {
            if forward.signal(signal).is_err() {
                break;
            }
        }
        warn!("Signaling connection closed");
    });

    handle.matched(&args.partner, &args.room)?;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                let _ = handle.browser_closing();
                break;
            }
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                match notice {
                    CallNotice::Failure(report) => {
                        error!(class = ?report.class, "Call failure: {}", report.message);
                    }
                    CallNotice::Ended(reason) => {
                        info!("Call ended: {:?}", reason);
                        break;
                    }
                    other => info!("{:?}", other),
                }
            }
        }
    }

    handle.shutdown();
    match driver_task.await {
        Ok(result) => result?,
        Err(e) => error!("Session task panicked: {}", e),
    }

    info!("Call link stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}
