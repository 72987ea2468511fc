use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use rcall_core::config::Config;
use rcall_core::media::webrtc::{SampleTracks, WebRtcEngine};
use rcall_core::media::{MediaEnvironment, MediaSink, MediaSinks, TracingSink};
use rcall_core::session::{Session, SessionEvent};
use rcall_core::signaling::SignalingChannel;
use rcall_core::telemetry::logging::{self, LogConfig, LogLevel};

/// Two-party WebRTC call over a room relay.
#[derive(Parser, Debug)]
#[command(name = "rcall", version)]
struct Cli {
    /// Room to join
    #[arg(long, env = "RCALL_ROOM")]
    room: String,

    /// Relay base url; overrides RCALL_SIGNALING_URL
    #[arg(long)]
    signaling_url: Option<String>,

    /// Audio only
    #[arg(long)]
    no_video: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "RCALL_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, env = "RCALL_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = Config::from_env();
    if let Some(url) = cli.signaling_url {
        config.signaling_url = url;
    }
    let signaling_config = config.signaling_config()?;
    let engine_config = config.engine_config(!cli.no_video);

    let env = MediaEnvironment::acquire().context("initialise media environment")?;
    let (pc_events, pc_rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn MediaSink> = Arc::new(TracingSink);
    let sinks = MediaSinks {
        audio: Some(sink.clone()),
        video: Some(sink),
    };
    let engine = WebRtcEngine::new(
        env,
        &engine_config,
        SampleTracks::new(&engine_config),
        sinks,
        pc_events,
    )
    .await
    .context("create peer connection")?;

    let (signaling, signaling_rx) = SignalingChannel::new(signaling_config);
    let (session, mut events) = Session::start(Arc::new(engine), signaling, signaling_rx, pc_rx);
    tracing::info!(
        target = "rcall",
        peer_id = %session.peer_id(),
        room = %cli.room,
        "joining room"
    );
    session.join(cli.room.as_str());

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                report(&event);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target = "rcall", "hanging up");
                break;
            }
        }
    }

    session.hang_up().await;
    Ok(())
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::SignalingOpen { room } => {
            tracing::info!(target = "rcall", room = %room, "waiting for the other peer")
        }
        SessionEvent::PeerJoined { peer_id } => {
            tracing::info!(target = "rcall", peer_id = %peer_id, "peer joined")
        }
        SessionEvent::MediaConnected => tracing::info!(target = "rcall", "call connected"),
        SessionEvent::MediaDisconnected { reason } => {
            tracing::warn!(target = "rcall", reason = %reason, "call disconnected")
        }
        SessionEvent::SignalingClosed { reason } => {
            tracing::warn!(target = "rcall", reason = %reason, "signaling closed")
        }
        SessionEvent::NegotiationFailed(err) => {
            tracing::warn!(target = "rcall", error = %err, "negotiation failed")
        }
        SessionEvent::ServerError { payload } => {
            tracing::warn!(target = "rcall", payload = %payload, "relay error")
        }
    }
}
