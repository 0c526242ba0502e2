//! Scripted call between two in-process peers over the loopback platform.

use std::{env, fs, rc::Rc, time::Duration};

use anyhow::{anyhow, Context as _};
use callcore::{
    proto::IceConnectionState,
    signaling::{self, LocalSignaling},
    sys::loopback::{LoopbackMediaDevices, LoopbackNetwork},
    ConnectionSession, ConnectionState, ConnectivityConfig, MediaAcquirer,
    PeerEvent, SignalingAdapter as _, SignalingMessage,
};
use futures::{future, StreamExt as _};
use tokio::{task::spawn_local, task::LocalSet, time};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    EnvFilter::new("callcore=debug,callcore_demo=info")
                }),
        )
        .init();

    let config = load_config()?;
    let want_video = env::var("CALLCORE_VIDEO").map_or(true, |v| v != "0");

    LocalSet::new().run_until(run_call(config, want_video)).await
}

/// Reads [`ConnectivityConfig`] from the JSON file at `CALLCORE_CONFIG`,
/// falling back to defaults.
fn load_config() -> anyhow::Result<ConnectivityConfig> {
    let path = match env::var("CALLCORE_CONFIG") {
        Ok(path) => path,
        Err(_) => return Ok(ConnectivityConfig::default()),
    };
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path))?;
    ConnectivityConfig::from_json_str(&raw)
        .with_context(|| format!("invalid config {}", path))
}

/// Forwards discovered candidates to `signaling` and feeds inbound messages
/// into `session`, sending back any reply.
fn wire(
    name: &'static str,
    session: &ConnectionSession,
    signaling: LocalSignaling,
) -> Rc<LocalSignaling> {
    let signaling = Rc::new(signaling);

    let mut events = session.subscribe();
    spawn_local({
        let signaling = Rc::clone(&signaling);
        async move {
            while let Some(event) = events.next().await {
                match event {
                    PeerEvent::IceCandidateDiscovered(candidate) => {
                        signaling.send(SignalingMessage::Candidate(candidate));
                    }
                    PeerEvent::RemoteMediaAvailable(media) => {
                        let tracks = media.tracks().len();
                        info!(peer = name, tracks, "Remote media");
                    }
                    PeerEvent::ConnectionStateChanged(state) => {
                        info!(peer = name, ?state, "Connection state");
                    }
                }
            }
        }
    });

    let mut inbound = signaling.messages();
    let session = session.clone();
    spawn_local({
        let signaling = Rc::clone(&signaling);
        async move {
            while let Some(message) = inbound.next().await {
                match session.handle_signaling(message).await {
                    Ok(Some(reply)) => signaling.send(reply),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(peer = name, %err, "Signaling message rejected")
                    }
                }
            }
        }
    });

    signaling
}

async fn wait_connected(
    caller: &ConnectionSession,
    callee: &ConnectionSession,
) -> anyhow::Result<()> {
    let both = future::join(
        caller.when_state(ConnectionState::Connected),
        callee.when_state(ConnectionState::Connected),
    );
    match time::timeout(CONNECT_TIMEOUT, both).await {
        Ok((true, true)) => Ok(()),
        Ok(_) => Err(anyhow!("session dropped before connecting")),
        Err(_) => {
            Err(anyhow!("peers did not connect in {:?}", CONNECT_TIMEOUT))
        }
    }
}

async fn run_call(
    config: ConnectivityConfig,
    want_video: bool,
) -> anyhow::Result<()> {
    let network = LoopbackNetwork::new();
    let caller = ConnectionSession::new(network.clone(), config.clone());
    let callee = ConnectionSession::new(network.clone(), config);

    let (caller_signaling, callee_signaling) = signaling::channel();
    let to_callee = wire("caller", &caller, caller_signaling);
    wire("callee", &callee, callee_signaling);

    caller
        .start(&MediaAcquirer::new(LoopbackMediaDevices::new()), want_video)
        .await
        .context("caller could not start")?;
    callee
        .start(&MediaAcquirer::new(LoopbackMediaDevices::new()), want_video)
        .await
        .context("callee could not start")?;

    let offer = caller.create_offer().await?;
    to_callee.send(SignalingMessage::Offer(offer));
    wait_connected(&caller, &callee).await?;
    info!("Call established");

    caller.set_audio_enabled(false);
    info!("Caller muted");
    caller.set_audio_enabled(true);
    info!("Caller unmuted");

    let caller_conn = network
        .connections()
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("caller connection is missing"))?;
    caller_conn.report_connection_state(ConnectionState::Failed);
    time::sleep(Duration::from_millis(50)).await;
    let restarts = caller_conn.restart_count();
    info!(restarts, "Connection failure injected");

    let offer = caller.create_offer().await?;
    to_callee.send(SignalingMessage::Offer(offer));
    time::sleep(Duration::from_millis(50)).await;
    caller_conn.report_ice_connection_state(IceConnectionState::Connected);
    wait_connected(&caller, &callee).await?;
    info!("Call recovered after ICE restart");

    caller.close();
    callee.close();
    info!("Call finished");
    Ok(())
}
