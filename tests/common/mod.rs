use std::{future::Future, rc::Rc};

use callcore::{
    media::LocalMedia,
    peer::PeerEvent,
    proto::{IceCandidate, MediaKind},
    sys::{
        loopback::{LoopbackNetwork, LoopbackPeerConnection, PeerCall},
        MediaStreamTrack,
    },
    ConnectionSession, ConnectivityConfig,
};
use futures::{stream::LocalBoxStream, FutureExt as _, StreamExt as _};
use tokio::task::{yield_now, LocalSet};

/// Enough scheduler turns for every local task to process pending events.
const SETTLE_TURNS: usize = 32;

pub async fn run_local<F: Future>(fut: F) -> F::Output {
    LocalSet::new().run_until(fut).await
}

pub async fn settle() {
    for _ in 0..SETTLE_TURNS {
        yield_now().await;
    }
}

pub fn session(network: &Rc<LoopbackNetwork>) -> ConnectionSession {
    ConnectionSession::new(network.clone(), ConnectivityConfig::default())
}

#[allow(dead_code)]
pub fn audio_video(owner: &str) -> LocalMedia {
    LocalMedia::new(
        Some(MediaStreamTrack::new(format!("{}-mic", owner), MediaKind::Audio)),
        Some(MediaStreamTrack::new(format!("{}-cam", owner), MediaKind::Video)),
    )
}

#[allow(dead_code)]
pub fn candidate(n: u8) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{} 1 udp 2122260223 10.0.0.{} 9 typ host",
        n, n,
    ))
}

/// Candidates discovered so far, without waiting for more.
#[allow(dead_code)]
pub fn discovered(
    events: &mut LocalBoxStream<'static, PeerEvent>,
) -> Vec<IceCandidate> {
    let mut found = Vec::new();
    while let Some(Some(event)) = events.next().now_or_never() {
        if let PeerEvent::IceCandidateDiscovered(candidate) = event {
            found.push(candidate);
        }
    }
    found
}

/// Position of the first `call` in the connection's journal.
#[allow(dead_code)]
pub fn position(conn: &LoopbackPeerConnection, call: &PeerCall) -> usize {
    conn.journal()
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{:?} was never called", call))
}
