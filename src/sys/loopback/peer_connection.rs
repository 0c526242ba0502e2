use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use async_trait::async_trait;
use futures::stream::LocalBoxStream;
use tokio::task::yield_now;

use crate::{
    conf::ConnectivityConfig,
    proto::{
        ConnectionState, IceCandidate, IceConnectionState, MediaKind, SdpType,
        SessionDescription,
    },
    sys::{
        MediaStreamTrack, OfferOptions, PeerConnectionFactory, RtcError,
        RtcEvent, RtcPeerConnection,
    },
    utils::EventEmitter,
};

/// Call made on a [`LoopbackPeerConnection`], recorded once it took effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerCall {
    AddTrack(MediaKind),
    CreateOffer(OfferOptions),
    CreateAnswer,
    SetLocalDescription(SdpType),
    SetRemoteDescription(SdpType),
    AddIceCandidate(String),
    RestartIce,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn new(sends: bool, receives: bool) -> Self {
        match (sends, receives) {
            (true, true) => Direction::SendRecv,
            (true, false) => Direction::SendOnly,
            (false, true) => Direction::RecvOnly,
            (false, false) => Direction::Inactive,
        }
    }

    fn parse(attr: &str) -> Option<Self> {
        match attr {
            "a=sendrecv" => Some(Direction::SendRecv),
            "a=sendonly" => Some(Direction::SendOnly),
            "a=recvonly" => Some(Direction::RecvOnly),
            "a=inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    fn as_attr(self) -> &'static str {
        match self {
            Direction::SendRecv => "a=sendrecv",
            Direction::SendOnly => "a=sendonly",
            Direction::RecvOnly => "a=recvonly",
            Direction::Inactive => "a=inactive",
        }
    }

    fn sends(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }

    fn receives(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::RecvOnly)
    }
}

/// Parses the `m=` sections of an SDP into their kind and direction.
fn media_sections(
    kind: SdpType,
    sdp: &str,
) -> Result<Vec<(MediaKind, Direction)>, RtcError> {
    if !sdp.starts_with("v=0") {
        return Err(RtcError::InvalidDescription {
            kind,
            reason: "missing `v=0` line".to_string(),
        });
    }
    let mut sections: Vec<(MediaKind, Direction)> = Vec::new();
    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            let media_kind = if media.starts_with("audio") {
                MediaKind::Audio
            } else if media.starts_with("video") {
                MediaKind::Video
            } else {
                return Err(RtcError::InvalidDescription {
                    kind,
                    reason: format!("unsupported media section `{}`", line),
                });
            };
            sections.push((media_kind, Direction::SendRecv));
        } else if let Some(direction) = Direction::parse(line) {
            if let Some(last) = sections.last_mut() {
                last.1 = direction;
            }
        }
    }
    Ok(sections)
}

/// In-process [`RtcPeerConnection`].
///
/// Enforces the offer/answer ordering rules of a real peer connection,
/// gathers a single host candidate per local description and reports a
/// remote track for every sending media section of a remote description.
/// Once both descriptions are set it goes `connecting`, and the first
/// applied remote candidate makes it `connected` (the ICE signal is
/// reported ahead of the aggregate one, like real transports do).
pub struct LoopbackPeerConnection {
    id: u32,
    config: ConnectivityConfig,
    tracks: RefCell<Vec<MediaStreamTrack>>,
    local_description: RefCell<Option<SessionDescription>>,
    remote_description: RefCell<Option<SessionDescription>>,
    signaling_state: Cell<SignalingState>,
    connection_state: Cell<ConnectionState>,
    ice_connection_state: Cell<IceConnectionState>,
    remote_kinds: RefCell<Vec<MediaKind>>,
    ice_generation: Cell<u32>,
    restart_pending: Cell<bool>,
    gathered: Cell<u32>,
    journal: RefCell<Vec<PeerCall>>,
    events: EventEmitter<RtcEvent>,
}

impl LoopbackPeerConnection {
    pub fn new(id: u32, config: ConnectivityConfig) -> Self {
        Self {
            id,
            config,
            tracks: RefCell::default(),
            local_description: RefCell::default(),
            remote_description: RefCell::default(),
            signaling_state: Cell::new(SignalingState::Stable),
            connection_state: Cell::new(ConnectionState::New),
            ice_connection_state: Cell::new(IceConnectionState::New),
            remote_kinds: RefCell::default(),
            ice_generation: Cell::new(0),
            restart_pending: Cell::new(false),
            gathered: Cell::new(0),
            journal: RefCell::default(),
            events: EventEmitter::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    /// Every call that took effect, in order.
    pub fn journal(&self) -> Vec<PeerCall> {
        self.journal.borrow().clone()
    }

    /// Candidate strings applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.journal
            .borrow()
            .iter()
            .filter_map(|call| match call {
                PeerCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn restart_count(&self) -> usize {
        self.journal
            .borrow()
            .iter()
            .filter(|call| **call == PeerCall::RestartIce)
            .count()
    }

    pub fn tracks(&self) -> Vec<MediaStreamTrack> {
        self.tracks.borrow().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.borrow().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state.get()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.ice_connection_state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.signaling_state.get() == SignalingState::Closed
    }

    /// Reports an aggregate state as if the network changed underneath.
    pub fn report_connection_state(&self, state: ConnectionState) {
        self.connection_state.set(state);
        self.events.emit(RtcEvent::ConnectionStateChange(state));
    }

    /// Reports an ICE state as if the network changed underneath.
    pub fn report_ice_connection_state(&self, state: IceConnectionState) {
        self.ice_connection_state.set(state);
        self.events.emit(RtcEvent::IceConnectionStateChange(state));
    }

    fn record(&self, call: PeerCall) {
        self.journal.borrow_mut().push(call);
    }

    fn ensure_open(&self) -> Result<(), RtcError> {
        if self.is_closed() {
            Err(RtcError::Closed)
        } else {
            Ok(())
        }
    }

    fn has_track(&self, kind: MediaKind) -> bool {
        self.tracks.borrow().iter().any(|t| t.kind() == kind)
    }

    fn render(
        &self,
        kind: SdpType,
        sections: &[(MediaKind, Direction)],
    ) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             a=ice-ufrag:lb{}g{}\r\n",
            self.id,
            self.journal.borrow().len(),
            self.id,
            self.ice_generation.get(),
        );
        for (mid, (media, direction)) in sections.iter().enumerate() {
            let payload = match media {
                MediaKind::Audio => 111,
                MediaKind::Video => 96,
            };
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF {}\r\na=mid:{}\r\n{}\r\n",
                media,
                payload,
                mid,
                direction.as_attr(),
            ));
        }
        if kind == SdpType::Answer {
            sdp.push_str("a=setup:active\r\n");
        } else {
            sdp.push_str("a=setup:actpass\r\n");
        }
        sdp
    }

    fn gather_candidate(&self) {
        let n = self.gathered.get() + 1;
        self.gathered.set(n);
        let port = 50_000 + self.id * 100 + n;
        self.events.emit(RtcEvent::IceCandidate(IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host generation {}",
            n,
            port,
            self.ice_generation.get(),
        ))));
    }

    fn maybe_start_checking(&self) {
        let negotiated = self.local_description.borrow().is_some()
            && self.remote_description.borrow().is_some();
        if negotiated && self.connection_state.get() == ConnectionState::New
        {
            self.report_ice_connection_state(IceConnectionState::Checking);
            self.report_connection_state(ConnectionState::Connecting);
            self.maybe_connect();
        }
    }

    fn maybe_connect(&self) {
        let has_remote_candidates = self
            .journal
            .borrow()
            .iter()
            .any(|call| matches!(call, PeerCall::AddIceCandidate(_)));
        if has_remote_candidates
            && self.ice_connection_state.get() == IceConnectionState::Checking
        {
            self.report_ice_connection_state(IceConnectionState::Connected);
            self.report_connection_state(ConnectionState::Connected);
        }
    }
}

#[async_trait(?Send)]
impl RtcPeerConnection for LoopbackPeerConnection {
    fn add_track(&self, track: &MediaStreamTrack) -> Result<(), RtcError> {
        self.ensure_open()?;
        self.tracks.borrow_mut().push(track.clone());
        self.record(PeerCall::AddTrack(track.kind()));
        Ok(())
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, RtcError> {
        yield_now().await;
        self.ensure_open()?;

        if options.ice_restart || self.restart_pending.replace(false) {
            self.ice_generation.set(self.ice_generation.get() + 1);
        }
        let mut sections = Vec::new();
        for (media, wants) in [
            (MediaKind::Audio, options.offer_to_receive_audio),
            (MediaKind::Video, options.offer_to_receive_video),
        ] {
            let sends = self.has_track(media);
            if sends || wants {
                sections.push((media, Direction::new(sends, wants)));
            }
        }
        self.record(PeerCall::CreateOffer(options));
        Ok(SessionDescription::offer(self.render(SdpType::Offer, &sections)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        yield_now().await;
        self.ensure_open()?;
        if self.signaling_state.get() != SignalingState::HaveRemoteOffer {
            return Err(RtcError::InvalidState(
                "cannot create answer without a remote offer".to_string(),
            ));
        }

        let remote = self
            .remote_description
            .borrow()
            .clone()
            .ok_or_else(|| {
                RtcError::InvalidState("no remote offer".to_string())
            })?;
        let sections = media_sections(remote.kind, &remote.sdp)?
            .into_iter()
            .map(|(media, remote_dir)| {
                let sends = self.has_track(media) && remote_dir.receives();
                (media, Direction::new(sends, remote_dir.sends()))
            })
            .collect::<Vec<_>>();
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer(
            self.render(SdpType::Answer, &sections),
        ))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        yield_now().await;
        self.ensure_open()?;

        let next = match (description.kind, self.signaling_state.get()) {
            (SdpType::Offer, SignalingState::Stable)
            | (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                SignalingState::Stable
            }
            (kind, state) => {
                return Err(RtcError::InvalidState(format!(
                    "cannot set local {} in {:?}",
                    kind, state,
                )));
            }
        };
        media_sections(description.kind, &description.sdp)?;

        let kind = description.kind;
        self.signaling_state.set(next);
        *self.local_description.borrow_mut() = Some(description);
        self.record(PeerCall::SetLocalDescription(kind));

        self.gather_candidate();
        self.maybe_start_checking();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        yield_now().await;
        self.ensure_open()?;

        let next = match (description.kind, self.signaling_state.get()) {
            (SdpType::Offer, SignalingState::Stable)
            | (SdpType::Offer, SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                SignalingState::Stable
            }
            (kind, state) => {
                return Err(RtcError::InvalidState(format!(
                    "cannot set remote {} in {:?}",
                    kind, state,
                )));
            }
        };
        let sections = media_sections(description.kind, &description.sdp)?;

        let kind = description.kind;
        self.signaling_state.set(next);
        *self.remote_description.borrow_mut() = Some(description);
        self.record(PeerCall::SetRemoteDescription(kind));

        for (media, direction) in sections {
            if !direction.sends() || self.remote_kinds.borrow().contains(&media)
            {
                continue;
            }
            self.remote_kinds.borrow_mut().push(media);
            let track = MediaStreamTrack::new(
                format!("remote-{}-{}", self.id, media),
                media,
            );
            self.events.emit(RtcEvent::Track(track));
        }

        self.maybe_start_checking();
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote_description.borrow().is_some()
    }

    async fn add_ice_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<(), RtcError> {
        yield_now().await;
        self.ensure_open()?;

        if !self.has_remote_description() {
            return Err(RtcError::InvalidState(
                "remote description is not set".to_string(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(RtcError::InvalidCandidate {
                candidate: candidate.candidate.clone(),
                reason: "malformed candidate line".to_string(),
            });
        }

        self.record(PeerCall::AddIceCandidate(candidate.candidate.clone()));
        self.maybe_connect();
        Ok(())
    }

    fn restart_ice(&self) {
        if self.is_closed() {
            return;
        }
        self.restart_pending.set(true);
        self.record(PeerCall::RestartIce);
    }

    fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.signaling_state.set(SignalingState::Closed);
        self.connection_state.set(ConnectionState::Closed);
        self.ice_connection_state.set(IceConnectionState::Closed);
        self.record(PeerCall::Close);
        self.events.close();
    }

    fn subscribe(&self) -> LocalBoxStream<'static, RtcEvent> {
        self.events.subscribe()
    }
}

/// [`PeerConnectionFactory`] creating [`LoopbackPeerConnection`]s and
/// keeping a handle to each of them for inspection.
#[derive(Default)]
pub struct LoopbackNetwork {
    connections: RefCell<Vec<Rc<LoopbackPeerConnection>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn connections(&self) -> Vec<Rc<LoopbackPeerConnection>> {
        self.connections.borrow().clone()
    }

    /// Most recently created connection.
    pub fn last(&self) -> Option<Rc<LoopbackPeerConnection>> {
        self.connections.borrow().last().cloned()
    }
}

impl PeerConnectionFactory for LoopbackNetwork {
    fn create(
        &self,
        config: &ConnectivityConfig,
    ) -> Result<Rc<dyn RtcPeerConnection>, RtcError> {
        if config.ice_servers.iter().any(|server| server.urls.is_empty()) {
            return Err(RtcError::Creation(
                "ICE server without urls".to_string(),
            ));
        }
        let id = self.connections.borrow().len() as u32 + 1;
        let conn = Rc::new(LoopbackPeerConnection::new(id, config.clone()));
        self.connections.borrow_mut().push(Rc::clone(&conn));
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use super::*;

    fn offer_options() -> OfferOptions {
        OfferOptions {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
            ice_restart: false,
        }
    }

    #[tokio::test]
    async fn offer_receives_video_without_local_video() {
        let pc = LoopbackPeerConnection::new(1, ConnectivityConfig::default());
        pc.add_track(&MediaStreamTrack::new("mic", MediaKind::Audio))
            .unwrap();

        let offer = pc.create_offer(offer_options()).await.unwrap();
        let sections = media_sections(offer.kind, &offer.sdp).unwrap();

        assert_eq!(
            sections,
            vec![
                (MediaKind::Audio, Direction::SendRecv),
                (MediaKind::Video, Direction::RecvOnly),
            ]
        );
    }

    #[tokio::test]
    async fn candidate_needs_remote_description() {
        let pc = LoopbackPeerConnection::new(1, ConnectivityConfig::default());

        let err = pc
            .add_ice_candidate(&IceCandidate::new("candidate:1"))
            .await
            .unwrap_err();

        assert!(matches!(err, RtcError::InvalidState(_)));
        assert!(pc.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn answer_needs_local_offer() {
        let pc = LoopbackPeerConnection::new(1, ConnectivityConfig::default());

        let err = pc
            .set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap_err();

        assert!(matches!(err, RtcError::InvalidState(_)));
    }

    #[tokio::test]
    async fn remote_offer_reports_sending_tracks() {
        let caller =
            LoopbackPeerConnection::new(1, ConnectivityConfig::default());
        let callee =
            LoopbackPeerConnection::new(2, ConnectivityConfig::default());
        caller
            .add_track(&MediaStreamTrack::new("mic", MediaKind::Audio))
            .unwrap();
        let mut events = callee.subscribe();

        let offer = caller.create_offer(offer_options()).await.unwrap();
        callee.set_remote_description(offer).await.unwrap();
        callee.close();

        let kinds = events
            .filter_map(|e| async move {
                match e {
                    RtcEvent::Track(track) => Some(track.kind()),
                    _ => None,
                }
            })
            .collect::<Vec<_>>()
            .await;
        assert_eq!(kinds, vec![MediaKind::Audio]);
    }

    #[tokio::test]
    async fn malformed_candidate_is_rejected() {
        let callee =
            LoopbackPeerConnection::new(2, ConnectivityConfig::default());
        callee
            .set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();

        let err = callee
            .add_ice_candidate(&IceCandidate::new("garbage"))
            .await
            .unwrap_err();

        assert!(matches!(err, RtcError::InvalidCandidate { .. }));
    }

    #[tokio::test]
    async fn restart_bumps_ice_credentials() {
        let pc = LoopbackPeerConnection::new(3, ConnectivityConfig::default());

        let first = pc.create_offer(offer_options()).await.unwrap();
        pc.restart_ice();
        let second = pc.create_offer(offer_options()).await.unwrap();

        assert!(first.sdp.contains("a=ice-ufrag:lb3g0"));
        assert!(second.sdp.contains("a=ice-ufrag:lb3g1"));
        assert_eq!(pc.restart_count(), 1);
    }

    #[test]
    fn network_keeps_created_connections() {
        let network = LoopbackNetwork::new();

        let config = ConnectivityConfig {
            ice_candidate_pool_size: 2,
            ..ConnectivityConfig::default()
        };

        network.create(&ConnectivityConfig::default()).unwrap();
        network.create(&config).unwrap();

        assert_eq!(network.connections().len(), 2);
        let last = network.last().unwrap();
        assert_eq!(last.id(), 2);
        assert_eq!(last.config(), &config);
    }
}
