use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use futures::{
    future::{FutureExt as _, LocalBoxFuture},
    stream::{LocalBoxStream, StreamExt as _},
};
use futures_signals::signal::{Mutable, Signal};
use medea_reactive::ObservableCell;
use tokio::task::{spawn_local, JoinHandle};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    conf::ConnectivityConfig,
    media::{LocalMedia, MediaAcquirer, RemoteMedia},
    peer::{
        CandidateBuffer, ConnectionMonitor, NegotiationError, PeerEvent,
        Reaction, SessionError,
    },
    proto::{
        ConnectionState, IceCandidate, MediaKind, SdpType, SessionDescription,
        SignalingMessage,
    },
    sys::{
        MediaStreamTrack, OfferOptions, PeerConnectionFactory, RtcError,
        RtcEvent, RtcPeerConnection,
    },
    utils::EventEmitter,
};

/// Clears the drain marker of `generation` even if the draining future is
/// dropped midway. A marker set for a newer transport is left alone.
struct DrainGuard<'a> {
    draining: &'a Cell<Option<u64>>,
    generation: u64,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.draining.get() == Some(self.generation) {
            self.draining.set(None);
        }
    }
}

struct InnerSession {
    config: ConnectivityConfig,

    /// Creates the underlying [`RtcPeerConnection`] on [`open`].
    ///
    /// [`open`]: ConnectionSession::open
    factory: Rc<dyn PeerConnectionFactory>,

    /// Underlying [`RtcPeerConnection`], if the session is open.
    peer: RefCell<Option<Rc<dyn RtcPeerConnection>>>,

    /// Task forwarding [`RtcEvent`]s of the current [`RtcPeerConnection`].
    event_task: RefCell<Option<JoinHandle<()>>>,

    local_media: RefCell<Option<LocalMedia>>,
    remote_media: Mutable<Option<RemoteMedia>>,
    local_description: RefCell<Option<SessionDescription>>,
    remote_description: RefCell<Option<SessionDescription>>,

    /// Candidates received before the remote description was set.
    candidates: RefCell<CandidateBuffer>,

    /// Generation of the transport whose buffered candidates are being
    /// applied right now.
    draining: Cell<Option<u64>>,

    /// Bumped every time a new transport is created.
    generation: Cell<u64>,

    state: ObservableCell<ConnectionState>,
    events: EventEmitter<PeerEvent>,

    /// Bumped on every [`ConnectionSession::close`].
    epoch: Cell<u64>,
}

impl InnerSession {
    fn current_peer(&self) -> Result<Rc<dyn RtcPeerConnection>, SessionError> {
        self.peer
            .borrow()
            .clone()
            .ok_or(SessionError::Negotiation(NegotiationError::NoSession))
    }

    fn is_current(&self, peer: &Rc<dyn RtcPeerConnection>) -> bool {
        matches!(&*self.peer.borrow(), Some(cur) if Rc::ptr_eq(cur, peer))
    }

    /// Fails if `peer` was closed or replaced while an operation was
    /// suspended.
    fn ensure_current(
        &self,
        peer: &Rc<dyn RtcPeerConnection>,
    ) -> Result<(), SessionError> {
        if self.is_current(peer) {
            Ok(())
        } else {
            debug!("Discarding result of an operation on a closed session");
            Err(SessionError::Closed)
        }
    }

    /// Maps the outcome of a transport call, discarding it if `peer` is no
    /// longer current.
    fn settle<T>(
        &self,
        peer: &Rc<dyn RtcPeerConnection>,
        res: Result<T, RtcError>,
    ) -> Result<T, SessionError> {
        self.ensure_current(peer)?;
        Ok(res?)
    }

    /// Whether a drain for the current transport is in progress.
    fn is_draining(&self) -> bool {
        self.draining.get() == Some(self.generation.get())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.set(state);
        self.events.emit(PeerEvent::ConnectionStateChanged(state));
    }

    /// Sets the remote description, then applies every buffered candidate.
    async fn apply_remote_description(
        &self,
        peer: &Rc<dyn RtcPeerConnection>,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        let res = peer.set_remote_description(description.clone()).await;
        self.settle(peer, res)?;
        debug!(kind = %description.kind, "Remote description set");
        *self.remote_description.borrow_mut() = Some(description);

        self.drain_candidates(peer).await;
        self.ensure_current(peer)
    }

    /// Applies buffered candidates in arrival order. Candidates arriving
    /// meanwhile are queued behind them and applied by the same loop.
    ///
    /// `peer` must be current when called. The loop stops taking candidates
    /// as soon as `peer` is closed or replaced.
    async fn drain_candidates(&self, peer: &Rc<dyn RtcPeerConnection>) {
        if self.is_draining() {
            return;
        }
        let generation = self.generation.get();
        self.draining.set(Some(generation));
        let _guard = DrainGuard {
            draining: &self.draining,
            generation,
        };

        loop {
            if !self.is_current(peer) {
                return;
            }
            let has_remote = self.remote_description.borrow().is_some();
            let batch = self.candidates.borrow_mut().drain_if_ready(has_remote);
            let batch = match batch {
                Some(batch) if !batch.is_empty() => batch,
                _ => break,
            };
            debug!(count = batch.len(), "Applying buffered ICE candidates");
            for candidate in batch {
                if !self.is_current(peer) {
                    return;
                }
                Self::apply_candidate(peer, &candidate).await;
            }
        }
    }

    async fn apply_candidate(
        peer: &Rc<dyn RtcPeerConnection>,
        candidate: &IceCandidate,
    ) {
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => {
                trace!(candidate = %candidate.candidate, "Candidate applied")
            }
            Err(err) => warn!(
                %err,
                candidate = %candidate.candidate,
                "Failed to apply ICE candidate",
            ),
        }
    }

    /// Handles an [`RtcEvent`] of the current [`RtcPeerConnection`].
    fn on_rtc_event(
        &self,
        peer: &Rc<dyn RtcPeerConnection>,
        monitor: &ConnectionMonitor,
        event: RtcEvent,
    ) {
        match event {
            RtcEvent::IceCandidate(candidate) => {
                trace!(candidate = %candidate.candidate, "Candidate found");
                self.events.emit(PeerEvent::IceCandidateDiscovered(candidate));
            }
            RtcEvent::Track(track) => {
                debug!(kind = %track.kind(), id = track.id(), "Remote track");
                let media = self
                    .remote_media
                    .get_cloned()
                    .unwrap_or_default()
                    .with_track(track);
                self.remote_media.set(Some(media.clone()));
                self.events.emit(PeerEvent::RemoteMediaAvailable(media));
            }
            RtcEvent::ConnectionStateChange(state) => {
                debug!(?state, "Connection state changed");
                let reaction = monitor.observe_connection_state(state);
                self.react(peer, reaction);
            }
            RtcEvent::IceConnectionStateChange(state) => {
                debug!(?state, "ICE connection state changed");
                let reaction = monitor.observe_ice_connection_state(state);
                self.react(peer, reaction);
            }
        }
    }

    fn react(&self, peer: &Rc<dyn RtcPeerConnection>, reaction: Reaction) {
        if reaction.restart_ice {
            info!("Connection failed, restarting ICE");
            peer.restart_ice();
        }
        if let Some(state) = reaction.forward {
            self.set_state(state);
        }
    }

    /// Drops the underlying [`RtcPeerConnection`] and everything bound to
    /// it. Buffered candidates and local media are left untouched.
    fn release_transport(&self) {
        let task = self.event_task.borrow_mut().take();
        if let Some(task) = task {
            task.abort();
        }
        let peer = self.peer.borrow_mut().take();
        if let Some(peer) = peer {
            peer.close();
        }
        self.local_description.borrow_mut().take();
        self.remote_description.borrow_mut().take();
        self.remote_media.set(None);
    }
}

impl Drop for InnerSession {
    fn drop(&mut self) {
        self.release_transport();
    }
}

/// Single call's peer connection: media wiring, offer/answer exchange,
/// candidate buffering and connection health.
///
/// Cloning yields another handle to the same session. Everything runs on a
/// single thread: [`ConnectionSession::open`] spawns a local task, so it
/// must be called within a [`tokio::task::LocalSet`].
#[derive(Clone)]
pub struct ConnectionSession(Rc<InnerSession>);

impl ConnectionSession {
    pub fn new(
        factory: Rc<dyn PeerConnectionFactory>,
        config: ConnectivityConfig,
    ) -> Self {
        Self(Rc::new(InnerSession {
            config,
            factory,
            peer: RefCell::new(None),
            event_task: RefCell::new(None),
            local_media: RefCell::new(None),
            remote_media: Mutable::new(None),
            local_description: RefCell::new(None),
            remote_description: RefCell::new(None),
            candidates: RefCell::new(CandidateBuffer::new()),
            draining: Cell::new(None),
            generation: Cell::new(0),
            state: ObservableCell::new(ConnectionState::New),
            events: EventEmitter::new(),
            epoch: Cell::new(0),
        }))
    }

    /// Acquires local media and opens the session with it.
    ///
    /// Nothing is opened if acquisition fails. If the session is closed
    /// while acquisition is in flight, the acquired media is released and
    /// [`SessionError::Closed`] is returned.
    pub async fn start(
        &self,
        acquirer: &MediaAcquirer,
        want_video: bool,
    ) -> Result<(), SessionError> {
        let epoch = self.0.epoch.get();
        let media = acquirer.acquire(want_video).await?;
        if self.0.epoch.get() != epoch {
            debug!("Session closed during media acquisition");
            return Err(SessionError::Closed);
        }
        self.open(media)
    }

    /// Creates the underlying [`RtcPeerConnection`] and registers
    /// `local_media` tracks with it.
    ///
    /// Does nothing if the session is already open and not closed, so a
    /// duplicate request cannot discard an in-flight negotiation; the
    /// redundant `local_media` is released in that case. A transport that
    /// reported itself closed is released before a new one is created.
    pub fn open(&self, local_media: LocalMedia) -> Result<(), SessionError> {
        if self.is_open() {
            debug!("Session is already open, keeping it");
            return Ok(());
        }
        if self.0.peer.borrow().is_some() {
            debug!("Releasing closed peer connection");
            self.0.release_transport();
        }

        let peer = self.0.factory.create(&self.0.config)?;
        for track in local_media.tracks() {
            peer.add_track(track)?;
        }

        let old_media = self.0.local_media.borrow_mut().replace(local_media);
        drop(old_media);
        *self.0.peer.borrow_mut() = Some(Rc::clone(&peer));
        self.0.generation.set(self.0.generation.get() + 1);
        self.0.set_state(ConnectionState::New);
        self.spawn_event_handler(peer);
        info!("Session opened");
        Ok(())
    }

    /// Spawns the task forwarding `peer` events to the session until the
    /// session is dropped or `peer` is replaced.
    fn spawn_event_handler(&self, peer: Rc<dyn RtcPeerConnection>) {
        let mut events = peer.subscribe();
        let weak: Weak<InnerSession> = Rc::downgrade(&self.0);
        let task = spawn_local(async move {
            let monitor = ConnectionMonitor::new();
            while let Some(event) = events.next().await {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                if !inner.is_current(&peer) {
                    break;
                }
                inner.on_rtc_event(&peer, &monitor, event);
            }
        });
        *self.0.event_task.borrow_mut() = Some(task);
    }

    /// Creates and sets a local offer, asking to receive both audio and
    /// video whatever is sent locally.
    #[instrument(level = "debug", skip_all)]
    pub async fn create_offer(
        &self,
    ) -> Result<SessionDescription, SessionError> {
        let peer = self.0.current_peer()?;
        let res = peer
            .create_offer(OfferOptions {
                offer_to_receive_audio: true,
                offer_to_receive_video: true,
                ice_restart: false,
            })
            .await;
        let offer = self.0.settle(&peer, res)?;

        let res = peer.set_local_description(offer.clone()).await;
        self.0.settle(&peer, res)?;
        *self.0.local_description.borrow_mut() = Some(offer.clone());
        debug!("Local offer set");
        Ok(offer)
    }

    /// Applies `remote_offer`, flushes buffered candidates, then creates
    /// and sets a local answer.
    #[instrument(level = "debug", skip_all)]
    pub async fn create_answer(
        &self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        if remote_offer.kind != SdpType::Offer {
            return Err(NegotiationError::UnexpectedDescription {
                expected: SdpType::Offer,
                got: remote_offer.kind,
            }
            .into());
        }
        let peer = self.0.current_peer()?;
        self.0.apply_remote_description(&peer, remote_offer).await?;

        let res = peer.create_answer().await;
        let answer = self.0.settle(&peer, res)?;
        let res = peer.set_local_description(answer.clone()).await;
        self.0.settle(&peer, res)?;
        *self.0.local_description.borrow_mut() = Some(answer.clone());
        debug!("Local answer set");
        Ok(answer)
    }

    /// Applies the answer to our offer and flushes buffered candidates.
    #[instrument(level = "debug", skip_all)]
    pub async fn set_remote_answer(
        &self,
        remote_answer: SessionDescription,
    ) -> Result<(), SessionError> {
        if remote_answer.kind != SdpType::Answer {
            return Err(NegotiationError::UnexpectedDescription {
                expected: SdpType::Answer,
                got: remote_answer.kind,
            }
            .into());
        }
        let peer = self.0.current_peer()?;
        let has_local_offer = matches!(
            &*self.0.local_description.borrow(),
            Some(desc) if desc.kind == SdpType::Offer
        );
        if !has_local_offer {
            return Err(NegotiationError::NoLocalOffer.into());
        }
        self.0.apply_remote_description(&peer, remote_answer).await
    }

    /// Applies a remote candidate, or buffers it until the remote
    /// description is set. Rejected candidates are logged and ignored.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        let peer = self.0.peer.borrow().clone();
        let peer = match peer {
            Some(peer)
                if peer.has_remote_description()
                    && self.0.remote_description.borrow().is_some()
                    && !self.0.is_draining() =>
            {
                peer
            }
            _ => {
                trace!(candidate = %candidate.candidate, "Candidate buffered");
                self.0.candidates.borrow_mut().enqueue(candidate);
                return;
            }
        };
        InnerSession::apply_candidate(&peer, &candidate).await;
    }

    /// Routes an inbound signaling message, returning the reply to send
    /// back, if any.
    pub async fn handle_signaling(
        &self,
        message: SignalingMessage,
    ) -> Result<Option<SignalingMessage>, SessionError> {
        match message {
            SignalingMessage::Offer(offer) => self
                .create_answer(offer)
                .await
                .map(|answer| Some(SignalingMessage::Answer(answer))),
            SignalingMessage::Answer(answer) => {
                self.set_remote_answer(answer).await.map(|()| None)
            }
            SignalingMessage::Candidate(candidate) => {
                self.add_ice_candidate(candidate).await;
                Ok(None)
            }
        }
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.set_enabled(MediaKind::Audio, enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.set_enabled(MediaKind::Video, enabled);
    }

    fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        if let Some(media) = self.0.local_media.borrow().as_ref() {
            if media.set_enabled(kind, enabled) {
                debug!(%kind, enabled, "Local track toggled");
            }
        }
    }

    /// Tears the session down: drops buffered candidates, stops local
    /// tracks, closes the transport and forgets remote media.
    ///
    /// Safe to call at any time and any number of times. Operations still
    /// in flight fail with [`SessionError::Closed`].
    pub fn close(&self) {
        self.0.epoch.set(self.0.epoch.get() + 1);
        self.0.candidates.borrow_mut().clear();
        let media = self.0.local_media.borrow_mut().take();
        if let Some(mut media) = media {
            media.stop();
        }
        self.0.release_transport();

        if self.0.state.get() != ConnectionState::Closed {
            info!("Session closed");
            self.0.set_state(ConnectionState::Closed);
        }
    }

    /// Whether a transport exists and has not closed.
    pub fn is_open(&self) -> bool {
        self.0.peer.borrow().is_some()
            && self.0.state.get() != ConnectionState::Closed
    }

    /// Returns a stream of all [`PeerEvent`]s emitted after this call.
    pub fn subscribe(&self) -> LocalBoxStream<'static, PeerEvent> {
        self.0.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.0.state.get()
    }

    /// Stream of state updates, starting with the current one.
    pub fn on_state_change(&self) -> LocalBoxStream<'static, ConnectionState> {
        self.0.state.subscribe()
    }

    /// Resolves to `true` once the session reaches `state`, or to `false`
    /// if the session is dropped first.
    pub fn when_state(
        &self,
        state: ConnectionState,
    ) -> LocalBoxFuture<'static, bool> {
        self.0.state.when_eq(state).map(|res| res.is_ok()).boxed_local()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.0.local_description.borrow().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.0.remote_description.borrow().clone()
    }

    /// Handles of the local tracks, if any.
    pub fn local_tracks(&self) -> Vec<MediaStreamTrack> {
        self.0
            .local_media
            .borrow()
            .as_ref()
            .map(|media| media.tracks().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remote_media(&self) -> Option<RemoteMedia> {
        self.0.remote_media.get_cloned()
    }

    pub fn remote_media_signal(
        &self,
    ) -> impl Signal<Item = Option<RemoteMedia>> {
        self.0.remote_media.signal_cloned()
    }

    /// Number of candidates waiting for the remote description.
    pub fn pending_candidates(&self) -> usize {
        self.0.candidates.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use futures::{future, FutureExt as _, StreamExt as _};
    use tokio::task::LocalSet;

    use super::*;
    use crate::sys::{
        loopback::{LoopbackNetwork, PeerCall},
        TrackState,
    };

    fn session() -> (ConnectionSession, Rc<LoopbackNetwork>) {
        let network = LoopbackNetwork::new();
        let config = ConnectivityConfig::default();
        let session = ConnectionSession::new(network.clone(), config);
        (session, network)
    }

    fn surfaced_states(
        events: &mut LocalBoxStream<'static, PeerEvent>,
    ) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Some(Some(event)) = events.next().now_or_never() {
            if let PeerEvent::ConnectionStateChanged(state) = event {
                states.push(state);
            }
        }
        states
    }

    fn microphone() -> LocalMedia {
        let mic = MediaStreamTrack::new("mic", MediaKind::Audio);
        LocalMedia::new(Some(mic), None)
    }

    #[tokio::test]
    async fn offer_requires_open_session() {
        let (session, _) = session();

        assert_eq!(
            session.create_offer().await.unwrap_err(),
            SessionError::Negotiation(NegotiationError::NoSession)
        );
    }

    #[tokio::test]
    async fn answer_requires_local_offer() {
        LocalSet::new()
            .run_until(async {
                let (session, _) = session();
                session.open(microphone()).unwrap();

                let err = session
                    .set_remote_answer(SessionDescription::answer("v=0\r\n"))
                    .await
                    .unwrap_err();

                assert_eq!(
                    err,
                    SessionError::Negotiation(NegotiationError::NoLocalOffer)
                );
            })
            .await;
    }

    #[tokio::test]
    async fn rejects_description_of_wrong_kind() {
        let (session, _) = session();

        let err = session
            .create_answer(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SessionError::Negotiation(NegotiationError::UnexpectedDescription {
                expected: SdpType::Offer,
                got: SdpType::Answer,
            })
        );
    }

    #[tokio::test]
    async fn buffers_candidates_before_open() {
        let (session, _) = session();

        session.add_ice_candidate(IceCandidate::new("candidate:1")).await;
        session.add_ice_candidate(IceCandidate::new("candidate:2")).await;

        assert_eq!(session.pending_candidates(), 2);
    }

    #[tokio::test]
    async fn second_open_keeps_negotiation() {
        LocalSet::new()
            .run_until(async {
                let (session, network) = session();
                session.open(microphone()).unwrap();
                let offer = session.create_offer().await.unwrap();

                let redundant = microphone();
                let redundant_track = redundant.audio().cloned().unwrap();
                session.open(redundant).unwrap();

                assert_eq!(network.connections().len(), 1);
                assert_eq!(session.local_description(), Some(offer));
                assert_eq!(redundant_track.state(), TrackState::Ended);
                assert_eq!(session.local_tracks()[0].id(), "mic");
            })
            .await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        LocalSet::new()
            .run_until(async {
                let (session, network) = session();
                let mut events = session.subscribe();
                session.open(microphone()).unwrap();
                let track = session.local_tracks()[0].clone();
                let candidate = IceCandidate::new("candidate:1");
                session.add_ice_candidate(candidate).await;

                session.close();
                session.close();

                let conn = network.last().unwrap();
                let closes = conn
                    .journal()
                    .into_iter()
                    .filter(|call| *call == PeerCall::Close)
                    .count();
                assert_eq!(closes, 1);
                assert_eq!(track.state(), TrackState::Ended);
                assert_eq!(session.pending_candidates(), 0);
                assert_eq!(session.state(), ConnectionState::Closed);
                assert!(!session.is_open());

                assert_eq!(
                    surfaced_states(&mut events),
                    vec![ConnectionState::New, ConnectionState::Closed],
                );
            })
            .await;
    }

    #[tokio::test]
    async fn reopen_after_close_surfaces_new() {
        LocalSet::new()
            .run_until(async {
                let (session, network) = session();
                session.open(microphone()).unwrap();
                session.close();
                let mut events = session.subscribe();

                session.open(microphone()).unwrap();

                assert_eq!(network.connections().len(), 2);
                assert_eq!(session.state(), ConnectionState::New);
                assert_eq!(
                    surfaced_states(&mut events),
                    vec![ConnectionState::New],
                );
            })
            .await;
    }

    #[tokio::test]
    async fn registers_local_tracks_with_transport() {
        LocalSet::new()
            .run_until(async {
                let (session, network) = session();

                session.open(microphone()).unwrap();

                let registered = network.last().unwrap().tracks();
                assert_eq!(registered.len(), 1);
                assert!(registered[0].ptr_eq(&session.local_tracks()[0]));
            })
            .await;
    }

    #[tokio::test]
    async fn close_discards_in_flight_offer() {
        LocalSet::new()
            .run_until(async {
                let (session, _) = session();
                session.open(microphone()).unwrap();

                let (res, ()) = future::join(session.create_offer(), async {
                    session.close()
                })
                .await;

                assert_eq!(res.unwrap_err(), SessionError::Closed);
                assert_eq!(session.local_description(), None);
            })
            .await;
    }

    #[tokio::test]
    async fn toggles_local_tracks() {
        LocalSet::new()
            .run_until(async {
                let (session, _) = session();
                session.open(microphone()).unwrap();

                session.set_audio_enabled(false);
                session.set_video_enabled(false);

                assert!(!session.local_tracks()[0].enabled());
            })
            .await;
    }

    #[test]
    fn toggling_without_media_is_noop() {
        let (session, _) = session();

        session.set_audio_enabled(false);

        assert!(session.local_tracks().is_empty());
    }
}
