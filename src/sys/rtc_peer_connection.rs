use std::rc::Rc;

use async_trait::async_trait;
use futures::stream::LocalBoxStream;
use thiserror::Error;

use crate::{
    conf::ConnectivityConfig,
    proto::{
        ConnectionState, IceCandidate, IceConnectionState, SdpType,
        SessionDescription,
    },
    sys::MediaStreamTrack,
};

/// Failure reported by the underlying peer connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RtcError {
    /// Operation is not allowed in the current signaling state.
    #[error("invalid signaling state: {0}")]
    InvalidState(String),

    /// Description could not be parsed or applied.
    #[error("invalid {kind} description: {reason}")]
    InvalidDescription { kind: SdpType, reason: String },

    /// Candidate was rejected.
    #[error("invalid ICE candidate `{candidate}`: {reason}")]
    InvalidCandidate { candidate: String, reason: String },

    #[error("peer connection is closed")]
    Closed,

    #[error("peer connection could not be created: {0}")]
    Creation(String),
}

/// Options of [`RtcPeerConnection::create_offer`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub ice_restart: bool,
}

/// Event reported by the underlying peer connection.
#[derive(Clone, Debug)]
pub enum RtcEvent {
    /// Local ICE candidate was gathered.
    IceCandidate(IceCandidate),

    /// Remote track was received.
    Track(MediaStreamTrack),

    /// Aggregate connection state changed.
    ConnectionStateChange(ConnectionState),

    /// ICE connectivity state changed.
    IceConnectionStateChange(IceConnectionState),
}

/// Underlying peer connection.
///
/// All methods are called from a single thread, so implementations are
/// free to use `Rc` and `RefCell` internally.
#[async_trait(?Send)]
pub trait RtcPeerConnection {
    /// Registers a local track to be sent to the remote peer.
    fn add_track(&self, track: &MediaStreamTrack) -> Result<(), RtcError>;

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, RtcError>;

    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError>;

    fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<(), RtcError>;

    /// Re-runs candidate gathering on the live connection without
    /// renegotiating media.
    fn restart_ice(&self);

    fn close(&self);

    /// Returns a stream of all [`RtcEvent`]s reported after this call.
    ///
    /// The stream ends once the connection is closed.
    fn subscribe(&self) -> LocalBoxStream<'static, RtcEvent>;
}

/// Creates [`RtcPeerConnection`]s.
pub trait PeerConnectionFactory {
    fn create(
        &self,
        config: &ConnectivityConfig,
    ) -> Result<Rc<dyn RtcPeerConnection>, RtcError>;
}
