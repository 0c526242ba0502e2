//! Peer connection negotiation: [`ConnectionSession`] and its helpers.

mod candidate_buffer;
mod monitor;
mod session;

use thiserror::Error;

use crate::{
    media::{MediaError, RemoteMedia},
    proto::{ConnectionState, IceCandidate, SdpType},
    sys::RtcError,
};

#[doc(inline)]
pub use self::{
    candidate_buffer::CandidateBuffer,
    monitor::{ConnectionMonitor, Reaction},
    session::ConnectionSession,
};

/// Events emitted from [`ConnectionSession`].
#[derive(Clone, Debug)]
pub enum PeerEvent {
    /// Local ICE candidate was discovered and should be sent to the remote
    /// peer.
    IceCandidateDiscovered(IceCandidate),

    /// Remote peer's tracks changed.
    RemoteMediaAvailable(RemoteMedia),

    /// Connection state changed.
    ConnectionStateChanged(ConnectionState),
}

/// Offer/answer operation was called out of order.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("no session is open")]
    NoSession,

    #[error("remote answer received before a local offer was set")]
    NoLocalOffer,

    #[error("expected {expected} description, got {got}")]
    UnexpectedDescription { expected: SdpType, got: SdpType },
}

/// Failure of a [`ConnectionSession`] operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("peer connection failed: {0}")]
    Transport(#[from] RtcError),

    /// Session was closed while the operation was in flight.
    #[error("session was closed")]
    Closed,
}
