//! Call negotiation engine for one-to-one audio/video calls.
//!
//! A [`ConnectionSession`] owns a single peer connection: it wires local
//! media into it, exchanges offer/answer descriptions, buffers ICE
//! candidates that arrive early, and keeps the surfaced connection state
//! consistent with what the transport reports. Platform capabilities (peer
//! connections and capture devices) are consumed through the traits in
//! [`sys`], and messages reach the remote peer through a
//! [`SignalingAdapter`].
//!
//! Everything is single-threaded and expects to run inside a
//! [`tokio::task::LocalSet`].

pub mod conf;
pub mod media;
pub mod peer;
pub mod proto;
pub mod signaling;
pub mod sys;
pub mod utils;

#[doc(inline)]
pub use self::{
    conf::ConnectivityConfig,
    media::{LocalMedia, MediaAcquirer, MediaError, RemoteMedia},
    peer::{ConnectionSession, NegotiationError, PeerEvent, SessionError},
    proto::{
        ConnectionState, IceCandidate, SessionDescription, SignalingMessage,
    },
    signaling::SignalingAdapter,
};
