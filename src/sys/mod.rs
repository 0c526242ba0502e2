//! Platform layer: the peer connection and capture-device APIs the core is
//! written against.

pub mod loopback;
mod media_devices;
mod media_stream_track;
mod rtc_peer_connection;

pub use self::{
    media_devices::{
        AudioConstraints, ConstrainU32, FacingMode, GetUserMediaError,
        MediaDevices, MediaStreamConstraints, VideoConstraints,
    },
    media_stream_track::{MediaStreamTrack, TrackState},
    rtc_peer_connection::{
        OfferOptions, PeerConnectionFactory, RtcError, RtcEvent,
        RtcPeerConnection,
    },
};
