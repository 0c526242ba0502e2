//! In-process implementations of the platform traits, used by the demo
//! binary and by tests.

mod media_devices;
mod peer_connection;

pub use self::{
    media_devices::LoopbackMediaDevices,
    peer_connection::{LoopbackNetwork, LoopbackPeerConnection, PeerCall},
};
