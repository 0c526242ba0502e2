//! Acquisition and ownership of local and remote media.

mod tracks;

use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    proto::MediaKind,
    sys::{GetUserMediaError, MediaDevices, MediaStreamConstraints},
};

pub use self::tracks::{LocalMedia, RemoteMedia};

/// Reason local media could not be acquired.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("access to camera or microphone was denied")]
    PermissionDenied,

    #[error("no camera or microphone was found")]
    DeviceNotFound,

    #[error("camera or microphone is already in use")]
    DeviceBusy,

    #[error("could not access camera or microphone: {0}")]
    Unknown(String),
}

impl From<GetUserMediaError> for MediaError {
    fn from(err: GetUserMediaError) -> Self {
        match err.name.as_str() {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
                MediaError::PermissionDenied
            }
            "NotFoundError" | "DevicesNotFoundError"
            | "OverconstrainedError" => MediaError::DeviceNotFound,
            "NotReadableError" | "TrackStartError" | "AbortError" => {
                MediaError::DeviceBusy
            }
            _ => MediaError::Unknown(err.to_string()),
        }
    }
}

/// Requests local capture devices under the fixed call profile.
#[derive(Clone)]
pub struct MediaAcquirer {
    devices: Rc<dyn MediaDevices>,
}

impl MediaAcquirer {
    pub fn new(devices: Rc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    /// Acquires a microphone, and a camera if `want_video`.
    ///
    /// The returned [`LocalMedia`] holds the devices exclusively until it
    /// is stopped or dropped.
    pub async fn acquire(
        &self,
        want_video: bool,
    ) -> Result<LocalMedia, MediaError> {
        let constraints = MediaStreamConstraints::for_call(want_video);
        let tracks = self
            .devices
            .get_user_media(&constraints)
            .await
            .map_err(|err| {
                warn!(%err, want_video, "getUserMedia failed");
                MediaError::from(err)
            })?;

        let mut audio = None;
        let mut video = None;
        for track in tracks {
            let slot = match track.kind() {
                MediaKind::Audio => &mut audio,
                MediaKind::Video => &mut video,
            };
            let wanted = track.kind() == MediaKind::Audio || want_video;
            if slot.is_none() && wanted {
                *slot = Some(track);
            } else {
                track.stop();
            }
        }
        let media = LocalMedia::new(audio, video);

        if media.audio().is_none() {
            warn!("getUserMedia returned no audio track");
            return Err(MediaError::DeviceNotFound);
        }
        debug!(
            audio = ?media.audio().map(|t| t.id()),
            video = ?media.video().map(|t| t.id()),
            "Local media acquired",
        );
        Ok(media)
    }
}
