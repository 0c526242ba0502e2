use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sys::MediaStreamTrack;

/// Failure reported by the capture-device API.
///
/// `name` carries the device API's error name (`NotAllowedError`,
/// `NotReadableError` and so on), `message` its human-readable details.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct GetUserMediaError {
    pub name: String,
    pub message: String,
}

impl GetUserMediaError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Numeric constraint with a preferred value and an upper cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstrainU32 {
    pub ideal: u32,
    pub max: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 48_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: ConstrainU32,
    pub height: ConstrainU32,
    pub frame_rate: ConstrainU32,
    pub facing_mode: FacingMode,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: ConstrainU32 {
                ideal: 1280,
                max: 1920,
            },
            height: ConstrainU32 {
                ideal: 720,
                max: 1080,
            },
            frame_rate: ConstrainU32 { ideal: 30, max: 60 },
            facing_mode: FacingMode::User,
        }
    }
}

/// Request passed to [`MediaDevices::get_user_media`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStreamConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaStreamConstraints {
    /// Fixed call profile: processed 48kHz audio, plus a user-facing HD
    /// camera if `want_video`.
    pub fn for_call(want_video: bool) -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: if want_video {
                Some(VideoConstraints::default())
            } else {
                None
            },
        }
    }
}

/// Capture-device API.
#[async_trait(?Send)]
pub trait MediaDevices {
    /// Acquires tracks satisfying `constraints`. The devices stay
    /// exclusively held until every returned track is stopped.
    async fn get_user_media(
        &self,
        constraints: &MediaStreamConstraints,
    ) -> Result<Vec<MediaStreamTrack>, GetUserMediaError>;
}
