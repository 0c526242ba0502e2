use crate::{proto::MediaKind, sys::MediaStreamTrack};

/// Local capture tracks owned by a single session.
///
/// Tracks are stopped (and their devices released) on [`LocalMedia::stop`]
/// or when the [`LocalMedia`] is dropped.
#[derive(Debug, Default)]
pub struct LocalMedia {
    audio: Option<MediaStreamTrack>,
    video: Option<MediaStreamTrack>,
}

impl LocalMedia {
    pub fn new(
        audio: Option<MediaStreamTrack>,
        video: Option<MediaStreamTrack>,
    ) -> Self {
        Self { audio, video }
    }

    pub fn audio(&self) -> Option<&MediaStreamTrack> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&MediaStreamTrack> {
        self.video.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaStreamTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    /// Toggles the track of the given `kind`. Returns `false` if there is
    /// no such track.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        let track = match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        };
        match track {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Stops every track. Stopping twice is a no-op.
    pub fn stop(&mut self) {
        for track in self.audio.take().into_iter().chain(self.video.take()) {
            track.stop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tracks received from the remote peer.
#[derive(Clone, Debug, Default)]
pub struct RemoteMedia {
    tracks: Vec<MediaStreamTrack>,
}

impl RemoteMedia {
    /// Returns a copy with `track` added.
    pub(crate) fn with_track(&self, track: MediaStreamTrack) -> Self {
        let mut tracks = self.tracks.clone();
        tracks.push(track);
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaStreamTrack] {
        &self.tracks
    }

    pub fn audio(&self) -> Option<&MediaStreamTrack> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video(&self) -> Option<&MediaStreamTrack> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Video)
    }
}
