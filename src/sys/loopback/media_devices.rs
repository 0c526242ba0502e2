use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    rc::Rc,
};

use async_trait::async_trait;
use tokio::task::yield_now;

use crate::{
    proto::MediaKind,
    sys::{
        GetUserMediaError, MediaDevices, MediaStreamConstraints,
        MediaStreamTrack,
    },
};

/// In-process [`MediaDevices`] with one microphone and one camera.
///
/// Each device can be held by a single set of tracks at a time; requesting
/// a held device fails with `NotReadableError` until its track is stopped.
#[derive(Default)]
pub struct LoopbackMediaDevices {
    no_microphone: Cell<bool>,
    no_camera: Cell<bool>,
    failure: RefCell<Option<GetUserMediaError>>,
    in_use: Rc<RefCell<HashSet<MediaKind>>>,
    requests: RefCell<Vec<MediaStreamConstraints>>,
    next_id: Cell<u32>,
}

impl LoopbackMediaDevices {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Every following request fails with `NotAllowedError`.
    pub fn deny_permission(&self) {
        self.fail_with(GetUserMediaError::new(
            "NotAllowedError",
            "Permission denied",
        ));
    }

    /// Every following request fails with `error`.
    pub fn fail_with(&self, error: GetUserMediaError) {
        *self.failure.borrow_mut() = Some(error);
    }

    pub fn unplug(&self, kind: MediaKind) {
        match kind {
            MediaKind::Audio => self.no_microphone.set(true),
            MediaKind::Video => self.no_camera.set(true),
        }
    }

    pub fn is_in_use(&self, kind: MediaKind) -> bool {
        self.in_use.borrow().contains(&kind)
    }

    /// Constraints of every request made so far.
    pub fn requests(&self) -> Vec<MediaStreamConstraints> {
        self.requests.borrow().clone()
    }

    fn is_plugged(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => !self.no_microphone.get(),
            MediaKind::Video => !self.no_camera.get(),
        }
    }

    fn open_track(&self, kind: MediaKind) -> MediaStreamTrack {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        self.in_use.borrow_mut().insert(kind);

        let in_use = Rc::clone(&self.in_use);
        MediaStreamTrack::with_release(
            format!("local-{}-{}", kind, id),
            kind,
            move || {
                in_use.borrow_mut().remove(&kind);
            },
        )
    }
}

#[async_trait(?Send)]
impl MediaDevices for LoopbackMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaStreamConstraints,
    ) -> Result<Vec<MediaStreamTrack>, GetUserMediaError> {
        self.requests.borrow_mut().push(*constraints);
        yield_now().await;

        if let Some(err) = self.failure.borrow().clone() {
            return Err(err);
        }

        let mut kinds = Vec::new();
        if constraints.audio.is_some() {
            kinds.push(MediaKind::Audio);
        }
        if constraints.video.is_some() {
            kinds.push(MediaKind::Video);
        }

        for kind in &kinds {
            if !self.is_plugged(*kind) {
                return Err(GetUserMediaError::new(
                    "NotFoundError",
                    format!("Requested {} device not found", kind),
                ));
            }
            if self.is_in_use(*kind) {
                return Err(GetUserMediaError::new(
                    "NotReadableError",
                    format!("Could not start {} source", kind),
                ));
            }
        }

        Ok(kinds.into_iter().map(|kind| self.open_track(kind)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn device_is_exclusive_until_stopped() {
        let devices = LoopbackMediaDevices::new();
        let constraints = MediaStreamConstraints::for_call(false);

        let tracks = devices.get_user_media(&constraints).await.unwrap();
        let err = devices.get_user_media(&constraints).await.unwrap_err();
        assert_eq!(err.name, "NotReadableError");

        tracks.iter().for_each(MediaStreamTrack::stop);
        assert!(!devices.is_in_use(MediaKind::Audio));
        assert!(devices.get_user_media(&constraints).await.is_ok());
    }

    #[tokio::test]
    async fn missing_camera_fails_whole_request() {
        let devices = LoopbackMediaDevices::new();
        devices.unplug(MediaKind::Video);

        let err = devices
            .get_user_media(&MediaStreamConstraints::for_call(true))
            .await
            .unwrap_err();

        assert_eq!(err.name, "NotFoundError");
        assert!(!devices.is_in_use(MediaKind::Audio));
    }
}
