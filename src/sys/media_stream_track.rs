use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use futures::stream::{LocalBoxStream, StreamExt as _};
use futures_signals::signal::{Mutable, SignalExt as _};

use crate::proto::MediaKind;

/// Lifecycle of a [`MediaStreamTrack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

struct InnerTrack {
    id: String,
    kind: MediaKind,
    enabled: Mutable<bool>,
    state: Cell<TrackState>,

    /// Releases the capture device backing this track.
    on_stop: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// Shared handle to a single audio or video track.
///
/// Clones refer to the same underlying track, so toggling
/// [`MediaStreamTrack::set_enabled`] on one clone is visible through the
/// transport that holds another.
#[derive(Clone)]
pub struct MediaStreamTrack(Rc<InnerTrack>);

impl MediaStreamTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self(Rc::new(InnerTrack {
            id: id.into(),
            kind,
            enabled: Mutable::new(true),
            state: Cell::new(TrackState::Live),
            on_stop: RefCell::new(None),
        }))
    }

    /// Creates a track that runs `on_stop` exactly once, when it is
    /// stopped for the first time.
    pub fn with_release<F>(
        id: impl Into<String>,
        kind: MediaKind,
        on_stop: F,
    ) -> Self
    where
        F: FnOnce() + 'static,
    {
        let track = Self::new(id, kind);
        *track.0.on_stop.borrow_mut() = Some(Box::new(on_stop));
        track
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn kind(&self) -> MediaKind {
        self.0.kind
    }

    pub fn enabled(&self) -> bool {
        self.0.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.enabled.set_neq(enabled);
    }

    /// Stream of enablement changes, starting with the current value.
    pub fn on_enabled_change(&self) -> LocalBoxStream<'static, bool> {
        self.0.enabled.signal().to_stream().boxed_local()
    }

    pub fn state(&self) -> TrackState {
        self.0.state.get()
    }

    /// Ends the track and releases its device. Stopping an ended track
    /// does nothing.
    pub fn stop(&self) {
        if self.0.state.replace(TrackState::Ended) == TrackState::Ended {
            return;
        }
        let on_stop = self.0.on_stop.borrow_mut().take();
        if let Some(on_stop) = on_stop {
            on_stop();
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for MediaStreamTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStreamTrack")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("enabled", &self.enabled())
            .field("state", &self.state())
            .finish()
    }
}
