//! Transport for [`SignalingMessage`]s between the two peers of a call.

use std::cell::RefCell;

use futures::{
    channel::mpsc,
    stream::{self, LocalBoxStream, StreamExt as _},
};
use tracing::{trace, warn};

use crate::proto::SignalingMessage;

/// Carries [`SignalingMessage`]s to and from the remote peer.
///
/// Delivery order must be preserved per direction. Nothing beyond the
/// message kind and payload is interpreted by the session.
pub trait SignalingAdapter {
    fn send(&self, message: SignalingMessage);

    /// Inbound messages. Can be taken only once.
    fn messages(&self) -> LocalBoxStream<'static, SignalingMessage>;
}

/// In-process [`SignalingAdapter`] end, created in pairs by [`channel`].
///
/// Every message is serialized to JSON on [`SignalingAdapter::send`] and
/// parsed back on receipt, so both ends only share the wire format.
pub struct LocalSignaling {
    tx: mpsc::UnboundedSender<String>,
    rx: RefCell<Option<mpsc::UnboundedReceiver<String>>>,
}

/// Creates two connected [`LocalSignaling`] ends.
pub fn channel() -> (LocalSignaling, LocalSignaling) {
    let (left_tx, right_rx) = mpsc::unbounded();
    let (right_tx, left_rx) = mpsc::unbounded();
    (
        LocalSignaling {
            tx: left_tx,
            rx: RefCell::new(Some(left_rx)),
        },
        LocalSignaling {
            tx: right_tx,
            rx: RefCell::new(Some(right_rx)),
        },
    )
}

impl SignalingAdapter for LocalSignaling {
    fn send(&self, message: SignalingMessage) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, "Could not serialize signaling message");
                return;
            }
        };
        trace!(%json, "Signaling message sent");
        if self.tx.unbounded_send(json).is_err() {
            warn!("Signaling peer is gone, message dropped");
        }
    }

    fn messages(&self) -> LocalBoxStream<'static, SignalingMessage> {
        match self.rx.borrow_mut().take() {
            Some(rx) => rx
                .filter_map(|json| async move {
                    match SignalingMessage::from_json(&json) {
                        Ok(message) => Some(message),
                        Err(err) => {
                            warn!(%err, %json, "Malformed signaling message");
                            None
                        }
                    }
                })
                .boxed_local(),
            None => {
                warn!("Signaling messages were already taken");
                stream::empty().boxed_local()
            }
        }
    }
}
