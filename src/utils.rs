//! Miscellaneous helpers shared across components.

use std::cell::RefCell;

use futures::{
    channel::mpsc,
    stream::{LocalBoxStream, StreamExt as _},
};

/// Fan-out of events to any number of independent subscribers.
///
/// Every subscriber receives every event emitted after it subscribed, in
/// emission order. Subscribers whose stream was dropped are pruned on the
/// next [`EventEmitter::emit`].
#[derive(Debug)]
pub struct EventEmitter<E> {
    subs: RefCell<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self {
            subs: RefCell::new(Vec::new()),
        }
    }
}

impl<E: Clone + 'static> EventEmitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a [`LocalBoxStream`] of all subsequently emitted events.
    pub fn subscribe(&self) -> LocalBoxStream<'static, E> {
        let (tx, rx) = mpsc::unbounded();
        self.subs.borrow_mut().push(tx);
        rx.boxed_local()
    }

    pub fn emit(&self, event: E) {
        self.subs
            .borrow_mut()
            .retain(|sub| sub.unbounded_send(event.clone()).is_ok());
    }

    /// Ends every subscriber's stream.
    pub fn close(&self) {
        self.subs.borrow_mut().clear();
    }

    pub fn subscribers_count(&self) -> usize {
        self.subs.borrow().len()
    }
}
