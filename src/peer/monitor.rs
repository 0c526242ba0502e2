use std::cell::Cell;

use tracing::debug;

use crate::proto::{ConnectionState, IceConnectionState};

/// What the session has to do after a state report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reaction {
    /// State to surface upward, if any.
    pub forward: Option<ConnectionState>,

    /// Whether a connectivity restart must be issued.
    pub restart_ice: bool,
}

/// Reconciles the aggregate connection signal with the ICE signal.
///
/// The aggregate state may lag behind ICE: once ICE reports `connected` or
/// `completed`, `connected` is surfaced straight away, and the aggregate
/// signal's own `connected` is not surfaced again when it catches up.
/// Every aggregate `failed` report asks for exactly one connectivity
/// restart.
#[derive(Debug)]
pub struct ConnectionMonitor {
    aggregate: Cell<ConnectionState>,
    ice: Cell<IceConnectionState>,
    forwarded: Cell<ConnectionState>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self {
            aggregate: Cell::new(ConnectionState::New),
            ice: Cell::new(IceConnectionState::New),
            forwarded: Cell::new(ConnectionState::New),
        }
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_connection_state(&self, state: ConnectionState) -> Reaction {
        self.aggregate.set(state);
        let already_connected = state == ConnectionState::Connected
            && self.forwarded.get() == ConnectionState::Connected;

        let forward = if already_connected {
            None
        } else {
            self.forwarded.set(state);
            Some(state)
        };
        Reaction {
            forward,
            restart_ice: state == ConnectionState::Failed,
        }
    }

    pub fn observe_ice_connection_state(
        &self,
        state: IceConnectionState,
    ) -> Reaction {
        self.ice.set(state);
        if state.is_established()
            && self.aggregate.get() != ConnectionState::Connected
            && self.forwarded.get() != ConnectionState::Connected
        {
            debug!(?state, "ICE is ahead of aggregate state, surfacing it");
            self.forwarded.set(ConnectionState::Connected);
            return Reaction {
                forward: Some(ConnectionState::Connected),
                restart_ice: false,
            };
        }
        Reaction::default()
    }

    /// Last aggregate state reported by the transport.
    pub fn aggregate_state(&self) -> ConnectionState {
        self.aggregate.get()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.ice.get()
    }

    /// Last state surfaced upward.
    pub fn forwarded_state(&self) -> ConnectionState {
        self.forwarded.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_connected_synthesizes_connected() {
        let monitor = ConnectionMonitor::new();
        monitor.observe_connection_state(ConnectionState::Connecting);

        let reaction =
            monitor.observe_ice_connection_state(IceConnectionState::Connected);

        assert_eq!(reaction.forward, Some(ConnectionState::Connected));
        assert_eq!(monitor.aggregate_state(), ConnectionState::Connecting);
        assert_eq!(monitor.forwarded_state(), ConnectionState::Connected);
    }

    #[test]
    fn ice_completed_also_counts() {
        let monitor = ConnectionMonitor::new();

        let reaction =
            monitor.observe_ice_connection_state(IceConnectionState::Completed);

        assert_eq!(reaction.forward, Some(ConnectionState::Connected));
        assert_eq!(
            monitor.ice_connection_state(),
            IceConnectionState::Completed
        );
    }

    #[test]
    fn aggregate_catching_up_is_not_repeated() {
        let monitor = ConnectionMonitor::new();
        monitor.observe_ice_connection_state(IceConnectionState::Connected);

        let reaction =
            monitor.observe_connection_state(ConnectionState::Connected);

        assert_eq!(reaction, Reaction::default());
        assert_eq!(monitor.aggregate_state(), ConnectionState::Connected);
    }

    #[test]
    fn ice_after_aggregate_connected_is_quiet() {
        let monitor = ConnectionMonitor::new();
        monitor.observe_connection_state(ConnectionState::Connected);

        let reaction =
            monitor.observe_ice_connection_state(IceConnectionState::Completed);

        assert_eq!(reaction, Reaction::default());
    }

    #[test]
    fn every_failure_report_restarts_once() {
        let monitor = ConnectionMonitor::new();

        let first = monitor.observe_connection_state(ConnectionState::Failed);
        let second = monitor.observe_connection_state(ConnectionState::Failed);

        assert!(first.restart_ice);
        assert!(second.restart_ice);
        assert_eq!(first.forward, Some(ConnectionState::Failed));
        assert_eq!(second.forward, Some(ConnectionState::Failed));
    }

    #[test]
    fn recovery_after_failure_is_forwarded() {
        let monitor = ConnectionMonitor::new();
        monitor.observe_connection_state(ConnectionState::Connected);
        monitor.observe_connection_state(ConnectionState::Failed);

        let reaction =
            monitor.observe_ice_connection_state(IceConnectionState::Connected);

        assert_eq!(reaction.forward, Some(ConnectionState::Connected));
    }
}
