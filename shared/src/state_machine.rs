//! Live Connection State Machine
//!
//! Defines valid status transitions for the live feed and the snapshot that
//! subscribers observe.

use crate::{live, ConnectionState, ConnectionStatus, Transport};

/// Connection status with the payload that is meaningful in each state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// A transport is being opened
    Connecting { transport: Transport },
    /// The transport delivered at least one sample
    Connected { transport: Transport },
    /// The transport failed; a countdown is present when a retry is scheduled
    Disconnected {
        transport: Transport,
        retry_in_seconds: Option<u64>,
    },
    /// The device reported itself offline; recovery waits for connectivity
    Offline { transport: Transport },
}

impl LinkState {
    /// Flat status of this state
    pub fn status(&self) -> ConnectionStatus {
        match self {
            LinkState::Connecting { .. } => ConnectionStatus::Connecting,
            LinkState::Connected { .. } => ConnectionStatus::Connected,
            LinkState::Disconnected { .. } => ConnectionStatus::Disconnected,
            LinkState::Offline { .. } => ConnectionStatus::Offline,
        }
    }

    /// Transport that is, or last was, active
    pub fn transport(&self) -> Transport {
        match self {
            LinkState::Connecting { transport }
            | LinkState::Connected { transport }
            | LinkState::Disconnected { transport, .. }
            | LinkState::Offline { transport } => *transport,
        }
    }

    /// Scheduled retry countdown, if any
    pub fn retry_in_seconds(&self) -> Option<u64> {
        match self {
            LinkState::Disconnected {
                retry_in_seconds, ..
            } => *retry_in_seconds,
            _ => None,
        }
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A new connection attempt started on the given transport
    AttemptStarted(Transport),
    /// A sample (push message or pull response) arrived
    SampleReceived,
    /// The transport failed with a recoverable error
    TransportFailed {
        error: String,
        retry_in_seconds: Option<u64>,
    },
    /// The pull endpoint reported the resource as missing
    NotFound,
    /// Connectivity signal reported offline
    WentOffline,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and the snapshot changed
    Changed(ConnectionState),
    /// Transition was valid but the snapshot is identical
    Unchanged,
    /// Transition was invalid from current state
    Invalid {
        from: ConnectionStatus,
        event: LinkEvent,
    },
}

/// The state machine for the live connection
#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    state: LinkState,
    last_error: Option<String>,
}

impl LinkStateMachine {
    /// Create a new state machine in Connecting state
    pub fn new(transport: Transport) -> Self {
        Self {
            state: LinkState::Connecting { transport },
            last_error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Last recorded error message
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Flat snapshot handed to subscribers
    pub fn snapshot(&self) -> ConnectionState {
        ConnectionState {
            status: self.state.status(),
            transport: self.state.transport(),
            retry_in_seconds: self.state.retry_in_seconds(),
            last_error: self.last_error.clone(),
        }
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        let Some((state, last_error)) = self.get_next_state(&event) else {
            return TransitionResult::Invalid {
                from: self.state.status(),
                event,
            };
        };

        let before = self.snapshot();
        self.state = state;
        self.last_error = last_error;
        let after = self.snapshot();

        if before == after {
            TransitionResult::Unchanged
        } else {
            TransitionResult::Changed(after)
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: &LinkEvent) -> Option<(LinkState, Option<String>)> {
        use LinkState::*;

        let transport = self.state.transport();

        match (&self.state, event) {
            // A reconnect cycle may start from anywhere
            (_, LinkEvent::AttemptStarted(next)) => {
                Some((Connecting { transport: *next }, self.last_error.clone()))
            }

            // Offline pre-empts every state
            (_, LinkEvent::WentOffline) => Some((Offline { transport }, self.last_error.clone())),

            (Connecting { .. } | Connected { .. }, LinkEvent::SampleReceived) => {
                Some((Connected { transport }, None))
            }

            (
                Connecting { .. } | Connected { .. },
                LinkEvent::TransportFailed {
                    error,
                    retry_in_seconds,
                },
            ) => Some((
                Disconnected {
                    transport,
                    retry_in_seconds: *retry_in_seconds,
                },
                Some(error.clone()),
            )),

            (Connecting { .. } | Connected { .. }, LinkEvent::NotFound) => Some((
                Disconnected {
                    transport,
                    retry_in_seconds: None,
                },
                Some(live::NOT_FOUND_ERROR.to_string()),
            )),

            // Invalid transition
            _ => None,
        }
    }
}

/// Check if a status change is generally valid
pub fn is_valid_transition(from: ConnectionStatus, to: ConnectionStatus) -> bool {
    use ConnectionStatus::*;

    match (from, to) {
        // Same state is always valid (payload updates)
        (a, b) if a == b => true,

        // Offline can be reached from anywhere
        (_, Offline) => true,

        // Every reconnect cycle goes through Connecting
        (_, Connecting) => true,

        (Connecting, Connected) => true,
        (Connecting | Connected, Disconnected) => true,

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = LinkStateMachine::new(Transport::Push);
        assert_eq!(
            fsm.snapshot(),
            ConnectionState::connecting(Transport::Push)
        );
    }

    #[test]
    fn test_normal_flow() {
        let mut fsm = LinkStateMachine::new(Transport::Push);

        let result = fsm.process_event(LinkEvent::SampleReceived);
        assert!(matches!(
            result,
            TransitionResult::Changed(ConnectionState {
                status: ConnectionStatus::Connected,
                ..
            })
        ));

        // A second sample does not produce a new snapshot
        assert_eq!(
            fsm.process_event(LinkEvent::SampleReceived),
            TransitionResult::Unchanged
        );

        let result = fsm.process_event(LinkEvent::TransportFailed {
            error: "stream dropped".into(),
            retry_in_seconds: Some(2),
        });
        let TransitionResult::Changed(state) = result else {
            panic!("expected a change");
        };
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.retry_in_seconds, Some(2));
        assert_eq!(state.last_error.as_deref(), Some("stream dropped"));

        // Reconnect keeps the error until the next sample
        let TransitionResult::Changed(state) =
            fsm.process_event(LinkEvent::AttemptStarted(Transport::Push))
        else {
            panic!("expected a change");
        };
        assert_eq!(state.status, ConnectionStatus::Connecting);
        assert_eq!(state.retry_in_seconds, None);
        assert_eq!(state.last_error.as_deref(), Some("stream dropped"));

        fsm.process_event(LinkEvent::SampleReceived);
        assert_eq!(fsm.last_error(), None);
    }

    #[test]
    fn test_not_found_has_no_countdown() {
        let mut fsm = LinkStateMachine::new(Transport::Pull);

        let TransitionResult::Changed(state) = fsm.process_event(LinkEvent::NotFound) else {
            panic!("expected a change");
        };
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.retry_in_seconds, None);
        assert_eq!(state.last_error.as_deref(), Some(live::NOT_FOUND_ERROR));
        assert!(state.can_retry());
    }

    #[test]
    fn test_offline_from_any_state_clears_countdown() {
        let mut fsm = LinkStateMachine::new(Transport::Push);
        fsm.process_event(LinkEvent::TransportFailed {
            error: "boom".into(),
            retry_in_seconds: Some(8),
        });

        let TransitionResult::Changed(state) = fsm.process_event(LinkEvent::WentOffline) else {
            panic!("expected a change");
        };
        assert_eq!(state.status, ConnectionStatus::Offline);
        assert_eq!(state.retry_in_seconds, None);
        assert!(matches!(fsm.state(), LinkState::Offline { .. }));
    }

    #[test]
    fn test_invalid_transition() {
        let mut fsm = LinkStateMachine::new(Transport::Push);
        fsm.process_event(LinkEvent::WentOffline);

        // A late sample cannot bring an offline link back
        let result = fsm.process_event(LinkEvent::SampleReceived);
        assert!(matches!(
            result,
            TransitionResult::Invalid {
                from: ConnectionStatus::Offline,
                ..
            }
        ));
        assert_eq!(fsm.state().status(), ConnectionStatus::Offline);
    }

    #[test]
    fn test_transport_switch_on_attempt() {
        let mut fsm = LinkStateMachine::new(Transport::Push);
        fsm.process_event(LinkEvent::SampleReceived);

        fsm.process_event(LinkEvent::AttemptStarted(Transport::Pull));
        assert_eq!(fsm.snapshot().transport, Transport::Pull);
        assert_eq!(fsm.snapshot().status, ConnectionStatus::Connecting);
    }

    #[test]
    fn test_is_valid_transition() {
        use ConnectionStatus::*;

        assert!(is_valid_transition(Connecting, Connected));
        assert!(is_valid_transition(Connected, Offline));
        assert!(is_valid_transition(Offline, Connecting));
        assert!(is_valid_transition(Disconnected, Connecting));
        assert!(!is_valid_transition(Offline, Connected));
        assert!(!is_valid_transition(Disconnected, Connected));
    }
}
