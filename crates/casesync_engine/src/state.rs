//! Connection state machine.
//!
//! Transitions are a pure function of the current state and an event. The
//! connection manager executes the returned effects; nothing here performs
//! I/O.

use std::fmt;

/// The state of the remote connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// First connection attempt in flight.
    Connecting,
    /// Connected and believed healthy.
    Connected,
    /// Connection lost; the reconnection loop is running.
    Reconnecting,
    /// The last connection attempt failed.
    Error,
}

impl ConnectionState {
    /// Returns the wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }

    /// Returns true if requests can reach the remote service.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns true while a connection attempt is pending.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    /// Computes the transition for an event.
    pub fn on(self, event: &ConnectionEvent) -> Transition {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Disconnected | S::Error, E::ConnectRequested) => {
                Transition::to(self, S::Connecting, None)
            }
            (S::Connected, E::Reconfigure) => Transition::to(self, S::Connecting, None)
                .with(Effect::StopHealthCheck)
                .with(Effect::InvalidateAuth),

            (S::Connecting, E::ConnectSucceeded) | (S::Reconnecting, E::ReconnectSucceeded) => {
                Transition::to(self, S::Connected, None)
                    .with(Effect::ResetAttempts)
                    .with(Effect::PersistConfig)
                    .with(Effect::StartHealthCheck)
                    .with(Effect::Established)
            }
            (S::Connecting, E::ConnectFailed(error)) => {
                Transition::to(self, S::Error, Some(error.clone()))
                    .with(Effect::InvalidateAuth)
                    .with(Effect::ScheduleReconnect)
            }

            (S::Connected, E::HealthCheckFailed(error) | E::TransportLost(error)) => {
                Transition::to(self, S::Reconnecting, Some(error.clone()))
                    .with(Effect::StopHealthCheck)
                    .with(Effect::InvalidateAuth)
                    .with(Effect::ScheduleReconnect)
            }

            (S::Error, E::ReconnectAttempt) => Transition::to(self, S::Reconnecting, None),
            (S::Reconnecting, E::ReconnectFailed(_)) => {
                Transition::stay(self).with(Effect::ScheduleReconnect)
            }

            (_, E::ForceReconnect) => Transition::to(self, S::Reconnecting, None)
                .with(Effect::StopHealthCheck)
                .with(Effect::InvalidateAuth)
                .with(Effect::ResetAttempts)
                .with(Effect::ScheduleReconnect),

            (_, E::Disconnect) => Transition::to(self, S::Disconnected, None)
                .with(Effect::StopHealthCheck)
                .with(Effect::InvalidateAuth),

            _ => Transition::stay(self),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A caller asked for a connection.
    ConnectRequested,
    /// The endpoint changed while connected.
    Reconfigure,
    /// The first connection attempt succeeded.
    ConnectSucceeded,
    /// The first connection attempt failed.
    ConnectFailed(String),
    /// The periodic probe failed or timed out.
    HealthCheckFailed(String),
    /// The transport reported the connection closed.
    TransportLost(String),
    /// The reconnection loop is about to try again.
    ReconnectAttempt,
    /// A reconnection attempt succeeded.
    ReconnectSucceeded,
    /// A reconnection attempt failed.
    ReconnectFailed(String),
    /// A client asked to tear down and reconnect.
    ForceReconnect,
    /// Explicit shutdown.
    Disconnect,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Broadcast `connection_state_changed`.
    Broadcast {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
        /// Error that caused the transition.
        error: Option<String>,
    },
    /// Start the periodic health check.
    StartHealthCheck,
    /// Stop the periodic health check.
    StopHealthCheck,
    /// Make sure the reconnection loop is running.
    ScheduleReconnect,
    /// Drop the cached auth state.
    InvalidateAuth,
    /// Persist the working connection configuration.
    PersistConfig,
    /// Reset the reconnection attempt counter.
    ResetAttempts,
    /// The connection is (re-)established: resubscribe and replay.
    Established,
}

/// The new state plus the effects to execute, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the event.
    pub state: ConnectionState,
    /// Effects to execute.
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: ConnectionState) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }

    /// A move to `to`, broadcasting only if the state actually changes.
    fn to(from: ConnectionState, to: ConnectionState, error: Option<String>) -> Self {
        let effects = if from == to {
            Vec::new()
        } else {
            vec![Effect::Broadcast { from, to, error }]
        };
        Self { state: to, effects }
    }

    fn with(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// Returns true if the transition broadcasts a state change.
    pub fn broadcasts(&self) -> bool {
        self.effects
            .iter()
            .any(|e| matches!(e, Effect::Broadcast { .. }))
    }

    /// Returns true if the transition includes `effect`.
    pub fn has(&self, effect: &Effect) -> bool {
        self.effects.contains(effect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    #[test]
    fn connect_happy_path() {
        let t = S::Disconnected.on(&E::ConnectRequested);
        assert_eq!(t.state, S::Connecting);
        assert!(t.broadcasts());

        let t = S::Connecting.on(&E::ConnectSucceeded);
        assert_eq!(t.state, S::Connected);
        assert!(t.has(&Effect::PersistConfig));
        assert!(t.has(&Effect::StartHealthCheck));
        assert!(t.has(&Effect::ResetAttempts));
        assert!(t.has(&Effect::Established));
    }

    #[test]
    fn failed_connect_goes_to_error_and_retries() {
        let t = S::Connecting.on(&E::ConnectFailed("refused".into()));
        assert_eq!(t.state, S::Error);
        assert!(t.has(&Effect::ScheduleReconnect));
        assert_eq!(
            t.effects[0],
            Effect::Broadcast {
                from: S::Connecting,
                to: S::Error,
                error: Some("refused".into())
            }
        );

        let t = S::Error.on(&E::ReconnectAttempt);
        assert_eq!(t.state, S::Reconnecting);
        assert!(t.broadcasts());
    }

    #[test]
    fn health_failure_and_transport_loss_reconnect() {
        for event in [E::HealthCheckFailed("timeout".into()), E::TransportLost("eof".into())] {
            let t = S::Connected.on(&event);
            assert_eq!(t.state, S::Reconnecting);
            assert!(t.has(&Effect::StopHealthCheck));
            assert!(t.has(&Effect::InvalidateAuth));
            assert!(t.has(&Effect::ScheduleReconnect));
        }
    }

    #[test]
    fn repeated_failures_while_reconnecting_are_quiet() {
        let t = S::Reconnecting.on(&E::ReconnectFailed("still down".into()));
        assert_eq!(t.state, S::Reconnecting);
        assert!(!t.broadcasts());
        assert_eq!(t.effects, vec![Effect::ScheduleReconnect]);

        let t = S::Reconnecting.on(&E::TransportLost("again".into()));
        assert_eq!(t.state, S::Reconnecting);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn reconnect_success_reestablishes() {
        let t = S::Reconnecting.on(&E::ReconnectSucceeded);
        assert_eq!(t.state, S::Connected);
        assert!(t.has(&Effect::Established));
    }

    #[test]
    fn force_reconnect_from_anywhere() {
        for state in [S::Connected, S::Error, S::Disconnected] {
            let t = state.on(&E::ForceReconnect);
            assert_eq!(t.state, S::Reconnecting);
            assert!(t.has(&Effect::ResetAttempts));
            assert!(t.has(&Effect::ScheduleReconnect));
        }
        assert!(!S::Reconnecting.on(&E::ForceReconnect).broadcasts());
    }

    #[test]
    fn disconnect_stops_everything() {
        let t = S::Connected.on(&E::Disconnect);
        assert_eq!(t.state, S::Disconnected);
        assert!(t.has(&Effect::StopHealthCheck));
        assert!(S::Disconnected.on(&E::Disconnect).effects.len() == 2);
        assert!(!S::Disconnected.on(&E::Disconnect).broadcasts());
    }

    #[test]
    fn stray_events_are_ignored() {
        assert_eq!(S::Connected.on(&E::ConnectRequested), Transition::stay(S::Connected));
        assert_eq!(S::Disconnected.on(&E::TransportLost("x".into())).state, S::Disconnected);
        assert_eq!(S::Connected.on(&E::ReconnectSucceeded).state, S::Connected);
    }

    #[test]
    fn reconfigure_while_connected() {
        let t = S::Connected.on(&E::Reconfigure);
        assert_eq!(t.state, S::Connecting);
        assert!(t.has(&Effect::StopHealthCheck));
    }
}
