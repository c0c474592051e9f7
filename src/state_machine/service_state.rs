use std::fmt;

use super::StateMachine;

/// Lifecycle state of a client or server context.
///
/// [`Closed`](ServiceState::Closed) is both the initial state and the state reached after a
/// successful close or an abort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ServiceState {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
    Faulted,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Closed => "closed",
            ServiceState::Opening => "opening",
            ServiceState::Open => "open",
            ServiceState::Closing => "closing",
            ServiceState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Something that happened to a context, fed into the [`ServiceStateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    /// `open` was called.
    Open,
    /// The open sequence completed.
    Opened,
    /// `close` was called.
    Close,
    /// The transport reported that the remote side went away.
    Disconnected,
    /// The close (or disconnect teardown) sequence completed.
    Closed,
    /// An open or close sequence failed.
    Failed,
    /// `abort` was called.
    Abort,
}

/// Notification published on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStateChanged {
    pub previous: ServiceState,
    pub current: ServiceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutput {
    Changed(ServiceStateChanged),
    /// The event is not legal in the current state. The state is left untouched.
    Rejected {
        state: ServiceState,
        event: ServiceEvent,
    },
}

/// Pure transition table for a context's lifecycle.
#[derive(Debug, Default)]
pub struct ServiceStateMachine {
    state: ServiceState,
    pending: Option<ServiceOutput>,
}

impl ServiceStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    fn next_state(state: ServiceState, event: ServiceEvent) -> Option<ServiceState> {
        use ServiceEvent as E;
        use ServiceState as S;

        match (state, event) {
            (S::Closed, E::Open) => Some(S::Opening),
            (S::Opening, E::Opened) => Some(S::Open),
            (S::Opening, E::Failed) => Some(S::Faulted),
            (S::Open, E::Close | E::Disconnected) => Some(S::Closing),
            (S::Closing, E::Closed) => Some(S::Closed),
            (S::Closing, E::Failed) => Some(S::Faulted),
            (S::Faulted, E::Abort) => Some(S::Closed),
            _ => None,
        }
    }

    fn apply(&mut self, event: ServiceEvent) {
        let output = match Self::next_state(self.state, event) {
            Some(current) => {
                let previous = std::mem::replace(&mut self.state, current);
                ServiceOutput::Changed(ServiceStateChanged { previous, current })
            }
            None => ServiceOutput::Rejected {
                state: self.state,
                event,
            },
        };
        self.pending = Some(output);
    }
}

impl StateMachine for ServiceStateMachine {
    type Input = ServiceEvent;
    type Output = ServiceOutput;

    fn process_input(&mut self, input: Self::Input) {
        self.apply(input);
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.take()
    }
}
