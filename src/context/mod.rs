//! Top-level session contexts.
//!
//! A context owns one [`ServiceStateMachine`] and drives the adaptor and instance lifecycle from
//! its `open`, `close` and `abort` operations. Every transition is published to subscribers.

use std::fmt;

use tokio::sync::{broadcast, watch};
use tracing::info;
use uuid::Uuid;

use crate::Error;
use crate::state_machine::StateMachine;
use crate::state_machine::service_state::{
    ServiceEvent, ServiceOutput, ServiceState, ServiceStateChanged, ServiceStateMachine,
};

pub use self::client::ClientContext;
pub use self::config::{ClientConfig, ConfigError, ServerConfig};
pub use self::server::ServerContext;

pub mod client;
pub mod config;
pub mod server;

const STATE_CHANGE_CAPACITY: usize = 64;

/// Opaque handle to one open session, minted by `open` and required by the matching `close`.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct ServiceToken(Uuid);

impl ServiceToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

/// The nil id is never a valid token.
impl TryFrom<Uuid> for ServiceToken {
    type Error = Error;

    fn try_from(uuid: Uuid) -> Result<Self, Self::Error> {
        if uuid.is_nil() {
            return Err(Error::InvalidToken);
        }
        Ok(Self(uuid))
    }
}

impl fmt::Debug for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceToken({})", self.0)
    }
}

impl fmt::Display for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Publishes the transitions of one context.
#[derive(Debug)]
struct StateNotifier {
    role: &'static str,
    changes: broadcast::Sender<ServiceStateChanged>,
    current: watch::Sender<ServiceState>,
}

impl StateNotifier {
    fn new(role: &'static str) -> Self {
        Self {
            role,
            changes: broadcast::Sender::new(STATE_CHANGE_CAPACITY),
            current: watch::Sender::new(ServiceState::default()),
        }
    }

    /// Feed `event` to `machine` and publish the transition, or reject `operation`.
    fn drive(
        &self,
        machine: &mut ServiceStateMachine,
        event: ServiceEvent,
        operation: &'static str,
    ) -> Result<ServiceStateChanged, Error> {
        machine.process_input(event);

        match machine.poll_output() {
            Some(ServiceOutput::Changed(change)) => {
                info!(
                    role = self.role,
                    previous = %change.previous,
                    current = %change.current,
                    "Service state changed"
                );
                self.current.send_replace(change.current);
                // No subscribers is fine.
                let _ = self.changes.send(change);
                Ok(change)
            }
            Some(ServiceOutput::Rejected { state, .. }) => {
                Err(Error::InvalidState { operation, state })
            }
            None => Err(Error::InvalidState {
                operation,
                state: machine.state(),
            }),
        }
    }

    fn state(&self) -> ServiceState {
        *self.current.borrow()
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceStateChanged> {
        self.changes.subscribe()
    }

    fn watch(&self) -> watch::Receiver<ServiceState> {
        self.current.subscribe()
    }
}

/// Reject `operation` unless `machine` is in `required`.
fn require(
    machine: &ServiceStateMachine,
    required: ServiceState,
    operation: &'static str,
) -> Result<(), Error> {
    match machine.state() {
        state if state == required => Ok(()),
        state => Err(Error::InvalidState { operation, state }),
    }
}
