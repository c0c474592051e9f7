use tonic::Code;
use tonic::metadata::errors::InvalidMetadataValue;

use crate::context::ConfigError;
use crate::dispatcher::DispatcherError;
use crate::instance::InstanceError;
use crate::peer::{PeerError, PeerEvicted, PeerNotFound};
use crate::serializer::SerializerError;
use crate::service::{RemoteError, RouteError, ServiceAlreadyRegistered};
use crate::state_machine::service_state::ServiceState;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot {operation} while the context is {state}")]
    InvalidState {
        operation: &'static str,
        state: ServiceState,
    },

    #[error("the service token does not belong to the open session")]
    InvalidToken,

    #[error("the operation was cancelled")]
    Cancelled,

    #[error("the proxy was released with its instance")]
    Released,

    #[error("the operation timed out")]
    Timeout,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("transport call failed: {0}")]
    Status(Box<tonic::Status>),

    #[error("transport error")]
    Transport(#[from] tonic::transport::Error),

    #[error("invalid call metadata")]
    Metadata(#[from] InvalidMetadataValue),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serializer(#[from] SerializerError),

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    PeerNotFound(#[from] PeerNotFound),

    #[error(transparent)]
    PeerEvicted(#[from] PeerEvicted),

    #[error(transparent)]
    ServiceAlreadyRegistered(#[from] ServiceAlreadyRegistered),

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// A cancelled call is surfaced as [`Error::Cancelled`], never as a transport failure.
impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            Code::Cancelled => Error::Cancelled,
            _ => Error::Status(Box::new(status)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl Error {
    /// The remote error a call failed with, if the server method itself reported one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Error::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
