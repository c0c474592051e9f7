//! A duplex RPC runtime over gRPC.
//!
//! A [`ServerContext`] exposes named services to remote peers. A [`ClientContext`] opens a session
//! against it, calls those services through [`ServiceStub`]s, and receives server pushes on its
//! own callback handlers. Pushes ride a long-poll stream, so the transport only needs unary and
//! bidirectional streaming calls.
//!
//! Services are described explicitly: a [`ServiceDefinition`] names the contract, a
//! [`MethodTable`] routes method names to async handlers, and a [`ServiceRegistration`] ties both
//! to a factory that receives the proxy for the other side.

pub mod adaptor;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod peer;
pub mod serializer;
pub mod service;
pub mod state_machine;

pub mod duplex_proto {
    include!(concat!(env!("OUT_DIR"), "/duplex.rs"));
}

pub use self::adaptor::{CallbackProxy, PEER_ID_HEADER, ServiceStub};
pub use self::context::{
    ClientConfig, ClientContext, ConfigError, ServerConfig, ServerContext, ServiceToken,
};
pub use self::dispatcher::{DispatchHandle, Dispatcher, DispatcherError};
pub use self::error::Error;
pub use self::peer::{CloseCode, PeerId};
pub use self::serializer::{EncodeArgs, JsonSerializer, Serializer, SerializerError};
pub use self::service::{
    Arguments, MethodDescriptor, MethodTable, RemoteError, ServiceCollection, ServiceDefinition,
    ServiceRegistration,
};
pub use self::state_machine::service_state::{ServiceState, ServiceStateChanged};
