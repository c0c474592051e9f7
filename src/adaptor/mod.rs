//! The session protocol over gRPC.
//!
//! The server half is a tonic service ([`ServerAdaptor`]) hosted by a [`ServerHost`]; the client
//! half ([`ClientAdaptor`]) drives the open handshake, a heartbeat and the long-poll callback loop.
//! [`CallbackProxy`] and [`ServiceStub`] are the remote handles service instances are built with.

pub mod callback;
pub mod client;
pub mod metadata;
pub mod server;

pub use self::callback::CallbackProxy;
pub use self::client::{ClientAdaptor, ServiceStub};
pub use self::metadata::PEER_ID_HEADER;
pub use self::server::{ServerAdaptor, ServerHost};
