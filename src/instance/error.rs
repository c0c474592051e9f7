use crate::peer::PeerId;

/// Indicates an add or remove was attempted on a descriptor after it was disposed.
#[derive(Debug, thiserror::Error)]
#[error("the peer descriptor has already been disposed")]
pub struct DescriptorDisposed;

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("session instances are already initialized")]
    AlreadyInitialized,

    #[error("session instances are not initialized")]
    NotInitialized,

    #[error("the peer ({peer_id}) already has bound instances")]
    PeerAlreadyBound { peer_id: PeerId },

    #[error("more than one instance of {type_name} is registered")]
    Ambiguous { type_name: &'static str },

    #[error(transparent)]
    Disposed(#[from] DescriptorDisposed),
}
