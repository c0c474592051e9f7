use super::PeerId;
use crate::instance::InstanceError;

/// Indicates that a peer could not be registered because its id is already live.
#[derive(Debug, thiserror::Error)]
#[error("the provided peer id ({peer_id}) is already present")]
pub struct PeerAlreadyPresent {
    pub peer_id: PeerId,
}

/// Indicates that an operation addressed a peer that is not registered.
#[derive(Debug, thiserror::Error)]
#[error("the provided peer id ({peer_id}) could not be found")]
pub struct PeerNotFound {
    pub peer_id: PeerId,
}

/// A per-peer callback was sent after its peer disconnected.
#[derive(Debug, thiserror::Error)]
#[error("peer {peer_id} has disconnected, callback dropped")]
pub struct PeerEvicted {
    pub peer_id: PeerId,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    AlreadyPresent(#[from] PeerAlreadyPresent),

    #[error(transparent)]
    NotFound(#[from] PeerNotFound),

    #[error("failed to bind instances for peer: {0}")]
    Instance(#[from] InstanceError),
}
