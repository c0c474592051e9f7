use std::fmt;
use std::sync::Weak;

use super::error::PeerEvicted;
use super::{CallbackData, Peer, PeerId};

/// Weak handle a per-peer callback proxy keeps to its own peer.
///
/// A peer counts as live until it is closed, even while its poll stream still holds it to deliver
/// the close code.
#[derive(Clone)]
pub struct PeerRef {
    peer_id: PeerId,
    peer: Weak<Peer>,
}

impl PeerRef {
    pub(crate) fn new(peer_id: PeerId, peer: Weak<Peer>) -> Self {
        Self { peer_id, peer }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn is_live(&self) -> bool {
        self.peer
            .upgrade()
            .is_some_and(|peer| peer.close_code().is_none())
    }

    /// Queue `callback` for the peer's next poll and return how many callbacks are now pending.
    pub fn enqueue(&self, callback: CallbackData) -> Result<usize, PeerEvicted> {
        let evicted = || PeerEvicted {
            peer_id: self.peer_id,
        };

        let peer = self.peer.upgrade().ok_or_else(evicted)?;
        if peer.close_code().is_some() {
            return Err(evicted());
        }

        peer.enqueue(callback);
        Ok(peer.pending_count())
    }
}

impl fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRef")
            .field("peer_id", &self.peer_id)
            .field("live", &self.is_live())
            .finish()
    }
}
