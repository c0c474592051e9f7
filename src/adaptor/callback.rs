use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::instance::Disposable;
use crate::peer::{CallbackData, Peer, PeerId, PeerRef, PeerTable};
use crate::serializer::{EncodeArgs, Serializer};

#[derive(Clone)]
enum CallbackTarget {
    Peer(PeerRef),
    Broadcast(Weak<PeerTable>),
}

/// Server side handle a service instance uses to push callbacks to clients.
///
/// A per-peer instance holds a proxy aimed at its own peer. A session-scoped instance holds one
/// that broadcasts to every connected peer. Arguments are serialized once per send, whatever the
/// number of targets.
#[derive(Clone)]
pub struct CallbackProxy {
    service: Arc<str>,
    target: CallbackTarget,
    serializer: Arc<dyn Serializer>,
    released: Arc<AtomicBool>,
}

impl fmt::Debug for CallbackProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackProxy")
            .field("service", &self.service)
            .field("peer_id", &self.peer_id())
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

impl CallbackProxy {
    pub(crate) fn peer(service: Arc<str>, peer: PeerRef, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            service,
            target: CallbackTarget::Peer(peer),
            serializer,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn broadcast(
        service: Arc<str>,
        peers: Weak<PeerTable>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            service,
            target: CallbackTarget::Broadcast(peers),
            serializer,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// The addressed peer, or `None` for a broadcast proxy.
    pub fn peer_id(&self) -> Option<PeerId> {
        match &self.target {
            CallbackTarget::Peer(peer) => Some(peer.peer_id()),
            CallbackTarget::Broadcast(_) => None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Queue a call to `method` on the client's callback handler.
    ///
    /// Returns once the callback is queued; delivery happens on the target's next poll. Sending
    /// through a released proxy fails with [`Error::Released`](crate::Error::Released), and a
    /// per-peer proxy whose peer disconnected fails with
    /// [`PeerEvicted`](crate::peer::PeerEvicted).
    pub fn send<A: EncodeArgs>(&self, method: &str, args: A) -> Result<(), crate::Error> {
        if self.is_released() {
            return Err(crate::Error::Released);
        }

        let data = args.encode_args(&*self.serializer)?;
        let callback = CallbackData::new(Arc::clone(&self.service), method, data);

        match &self.target {
            CallbackTarget::Peer(peer) => {
                let pending = peer.enqueue(callback)?;
                debug!(
                    peer_id = %peer.peer_id(),
                    service = %self.service,
                    method = %method,
                    pending,
                    "Callback queued"
                );
            }
            CallbackTarget::Broadcast(peers) => {
                // Server already shut down.
                let Some(peers) = peers.upgrade() else {
                    return Ok(());
                };

                let targets: Vec<Arc<Peer>> =
                    peers.iter().map(|entry| Arc::clone(entry.value())).collect();
                for peer in &targets {
                    peer.enqueue(callback.clone());
                }
                debug!(
                    service = %self.service,
                    method = %method,
                    peers = targets.len(),
                    "Callback broadcast"
                );
            }
        }

        Ok(())
    }
}

impl Disposable for CallbackProxy {
    fn dispose(&self) {
        self.released.store(true, Ordering::Release);
    }
}
