use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, Entry};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{PeerAlreadyPresent, PeerError, PeerNotFound};
use super::peer_ref::PeerRef;
use super::{CloseCode, Peer, PeerId};
use crate::adaptor::CallbackProxy;
use crate::instance::{InstanceContext, InstanceScope};
use crate::serializer::Serializer;
use crate::service::ServiceCollection;

/// Concurrent table of live peers, shared weakly with broadcast callback proxies.
pub type PeerTable = DashMap<PeerId, Arc<Peer>, ahash::RandomState>;

/// Registry of the server's connected peers.
///
/// Registration and removal are paired with the creation and destruction of each peer's service
/// instances: instances are bound strictly after the peer is registered and destroyed strictly
/// before it is removed. Each [`Peer`] carries its own locks; no lock here spans more than one
/// peer.
#[derive(Debug)]
pub struct PeerCollection {
    peers: Arc<PeerTable>,
    instances: Arc<InstanceContext<CallbackProxy>>,
}

impl PeerCollection {
    /// Build an empty registry whose service instances push callbacks through `serializer`.
    ///
    /// Session-scoped instances receive a proxy that broadcasts to every peer; per-peer instances
    /// receive one aimed at their own peer.
    pub fn new(
        services: Arc<ServiceCollection<CallbackProxy>>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        let peers: Arc<PeerTable> = Arc::new(DashMap::default());
        let table = Arc::downgrade(&peers);

        let instances = InstanceContext::new(services, move |definition, scope| match scope {
            InstanceScope::Session => CallbackProxy::broadcast(
                definition.shared_name(),
                Weak::clone(&table),
                Arc::clone(&serializer),
            ),
            InstanceScope::Peer(peer_id) => {
                let weak_peer = table
                    .upgrade()
                    .and_then(|t| t.get(&peer_id).map(|p| Arc::downgrade(p.value())))
                    .unwrap_or_default();
                CallbackProxy::peer(
                    definition.shared_name(),
                    PeerRef::new(peer_id, weak_peer),
                    Arc::clone(&serializer),
                )
            }
        });

        Self {
            peers,
            instances: Arc::new(instances),
        }
    }

    pub fn instances(&self) -> &Arc<InstanceContext<CallbackProxy>> {
        &self.instances
    }

    /// Register a new peer and bind its service instances.
    pub fn add(&self, peer_id: PeerId) -> Result<PeerRef, PeerError> {
        let peer_ref = match self.peers.entry(peer_id) {
            Entry::Occupied(entry) => {
                return Err(PeerAlreadyPresent {
                    peer_id: *entry.key(),
                }
                .into());
            }
            Entry::Vacant(slot) => {
                let peer = slot.insert(Arc::new(Peer::new(peer_id)));
                PeerRef::new(peer_id, Arc::downgrade(peer.value()))
            }
        };

        if let Err(err) = self.instances.create_instance(peer_id) {
            self.peers.remove(&peer_id);
            return Err(err.into());
        }

        info!(peer_id = %peer_id, peers = self.peers.len(), "Peer registered");
        Ok(peer_ref)
    }

    /// Destroy the peer's instances, unregister it and deliver `code` to its poll stream.
    pub fn remove(&self, peer_id: PeerId, code: CloseCode) -> Result<(), PeerNotFound> {
        if !self.peers.contains_key(&peer_id) {
            return Err(PeerNotFound { peer_id });
        }

        if let Err(err) = self.instances.destroy_instance(peer_id) {
            warn!(peer_id = %peer_id, error = %err, "Failed to destroy peer instances");
        }

        let (_, peer) = self
            .peers
            .remove(&peer_id)
            .ok_or(PeerNotFound { peer_id })?;
        peer.close(code);

        info!(peer_id = %peer_id, code = %code, peers = self.peers.len(), "Peer removed");
        Ok(())
    }

    /// Remove `peer` with `code` if it is still the registered peer for its id.
    ///
    /// Returns `false` when the peer was already removed or its id has been reused.
    pub(crate) fn evict(&self, peer: &Arc<Peer>, code: CloseCode) -> bool {
        let peer_id = peer.id();
        let registered = self
            .peers
            .get(&peer_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), peer));

        registered && self.remove(peer_id, code).is_ok()
    }

    /// Lend the peer for the provided `peer_id` as a weak handle.
    pub fn get(&self, peer_id: PeerId) -> Result<PeerRef, PeerNotFound> {
        self.peers
            .get(&peer_id)
            .map(|peer| PeerRef::new(peer_id, Arc::downgrade(peer.value())))
            .ok_or(PeerNotFound { peer_id })
    }

    /// A strong handle for a poll stream, which must still see the close code after removal.
    pub(crate) fn lease(&self, peer_id: PeerId) -> Result<Arc<Peer>, PeerNotFound> {
        self.peers
            .get(&peer_id)
            .map(|peer| Arc::clone(peer.value()))
            .ok_or(PeerNotFound { peer_id })
    }

    pub fn touch(&self, peer_id: PeerId) -> Result<(), PeerNotFound> {
        self.peers
            .view(&peer_id, |_, peer| peer.touch())
            .ok_or(PeerNotFound { peer_id })
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.peers.contains_key(&peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Evict every peer not seen within `timeout` of `now`, returning the evicted ids.
    pub fn evict_expired(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| entry.value().is_expired(now, timeout))
            .map(|entry| *entry.key())
            .collect();

        for peer_id in &expired {
            // Lost a race with a client close.
            if self.remove(*peer_id, CloseCode::EXPIRED).is_err() {
                debug!(peer_id = %peer_id, "Expired peer already removed");
                continue;
            }
            info!(peer_id = %peer_id, "Peer evicted after liveness timeout");
        }

        expired
    }

    /// Remove every peer with `code`.
    pub fn clear(&self, code: CloseCode) {
        for peer_id in self.ids() {
            let _ = self.remove(peer_id, code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{CallbackData, PollOutcome};
    use crate::serializer::default_serializer;
    use crate::service::{MethodTable, ServiceDefinition, ServiceRegistration};

    struct Scoped {
        proxy: CallbackProxy,
    }

    fn collection() -> PeerCollection {
        let services = ServiceCollection::new()
            .with(ServiceRegistration::new(
                ServiceDefinition::new("Scoped").per_peer(),
                MethodTable::builder::<Scoped>().build(),
                |proxy| Scoped { proxy },
            ))
            .unwrap();

        let peers = PeerCollection::new(Arc::new(services), default_serializer());
        peers.instances().initialize_instance().unwrap();
        peers
    }

    #[test]
    fn test_duplicate_peer_is_rejected() {
        let peers = collection();
        let id = PeerId::generate();

        peers.add(id).unwrap();
        assert!(matches!(peers.add(id), Err(PeerError::AlreadyPresent(_))));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_remove_destroys_instances_and_closes_peer() {
        let peers = collection();
        let id = PeerId::generate();

        peers.add(id).unwrap();
        let peer = peers.lease(id).unwrap();
        assert!(peers.instances().resolve(id, "Scoped").is_some());

        peers.remove(id, CloseCode::GRACEFUL).unwrap();

        assert!(peers.instances().resolve(id, "Scoped").is_none());
        assert!(!peers.contains(id));
        assert_eq!(peer.close_code(), Some(CloseCode::GRACEFUL));
        assert!(peers.remove(id, CloseCode::GRACEFUL).is_err());
    }

    #[test]
    fn test_peer_ref_does_not_outlive_removal() {
        let peers = collection();
        let id = PeerId::generate();

        let peer_ref = peers.add(id).unwrap();
        assert!(peer_ref.is_live());

        peers.remove(id, CloseCode::GRACEFUL).unwrap();
        assert!(!peer_ref.is_live());
        assert!(peers.get(id).is_err());
    }

    #[test]
    fn test_evict_skips_a_reopened_peer() {
        let peers = collection();
        let id = PeerId::generate();

        peers.add(id).unwrap();
        let first = peers.lease(id).unwrap();
        peers.remove(id, CloseCode::GRACEFUL).unwrap();
        peers.add(id).unwrap();

        assert!(!peers.evict(&first, CloseCode::FAULTED));
        assert!(peers.contains(id));

        let second = peers.lease(id).unwrap();
        assert!(peers.evict(&second, CloseCode::FAULTED));
        assert!(!peers.contains(id));
        assert_eq!(second.close_code(), Some(CloseCode::FAULTED));
    }

    #[tokio::test]
    async fn test_per_peer_proxy_targets_its_own_peer() {
        let peers = collection();
        let a = PeerId::generate();
        let b = PeerId::generate();
        peers.add(a).unwrap();
        peers.add(b).unwrap();

        let scoped = peers
            .instances()
            .resolve(a, "Scoped")
            .unwrap()
            .downcast::<Scoped>()
            .unwrap();
        scoped.proxy.send("OnTick", (42,)).unwrap();

        let peer_a = peers.lease(a).unwrap();
        let peer_b = peers.lease(b).unwrap();
        assert_eq!(peer_b.pending_count(), 0);

        let PollOutcome::Callbacks(batch) = peer_a.poll(Duration::from_secs(1)).await else {
            panic!("expected callbacks");
        };
        assert_eq!(batch, [CallbackData::new("Scoped", "OnTick", vec!["42".to_string()])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_uses_expired_code() {
        let peers = collection();
        let stale = PeerId::generate();
        let fresh = PeerId::generate();
        peers.add(stale).unwrap();
        peers.add(fresh).unwrap();
        let stale_peer = peers.lease(stale).unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        peers.touch(fresh).unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;

        let evicted = peers.evict_expired(Instant::now(), Duration::from_secs(30));

        assert_eq!(evicted, [stale]);
        assert_eq!(peers.ids(), [fresh]);
        assert_eq!(stale_peer.close_code(), Some(CloseCode::EXPIRED));
    }

    #[test]
    fn test_clear_removes_everyone() {
        let peers = collection();
        for _ in 0..5 {
            peers.add(PeerId::generate()).unwrap();
        }

        peers.clear(CloseCode::GRACEFUL);
        assert!(peers.is_empty());
        assert_eq!(peers.instances().peer_count(), 0);
    }
}
