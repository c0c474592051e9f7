use std::any::type_name;
use std::sync::{Arc, Mutex};

use dashmap::{DashMap, Entry};
use tracing::{debug, warn};

use crate::peer::PeerId;
use crate::service::{Instance, ServiceCollection, ServiceDefinition};

pub use self::descriptor::{PeerDescriptor, ServiceBinding};
pub use self::error::{DescriptorDisposed, InstanceError};

pub mod descriptor;
pub mod error;

/// A proxy that holds resources to release when its binding is torn down.
pub trait Disposable {
    fn dispose(&self);
}

impl Disposable for () {
    fn dispose(&self) {}
}

/// What an instance is being created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceScope {
    Session,
    Peer(PeerId),
}

type Binder<P> = Arc<dyn Fn(&ServiceDefinition, InstanceScope) -> P + Send + Sync>;

/// Materializes and tracks service instances for a context.
///
/// Session-scoped services are created once by [`initialize_instance`](Self::initialize_instance)
/// and shared by every peer. Per-peer services are created by
/// [`create_instance`](Self::create_instance) for each peer and destroyed with it.
///
/// The `binder` produces the proxy each new instance receives, for example a callback proxy aimed
/// at one peer or at every peer.
pub struct InstanceContext<P> {
    services: Arc<ServiceCollection<P>>,
    binder: Binder<P>,
    session: Mutex<Option<Arc<PeerDescriptor<P>>>>,
    peers: DashMap<PeerId, Arc<PeerDescriptor<P>>, ahash::RandomState>,
}

impl<P> std::fmt::Debug for InstanceContext<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceContext")
            .field("services", &self.services.len())
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

impl<P: Clone + Disposable + 'static> InstanceContext<P> {
    pub fn new<B>(services: Arc<ServiceCollection<P>>, binder: B) -> Self
    where
        B: Fn(&ServiceDefinition, InstanceScope) -> P + Send + Sync + 'static,
    {
        Self {
            services,
            binder: Arc::new(binder),
            session: Mutex::new(None),
            peers: DashMap::default(),
        }
    }

    pub fn services(&self) -> &Arc<ServiceCollection<P>> {
        &self.services
    }

    /// Create the session-scoped instances. Called once per open.
    pub fn initialize_instance(&self) -> Result<(), InstanceError> {
        let mut session = self.session.lock().expect("session descriptor lock poisoned");
        if session.is_some() {
            return Err(InstanceError::AlreadyInitialized);
        }

        let descriptor = PeerDescriptor::new(None);
        for registration in self
            .services
            .iter()
            .filter(|r| !r.definition().is_per_peer())
        {
            let definition = registration.definition();
            let proxy = (self.binder)(definition, InstanceScope::Session);
            let instance = registration.create(proxy.clone());
            descriptor.add(ServiceBinding::owned(definition.clone(), instance, proxy))?;
        }

        debug!(services = descriptor.len(), "Session instances initialized");
        *session = Some(Arc::new(descriptor));
        Ok(())
    }

    /// Destroy the session-scoped instances. Called once per close or abort.
    pub fn release_instance(&self) -> Result<(), InstanceError> {
        let descriptor = self
            .session
            .lock()
            .expect("session descriptor lock poisoned")
            .take()
            .ok_or(InstanceError::NotInitialized)?;

        descriptor.dispose()?;
        debug!("Session instances released");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.session
            .lock()
            .expect("session descriptor lock poisoned")
            .is_some()
    }

    /// Bind every service for a newly registered peer.
    ///
    /// Per-peer services get fresh instances; session-scoped ones are shared from the session
    /// descriptor.
    pub fn create_instance(&self, peer_id: PeerId) -> Result<Arc<PeerDescriptor<P>>, InstanceError> {
        let session = self.session_descriptor();
        let descriptor = PeerDescriptor::new(Some(peer_id));

        for registration in self.services.iter() {
            let definition = registration.definition();

            if definition.is_per_peer() {
                let proxy = (self.binder)(definition, InstanceScope::Peer(peer_id));
                let instance = registration.create(proxy.clone());
                descriptor.add(ServiceBinding::owned(definition.clone(), instance, proxy))?;
                continue;
            }

            match session.as_ref().and_then(|s| s.binding(definition.name())) {
                Some(binding) => descriptor.add(binding.shared())?,
                None => warn!(
                    peer_id = %peer_id,
                    service = %definition,
                    "Session instance missing, service unavailable to peer"
                ),
            }
        }

        let descriptor = Arc::new(descriptor);
        match self.peers.entry(peer_id) {
            Entry::Occupied(_) => {
                descriptor.dispose()?;
                Err(InstanceError::PeerAlreadyBound { peer_id })
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&descriptor));
                debug!(peer_id = %peer_id, services = descriptor.len(), "Peer instances created");
                Ok(descriptor)
            }
        }
    }

    /// Tear down a peer's bindings. A peer without bindings is ignored.
    pub fn destroy_instance(&self, peer_id: PeerId) -> Result<(), InstanceError> {
        if let Some((_, descriptor)) = self.peers.remove(&peer_id) {
            descriptor.dispose()?;
            debug!(peer_id = %peer_id, "Peer instances destroyed");
        }
        Ok(())
    }

    pub fn descriptor(&self, peer_id: PeerId) -> Option<Arc<PeerDescriptor<P>>> {
        self.peers.get(&peer_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn session_descriptor(&self) -> Option<Arc<PeerDescriptor<P>>> {
        self.session
            .lock()
            .expect("session descriptor lock poisoned")
            .clone()
    }

    /// The instance a call from `peer_id` to `service` is routed to.
    pub fn resolve(&self, peer_id: PeerId, service: &str) -> Option<Instance> {
        self.peers
            .get(&peer_id)
            .and_then(|descriptor| descriptor.instance(service))
    }

    /// The unique instance of type `S` across the session and every peer.
    ///
    /// More than one distinct instance is a usage error.
    pub fn get_service<S: Send + Sync + 'static>(&self) -> Result<Option<Arc<S>>, InstanceError> {
        let mut candidates = self
            .session_descriptor()
            .map(|d| d.instances())
            .unwrap_or_default();
        for entry in self.peers.iter() {
            candidates.extend(entry.value().instances());
        }

        let mut found: Option<Arc<S>> = None;
        for instance in candidates {
            let Ok(typed) = instance.downcast::<S>() else {
                continue;
            };
            match &found {
                Some(existing) if Arc::ptr_eq(existing, &typed) => {}
                Some(_) => {
                    return Err(InstanceError::Ambiguous {
                        type_name: type_name::<S>(),
                    });
                }
                None => found = Some(typed),
            }
        }

        Ok(found)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
