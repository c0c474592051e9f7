use std::fmt;
use std::sync::Mutex;

use tracing::{debug, error};

use super::Disposable;
use super::error::DescriptorDisposed;
use crate::peer::PeerId;
use crate::service::{Instance, ServiceDefinition};

/// One service as seen from a peer: the local instance calls are routed to and the proxy that
/// reaches the other side.
pub struct ServiceBinding<P> {
    definition: ServiceDefinition,
    instance: Instance,
    proxy: P,
    owned: bool,
}

impl<P> ServiceBinding<P> {
    /// A binding created for (and torn down with) its descriptor.
    pub fn owned(definition: ServiceDefinition, instance: Instance, proxy: P) -> Self {
        Self {
            definition,
            instance,
            proxy,
            owned: true,
        }
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn proxy(&self) -> &P {
        &self.proxy
    }

    /// Whether disposing the descriptor also disposes this binding's proxy.
    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

impl<P: Clone> ServiceBinding<P> {
    /// A borrowed view of a session-level binding, reused by a peer without owning it.
    pub fn shared(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            instance: self.instance.clone(),
            proxy: self.proxy.clone(),
            owned: false,
        }
    }
}

struct DescriptorState<P> {
    bindings: Vec<ServiceBinding<P>>,
    disposed: bool,
}

/// Table of service bindings for one peer, or for the whole session when `peer_id` is `None`.
pub struct PeerDescriptor<P> {
    peer_id: Option<PeerId>,
    state: Mutex<DescriptorState<P>>,
}

impl<P> fmt::Debug for PeerDescriptor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("descriptor lock poisoned");
        f.debug_struct("PeerDescriptor")
            .field("peer_id", &self.peer_id)
            .field(
                "services",
                &state
                    .bindings
                    .iter()
                    .map(|b| b.definition.name())
                    .collect::<Vec<_>>(),
            )
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl<P: Clone + Disposable> PeerDescriptor<P> {
    pub fn new(peer_id: Option<PeerId>) -> Self {
        Self {
            peer_id,
            state: Mutex::new(DescriptorState {
                bindings: Vec::new(),
                disposed: false,
            }),
        }
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn add(&self, binding: ServiceBinding<P>) -> Result<(), DescriptorDisposed> {
        let mut state = self.state.lock().expect("descriptor lock poisoned");
        if state.disposed {
            error!(peer_id = ?self.peer_id, service = %binding.definition, "Add on a disposed descriptor");
            return Err(DescriptorDisposed);
        }

        state.bindings.push(binding);
        Ok(())
    }

    pub fn remove(&self, service: &str) -> Result<Option<ServiceBinding<P>>, DescriptorDisposed> {
        let mut state = self.state.lock().expect("descriptor lock poisoned");
        if state.disposed {
            error!(peer_id = ?self.peer_id, service = %service, "Remove on a disposed descriptor");
            return Err(DescriptorDisposed);
        }

        let position = state
            .bindings
            .iter()
            .position(|b| b.definition.name() == service);
        Ok(position.map(|i| state.bindings.remove(i)))
    }

    pub fn binding(&self, service: &str) -> Option<ServiceBinding<P>> {
        let state = self.state.lock().expect("descriptor lock poisoned");
        state
            .bindings
            .iter()
            .find(|b| b.definition.name() == service)
            .map(|b| ServiceBinding {
                definition: b.definition.clone(),
                instance: b.instance.clone(),
                proxy: b.proxy.clone(),
                owned: b.owned,
            })
    }

    pub fn instance(&self, service: &str) -> Option<Instance> {
        let state = self.state.lock().expect("descriptor lock poisoned");
        state
            .bindings
            .iter()
            .find(|b| b.definition.name() == service)
            .map(|b| b.instance.clone())
    }

    pub fn proxy(&self, service: &str) -> Option<P> {
        let state = self.state.lock().expect("descriptor lock poisoned");
        state
            .bindings
            .iter()
            .find(|b| b.definition.name() == service)
            .map(|b| b.proxy.clone())
    }

    pub fn instances(&self) -> Vec<Instance> {
        let state = self.state.lock().expect("descriptor lock poisoned");
        state.bindings.iter().map(|b| b.instance.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("descriptor lock poisoned")
            .bindings
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().expect("descriptor lock poisoned").disposed
    }

    /// Tear down every binding in reverse registration order.
    ///
    /// Proxies of owned bindings are disposed; shared bindings are only dropped.
    pub fn dispose(&self) -> Result<(), DescriptorDisposed> {
        let bindings = {
            let mut state = self.state.lock().expect("descriptor lock poisoned");
            if state.disposed {
                return Err(DescriptorDisposed);
            }
            state.disposed = true;
            std::mem::take(&mut state.bindings)
        };

        for binding in bindings.into_iter().rev() {
            if binding.owned {
                binding.proxy.dispose();
            }
            debug!(
                peer_id = ?self.peer_id,
                service = %binding.definition,
                owned = binding.owned,
                "Service instance released"
            );
        }

        Ok(())
    }
}
