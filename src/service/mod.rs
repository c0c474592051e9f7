//! Service contracts and their explicit dispatch tables.
//!
//! A [`ServiceDefinition`] names a contract and says whether its instances live for the whole
//! session or per connected peer. A [`ServiceRegistration`] binds that contract to a concrete
//! implementation on one side of the connection: the server registers the callable service, the
//! client registers the callback handler. In both cases the factory receives the proxy `P` that
//! reaches the other side.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub mod error;
pub mod method;
pub mod remote;

pub use self::error::{RouteError, ServiceAlreadyRegistered};
pub use self::method::{
    Arguments, Instance, MethodDescriptor, MethodEntry, MethodFuture, MethodTable,
    MethodTableBuilder,
};
pub use self::remote::RemoteError;

/// A named contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDefinition {
    name: Arc<str>,
    per_peer: bool,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            per_peer: false,
        }
    }

    /// Instantiate separately for each connected peer instead of once per session.
    pub fn per_peer(mut self) -> Self {
        self.per_peer = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn is_per_peer(&self) -> bool {
        self.per_peer
    }
}

impl fmt::Display for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

type Factory<P> = Arc<dyn Fn(P) -> Instance + Send + Sync>;

/// A contract bound to the factory and method table of one side's implementation.
pub struct ServiceRegistration<P> {
    definition: ServiceDefinition,
    factory: Factory<P>,
    methods: Arc<MethodTable>,
}

impl<P: 'static> ServiceRegistration<P> {
    pub fn new<S, F>(definition: ServiceDefinition, methods: MethodTable, factory: F) -> Self
    where
        S: Send + Sync + 'static,
        F: Fn(P) -> S + Send + Sync + 'static,
    {
        Self {
            definition,
            factory: Arc::new(move |proxy| Arc::new(factory(proxy)) as Instance),
            methods: Arc::new(methods),
        }
    }
}

impl<P> ServiceRegistration<P> {
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    /// Build a fresh instance bound to `proxy`.
    pub fn create(&self, proxy: P) -> Instance {
        (self.factory)(proxy)
    }
}

impl<P> Clone for ServiceRegistration<P> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            factory: Arc::clone(&self.factory),
            methods: Arc::clone(&self.methods),
        }
    }
}

impl<P> fmt::Debug for ServiceRegistration<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("definition", &self.definition)
            .field("methods", &self.methods.len())
            .finish_non_exhaustive()
    }
}

/// Registered services of one side, in registration order, with unique names.
#[derive(Debug)]
pub struct ServiceCollection<P> {
    services: Vec<ServiceRegistration<P>>,
    index: HashMap<Arc<str>, usize, ahash::RandomState>,
}

impl<P> ServiceCollection<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        registration: ServiceRegistration<P>,
    ) -> Result<(), ServiceAlreadyRegistered> {
        let name = registration.definition.shared_name();
        if self.index.contains_key(&name) {
            return Err(ServiceAlreadyRegistered { name });
        }

        self.index.insert(name, self.services.len());
        self.services.push(registration);
        Ok(())
    }

    /// Chaining form of [`insert`](Self::insert).
    pub fn with(
        mut self,
        registration: ServiceRegistration<P>,
    ) -> Result<Self, ServiceAlreadyRegistered> {
        self.insert(registration)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceRegistration<P>> {
        self.index.get(name).map(|&i| &self.services[i])
    }

    /// Find the registration and method entry a call addresses.
    pub fn route(
        &self,
        service: &str,
        method: &str,
    ) -> Result<(&ServiceRegistration<P>, &MethodEntry), RouteError> {
        let registration = self.get(service).ok_or_else(|| RouteError::UnknownService {
            service: service.to_string(),
        })?;

        let entry = registration
            .methods()
            .get(method)
            .ok_or_else(|| RouteError::UnknownMethod {
                service: service.to_string(),
                method: method.to_string(),
            })?;

        Ok((registration, entry))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ServiceRegistration<P>> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl<P> Default for ServiceCollection<P> {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            index: HashMap::default(),
        }
    }
}
