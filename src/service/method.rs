use std::any::{Any, type_name};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::RemoteError;
use crate::serializer::Serializer;

/// A type-erased local object that methods are routed to.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// The pending result of a routed call: the serialized return value or a remote error.
pub type MethodFuture = BoxFuture<'static, Result<String, RemoteError>>;

type Invoker = Arc<dyn Fn(Instance, Arguments, CancellationToken) -> MethodFuture + Send + Sync>;

/// Static metadata for one exposed method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    name: Arc<str>,
    parameter_types: Vec<&'static str>,
    return_type: &'static str,
    one_way: bool,
    cancelable: bool,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            parameter_types: Vec::new(),
            return_type: type_name::<()>(),
            one_way: false,
            cancelable: false,
        }
    }

    /// The caller neither waits for nor receives a result or error.
    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    /// The handler observes the caller abandoning the call through its cancellation token.
    pub fn cancelable(mut self) -> Self {
        self.cancelable = true;
        self
    }

    /// Declare the next positional parameter. Once any parameter is declared, calls with a
    /// different argument count are rejected before the handler runs.
    pub fn parameter<T>(mut self) -> Self {
        self.parameter_types.push(type_name::<T>());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter_types(&self) -> &[&'static str] {
        &self.parameter_types
    }

    pub fn return_type(&self) -> &'static str {
        self.return_type
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    pub fn is_cancelable(&self) -> bool {
        self.cancelable
    }

    fn check_arity(&self, args: &Arguments) -> Result<(), RemoteError> {
        let expected = self.parameter_types.len();
        if expected == 0 || expected == args.len() {
            return Ok(());
        }

        Err(RemoteError::validation(format!(
            "method {} expects {expected} argument(s), got {}",
            self.name,
            args.len()
        )))
    }
}

/// Serialized positional arguments of one call, decoded on demand.
#[derive(Debug, Clone)]
pub struct Arguments {
    data: Vec<String>,
    serializer: Arc<dyn Serializer>,
}

impl Arguments {
    pub fn new(data: Vec<String>, serializer: Arc<dyn Serializer>) -> Self {
        Self { data, serializer }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode the argument at `index`. A missing or malformed argument is a validation error.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, RemoteError> {
        let text = self
            .data
            .get(index)
            .ok_or_else(|| RemoteError::validation(format!("missing argument {index}")))?;

        self.serializer
            .decode(text)
            .map_err(|e| RemoteError::validation(format!("argument {index}: {e}")))
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }
}

/// A routable method: its descriptor plus the erased invoker.
#[derive(Clone)]
pub struct MethodEntry {
    descriptor: MethodDescriptor,
    invoker: Invoker,
}

impl std::fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodEntry")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl MethodEntry {
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    /// Run the method against `instance`.
    ///
    /// A panic inside the handler is reported as an application error of kind `panic`.
    pub fn invoke(
        &self,
        instance: Instance,
        args: Arguments,
        cancel: CancellationToken,
    ) -> MethodFuture {
        if let Err(error) = self.descriptor.check_arity(&args) {
            return future::ready(Err(error)).boxed();
        }

        let call = (self.invoker)(instance, args, cancel);
        let method = Arc::clone(&self.descriptor.name);

        async move {
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(method = %method, panic = %message, "Method handler panicked");
                    Err(RemoteError::application("panic", message))
                }
            }
        }
        .boxed()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Explicit dispatch table from method name to [`MethodEntry`] for one service implementation.
///
/// Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: HashMap<Arc<str>, MethodEntry, ahash::RandomState>,
}

impl MethodTable {
    pub fn builder<S: Send + Sync + 'static>() -> MethodTableBuilder<S> {
        MethodTableBuilder {
            methods: HashMap::default(),
            _service: PhantomData,
        }
    }

    pub fn get(&self, method_name: &str) -> Option<&MethodEntry> {
        self.methods.get(method_name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values().map(MethodEntry::descriptor)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Typed builder for a [`MethodTable`] over the service implementation `S`.
pub struct MethodTableBuilder<S> {
    methods: HashMap<Arc<str>, MethodEntry, ahash::RandomState>,
    _service: PhantomData<fn() -> S>,
}

impl<S: Send + Sync + 'static> MethodTableBuilder<S> {
    /// Route `descriptor` to `handler`.
    ///
    /// # Example
    /// ```ignore
    /// MethodTable::builder::<EchoService>()
    ///     .method(MethodDescriptor::new("Echo").parameter::<String>(), |svc, args, _| async move {
    ///         svc.echo(args.get(0)?).await
    ///     })
    ///     .build()
    /// ```
    pub fn method<F, Fut, R>(mut self, descriptor: MethodDescriptor, handler: F) -> Self
    where
        F: Fn(Arc<S>, Arguments, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RemoteError>> + Send + 'static,
        R: Serialize + 'static,
    {
        let descriptor = MethodDescriptor {
            return_type: type_name::<R>(),
            ..descriptor
        };

        let invoker: Invoker = Arc::new(move |instance: Instance, args: Arguments, cancel| {
            let service = match instance.downcast::<S>() {
                Ok(service) => service,
                Err(_) => {
                    return future::ready(Err(RemoteError::application(
                        "instance_mismatch",
                        format!("instance is not a {}", type_name::<S>()),
                    )))
                    .boxed();
                }
            };

            let serializer = Arc::clone(args.serializer());
            let call = handler(service, args, cancel);

            async move {
                let value = call.await?;
                serializer
                    .encode(&value)
                    .map_err(|e| RemoteError::application("serialization", e.to_string()))
            }
            .boxed()
        });

        let name = Arc::clone(&descriptor.name);
        if self
            .methods
            .insert(Arc::clone(&name), MethodEntry { descriptor, invoker })
            .is_some()
        {
            warn!(method = %name, "Method registered twice, keeping the last handler");
        }

        self
    }

    pub fn build(self) -> MethodTable {
        MethodTable {
            methods: self.methods,
        }
    }
}
