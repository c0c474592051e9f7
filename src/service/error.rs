use std::sync::Arc;

/// Indicates that a service could not be registered because the name is already taken.
#[derive(Debug, thiserror::Error)]
#[error("the service name ({name}) is already registered")]
pub struct ServiceAlreadyRegistered {
    pub name: Arc<str>,
}

/// Indicates that a call could not be routed to a registered method.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no service named ({service}) is registered")]
    UnknownService { service: String },

    #[error("service ({service}) has no method named ({method})")]
    UnknownMethod { service: String, method: String },
}
