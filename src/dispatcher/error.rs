/// Indicates that work could not be run, or did not complete, on a dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("the dispatcher has been shut down")]
    Disposed,

    #[error("the calling thread is not the dispatcher's worker")]
    AccessViolation,

    #[error("the dispatched job panicked: {0}")]
    Panicked(String),

    #[error("the dispatcher was already shut down")]
    AlreadyDisposed,

    #[error("failed to start the dispatcher worker")]
    Spawn(#[from] std::io::Error),
}
