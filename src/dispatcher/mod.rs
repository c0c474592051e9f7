//! Single-thread task affinity for stateful services.
//!
//! A [`Dispatcher`] owns one worker thread that runs submitted jobs one at a time, in submission
//! order. A service that keeps mutable state routes every mutation through its own dispatcher and
//! can then touch that state without further locking.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use self::error::DispatcherError;
use crate::service::method::panic_message;

pub mod error;

type Job = Box<dyn FnOnce() + Send + 'static>;
type JobResult<R> = Result<R, Box<dyn Any + Send + 'static>>;

struct Inner {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The worker exits on its own once the queue is closed.
        self.cancel.cancel();
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

/// Handle to a dedicated worker thread. Clones share the same worker.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Start a worker thread named `name`.
    pub fn new(name: impl Into<String>) -> Result<Self, DispatcherError> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let cancel = CancellationToken::new();

        let stop = cancel.clone();
        let worker_name = name.clone();
        let worker = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!(dispatcher = %worker_name, "Dispatcher worker started");
            while let Some(job) = receiver.blocking_recv() {
                // Work still queued at shutdown is discarded.
                if stop.is_cancelled() {
                    break;
                }
                job();
            }
            debug!(dispatcher = %worker_name, "Dispatcher worker stopped");
        })?;

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                worker_id: worker.thread().id(),
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(worker)),
                cancel,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Whether the calling thread is this dispatcher's worker.
    pub fn check_access(&self) -> bool {
        thread::current().id() == self.inner.worker_id
    }

    /// Fail unless called from this dispatcher's worker.
    pub fn verify_access(&self) -> Result<(), DispatcherError> {
        if self.check_access() {
            Ok(())
        } else {
            Err(DispatcherError::AccessViolation)
        }
    }

    fn enqueue(&self, job: Job) -> Result<(), DispatcherError> {
        if self.is_disposed() {
            return Err(DispatcherError::Disposed);
        }

        let sender = self.inner.sender.lock().expect("dispatcher sender lock poisoned");
        sender
            .as_ref()
            .ok_or(DispatcherError::Disposed)?
            .send(job)
            .map_err(|_| DispatcherError::Disposed)
    }

    /// Run `f` on the worker and block until it completes.
    ///
    /// Called from the worker itself, `f` runs inline. This blocks the calling thread; from
    /// asynchronous code use [`invoke_async`](Self::invoke_async).
    pub fn invoke<F, R>(&self, f: F) -> Result<R, DispatcherError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_disposed() {
            return Err(DispatcherError::Disposed);
        }

        if self.check_access() {
            return catch_unwind(AssertUnwindSafe(f))
                .map_err(|panic| DispatcherError::Panicked(panic_message(panic.as_ref())));
        }

        let (reply, result) = std::sync::mpsc::sync_channel::<JobResult<R>>(1);
        self.enqueue(Box::new(move || {
            let _ = reply.send(catch_unwind(AssertUnwindSafe(f)));
        }))?;

        match result.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(DispatcherError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(DispatcherError::Disposed),
        }
    }

    /// Queue `f` and return a handle that resolves with its result, without blocking.
    pub fn invoke_async<F, R>(&self, f: F) -> DispatchHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel::<JobResult<R>>();

        // A rejected job drops `reply`, which resolves the handle as disposed.
        let _ = self.enqueue(Box::new(move || {
            let _ = reply.send(catch_unwind(AssertUnwindSafe(f)));
        }));

        DispatchHandle { receiver }
    }

    /// Queue `f` without observing its outcome.
    pub fn post<F>(&self, f: F) -> Result<(), DispatcherError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = self.inner.name.clone();
        self.enqueue(Box::new(move || {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
                warn!(dispatcher = %name, panic = %panic_message(panic.as_ref()), "Posted job panicked");
            }
        }))
    }

    /// Stop accepting work, discard what is queued and join the worker.
    ///
    /// A second shutdown is an error.
    pub fn shutdown(&self) -> Result<(), DispatcherError> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Err(DispatcherError::AlreadyDisposed);
        }

        self.inner.cancel.cancel();
        self.inner
            .sender
            .lock()
            .expect("dispatcher sender lock poisoned")
            .take();

        let worker = self
            .inner
            .worker
            .lock()
            .expect("dispatcher worker lock poisoned")
            .take();

        // Joining from the worker itself would never return.
        if let Some(worker) = worker.filter(|_| !self.check_access()) {
            if worker.join().is_err() {
                warn!(dispatcher = %self.inner.name, "Dispatcher worker panicked");
            }
        }

        debug!(dispatcher = %self.inner.name, "Dispatcher shut down");
        Ok(())
    }
}

/// Pending result of [`Dispatcher::invoke_async`].
#[must_use = "the job runs regardless, but its result is only observed by awaiting the handle"]
pub struct DispatchHandle<R> {
    receiver: oneshot::Receiver<JobResult<R>>,
}

impl<R> Future for DispatchHandle<R> {
    type Output = Result<R, DispatcherError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(DispatcherError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(DispatcherError::Disposed),
        })
    }
}
