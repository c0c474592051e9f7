use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::state_machine::StateMachine;
use crate::state_machine::callback_queue::{CallbackInput, CallbackOutput, CallbackQueueMachine};

pub use self::collection::{PeerCollection, PeerTable};
pub use self::error::{PeerAlreadyPresent, PeerError, PeerEvicted, PeerNotFound};
pub use self::peer_ref::PeerRef;

pub mod collection;
pub mod error;
pub mod peer_ref;

/// Identity of one remote connection.
///
/// Minted by the client context and carried on every call in the peer id header.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for PeerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Reason a peer's session ended, delivered to the client on its poll stream.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct CloseCode(i32);

impl CloseCode {
    /// Client closed, or the server shut down cleanly.
    pub const GRACEFUL: CloseCode = CloseCode(0);
    /// No ping or poll was seen within the liveness window.
    pub const EXPIRED: CloseCode = CloseCode(-1);
    /// The poll stream failed.
    pub const FAULTED: CloseCode = CloseCode(-2);

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub const fn get(self) -> i32 {
        self.0
    }

    pub const fn is_graceful(self) -> bool {
        self.0 == Self::GRACEFUL.0
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An outbound callback event, destined for one peer's poll stream.
///
/// The serialized arguments are shared so a broadcast serializes once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackData {
    service_name: Arc<str>,
    method_name: Arc<str>,
    data: Arc<[String]>,
}

impl CallbackData {
    pub fn new(
        service_name: impl Into<Arc<str>>,
        method_name: impl Into<Arc<str>>,
        data: impl Into<Arc<[String]>>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            data: data.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn data(&self) -> &[String] {
        &self.data
    }
}

/// What a poll cycle found for a peer.
#[derive(Debug)]
pub enum PollOutcome {
    Closed(CloseCode),
    Callbacks(Vec<CallbackData>),
}

/// Server side state of one live connection.
///
/// The queue and the liveness timestamp each sit behind the peer's own lock; nothing here is
/// shared across peers.
pub struct Peer {
    id: PeerId,
    last_seen: Mutex<Instant>,
    queue: Mutex<CallbackQueueMachine>,
    wake: Notify,
    polling: AtomicBool,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("queue", &"<CallbackQueueMachine>")
            .field("polling", &self.polling.load(Ordering::Acquire))
            .finish()
    }
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            last_seen: Mutex::new(Instant::now()),
            queue: Mutex::new(CallbackQueueMachine::new()),
            wake: Notify::new(),
            polling: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Record liveness for this peer.
    pub fn touch(&self) {
        *self.last_seen.lock().expect("peer liveness lock poisoned") = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().expect("peer liveness lock poisoned")
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen()) > timeout
    }

    /// Claim the peer's single poll stream. Fails while another stream holds it.
    pub fn begin_poll(&self) -> bool {
        !self.polling.swap(true, Ordering::AcqRel)
    }

    pub fn end_poll(&self) {
        self.polling.store(false, Ordering::Release);
    }

    pub fn enqueue(&self, callback: CallbackData) {
        self.queue
            .lock()
            .expect("peer queue lock poisoned")
            .process_input(CallbackInput::Enqueue(callback));
        self.wake.notify_one();
    }

    /// Mark the peer closed; its poll stream reports `code` on the next cycle.
    pub fn close(&self, code: CloseCode) {
        self.queue
            .lock()
            .expect("peer queue lock poisoned")
            .process_input(CallbackInput::Close(code));
        self.wake.notify_one();
    }

    pub fn close_code(&self) -> Option<CloseCode> {
        self.queue
            .lock()
            .expect("peer queue lock poisoned")
            .close_code()
    }

    pub fn pending_count(&self) -> usize {
        self.queue
            .lock()
            .expect("peer queue lock poisoned")
            .pending_count()
    }

    /// Take whatever is ready right now, without waiting.
    pub fn try_poll(&self) -> Option<PollOutcome> {
        let output = self
            .queue
            .lock()
            .expect("peer queue lock poisoned")
            .poll_output();

        output.map(|out| match out {
            CallbackOutput::Closed(code) => PollOutcome::Closed(code),
            CallbackOutput::Batch(callbacks) => PollOutcome::Callbacks(callbacks),
        })
    }

    /// Wait for callbacks or a close code, bounded by `timeout`.
    ///
    /// Returns an empty batch when nothing arrived in time.
    pub async fn poll(&self, timeout: Duration) -> PollOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(outcome) = self.try_poll() {
                return outcome;
            }

            // A notify issued between the check above and this wait is kept as a permit.
            if tokio::time::timeout_at(deadline, self.wake.notified())
                .await
                .is_err()
            {
                return self
                    .try_poll()
                    .unwrap_or(PollOutcome::Callbacks(Vec::new()));
            }
        }
    }
}
