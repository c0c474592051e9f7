use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::ClientConfig;
use super::{ServiceToken, StateNotifier, require};
use crate::Error;
use crate::adaptor::{ClientAdaptor, ServiceStub};
use crate::peer::{CloseCode, PeerId};
use crate::service::ServiceCollection;
use crate::state_machine::service_state::{
    ServiceEvent, ServiceState, ServiceStateChanged, ServiceStateMachine,
};

#[derive(Debug)]
struct ClientSession {
    machine: ServiceStateMachine,
    config: ClientConfig,
    token: Option<ServiceToken>,
    adaptor: Option<Arc<ClientAdaptor>>,
    watcher: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Shared {
    id: PeerId,
    services: Arc<ServiceCollection<ServiceStub>>,
    session: Mutex<ClientSession>,
    notifier: StateNotifier,
}

/// One client connection to a server, with the callback handlers it exposes.
///
/// The context's id is the peer id the server knows it by. If the server ends the session, or the
/// poll loop fails, the context moves to [`Closed`](ServiceState::Closed) on its own.
#[derive(Debug, Clone)]
pub struct ClientContext {
    shared: Arc<Shared>,
}

impl ClientContext {
    /// `callbacks` are the local handlers for server pushes; their factories receive a stub back
    /// to the server service of the same name.
    pub fn new(config: ClientConfig, callbacks: ServiceCollection<ServiceStub>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: PeerId::generate(),
                services: Arc::new(callbacks),
                session: Mutex::new(ClientSession {
                    machine: ServiceStateMachine::new(),
                    config,
                    token: None,
                    adaptor: None,
                    watcher: None,
                }),
                notifier: StateNotifier::new("client"),
            }),
        }
    }

    pub fn id(&self) -> PeerId {
        self.shared.id
    }

    pub fn state(&self) -> ServiceState {
        self.shared.notifier.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceStateChanged> {
        self.shared.notifier.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ServiceState> {
        self.shared.notifier.watch()
    }

    /// Connect, handshake and start receiving callbacks.
    ///
    /// On failure the context is left [`Faulted`](ServiceState::Faulted) and must be aborted.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<ServiceToken, Error> {
        let mut session = self.shared.session.lock().await;
        let notifier = &self.shared.notifier;
        notifier.drive(&mut session.machine, ServiceEvent::Open, "open")?;

        let token = ServiceToken::generate();
        match self.open_session(&mut session, token, cancel).await {
            Ok(()) => {
                session.token = Some(token);
                notifier.drive(&mut session.machine, ServiceEvent::Opened, "open")?;
                Ok(token)
            }
            Err(err) => {
                warn!(peer_id = %self.shared.id, error = %err, "Client open failed");
                notifier.drive(&mut session.machine, ServiceEvent::Failed, "open")?;
                Err(err)
            }
        }
    }

    async fn open_session(
        &self,
        session: &mut ClientSession,
        token: ServiceToken,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        session.config.validate()?;

        let adaptor = Arc::new(ClientAdaptor::new(
            self.shared.id,
            &session.config,
            Arc::clone(&self.shared.services),
        )?);
        session.adaptor = Some(Arc::clone(&adaptor));

        adaptor.instances().initialize_instance()?;
        adaptor.open(cancel).await?;

        session.watcher = Some(tokio::spawn(watch_disconnect(
            Arc::downgrade(&self.shared),
            adaptor.disconnected(),
            token,
        )));

        Ok(())
    }

    /// Close the handshake and release the local callback instances.
    ///
    /// `token` must be the one returned by the matching [`open`](Self::open).
    pub async fn close(&self, token: ServiceToken, cancel: &CancellationToken) -> Result<(), Error> {
        let mut session = self.shared.session.lock().await;
        require(&session.machine, ServiceState::Open, "close")?;
        if session.token != Some(token) {
            return Err(Error::InvalidToken);
        }

        let notifier = &self.shared.notifier;
        notifier.drive(&mut session.machine, ServiceEvent::Close, "close")?;

        match Self::close_session(&mut session, cancel).await {
            Ok(()) => {
                session.token = None;
                notifier.drive(&mut session.machine, ServiceEvent::Closed, "close")?;
                Ok(())
            }
            Err(err) => {
                warn!(peer_id = %self.shared.id, error = %err, "Client close failed");
                notifier.drive(&mut session.machine, ServiceEvent::Failed, "close")?;
                Err(err)
            }
        }
    }

    async fn close_session(
        session: &mut ClientSession,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if let Some(watcher) = session.watcher.take() {
            watcher.abort();
        }

        if let Some(adaptor) = &session.adaptor {
            adaptor.close(cancel).await?;
            adaptor.instances().release_instance()?;
        }
        session.adaptor = None;

        Ok(())
    }

    /// Best-effort teardown of a faulted context. Always ends [`Closed`](ServiceState::Closed).
    pub async fn abort(&self) -> Result<(), Error> {
        let mut session = self.shared.session.lock().await;
        require(&session.machine, ServiceState::Faulted, "abort")?;

        if let Some(watcher) = session.watcher.take() {
            watcher.abort();
        }
        if let Some(adaptor) = session.adaptor.take() {
            teardown(&adaptor).await;
        }
        session.token = None;

        self.shared
            .notifier
            .drive(&mut session.machine, ServiceEvent::Abort, "abort")?;
        Ok(())
    }

    /// Change the server address. Only legal while closed.
    pub async fn set_endpoint(&self, endpoint: SocketAddr) -> Result<(), Error> {
        let mut session = self.shared.session.lock().await;
        require(&session.machine, ServiceState::Closed, "set endpoint")?;
        session.config.endpoint = endpoint;
        Ok(())
    }

    /// A stub for calling the server service `service` on the open session.
    pub async fn stub(&self, service: &str) -> Result<ServiceStub, Error> {
        let session = self.shared.session.lock().await;
        match (&session.adaptor, session.machine.state()) {
            (Some(adaptor), ServiceState::Open) => Ok(adaptor.stub(service)),
            (_, state) => Err(Error::InvalidState {
                operation: "create a stub",
                state,
            }),
        }
    }
}

async fn teardown(adaptor: &ClientAdaptor) {
    adaptor.shutdown().await;
    if let Err(err) = adaptor.instances().release_instance() {
        info!(peer_id = %adaptor.peer_id(), error = %err, "No session instances to release");
    }
}

/// Move the context through `Closing` to `Closed` when the adaptor reports the session lost.
async fn watch_disconnect(
    shared: Weak<Shared>,
    mut disconnected: watch::Receiver<Option<CloseCode>>,
    token: ServiceToken,
) {
    let code = loop {
        if let Some(code) = *disconnected.borrow_and_update() {
            break code;
        }
        if disconnected.changed().await.is_err() {
            return;
        }
    };

    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut session = shared.session.lock().await;

    // Closed or reopened while this watcher waited for the lock.
    if session.token != Some(token) || session.machine.state() != ServiceState::Open {
        return;
    }

    let notifier = &shared.notifier;
    if let Err(err) = notifier.drive(&mut session.machine, ServiceEvent::Disconnected, "disconnect") {
        warn!(peer_id = %shared.id, error = %err, "Disconnect rejected");
        return;
    }

    info!(peer_id = %shared.id, code = %code, "Session ended by the server");
    session.watcher = None;
    if let Some(adaptor) = session.adaptor.take() {
        teardown(&adaptor).await;
    }
    session.token = None;

    if let Err(err) = notifier.drive(&mut session.machine, ServiceEvent::Closed, "disconnect") {
        warn!(peer_id = %shared.id, error = %err, "Disconnect teardown rejected");
    }
}
