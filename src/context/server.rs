use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::ServerConfig;
use super::{ServiceToken, StateNotifier, require};
use crate::Error;
use crate::adaptor::{CallbackProxy, ServerHost};
use crate::peer::{CloseCode, PeerCollection, PeerId};
use crate::service::ServiceCollection;
use crate::state_machine::service_state::{
    ServiceEvent, ServiceState, ServiceStateChanged, ServiceStateMachine,
};

#[derive(Debug)]
struct ServerSession {
    machine: ServiceStateMachine,
    config: ServerConfig,
    token: Option<ServiceToken>,
    peers: Option<Arc<PeerCollection>>,
    host: Option<ServerHost>,
}

#[derive(Debug)]
struct Shared {
    services: Arc<ServiceCollection<CallbackProxy>>,
    session: Mutex<ServerSession>,
    notifier: StateNotifier,
}

/// Hosts a set of services for any number of client peers.
///
/// Cloning yields another handle to the same context.
///
/// # Example
/// ```ignore
/// let server = ServerContext::new(ServerConfig::builder().endpoint(addr).build(), services);
/// let token = server.open(&CancellationToken::new()).await?;
/// // ...
/// server.close(token, &CancellationToken::new()).await?;
/// ```
#[derive(Debug, Clone)]
pub struct ServerContext {
    shared: Arc<Shared>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, services: ServiceCollection<CallbackProxy>) -> Self {
        Self {
            shared: Arc::new(Shared {
                services: Arc::new(services),
                session: Mutex::new(ServerSession {
                    machine: ServiceStateMachine::new(),
                    config,
                    token: None,
                    peers: None,
                    host: None,
                }),
                notifier: StateNotifier::new("server"),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.shared.notifier.state()
    }

    /// Every transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceStateChanged> {
        self.shared.notifier.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ServiceState> {
        self.shared.notifier.watch()
    }

    /// Bind the endpoint, create the session-scoped instances and start serving.
    ///
    /// On failure the context is left [`Faulted`](ServiceState::Faulted) and must be aborted.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<ServiceToken, Error> {
        let mut session = self.shared.session.lock().await;
        let notifier = &self.shared.notifier;
        notifier.drive(&mut session.machine, ServiceEvent::Open, "open")?;

        match self.open_session(&mut session, cancel).await {
            Ok(()) => {
                let token = ServiceToken::generate();
                session.token = Some(token);
                notifier.drive(&mut session.machine, ServiceEvent::Opened, "open")?;
                Ok(token)
            }
            Err(err) => {
                warn!(error = %err, "Server open failed");
                notifier.drive(&mut session.machine, ServiceEvent::Failed, "open")?;
                Err(err)
            }
        }
    }

    async fn open_session(
        &self,
        session: &mut ServerSession,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        session.config.validate()?;

        let peers = Arc::new(PeerCollection::new(
            Arc::clone(&self.shared.services),
            Arc::clone(&session.config.serializer),
        ));
        session.peers = Some(Arc::clone(&peers));
        peers.instances().initialize_instance()?;

        let host = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            host = ServerHost::start(&session.config, peers) => host?,
        };
        session.host = Some(host);

        Ok(())
    }

    /// Evict every peer, stop serving and release the session-scoped instances.
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
                warn!(error = %err, "Server close failed");
                notifier.drive(&mut session.machine, ServiceEvent::Failed, "close")?;
                Err(err)
            }
        }
    }

    async fn close_session(
        session: &mut ServerSession,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(host) = session.host.take() {
            host.close().await?;
        }
        if let Some(peers) = session.peers.take() {
            peers.instances().release_instance()?;
        }

        Ok(())
    }

    /// Best-effort teardown of a faulted context. Always ends [`Closed`](ServiceState::Closed).
    pub async fn abort(&self) -> Result<(), Error> {
        let mut session = self.shared.session.lock().await;
        require(&session.machine, ServiceState::Faulted, "abort")?;

        if let Some(host) = session.host.take() {
            host.abort();
        }
        if let Some(peers) = session.peers.take() {
            peers.clear(CloseCode::FAULTED);
            if let Err(err) = peers.instances().release_instance() {
                info!(error = %err, "No session instances to release");
            }
        }
        session.token = None;

        self.shared
            .notifier
            .drive(&mut session.machine, ServiceEvent::Abort, "abort")?;
        Ok(())
    }

    /// Change the listen address. Only legal while closed.
    pub async fn set_endpoint(&self, endpoint: SocketAddr) -> Result<(), Error> {
        let mut session = self.shared.session.lock().await;
        require(&session.machine, ServiceState::Closed, "set endpoint")?;
        session.config.endpoint = endpoint;
        Ok(())
    }

    /// The bound address while serving.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let session = self.shared.session.lock().await;
        session.host.as_ref().map(ServerHost::local_addr)
    }

    pub async fn peer_count(&self) -> usize {
        let session = self.shared.session.lock().await;
        session.peers.as_ref().map_or(0, |peers| peers.len())
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let session = self.shared.session.lock().await;
        session
            .peers
            .as_ref()
            .map(|peers| peers.ids())
            .unwrap_or_default()
    }

    /// The unique server instance of type `S`, across the session and every peer.
    pub async fn get_service<S: Send + Sync + 'static>(&self) -> Result<Option<Arc<S>>, Error> {
        let session = self.shared.session.lock().await;
        match &session.peers {
            Some(peers) => Ok(peers.instances().get_service::<S>()?),
            None => Ok(None),
        }
    }
}
