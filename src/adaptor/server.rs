use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use super::metadata;
use crate::context::config::ServerConfig;
use crate::duplex_proto::duplex_service_server::{DuplexService, DuplexServiceServer};
use crate::duplex_proto::{
    CallbackItem, CloseReply, CloseRequest, InvokeReply, InvokeRequest, OpenReply, OpenRequest,
    PingReply, PingRequest, PollReply, PollRequest,
};
use crate::peer::{CallbackData, CloseCode, Peer, PeerCollection, PeerError, PollOutcome};
use crate::serializer::Serializer;
use crate::service::{Arguments, RouteError};

/// The tonic service implementing the server half of the session protocol.
pub struct ServerAdaptor {
    peers: Arc<PeerCollection>,
    serializer: Arc<dyn Serializer>,
    poll_timeout: Duration,
}

impl ServerAdaptor {
    pub fn new(
        peers: Arc<PeerCollection>,
        serializer: Arc<dyn Serializer>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            peers,
            serializer,
            poll_timeout,
        }
    }
}

fn peer_status(error: PeerError) -> Status {
    match error {
        PeerError::AlreadyPresent(e) => Status::already_exists(e.to_string()),
        PeerError::NotFound(e) => Status::not_found(e.to_string()),
        PeerError::Instance(e) => Status::internal(e.to_string()),
    }
}

fn route_status(error: RouteError) -> Status {
    Status::unimplemented(error.to_string())
}

impl From<CallbackData> for CallbackItem {
    fn from(callback: CallbackData) -> Self {
        CallbackItem {
            service_name: callback.service_name().to_string(),
            method_name: callback.method_name().to_string(),
            data: callback.data().to_vec(),
        }
    }
}

#[tonic::async_trait]
impl DuplexService for ServerAdaptor {
    type PollStream = Pin<Box<dyn futures::Stream<Item = Result<PollReply, Status>> + Send>>;

    async fn open(&self, request: Request<OpenRequest>) -> Result<Response<OpenReply>, Status> {
        let peer_id = metadata::peer_id(&request)?;
        self.peers.add(peer_id).map_err(peer_status)?;

        Ok(Response::new(OpenReply {}))
    }

    async fn close(&self, request: Request<CloseRequest>) -> Result<Response<CloseReply>, Status> {
        let peer_id = metadata::peer_id(&request)?;
        self.peers
            .remove(peer_id, CloseCode::GRACEFUL)
            .map_err(|e| Status::not_found(e.to_string()))?;

        Ok(Response::new(CloseReply {}))
    }

    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingReply>, Status> {
        let peer_id = metadata::peer_id(&request)?;
        self.peers
            .touch(peer_id)
            .map_err(|e| Status::not_found(e.to_string()))?;

        debug!(peer_id = %peer_id, "Ping");
        Ok(Response::new(PingReply {}))
    }

    async fn invoke(
        &self,
        request: Request<InvokeRequest>,
    ) -> Result<Response<InvokeReply>, Status> {
        let peer_id = metadata::peer_id(&request)?;
        if !self.peers.contains(peer_id) {
            return Err(Status::not_found(format!("peer {peer_id} is not open")));
        }

        let InvokeRequest {
            service_name,
            method_name,
            data,
        } = request.into_inner();

        let instances = self.peers.instances();
        let (_, entry) = instances
            .services()
            .route(&service_name, &method_name)
            .map_err(route_status)?;
        let instance = instances.resolve(peer_id, &service_name).ok_or_else(|| {
            Status::not_found(format!("no {service_name} instance bound for peer {peer_id}"))
        })?;
        let args = Arguments::new(data, Arc::clone(&self.serializer));

        debug!(
            peer_id = %peer_id,
            service = %service_name,
            method = %method_name,
            one_way = entry.descriptor().is_one_way(),
            "Invoke"
        );

        if entry.descriptor().is_one_way() {
            let call = entry.invoke(instance, args, CancellationToken::new());
            tokio::spawn(async move {
                if let Err(err) = call.await {
                    debug!(
                        service = %service_name,
                        method = %method_name,
                        error = %err,
                        "One-way call failed"
                    );
                }
            });
            return Ok(Response::new(InvokeReply::default()));
        }

        // Tonic drops this future when the caller abandons the call, which trips the guard.
        let cancel = CancellationToken::new();
        let _abandoned = cancel.clone().drop_guard();

        let reply = match entry.invoke(instance, args, cancel).await {
            Ok(data) => InvokeReply {
                id: String::new(),
                data,
            },
            Err(err) => {
                debug!(
                    peer_id = %peer_id,
                    service = %service_name,
                    method = %method_name,
                    error = %err,
                    "Remote error"
                );
                let (id, data) = err.to_wire(&*self.serializer);
                InvokeReply { id, data }
            }
        };

        Ok(Response::new(reply))
    }

    async fn poll(
        &self,
        request: Request<Streaming<PollRequest>>,
    ) -> Result<Response<Self::PollStream>, Status> {
        let peer_id = metadata::peer_id(&request)?;
        let peer = self
            .peers
            .lease(peer_id)
            .map_err(|e| Status::not_found(e.to_string()))?;

        if !peer.begin_poll() {
            return Err(Status::failed_precondition(format!(
                "peer {peer_id} already has a poll stream"
            )));
        }
        let mut lease = PollLease::new(Arc::clone(&self.peers), peer);

        let mut inbound = request.into_inner();
        let poll_timeout = self.poll_timeout;

        info!(peer_id = %peer_id, "Poll stream opened");

        let outbound = async_stream::stream! {
            loop {
                match inbound.next().await {
                    Some(Ok(_)) => {}
                    Some(Err(status)) => {
                        warn!(peer_id = %peer_id, error = %status, "Poll stream failed");
                        break;
                    }
                    None => {
                        debug!(peer_id = %peer_id, "Poll stream closed by peer");
                        break;
                    }
                }

                lease.peer.touch();

                match lease.peer.poll(poll_timeout).await {
                    PollOutcome::Closed(code) => {
                        debug!(peer_id = %peer_id, code = %code, "Delivering close code");
                        lease.finished = true;
                        yield Ok(PollReply {
                            code: Some(code.get()),
                            items: Vec::new(),
                        });
                        break;
                    }
                    PollOutcome::Callbacks(batch) => {
                        if !batch.is_empty() {
                            debug!(peer_id = %peer_id, callbacks = batch.len(), "Delivering callbacks");
                        }
                        yield Ok(PollReply {
                            code: None,
                            items: batch.into_iter().map(CallbackItem::from).collect(),
                        });
                    }
                }
            }
        };

        Ok(Response::new(Box::pin(outbound)))
    }
}

/// Holds a peer's poll stream claim for as long as the stream lives.
///
/// A stream that ends for any reason before a close code reached the peer faults the peer out of
/// the session.
struct PollLease {
    peers: Arc<PeerCollection>,
    peer: Arc<Peer>,
    finished: bool,
}

impl PollLease {
    fn new(peers: Arc<PeerCollection>, peer: Arc<Peer>) -> Self {
        Self {
            peers,
            peer,
            finished: false,
        }
    }
}

impl Drop for PollLease {
    fn drop(&mut self) {
        self.peer.end_poll();
        if self.finished {
            return;
        }

        if self.peers.evict(&self.peer, CloseCode::FAULTED) {
            warn!(peer_id = %self.peer.id(), "Poll stream lost, peer evicted");
        }
    }
}

/// A bound and serving transport plus its liveness sweep.
#[derive(Debug)]
pub struct ServerHost {
    local_addr: SocketAddr,
    peers: Arc<PeerCollection>,
    shutdown: CancellationToken,
    serve: JoinHandle<Result<(), tonic::transport::Error>>,
    sweep: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl ServerHost {
    /// Bind `config.endpoint` and start serving the session protocol over `peers`.
    pub async fn start(config: &ServerConfig, peers: Arc<PeerCollection>) -> Result<Self, crate::Error> {
        let listener = TcpListener::bind(config.endpoint).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let service = ServerAdaptor::new(
            Arc::clone(&peers),
            Arc::clone(&config.serializer),
            config.poll_timeout,
        );

        let signal = shutdown.clone();
        let serve = tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(DuplexServiceServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    signal.cancelled().await;
                }),
        );

        let sweep = tokio::spawn(sweep_expired(
            Arc::clone(&peers),
            config.ping_timeout,
            shutdown.clone(),
        ));

        info!(address = %local_addr, "Server listening");

        Ok(Self {
            local_addr,
            peers,
            shutdown,
            serve,
            sweep,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &Arc<PeerCollection> {
        &self.peers
    }

    /// Evict every peer gracefully, then stop the transport.
    ///
    /// Polling clients receive the graceful close code before the transport goes away.
    pub async fn close(self) -> Result<(), crate::Error> {
        self.peers.clear(CloseCode::GRACEFUL);
        self.stop().await
    }

    /// Stop the transport without evicting peers first.
    pub async fn stop(mut self) -> Result<(), crate::Error> {
        self.shutdown.cancel();

        if let Err(err) = (&mut self.sweep).await {
            warn!(error = %err, "Sweep task ended abnormally");
        }

        match tokio::time::timeout(self.shutdown_timeout, &mut self.serve).await {
            Ok(Ok(result)) => result?,
            Ok(Err(err)) => warn!(error = %err, "Serve task ended abnormally"),
            Err(_) => {
                warn!(
                    address = %self.local_addr,
                    timeout = ?self.shutdown_timeout,
                    "Graceful shutdown timed out, aborting transport"
                );
                self.serve.abort();
            }
        }

        info!(address = %self.local_addr, "Server stopped");
        Ok(())
    }

    /// Best-effort teardown for a faulted context.
    pub fn abort(self) {
        self.shutdown.cancel();
        self.sweep.abort();
        self.serve.abort();
    }
}

impl Drop for ServerHost {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Evict peers not seen within `ping_timeout`, checked every `ping_timeout`.
async fn sweep_expired(peers: Arc<PeerCollection>, ping_timeout: Duration, stop: CancellationToken) {
    let mut interval = tokio::time::interval(ping_timeout);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let evicted = peers.evict_expired(Instant::now(), ping_timeout);
                if !evicted.is_empty() {
                    debug!(evicted = evicted.len(), remaining = peers.len(), "Liveness sweep");
                }
            }
        }
    }
}
