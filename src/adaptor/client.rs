use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Streaming;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use super::metadata;
use crate::context::config::ClientConfig;
use crate::duplex_proto::duplex_service_client::DuplexServiceClient;
use crate::duplex_proto::{
    CallbackItem, CloseRequest, InvokeReply, InvokeRequest, OpenRequest, PingRequest, PollReply,
    PollRequest,
};
use crate::instance::{Disposable, InstanceContext};
use crate::peer::{CloseCode, PeerId};
use crate::serializer::{EncodeArgs, Serializer};
use crate::service::{Arguments, RemoteError, ServiceCollection};
use crate::Error;

/// A header-stamped handle on the transport, shared by the adaptor and every stub.
#[derive(Clone)]
struct Caller {
    client: DuplexServiceClient<Channel>,
    header: AsciiMetadataValue,
    serializer: Arc<dyn Serializer>,
}

impl Caller {
    async fn open(&self) -> Result<(), Error> {
        let mut client = self.client.clone();
        client
            .open(metadata::attach(OpenRequest {}, &self.header))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let mut client = self.client.clone();
        client
            .close(metadata::attach(CloseRequest {}, &self.header))
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), Error> {
        let mut client = self.client.clone();
        client
            .ping(metadata::attach(PingRequest {}, &self.header))
            .await?;
        Ok(())
    }

    async fn invoke(&self, service: &str, method: &str, data: Vec<String>) -> Result<InvokeReply, Error> {
        let mut client = self.client.clone();
        let request = InvokeRequest {
            service_name: service.to_string(),
            method_name: method.to_string(),
            data,
        };
        let reply = client
            .invoke(metadata::attach(request, &self.header))
            .await?
            .into_inner();
        Ok(reply)
    }

    async fn poll(&self, requests: mpsc::Receiver<PollRequest>) -> Result<Streaming<PollReply>, Error> {
        let mut client = self.client.clone();
        let replies = client
            .poll(metadata::attach(ReceiverStream::new(requests), &self.header))
            .await?
            .into_inner();
        Ok(replies)
    }
}

/// Client side handle for calling one server service.
///
/// Every call is asynchronous; `R = ()` is the void form. Once the binding that owns the stub is
/// torn down every call fails with [`Error::Released`].
#[derive(Clone)]
pub struct ServiceStub {
    service: Arc<str>,
    caller: Caller,
    released: Arc<AtomicBool>,
}

impl fmt::Debug for ServiceStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceStub")
            .field("service", &self.service)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ServiceStub {
    fn new(service: Arc<str>, caller: Caller) -> Self {
        Self {
            service,
            caller,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Call `method` and wait for its result.
    ///
    /// A server method that failed surfaces as [`Error::Remote`] with the same kind and message.
    pub async fn invoke<R, A>(&self, method: &str, args: A) -> Result<R, Error>
    where
        R: DeserializeOwned,
        A: EncodeArgs,
    {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::Released);
        }

        let serializer = &*self.caller.serializer;
        let data = args.encode_args(serializer)?;
        let reply = self.caller.invoke(&self.service, method, data).await?;

        if !reply.id.is_empty() {
            return Err(RemoteError::from_wire(&reply.id, &reply.data, serializer).into());
        }

        // One-way methods reply without a value.
        let text = match reply.data.as_str() {
            "" => "null",
            text => text,
        };
        Ok(serializer.decode(text)?)
    }

    /// Fire `method` without observing its outcome. Every error is swallowed.
    pub async fn invoke_one_way<A: EncodeArgs>(&self, method: &str, args: A) {
        if let Err(err) = self.invoke::<serde_json::Value, A>(method, args).await {
            debug!(service = %self.service, method = %method, error = %err, "One-way call failed");
        }
    }

    /// Call `method`, abandoning it when `cancel` fires.
    ///
    /// Abandoning drops the transport call, which in turn cancels the server handler's token.
    pub async fn invoke_cancelable<R, A>(
        &self,
        method: &str,
        args: A,
        cancel: &CancellationToken,
    ) -> Result<R, Error>
    where
        R: DeserializeOwned,
        A: EncodeArgs,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.invoke(method, args) => result,
        }
    }
}

impl Disposable for ServiceStub {
    fn dispose(&self) {
        self.released.store(true, Ordering::Release);
    }
}

/// The client half of the session protocol.
///
/// Owns the transport channel, the local callback instances, and, while open, the poll and ping
/// loops. A lost session is reported once on [`disconnected`](Self::disconnected).
pub struct ClientAdaptor {
    peer_id: PeerId,
    caller: Caller,
    instances: Arc<InstanceContext<ServiceStub>>,
    receive_timeout: Duration,
    ping_interval: Duration,
    stop: CancellationToken,
    closing: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disconnected: Arc<watch::Sender<Option<CloseCode>>>,
}

impl fmt::Debug for ClientAdaptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAdaptor")
            .field("peer_id", &self.peer_id)
            .field("instances", &self.instances)
            .finish_non_exhaustive()
    }
}

impl ClientAdaptor {
    /// Prepare a lazily connected channel to `config.endpoint`. Nothing is sent until
    /// [`open`](Self::open).
    pub fn new(
        peer_id: PeerId,
        config: &ClientConfig,
        services: Arc<ServiceCollection<ServiceStub>>,
    ) -> Result<Self, Error> {
        let channel = Endpoint::from_shared(format!("http://{}", config.endpoint))?
            .connect_timeout(config.connect_timeout)
            .connect_lazy();

        let caller = Caller {
            client: DuplexServiceClient::new(channel),
            header: metadata::header_value(peer_id)?,
            serializer: Arc::clone(&config.serializer),
        };

        let binder = caller.clone();
        let instances = InstanceContext::new(services, move |definition, _| {
            ServiceStub::new(definition.shared_name(), binder.clone())
        });

        Ok(Self {
            peer_id,
            caller,
            instances: Arc::new(instances),
            receive_timeout: config.receive_timeout,
            ping_interval: config.ping_interval,
            stop: CancellationToken::new(),
            closing: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            disconnected: Arc::new(watch::Sender::new(None)),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn instances(&self) -> &Arc<InstanceContext<ServiceStub>> {
        &self.instances
    }

    /// A stub for the server service `service`.
    pub fn stub(&self, service: &str) -> ServiceStub {
        ServiceStub::new(service.into(), self.caller.clone())
    }

    /// Observe the close code of a session the server ended, or that failed.
    pub fn disconnected(&self) -> watch::Receiver<Option<CloseCode>> {
        self.disconnected.subscribe()
    }

    /// Handshake, bind the local callback instances, then start the poll and ping loops.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<(), Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.caller.open() => result?,
        }

        self.instances.create_instance(self.peer_id)?;

        let (requests, outbound) = mpsc::channel(1);
        // The server answers each request with exactly one reply.
        let _ = requests.send(PollRequest {}).await;

        let replies = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(self.receive_timeout, self.caller.poll(outbound)) => result??,
        };

        let poll = tokio::spawn(poll_loop(PollLoop {
            peer_id: self.peer_id,
            replies,
            requests,
            instances: Arc::clone(&self.instances),
            serializer: Arc::clone(&self.caller.serializer),
            receive_timeout: self.receive_timeout,
            stop: self.stop.clone(),
            closing: self.closing.clone(),
            disconnected: Arc::clone(&self.disconnected),
        }));
        let ping = tokio::spawn(ping_loop(
            self.caller.clone(),
            self.ping_interval,
            self.stop.clone(),
        ));

        self.tasks
            .lock()
            .expect("adaptor task lock poisoned")
            .extend([poll, ping]);

        info!(peer_id = %self.peer_id, "Client session opened");
        Ok(())
    }

    /// Close the handshake, stop the loops and release the local callback instances.
    ///
    /// The poll stream stays up until the server has removed this peer, so the server never sees
    /// it fail mid-session.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.closing.cancel();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.caller.close() => result?,
        }

        self.stop_loops().await;
        self.instances.destroy_instance(self.peer_id)?;
        info!(peer_id = %self.peer_id, "Client session closed");
        Ok(())
    }

    /// Tear down locally without telling the server, for a session that is already gone.
    pub async fn shutdown(&self) {
        self.stop_loops().await;

        if let Err(err) = self.instances.destroy_instance(self.peer_id) {
            warn!(peer_id = %self.peer_id, error = %err, "Failed to destroy callback instances");
        }
    }

    async fn stop_loops(&self) {
        self.stop.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("adaptor task lock poisoned"));
        for task in tasks {
            if let Err(err) = task.await {
                warn!(peer_id = %self.peer_id, error = %err, "Client loop ended abnormally");
            }
        }
    }
}

impl Drop for ClientAdaptor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct PollLoop {
    peer_id: PeerId,
    replies: Streaming<PollReply>,
    requests: mpsc::Sender<PollRequest>,
    instances: Arc<InstanceContext<ServiceStub>>,
    serializer: Arc<dyn Serializer>,
    receive_timeout: Duration,
    stop: CancellationToken,
    closing: CancellationToken,
    disconnected: Arc<watch::Sender<Option<CloseCode>>>,
}

async fn poll_loop(mut state: PollLoop) {
    let code = loop {
        let next = tokio::select! {
            _ = state.stop.cancelled() => return,
            next = tokio::time::timeout(state.receive_timeout, state.replies.message()) => next,
        };

        let reply = match next {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => {
                warn!(peer_id = %state.peer_id, "Poll stream ended without a close code");
                break CloseCode::FAULTED;
            }
            Ok(Err(status)) => {
                warn!(peer_id = %state.peer_id, error = %status, "Poll stream failed");
                break CloseCode::FAULTED;
            }
            Err(_) => {
                warn!(peer_id = %state.peer_id, timeout = ?state.receive_timeout, "Poll reply timed out");
                break CloseCode::FAULTED;
            }
        };

        if let Some(code) = reply.code {
            break CloseCode::new(code);
        }

        for item in reply.items {
            dispatch_callback(&state, item);
        }

        if state.requests.send(PollRequest {}).await.is_err() {
            break CloseCode::FAULTED;
        }
    };

    // The server is answering our own close.
    if state.closing.is_cancelled() || state.stop.is_cancelled() {
        debug!(peer_id = %state.peer_id, code = %code, "Poll loop finished");
        return;
    }

    info!(peer_id = %state.peer_id, code = %code, "Disconnected");
    state.disconnected.send_replace(Some(code));
}

/// Run one callback on its own task; callbacks never hold up the poll loop.
fn dispatch_callback(state: &PollLoop, item: CallbackItem) {
    let CallbackItem {
        service_name,
        method_name,
        data,
    } = item;

    let entry = match state
        .instances
        .services()
        .route(&service_name, &method_name)
    {
        Ok((_, entry)) => entry.clone(),
        Err(err) => {
            warn!(peer_id = %state.peer_id, error = %err, "Dropping unroutable callback");
            return;
        }
    };
    let Some(instance) = state.instances.resolve(state.peer_id, &service_name) else {
        warn!(peer_id = %state.peer_id, service = %service_name, "No callback instance bound");
        return;
    };

    let call = entry.invoke(
        instance,
        Arguments::new(data, Arc::clone(&state.serializer)),
        CancellationToken::new(),
    );

    debug!(service = %service_name, method = %method_name, "Dispatching callback");
    tokio::spawn(async move {
        if let Err(err) = call.await {
            warn!(service = %service_name, method = %method_name, error = %err, "Callback failed");
        }
    });
}

async fn ping_loop(caller: Caller, period: Duration, stop: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }

        // A ping the server never answers must not keep the loop from stopping.
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = tokio::time::timeout(period, caller.ping()) => match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "Ping failed"),
                Err(_) => debug!(timeout = ?period, "Ping timed out"),
            },
        }
    }
}
