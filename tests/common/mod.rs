//! Shared services and session helpers for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::cell::Cell;
use std::time::Duration;

use duplex_rpc::{
    CallbackProxy, ClientConfig, ClientContext, Dispatcher, MethodDescriptor, MethodTable,
    PEER_ID_HEADER, PeerId, RemoteError, ServerConfig, ServerContext, ServiceCollection,
    ServiceDefinition, ServiceRegistration, ServiceStub, ServiceToken,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::metadata::AsciiMetadataValue;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub const SERVER_POLL_TIMEOUT: Duration = Duration::from_millis(200);
pub const CLIENT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on any single wait in the tests.
pub const PATIENCE: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// `Echo(String) -> String`, plus a one-way `Notify` that always fails.
pub struct EchoService {
    pub calls: AtomicUsize,
}

/// Fails in each of the remote error kinds on request.
pub struct FaultyService;

/// Session-scoped: pushes to every connected peer.
pub struct Ticker {
    proxy: CallbackProxy,
}

/// Per-peer: one instance per connected client.
pub struct Session {
    pub id: Uuid,
    proxy: CallbackProxy,
}

thread_local! {
    /// Only ever touched on a counter dispatcher's worker thread, one per server.
    static COUNT: Cell<u64> = const { Cell::new(0) };
}

/// Increments a counter owned by its dispatcher's worker.
pub struct Counter {
    dispatcher: Dispatcher,
}

impl Counter {
    fn new() -> Self {
        Self {
            dispatcher: Dispatcher::new("counter").expect("spawn counter dispatcher"),
        }
    }
}

fn send_error(err: duplex_rpc::Error) -> RemoteError {
    RemoteError::application("callback", err.to_string())
}

pub fn server_services() -> ServiceCollection<CallbackProxy> {
    let echo: ServiceRegistration<CallbackProxy> = ServiceRegistration::new(
        ServiceDefinition::new("Echo"),
        MethodTable::builder::<EchoService>()
            .method(
                MethodDescriptor::new("Echo").parameter::<String>(),
                |svc, args, _| async move {
                    svc.calls.fetch_add(1, Ordering::SeqCst);
                    args.get::<String>(0)
                },
            )
            .method(
                MethodDescriptor::new("Notify").parameter::<String>().one_way(),
                |svc, _args, _| async move {
                    svc.calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RemoteError::application("ArgumentException", "one-way failure"))
                },
            )
            .method(MethodDescriptor::new("Calls"), |svc, _args, _| async move {
                Ok(svc.calls.load(Ordering::SeqCst))
            })
            .method(
                MethodDescriptor::new("Wait").cancelable(),
                |_svc, _args, cancel| async move {
                    cancel.cancelled().await;
                    Ok(())
                },
            )
            .build(),
        |_| EchoService {
            calls: AtomicUsize::new(0),
        },
    );

    let faulty: ServiceRegistration<CallbackProxy> = ServiceRegistration::new(
        ServiceDefinition::new("Faulty"),
        MethodTable::builder::<FaultyService>()
            .method(
                MethodDescriptor::new("Check").parameter::<String>(),
                |_svc, args, _| async move {
                    let input: String = args.get(0)?;
                    match input.as_str() {
                        "bad" => Err(RemoteError::validation("bad")),
                        "secret" => Err(RemoteError::permission_denied("no access")),
                        "missing" => Err(RemoteError::not_found("no such thing")),
                        "argument" => Err(RemoteError::application("ArgumentException", "bad")
                            .with_payload(serde_json::json!({ "param": "input" }))),
                        _ => Ok(input),
                    }
                },
            )
            .method(MethodDescriptor::new("Panic"), |_svc, _args, _| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(())
            })
            .build(),
        |_| FaultyService,
    );

    let ticker: ServiceRegistration<CallbackProxy> = ServiceRegistration::new(
        ServiceDefinition::new("Ticker"),
        MethodTable::builder::<Ticker>()
            .method(
                MethodDescriptor::new("Broadcast").parameter::<u32>(),
                |svc, args, _| async move {
                    let tick: u32 = args.get(0)?;
                    svc.proxy.send("OnTick", (tick,)).map_err(send_error)
                },
            )
            .build(),
        |proxy| Ticker { proxy },
    );

    let session: ServiceRegistration<CallbackProxy> = ServiceRegistration::new(
        ServiceDefinition::new("Session").per_peer(),
        MethodTable::builder::<Session>()
            .method(MethodDescriptor::new("Id"), |svc, _args, _| async move {
                Ok(svc.id.to_string())
            })
            .method(
                MethodDescriptor::new("Pair")
                    .parameter::<u32>()
                    .parameter::<u32>(),
                |svc, args, _| async move {
                    let first: u32 = args.get(0)?;
                    let second: u32 = args.get(1)?;
                    svc.proxy.send("OnTick", (first,)).map_err(send_error)?;
                    svc.proxy.send("OnTick", (second,)).map_err(send_error)
                },
            )
            .build(),
        |proxy| Session {
            id: Uuid::new_v4(),
            proxy,
        },
    );

    let counter: ServiceRegistration<CallbackProxy> = ServiceRegistration::new(
        ServiceDefinition::new("Counter"),
        MethodTable::builder::<Counter>()
            .method(MethodDescriptor::new("Increment"), |svc, _args, _| async move {
                let dispatcher = svc.dispatcher.clone();
                svc.dispatcher
                    .invoke_async(move || {
                        dispatcher.verify_access()?;
                        let count = COUNT.with(|count| {
                            count.set(count.get() + 1);
                            count.get()
                        });
                        Ok::<_, duplex_rpc::DispatcherError>(count)
                    })
                    .await
                    .and_then(|result| result)
                    .map_err(|e| RemoteError::application("dispatcher", e.to_string()))
            })
            .build(),
        |_| Counter::new(),
    );

    [echo, faulty, ticker, session, counter]
        .into_iter()
        .try_fold(ServiceCollection::new(), ServiceCollection::with)
        .expect("unique service names")
}

/// Client side handler for `OnTick`, reporting each tick on a channel.
pub struct TickHandler {
    ticks: mpsc::UnboundedSender<u32>,
}

fn tick_handler(
    name: &str,
    ticks: mpsc::UnboundedSender<u32>,
) -> ServiceRegistration<ServiceStub> {
    ServiceRegistration::new(
        ServiceDefinition::new(name),
        MethodTable::builder::<TickHandler>()
            .method(
                MethodDescriptor::new("OnTick").parameter::<u32>(),
                |handler, args, _| async move {
                    let tick: u32 = args.get(0)?;
                    let _ = handler.ticks.send(tick);
                    Ok(())
                },
            )
            .build(),
        move |_stub: ServiceStub| TickHandler {
            ticks: ticks.clone(),
        },
    )
}

pub fn client_callbacks(ticks: mpsc::UnboundedSender<u32>) -> ServiceCollection<ServiceStub> {
    ServiceCollection::new()
        .with(tick_handler("Ticker", ticks.clone()))
        .and_then(|callbacks| callbacks.with(tick_handler("Session", ticks)))
        .expect("unique callback names")
}

pub fn server_config() -> ServerConfig {
    ServerConfig::builder()
        .endpoint(SocketAddr::from(([127, 0, 0, 1], 0)))
        .poll_timeout(SERVER_POLL_TIMEOUT)
        .shutdown_timeout(Duration::from_secs(2))
        .build()
}

pub fn client_config(endpoint: SocketAddr) -> ClientConfig {
    ClientConfig::builder()
        .endpoint(endpoint)
        .ping_interval(Duration::from_secs(1))
        .receive_timeout(CLIENT_RECEIVE_TIMEOUT)
        .connect_timeout(Duration::from_secs(2))
        .build()
}

pub struct OpenServer {
    pub context: ServerContext,
    pub token: ServiceToken,
    pub addr: SocketAddr,
}

pub async fn open_server() -> OpenServer {
    let context = ServerContext::new(server_config(), server_services());
    let token = context
        .open(&CancellationToken::new())
        .await
        .expect("server opens");
    let addr = context.local_addr().await.expect("server is bound");

    OpenServer {
        context,
        token,
        addr,
    }
}

pub struct OpenClient {
    pub context: ClientContext,
    pub token: ServiceToken,
    pub ticks: mpsc::UnboundedReceiver<u32>,
}

pub async fn open_client(addr: SocketAddr) -> OpenClient {
    let (sender, ticks) = mpsc::unbounded_channel();
    let context = ClientContext::new(client_config(addr), client_callbacks(sender));
    let token = context
        .open(&CancellationToken::new())
        .await
        .expect("client opens");

    OpenClient {
        context,
        token,
        ticks,
    }
}

/// Tag a raw protocol request with the calling peer.
pub fn with_peer<T>(peer_id: PeerId, mut request: Request<T>) -> Request<T> {
    let header = AsciiMetadataValue::from_str(&peer_id.to_string()).unwrap();
    request.metadata_mut().insert(PEER_ID_HEADER, header);
    request
}

/// Wait until `check` holds, polling every few milliseconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
