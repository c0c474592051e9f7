mod common;

use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use duplex_rpc::duplex_proto::duplex_service_client::DuplexServiceClient;
use duplex_rpc::duplex_proto::duplex_service_server::{DuplexService, DuplexServiceServer};
use duplex_rpc::duplex_proto::{
    CloseReply, CloseRequest, InvokeReply, InvokeRequest, OpenReply, OpenRequest, PingReply,
    PingRequest, PollReply, PollRequest,
};
use duplex_rpc::{
    ClientConfig, ClientContext, ConfigError, Error, PeerId, ServerConfig, ServerContext,
    ServiceState, ServiceStateChanged,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use common::{
    CLIENT_RECEIVE_TIMEOUT, PATIENCE, client_callbacks, eventually, open_server, server_config,
    with_peer,
};

/// What a misbehaving server stops answering.
#[derive(Debug, Clone, Copy)]
enum Stall {
    /// Pings hang forever; the poll stream ends the session shortly after it starts.
    Ping,
    /// The poll stream answers the first request and then goes silent.
    Poll,
}

const EXPIRE_AFTER: Duration = Duration::from_millis(500);

struct StalledServer {
    stall: Stall,
}

#[tonic::async_trait]
impl DuplexService for StalledServer {
    type PollStream = Pin<Box<dyn futures::Stream<Item = Result<PollReply, Status>> + Send>>;

    async fn open(&self, _request: Request<OpenRequest>) -> Result<Response<OpenReply>, Status> {
        Ok(Response::new(OpenReply {}))
    }

    async fn close(&self, _request: Request<CloseRequest>) -> Result<Response<CloseReply>, Status> {
        Ok(Response::new(CloseReply {}))
    }

    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingReply>, Status> {
        if let Stall::Ping = self.stall {
            std::future::pending::<()>().await;
        }
        Ok(Response::new(PingReply {}))
    }

    async fn invoke(
        &self,
        _request: Request<InvokeRequest>,
    ) -> Result<Response<InvokeReply>, Status> {
        Err(Status::unimplemented("no services"))
    }

    async fn poll(
        &self,
        request: Request<Streaming<PollRequest>>,
    ) -> Result<Response<Self::PollStream>, Status> {
        let mut inbound = request.into_inner();
        let stall = self.stall;

        let outbound = async_stream::stream! {
            if matches!(inbound.message().await, Ok(Some(_))) {
                yield Ok(PollReply::default());

                match stall {
                    Stall::Ping => {
                        tokio::time::sleep(EXPIRE_AFTER).await;
                        yield Ok(PollReply {
                            code: Some(-1),
                            items: Vec::new(),
                        });
                    }
                    Stall::Poll => std::future::pending::<()>().await,
                }
            }
        };

        Ok(Response::new(Box::pin(outbound)))
    }
}

async fn serve_stalled(stall: Stall) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(DuplexServiceServer::new(StalledServer { stall }))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    addr
}

fn fast_client(addr: SocketAddr, receive_timeout: Duration) -> ClientContext {
    let (sender, _ticks) = mpsc::unbounded_channel();
    let config = ClientConfig::builder()
        .endpoint(addr)
        .ping_interval(Duration::from_millis(100))
        .receive_timeout(receive_timeout)
        .connect_timeout(Duration::from_secs(2))
        .build();
    ClientContext::new(config, client_callbacks(sender))
}

/// A server that sweeps quickly but holds polls open long enough for the sweep to win.
fn sweeping_server() -> ServerContext {
    let config = ServerConfig::builder()
        .endpoint(SocketAddr::from(([127, 0, 0, 1], 0)))
        .ping_timeout(Duration::from_millis(300))
        .poll_timeout(Duration::from_secs(5))
        .shutdown_timeout(Duration::from_secs(2))
        .build();
    ServerContext::new(config, common::server_services())
}

async fn states_until_closed(
    changes: &mut broadcast::Receiver<ServiceStateChanged>,
) -> Vec<ServiceState> {
    let mut seen = Vec::new();
    while seen.last() != Some(&ServiceState::Closed) {
        let change = timeout(PATIENCE, changes.recv())
            .await
            .expect("client closes in time")
            .unwrap();
        seen.push(change.current);
    }
    seen
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unanswered_ping_does_not_wedge_disconnect() {
    common::init_tracing();

    let addr = serve_stalled(Stall::Ping).await;
    let client = fast_client(addr, CLIENT_RECEIVE_TIMEOUT);
    let mut changes = client.subscribe();

    client.open(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        states_until_closed(&mut changes).await,
        vec![
            ServiceState::Opening,
            ServiceState::Open,
            ServiceState::Closing,
            ServiceState::Closed,
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_poll_stream_faults_the_client() {
    common::init_tracing();

    let addr = serve_stalled(Stall::Poll).await;
    let client = fast_client(addr, Duration::from_millis(300));

    client.open(&CancellationToken::new()).await.unwrap();
    let mut changes = client.subscribe();

    assert_eq!(
        states_until_closed(&mut changes).await,
        vec![ServiceState::Closing, ServiceState::Closed]
    );
    assert!(matches!(
        client.stub("Echo").await,
        Err(Error::InvalidState {
            state: ServiceState::Closed,
            ..
        })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_client_is_swept_and_told_it_expired() {
    common::init_tracing();

    let server = sweeping_server();
    let server_token = server.open(&CancellationToken::new()).await.unwrap();
    let addr = server.local_addr().await.unwrap();

    let (sender, _ticks) = mpsc::unbounded_channel();
    let config = ClientConfig::builder()
        .endpoint(addr)
        .ping_interval(Duration::from_secs(10))
        .receive_timeout(Duration::from_secs(10))
        .build();
    let client = ClientContext::new(config, client_callbacks(sender));
    client.open(&CancellationToken::new()).await.unwrap();
    let mut changes = client.subscribe();

    assert_eq!(
        states_until_closed(&mut changes).await,
        vec![ServiceState::Closing, ServiceState::Closed]
    );
    assert_eq!(server.peer_count().await, 0);
    assert_eq!(server.state(), ServiceState::Open);

    server
        .close(server_token, &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expired_peer_receives_the_expired_code() {
    common::init_tracing();

    let server = sweeping_server();
    server.open(&CancellationToken::new()).await.unwrap();
    let addr = server.local_addr().await.unwrap();
    let peer_id = PeerId::generate();

    let mut raw = DuplexServiceClient::connect(format!("http://{addr}"))
        .await
        .unwrap();
    raw.open(with_peer(peer_id, Request::new(OpenRequest {})))
        .await
        .unwrap();

    let (requests, outbound) = mpsc::channel(1);
    requests.send(PollRequest {}).await.unwrap();
    let mut replies = raw
        .poll(with_peer(peer_id, Request::new(ReceiverStream::new(outbound))))
        .await
        .unwrap()
        .into_inner();

    let reply = timeout(PATIENCE, replies.message())
        .await
        .unwrap()
        .unwrap()
        .expect("expiry reply");
    assert_eq!(reply.code, Some(-1));
    assert!(reply.items.is_empty());
    assert_eq!(server.peer_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abandoned_poll_stream_evicts_its_peer() {
    common::init_tracing();

    let server = open_server().await;
    let peer_id = PeerId::generate();

    let mut raw = DuplexServiceClient::connect(format!("http://{}", server.addr))
        .await
        .unwrap();
    raw.open(with_peer(peer_id, Request::new(OpenRequest {})))
        .await
        .unwrap();

    let (requests, outbound) = mpsc::channel(1);
    requests.send(PollRequest {}).await.unwrap();
    let replies = raw
        .poll(with_peer(peer_id, Request::new(ReceiverStream::new(outbound))))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(server.context.peer_count().await, 1);

    drop(replies);
    drop(requests);
    drop(raw);

    let context = server.context.clone();
    assert!(
        eventually(|| {
            let context = context.clone();
            async move { context.peer_count().await == 0 }
        })
        .await,
        "peer outlived its poll stream"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_poll_stream_is_rejected() {
    common::init_tracing();

    let server = open_server().await;
    let peer_id = PeerId::generate();

    let mut raw = DuplexServiceClient::connect(format!("http://{}", server.addr))
        .await
        .unwrap();
    raw.open(with_peer(peer_id, Request::new(OpenRequest {})))
        .await
        .unwrap();

    let (requests, outbound) = mpsc::channel(1);
    requests.send(PollRequest {}).await.unwrap();
    let mut replies = raw
        .poll(with_peer(peer_id, Request::new(ReceiverStream::new(outbound))))
        .await
        .unwrap()
        .into_inner();

    let (_extra_requests, extra_outbound) = mpsc::channel::<PollRequest>(1);
    let status = raw
        .clone()
        .poll(with_peer(peer_id, Request::new(ReceiverStream::new(extra_outbound))))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);

    // The original stream keeps serving the peer.
    assert_eq!(server.context.peer_count().await, 1);
    let idle = timeout(PATIENCE, replies.message())
        .await
        .unwrap()
        .unwrap()
        .expect("idle reply");
    assert_eq!(idle.code, None);

    raw.close(with_peer(peer_id, Request::new(CloseRequest {})))
        .await
        .unwrap();
    assert_eq!(server.context.peer_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zero_durations_fault_the_open() {
    common::init_tracing();

    let mut config = server_config();
    config.ping_timeout = Duration::ZERO;
    let server = ServerContext::new(config, common::server_services());

    let result = server.open(&CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(Error::Config(ConfigError::ZeroDuration {
            field: "ping_timeout"
        }))
    ));
    assert_eq!(server.state(), ServiceState::Faulted);
    assert_eq!(server.local_addr().await, None);
    server.abort().await.unwrap();
    assert_eq!(server.state(), ServiceState::Closed);

    let open = open_server().await;
    let (sender, _ticks) = mpsc::unbounded_channel();
    let mut config = common::client_config(open.addr);
    config.ping_interval = Duration::ZERO;
    let client = ClientContext::new(config, client_callbacks(sender));

    let result = client.open(&CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(Error::Config(ConfigError::ZeroDuration {
            field: "ping_interval"
        }))
    ));
    assert_eq!(client.state(), ServiceState::Faulted);
    assert_eq!(open.context.peer_count().await, 0);
}
