mod common;

use std::net::SocketAddr;

use duplex_rpc::{ClientContext, Error, ServerContext, ServiceState, ServiceToken};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{PATIENCE, client_callbacks, client_config, open_client, open_server, server_config};

#[tokio::test(flavor = "multi_thread")]
async fn test_open_and_close_round_trip() {
    common::init_tracing();

    let server = open_server().await;
    assert_eq!(server.context.state(), ServiceState::Open);

    let client = open_client(server.addr).await;
    assert_eq!(client.context.state(), ServiceState::Open);
    assert_eq!(server.context.peer_ids().await, vec![client.context.id()]);

    client
        .context
        .close(client.token, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(client.context.state(), ServiceState::Closed);
    assert_eq!(server.context.peer_count().await, 0);

    server
        .context
        .close(server.token, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(server.context.state(), ServiceState::Closed);
    assert_eq!(server.context.local_addr().await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_with_foreign_token_is_rejected() {
    common::init_tracing();

    let server = open_server().await;
    let result = server
        .context
        .close(ServiceToken::generate(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::InvalidToken)));
    assert_eq!(server.context.state(), ServiceState::Open);

    server
        .context
        .close(server.token, &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_operations_in_the_wrong_state_leave_it_unchanged() {
    common::init_tracing();

    let server = ServerContext::new(server_config(), common::server_services());
    let close = server
        .close(ServiceToken::generate(), &CancellationToken::new())
        .await;
    assert!(matches!(
        close,
        Err(Error::InvalidState {
            state: ServiceState::Closed,
            ..
        })
    ));
    assert!(matches!(server.abort().await, Err(Error::InvalidState { .. })));
    assert_eq!(server.state(), ServiceState::Closed);

    let token = server.open(&CancellationToken::new()).await.unwrap();
    let reopen = server.open(&CancellationToken::new()).await;
    assert!(matches!(
        reopen,
        Err(Error::InvalidState {
            state: ServiceState::Open,
            ..
        })
    ));
    assert_eq!(server.state(), ServiceState::Open);

    server.close(token, &CancellationToken::new()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_open_faults_until_aborted() {
    common::init_tracing();

    // Nothing listens on this address once this listener is dropped.
    let vacant = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let (ticks, _) = tokio::sync::mpsc::unbounded_channel();
    let client = ClientContext::new(client_config(vacant), client_callbacks(ticks));

    assert!(client.open(&CancellationToken::new()).await.is_err());
    assert_eq!(client.state(), ServiceState::Faulted);
    assert!(matches!(client.stub("Echo").await, Err(Error::InvalidState { .. })));

    client.abort().await.unwrap();
    assert_eq!(client.state(), ServiceState::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_server_on_a_taken_port_faults() {
    common::init_tracing();

    let first = open_server().await;
    let second = ServerContext::new(server_config(), common::server_services());
    second.set_endpoint(first.addr).await.unwrap();

    assert!(second.open(&CancellationToken::new()).await.is_err());
    assert_eq!(second.state(), ServiceState::Faulted);

    second.abort().await.unwrap();
    assert_eq!(second.state(), ServiceState::Closed);

    first
        .context
        .close(first.token, &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_set_endpoint_only_while_closed() {
    common::init_tracing();

    let server = open_server().await;
    let moved = server
        .context
        .set_endpoint(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await;
    assert!(matches!(
        moved,
        Err(Error::InvalidState {
            state: ServiceState::Open,
            ..
        })
    ));

    server
        .context
        .close(server.token, &CancellationToken::new())
        .await
        .unwrap();
    server
        .context
        .set_endpoint(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();

    // Reopening after close binds again and mints a new token.
    let token = server.context.open(&CancellationToken::new()).await.unwrap();
    assert_ne!(token, server.token);
    server
        .context
        .close(token, &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_changes_are_published_in_order() {
    common::init_tracing();

    let server = ServerContext::new(server_config(), common::server_services());
    let mut changes = server.subscribe();

    let token = server.open(&CancellationToken::new()).await.unwrap();
    server.close(token, &CancellationToken::new()).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        seen.push((change.previous, change.current));
    }

    assert_eq!(
        seen,
        vec![
            (ServiceState::Closed, ServiceState::Opening),
            (ServiceState::Opening, ServiceState::Open),
            (ServiceState::Open, ServiceState::Closing),
            (ServiceState::Closing, ServiceState::Closed),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_close_ends_client_sessions() {
    common::init_tracing();

    let server = open_server().await;
    let first = open_client(server.addr).await;
    let second = open_client(server.addr).await;

    let mut first_changes = first.context.subscribe();
    let mut second_state = second.context.watch_state();

    server
        .context
        .close(server.token, &CancellationToken::new())
        .await
        .unwrap();

    timeout(PATIENCE, second_state.wait_for(|state| *state == ServiceState::Closed))
        .await
        .expect("second client closes")
        .unwrap();

    let mut seen = Vec::new();
    while seen.last() != Some(&ServiceState::Closed) {
        let change = timeout(PATIENCE, first_changes.recv())
            .await
            .expect("first client closes")
            .unwrap();
        seen.push(change.current);
    }
    assert_eq!(seen, vec![ServiceState::Closing, ServiceState::Closed]);

    // The session is gone, so the old token no longer closes anything.
    let stale = first.context.close(first.token, &CancellationToken::new()).await;
    assert!(matches!(stale, Err(Error::InvalidState { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_open_faults() {
    common::init_tracing();

    let server = ServerContext::new(server_config(), common::server_services());
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(server.open(&cancel).await, Err(Error::Cancelled)));
    assert_eq!(server.state(), ServiceState::Faulted);

    server.abort().await.unwrap();
    assert_eq!(server.state(), ServiceState::Closed);
}
