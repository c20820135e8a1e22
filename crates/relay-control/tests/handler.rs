//! Control handler tests over a real QUIC connection

use relay_auth::SharedSecret;
use relay_control::{
    BackendRegistry, BackendState, BackendStatus, ControlHandler, CredentialVerifier,
    DuplicatePolicy, HeartbeatConfig, JwtVerifier, RegistryConfig,
};
use relay_proto::{ErrorCode, RelayMessage, PROTOCOL_VERSION};
use relay_transport::{TransportConnection, TransportConnector, TransportListener, TransportStream};
use relay_transport_quic::{QuicConfig, QuicConnection, QuicConnector, QuicListener, QuicStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const SECRET: &[u8] = b"control-handler-test-secret-0123456789";

struct Relay {
    addr: SocketAddr,
    registry: BackendRegistry<Arc<QuicConnection>>,
    secret: SharedSecret,
}

fn start_relay(policy: DuplicatePolicy, grace: Duration) -> Relay {
    let secret = SharedSecret::new(SECRET.to_vec()).unwrap();
    let verifier: Arc<dyn CredentialVerifier> = Arc::new(JwtVerifier::new(secret.validator()));
    let registry = BackendRegistry::new(
        RegistryConfig {
            grace_period: grace,
            max_backends: 10,
            duplicate_policy: policy,
        },
        verifier,
    );

    let config = Arc::new(QuicConfig::server_self_signed(&[]).unwrap());
    let listener = QuicListener::new("127.0.0.1:0".parse().unwrap(), config).unwrap();
    let addr = listener.local_addr().unwrap();

    let handler = ControlHandler::new(
        registry.clone(),
        "http://relay.test",
        HeartbeatConfig {
            ping_interval: Duration::from_millis(200),
            pong_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(2),
        },
    );

    tokio::spawn(async move {
        while let Ok((conn, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle_connection(Arc::new(conn)).await });
        }
    });

    Relay {
        addr,
        registry,
        secret,
    }
}

async fn connect(addr: SocketAddr) -> (QuicConnection, QuicStream) {
    let connector = QuicConnector::new(Arc::new(QuicConfig::client_insecure())).unwrap();
    let conn = timeout(Duration::from_secs(5), connector.connect(addr, "localhost"))
        .await
        .unwrap()
        .unwrap();
    let control = conn.open_stream().await.unwrap();
    (conn, control)
}

/// Read the next non-heartbeat message, answering relay pings
async fn next_reply(control: &mut QuicStream) -> Option<RelayMessage> {
    loop {
        let msg = timeout(Duration::from_secs(5), control.recv_message())
            .await
            .unwrap()
            .ok()?;
        match msg {
            Some(RelayMessage::Ping { timestamp }) => {
                control
                    .send_message(&RelayMessage::Pong { timestamp })
                    .await
                    .ok()?;
            }
            other => return other,
        }
    }
}

fn register(relay: &Relay, backend_id: &str) -> RelayMessage {
    RelayMessage::Register {
        backend_id: backend_id.to_string(),
        token: relay
            .secret
            .mint(backend_id, chrono::Duration::minutes(5))
            .unwrap(),
        protocol_version: PROTOCOL_VERSION,
    }
}

async fn wait_for_status(relay: &Relay, backend_id: &str, want: fn(Option<BackendStatus>) -> bool) {
    for _ in 0..100 {
        if want(relay.registry.status(backend_id)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "backend {} never reached expected status, last {:?}",
        backend_id,
        relay.registry.status(backend_id)
    );
}

#[tokio::test]
async fn test_register_and_heartbeat() {
    let relay = start_relay(DuplicatePolicy::Reject, Duration::from_secs(5));
    let (_conn, mut control) = connect(relay.addr).await;

    control.send_message(&register(&relay, "ws-1")).await.unwrap();
    match next_reply(&mut control).await {
        Some(RelayMessage::Registered {
            backend_id,
            public_url,
            session_ticket,
            resumed,
        }) => {
            assert_eq!(backend_id, "ws-1");
            assert_eq!(public_url, "http://relay.test/relay/ws-1");
            assert_eq!(session_ticket.len(), 32);
            assert!(!resumed);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    assert!(matches!(
        relay.registry.lookup("ws-1"),
        Some(BackendState::Active(_))
    ));

    // Answer pings for longer than the pong timeout: the session stays up
    let keepalive = timeout(Duration::from_millis(1500), next_reply(&mut control)).await;
    assert!(keepalive.is_err());
    assert_eq!(relay.registry.status("ws-1"), Some(BackendStatus::Active));

    // Agent ping is echoed
    control
        .send_message(&RelayMessage::Ping { timestamp: 99 })
        .await
        .unwrap();
    assert_eq!(
        next_reply(&mut control).await,
        Some(RelayMessage::Pong { timestamp: 99 })
    );
}

#[tokio::test]
async fn test_bad_token_rejected() {
    let relay = start_relay(DuplicatePolicy::Reject, Duration::from_secs(5));
    let (_conn, mut control) = connect(relay.addr).await;

    let other = SharedSecret::new(b"a-completely-different-secret-value!!".to_vec()).unwrap();
    control
        .send_message(&RelayMessage::Register {
            backend_id: "ws-1".into(),
            token: other.mint("ws-1", chrono::Duration::minutes(5)).unwrap(),
            protocol_version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();

    match next_reply(&mut control).await {
        Some(RelayMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::AuthFailed),
        other => panic!("unexpected reply: {:?}", other),
    }
    assert!(relay.registry.lookup("ws-1").is_none());
}

#[tokio::test]
async fn test_expired_token_and_wrong_version_rejected() {
    let relay = start_relay(DuplicatePolicy::Reject, Duration::from_secs(5));

    let (_conn, mut control) = connect(relay.addr).await;
    control
        .send_message(&RelayMessage::Register {
            backend_id: "ws-1".into(),
            token: relay
                .secret
                .mint("ws-1", chrono::Duration::seconds(-10))
                .unwrap(),
            protocol_version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();
    assert!(matches!(
        next_reply(&mut control).await,
        Some(RelayMessage::Error { code: ErrorCode::AuthFailed, .. })
    ));

    let (_conn, mut control) = connect(relay.addr).await;
    let mut msg = register(&relay, "ws-1");
    if let RelayMessage::Register {
        protocol_version, ..
    } = &mut msg
    {
        *protocol_version = PROTOCOL_VERSION + 1;
    }
    control.send_message(&msg).await.unwrap();
    assert!(matches!(
        next_reply(&mut control).await,
        Some(RelayMessage::Error { code: ErrorCode::UnsupportedVersion, .. })
    ));
    assert_eq!(relay.registry.count(), 0);
}

#[tokio::test]
async fn test_first_message_must_register() {
    let relay = start_relay(DuplicatePolicy::Reject, Duration::from_secs(5));
    let (_conn, mut control) = connect(relay.addr).await;

    control
        .send_message(&RelayMessage::WsData {
            data: vec![1],
            is_binary: true,
        })
        .await
        .unwrap();
    assert!(matches!(
        next_reply(&mut control).await,
        Some(RelayMessage::Error { code: ErrorCode::InvalidMessage, .. })
    ));
}

#[tokio::test]
async fn test_duplicate_rejected_under_reject_policy() {
    let relay = start_relay(DuplicatePolicy::Reject, Duration::from_secs(5));

    let (_c1, mut first) = connect(relay.addr).await;
    first.send_message(&register(&relay, "ws-1")).await.unwrap();
    assert!(matches!(
        next_reply(&mut first).await,
        Some(RelayMessage::Registered { .. })
    ));

    let (_c2, mut second) = connect(relay.addr).await;
    second.send_message(&register(&relay, "ws-1")).await.unwrap();
    assert!(matches!(
        next_reply(&mut second).await,
        Some(RelayMessage::Error { code: ErrorCode::DuplicateBackend, .. })
    ));
    assert_eq!(relay.registry.count(), 1);
}

#[tokio::test]
async fn test_supersede_closes_old_connection() {
    let relay = start_relay(DuplicatePolicy::Supersede, Duration::from_secs(5));

    let (c1, mut first) = connect(relay.addr).await;
    first.send_message(&register(&relay, "ws-1")).await.unwrap();
    assert!(matches!(
        next_reply(&mut first).await,
        Some(RelayMessage::Registered { .. })
    ));

    let (c2, mut second) = connect(relay.addr).await;
    second.send_message(&register(&relay, "ws-1")).await.unwrap();
    assert!(matches!(
        next_reply(&mut second).await,
        Some(RelayMessage::Registered { .. })
    ));

    let reason = timeout(Duration::from_secs(5), c1.closed()).await.unwrap();
    assert!(reason.contains("superseded"), "close reason: {}", reason);

    // The old connection's loss does not knock out the new registration
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(relay.registry.status("ws-1"), Some(BackendStatus::Active));
    assert!(!c2.is_closed());
}

#[tokio::test]
async fn test_resume_after_loss() {
    let relay = start_relay(DuplicatePolicy::Reject, Duration::from_secs(5));

    let (c1, mut first) = connect(relay.addr).await;
    first.send_message(&register(&relay, "ws-1")).await.unwrap();
    let ticket = match next_reply(&mut first).await {
        Some(RelayMessage::Registered { session_ticket, .. }) => session_ticket,
        other => panic!("unexpected reply: {:?}", other),
    };

    c1.close(0, "network blip").await;
    wait_for_status(&relay, "ws-1", |s| {
        matches!(s, Some(BackendStatus::Reconnecting { .. }))
    })
    .await;

    let (_c2, mut second) = connect(relay.addr).await;
    second
        .send_message(&RelayMessage::Reconnect {
            backend_id: "ws-1".into(),
            token: relay
                .secret
                .mint("ws-1", chrono::Duration::minutes(5))
                .unwrap(),
            session_ticket: ticket.clone(),
        })
        .await
        .unwrap();

    match next_reply(&mut second).await {
        Some(RelayMessage::Registered {
            resumed,
            session_ticket,
            ..
        }) => {
            assert!(resumed);
            assert_ne!(session_ticket, ticket);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(relay.registry.status("ws-1"), Some(BackendStatus::Active));
}

#[tokio::test]
async fn test_stale_ticket_falls_back_to_register() {
    let relay = start_relay(DuplicatePolicy::Reject, Duration::from_secs(5));
    let (_conn, mut control) = connect(relay.addr).await;

    control
        .send_message(&RelayMessage::Reconnect {
            backend_id: "ws-1".into(),
            token: relay
                .secret
                .mint("ws-1", chrono::Duration::minutes(5))
                .unwrap(),
            session_ticket: vec![7u8; 32],
        })
        .await
        .unwrap();
    assert!(matches!(
        next_reply(&mut control).await,
        Some(RelayMessage::Error { code: ErrorCode::ReconnectFailed, .. })
    ));

    // Same connection, same stream
    control.send_message(&register(&relay, "ws-1")).await.unwrap();
    assert!(matches!(
        next_reply(&mut control).await,
        Some(RelayMessage::Registered { resumed: false, .. })
    ));
}

#[tokio::test]
async fn test_disconnect_evicts_immediately() {
    let relay = start_relay(DuplicatePolicy::Reject, Duration::from_secs(30));
    let (_conn, mut control) = connect(relay.addr).await;

    control.send_message(&register(&relay, "ws-1")).await.unwrap();
    assert!(matches!(
        next_reply(&mut control).await,
        Some(RelayMessage::Registered { .. })
    ));

    control
        .send_message(&RelayMessage::Disconnect {
            reason: "shutting down".into(),
        })
        .await
        .unwrap();

    wait_for_status(&relay, "ws-1", |s| s.is_none()).await;
}

#[tokio::test]
async fn test_grace_period_expiry_evicts() {
    let relay = start_relay(DuplicatePolicy::Reject, Duration::from_millis(500));
    let (conn, mut control) = connect(relay.addr).await;

    control.send_message(&register(&relay, "ws-1")).await.unwrap();
    assert!(matches!(
        next_reply(&mut control).await,
        Some(RelayMessage::Registered { .. })
    ));

    conn.close(0, "gone").await;
    wait_for_status(&relay, "ws-1", |s| {
        matches!(s, Some(BackendStatus::Reconnecting { .. }))
    })
    .await;
    wait_for_status(&relay, "ws-1", |s| s.is_none()).await;
}

#[tokio::test]
async fn test_silent_agent_times_out() {
    let relay = start_relay(DuplicatePolicy::Reject, Duration::from_secs(5));
    let (_conn, mut control) = connect(relay.addr).await;

    control.send_message(&register(&relay, "ws-1")).await.unwrap();
    assert!(matches!(
        next_reply(&mut control).await,
        Some(RelayMessage::Registered { .. })
    ));

    // Never answer pings
    wait_for_status(&relay, "ws-1", |s| {
        matches!(s, Some(BackendStatus::Reconnecting { .. }))
    })
    .await;
}
