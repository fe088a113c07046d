use std::time::Duration;

use futures::StreamExt;
use parley_core::config::{ReconnectConfig, TransportConfig};
use parley_core::types::ConnectionState;
use parley_transport::testing::MockServer;
use parley_transport::{FrameStream, Transport, TransportError, TransportEvent};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(max_attempts: u32) -> TransportConfig {
    TransportConfig {
        connect_timeout_ms: 2_000,
        liveness_timeout_ms: 2_000,
        heartbeat_interval_ms: 30_000,
        reconnect: ReconnectConfig {
            max_attempts,
            base_delay_ms: 10,
            max_delay_ms: 40,
        },
    }
}

async fn next_event(frames: &mut FrameStream) -> Option<Result<TransportEvent, TransportError>> {
    tokio::time::timeout(WAIT, frames.next())
        .await
        .expect("timed out waiting for transport event")
}

#[tokio::test]
async fn test_connect_send_receive() {
    let server = MockServer::start().await;
    let transport = Transport::new(fast_config(3));

    transport.connect(server.endpoint()).await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(server.connection_count(), 1);

    transport.send(r#"{"type":"ping.test"}"#).await.unwrap();
    assert_eq!(
        server.next_message(WAIT).await.as_deref(),
        Some(r#"{"type":"ping.test"}"#)
    );

    let mut frames = transport.receive();
    assert!(server.send_to_client(r#"{"type":"hello"}"#));
    assert_eq!(
        next_event(&mut frames).await,
        Some(Ok(TransportEvent::Frame(r#"{"type":"hello"}"#.into())))
    );

    transport.disconnect().await;
}

#[tokio::test]
async fn test_frames_before_liveness_pong_are_kept() {
    let server = MockServer::start_with_greeting(r#"{"type":"session.created"}"#).await;
    let transport = Transport::new(fast_config(3));
    transport.connect(server.endpoint()).await.unwrap();

    let mut frames = transport.receive();
    assert_eq!(
        next_event(&mut frames).await,
        Some(Ok(TransportEvent::Frame(r#"{"type":"session.created"}"#.into())))
    );
    transport.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_completes_stream() {
    let server = MockServer::start().await;
    let transport = Transport::new(fast_config(3));
    transport.connect(server.endpoint()).await.unwrap();
    let mut frames = transport.receive();

    transport.disconnect().await;
    assert_eq!(next_event(&mut frames).await, None);
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(transport.send("x").await, Err(TransportError::NotConnected));

    // A second receive() on the same connection yields nothing.
    assert!(transport.receive().next().await.is_none());
}

#[tokio::test]
async fn test_connect_replaces_previous_connection() {
    let server = MockServer::start().await;
    let transport = Transport::new(fast_config(3));

    transport.connect(server.endpoint()).await.unwrap();
    let mut first = transport.receive();
    transport.connect(server.endpoint()).await.unwrap();

    assert_eq!(next_event(&mut first).await, None);
    assert_eq!(server.connection_count(), 2);
    assert!(transport.is_connected());
    transport.disconnect().await;
}

#[tokio::test]
async fn test_reconnects_with_same_endpoint() {
    let server = MockServer::start().await;
    let transport = Transport::new(fast_config(3));
    let endpoint = server.endpoint().with_header("X-Session", "abc");
    transport.connect(endpoint.clone()).await.unwrap();
    let mut frames = transport.receive();

    assert!(server.drop_connection());
    assert_eq!(
        next_event(&mut frames).await,
        Some(Ok(TransportEvent::Reconnected { attempts: 1 }))
    );
    assert_eq!(transport.reconnect_attempts(), 0);
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(transport.last_endpoint(), Some(endpoint));
    assert_eq!(server.connection_count(), 2);

    // The new generation carries traffic both ways.
    transport.send("after").await.unwrap();
    assert_eq!(server.next_message(WAIT).await.as_deref(), Some("after"));
    assert!(server.send_to_client("again"));
    assert_eq!(
        next_event(&mut frames).await,
        Some(Ok(TransportEvent::Frame("again".into())))
    );
    transport.disconnect().await;
}

#[tokio::test]
async fn test_attempts_count_up_then_reset_on_success() {
    let server = MockServer::start().await;
    let transport = Transport::new(fast_config(5));
    transport.connect(server.endpoint()).await.unwrap();
    let mut frames = transport.receive();

    server.refuse_next(2);
    assert!(server.drop_connection());

    // Two refused attempts, the third succeeds.
    assert_eq!(
        next_event(&mut frames).await,
        Some(Ok(TransportEvent::Reconnected { attempts: 3 }))
    );
    assert_eq!(transport.reconnect_attempts(), 0);
    transport.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_exhaustion_ends_stream_with_error() {
    let server = MockServer::start().await;
    let transport = Transport::new(fast_config(3));
    transport.connect(server.endpoint()).await.unwrap();
    let mut frames = transport.receive();

    server.stop().await;

    assert_eq!(
        next_event(&mut frames).await,
        Some(Err(TransportError::ReconnectExhausted { attempts: 3 }))
    );
    assert_eq!(next_event(&mut frames).await, None);
    assert_eq!(transport.reconnect_attempts(), 3);
    assert_eq!(transport.state(), ConnectionState::Error);

    // A later successful connect resets the counter.
    let replacement = MockServer::start().await;
    transport.connect(replacement.endpoint()).await.unwrap();
    assert_eq!(transport.reconnect_attempts(), 0);
    transport.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_during_backoff_stops_reconnecting() {
    let server = MockServer::start().await;
    let mut config = fast_config(5);
    config.reconnect.base_delay_ms = 500;
    config.reconnect.max_delay_ms = 500;
    let transport = Transport::new(config);
    transport.connect(server.endpoint()).await.unwrap();
    let mut frames = transport.receive();

    assert!(server.drop_connection());
    let mut states = transport.subscribe_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Reconnecting))
        .await
        .unwrap()
        .unwrap();

    transport.disconnect().await;
    assert_eq!(next_event(&mut frames).await, None);
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.connection_count(), 1);
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_heartbeat_keeps_healthy_connection() {
    let server = MockServer::start().await;
    let mut config = fast_config(3);
    config.heartbeat_interval_ms = 50;
    let transport = Transport::new(config);
    transport.connect(server.endpoint()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(transport.is_connected());
    assert_eq!(server.connection_count(), 1);
    transport.disconnect().await;
}

#[tokio::test]
async fn test_unanswered_heartbeat_triggers_reconnect() {
    let server = MockServer::start().await;
    let mut config = fast_config(3);
    config.heartbeat_interval_ms = 50;
    let transport = Transport::new(config);
    transport.connect(server.endpoint()).await.unwrap();
    let mut frames = transport.receive();

    assert!(server.stall_connection());
    assert_eq!(
        next_event(&mut frames).await,
        Some(Ok(TransportEvent::Reconnected { attempts: 1 }))
    );
    assert_eq!(server.connection_count(), 2);
    assert_eq!(transport.reconnect_attempts(), 0);
    assert!(transport.is_connected());

    // The new generation answers pings again.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(transport.is_connected());
    assert_eq!(server.connection_count(), 2);
    transport.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_connects_leave_one_connection() {
    let server = MockServer::start().await;
    let transport = Transport::new(fast_config(3));
    let other = transport.clone();

    let (first, second) = tokio::join!(
        transport.connect(server.endpoint()),
        other.connect(server.endpoint())
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(server.connection_count(), 2);

    tokio::time::timeout(WAIT, async {
        while server.live_connections() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stale connection was left open");
    assert!(transport.is_connected());

    transport.disconnect().await;
    tokio::time::timeout(WAIT, async {
        while server.live_connections() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection was left open after disconnect");
}
