//! End-to-end lifecycle tests against in-process relay and game servers.
//!
//! The relay server speaks plaintext; the game server applies a one-byte XOR so the
//! cipher pipeline is exercised on the gameplay connection.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use mu_client_net::error::constants::ERR_CONNECTION_LOST;
use mu_client_net::protocol::events::{LoginOutcome, SessionState};
use mu_client_net::transport::cipher::BoxedStream;
use mu_client_net::{
    CipherPipeline, ClientSettings, ConnectionState, EventQueue, NetworkEvent, NetworkManager,
    RoutingMode, SessionUpdate,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const XOR_KEY: u8 = 0x5A;

struct XorCipher(u8);

impl CipherPipeline for XorCipher {
    fn name(&self) -> &'static str {
        "xor-test"
    }

    fn wrap(&self, stream: BoxedStream) -> mu_client_net::Result<BoxedStream> {
        Ok(Box::new(XorStream {
            inner: stream,
            key: self.0,
        }))
    }
}

struct XorStream {
    inner: BoxedStream,
    key: u8,
}

impl AsyncRead for XorStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let key = self.key;
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        for byte in &mut buf.filled_mut()[before..] {
            *byte ^= key;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for XorStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let key = self.key;
        let masked: Vec<u8> = data.iter().map(|b| b ^ key).collect();
        Pin::new(&mut self.inner).poll_write(cx, &masked)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn xor(data: &mut [u8]) {
    for byte in data {
        *byte ^= XOR_KEY;
    }
}

fn server_list(servers: &[(u16, u8)]) -> Vec<u8> {
    let len = 7 + servers.len() * 4;
    let mut frame = vec![0xC2];
    frame.extend_from_slice(&(len as u16).to_be_bytes());
    frame.extend_from_slice(&[0xF4, 0x06]);
    frame.extend_from_slice(&(servers.len() as u16).to_be_bytes());
    for (id, load) in servers {
        frame.extend_from_slice(&id.to_le_bytes());
        frame.extend_from_slice(&[*load, 0]);
    }
    frame
}

fn connection_info(host: &str, port: u16) -> Vec<u8> {
    let mut frame = vec![0xC1, 0x16, 0xF4, 0x03];
    let mut field = [0u8; 16];
    field[..host.len()].copy_from_slice(host.as_bytes());
    frame.extend_from_slice(&field);
    frame.extend_from_slice(&port.to_le_bytes());
    frame
}

fn character_list(name: &str) -> Vec<u8> {
    let mut frame = vec![0xC1, 0x00, 0xF3, 0x00, 0x00, 0x00, 0x01, 0x00];
    let mut entry = [0u8; 34];
    entry[1..1 + name.len()].copy_from_slice(name.as_bytes());
    entry[12..14].copy_from_slice(&150u16.to_le_bytes());
    entry[15] = 1 << 4;
    frame.extend_from_slice(&entry);
    frame[1] = frame.len() as u8;
    frame
}

/// Relay server script. With `handoff` set it answers the connection info
/// request; otherwise it records whatever else the client sends.
/// Returns the bytes received after the scripted exchange, up to EOF.
async fn run_relay(listener: TcpListener, handoff: Option<u16>) -> Vec<u8> {
    let (mut socket, _) = listener.accept().await.unwrap();
    socket.write_all(&[0xC1, 0x04, 0x00, 0x01]).await.unwrap();

    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await.unwrap();
    assert_eq!(request, [0xC1, 0x04, 0xF4, 0x06]);
    socket
        .write_all(&server_list(&[(0, 20), (1, 75)]))
        .await
        .unwrap();

    if let Some(game_port) = handoff {
        let mut request = [0u8; 6];
        socket.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..4], &[0xC1, 0x06, 0xF4, 0x03]);
        assert_eq!(u16::from_le_bytes([request[4], request[5]]), 1);
        // The client may already be handing off and gone
        let _ = socket
            .write_all(&connection_info("127.0.0.1", game_port))
            .await;
    }

    let mut rest = Vec::new();
    let _ = socket.read_to_end(&mut rest).await;
    rest
}

async fn write_masked(socket: &mut TcpStream, frame: &[u8]) {
    let mut masked = frame.to_vec();
    xor(&mut masked);
    socket.write_all(&masked).await.unwrap();
}

async fn read_masked(socket: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    socket.read_exact(&mut buf).await.unwrap();
    xor(&mut buf);
    buf
}

/// Game server script: hello, login, character list, world entry, then one walk.
async fn run_game(listener: TcpListener, accepted: Arc<AtomicUsize>) {
    let (mut socket, _) = listener.accept().await.unwrap();
    accepted.fetch_add(1, Ordering::SeqCst);

    write_masked(
        &mut socket,
        &[0xC1, 0x0C, 0xF1, 0x00, 0x01, 0x00, 0x2A, b'1', b'0', b'5', b'2', b'5'],
    )
    .await;

    let login = read_masked(&mut socket, 59).await;
    assert_eq!(&login[..4], &[0xC3, 0x3B, 0xF1, 0x01]);
    write_masked(&mut socket, &[0xC1, 0x05, 0xF1, 0x01, 0x01]).await;
    write_masked(&mut socket, &character_list("Hero")).await;

    let select = read_masked(&mut socket, 14).await;
    assert_eq!(&select[..4], &[0xC1, 0x0E, 0xF3, 0x03]);
    assert_eq!(&select[4..8], b"Hero");
    write_masked(&mut socket, &[0xC3, 0x08, 0xF3, 0x03, 130, 120, 0x00, 0x00]).await;

    // Walk [1, 2, 3] from (130, 120)
    let walk = read_masked(&mut socket, 9).await;
    assert_eq!(walk, vec![0xC1, 0x09, 0xD4, 130, 120, 1, 3, 0x12, 0x3F]);
    write_masked(&mut socket, &[0xC1, 0x06, 0xD4, 131, 121, 3]).await;

    let mut rest = Vec::new();
    let _ = socket.read_to_end(&mut rest).await;
}

/// Accept any number of game connections, counting them, and hold them open
fn spawn_counting_game(listener: TcpListener, accepted: Arc<AtomicUsize>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            sockets.push(socket);
        }
    })
}

async fn next_matching<F>(events: &mut EventQueue, mut predicate: F) -> NetworkEvent
where
    F: FnMut(&NetworkEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event queue closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_state(events: &mut EventQueue, state: ConnectionState) {
    next_matching(events, |e| {
        matches!(e, NetworkEvent::StateChanged { current, .. } if *current == state)
    })
    .await;
}

fn settings(relay_port: u16) -> ClientSettings {
    ClientSettings::default_with_overrides(|c| {
        c.connect_server.port = relay_port;
        c.timeouts.connect = Duration::from_secs(2);
        c.timeouts.disconnect_grace = Duration::from_millis(500);
    })
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn test_full_session_through_handoff() {
    let (relay_listener, relay_port) = listener().await;
    let (game_listener, game_port) = listener().await;
    let accepted = Arc::new(AtomicUsize::new(0));

    let relay = tokio::spawn(run_relay(relay_listener, Some(game_port)));
    let game = tokio::spawn(run_game(game_listener, Arc::clone(&accepted)));

    let (manager, mut events) =
        NetworkManager::new(settings(relay_port), Arc::new(XorCipher(XOR_KEY))).unwrap();

    assert!(manager.connect_to_connect_server().await);
    assert_eq!(manager.state(), ConnectionState::ConnectedToConnectServer);
    assert_eq!(manager.routing_mode(), RoutingMode::Relay);

    assert!(manager.request_server_list());
    let event = next_matching(&mut events, |e| {
        matches!(e, NetworkEvent::ServerListReceived(_))
    })
    .await;
    let NetworkEvent::ServerListReceived(servers) = event else {
        unreachable!()
    };
    assert_eq!(servers.len(), 2);
    assert_eq!(manager.server_list()[1].load, 75);

    // The connection info reply starts the handoff on its own
    assert!(manager.request_game_server_connection(1));
    wait_for_state(&mut events, ConnectionState::ConnectedToGameServer).await;
    assert_eq!(manager.routing_mode(), RoutingMode::Gameplay);

    // Relay connection was torn down before the game connection opened
    let leftover = relay.await.unwrap();
    assert!(leftover.is_empty());
    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.connections_opened, 2);
    assert_eq!(metrics.connections_closed, 1);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    assert!(manager.send_login_request("player", "secret"));
    let event = next_matching(&mut events, |e| matches!(e, NetworkEvent::LoginResult(_))).await;
    assert_eq!(event, NetworkEvent::LoginResult(LoginOutcome::Success));

    let event = next_matching(&mut events, |e| {
        matches!(e, NetworkEvent::CharacterListReceived(_))
    })
    .await;
    let NetworkEvent::CharacterListReceived(characters) = event else {
        unreachable!()
    };
    assert_eq!(characters[0].name, "Hero");
    assert_eq!(characters[0].level, 150);

    assert!(manager.send_select_character_request("Hero"));
    let event = next_matching(&mut events, |e| {
        matches!(e, NetworkEvent::Session(SessionUpdate::CharacterEntered { .. }))
    })
    .await;
    assert_eq!(manager.state(), ConnectionState::InGame);

    let mut session = SessionState::new();
    if let NetworkEvent::Session(update) = &event {
        session.apply(update);
    }
    assert_eq!(session.character_name.as_deref(), Some("Hero"));
    assert_eq!(session.position, (130, 120));

    assert!(manager.send_walk_request((130, 120), &[1, 2, 3]));
    assert!(manager.is_movement_locked());
    // Second walk before the acknowledgement is refused
    assert!(!manager.send_walk_request((130, 120), &[4]));

    next_matching(&mut events, |e| {
        matches!(e, NetworkEvent::Session(SessionUpdate::PositionChanged { .. }))
    })
    .await;
    assert!(!manager.is_movement_locked());

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_connected());
    assert_eq!(manager.metrics().connections_active(), 0);
    game.await.unwrap();
}

#[tokio::test]
async fn test_login_rejected_in_server_list_state() {
    let (relay_listener, relay_port) = listener().await;
    let relay = tokio::spawn(run_relay(relay_listener, None));

    let (manager, mut events) =
        NetworkManager::new(settings(relay_port), Arc::new(XorCipher(XOR_KEY))).unwrap();
    assert!(manager.connect_to_connect_server().await);
    assert!(manager.request_server_list());
    next_matching(&mut events, |e| {
        matches!(e, NetworkEvent::ServerListReceived(_))
    })
    .await;

    assert!(!manager.send_login_request("player", "secret"));
    assert_eq!(manager.state(), ConnectionState::ReceivedServerList);
    let events_now = events.drain();
    assert_eq!(events_now.len(), 1);
    assert!(matches!(&events_now[0], NetworkEvent::Error(msg) if msg.contains("send login request")));

    manager.disconnect().await;
    // Nothing was sent for the rejected login
    assert!(relay.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_handoffs_leave_one_connection() {
    let (relay_listener, relay_port) = listener().await;
    let (game_listener, game_port) = listener().await;
    let accepted = Arc::new(AtomicUsize::new(0));

    let relay = tokio::spawn(run_relay(relay_listener, Some(game_port)));
    let game = spawn_counting_game(game_listener, Arc::clone(&accepted));

    let (manager, mut events) =
        NetworkManager::new(settings(relay_port), Arc::new(XorCipher(XOR_KEY))).unwrap();
    assert!(manager.connect_to_connect_server().await);
    assert!(manager.request_server_list());
    wait_for_state(&mut events, ConnectionState::ReceivedServerList).await;

    // Race a manual switch against the one the relay reply triggers
    assert!(manager.request_game_server_connection(1));
    let manual = manager.switch_to_game_server("127.0.0.1", game_port).await;

    wait_for_state(&mut events, ConnectionState::ConnectedToGameServer).await;
    relay.await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(manager.state(), ConnectionState::ConnectedToGameServer);
    assert!(manager.is_connected());
    assert_eq!(manager.metrics().connections_active(), 1);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    // Whichever lost the race was rejected
    let _ = manual;

    manager.shutdown().await;
    assert_eq!(manager.metrics().connections_active(), 0);
    game.abort();
}

#[tokio::test]
async fn test_handoff_survives_relay_hang_up() {
    let (relay_listener, relay_port) = listener().await;
    let (game_listener, game_port) = listener().await;
    let accepted = Arc::new(AtomicUsize::new(0));
    let game = spawn_counting_game(game_listener, Arc::clone(&accepted));

    tokio::spawn(async move {
        let (mut socket, _) = relay_listener.accept().await.unwrap();
        socket.write_all(&[0xC1, 0x04, 0x00, 0x01]).await.unwrap();
        let mut request = [0u8; 4];
        socket.read_exact(&mut request).await.unwrap();
        socket.write_all(&server_list(&[(1, 40)])).await.unwrap();
        let mut request = [0u8; 6];
        socket.read_exact(&mut request).await.unwrap();
        socket
            .write_all(&connection_info("127.0.0.1", game_port))
            .await
            .unwrap();
        // Relay hangs up as soon as the endpoint is out
    });

    let (manager, mut events) =
        NetworkManager::new(settings(relay_port), Arc::new(XorCipher(XOR_KEY))).unwrap();
    assert!(manager.connect_to_connect_server().await);
    assert!(manager.request_server_list());
    wait_for_state(&mut events, ConnectionState::ReceivedServerList).await;
    assert!(manager.request_game_server_connection(1));

    let mut errors = Vec::new();
    next_matching(&mut events, |e| {
        if let NetworkEvent::Error(msg) = e {
            errors.push(msg.clone());
        }
        matches!(
            e,
            NetworkEvent::StateChanged {
                current: ConnectionState::ConnectedToGameServer | ConnectionState::Disconnected,
                ..
            }
        )
    })
    .await;

    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(manager.state(), ConnectionState::ConnectedToGameServer);
    assert_eq!(manager.routing_mode(), RoutingMode::Gameplay);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
    game.abort();
}

#[tokio::test]
async fn test_connection_loss_moves_to_disconnected() {
    let (relay_listener, relay_port) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = relay_listener.accept().await.unwrap();
        socket.write_all(&[0xC1, 0x04, 0x00, 0x01]).await.unwrap();
        // Dropping the socket closes the connection
    });

    let (manager, mut events) =
        NetworkManager::new(settings(relay_port), Arc::new(XorCipher(XOR_KEY))).unwrap();
    assert!(manager.connect_to_connect_server().await);

    let event = next_matching(&mut events, |e| matches!(e, NetworkEvent::Error(_))).await;
    assert!(matches!(&event, NetworkEvent::Error(msg) if msg.starts_with(ERR_CONNECTION_LOST)));
    wait_for_state(&mut events, ConnectionState::Disconnected).await;
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_connect_failure_reports_error() {
    let port = {
        let (listener, port) = listener().await;
        drop(listener);
        port
    };

    let (manager, mut events) =
        NetworkManager::new(settings(port), Arc::new(XorCipher(XOR_KEY))).unwrap();
    assert!(!manager.connect_to_connect_server().await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_connected());

    let events = events.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, NetworkEvent::Error(msg) if msg.contains("Could not connect"))));
    assert_eq!(manager.metrics().snapshot().connections_failed, 1);

    // Second connect is allowed again from Disconnected
    assert!(!manager.connect_to_connect_server().await);
}

#[tokio::test]
async fn test_second_connect_rejected_while_connected() {
    let (relay_listener, relay_port) = listener().await;
    tokio::spawn(async move {
        let (_socket, _) = relay_listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (manager, mut events) =
        NetworkManager::new(settings(relay_port), Arc::new(XorCipher(XOR_KEY))).unwrap();
    assert!(manager.connect_to_connect_server().await);
    events.drain();

    assert!(!manager.connect_to_connect_server().await);
    assert_eq!(manager.state(), ConnectionState::ConnectedToConnectServer);
    assert_eq!(manager.metrics().connections_active(), 1);
    assert!(matches!(&events.drain()[0], NetworkEvent::Error(_)));

    manager.disconnect().await;
    assert_eq!(manager.metrics().connections_active(), 0);
}
