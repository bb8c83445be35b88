//! Terminal session manager against an in-memory transport.

mod common;

use common::{next_server, wait_for, FakeTransport, Outcome, ServerEnd};
use std::sync::Arc;
use std::time::Duration;
use tether_core::records::{self, load_pending_input, load_session_id, SESSION_ID_KEY};
use tether_core::{
    MemoryStore, TerminalConfig, TerminalEvent, TerminalHandle, TerminalSession, TetherError,
    DEFAULT_CONNECT_TIMEOUT,
};
use tether_types::{
    ClientFrame, ConnectionState, ServerFrame, SessionMode, TerminalClientMessage,
    TerminalServerMessage,
};

fn store_with_session(id: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    records::save(store.as_ref(), SESSION_ID_KEY, &id.to_string()).unwrap();
    store
}

fn spawn(transport: &Arc<FakeTransport>, store: &Arc<MemoryStore>) -> TerminalHandle {
    TerminalSession::spawn(TerminalConfig::default(), transport.clone(), store.clone())
}

fn ack(id: &str, ok: bool, message: Option<&str>) -> ServerFrame {
    ServerFrame::Control(TerminalServerMessage::Ack {
        id: id.to_string(),
        ok,
        message: message.map(str::to_string),
    })
}

async fn expect_resize(server: &mut ServerEnd) {
    match server.next_frame().await {
        ClientFrame::Control(TerminalClientMessage::Resize { cols: 80, rows: 24 }) => {}
        other => panic!("expected resize, got {:?}", other),
    }
}

async fn expect_input(server: &mut ServerEnd) -> (String, String) {
    match server.next_frame().await {
        ClientFrame::Control(TerminalClientMessage::Input { id, data }) => (id, data),
        other => panic!("expected input, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_c_reattach_with_backoff_replays_pending_input_once() {
    let store = store_with_session("abc");
    let (transport, mut servers) = FakeTransport::new(&[Outcome::Accept, Outcome::Fail, Outcome::Accept]);
    let terminal = spawn(&transport, &store);
    let mut events = terminal.subscribe();

    terminal.connect(SessionMode::Attach).await.unwrap();
    let mut first = next_server(&mut servers).await;
    assert_eq!(first.request.session_id.as_deref(), Some("abc"));
    expect_resize(&mut first).await;

    let id = terminal.send_input("ls -la").await.unwrap();
    let (sent_id, data) = expect_input(&mut first).await;
    assert_eq!(sent_id, id);
    assert_eq!(data, "ls -la\n");

    // Drop before any ack.
    drop(first);

    let mut second = next_server(&mut servers).await;
    assert_eq!(second.request.mode, SessionMode::Attach);
    assert_eq!(second.request.session_id.as_deref(), Some("abc"));
    expect_resize(&mut second).await;
    let (replayed_id, replayed) = expect_input(&mut second).await;
    assert_eq!(replayed_id, id);
    assert_eq!(replayed, "ls -la\n");

    second.send(ack(&id, true, None));
    wait_for(&mut events, |e| matches!(e, TerminalEvent::InputAcked { .. })).await;

    // Replayed exactly once.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(second.from_client.try_recv().is_err());

    let times = transport.attempt_times();
    assert_eq!(times.len(), 3);
    assert_eq!(times[1] - times[0], Duration::from_secs(1));
    assert_eq!(times[2] - times[1], Duration::from_secs(2));

    let snapshot = terminal.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Open);
    assert!(snapshot.pending_input.is_none());
    assert_eq!(snapshot.composer, "");
    assert!(load_pending_input(store.as_ref()).is_none());
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_three_attempts_with_one_notice() {
    let store = store_with_session("abc");
    let (transport, mut servers) =
        FakeTransport::new(&[Outcome::Accept, Outcome::Fail, Outcome::Fail, Outcome::Fail]);
    let terminal = spawn(&transport, &store);
    let mut events = terminal.subscribe();

    terminal.connect(SessionMode::Attach).await.unwrap();
    drop(next_server(&mut servers).await);

    let mut delays = Vec::new();
    let notice = wait_for(&mut events, |e| match e {
        TerminalEvent::Reconnecting { delay, .. } => {
            delays.push(*delay);
            false
        }
        TerminalEvent::Notice(_) => true,
        _ => false,
    })
    .await;
    assert!(matches!(notice, TerminalEvent::Notice(ref text) if text.contains("Reconnect manually")));
    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);

    let times = transport.attempt_times();
    assert_eq!(times.len(), 4);
    assert_eq!(times[3] - times[2], Duration::from_secs(4));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.attempt_count(), 4);
    let snapshot = terminal.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    // The session id survives; a manual reconnect may still reach it.
    assert_eq!(snapshot.session_id.as_deref(), Some("abc"));

    terminal.connect(SessionMode::Attach).await.unwrap();
    assert_eq!(transport.attempt_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn session_not_found_on_reattach_stops_retries() {
    let store = store_with_session("abc");
    let (transport, mut servers) = FakeTransport::new(&[Outcome::Accept, Outcome::NotFound]);
    let terminal = spawn(&transport, &store);
    let mut events = terminal.subscribe();

    terminal.connect(SessionMode::Attach).await.unwrap();
    drop(next_server(&mut servers).await);

    wait_for(&mut events, |e| *e == TerminalEvent::SessionInvalidated).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(transport.attempt_count(), 2);
    assert!(load_session_id(store.as_ref()).is_none());
    assert_eq!(terminal.snapshot().await.unwrap().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn session_not_found_error_message_invalidates_session() {
    let store = store_with_session("abc");
    let (transport, mut servers) = FakeTransport::new(&[]);
    let terminal = spawn(&transport, &store);
    let mut events = terminal.subscribe();

    terminal.connect(SessionMode::Attach).await.unwrap();
    let server = next_server(&mut servers).await;
    server.send(ServerFrame::Control(TerminalServerMessage::Error {
        message: "Session not found".into(),
        code: None,
    }));

    wait_for(&mut events, |e| *e == TerminalEvent::SessionInvalidated).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempt_count(), 1);
    assert!(load_session_id(store.as_ref()).is_none());
}

#[tokio::test(start_paused = true)]
async fn attach_without_saved_session_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let (transport, _servers) = FakeTransport::new(&[]);
    let terminal = spawn(&transport, &store);

    let err = terminal.connect(SessionMode::Attach).await.unwrap_err();
    assert!(matches!(err, TetherError::SessionNotFound(_)));
    assert_eq!(transport.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn hello_persists_session_and_exit_clears_it() {
    let store = Arc::new(MemoryStore::new());
    let (transport, mut servers) = FakeTransport::new(&[]);
    let terminal = spawn(&transport, &store);
    let mut events = terminal.subscribe();

    terminal.connect(SessionMode::New).await.unwrap();
    let server = next_server(&mut servers).await;
    assert_eq!(server.request.mode, SessionMode::New);
    assert!(server.request.session_id.is_none());

    server.send(ServerFrame::Control(TerminalServerMessage::Hello { session_id: "xyz".into() }));
    server.send(ServerFrame::Output(b"$ ".to_vec()));
    wait_for(&mut events, |e| matches!(e, TerminalEvent::Output(_))).await;
    assert_eq!(load_session_id(store.as_ref()).as_deref(), Some("xyz"));

    server.send(ServerFrame::Control(TerminalServerMessage::Exit { code: Some(0) }));
    wait_for(&mut events, |e| matches!(e, TerminalEvent::Exited { code: Some(0) })).await;
    drop(server);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempt_count(), 1);
    assert!(load_session_id(store.as_ref()).is_none());
}

#[tokio::test(start_paused = true)]
async fn negative_ack_keeps_input_for_rate_limited_retry() {
    let store = store_with_session("abc");
    let (transport, mut servers) = FakeTransport::new(&[]);
    let terminal = spawn(&transport, &store);
    let mut events = terminal.subscribe();

    terminal.connect(SessionMode::Attach).await.unwrap();
    let mut server = next_server(&mut servers).await;
    expect_resize(&mut server).await;

    let id = terminal.send_input("make").await.unwrap();
    expect_input(&mut server).await;
    server.send(ack(&id, false, Some("process busy")));

    let failed = wait_for(&mut events, |e| matches!(e, TerminalEvent::InputFailed { .. })).await;
    assert_eq!(failed, TerminalEvent::InputFailed { id: id.clone(), message: "process busy".into() });
    let snapshot = terminal.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_input.unwrap().id, id);
    assert_eq!(snapshot.composer, "make");

    let err = terminal.retry_input().await.unwrap_err();
    assert!(matches!(err, TetherError::RetryTooSoon(_)));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    terminal.retry_input().await.unwrap();
    let (retried_id, _) = expect_input(&mut server).await;
    assert_eq!(retried_id, id);
}

#[tokio::test(start_paused = true)]
async fn editing_composer_discards_stale_pending_input() {
    let store = store_with_session("abc");
    let (transport, mut servers) = FakeTransport::new(&[]);
    let terminal = spawn(&transport, &store);
    let mut events = terminal.subscribe();

    // Queued while offline.
    let id = terminal.send_input("ls").await.unwrap();
    assert_eq!(load_pending_input(store.as_ref()).unwrap().id, id);

    terminal.edit_composer("pwd").await.unwrap();
    let discarded = wait_for(&mut events, |e| matches!(e, TerminalEvent::InputDiscarded { .. })).await;
    assert_eq!(discarded, TerminalEvent::InputDiscarded { id });

    terminal.connect(SessionMode::Attach).await.unwrap();
    let mut server = next_server(&mut servers).await;
    expect_resize(&mut server).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(server.from_client.try_recv().is_err());
    assert_eq!(terminal.snapshot().await.unwrap().composer, "pwd");
}

#[tokio::test(start_paused = true)]
async fn pending_input_survives_reload_and_replays_once() {
    let store = store_with_session("abc");
    let (transport, mut servers) = FakeTransport::new(&[]);

    let first = spawn(&transport, &store);
    let id = first.send_input("echo hi").await.unwrap();
    first.shutdown().await.unwrap();

    let terminal = spawn(&transport, &store);
    let snapshot = terminal.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_input.as_ref().map(|p| p.id.as_str()), Some(id.as_str()));
    assert_eq!(snapshot.composer, "echo hi");

    terminal.connect(SessionMode::Attach).await.unwrap();
    let mut server = next_server(&mut servers).await;
    expect_resize(&mut server).await;
    let (replayed_id, data) = expect_input(&mut server).await;
    assert_eq!(replayed_id, id);
    assert_eq!(data, "echo hi\n");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(server.from_client.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn keystrokes_are_not_queued_while_disconnected() {
    let store = store_with_session("abc");
    let (transport, mut servers) = FakeTransport::new(&[]);
    let terminal = spawn(&transport, &store);

    terminal.send_keys(b"q".to_vec()).await.unwrap();
    terminal.connect(SessionMode::Attach).await.unwrap();
    let mut server = next_server(&mut servers).await;
    expect_resize(&mut server).await;

    terminal.send_keys(b"\x03".to_vec()).await.unwrap();
    assert_eq!(server.next_frame().await, ClientFrame::Keys(vec![0x03]));

    terminal.resize(120, 40).await.unwrap();
    assert_eq!(
        server.next_frame().await,
        ClientFrame::Control(TerminalClientMessage::Resize { cols: 120, rows: 40 })
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_abandons_a_stuck_handshake() {
    let store = Arc::new(MemoryStore::new());
    let (transport, mut servers) = FakeTransport::new(&[Outcome::Hang]);
    let terminal = spawn(&transport, &store);

    let connecting = tokio::spawn({
        let terminal = terminal.clone();
        async move { terminal.connect(SessionMode::New).await }
    });
    while transport.attempt_count() == 0 {
        tokio::task::yield_now().await;
    }

    // Commands are still served while the handshake hangs.
    assert_eq!(terminal.snapshot().await.unwrap().state, ConnectionState::Connecting);

    terminal.disconnect().await.unwrap();
    assert!(matches!(connecting.await.unwrap(), Err(TetherError::Aborted)));
    assert_eq!(terminal.snapshot().await.unwrap().state, ConnectionState::Disconnected);

    terminal.connect(SessionMode::New).await.unwrap();
    let mut server = next_server(&mut servers).await;
    expect_resize(&mut server).await;
    assert_eq!(terminal.snapshot().await.unwrap().state, ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_handshake_stops_the_session() {
    let store = Arc::new(MemoryStore::new());
    let (transport, _servers) = FakeTransport::new(&[Outcome::Hang]);
    let terminal = spawn(&transport, &store);

    let connecting = tokio::spawn({
        let terminal = terminal.clone();
        async move { terminal.connect(SessionMode::New).await }
    });
    while transport.attempt_count() == 0 {
        tokio::task::yield_now().await;
    }

    terminal.shutdown().await.unwrap();
    assert!(matches!(connecting.await.unwrap(), Err(TetherError::Aborted)));
    assert!(matches!(terminal.snapshot().await, Err(TetherError::ChannelClosed)));
}

#[tokio::test(start_paused = true)]
async fn manual_connect_times_out_without_auto_retry() {
    let store = Arc::new(MemoryStore::new());
    let (transport, _servers) = FakeTransport::new(&[Outcome::Hang]);
    let terminal = spawn(&transport, &store);

    let started = tokio::time::Instant::now();
    let err = terminal.connect(SessionMode::New).await.unwrap_err();
    assert!(err.is_transport());
    assert!(started.elapsed() >= DEFAULT_CONNECT_TIMEOUT);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.attempt_count(), 1);
    assert_eq!(terminal.snapshot().await.unwrap().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn handshake_timeout_counts_as_a_failed_reconnect() {
    let store = store_with_session("abc");
    let (transport, mut servers) = FakeTransport::new(&[Outcome::Accept, Outcome::Hang]);
    let terminal = spawn(&transport, &store);
    let mut events = terminal.subscribe();

    terminal.connect(SessionMode::Attach).await.unwrap();
    drop(next_server(&mut servers).await);

    let retry = wait_for(&mut events, |e| matches!(e, TerminalEvent::Reconnecting { attempt: 2, .. })).await;
    assert_eq!(retry, TerminalEvent::Reconnecting { attempt: 2, delay: Duration::from_secs(2) });

    let mut server = next_server(&mut servers).await;
    assert_eq!(server.request.session_id.as_deref(), Some("abc"));
    expect_resize(&mut server).await;

    let times = transport.attempt_times();
    assert_eq!(times.len(), 3);
    assert_eq!(times[2] - times[1], DEFAULT_CONNECT_TIMEOUT + Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn rejected_input_waits_for_manual_retry_after_reconnect() {
    let store = store_with_session("abc");
    let (transport, mut servers) = FakeTransport::new(&[]);
    let terminal = spawn(&transport, &store);
    let mut events = terminal.subscribe();

    terminal.connect(SessionMode::Attach).await.unwrap();
    let mut first = next_server(&mut servers).await;
    expect_resize(&mut first).await;
    let id = terminal.send_input("make").await.unwrap();
    expect_input(&mut first).await;
    first.send(ack(&id, false, Some("process busy")));
    wait_for(&mut events, |e| matches!(e, TerminalEvent::InputFailed { .. })).await;
    drop(first);

    let mut second = next_server(&mut servers).await;
    expect_resize(&mut second).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(second.from_client.try_recv().is_err());
    assert_eq!(terminal.snapshot().await.unwrap().pending_input.unwrap().id, id);

    terminal.retry_input().await.unwrap();
    let (retried_id, _) = expect_input(&mut second).await;
    assert_eq!(retried_id, id);
}
