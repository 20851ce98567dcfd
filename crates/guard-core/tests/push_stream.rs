//! Ordered status stream: heartbeats, release, resume and the WebSocket channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use guard_common::{Platform, UserId};
use guard_core::allocation::AccountSpec;
use guard_core::collaborators::memory::{
    FixedBalanceProvider, MemoryVault, StaticIdentityProvider, TracingExecutionSink,
};
use guard_core::{
    Collaborators, Delivery, GuardConfig, PushServer, PushServerConfig, StreamStart, TradingGuard,
};
use rust_decimal_macros::dec;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

fn guard_with(config: GuardConfig) -> (Arc<TradingGuard>, Arc<StaticIdentityProvider>) {
    let identity = Arc::new(StaticIdentityProvider::new());
    let collaborators = Collaborators {
        identity: identity.clone(),
        vault: Arc::new(MemoryVault::new()),
        balances: vec![Arc::new(FixedBalanceProvider::new(Platform::Kalshi))],
        execution: Arc::new(TracingExecutionSink),
        journal: None,
    };
    (Arc::new(TradingGuard::new(config, collaborators)), identity)
}

/// Publish `count` events for `user`, returning the latest seq.
async fn churn(guard: &TradingGuard, user: &UserId, count: usize) -> u64 {
    let created = guard
        .ledger()
        .add_account(user, AccountSpec::new("main", Platform::Kalshi, dec!(100)))
        .await
        .unwrap();
    for i in 1..count {
        guard
            .ledger()
            .toggle_active(user, created.account.id, i % 2 == 0)
            .await
            .unwrap();
    }
    guard.broadcaster().latest_seq(user)
}

#[tokio::test]
async fn test_silent_observer_released_then_resumes_without_gaps() {
    let (guard, _) = guard_with(GuardConfig::default());
    let alice = UserId::new("alice");

    assert_eq!(churn(&guard, &alice, 42).await, 42);
    let (sub, start) = guard.subscribe(&alice, Some(42)).await;
    assert_eq!(start, StreamStart::Replay(Vec::new()));

    // Three heartbeats without an ack.
    for _ in 0..3 {
        guard.maintenance_tick();
    }
    assert!(sub.is_released());
    assert_eq!(guard.broadcaster().observer_count(&alice), 0);

    // Events committed while disconnected.
    guard.mode().emergency_stop(&alice);
    guard
        .ledger()
        .add_account(&alice, AccountSpec::new("second", Platform::Kalshi, dec!(0)))
        .await
        .unwrap();

    let (_sub, start) = guard.subscribe(&alice, Some(42)).await;
    match start {
        StreamStart::Replay(events) => {
            let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
            assert_eq!(seqs, vec![43, 44]);
            assert!(events[0].is_kill());
        }
        other => panic!("expected replay, got {:?}", other),
    }
}

#[tokio::test]
async fn test_resume_past_retention_yields_snapshot() {
    let mut config = GuardConfig::default();
    config.broadcast.retention = 8;
    let (guard, _) = guard_with(config);
    let bob = UserId::new("bob");

    let latest = churn(&guard, &bob, 60).await;
    let (_sub, start) = guard.subscribe(&bob, Some(42)).await;
    match start {
        StreamStart::Snapshot(snapshot) => {
            assert_eq!(snapshot.seq, latest);
            assert_eq!(snapshot.allocation.accounts.len(), 1);
        }
        other => panic!("expected snapshot, got {:?}", other),
    }
}

#[tokio::test]
async fn test_acknowledged_heartbeats_keep_observer() {
    let (guard, _) = guard_with(GuardConfig::default());
    let carol = UserId::new("carol");
    let (sub, _) = guard.subscribe(&carol, None).await;

    for _ in 0..5 {
        guard.maintenance_tick();
        assert!(matches!(sub.try_recv(), Some(Delivery::Heartbeat { .. })));
        sub.ack_heartbeat();
    }
    assert!(!sub.is_released());
    assert_eq!(guard.broadcaster().observer_count(&carol), 1);
}

#[tokio::test]
async fn test_observers_see_identical_order() {
    let (guard, _) = guard_with(GuardConfig::default());
    let dave = UserId::new("dave");
    let (first, _) = guard.subscribe(&dave, Some(0)).await;
    let (second, _) = guard.subscribe(&dave, Some(0)).await;

    churn(&guard, &dave, 5).await;
    guard.mode().emergency_stop(&dave);

    let drain = |sub: &guard_core::Subscription| {
        let mut seqs = Vec::new();
        while let Some(Delivery::Event(e)) = sub.try_recv() {
            seqs.push(e.seq);
        }
        seqs
    };
    let a = drain(&first);
    assert_eq!(a, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(a, drain(&second));
}

async fn start_push_server(guard: Arc<TradingGuard>) -> (String, Arc<PushServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(PushServer::new(PushServerConfig::default(), guard));
    let running = Arc::clone(&server);
    tokio::spawn(async move { running.serve(listener).await });
    (format!("ws://{}", addr), server)
}

async fn next_json<S>(ws: &mut S) -> serde_json::Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_websocket_snapshot_then_events() {
    let (guard, identity) = guard_with(GuardConfig::default());
    identity.insert_token("tok-erin", "erin", 5);
    let erin = UserId::new("erin");
    churn(&guard, &erin, 3).await;

    let (url, server) = start_push_server(Arc::clone(&guard)).await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(Message::Text(
        r#"{"type":"subscribe","token":"tok-erin"}"#.to_string(),
    ))
    .await
    .unwrap();

    let snapshot = next_json(&mut ws).await;
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["seq"], 3);
    assert_eq!(snapshot["payload"]["mode"]["phase"], "paper");

    guard.mode().emergency_stop(&erin);
    let event = next_json(&mut ws).await;
    assert_eq!(event["type"], "mode_changed");
    assert_eq!(event["seq"], 4);
    assert_eq!(event["payload"]["to"], "killed");
    assert_eq!(event["payload"]["directive"], "halt_and_flatten");

    let _ = server.shutdown_handle().send(());
}

#[tokio::test]
async fn test_websocket_resume_replays_missed_events() {
    let (guard, identity) = guard_with(GuardConfig::default());
    identity.insert_token("tok-frank", "frank", 5);
    let frank = UserId::new("frank");
    churn(&guard, &frank, 4).await;

    let (url, server) = start_push_server(Arc::clone(&guard)).await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(Message::Text(
        r#"{"type":"subscribe","token":"tok-frank","lastSeenSeq":2}"#.to_string(),
    ))
    .await
    .unwrap();

    assert_eq!(next_json(&mut ws).await["seq"], 3);
    assert_eq!(next_json(&mut ws).await["seq"], 4);

    let _ = server.shutdown_handle().send(());
}

#[tokio::test]
async fn test_websocket_rejects_bad_token() {
    let (guard, _) = guard_with(GuardConfig::default());
    let (url, server) = start_push_server(guard).await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(Message::Text(
        r#"{"type":"subscribe","token":"nope"}"#.to_string(),
    ))
    .await
    .unwrap();

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["payload"]["errorKind"], "auth");

    let _ = server.shutdown_handle().send(());
}
