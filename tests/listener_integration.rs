//! Market listener against a local WebSocket server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use polyinsider::models::Trade;
use polyinsider::queue;
use polyinsider::scrapers::{ConnectionState, Listener, ListenerConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

fn book_frame(asset_id: &str, price: &str) -> String {
    serde_json::json!([{
        "event_type": "book",
        "asset_id": asset_id,
        "market": "0xmarket",
        "last_trade_price": price,
        "timestamp": "1700000000000"
    }])
    .to_string()
}

fn fast_config(url: String) -> ListenerConfig {
    ListenerConfig {
        url,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        handshake_timeout: Duration::from_secs(2),
        ..ListenerConfig::default()
    }
}

/// What the server saw on each accepted connection.
#[derive(Debug)]
enum Seen {
    Subscription(serde_json::Value),
    Ping,
}

/// Serve connections. Connection `n` (0-based) gets `frames[n]` after the
/// subscription; `drop_after[n]` closes it right after.
async fn spawn_server(
    frames: Vec<Vec<String>>,
    drop_after: Vec<bool>,
) -> (String, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut n = 0usize;
        while let Ok((stream, _)) = listener.accept().await {
            let frames = frames.get(n).cloned().unwrap_or_default();
            let drop_now = drop_after.get(n).copied().unwrap_or(false);
            let seen_tx = seen_tx.clone();
            n += 1;

            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                if let Some(Ok(Message::Text(sub))) = ws.next().await {
                    let _ = seen_tx.send(Seen::Subscription(
                        serde_json::from_str(&sub).unwrap_or_default(),
                    ));
                }
                for frame in frames {
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
                if drop_now {
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Ping(_) = msg {
                        let _ = seen_tx.send(Seen::Ping);
                    }
                }
            });
        }
    });

    (format!("ws://{addr}/ws/"), seen_rx)
}

/// Every connection reads the subscription, then holds the socket without
/// reading or writing again, so pings go unanswered.
async fn spawn_silent_server() -> (String, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                if let Some(Ok(Message::Text(sub))) = ws.next().await {
                    let _ = seen_tx.send(Seen::Subscription(
                        serde_json::from_str(&sub).unwrap_or_default(),
                    ));
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(ws);
            });
        }
    });

    (format!("ws://{addr}/ws/"), seen_rx)
}

async fn next_subscription(seen: &mut mpsc::UnboundedReceiver<Seen>) -> serde_json::Value {
    loop {
        match timeout(WAIT, seen.recv()).await.unwrap().unwrap() {
            Seen::Subscription(v) => return v,
            Seen::Ping => continue,
        }
    }
}

async fn next_trade(rx: &mut mpsc::Receiver<Trade>) -> Trade {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_subscribes_and_dispatches_trades() {
    let (url, mut seen) = spawn_server(
        vec![vec![book_frame("a1", "0.42"), "garbage".to_string()]],
        vec![false],
    )
    .await;

    let (tx, mut rx) = queue::bounded("trades", 16);
    let listener = Listener::new(fast_config(url), tx);
    listener.set_asset_ids(vec!["a1".into(), "a2".into()]);
    listener.start();

    let sub = next_subscription(&mut seen).await;
    assert_eq!(sub["type"], "market");
    assert_eq!(sub["assets_ids"], serde_json::json!(["a1", "a2"]));

    let trade = next_trade(&mut rx).await;
    assert_eq!(trade.asset_id, "a1");
    assert_eq!(trade.market_id, "0xmarket");
    assert!((trade.price - 0.42).abs() < 1e-12);
    assert_eq!(trade.value_usd, 0.0);

    // Let the garbage frame land as well.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(listener.state(), ConnectionState::Reading);
    let stats = listener.stats();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.trades_dispatched, 1);
    assert_eq!(stats.parse_errors, 1);

    timeout(WAIT, listener.stop()).await.unwrap();
    assert_eq!(listener.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_empty_subscription_is_sent() {
    let (url, mut seen) = spawn_server(vec![], vec![]).await;
    let (tx, _rx) = queue::bounded("trades", 1);
    let listener = Listener::new(fast_config(url), tx);
    listener.start();

    let sub = next_subscription(&mut seen).await;
    assert_eq!(sub["assets_ids"], serde_json::json!([]));

    timeout(WAIT, listener.stop()).await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let (url, mut seen) = spawn_server(
        vec![vec![book_frame("first", "0.10")], vec![book_frame("second", "0.20")]],
        vec![true, false],
    )
    .await;

    let (tx, mut rx) = queue::bounded("trades", 16);
    let listener = Listener::new(fast_config(url), tx);
    listener.set_asset_ids(vec!["x".into()]);
    listener.start();

    next_subscription(&mut seen).await;
    assert_eq!(next_trade(&mut rx).await.asset_id, "first");

    // Same subscription set on the new connection.
    let sub = next_subscription(&mut seen).await;
    assert_eq!(sub["assets_ids"], serde_json::json!(["x"]));
    assert_eq!(next_trade(&mut rx).await.asset_id, "second");

    let stats = listener.stats();
    assert_eq!(stats.connections, 2);
    assert!(stats.reconnects >= 1);

    timeout(WAIT, listener.stop()).await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_pings_idle_connection() {
    let (url, mut seen) = spawn_server(vec![], vec![]).await;
    let (tx, _rx) = queue::bounded("trades", 1);
    let config = ListenerConfig {
        heartbeat_timeout: Duration::from_millis(100),
        pong_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(50),
        ..fast_config(url)
    };
    let listener = Listener::new(config, tx);
    listener.start();

    next_subscription(&mut seen).await;
    loop {
        if let Seen::Ping = timeout(WAIT, seen.recv()).await.unwrap().unwrap() {
            break;
        }
    }

    timeout(WAIT, listener.stop()).await.unwrap();
}

#[tokio::test]
async fn test_silent_connection_is_replaced() {
    let (url, mut seen) = spawn_silent_server().await;
    let (tx, _rx) = queue::bounded("trades", 1);
    let config = ListenerConfig {
        initial_backoff: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(100),
        pong_timeout: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(50),
        ..fast_config(url)
    };
    let listener = Listener::new(config, tx);
    listener.set_asset_ids(vec!["quiet".into()]);
    listener.start();

    next_subscription(&mut seen).await;
    // The dead connection hits the read deadline and a new one subscribes.
    let sub = next_subscription(&mut seen).await;
    assert_eq!(sub["assets_ids"], serde_json::json!(["quiet"]));

    let stats = listener.stats();
    assert!(stats.connections >= 2);
    assert!(stats.reconnects >= 1);
    assert_eq!(stats.trades_dispatched, 0);

    timeout(WAIT, listener.stop()).await.unwrap();
    assert_eq!(listener.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_stop_during_backoff_returns_promptly() {
    // Grab a free port, then close it so every connect fails.
    let addr = {
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        placeholder.local_addr().unwrap()
    };

    let (tx, _rx) = queue::bounded("trades", 1);
    let config = ListenerConfig {
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(60),
        ..fast_config(format!("ws://{addr}/ws/"))
    };
    let listener = Listener::new(config, tx);
    listener.start();

    let deadline = tokio::time::Instant::now() + WAIT;
    while listener.state() != ConnectionState::Backoff {
        assert!(tokio::time::Instant::now() < deadline, "never entered backoff");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    timeout(Duration::from_secs(2), listener.stop())
        .await
        .expect("stop should interrupt the backoff wait");
    assert_eq!(listener.state(), ConnectionState::Stopped);
    assert_eq!(listener.stats().connections, 0);
}
