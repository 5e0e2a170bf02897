//! End-to-end tests against an in-process broker.
//!
//! The broker stub below implements the two endpoints the transport layer
//! uses: a per-user WebSocket queue (`GET /queue/:user_id`) and a publish
//! endpoint (`POST /publish/:receiver_id`).  A published payload is rewrapped
//! into the inbound frame shape and fanned out to the receiver's queue *and*
//! back to the sender's own queue, which is what drives the self-echo
//! acknowledgment path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use bookswap_chat::notify::{ChatNotification, NotificationSink, TapTarget};
use bookswap_chat::service::{ChatConfig, ChatService};
use bookswap_chat::settings::Settings;
use bookswap_chat::store::{chat_id_for, MessageStatus, StoreConfig};
use bookswap_chat::timefmt::now_protocol_timestamp;
use bookswap_chat::transport::{BrokerConfig, ConnectionPhase, ConnectivityProbe};

// ---------------------------------------------------------------------------
// Broker stub
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct BrokerState {
    subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>>,
}

impl BrokerState {
    fn deliver(&self, user_id: &str, frame: &str) {
        if let Some(queues) = self.subscribers.lock().unwrap().get_mut(user_id) {
            queues.retain(|tx| tx.send(frame.to_string()).is_ok());
        }
    }
}

async fn queue_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<BrokerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| subscriber_loop(socket, user_id, state))
}

async fn subscriber_loop(mut socket: WebSocket, user_id: String, state: BrokerState) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state
        .subscribers
        .lock()
        .unwrap()
        .entry(user_id)
        .or_default()
        .push(tx);
    while let Some(frame) = rx.recv().await {
        if socket.send(Message::Text(frame)).await.is_err() {
            break;
        }
    }
}

#[derive(Deserialize)]
struct PublishBody {
    sender_id: String,
    sent_at: String,
    message: String,
}

async fn publish_handler(
    Path(receiver_id): Path<String>,
    State(state): State<BrokerState>,
    body: String,
) -> StatusCode {
    let parsed: PublishBody = match serde_json::from_str(&body) {
        Ok(p) => p,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    let frame = serde_json::json!({
        "sender": { "id": parsed.sender_id },
        "receiver": { "id": receiver_id },
        "message": parsed.message,
        "sent_at": parsed.sent_at,
        "time": now_protocol_timestamp(),
    })
    .to_string();
    state.deliver(&receiver_id, &frame);
    if parsed.sender_id != receiver_id {
        // Fan the message back to the sender's own queue (the self-echo).
        state.deliver(&parsed.sender_id, &frame);
    }
    StatusCode::OK
}

async fn start_broker() -> (BrokerConfig, oneshot::Sender<()>) {
    let state = BrokerState::default();
    let app: Router = Router::new()
        .route("/queue/:user_id", get(queue_handler))
        .route("/publish/:receiver_id", post(publish_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind broker");
    let addr = listener.local_addr().expect("broker addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    let config = BrokerConfig {
        ws_base: format!("ws://{addr}"),
        http_base: format!("http://{addr}"),
    };
    (config, shutdown_tx)
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

struct OnlineProbe {
    user: String,
}

impl ConnectivityProbe for OnlineProbe {
    fn network_available(&self) -> bool {
        true
    }
    fn local_user_id(&self) -> Option<String> {
        Some(self.user.clone())
    }
}

#[derive(Default)]
struct SinkLog {
    shown: Vec<ChatNotification>,
    cancels: usize,
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<SinkLog>>);

impl NotificationSink for SharedSink {
    fn show(&mut self, notification: &ChatNotification) {
        self.0.lock().unwrap().shown.push(notification.clone());
    }
    fn cancel(&mut self) {
        self.0.lock().unwrap().cancels += 1;
    }
}

fn start_service(
    user: &str,
    broker: &BrokerConfig,
    dir: &tempfile::TempDir,
) -> (ChatService, SharedSink, Settings) {
    let sink = SharedSink::default();
    let settings = Settings::new();
    let service = ChatService::start(
        ChatConfig {
            local_user_id: user.to_string(),
            store: StoreConfig {
                path: dir.path().join(format!("{user}.db")),
            },
            broker: broker.clone(),
        },
        settings.clone(),
        Box::new(sink.clone()),
        Arc::new(OnlineProbe {
            user: user.to_string(),
        }),
    )
    .expect("start service");
    (service, sink, settings)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_connected(service: &ChatService) {
    wait_until("broker subscription", || {
        service.connection_phase() == ConnectionPhase::Connected
    })
    .await;
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn send_echo_marks_row_sent() {
    let (broker, broker_shutdown) = start_broker().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let (alice, _sink, _settings) = start_service("alice", &broker, &dir);

    alice.connect();
    wait_connected(&alice).await;

    alice
        .send_message_to_user("bob", "hello", Some("2026-05-10 09:00:00".to_string()))
        .expect("send");

    let chat_id = chat_id_for("alice", "bob");
    let store = alice.store().clone();
    let chat_in_wait = chat_id.clone();
    wait_until("echo to confirm the row", move || {
        store
            .list_messages(&chat_in_wait)
            .expect("list")
            .first()
            .map(|row| row.status == MessageStatus::Sent)
            .unwrap_or(false)
    })
    .await;

    let rows = alice.store().list_messages(&chat_id).expect("list");
    assert_eq!(rows.len(), 1, "echo must not create a second row");
    assert_eq!(rows[0].body, "hello");
    assert_eq!(rows[0].sent_at, "2026-05-10 09:00:00");
    assert!(rows[0].delivered_at.is_some(), "delivery time recorded");

    let chats = alice.store().list_chats().expect("chats");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].chat_id, chat_id);
    assert_eq!(chats[0].unread_count, 0);
    assert_eq!(chats[0].last_message_id, Some(rows[0].id));

    alice.shutdown().await;
    let _ = broker_shutdown.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn delivery_reaches_receiver_and_notifies() {
    let (broker, broker_shutdown) = start_broker().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let (alice, _alice_sink, _s1) = start_service("alice", &broker, &dir);
    let (bob, bob_sink, _s2) = start_service("bob", &broker, &dir);

    alice.connect();
    bob.connect();
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    // A live chat-list query on bob's side should go dirty on arrival.
    let bob_chat_list = bob.store().live_chat_list();
    assert!(!bob_chat_list.is_dirty());

    alice
        .send_message_to_user("bob", "want to trade?", Some("2026-05-10 09:01:00".to_string()))
        .expect("send");

    let chat_id = chat_id_for("alice", "bob");
    let bob_store = bob.store().clone();
    let chat_in_wait = chat_id.clone();
    wait_until("message to reach bob", move || {
        !bob_store.list_messages(&chat_in_wait).expect("list").is_empty()
    })
    .await;

    let rows = bob.store().list_messages(&chat_id).expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, MessageStatus::Received);
    assert_eq!(rows[0].sender_id, "alice");

    let chat = bob
        .store()
        .get_chat(&chat_id)
        .expect("get")
        .expect("summary exists");
    assert_eq!(chat.other_user_id, "alice");
    assert_eq!(chat.unread_count, 1);

    assert!(bob_chat_list.is_dirty(), "live query invalidated by arrival");
    assert_eq!(bob_chat_list.run().expect("run").len(), 1);

    let shown = bob_sink.0.lock().unwrap();
    assert_eq!(shown.shown.len(), 1);
    assert_eq!(shown.shown[0].title, "alice", "falls back to the user id");
    assert_eq!(shown.shown[0].body, "want to trade?");
    assert_eq!(
        shown.shown[0].tap,
        TapTarget::ChatDetail {
            chat_id: chat_id.clone(),
            user_id: "alice".to_string(),
        }
    );
    drop(shown);

    // Meanwhile alice's own copy got echo-confirmed.
    let alice_store = alice.store().clone();
    let chat_in_wait = chat_id.clone();
    wait_until("alice's echo", move || {
        alice_store
            .list_messages(&chat_in_wait)
            .expect("list")
            .first()
            .map(|row| row.status == MessageStatus::Sent)
            .unwrap_or(false)
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
    let _ = broker_shutdown.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_failure_marks_row_failed() {
    // Nothing listens on the discard port, so the single publish attempt
    // fails; the row must land in `failed` with the summary untouched.
    let broker = BrokerConfig {
        ws_base: "ws://127.0.0.1:9".to_string(),
        http_base: "http://127.0.0.1:9".to_string(),
    };
    let dir = tempfile::tempdir().expect("tempdir");
    let (alice, _sink, _settings) = start_service("alice", &broker, &dir);

    alice
        .send_message_to_user("bob", "lost", Some("2026-05-10 09:02:00".to_string()))
        .expect("send");

    let chat_id = chat_id_for("alice", "bob");
    let store = alice.store().clone();
    let chat_in_wait = chat_id.clone();
    wait_until("publish failure", move || {
        store
            .list_messages(&chat_in_wait)
            .expect("list")
            .first()
            .map(|row| row.status == MessageStatus::Failed)
            .unwrap_or(false)
    })
    .await;

    let rows = alice.store().list_messages(&chat_id).expect("list");
    assert_eq!(rows.len(), 1, "failure creates no extra rows");
    let chat = alice
        .store()
        .get_chat(&chat_id)
        .expect("get")
        .expect("summary exists");
    assert_eq!(
        chat.last_message_id,
        Some(rows[0].id),
        "summary still points at the original write"
    );

    alice.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn active_conversation_suppresses_the_notification() {
    let (broker, broker_shutdown) = start_broker().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let (alice, _alice_sink, _s1) = start_service("alice", &broker, &dir);
    let (bob, bob_sink, _s2) = start_service("bob", &broker, &dir);

    alice.connect();
    bob.connect();
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    // Bob has alice's conversation on screen.
    bob.set_current_chatting_user_id(Some("alice".to_string()));

    alice
        .send_message_to_user("bob", "you there?", Some("2026-05-10 09:03:00".to_string()))
        .expect("send");

    let chat_id = chat_id_for("alice", "bob");
    let bob_store = bob.store().clone();
    let chat_in_wait = chat_id.clone();
    wait_until("message to reach bob", move || {
        !bob_store.list_messages(&chat_in_wait).expect("list").is_empty()
    })
    .await;

    assert!(
        bob_sink.0.lock().unwrap().shown.is_empty(),
        "on-screen conversation renders live, no notification"
    );

    // Leaving the screen and clearing makes the next message notify again.
    bob.set_current_chatting_user_id(None);
    bob.clear_chat_notifications();
    assert_eq!(bob_sink.0.lock().unwrap().cancels, 1);

    alice
        .send_message_to_user("bob", "ping", Some("2026-05-10 09:04:00".to_string()))
        .expect("send");
    let bob_sink_in_wait = bob_sink.clone();
    wait_until("notification after leaving the screen", move || {
        !bob_sink_in_wait.0.lock().unwrap().shown.is_empty()
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
    let _ = broker_shutdown.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn notifications_toggle_takes_effect_without_restart() {
    let (broker, broker_shutdown) = start_broker().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let (alice, _alice_sink, _s1) = start_service("alice", &broker, &dir);
    let (bob, bob_sink, _s2) = start_service("bob", &broker, &dir);

    alice.connect();
    bob.connect();
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    bob.set_notifications_enabled(false);
    alice
        .send_message_to_user("bob", "silent", Some("2026-05-10 09:05:00".to_string()))
        .expect("send");

    let chat_id = chat_id_for("alice", "bob");
    let bob_store = bob.store().clone();
    let chat_in_wait = chat_id.clone();
    wait_until("message to reach bob", move || {
        !bob_store.list_messages(&chat_in_wait).expect("list").is_empty()
    })
    .await;
    assert!(bob_sink.0.lock().unwrap().shown.is_empty());

    bob.set_notifications_enabled(true);
    alice
        .send_message_to_user("bob", "loud", Some("2026-05-10 09:06:00".to_string()))
        .expect("send");
    let bob_sink_in_wait = bob_sink.clone();
    wait_until("notification after re-enabling", move || {
        !bob_sink_in_wait.0.lock().unwrap().shown.is_empty()
    })
    .await;
    assert_eq!(bob_sink.0.lock().unwrap().shown[0].body, "loud");

    alice.shutdown().await;
    bob.shutdown().await;
    let _ = broker_shutdown.send(());
}
