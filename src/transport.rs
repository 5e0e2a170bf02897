//! Broker connection management and publish transport.
//!
//! Receiving and sending take different paths.  Inbound delivery is a
//! WebSocket subscription to the broker's per-user queue
//! (`{ws_base}/queue/{user_id}`); every text frame that arrives is forwarded
//! verbatim to the owner's inbound channel, to be queued on the processing
//! lane.  Outbound delivery is a plain blocking HTTP POST to
//! `{http_base}/publish/{receiver_id}`, exactly one attempt per message.
//!
//! The subscription is supervised by [`ConnectionManager`]: a small mutex-held
//! state machine (`Idle → Connecting → Connected`) plus one session task per
//! connect cycle.  Failed attempts retry on a linear schedule — the base
//! interval times the consecutive-failure count, with the count capped — and
//! the schedule resets to the base as soon as a connect succeeds.  A manual
//! disconnect cancels the session and any pending retry; a missing
//! precondition (no network, no signed-in user) abandons the attempt without
//! scheduling anything.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::bslog;
use crate::logging;

/// Linear backoff base interval.
pub const BASE_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Cap on the failure count used as the backoff multiplier.
pub const MAX_BACKOFF_MULTIPLIER: u32 = 180;

/// Retry delay after `consecutive_failures` failed attempts:
/// `base × min(failures, cap)`, so the schedule grows linearly to a ceiling
/// of fifteen minutes.
pub fn reconnect_delay(consecutive_failures: u32) -> Duration {
    BASE_RECONNECT_INTERVAL * consecutive_failures.clamp(1, MAX_BACKOFF_MULTIPLIER)
}

// ---------------------------------------------------------------------------
// Publish path
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum TransportError {
    /// The single publish attempt failed (connection or HTTP status).
    Publish(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Publish(e) => write!(f, "broker publish failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// POST a payload to the broker's publish endpoint for `receiver_id`.
///
/// Blocking; callers on an async runtime wrap this in `spawn_blocking`.
/// One attempt only — the caller records the outcome, there is no retry.
pub fn publish(http_base: &str, receiver_id: &str, payload: &str) -> Result<(), TransportError> {
    let url = format!(
        "{}/publish/{}",
        http_base.trim_end_matches('/'),
        receiver_id
    );
    ureq::post(&url)
        .set("content-type", "application/json")
        .send_string(payload)
        .map_err(|e| TransportError::Publish(e.to_string()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subscription state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
}

/// Environment checks consulted before every connection attempt.
pub trait ConnectivityProbe: Send + Sync {
    fn network_available(&self) -> bool;
    /// The signed-in user, if any; also the queue name to subscribe to.
    fn local_user_id(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// WebSocket base, e.g. `ws://broker.example:9090`.
    pub ws_base: String,
    /// HTTP base for publishes, e.g. `http://broker.example:9090`.
    pub http_base: String,
}

struct ConnState {
    phase: ConnectionPhase,
    consecutive_failures: u32,
    /// Set by [`ConnectionManager::disconnect`]; suppresses all retries
    /// until the next explicit connect.
    manual_disconnect: bool,
    /// Bumped on every connect/disconnect; a session task whose generation
    /// no longer matches is stale and must exit without touching state.
    generation: u64,
}

struct ManagerInner {
    config: BrokerConfig,
    probe: Arc<dyn ConnectivityProbe>,
    inbound: mpsc::UnboundedSender<String>,
    state: Mutex<ConnState>,
    /// Wakes a session out of its read loop or retry sleep on disconnect.
    cancel: Notify,
}

/// Supervises the broker queue subscription.  Cheap to clone; all clones
/// share one state machine.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// `inbound` receives every text frame the broker pushes, in arrival
    /// order.
    pub fn new(
        config: BrokerConfig,
        probe: Arc<dyn ConnectivityProbe>,
        inbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                probe,
                inbound,
                state: Mutex::new(ConnState {
                    phase: ConnectionPhase::Idle,
                    consecutive_failures: 0,
                    manual_disconnect: false,
                    generation: 0,
                }),
                cancel: Notify::new(),
            }),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.state.lock().unwrap().phase
    }

    /// Start (or re-start) the subscription.  Idempotent: a call while a
    /// session is already connecting or connected does nothing, so repeated
    /// triggers never stack parallel sessions or extra retry timers.
    pub fn connect(&self) {
        let generation = {
            let mut st = self.inner.state.lock().unwrap();
            if st.phase != ConnectionPhase::Idle {
                return;
            }
            st.manual_disconnect = false;
            st.phase = ConnectionPhase::Connecting;
            st.generation += 1;
            st.generation
        };
        let mgr = self.clone();
        tokio::spawn(async move { mgr.session_loop(generation).await });
    }

    /// Tear down the subscription and cancel any pending retry.  No
    /// reconnection happens until the next [`connect`](Self::connect).
    pub fn disconnect(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            st.manual_disconnect = true;
            st.phase = ConnectionPhase::Idle;
            st.consecutive_failures = 0;
            st.generation += 1;
        }
        self.inner.cancel.notify_waiters();
        bslog!("transport: disconnected from broker");
    }

    fn is_stale(&self, generation: u64) -> bool {
        let st = self.inner.state.lock().unwrap();
        st.generation != generation || st.manual_disconnect
    }

    /// Precondition gate for one attempt.  Returns the queue user id, or
    /// `None` to abandon the whole connect cycle.
    fn check_preconditions(&self, generation: u64) -> Option<String> {
        if !self.inner.probe.network_available() {
            self.abandon(generation, "network unavailable");
            return None;
        }
        match self.inner.probe.local_user_id() {
            Some(uid) => Some(uid),
            None => {
                self.abandon(generation, "no signed-in user");
                None
            }
        }
    }

    fn abandon(&self, generation: u64, reason: &str) {
        let mut st = self.inner.state.lock().unwrap();
        if st.generation == generation {
            st.phase = ConnectionPhase::Idle;
            st.consecutive_failures = 0;
        }
        bslog!("transport: connect abandoned: {reason}");
    }

    fn mark_connected(&self, generation: u64) -> bool {
        let mut st = self.inner.state.lock().unwrap();
        if st.generation != generation || st.manual_disconnect {
            return false;
        }
        st.phase = ConnectionPhase::Connected;
        st.consecutive_failures = 0;
        true
    }

    /// Record a failed attempt (or dropped session) and return the delay
    /// before the next one, or `None` if the cycle was cancelled.
    fn next_retry_delay(&self, generation: u64) -> Option<Duration> {
        let mut st = self.inner.state.lock().unwrap();
        if st.generation != generation || st.manual_disconnect {
            return None;
        }
        st.phase = ConnectionPhase::Connecting;
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        Some(reconnect_delay(st.consecutive_failures))
    }

    async fn session_loop(self, generation: u64) {
        loop {
            if self.is_stale(generation) {
                return;
            }
            let uid = match self.check_preconditions(generation) {
                Some(uid) => uid,
                None => return,
            };
            let ws_url = format!(
                "{}/queue/{}",
                self.inner.config.ws_base.trim_end_matches('/'),
                uid
            );

            match connect_async(&ws_url).await {
                Ok((ws_stream, _response)) => {
                    if !self.mark_connected(generation) {
                        return;
                    }
                    bslog!("transport: subscribed as {}", logging::user_id(&uid));

                    let (_write, mut read) = ws_stream.split();
                    loop {
                        let frame = tokio::select! {
                            frame = read.next() => frame,
                            _ = self.inner.cancel.notified() => {
                                if self.is_stale(generation) {
                                    return;
                                }
                                continue;
                            }
                        };
                        match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                let _ = self.inner.inbound.send(text);
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Err(e)) => {
                                bslog!("transport: broker socket error: {e}");
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
                Err(e) => {
                    bslog!("transport: broker connect failed: {e}");
                }
            }

            let delay = match self.next_retry_delay(generation) {
                Some(d) => d,
                None => return,
            };
            bslog!("transport: reconnecting in {}s", delay.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.cancel.notified() => {
                    if self.is_stale(generation) {
                        return;
                    }
                }
            }
        }
    }
}
