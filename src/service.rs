//! The chat service façade.
//!
//! One `ChatService` exists per process.  [`ChatService::start`] opens the
//! store, spawns the processing lane, builds the notification policy, and
//! wires the broker subscription so every inbound frame becomes a receive
//! task.  The UI layer talks only to this type: sending a message, marking
//! which conversation is on screen, toggling notifications, and driving the
//! connect/disconnect lifecycle (app start, network restored, logout).
//!
//! Outgoing flow: [`send_message_to_user`](ChatService::send_message_to_user)
//! builds the wire payload and queues a send task.  The lane persists the
//! `sending` row first, then hands back a receipt; only at that point is the
//! blocking publish dispatched, off the lane, with the row id attached so a
//! failure can mark that row `failed`.  Exactly one publish attempt is made.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bslog;
use crate::logging;
use crate::notify::{NotificationPolicy, NotificationSink};
use crate::pipeline::{
    OutboundPayload, Pipeline, PipelineConfig, PipelineError, ProcessTask, SendReceipt,
};
use crate::settings::{Settings, KEY_NOTIFICATIONS_ENABLED};
use crate::store::{Store, StoreConfig, StoreError};
use crate::timefmt::now_protocol_timestamp;
use crate::transport::{self, BrokerConfig, ConnectionManager, ConnectionPhase, ConnectivityProbe};

#[derive(Debug)]
pub enum ServiceError {
    Store(StoreError),
    Pipeline(PipelineError),
    Serialize(serde_json::Error),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Store(e) => write!(f, "store: {e}"),
            ServiceError::Pipeline(e) => write!(f, "pipeline: {e}"),
            ServiceError::Serialize(e) => write!(f, "payload serialize: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        ServiceError::Store(e)
    }
}

impl From<PipelineError> for ServiceError {
    fn from(e: PipelineError) -> Self {
        ServiceError::Pipeline(e)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Serialize(e)
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// The signed-in user this device acts as.
    pub local_user_id: String,
    pub store: StoreConfig,
    pub broker: BrokerConfig,
}

pub struct ChatService {
    config: ChatConfig,
    store: Store,
    pipeline: Pipeline,
    connection: ConnectionManager,
    policy: NotificationPolicy,
    settings: Settings,
    inbound_pump: JoinHandle<()>,
}

impl ChatService {
    /// Open the store and assemble the subsystem.  Must run on a tokio
    /// runtime.  The broker subscription is not started here; call
    /// [`connect`](Self::connect) when the app is ready.
    pub fn start(
        config: ChatConfig,
        settings: Settings,
        sink: Box<dyn NotificationSink>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Result<Self, ServiceError> {
        let store = Store::open(&config.store)?;
        let policy = NotificationPolicy::new(sink, &settings);
        let pipeline = Pipeline::spawn(
            store.clone(),
            PipelineConfig::new(config.local_user_id.clone()),
            Box::new(policy.clone()),
        );

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<String>();
        let connection = ConnectionManager::new(config.broker.clone(), probe, inbound_tx);

        // Frames arrive here in subscription order and are queued onto the
        // lane in the same order.
        let lane = pipeline.handle();
        let inbound_pump = tokio::spawn(async move {
            while let Some(payload) = inbound_rx.recv().await {
                if lane.submit(ProcessTask::Receive { payload }).is_err() {
                    return;
                }
            }
        });

        bslog!(
            "service: started for {}",
            logging::user_id(&config.local_user_id)
        );
        Ok(Self {
            config,
            store,
            pipeline,
            connection,
            policy,
            settings,
            inbound_pump,
        })
    }

    /// Read access for the UI's live queries and history reads.
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn connection_phase(&self) -> ConnectionPhase {
        self.connection.phase()
    }

    /// Subscribe to the broker queue.  Safe to call repeatedly: on app
    /// start, on network-restored, after a logout/login cycle.
    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Tear down the subscription (logout).  Queued lane tasks still drain.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Queue a message to `to_user_id`.  `client_timestamp` is the wire-form
    /// send time; pass `None` to stamp with the current wall clock.
    ///
    /// Returns once the task is queued.  Persistence and the publish happen
    /// on the lane; a publish failure marks the row `failed`, it is not
    /// retried.
    pub fn send_message_to_user(
        &self,
        to_user_id: &str,
        text: &str,
        client_timestamp: Option<String>,
    ) -> Result<(), ServiceError> {
        let payload = serde_json::to_string(&OutboundPayload {
            sender_id: self.config.local_user_id.clone(),
            receiver_id: to_user_id.to_string(),
            sent_at: client_timestamp.unwrap_or_else(now_protocol_timestamp),
            message: text.to_string(),
        })?;

        let store = self.store.clone();
        let http_base = self.config.broker.http_base.clone();
        let receiver = to_user_id.to_string();
        self.pipeline.submit(ProcessTask::Send {
            payload,
            on_persisted: Box::new(move |receipt| {
                publish_receipt(store, http_base, receiver, receipt);
            }),
        })?;
        Ok(())
    }

    /// Mark which user's conversation is on screen (suppresses their
    /// notifications), or `None` when leaving the detail view.
    pub fn set_current_chatting_user_id(&self, user_id: Option<String>) {
        self.policy.set_current_chatting_user(user_id);
    }

    /// Reset the unread counter and remove the displayed notification.
    pub fn clear_chat_notifications(&self) {
        self.policy.clear();
    }

    /// Persist the notifications master switch; the policy picks it up via
    /// the settings change hook.
    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.settings.set_bool(KEY_NOTIFICATIONS_ENABLED, enabled);
    }

    /// Disconnect and drain the lane.  Queued store writes complete; nothing
    /// is aborted mid-write.
    pub async fn shutdown(self) {
        self.connection.disconnect();
        self.inbound_pump.abort();
        self.pipeline.shutdown().await;
        bslog!("service: shut down");
    }
}

/// Dispatch the single publish attempt for a freshly persisted row.  Runs
/// the blocking HTTP call off the lane and records a terminal `failed`
/// status if it errors.
fn publish_receipt(store: Store, http_base: String, receiver: String, receipt: SendReceipt) {
    tokio::spawn(async move {
        let row_id = receipt.row_id;
        let outcome = tokio::task::spawn_blocking(move || {
            transport::publish(&http_base, &receiver, &receipt.payload)
        })
        .await;

        let error = match outcome {
            Ok(Ok(())) => {
                bslog!("service: published row {row_id}");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(join_err) => join_err.to_string(),
        };
        bslog!("service: publish failed for row {row_id}: {error}");
        if let Err(e) = store.mark_message_failed(row_id) {
            bslog!("service: could not mark row {row_id} failed: {e}");
        }
    });
}
