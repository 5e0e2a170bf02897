//! The serial message-processing lane.
//!
//! All chat payloads — outgoing sends and raw inbound broker frames — are
//! turned into store mutations here, on a single FIFO worker.  One task runs
//! at a time, in submission order, which is what keeps near-simultaneous
//! events for the same chat id from racing on the summary upsert.
//!
//! The lane blocks only on local storage writes.  The network publish for an
//! outgoing message is dispatched by the caller from inside the
//! [`ProcessTask::Send`] callback, *after* the row is durably visible
//! locally: a message is never published before it exists in the store.
//!
//! A failed task (malformed payload, unparseable timestamp) is logged and
//! dropped; it neither stops the lane nor touches earlier or later tasks.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bslog;
use crate::logging;
use crate::store::{
    chat_id_for, ChatUpsert, MessageStatus, NewChatMessage, Store, StoreError, UserRow,
};
use crate::timefmt::{DerivedTimestamps, TimeError, TimestampFormatter};

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Outbound publish body, built by the façade and parsed back here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub sender_id: String,
    pub receiver_id: String,
    pub sent_at: String,
    pub message: String,
}

/// Participant sub-object on inbound frames.  Only the id is required; the
/// display attributes feed the user cache when present.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundUser {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Inbound broker frame: `sent_at` is the sender's clock, `time` is the
/// broker's delivery clock.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundPayload {
    pub sender: InboundUser,
    pub receiver: InboundUser,
    pub message: String,
    pub sent_at: String,
    pub time: String,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Handed to the send callback once local persistence succeeded.
#[derive(Debug)]
pub struct SendReceipt {
    /// Store-assigned row id; carried as metadata on the network publish so
    /// a later failure can be correlated back to the row.
    pub row_id: i64,
    /// The original payload text, ready to publish.
    pub payload: String,
}

/// A unit of work for the lane.  The variants are the only constructible
/// shapes: a send cannot exist without its persistence callback.
pub enum ProcessTask {
    Send {
        payload: String,
        on_persisted: Box<dyn FnOnce(SendReceipt) + Send>,
    },
    Receive {
        payload: String,
    },
}

/// Inbound non-echo message, resolved and persisted, handed to the policy
/// layer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    pub row_id: i64,
}

/// Seam between the lane and application-level side effects (notification
/// policy, UI events).  Called on the lane after the store writes for a
/// non-echo inbound message complete.
pub trait InboundHandler: Send {
    fn on_message(&mut self, message: &InboundMessage);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum PipelineError {
    Parse(serde_json::Error),
    Time(TimeError),
    Store(StoreError),
    Closed,
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Parse(e) => write!(f, "payload parse error: {e}"),
            PipelineError::Time(e) => write!(f, "timestamp error: {e}"),
            PipelineError::Store(e) => write!(f, "store error: {e}"),
            PipelineError::Closed => write!(f, "pipeline is shut down"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Parse(e)
    }
}

impl From<TimeError> for PipelineError {
    fn from(e: TimeError) -> Self {
        PipelineError::Time(e)
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        PipelineError::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PipelineConfig {
    /// The local identity; an inbound frame from this id is a self-echo.
    pub local_user_id: String,
    /// Display format for chat-list rows.
    pub thread_format: TimestampFormatter,
    /// Display format for message bubbles.
    pub message_format: TimestampFormatter,
}

impl PipelineConfig {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            thread_format: crate::timefmt::thread_format,
            message_format: crate::timefmt::message_format,
        }
    }
}

/// Handle to the serial lane.  Submitting is cheap and non-blocking;
/// [`Pipeline::shutdown`] closes the queue and waits for queued tasks to
/// drain (in-flight store writes complete, they are never aborted).
pub struct Pipeline {
    tx: mpsc::UnboundedSender<ProcessTask>,
    worker: JoinHandle<()>,
}

/// Cloneable submitter detached from the pipeline's lifetime.  Submitting
/// after shutdown returns [`PipelineError::Closed`].
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<ProcessTask>,
}

impl PipelineHandle {
    pub fn submit(&self, task: ProcessTask) -> Result<(), PipelineError> {
        self.tx.send(task).map_err(|_| PipelineError::Closed)
    }
}

impl Pipeline {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(store: Store, config: PipelineConfig, handler: Box<dyn InboundHandler>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_lane(store, config, handler, rx));
        Self { tx, worker }
    }

    /// Queue a task.  FIFO order is preserved across all submitters.
    pub fn submit(&self, task: ProcessTask) -> Result<(), PipelineError> {
        self.tx.send(task).map_err(|_| PipelineError::Closed)
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            tx: self.tx.clone(),
        }
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

async fn run_lane(
    store: Store,
    config: PipelineConfig,
    mut handler: Box<dyn InboundHandler>,
    mut rx: mpsc::UnboundedReceiver<ProcessTask>,
) {
    while let Some(task) = rx.recv().await {
        match task {
            ProcessTask::Send {
                payload,
                on_persisted,
            } => {
                if let Err(e) = process_send(&store, &config, payload, on_persisted) {
                    bslog!("pipeline: send task aborted: {e}");
                }
            }
            ProcessTask::Receive { payload } => {
                if let Err(e) = process_receive(&store, &config, &mut *handler, &payload) {
                    bslog!("pipeline: receive task aborted: {e}");
                }
            }
        }
    }
}

/// SEND: parse, persist the `sending` row and the summary, then — and only
/// then — invoke the callback that dispatches the network publish.
fn process_send(
    store: &Store,
    config: &PipelineConfig,
    payload: String,
    on_persisted: Box<dyn FnOnce(SendReceipt) + Send>,
) -> Result<(), PipelineError> {
    let parsed: OutboundPayload = serde_json::from_str(&payload)?;
    let sent = DerivedTimestamps::derive(&parsed.sent_at, config.message_format)?;
    let sent_thread = DerivedTimestamps::derive(&parsed.sent_at, config.thread_format)?;
    let chat_id = chat_id_for(&parsed.sender_id, &parsed.receiver_id);

    let row_id = store.insert_message(&NewChatMessage {
        chat_id: chat_id.clone(),
        sender_id: parsed.sender_id.clone(),
        receiver_id: parsed.receiver_id.clone(),
        body: parsed.message.clone(),
        status: MessageStatus::Sending,
        sent,
        delivered: None,
    })?;

    store.upsert_chat(&ChatUpsert {
        chat_id: chat_id.clone(),
        other_user_id: parsed.receiver_id.clone(),
        last_message_id: row_id,
        last: sent_thread,
        bump_unread: false,
    })?;

    bslog!(
        "pipeline: persisted outgoing row {} in {}",
        row_id,
        logging::chat_ref(&chat_id)
    );
    on_persisted(SendReceipt { row_id, payload });
    Ok(())
}

/// RECEIVE: branch on self-echo vs. a message from another user.
fn process_receive(
    store: &Store,
    config: &PipelineConfig,
    handler: &mut dyn InboundHandler,
    payload: &str,
) -> Result<(), PipelineError> {
    let parsed: InboundPayload = serde_json::from_str(payload)?;
    let chat_id = chat_id_for(&parsed.sender.id, &parsed.receiver.id);
    let delivered = DerivedTimestamps::derive(&parsed.time, config.message_format)?;

    if parsed.sender.id == config.local_user_id {
        // Self-echo: the broker bounced back our own publish.  Resolve the
        // pending row; no new row, no summary churn, no notification.
        let sent_at = parsed.sent_at.trim();
        match store.find_pending_message(&parsed.sender.id, sent_at)? {
            Some(row) => {
                store.mark_message_sent(row.id, &delivered)?;
                bslog!(
                    "pipeline: echo confirmed row {} in {}",
                    row.id,
                    logging::chat_ref(&chat_id)
                );
            }
            None => {
                // No pending row to acknowledge: duplicate echo, or the echo
                // of a row a previous process lost.  Dropped by design.
                bslog!(
                    "pipeline: orphan echo from {} at {} dropped",
                    logging::user_id(&parsed.sender.id),
                    sent_at
                );
            }
        }
        return Ok(());
    }

    let sent = DerivedTimestamps::derive(&parsed.sent_at, config.message_format)?;
    let sent_thread = DerivedTimestamps::derive(&parsed.sent_at, config.thread_format)?;

    let row_id = store.insert_message(&NewChatMessage {
        chat_id: chat_id.clone(),
        sender_id: parsed.sender.id.clone(),
        receiver_id: parsed.receiver.id.clone(),
        body: parsed.message.clone(),
        status: MessageStatus::Received,
        sent,
        delivered: Some(delivered),
    })?;

    // Opportunistic refresh of the sender's display attributes.
    let user = UserRow {
        user_id: parsed.sender.id.clone(),
        first_name: parsed.sender.first_name.clone(),
        last_name: parsed.sender.last_name.clone(),
        avatar_url: parsed.sender.avatar.clone(),
    };
    store.upsert_user(&user)?;

    store.upsert_chat(&ChatUpsert {
        chat_id: chat_id.clone(),
        other_user_id: parsed.sender.id.clone(),
        last_message_id: row_id,
        last: sent_thread,
        bump_unread: true,
    })?;

    bslog!(
        "pipeline: stored inbound row {} from {} in {}",
        row_id,
        logging::user_id(&parsed.sender.id),
        logging::chat_ref(&chat_id)
    );

    handler.on_message(&InboundMessage {
        chat_id,
        sender_id: parsed.sender.id,
        sender_name: user.display_name(),
        body: parsed.message,
        row_id,
    });
    Ok(())
}
