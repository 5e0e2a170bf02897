//! Chat delivery core for the bookswap app.
//!
//! Everything between the chat UI and the message broker lives here: the
//! reactive SQLite store ([`store`]), the serial processing lane that turns
//! payloads into store writes ([`pipeline`]), the broker subscription and
//! publish transport ([`transport`]), the notification policy ([`notify`]),
//! and the [`service::ChatService`] façade that wires them together.
//!
//! The host application embeds this crate, supplies a
//! [`notify::NotificationSink`] and a [`transport::ConnectivityProbe`], and
//! drives the connect/disconnect lifecycle.

pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod service;
pub mod settings;
pub mod store;
pub mod timefmt;
pub mod transport;

pub use service::{ChatConfig, ChatService, ServiceError};
pub use store::{chat_id_for, MessageStatus, Store, StoreConfig};
