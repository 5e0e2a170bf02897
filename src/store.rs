//! SQLite-backed reactive store for chats, chat messages, and cached users.
//!
//! Provides a shared database handle for the whole chat core: the processing
//! lane writes through it, screen-facing readers query through it, and a
//! registry of live queries is invalidated whenever a write touches one of
//! the tables a query declared as a dependency.
//!
//! Exactly one `Store` is opened per process (explicit `open`, no hidden
//! singleton); handles are cheap clones sharing one connection behind the
//! store's own lock.  Rows are never deleted by this subsystem.
//!
//! Known limitation, preserved deliberately: rows left in `sending` state by
//! a prior process death are not re-resolved at startup.  The broker echo is
//! the only delivery confirmation, so a lost echo leaves its row `sending`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::timefmt::{self, DerivedTimestamps};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Time(timefmt::TimeError),
    NotFound(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Io(e) => write!(f, "io error: {e}"),
            StoreError::Time(e) => write!(f, "timestamp error: {e}"),
            StoreError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<timefmt::TimeError> for StoreError {
    fn from(e: timefmt::TimeError) -> Self {
        StoreError::Time(e)
    }
}

// ---------------------------------------------------------------------------
// Chat id derivation
// ---------------------------------------------------------------------------

/// Canonical, participant-order-independent chat id for a two-party
/// conversation: the lexicographic min and max of the two user ids joined
/// with `:`.  Both directions of an exchange map to the same id.
pub fn chat_id_for(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// The only chat type this core produces.
pub const CHAT_TYPE_PERSONAL: &str = "personal";

/// Lifecycle state of a chat message row.
///
/// `Sending → Sent` on the broker echo, `Sending → Failed` on a terminal
/// publish error.  `Received`, `Sent`, and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
    Received,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Received => "received",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            "received" => Some(MessageStatus::Received),
            _ => None,
        }
    }
}

impl ToSql for MessageStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MessageStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        MessageStatus::parse(s).ok_or(FromSqlError::InvalidType)
    }
}

/// One directional send/receive event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageRow {
    pub id: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub status: MessageStatus,
    pub sent_at: String,
    pub sent_epoch_ms: i64,
    pub sent_display: String,
    pub delivered_at: Option<String>,
    pub delivered_epoch_ms: Option<i64>,
    pub delivered_display: Option<String>,
}

/// Fields for a new message row; the store assigns the row id.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub status: MessageStatus,
    pub sent: DerivedTimestamps,
    pub delivered: Option<DerivedTimestamps>,
}

/// One summary row per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRow {
    pub chat_id: String,
    pub chat_type: String,
    pub other_user_id: String,
    /// Row id of the most recent message.  A weak reference: not a foreign
    /// key, never followed by the store itself.
    pub last_message_id: Option<i64>,
    pub unread_count: u32,
    pub last_at: String,
    pub last_epoch_ms: i64,
    pub last_display: String,
}

/// Upsert input for the chat summary row.
#[derive(Debug, Clone)]
pub struct ChatUpsert {
    pub chat_id: String,
    pub other_user_id: String,
    pub last_message_id: i64,
    pub last: DerivedTimestamps,
    /// Incoming non-echo messages bump the unread counter; outgoing sends
    /// do not.
    pub bump_unread: bool,
}

/// Denormalized copy of a remote user's display attributes, refreshed
/// opportunistically whenever a message from that user is processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl UserRow {
    /// Best available display name: "First Last", either half alone, or the
    /// raw user id as a last resort.
    pub fn display_name(&self) -> String {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(f), Some(l)) => format!("{f} {l}"),
            (Some(f), None) => f.to_string(),
            (None, Some(l)) => l.to_string(),
            (None, None) => self.user_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tables and live-query registry
// ---------------------------------------------------------------------------

/// Identifier of a mutable base table, used as the invalidation currency.
///
/// A live query declares the set of tables it reads from; a write publishes
/// the table it touched.  No name matching is involved: a chat-list query
/// that joins cached users simply declares `{Chats, Users}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Messages,
    Chats,
    Users,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Messages => "chat_messages",
            Table::Chats => "chats",
            Table::Users => "users",
        }
    }
}

struct QueryEntry {
    tables: HashSet<Table>,
    dirty: Arc<AtomicBool>,
}

/// A registered store-bound read that is marked dirty when any of its
/// declared dependency tables changes.  Invalidation never re-runs the
/// query; the holder calls [`LiveQuery::run`] when it wants fresh rows.
/// Dropping the handle deregisters it.
pub struct LiveQuery<T> {
    id: u64,
    dirty: Arc<AtomicBool>,
    store: Store,
    run_fn: Arc<dyn Fn(&Store) -> Result<T, StoreError> + Send + Sync>,
}

impl<T> LiveQuery<T> {
    /// Whether a dependency changed since the last `run`.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Execute the read, clearing the dirty flag first so a concurrent write
    /// during execution re-marks it.
    pub fn run(&self) -> Result<T, StoreError> {
        self.dirty.store(false, Ordering::Release);
        (self.run_fn)(&self.store)
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.store.deregister_query(self.id);
    }
}

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Store configuration, passed once at open time.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

/// Shared store handle.  Clones share one connection; the lock lives inside
/// the store, callers never take it themselves.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    queries: Mutex<HashMap<u64, QueryEntry>>,
    next_query_id: AtomicU64,
    changes: broadcast::Sender<Table>,
}

impl Store {
    /// Open or create a database at the configured path, applying any
    /// pending schema upgrades.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(&config.path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        migrate(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                queries: Mutex::new(HashMap::new()),
                next_query_id: AtomicU64::new(1),
                changes,
            }),
        })
    }

    /// Subscribe to table-change events.  Every mutation that affected at
    /// least one row publishes the table it touched.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Table> {
        self.inner.changes.subscribe()
    }

    // -----------------------------------------------------------------------
    // Live-query registry
    // -----------------------------------------------------------------------

    /// Register a live query over the given dependency tables.
    pub fn live_query<T, F>(&self, tables: &[Table], run_fn: F) -> LiveQuery<T>
    where
        F: Fn(&Store) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let id = self.inner.next_query_id.fetch_add(1, Ordering::Relaxed);
        let dirty = Arc::new(AtomicBool::new(false));
        let entry = QueryEntry {
            tables: tables.iter().copied().collect(),
            dirty: dirty.clone(),
        };
        self.inner.queries.lock().unwrap().insert(id, entry);
        LiveQuery {
            id,
            dirty,
            store: self.clone(),
            run_fn: Arc::new(run_fn),
        }
    }

    /// Live chat list, newest conversation first.  Depends on `chats` and
    /// `users` because the rendering joins cached display names.
    pub fn live_chat_list(&self) -> LiveQuery<Vec<ChatRow>> {
        self.live_query(&[Table::Chats, Table::Users], |store| store.list_chats())
    }

    /// Live message history for one conversation, oldest first.
    pub fn live_chat_messages(&self, chat_id: &str) -> LiveQuery<Vec<ChatMessageRow>> {
        let chat_id = chat_id.to_string();
        self.live_query(&[Table::Messages], move |store| {
            store.list_messages(&chat_id)
        })
    }

    fn deregister_query(&self, id: u64) {
        self.inner.queries.lock().unwrap().remove(&id);
    }

    /// Publish a table change: mark dependent live queries dirty and emit a
    /// change event for push-style consumers.
    fn notify(&self, table: Table) {
        let queries = self.inner.queries.lock().unwrap();
        for entry in queries.values() {
            if entry.tables.contains(&table) {
                entry.dirty.store(true, Ordering::Release);
            }
        }
        let _ = self.inner.changes.send(table);
    }

    /// Run a mutation and publish the change when it affected at least one
    /// row and `auto_notify` is set.
    fn execute(
        &self,
        table: Table,
        auto_notify: bool,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<usize, StoreError> {
        let affected = {
            let conn = self.inner.conn.lock().unwrap();
            conn.execute(sql, params)?
        };
        if auto_notify && affected > 0 {
            self.notify(table);
        }
        Ok(affected)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Insert a message row and return its store-assigned id.
    pub fn insert_message(&self, row: &NewChatMessage) -> Result<i64, StoreError> {
        let id = {
            let conn = self.inner.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO chat_messages
                 (chat_id, sender_id, receiver_id, body, status,
                  sent_at, sent_epoch_ms, sent_display,
                  delivered_at, delivered_epoch_ms, delivered_display)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    row.chat_id,
                    row.sender_id,
                    row.receiver_id,
                    row.body,
                    row.status,
                    row.sent.raw,
                    row.sent.epoch_ms,
                    row.sent.display,
                    row.delivered.as_ref().map(|d| d.raw.clone()),
                    row.delivered.as_ref().map(|d| d.epoch_ms),
                    row.delivered.as_ref().map(|d| d.display.clone()),
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.notify(Table::Messages);
        Ok(id)
    }

    pub fn get_message(&self, id: i64) -> Result<Option<ChatMessageRow>, StoreError> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, sender_id, receiver_id, body, status,
                    sent_at, sent_epoch_ms, sent_display,
                    delivered_at, delivered_epoch_ms, delivered_display
             FROM chat_messages WHERE id = ?1",
        )?;
        let row = stmt.query_row(params![id], map_message_row).optional()?;
        Ok(row)
    }

    /// Locate the pending outgoing row a broker echo acknowledges: matched
    /// by the (sender, raw sent-at) tuple, restricted to `sending` status.
    pub fn find_pending_message(
        &self,
        sender_id: &str,
        sent_at: &str,
    ) -> Result<Option<ChatMessageRow>, StoreError> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, sender_id, receiver_id, body, status,
                    sent_at, sent_epoch_ms, sent_display,
                    delivered_at, delivered_epoch_ms, delivered_display
             FROM chat_messages
             WHERE sender_id = ?1 AND sent_at = ?2 AND status = 'sending'
             ORDER BY id LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![sender_id, sent_at], map_message_row)
            .optional()?;
        Ok(row)
    }

    /// Transition `sending → sent` and record the delivery timestamps.
    /// Returns rows affected (0 if the row was not in `sending`).
    pub fn mark_message_sent(
        &self,
        id: i64,
        delivered: &DerivedTimestamps,
    ) -> Result<usize, StoreError> {
        self.execute(
            Table::Messages,
            true,
            "UPDATE chat_messages
             SET status = 'sent', delivered_at = ?2, delivered_epoch_ms = ?3,
                 delivered_display = ?4
             WHERE id = ?1 AND status = 'sending'",
            &[&id, &delivered.raw, &delivered.epoch_ms, &delivered.display],
        )
    }

    /// Transition `sending → failed` after a terminal publish error.
    pub fn mark_message_failed(&self, id: i64) -> Result<usize, StoreError> {
        self.execute(
            Table::Messages,
            true,
            "UPDATE chat_messages SET status = 'failed'
             WHERE id = ?1 AND status = 'sending'",
            &[&id],
        )
    }

    /// Message history for one conversation, oldest first.
    pub fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessageRow>, StoreError> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, sender_id, receiver_id, body, status,
                    sent_at, sent_epoch_ms, sent_display,
                    delivered_at, delivered_epoch_ms, delivered_display
             FROM chat_messages WHERE chat_id = ?1
             ORDER BY sent_epoch_ms, id",
        )?;
        let rows = stmt
            .query_map(params![chat_id], map_message_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Chats
    // -----------------------------------------------------------------------

    /// Update-if-exists-else-insert on the summary row, keeping exactly one
    /// row per chat id.  True safety against racing upserts comes from the
    /// serial processing lane, not from this statement.
    pub fn upsert_chat(&self, up: &ChatUpsert) -> Result<(), StoreError> {
        let bump = if up.bump_unread { 1u32 } else { 0 };
        let affected = {
            let conn = self.inner.conn.lock().unwrap();
            conn.execute(
                "UPDATE chats
                 SET last_message_id = ?2, unread_count = unread_count + ?3,
                     last_at = ?4, last_epoch_ms = ?5, last_display = ?6
                 WHERE chat_id = ?1",
                params![
                    up.chat_id,
                    up.last_message_id,
                    bump,
                    up.last.raw,
                    up.last.epoch_ms,
                    up.last.display,
                ],
            )?
        };
        if affected == 0 {
            let conn = self.inner.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO chats
                 (chat_id, chat_type, other_user_id, last_message_id,
                  unread_count, last_at, last_epoch_ms, last_display)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    up.chat_id,
                    CHAT_TYPE_PERSONAL,
                    up.other_user_id,
                    up.last_message_id,
                    bump,
                    up.last.raw,
                    up.last.epoch_ms,
                    up.last.display,
                ],
            )?;
        }
        self.notify(Table::Chats);
        Ok(())
    }

    pub fn get_chat(&self, chat_id: &str) -> Result<Option<ChatRow>, StoreError> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT chat_id, chat_type, other_user_id, last_message_id,
                    unread_count, last_at, last_epoch_ms, last_display
             FROM chats WHERE chat_id = ?1",
        )?;
        let row = stmt.query_row(params![chat_id], map_chat_row).optional()?;
        Ok(row)
    }

    /// All conversations, most recent activity first.
    pub fn list_chats(&self) -> Result<Vec<ChatRow>, StoreError> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT chat_id, chat_type, other_user_id, last_message_id,
                    unread_count, last_at, last_epoch_ms, last_display
             FROM chats ORDER BY last_epoch_ms DESC",
        )?;
        let rows = stmt
            .query_map([], map_chat_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Reset a chat's unread counter; called when its detail view opens.
    pub fn mark_chat_read(&self, chat_id: &str) -> Result<usize, StoreError> {
        self.execute(
            Table::Chats,
            true,
            "UPDATE chats SET unread_count = 0
             WHERE chat_id = ?1 AND unread_count > 0",
            &[&chat_id],
        )
    }

    // -----------------------------------------------------------------------
    // Cached users
    // -----------------------------------------------------------------------

    pub fn upsert_user(&self, row: &UserRow) -> Result<(), StoreError> {
        self.execute(
            Table::Users,
            true,
            "INSERT OR REPLACE INTO users (user_id, first_name, last_name, avatar_url)
             VALUES (?1, ?2, ?3, ?4)",
            &[
                &row.user_id,
                &row.first_name,
                &row.last_name,
                &row.avatar_url,
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRow>, StoreError> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, first_name, last_name, avatar_url
             FROM users WHERE user_id = ?1",
        )?;
        let row = stmt
            .query_row(params![user_id], |row| {
                Ok(UserRow {
                    user_id: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    avatar_url: row.get(3)?,
                })
            })
            .optional()?;
        Ok(row)
    }
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessageRow> {
    Ok(ChatMessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        body: row.get(4)?,
        status: row.get(5)?,
        sent_at: row.get(6)?,
        sent_epoch_ms: row.get(7)?,
        sent_display: row.get(8)?,
        delivered_at: row.get(9)?,
        delivered_epoch_ms: row.get(10)?,
        delivered_display: row.get(11)?,
    })
}

fn map_chat_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        chat_id: row.get(0)?,
        chat_type: row.get(1)?,
        other_user_id: row.get(2)?,
        last_message_id: row.get(3)?,
        unread_count: row.get(4)?,
        last_at: row.get(5)?,
        last_epoch_ms: row.get(6)?,
        last_display: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// Schema and migrations
// ---------------------------------------------------------------------------

const SCHEMA_VERSION: i32 = 3;

fn schema_version(conn: &Connection) -> Result<i32, StoreError> {
    let v: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(v)
}

fn set_schema_version(conn: &Connection, v: i32) -> Result<(), StoreError> {
    conn.execute_batch(&format!("PRAGMA user_version = {v};"))?;
    Ok(())
}

/// Apply schema upgrades in order.  A fresh database jumps straight to the
/// final shape; an existing one walks the ordered upgrade steps.
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let mut version = schema_version(conn)?;
    if version == 0 {
        create_schema(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        return Ok(());
    }

    if version == 1 {
        // v1 predates chat summaries: create the table and rebuild it from
        // the message history.
        create_chats_table(conn)?;
        rebuild_chat_summaries(conn)?;
        version = 2;
        set_schema_version(conn, version)?;
    }

    if version == 2 {
        // Plain alter: the delivery display string was added after the raw
        // and epoch delivery columns.
        let has_col = conn
            .prepare("SELECT delivered_display FROM chat_messages LIMIT 0")
            .is_ok();
        if !has_col {
            conn.execute_batch("ALTER TABLE chat_messages ADD COLUMN delivered_display TEXT;")?;
        }
        version = 3;
        set_schema_version(conn, version)?;
    }

    debug_assert_eq!(version, SCHEMA_VERSION);
    Ok(())
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chat_messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id         TEXT NOT NULL,
            sender_id       TEXT NOT NULL,
            receiver_id     TEXT NOT NULL,
            body            TEXT NOT NULL,
            status          TEXT NOT NULL,
            sent_at         TEXT NOT NULL,
            sent_epoch_ms   INTEGER NOT NULL,
            sent_display    TEXT NOT NULL,
            delivered_at        TEXT,
            delivered_epoch_ms  INTEGER,
            delivered_display   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON chat_messages(chat_id, sent_epoch_ms);
        CREATE INDEX IF NOT EXISTS idx_messages_pending
            ON chat_messages(sender_id, sent_at, status);

        CREATE TABLE IF NOT EXISTS users (
            user_id     TEXT PRIMARY KEY,
            first_name  TEXT,
            last_name   TEXT,
            avatar_url  TEXT
        );
        ",
    )?;
    create_chats_table(conn)?;
    Ok(())
}

fn create_chats_table(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chats (
            chat_id         TEXT PRIMARY KEY,
            chat_type       TEXT NOT NULL,
            other_user_id   TEXT NOT NULL,
            last_message_id INTEGER,
            unread_count    INTEGER NOT NULL DEFAULT 0,
            last_at         TEXT NOT NULL,
            last_epoch_ms   INTEGER NOT NULL,
            last_display    TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chats_recency
            ON chats(last_epoch_ms DESC);
        ",
    )?;
    Ok(())
}

/// Rebuild the chat summary table from message history.
///
/// For each chat id, picks the newest message by parsed-timestamp comparison
/// alone (row insertion order is meaningless in legacy data) and writes one
/// summary row.  Rows whose `sent_at` does not parse are skipped, as are
/// chat ids already resolved: a partial rebuild is preferred to an aborted
/// upgrade.
fn rebuild_chat_summaries(conn: &Connection) -> Result<(), StoreError> {
    struct Candidate {
        row_id: i64,
        other_user_id: String,
        sent: DerivedTimestamps,
    }

    let mut stmt = conn.prepare(
        "SELECT id, chat_id, sender_id, receiver_id, status, sent_at FROM chat_messages",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut newest: HashMap<String, Candidate> = HashMap::new();
    let mut skipped = 0usize;
    for row in rows {
        let (row_id, chat_id, sender_id, receiver_id, status, sent_at) = row?;
        let sent = match DerivedTimestamps::derive(&sent_at, timefmt::thread_format) {
            Ok(sent) => sent,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        // The conversation partner: the sender for received rows, the
        // receiver for everything this device originated.
        let other_user_id = if status == "received" {
            sender_id
        } else {
            receiver_id
        };
        let candidate = Candidate {
            row_id,
            other_user_id,
            sent,
        };
        match newest.get(&chat_id) {
            Some(existing) if existing.sent.epoch_ms >= candidate.sent.epoch_ms => {}
            _ => {
                newest.insert(chat_id, candidate);
            }
        }
    }

    for (chat_id, c) in &newest {
        let already: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chats WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )?;
        if already > 0 {
            continue;
        }
        conn.execute(
            "INSERT INTO chats
             (chat_id, chat_type, other_user_id, last_message_id,
              unread_count, last_at, last_epoch_ms, last_display)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
            params![
                chat_id,
                CHAT_TYPE_PERSONAL,
                c.other_user_id,
                c.row_id,
                c.sent.raw,
                c.sent.epoch_ms,
                c.sent.display,
            ],
        )?;
    }

    if skipped > 0 {
        crate::bslog!(
            "store: chat summary rebuild skipped {} row(s) with unparseable timestamps",
            skipped
        );
    }
    Ok(())
}
