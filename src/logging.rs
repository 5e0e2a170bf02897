//! Log line emission for the chat core.
//!
//! One macro, [`bslog!`], used by every module.  A line carries a UTC
//! timestamp and the source location:
//!
//! ```text
//! 20260829T14:02:51.310 - src/pipeline.rs:241 - pipeline: stored inbound row 7
//! ```
//!
//! Host applications install a writer with [`set_writer`] to route output
//! into their own log bridge; the default is stderr.  On a developer
//! terminal ([`init`] detects one), user and chat ids are tinted so
//! interleaved conversations can be told apart at a glance.  Installing a
//! writer turns tinting off.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};

use chrono::Utc;

static COLOUR: AtomicBool = AtomicBool::new(false);

static WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Call once at startup.  Enables tinted ids when stderr is a terminal.
pub fn init() {
    COLOUR.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Route all subsequent [`bslog!`] output to `w` instead of stderr.
/// Disables ANSI tinting.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR.store(false, Ordering::Relaxed);
    *WRITER.lock().unwrap() = w;
}

fn colour_enabled() -> bool {
    COLOUR.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Ids are long opaque strings; log lines show a fixed-width prefix.
const LOG_ID_TRUNCATE_LEN: usize = 10;

fn truncated(id: &str) -> String {
    id.chars().take(LOG_ID_TRUNCATE_LEN).collect()
}

/// Deterministic tint for a user id: one of the six bright ANSI colours,
/// picked by folding the id bytes, so a user keeps their colour across
/// lines and sessions.
fn tint(id: &str) -> String {
    let code = 91 + id.bytes().fold(0u8, |acc, b| acc ^ b) % 6;
    format!("\x1b[{code}m")
}

/// Render a user id for a log line: `u-` prefix, truncated, tinted on a
/// terminal.
pub fn user_id(id: &str) -> String {
    let short = truncated(id);
    if colour_enabled() {
        format!("{}u-{short}{RESET}", tint(id))
    } else {
        format!("u-{short}")
    }
}

const CHAT_TINT: &str = "\x1b[96m"; // bright cyan

/// Render a chat id for a log line: `c-` prefix, truncated, one fixed tint
/// for all chats.
pub fn chat_ref(id: &str) -> String {
    let short = truncated(id);
    if colour_enabled() {
        format!("{CHAT_TINT}c-{short}{RESET}")
    } else {
        format!("c-{short}")
    }
}

/// Write one log line to the current writer.  Called by [`bslog!`], not
/// intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = Utc::now().format("%Y%m%dT%H:%M:%S%.3f");
    let formatted = if colour_enabled() {
        format!("{DIM}{ts} {file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line with timestamp and source location.
///
/// ```ignore
/// bslog!("pipeline: persisted outgoing row {}", row_id);
/// bslog!("transport: subscribed as {}", logging::user_id(&uid));
/// ```
#[macro_export]
macro_rules! bslog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ids_are_prefixed_and_truncated() {
        // Colour is off by default in tests (no init call).
        assert_eq!(user_id("bob"), "u-bob");
        assert_eq!(
            user_id("4f1e9a77c2b8d05361aa"),
            "u-4f1e9a77c2",
            "long ids truncate to a fixed prefix"
        );
        assert_eq!(chat_ref("alice:bob"), "c-alice:bob");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncated("éééééééééééé"), "éééééééééé");
    }

    #[test]
    fn tint_is_deterministic_and_bright() {
        assert_eq!(tint("alice"), tint("alice"));
        let code: u8 = tint("alice")
            .trim_start_matches("\x1b[")
            .trim_end_matches('m')
            .parse()
            .expect("ansi code");
        assert!((91..=96).contains(&code));
    }

    #[test]
    fn emit_writes_location_and_message() {
        struct Capture(Arc<Mutex<Vec<u8>>>);
        impl Write for Capture {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let buffer = Arc::new(Mutex::new(Vec::new()));
        set_writer(Box::new(Capture(buffer.clone())));
        bslog!("store: rebuilt {} summaries", 3);

        let logged = String::from_utf8(buffer.lock().unwrap().clone()).expect("utf8");
        // Other tests may interleave lines; ours must be present and intact.
        let line = logged
            .lines()
            .find(|l| l.contains("store: rebuilt 3 summaries"))
            .expect("log line captured");
        assert!(line.contains("src/logging.rs:"));
        assert!(!line.contains('\x1b'), "no ansi codes in a custom writer");
    }
}
