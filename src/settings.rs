//! Key-value preference store.
//!
//! Holds the user preferences the chat core consults at runtime, in string
//! form, with a change hook so consumers can react to toggles without a
//! restart.  The host application is expected to mirror its own persistent
//! preference storage into this store at startup and on every change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Master gate for generating notifications at all ("true"/"false").
pub const KEY_NOTIFICATIONS_ENABLED: &str = "notifications.enabled";
/// Ringtone URI for the notification sound; unset means the platform default.
pub const KEY_RINGTONE_URI: &str = "notifications.ringtone_uri";
/// Whether notifications vibrate ("true"/"false").
pub const KEY_VIBRATE: &str = "notifications.vibrate";

/// Called with the key that changed, after the new value is visible.
pub type SettingsListener = Box<dyn Fn(&str) + Send + Sync>;

struct SettingsInner {
    values: Mutex<HashMap<String, String>>,
    listeners: Mutex<Vec<SettingsListener>>,
}

/// Cheap to clone; all clones share the same values and listeners.
#[derive(Clone)]
pub struct Settings {
    inner: Arc<SettingsInner>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SettingsInner {
                values: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.values.lock().unwrap().get(key).cloned()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref() {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        }
    }

    /// Store `value` and notify every listener.  Listeners run on the
    /// caller's thread, after the value is already readable.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.inner
            .values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.into());
        for listener in self.inner.listeners.lock().unwrap().iter() {
            listener(key);
        }
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.set(key, if value { "true" } else { "false" });
    }

    /// Remove a key (falls back to defaults).  Listeners are notified.
    pub fn unset(&self, key: &str) {
        self.inner.values.lock().unwrap().remove(key);
        for listener in self.inner.listeners.lock().unwrap().iter() {
            listener(key);
        }
    }

    pub fn on_change(&self, listener: SettingsListener) {
        self.inner.listeners.lock().unwrap().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn bool_parsing_and_defaults() {
        let s = Settings::new();
        assert!(s.get_bool(KEY_VIBRATE, true));
        assert!(!s.get_bool(KEY_VIBRATE, false));
        s.set_bool(KEY_VIBRATE, false);
        assert!(!s.get_bool(KEY_VIBRATE, true));
        s.set(KEY_VIBRATE, "garbage");
        assert!(s.get_bool(KEY_VIBRATE, true), "unparseable falls back");
    }

    #[test]
    fn listeners_fire_with_the_changed_key() {
        let s = Settings::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_listener = hits.clone();
        s.on_change(Box::new(move |key| {
            assert_eq!(key, KEY_RINGTONE_URI);
            hits_in_listener.fetch_add(1, Ordering::SeqCst);
        }));
        s.set(KEY_RINGTONE_URI, "content://ringtone/7");
        s.unset(KEY_RINGTONE_URI);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clones_share_state() {
        let a = Settings::new();
        let b = a.clone();
        a.set(KEY_NOTIFICATIONS_ENABLED, "false");
        assert!(!b.get_bool(KEY_NOTIFICATIONS_ENABLED, true));
    }
}
