//! Notification policy for inbound chat messages.
//!
//! Decides whether an inbound (non-echo) message surfaces an OS notification
//! and what that notification says.  Suppression comes first: nothing is
//! shown while the notifications preference is off, and nothing is shown for
//! the user the consumer screen is actively chatting with (that screen
//! renders the message live).  Past those gates, a single unread message gets
//! a per-chat notification and anything beyond collapses into one "N new
//! messages" summary targeting the chat list.
//!
//! Rendering itself is the host's job, behind [`NotificationSink`].  The
//! policy only computes *what* to show.

use std::sync::{Arc, Mutex, Weak};

use crate::bslog;
use crate::logging;
use crate::pipeline::{InboundHandler, InboundMessage};
use crate::settings::{
    Settings, KEY_NOTIFICATIONS_ENABLED, KEY_RINGTONE_URI, KEY_VIBRATE,
};

/// Fixed two-stage vibration pattern (delay, on, pause, on), milliseconds.
pub const VIBRATION_PATTERN: [u64; 4] = [0, 250, 150, 250];

/// Where tapping the notification should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapTarget {
    /// Open the conversation with this user.
    ChatDetail { chat_id: String, user_id: String },
    /// Open the chat overview (used for the collapsed summary).
    ChatList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatNotification {
    pub title: String,
    pub body: String,
    pub tap: TapTarget,
    /// Ringtone URI; `None` means the platform default sound.
    pub sound: Option<String>,
    /// When true the host applies [`VIBRATION_PATTERN`].
    pub vibrate: bool,
}

/// Host-side renderer.  One notification slot: `show` replaces whatever is
/// currently displayed, `cancel` removes it.
pub trait NotificationSink: Send {
    fn show(&mut self, notification: &ChatNotification);
    fn cancel(&mut self);
}

struct PolicyState {
    unread: u32,
    current_chat_user: Option<String>,
    enabled: bool,
    ringtone: Option<String>,
    vibrate: bool,
}

struct PolicyInner {
    state: Mutex<PolicyState>,
    sink: Mutex<Box<dyn NotificationSink>>,
    settings: Settings,
}

impl PolicyInner {
    /// Re-read the preference snapshot.  Called at construction and from the
    /// settings change hook, so toggles apply without a restart.
    fn refresh_prefs(&self) {
        let enabled = self.settings.get_bool(KEY_NOTIFICATIONS_ENABLED, true);
        let ringtone = self.settings.get(KEY_RINGTONE_URI);
        let vibrate = self.settings.get_bool(KEY_VIBRATE, true);
        let mut st = self.state.lock().unwrap();
        st.enabled = enabled;
        st.ringtone = ringtone;
        st.vibrate = vibrate;
    }
}

/// Cheap to clone; all clones share one unread counter and one sink.
#[derive(Clone)]
pub struct NotificationPolicy {
    inner: Arc<PolicyInner>,
}

impl NotificationPolicy {
    /// Builds the policy, snapshots the current preferences, and subscribes
    /// to settings changes.
    pub fn new(sink: Box<dyn NotificationSink>, settings: &Settings) -> Self {
        let inner = Arc::new(PolicyInner {
            state: Mutex::new(PolicyState {
                unread: 0,
                current_chat_user: None,
                enabled: true,
                ringtone: None,
                vibrate: true,
            }),
            sink: Mutex::new(sink),
            settings: settings.clone(),
        });
        inner.refresh_prefs();

        // Weak, so the settings registry does not keep the policy alive.
        let weak: Weak<PolicyInner> = Arc::downgrade(&inner);
        settings.on_change(Box::new(move |key| {
            if let Some(inner) = weak.upgrade() {
                match key {
                    KEY_NOTIFICATIONS_ENABLED | KEY_RINGTONE_URI | KEY_VIBRATE => {
                        inner.refresh_prefs();
                    }
                    _ => {}
                }
            }
        }));

        Self { inner }
    }

    /// Apply the suppression rules to one inbound message and render if they
    /// all pass.
    pub fn on_incoming(&self, message: &InboundMessage) {
        let notification = {
            let mut st = self.inner.state.lock().unwrap();
            if !st.enabled {
                return;
            }
            if st.current_chat_user.as_deref() == Some(message.sender_id.as_str()) {
                bslog!(
                    "notify: suppressed, actively chatting with {}",
                    logging::user_id(&message.sender_id)
                );
                return;
            }
            st.unread += 1;
            if st.unread == 1 {
                ChatNotification {
                    title: message.sender_name.clone(),
                    body: message.body.clone(),
                    tap: TapTarget::ChatDetail {
                        chat_id: message.chat_id.clone(),
                        user_id: message.sender_id.clone(),
                    },
                    sound: st.ringtone.clone(),
                    vibrate: st.vibrate,
                }
            } else {
                ChatNotification {
                    title: format!("{} new messages", st.unread),
                    body: message.body.clone(),
                    tap: TapTarget::ChatList,
                    sound: st.ringtone.clone(),
                    vibrate: st.vibrate,
                }
            }
        };
        self.inner.sink.lock().unwrap().show(&notification);
    }

    /// Reset the unread counter and cancel the displayed notification.
    /// Called by the consumer screen when a chat view becomes active.
    pub fn clear(&self) {
        self.inner.state.lock().unwrap().unread = 0;
        self.inner.sink.lock().unwrap().cancel();
    }

    /// Set (or clear) the suppression target for the active conversation.
    pub fn set_current_chatting_user(&self, user_id: Option<String>) {
        self.inner.state.lock().unwrap().current_chat_user = user_id;
    }

    #[cfg(test)]
    fn unread(&self) -> u32 {
        self.inner.state.lock().unwrap().unread
    }
}

impl InboundHandler for NotificationPolicy {
    fn on_message(&mut self, message: &InboundMessage) {
        self.on_incoming(message);
    }
}
