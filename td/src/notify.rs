//! Notifications: best-effort progress reporting. Transport is an
//! external collaborator — this module only defines the
//! contract and a logging-only implementation, matching the "Environment"
//! error class (failures are logged, never propagated, never fail a task).

use tracing::info;

use crate::domain::Task;

/// Abstraction over wherever a task's `notify_chat` destination actually
/// lives. Swapping in a real transport means implementing this trait; the
/// scheduler itself never depends on a concrete chat backend.
pub trait Notifier: Send + Sync {
    fn notify(&self, chat: &str, message: &str);
}

/// Logs every notification instead of sending it; the only implementation
/// until a real transport is wired up.
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, chat: &str, message: &str) {
        info!(chat, message, "notify::LoggingNotifier: would send notification");
    }
}

/// Per-attempt progress notification: reason plus current attempt counter.
pub fn notify_progress(notifier: &dyn Notifier, task: &Task, reason: &str) {
    if let Some(chat) = &task.notify_chat {
        notifier.notify(chat, &format!("{}: {} (attempt {}/{})", task.title, reason, task.attempt, task.max_attempts));
    }
}

/// Final notification when a task is shelved after exhausting its retry
/// budget (user-visible failure surface).
pub fn notify_gave_up(notifier: &dyn Notifier, task: &Task) {
    if let Some(chat) = &task.notify_chat {
        notifier.notify(chat, &format!("{}: gave up after {} attempts", task.title, task.attempt));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, chat: &str, message: &str) {
            self.sent.lock().unwrap().push(format!("{chat}: {message}"));
        }
    }

    #[test]
    fn notify_progress_is_a_no_op_without_a_chat_destination() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let notifier = RecordingNotifier { sent: sent.clone() };
        let task = Task::new("t", "d", "/repo", "m", 3);
        notify_progress(&notifier, &task, "retrying");
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn notify_gave_up_includes_attempt_count() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let notifier = RecordingNotifier { sent: sent.clone() };
        let mut task = Task::new("t", "d", "/repo", "m", 3);
        task.notify_chat = Some("chat-1".to_string());
        task.attempt = 3;
        notify_gave_up(&notifier, &task);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("gave up after 3 attempts"));
    }
}
