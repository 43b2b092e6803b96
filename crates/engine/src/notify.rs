use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// Where user-facing messages ("toasts") and completion notices go.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Keeps every notification; handy for tests and for batching output.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<(Severity, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(Severity, String)> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.messages()
            .iter()
            .filter(|(s, _)| *s == severity)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((severity, message.to_string()));
    }
}
