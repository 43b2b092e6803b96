use folkhart_engine::{Notifier, Severity};
use tracing::{error, info, warn};

/// Shows notifications through the log output, at a level matching their
/// severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info | Severity::Success => info!(target: "folkhart::toast", %severity, "{message}"),
            Severity::Warning => warn!(target: "folkhart::toast", "{message}"),
            Severity::Error => error!(target: "folkhart::toast", "{message}"),
        }
    }
}
