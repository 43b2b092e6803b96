use crate::api::GameApi;
use crate::clock::Clock;
use crate::run::parse_timestamp_ms;
use crate::store::RunStore;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVerdict {
    Continue,
    ForceLogout,
}

/// Sessions that last logged in before the server's cutoff must log out.
/// Without either timestamp there is nothing to compare and the session
/// continues.
pub fn evaluate(last_login_ms: Option<i64>, force_logout_ms: Option<i64>) -> SessionVerdict {
    match (last_login_ms, force_logout_ms) {
        (Some(last), Some(cutoff)) if last < cutoff => SessionVerdict::ForceLogout,
        _ => SessionVerdict::Continue,
    }
}

/// Startup gate: consults `/version` under `timeout`. A failed or slow check
/// falls through to normal startup. On `Continue` the login time is recorded;
/// on `ForceLogout` it is cleared.
pub async fn check_session(
    api: &dyn GameApi,
    store: &mut RunStore,
    clock: &dyn Clock,
    timeout: Duration,
) -> SessionVerdict {
    let cutoff = match tokio::time::timeout(timeout, api.version()).await {
        Ok(Ok(info)) => info
            .force_logout_timestamp
            .as_ref()
            .and_then(parse_timestamp_ms),
        Ok(Err(e)) => {
            warn!(error = %e, "version check failed; continuing");
            None
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "version check timed out; continuing");
            None
        }
    };

    let verdict = evaluate(store.last_login(), cutoff);
    match verdict {
        SessionVerdict::Continue => store.record_login(clock.now_ms()),
        SessionVerdict::ForceLogout => {
            info!("session predates forced logout cutoff");
            store.clear_login();
        }
    }
    verdict
}
