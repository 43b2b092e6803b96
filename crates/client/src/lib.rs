pub mod config;
pub mod http;
pub mod notify;

use config::ClientConfig;
use folkhart_engine::{check_session, Adventure, RunStore, SessionVerdict, SqliteKv, SystemClock};
use http::HttpApi;
use notify::TracingNotifier;
use std::sync::Arc;

pub struct Session {
    pub adventure: Adventure,
    pub api: Arc<HttpApi>,
    pub kv: SqliteKv,
}

pub enum Startup {
    Ready(Session),
    LoggedOut,
}

/// Builds the client from `config`: runs the session gate against
/// `/version`, then mounts and reconciles the adventure controller.
pub async fn connect(config: &ClientConfig) -> anyhow::Result<Startup> {
    let api = Arc::new(HttpApi::new(
        &config.base_url,
        config.auth_token.clone(),
        config.request_timeout(),
    ));
    let kv = SqliteKv::new(&config.db_path);
    // Fail fast on an unusable database path rather than silently running
    // memory-only from the first write.
    kv.open()?;

    let mut store = RunStore::new(kv.clone());
    let verdict = check_session(
        api.as_ref(),
        &mut store,
        &SystemClock,
        config.version_check_timeout(),
    )
    .await;
    if verdict == SessionVerdict::ForceLogout {
        return Ok(Startup::LoggedOut);
    }

    let adventure = Adventure::new(
        store,
        api.clone(),
        Arc::new(TracingNotifier),
        Arc::new(SystemClock),
        config.policy(),
    );
    adventure.activate().await;

    Ok(Startup::Ready(Session { adventure, api, kv }))
}
