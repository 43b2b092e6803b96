use serde::{Deserialize, Serialize};
use std::fmt;

/// Which timed activity a run belongs to. Each kind has its own run slot
/// and its own reward channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunKind {
    #[serde(alias = "Dungeon")]
    Dungeon,
    #[serde(alias = "IdleFarm", alias = "idle-farm", alias = "idle_farm")]
    IdleFarm,
}

impl RunKind {
    pub const ALL: [RunKind; 2] = [RunKind::Dungeon, RunKind::IdleFarm];

    /// Stable slug used in storage keys and CLI arguments.
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Dungeon => "dungeon",
            RunKind::IdleFarm => "idle-farm",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            RunKind::Dungeon => "Dungeon Run",
            RunKind::IdleFarm => "Idle Farming",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dungeon" => Ok(RunKind::Dungeon),
            "idle-farm" | "idle_farm" | "idlefarm" | "farm" => Ok(RunKind::IdleFarm),
            other => Err(format!("unknown run kind: {other}")),
        }
    }
}

/// Dungeon speed variant. Active runs finish 1.5x faster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    #[serde(alias = "Idle", alias = "IDLE")]
    Idle,
    #[serde(alias = "Active", alias = "ACTIVE")]
    Active,
}

impl RunMode {
    pub const ACTIVE_SPEED: f64 = 1.5;

    /// Game-time seconds that pass per wall-clock second.
    pub fn speed(self) -> f64 {
        match self {
            RunMode::Idle => 1.0,
            RunMode::Active => Self::ACTIVE_SPEED,
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(RunMode::Idle),
            "active" => Ok(RunMode::Active),
            other => Err(format!("unknown run mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dungeon_id: Option<String>,
}

/// Server view of a run, returned by `start` and `active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDescriptor {
    pub id: String,
    /// Dungeon metadata (or farm descriptor). Opaque to the client.
    #[serde(default, alias = "dungeon", skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Base duration in seconds, before the mode multiplier.
    pub duration: u64,
    #[serde(default)]
    pub mode: RunMode,
    /// RFC 3339 timestamp or epoch milliseconds.
    pub created_at: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_cost: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDrop {
    pub name: String,
    #[serde(default = "one")]
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rarity: Option<String>,
}

fn one() -> u32 {
    1
}

/// Result of `complete` and `fast-finish`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub success: bool,
    #[serde(default)]
    pub gold_earned: i64,
    #[serde(default)]
    pub exp_earned: i64,
    #[serde(default)]
    pub items_dropped: Vec<ItemDrop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hp_loss: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Sessions whose last login predates this instant must log out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_logout_timestamp: Option<serde_json::Value>,
}

/// Error body shape returned by the API on 4xx/5xx.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, alias = "message")]
    pub error: Option<String>,
}

/// Realtime events relevant to the adventure controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushEvent {
    #[serde(rename_all = "camelCase")]
    RunCompleted {
        kind: RunKind,
        #[serde(default)]
        run_id: Option<String>,
    },
    LevelUp { level: u32 },
    ChatMessage {
        channel: String,
        from: String,
        text: String,
    },
}

pub mod routes {
    use super::RunKind;

    pub const VERSION: &str = "/version";

    fn base(kind: RunKind) -> &'static str {
        match kind {
            RunKind::Dungeon => "/dungeons",
            RunKind::IdleFarm => "/idle-farm",
        }
    }

    pub fn start(kind: RunKind) -> String {
        format!("{}/start", base(kind))
    }

    pub fn active(kind: RunKind) -> String {
        format!("{}/active", base(kind))
    }

    pub fn complete(kind: RunKind, run_id: &str) -> String {
        format!("{}/{run_id}/complete", base(kind))
    }

    pub fn fast_finish(kind: RunKind, run_id: &str) -> String {
        format!("{}/{run_id}/fast-finish", base(kind))
    }
}
