use folkhart_protocol::{CompletionResult, RunDescriptor, RunKind, RunMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// One timed activity, as the client tracks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub kind: RunKind,
    pub mode: RunMode,
    pub started_at_ms: i64,
    pub completes_at_ms: i64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CompletionResult>,
}

impl Run {
    /// Builds a run from the server's descriptor. `createdAt` anchors the
    /// start; when it is unreadable the caller's `now_ms` is used instead.
    pub fn from_descriptor(kind: RunKind, desc: &RunDescriptor, now_ms: i64) -> Self {
        // Mode only applies to dungeons.
        let mode = match kind {
            RunKind::Dungeon => desc.mode,
            RunKind::IdleFarm => RunMode::Idle,
        };
        let started_at_ms = parse_timestamp_ms(&desc.created_at).unwrap_or(now_ms);
        let base_ms = i64::try_from(desc.duration)
            .unwrap_or(i64::MAX / 1000)
            .saturating_mul(1000);
        Self {
            id: desc.id.clone(),
            kind,
            mode,
            started_at_ms,
            completes_at_ms: started_at_ms.saturating_add(effective_duration_ms(base_ms, mode)),
            completed: false,
            payload: desc.payload.clone(),
            result: None,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.completes_at_ms
    }

    pub fn label(&self) -> String {
        self.payload
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.kind.display_name().to_string())
    }
}

/// Wall-clock duration of a run whose server-side base duration is `base_ms`.
pub fn effective_duration_ms(base_ms: i64, mode: RunMode) -> i64 {
    match mode {
        RunMode::Idle => base_ms,
        // D / 1.5 == 2D / 3, kept in integers so 300s lands on exactly 200s.
        RunMode::Active => base_ms.saturating_mul(2) / 3,
    }
}

/// Accepts RFC 3339 strings, numeric epoch milliseconds, or numeric strings.
pub fn parse_timestamp_ms(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => {
            if let Ok(ms) = s.trim().parse::<i64>() {
                return Some(ms);
            }
            let dt = OffsetDateTime::parse(s.trim(), &Rfc3339).ok()?;
            i64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok()
        }
        _ => None,
    }
}

pub fn format_timestamp_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

/// A reward waiting for the player to acknowledge it. Lives apart from the
/// run so clearing the run never loses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnclaimedReward {
    pub source_kind: RunKind,
    pub run_id: String,
    pub label: String,
    pub result: CompletionResult,
    pub created_at_ms: i64,
}

impl UnclaimedReward {
    pub fn from_run(run: &Run, result: CompletionResult, now_ms: i64) -> Self {
        Self {
            source_kind: run.kind,
            run_id: run.id.clone(),
            label: run.label(),
            result,
            created_at_ms: now_ms,
        }
    }
}

impl fmt::Display for UnclaimedReward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.result;
        let outcome = if r.success { "Victory" } else { "Defeat" };
        writeln!(f, "{} ({}): {}", self.label, self.source_kind, outcome)?;
        writeln!(f, "  gold +{}  exp +{}", r.gold_earned, r.exp_earned)?;
        if let Some(hp) = r.hp_loss.filter(|hp| *hp > 0) {
            writeln!(f, "  hp -{hp}")?;
        }
        if r.items_dropped.is_empty() {
            write!(f, "  no items")
        } else {
            let items = r
                .items_dropped
                .iter()
                .map(|i| match &i.rarity {
                    Some(rarity) => format!("{} x{} [{rarity}]", i.name, i.quantity),
                    None => format!("{} x{}", i.name, i.quantity),
                })
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "  items: {items}")
        }
    }
}
