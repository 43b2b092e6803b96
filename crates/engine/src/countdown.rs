use crate::run::Run;

/// Remaining time for a run, always derived from its absolute completion
/// instant so nothing carries over from a previous display.
#[derive(Debug, Clone, PartialEq)]
pub struct Countdown {
    pub run_id: String,
    pub completes_at_ms: i64,
    speed: f64,
}

impl Countdown {
    pub fn for_run(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            completes_at_ms: run.completes_at_ms,
            speed: run.mode.speed(),
        }
    }

    /// Wall-clock milliseconds until completion, floored at zero.
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        (self.completes_at_ms - now_ms).max(0)
    }

    /// Remaining game seconds, rounded up. Active runs count down 1.5 game
    /// seconds per wall second.
    pub fn display_secs(&self, now_ms: i64) -> u64 {
        let game_ms = self.remaining_ms(now_ms) as f64 * self.speed;
        (game_ms / 1000.0).ceil() as u64
    }

    pub fn is_zero(&self, now_ms: i64) -> bool {
        self.remaining_ms(now_ms) == 0
    }
}

/// `mm:ss`, or `h:mm:ss` past the hour.
pub fn format_secs(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
