//! Per-kind run state machine.
//!
//! Every trigger (tick, one-shot expiry, poll result, user action, completion
//! response) becomes an [`Event`] and goes through [`reduce`]. The reducer is
//! the only place a slot changes phase, which makes it the single place the
//! "complete at most once" guard lives: the first completion trigger moves
//! the slot to [`Phase::PendingCompletion`] and every later trigger for the
//! same run finds it no longer `Running`.

use crate::notify::Severity;
use crate::run::{Run, UnclaimedReward};
use folkhart_protocol::CompletionResult;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Expiry,
    Reconciliation,
    FastFinish,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Running(Run),
    PendingCompletion { run: Run, origin: Origin },
    /// Finished with a result; the run record is kept until its reward is
    /// dismissed or a new run replaces it.
    Completed(Run),
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Running(_) => "running",
            Phase::PendingCompletion { .. } => "pending-completion",
            Phase::Completed(_) => "completed",
        }
    }

    pub fn run(&self) -> Option<&Run> {
        match self {
            Phase::Idle => None,
            Phase::Running(run) | Phase::Completed(run) => Some(run),
            Phase::PendingCompletion { run, .. } => Some(run),
        }
    }

    /// A run that still occupies the slot (running or completing).
    pub fn active_run(&self) -> Option<&Run> {
        match self {
            Phase::Running(run) | Phase::PendingCompletion { run, .. } => Some(run),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub phase: Phase,
    /// Consecutive transient completion failures for the current run.
    pub failure_streak: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcilePolicy {
    /// A running run younger than this is kept even when the server does not
    /// report it yet. Zero discards immediately.
    pub server_loss_grace_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// The server no longer knows the run. Nothing to retry.
    Gone,
    /// Refused for a reason that leaves the run intact (e.g. not enough gems).
    Rejected(String),
    Transient(String),
}

#[derive(Debug, Clone)]
pub enum Event {
    Restored {
        run: Option<Run>,
        reward_present: bool,
        now_ms: i64,
    },
    Started(Run),
    Tick {
        now_ms: i64,
    },
    Expired {
        run_id: String,
        now_ms: i64,
    },
    Polled {
        server: Option<Run>,
        now_ms: i64,
    },
    FastFinishRequested {
        run_id: String,
    },
    CompletionSucceeded {
        run_id: String,
        result: CompletionResult,
        now_ms: i64,
    },
    CompletionFailed {
        run_id: String,
        failure: Failure,
    },
    Dismissed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PersistRun(Run),
    ClearRun,
    ScheduleExpiry(Run),
    CancelExpiry,
    PersistReward(UnclaimedReward),
    ClearReward,
    RequestCompletion { run_id: String, origin: Origin },
    Notify { message: String, severity: Severity },
}

pub fn reduce(slot: &mut Slot, event: Event, policy: &ReconcilePolicy) -> Vec<Effect> {
    let phase = std::mem::take(&mut slot.phase);
    let (next, effects) = step(slot, phase, event, policy);
    slot.phase = next;
    effects
}

fn step(
    slot: &mut Slot,
    phase: Phase,
    event: Event,
    policy: &ReconcilePolicy,
) -> (Phase, Vec<Effect>) {
    match (phase, event) {
        // Re-mount never interrupts a completion call in flight.
        (phase @ Phase::PendingCompletion { .. }, Event::Restored { .. }) => (phase, vec![]),
        (
            _,
            Event::Restored {
                run,
                reward_present,
                now_ms,
            },
        ) => {
            slot.failure_streak = 0;
            match run {
                None => (Phase::Idle, vec![Effect::CancelExpiry]),
                Some(run) if run.completed => {
                    let mut effects = vec![Effect::CancelExpiry];
                    if let (false, Some(result)) = (reward_present, run.result.clone()) {
                        info!(run_id = %run.id, "re-deriving reward for completed run");
                        effects.push(Effect::PersistReward(UnclaimedReward::from_run(
                            &run, result, now_ms,
                        )));
                    }
                    (Phase::Completed(run), effects)
                }
                Some(run) => {
                    let effects = vec![Effect::CancelExpiry, Effect::ScheduleExpiry(run.clone())];
                    (Phase::Running(run), effects)
                }
            }
        }

        (phase @ (Phase::Idle | Phase::Completed(_)), Event::Started(run)) => {
            if let Phase::Completed(old) = &phase {
                debug!(old = %old.id, new = %run.id, "new run replaces completed run record");
            }
            info!(run_id = %run.id, kind = %run.kind, completes_at_ms = run.completes_at_ms, "run started");
            slot.failure_streak = 0;
            let effects = vec![
                Effect::CancelExpiry,
                Effect::PersistRun(run.clone()),
                Effect::ScheduleExpiry(run.clone()),
            ];
            (Phase::Running(run), effects)
        }
        (phase, Event::Started(run)) => {
            debug!(run_id = %run.id, phase = phase.name(), "ignoring start while a run is active");
            (phase, vec![])
        }

        (Phase::Running(run), Event::Tick { now_ms }) if run.is_expired(now_ms) => {
            begin_completion(run, Origin::Expiry)
        }
        (Phase::Running(run), Event::Expired { run_id, now_ms })
            if run.id == run_id && run.is_expired(now_ms) =>
        {
            begin_completion(run, Origin::Expiry)
        }
        (phase, Event::Tick { .. } | Event::Expired { .. }) => (phase, vec![]),

        (Phase::Running(run), Event::FastFinishRequested { run_id }) if run.id == run_id => {
            begin_completion(run, Origin::FastFinish)
        }
        (phase, Event::FastFinishRequested { .. }) => (phase, vec![]),

        (phase, Event::Polled { server, now_ms }) => reconcile(slot, phase, server, now_ms, policy),

        (
            Phase::PendingCompletion { run, origin },
            Event::CompletionSucceeded {
                run_id,
                result,
                now_ms,
            },
        ) if run.id == run_id => {
            slot.failure_streak = 0;
            let mut done = run;
            done.completed = true;
            done.result = Some(result.clone());
            let reward = UnclaimedReward::from_run(&done, result, now_ms);
            info!(run_id = %done.id, ?origin, success = reward.result.success, "run completed");
            let message = format!(
                "{} finished: +{} gold, +{} exp",
                reward.label, reward.result.gold_earned, reward.result.exp_earned
            );
            let effects = vec![
                Effect::CancelExpiry,
                Effect::PersistRun(done.clone()),
                Effect::PersistReward(reward),
                Effect::Notify {
                    message,
                    severity: Severity::Success,
                },
            ];
            (Phase::Completed(done), effects)
        }
        (
            Phase::PendingCompletion { run, origin },
            Event::CompletionFailed { run_id, failure },
        ) if run.id == run_id => match failure {
            Failure::Gone => {
                info!(run_id = %run.id, "server no longer has the run; discarding");
                slot.failure_streak = 0;
                (Phase::Idle, vec![Effect::CancelExpiry, Effect::ClearRun])
            }
            Failure::Rejected(message) => {
                let effects = vec![Effect::Notify {
                    message,
                    severity: Severity::Error,
                }];
                (Phase::Running(run), effects)
            }
            Failure::Transient(message) => {
                slot.failure_streak += 1;
                // User actions always report; background retries report once per streak.
                let effects = if origin == Origin::FastFinish || slot.failure_streak == 1 {
                    vec![Effect::Notify {
                        message: format!("Could not finish {}: {message}", run.label()),
                        severity: Severity::Error,
                    }]
                } else {
                    vec![]
                };
                (Phase::Running(run), effects)
            }
        },
        (phase, Event::CompletionSucceeded { run_id, .. } | Event::CompletionFailed { run_id, .. }) => {
            debug!(%run_id, phase = phase.name(), "ignoring stale completion response");
            (phase, vec![])
        }

        // The run record goes first: a reward outliving its run is harmless,
        // a completed run outliving its reward brings the reward back.
        (Phase::Idle | Phase::Completed(_), Event::Dismissed) => {
            (Phase::Idle, vec![Effect::ClearRun, Effect::ClearReward])
        }
        (phase, Event::Dismissed) => (phase, vec![Effect::ClearReward]),
    }
}

fn begin_completion(run: Run, origin: Origin) -> (Phase, Vec<Effect>) {
    let effects = vec![Effect::RequestCompletion {
        run_id: run.id.clone(),
        origin,
    }];
    (Phase::PendingCompletion { run, origin }, effects)
}

fn reconcile(
    slot: &mut Slot,
    phase: Phase,
    server: Option<Run>,
    now_ms: i64,
    policy: &ReconcilePolicy,
) -> (Phase, Vec<Effect>) {
    match (phase, server) {
        (Phase::Idle, Some(remote)) => {
            info!(run_id = %remote.id, kind = %remote.kind, "adopting server run");
            slot.failure_streak = 0;
            let effects = vec![
                Effect::PersistRun(remote.clone()),
                Effect::ScheduleExpiry(remote.clone()),
            ];
            (Phase::Running(remote), effects)
        }
        (Phase::Running(local), Some(remote)) if local.id != remote.id => {
            info!(local = %local.id, remote = %remote.id, "server reports a different run; replacing");
            slot.failure_streak = 0;
            let effects = vec![
                Effect::CancelExpiry,
                Effect::PersistRun(remote.clone()),
                Effect::ScheduleExpiry(remote.clone()),
            ];
            (Phase::Running(remote), effects)
        }
        (Phase::Running(local), None) if local.is_expired(now_ms) => {
            begin_completion(local, Origin::Reconciliation)
        }
        (Phase::Running(local), None) => {
            if now_ms - local.started_at_ms < policy.server_loss_grace_ms {
                debug!(run_id = %local.id, "server does not report run yet; within grace");
                return (Phase::Running(local), vec![]);
            }
            info!(run_id = %local.id, "server lost the run before it finished; discarding");
            slot.failure_streak = 0;
            (Phase::Idle, vec![Effect::CancelExpiry, Effect::ClearRun])
        }
        (phase, _) => (phase, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folkhart_protocol::{RunKind, RunMode};

    fn run(id: &str, completes_at_ms: i64) -> Run {
        Run {
            id: id.to_string(),
            kind: RunKind::Dungeon,
            mode: RunMode::Idle,
            started_at_ms: 0,
            completes_at_ms,
            completed: false,
            payload: None,
            result: None,
        }
    }

    fn running(id: &str, completes_at_ms: i64) -> Slot {
        Slot {
            phase: Phase::Running(run(id, completes_at_ms)),
            failure_streak: 0,
        }
    }

    fn requests(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::RequestCompletion { .. }))
            .count()
    }

    #[test]
    fn expiry_requests_completion_once() {
        let policy = ReconcilePolicy::default();
        let mut slot = running("r1", 1000);
        assert!(reduce(&mut slot, Event::Tick { now_ms: 999 }, &policy).is_empty());

        let first = reduce(&mut slot, Event::Tick { now_ms: 1000 }, &policy);
        assert_eq!(requests(&first), 1);
        let second = reduce(
            &mut slot,
            Event::Polled {
                server: None,
                now_ms: 1001,
            },
            &policy,
        );
        let third = reduce(
            &mut slot,
            Event::Expired {
                run_id: "r1".into(),
                now_ms: 1002,
            },
            &policy,
        );
        assert_eq!(requests(&second) + requests(&third), 0);
        assert_eq!(slot.phase.name(), "pending-completion");
    }

    #[test]
    fn expired_event_for_other_run_is_ignored() {
        let mut slot = running("r1", 0);
        let effects = reduce(
            &mut slot,
            Event::Expired {
                run_id: "old".into(),
                now_ms: 10,
            },
            &ReconcilePolicy::default(),
        );
        assert!(effects.is_empty());
        assert_eq!(slot.phase.name(), "running");
    }

    #[test]
    fn success_persists_run_and_reward() {
        let policy = ReconcilePolicy::default();
        let mut slot = running("r1", 0);
        reduce(&mut slot, Event::Tick { now_ms: 5 }, &policy);
        let effects = reduce(
            &mut slot,
            Event::CompletionSucceeded {
                run_id: "r1".into(),
                result: CompletionResult {
                    success: true,
                    gold_earned: 10,
                    ..Default::default()
                },
                now_ms: 6,
            },
            &policy,
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::PersistRun(r) if r.completed)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::PersistReward(r) if r.result.gold_earned == 10)));
        assert_eq!(slot.phase.name(), "completed");

        // A late duplicate success must not produce a second reward.
        let dup = reduce(
            &mut slot,
            Event::CompletionSucceeded {
                run_id: "r1".into(),
                result: CompletionResult::default(),
                now_ms: 7,
            },
            &policy,
        );
        assert!(dup.is_empty());
    }

    #[test]
    fn transient_failure_notifies_once_per_streak() {
        let policy = ReconcilePolicy::default();
        let mut slot = running("r1", 0);
        let mut notices = 0;
        for now_ms in 1..=3 {
            reduce(&mut slot, Event::Tick { now_ms }, &policy);
            let effects = reduce(
                &mut slot,
                Event::CompletionFailed {
                    run_id: "r1".into(),
                    failure: Failure::Transient("503".into()),
                },
                &policy,
            );
            notices += effects
                .iter()
                .filter(|e| matches!(e, Effect::Notify { .. }))
                .count();
        }
        assert_eq!(notices, 1);
        assert_eq!(slot.failure_streak, 3);
        assert_eq!(slot.phase.name(), "running");
    }

    #[test]
    fn gone_discards_without_reward() {
        let policy = ReconcilePolicy::default();
        let mut slot = running("r1", 0);
        reduce(&mut slot, Event::Tick { now_ms: 1 }, &policy);
        let effects = reduce(
            &mut slot,
            Event::CompletionFailed {
                run_id: "r1".into(),
                failure: Failure::Gone,
            },
            &policy,
        );
        assert_eq!(effects, vec![Effect::CancelExpiry, Effect::ClearRun]);
        assert_eq!(slot.phase, Phase::Idle);
    }

    #[test]
    fn grace_window_keeps_fresh_run() {
        let policy = ReconcilePolicy {
            server_loss_grace_ms: 5_000,
        };
        let mut slot = running("r1", 300_000);
        let kept = reduce(
            &mut slot,
            Event::Polled {
                server: None,
                now_ms: 4_000,
            },
            &policy,
        );
        assert!(kept.is_empty());
        let dropped = reduce(
            &mut slot,
            Event::Polled {
                server: None,
                now_ms: 6_000,
            },
            &policy,
        );
        assert!(dropped.contains(&Effect::ClearRun));
        assert_eq!(slot.phase, Phase::Idle);
    }

    #[test]
    fn server_run_with_new_id_replaces_local() {
        let mut slot = running("r1", 300_000);
        reduce(
            &mut slot,
            Event::Polled {
                server: Some(run("r2", 400_000)),
                now_ms: 10,
            },
            &ReconcilePolicy::default(),
        );
        assert_eq!(slot.phase.run().map(|r| r.id.as_str()), Some("r2"));
    }

    #[test]
    fn completed_slot_ignores_polls_and_clears_on_dismiss() {
        let mut done = run("r1", 0);
        done.completed = true;
        let mut slot = Slot {
            phase: Phase::Completed(done),
            failure_streak: 0,
        };
        let policy = ReconcilePolicy::default();
        assert!(reduce(
            &mut slot,
            Event::Polled {
                server: Some(run("r9", 10)),
                now_ms: 1
            },
            &policy
        )
        .is_empty());
        let effects = reduce(&mut slot, Event::Dismissed, &policy);
        assert_eq!(effects, vec![Effect::ClearRun, Effect::ClearReward]);
        assert_eq!(slot.phase, Phase::Idle);

        // Dismissing again after a partial failure retries both deletes.
        let effects = reduce(&mut slot, Event::Dismissed, &policy);
        assert_eq!(effects, vec![Effect::ClearRun, Effect::ClearReward]);
    }

    #[test]
    fn dismiss_during_a_run_leaves_the_run_alone() {
        let mut slot = running("r2", 1000);
        let effects = reduce(&mut slot, Event::Dismissed, &ReconcilePolicy::default());
        assert_eq!(effects, vec![Effect::ClearReward]);
        assert_eq!(slot.phase.name(), "running");
    }

    #[test]
    fn restoring_completed_run_without_reward_rederives_it() {
        let mut done = run("r1", 0);
        done.completed = true;
        done.result = Some(CompletionResult {
            success: true,
            ..Default::default()
        });
        let mut slot = Slot::default();
        let effects = reduce(
            &mut slot,
            Event::Restored {
                run: Some(done),
                reward_present: false,
                now_ms: 3,
            },
            &ReconcilePolicy::default(),
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::PersistReward(r) if r.run_id == "r1")));
    }
}
