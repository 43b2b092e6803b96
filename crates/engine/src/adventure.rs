//! The Adventure-tab controller.
//!
//! Owns the [`RunStore`], one [`Slot`] per [`RunKind`], the one-shot expiry
//! timers and the local wallet. All state sits behind one mutex that is never
//! held across a network call: the reducer runs under the lock, the
//! resulting completion requests are issued after it is released, and their
//! responses come back through the reducer again.

use crate::api::{ApiError, GameApi};
use crate::clock::Clock;
use crate::countdown::Countdown;
use crate::machine::{reduce, Effect, Event, Failure, Origin, Phase, ReconcilePolicy, Slot};
use crate::notify::{Notifier, Severity};
use crate::run::{Run, UnclaimedReward};
use crate::store::RunStore;
use folkhart_protocol::{PushEvent, RunKind, StartRunRequest};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Extra delay on the one-shot timer so it never wakes a hair before
/// `completes_at` by the wall clock.
const EXPIRY_SLACK_MS: u64 = 25;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Wallet {
    pub gold: i64,
    pub gems: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AdventureError {
    #[error("a {0} run is already in progress")]
    AlreadyRunning(RunKind),

    #[error("no {0} run in progress")]
    NoActiveRun(RunKind),

    #[error("the last {0} reward has not been dismissed yet")]
    RewardPending(RunKind),

    #[error("not enough gems: need {needed}, have {available}")]
    InsufficientFunds { needed: i64, available: i64 },

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Read-only view of one slot, for display.
#[derive(Debug, Clone)]
pub struct SlotView {
    pub kind: RunKind,
    pub phase: &'static str,
    pub run: Option<Run>,
    pub remaining_ms: Option<i64>,
    pub display_secs: Option<u64>,
    pub reward: Option<UnclaimedReward>,
}

struct ExpiryTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct State {
    store: RunStore,
    slots: BTreeMap<RunKind, Slot>,
    timers: HashMap<RunKind, ExpiryTimer>,
    next_timer_generation: u64,
    wallet: Wallet,
    /// Gems deducted for a fast finish that has not resolved yet.
    fast_finish_holds: HashMap<RunKind, i64>,
}

struct Inner {
    api: Arc<dyn GameApi>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    policy: ReconcilePolicy,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct Adventure {
    inner: Arc<Inner>,
}

type Request = (String, Origin);

impl Adventure {
    pub fn new(
        store: RunStore,
        api: Arc<dyn GameApi>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        policy: ReconcilePolicy,
    ) -> Self {
        let slots = RunKind::ALL
            .iter()
            .map(|kind| (*kind, Slot::default()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                api,
                notifier,
                clock,
                policy,
                state: Mutex::new(State {
                    store,
                    slots,
                    timers: HashMap::new(),
                    next_timer_generation: 0,
                    wallet: Wallet::default(),
                    fast_finish_holds: HashMap::new(),
                }),
            }),
        }
    }

    fn now_ms(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reloads every slot from storage. Remaining time is recomputed from the
    /// stored absolute completion instant.
    pub fn mount(&self) {
        let now_ms = self.now_ms();
        let mut state = self.lock();
        for kind in RunKind::ALL {
            let run = state.store.load(kind);
            let reward_present = state.store.load_reward(kind).is_some();
            let event = Event::Restored {
                run,
                reward_present,
                now_ms,
            };
            let requests = self.apply(&mut state, kind, event);
            debug_assert!(requests.is_empty());
        }
    }

    /// Mount, then reconcile every kind against the server.
    pub async fn activate(&self) {
        self.mount();
        for kind in RunKind::ALL {
            self.poll(kind).await;
        }
    }

    pub async fn start_run(
        &self,
        kind: RunKind,
        request: StartRunRequest,
    ) -> Result<Run, AdventureError> {
        let (busy, reward_pending) = {
            let state = self.lock();
            (
                state.slot(kind).phase.active_run().is_some(),
                state.store.load_reward(kind).is_some(),
            )
        };
        if busy {
            return Err(AdventureError::AlreadyRunning(kind));
        }
        // One reward slot per kind: a second completion would overwrite it.
        if reward_pending {
            return Err(AdventureError::RewardPending(kind));
        }
        let desc = match self.inner.api.start_run(kind, &request).await {
            Ok(desc) => desc,
            Err(e) => {
                warn!(%kind, error = %e, "start run failed");
                self.inner.notifier.notify(
                    &format!("Failed to start {}: {e}", kind.display_name()),
                    Severity::Error,
                );
                return Err(e.into());
            }
        };
        if let Some(cost) = desc.energy_cost {
            debug!(%kind, energy_cost = cost, "run started on server");
        }
        let run = Run::from_descriptor(kind, &desc, self.now_ms());
        let mut state = self.lock();
        let requests = self.apply(&mut state, kind, Event::Started(run.clone()));
        debug_assert!(requests.is_empty());
        Ok(run)
    }

    /// Per-second tick: any expired running run begins completion.
    pub async fn tick(&self) {
        for kind in RunKind::ALL {
            let now_ms = self.now_ms();
            let requests = {
                let mut state = self.lock();
                self.apply(&mut state, kind, Event::Tick { now_ms })
            };
            self.resolve(kind, requests).await;
        }
    }

    async fn on_expiry(&self, kind: RunKind, generation: u64, run_id: String) {
        let now_ms = self.now_ms();
        let requests = {
            let mut state = self.lock();
            // Detach our own handle first so a later CancelExpiry cannot abort
            // this task halfway through the completion call.
            if state
                .timers
                .get(&kind)
                .is_some_and(|t| t.generation == generation)
            {
                state.timers.remove(&kind);
            }
            self.apply(&mut state, kind, Event::Expired { run_id, now_ms })
        };
        self.resolve(kind, requests).await;
    }

    /// Fetches the server's active run and reconciles. Failures are
    /// swallowed; the next poll retries.
    pub async fn poll(&self, kind: RunKind) {
        let server = match self.inner.api.active_run(kind).await {
            Ok(desc) => desc,
            Err(e) => {
                debug!(%kind, error = %e, "active run poll failed");
                return;
            }
        };
        let now_ms = self.now_ms();
        let server = server.map(|desc| Run::from_descriptor(kind, &desc, now_ms));
        let requests = {
            let mut state = self.lock();
            self.apply(&mut state, kind, Event::Polled { server, now_ms })
        };
        self.resolve(kind, requests).await;
    }

    /// Spends `cost` gems to complete the running run immediately. The gems
    /// are deducted up front and handed back if the call fails.
    pub async fn fast_finish(
        &self,
        kind: RunKind,
        cost: i64,
    ) -> Result<UnclaimedReward, AdventureError> {
        let requests = {
            let mut state = self.lock();
            let run_id = match &state.slot(kind).phase {
                Phase::Running(run) => run.id.clone(),
                _ => return Err(AdventureError::NoActiveRun(kind)),
            };
            let available = state.wallet.gems;
            if available < cost {
                drop(state);
                self.inner
                    .notifier
                    .notify("Not enough gems to fast finish", Severity::Error);
                return Err(AdventureError::InsufficientFunds {
                    needed: cost,
                    available,
                });
            }
            state.wallet.gems -= cost;
            state.fast_finish_holds.insert(kind, cost);
            self.apply(&mut state, kind, Event::FastFinishRequested { run_id })
        };

        let mut outcome = Ok(());
        for (run_id, origin) in requests {
            outcome = self.complete(kind, run_id, origin).await;
        }
        outcome?;

        self.lock()
            .store
            .load_reward(kind)
            .ok_or(AdventureError::NoActiveRun(kind))
    }

    async fn resolve(&self, kind: RunKind, requests: Vec<Request>) {
        for (run_id, origin) in requests {
            // Failures were already turned into notifications by the reducer.
            let _ = self.complete(kind, run_id, origin).await;
        }
    }

    async fn complete(&self, kind: RunKind, run_id: String, origin: Origin) -> Result<(), ApiError> {
        let api = &self.inner.api;
        let response = match origin {
            Origin::FastFinish => api.fast_finish(kind, &run_id).await,
            Origin::Expiry | Origin::Reconciliation => api.complete_run(kind, &run_id).await,
        };
        let now_ms = self.now_ms();

        let mut state = self.lock();
        let hold = if origin == Origin::FastFinish {
            state.fast_finish_holds.remove(&kind)
        } else {
            None
        };
        match response {
            Ok(result) => {
                let awaited = matches!(
                    &state.slot(kind).phase,
                    Phase::PendingCompletion { run, .. } if run.id == run_id
                );
                if awaited {
                    state.wallet.gold += result.gold_earned;
                }
                let requests = self.apply(
                    &mut state,
                    kind,
                    Event::CompletionSucceeded {
                        run_id,
                        result,
                        now_ms,
                    },
                );
                debug_assert!(requests.is_empty());
                Ok(())
            }
            Err(e) => {
                if let Some(cost) = hold {
                    state.wallet.gems += cost;
                }
                warn!(%kind, %run_id, ?origin, error = %e, "completion call failed");
                let failure = match &e {
                    ApiError::RunGone(_) => Failure::Gone,
                    ApiError::InsufficientFunds(_) => {
                        Failure::Rejected("Not enough gems to fast finish".to_string())
                    }
                    other => Failure::Transient(other.to_string()),
                };
                let requests =
                    self.apply(&mut state, kind, Event::CompletionFailed { run_id, failure });
                debug_assert!(requests.is_empty());
                Err(e)
            }
        }
    }

    /// Acknowledges the reward for `kind`, clearing it and its completed run.
    pub fn dismiss_reward(&self, kind: RunKind) -> Option<UnclaimedReward> {
        let mut state = self.lock();
        let reward = state.store.load_reward(kind);
        let requests = self.apply(&mut state, kind, Event::Dismissed);
        debug_assert!(requests.is_empty());
        reward
    }

    pub fn pending_rewards(&self) -> Vec<UnclaimedReward> {
        let state = self.lock();
        RunKind::ALL
            .iter()
            .filter_map(|kind| state.store.load_reward(*kind))
            .collect()
    }

    pub fn snapshot(&self, kind: RunKind) -> SlotView {
        let now_ms = self.now_ms();
        let state = self.lock();
        let slot = state.slot(kind);
        let countdown = slot.phase.active_run().map(Countdown::for_run);
        SlotView {
            kind,
            phase: slot.phase.name(),
            run: slot.phase.run().cloned(),
            remaining_ms: countdown.as_ref().map(|c| c.remaining_ms(now_ms)),
            display_secs: countdown.as_ref().map(|c| c.display_secs(now_ms)),
            reward: state.store.load_reward(kind),
        }
    }

    pub fn wallet(&self) -> Wallet {
        self.lock().wallet
    }

    pub fn set_wallet(&self, wallet: Wallet) {
        self.lock().wallet = wallet;
    }

    /// A pushed "run completed" stands in for the next poll of that kind.
    pub async fn handle_push(&self, event: PushEvent) {
        match event {
            PushEvent::RunCompleted { kind, run_id } => {
                debug!(%kind, ?run_id, "push: run completed");
                self.poll(kind).await;
            }
            PushEvent::LevelUp { level } => {
                info!(level, "level up");
                self.inner
                    .notifier
                    .notify(&format!("Level up! You are now level {level}"), Severity::Info);
            }
            PushEvent::ChatMessage { channel, from, .. } => {
                debug!(%channel, %from, "chat message ignored by adventure controller");
            }
        }
    }

    fn apply(&self, state: &mut State, kind: RunKind, event: Event) -> Vec<Request> {
        let slot = state.slots.entry(kind).or_default();
        let effects = reduce(slot, event, &self.inner.policy);
        let mut requests = Vec::new();
        let mut run_cleared = true;
        for effect in effects {
            match effect {
                Effect::PersistRun(run) => state.store.save(&run),
                Effect::ClearRun => run_cleared = state.store.clear(kind),
                Effect::PersistReward(reward) => state.store.save_reward(kind, &reward),
                // A completed run left behind without its reward would have
                // the reward re-derived on the next mount.
                Effect::ClearReward if !run_cleared => {
                    warn!(%kind, "run record could not be removed; keeping its reward");
                }
                Effect::ClearReward => {
                    state.store.clear_reward(kind);
                }
                Effect::CancelExpiry => {
                    if let Some(timer) = state.timers.remove(&kind) {
                        timer.handle.abort();
                    }
                }
                Effect::ScheduleExpiry(run) => self.schedule_expiry(state, kind, &run),
                Effect::Notify { message, severity } => {
                    self.inner.notifier.notify(&message, severity)
                }
                Effect::RequestCompletion { run_id, origin } => requests.push((run_id, origin)),
            }
        }
        requests
    }

    fn schedule_expiry(&self, state: &mut State, kind: RunKind, run: &Run) {
        if let Some(old) = state.timers.remove(&kind) {
            old.handle.abort();
        }
        let remaining_ms = run.completes_at_ms - self.now_ms();
        if remaining_ms <= 0 {
            // Already due: the next tick picks it up.
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(%kind, "no runtime for expiry timer; relying on ticks");
            return;
        };
        state.next_timer_generation += 1;
        let generation = state.next_timer_generation;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let run_id = run.id.clone();
        let delay = Duration::from_millis(remaining_ms as u64 + EXPIRY_SLACK_MS);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Adventure { inner }.on_expiry(kind, generation, run_id).await;
            }
        });
        state.timers.insert(kind, ExpiryTimer { generation, handle });
    }

    #[cfg(test)]
    pub(crate) async fn deliver_completion(
        &self,
        kind: RunKind,
        run_id: &str,
        origin: Origin,
    ) -> Result<(), ApiError> {
        self.complete(kind, run_id.to_string(), origin).await
    }

    #[cfg(test)]
    pub(crate) fn has_expiry_timer(&self, kind: RunKind) -> bool {
        self.lock().timers.contains_key(&kind)
    }

    #[cfg(test)]
    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&mut RunStore) -> R) -> R {
        f(&mut self.lock().store)
    }
}

impl State {
    fn slot(&self, kind: RunKind) -> &Slot {
        static IDLE: Slot = Slot {
            phase: Phase::Idle,
            failure_streak: 0,
        };
        self.slots.get(&kind).unwrap_or(&IDLE)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in state.timers.drain() {
            timer.handle.abort();
        }
    }
}
