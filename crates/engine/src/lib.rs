//! Run-timer reconciliation for the Folkhart adventure screen.
//!
//! A dungeon run or idle-farm session is a timed job owned by the server.
//! This crate keeps a locally predicted countdown for it, persists it across
//! restarts, completes it exactly once when it runs out, reconciles it with
//! the server's view, and holds the resulting reward until the player
//! dismisses it.

pub mod adventure;
pub mod api;
pub mod clock;
pub mod countdown;
pub mod driver;
pub mod machine;
pub mod notify;
pub mod run;
pub mod session;
pub mod sqlite;
pub mod store;

pub use adventure::{Adventure, AdventureError, SlotView, Wallet};
pub use api::{ApiError, GameApi};
pub use clock::{Clock, ManualClock, SystemClock};
pub use countdown::Countdown;
pub use driver::{spawn_driver, DriverConfig, DriverHandle};
pub use machine::ReconcilePolicy;
pub use notify::{Notifier, RecordingNotifier, Severity};
pub use run::{Run, UnclaimedReward};
pub use session::{check_session, SessionVerdict};
pub use sqlite::SqliteKv;
pub use store::{KvStore, MemoryKv, RunStore, StoreError};
