use crate::adventure::Adventure;
use folkhart_protocol::{PushEvent, RunKind};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    pub tick_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(15),
        }
    }
}

/// Background tasks that keep an [`Adventure`] moving: the per-second tick,
/// the reconciliation poll and the realtime event feed. Dropping the handle
/// stops all of them.
pub struct DriverHandle {
    tasks: Vec<JoinHandle<()>>,
    push_tx: mpsc::Sender<PushEvent>,
}

impl DriverHandle {
    /// Sender for realtime events coming off the socket.
    pub fn push_sender(&self) -> mpsc::Sender<PushEvent> {
        self.push_tx.clone()
    }

    /// Stops every background task.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub fn spawn_driver(adventure: Adventure, config: DriverConfig) -> DriverHandle {
    let (push_tx, mut push_rx) = mpsc::channel::<PushEvent>(64);

    let ticker = {
        let adventure = adventure.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                adventure.tick().await;
            }
        })
    };

    let poller = {
        let adventure = adventure.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires at once; activation already polled.
            interval.tick().await;
            loop {
                interval.tick().await;
                for kind in RunKind::ALL {
                    adventure.poll(kind).await;
                }
            }
        })
    };

    let pushes = tokio::spawn(async move {
        while let Some(event) = push_rx.recv().await {
            adventure.handle_push(event).await;
        }
    });

    DriverHandle {
        tasks: vec![ticker, poller, pushes],
        push_tx,
    }
}
