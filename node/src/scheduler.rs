//! Timer and manual triggers for sync cycles.

use crate::dispatcher::{CycleOutcome, Dispatcher, Trigger};
use crate::error::SyncError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Wakes the scheduler for a manual cycle.
#[derive(Clone, Default)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a manual cycle. Requests made while one is pending collapse
    /// into it.
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    async fn fired(&self) {
        self.notify.notified().await;
    }
}

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    trigger: SyncTrigger,
    interval: Duration,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, trigger: SyncTrigger) -> Self {
        let minutes = u64::from(dispatcher.config().sync_interval_minutes.max(1));
        Self {
            dispatcher,
            trigger,
            interval: Duration::from_secs(minutes * 60),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run cycles until the task is aborted. The first timer tick fires
    /// immediately.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = self.interval.as_secs(), "Scheduler started");

        loop {
            let trigger = tokio::select! {
                _ = ticker.tick() => Trigger::Timer,
                _ = self.trigger.fired() => Trigger::Manual,
            };

            match self.dispatcher.execute_cycle(trigger).await {
                Ok(report) => {
                    if let CycleOutcome::Skipped { reason } = report.outcome {
                        tracing::trace!(?trigger, reason = %reason, "Cycle skipped");
                    }
                }
                Err(SyncError::AlreadyRunning) => {
                    tracing::debug!(?trigger, "Cycle already running");
                }
                // Logged by the dispatcher; retried on the next tick.
                Err(_) => {}
            }
        }
    }
}
