//! `RehydrationWorker`: the restart-time background sweep (spec §4.8).
//! Grounded on `scheduler.rs`'s throttled polling loop shape, with the
//! single-trigger coalescing idiom from `coordinator.rs`'s command channel
//! (a 1-buffered channel where a second signal while one sweep is pending
//! is simply dropped, rather than queued).

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::RehydrationConfig;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy)]
pub enum SweepTrigger {
    Startup,
    Manual,
}

pub struct RehydrationWorker {
    orchestrator: Orchestrator,
    config: RehydrationConfig,
    trigger_tx: mpsc::Sender<SweepTrigger>,
    trigger_rx: mpsc::Receiver<SweepTrigger>,
}

impl RehydrationWorker {
    pub fn new(orchestrator: Orchestrator, config: RehydrationConfig) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        RehydrationWorker {
            orchestrator,
            config,
            trigger_tx,
            trigger_rx,
        }
    }

    /// A cheaply clonable handle callers can use to request an
    /// out-of-schedule sweep. A pending request already queued makes this a
    /// silent no-op, matching the coalescing intent: one extra sweep is
    /// enough, however many callers asked for it.
    pub fn trigger_handle(&self) -> mpsc::Sender<SweepTrigger> {
        self.trigger_tx.clone()
    }

    /// Runs until the trigger channel closes (every handle, including the
    /// one retained by the caller, has been dropped). Waits `startup_delay`
    /// before the first sweep, then performs one sweep per received
    /// trigger, always also firing a `SweepTrigger::Startup` sweep up front
    /// if `run_on_start` is set.
    pub async fn run(mut self) {
        if self.config.run_on_start {
            let _ = self.trigger_tx.try_send(SweepTrigger::Startup);
        }

        tokio::time::sleep(self.config.startup_delay()).await;

        while let Some(trigger) = self.trigger_rx.recv().await {
            info!(?trigger, "rehydration sweep starting");
            let sweep = tokio::time::timeout(
                self.config.sweep_timeout(),
                self.orchestrator.rehydrate_in_flight(),
            )
            .await;

            match sweep {
                Ok(Ok(())) => info!("rehydration sweep completed"),
                Ok(Err(err)) => warn!(error = %err, "rehydration sweep returned an error"),
                Err(_) => warn!("rehydration sweep timed out"),
            }
        }
    }
}
