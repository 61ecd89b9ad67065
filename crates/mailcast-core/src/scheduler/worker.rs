//! Dispatch Worker - Periodic tick driving scheduled and sending broadcasts

use super::manager::BroadcastManager;
use crate::clock::Clock;
use crate::dispatch::{CycleReport, Orchestrator};
use crate::winner::{WinnerDecision, WinnerSelector, WinnerTrigger};
use futures::future::join_all;
use mailcast_storage::models::BroadcastStatus;
use mailcast_storage::repository::BroadcastRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub started: usize,
    pub cycles: usize,
    pub completed: usize,
    pub winners_selected: usize,
}

/// Dispatch Worker
pub struct DispatchWorker {
    manager: Arc<BroadcastManager>,
    orchestrator: Arc<Orchestrator>,
    winners: Arc<WinnerSelector>,
    broadcasts: Arc<dyn BroadcastRepository>,
    clock: Arc<dyn Clock>,
    /// Interval between ticks (seconds)
    tick_interval_secs: u64,
}

impl DispatchWorker {
    pub fn new(
        manager: Arc<BroadcastManager>,
        orchestrator: Arc<Orchestrator>,
        winners: Arc<WinnerSelector>,
        broadcasts: Arc<dyn BroadcastRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            manager,
            orchestrator,
            winners,
            broadcasts,
            clock,
            tick_interval_secs: 5,
        }
    }

    /// Set tick interval
    pub fn with_tick_interval(mut self, secs: u64) -> Self {
        self.tick_interval_secs = secs.max(1);
        self
    }

    /// Tick until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.tick_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.tick_interval_secs, "Dispatch worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => break,
            }

            let summary = self.tick().await;
            if summary != TickSummary::default() {
                debug!(
                    started = summary.started,
                    cycles = summary.cycles,
                    completed = summary.completed,
                    winners = summary.winners_selected,
                    "Dispatch tick"
                );
            }
        }

        info!("Dispatch worker stopped");
    }

    /// One pass: promote due broadcasts, score expired tests, run cycles.
    ///
    /// Failures are logged per broadcast and never abort the tick.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        let now = self.clock.now();

        match self.manager.start_due(now).await {
            Ok(started) => summary.started = started.len(),
            Err(e) => error!(error = %e, "Error starting scheduled broadcasts"),
        }

        let sending = match self.broadcasts.list_by_status(BroadcastStatus::Sending).await {
            Ok(sending) => sending,
            Err(e) => {
                error!(error = %e, "Error listing sending broadcasts");
                return summary;
            }
        };

        for broadcast in sending
            .iter()
            .filter(|b| b.test_settings.enabled && b.winning_variation.is_none())
        {
            match self
                .winners
                .evaluate(broadcast.id, now, WinnerTrigger::Deadline)
                .await
            {
                Ok(WinnerDecision::Selected(_)) => summary.winners_selected += 1,
                Ok(_) => {}
                Err(e) => error!(broadcast_id = %broadcast.id, error = %e, "Error evaluating winner"),
            }
        }

        let handles: Vec<_> = sending
            .iter()
            .map(|broadcast| {
                let orchestrator = self.orchestrator.clone();
                let id = broadcast.id;
                tokio::spawn(async move { (id, orchestrator.run_cycle(id).await) })
            })
            .collect();

        for joined in join_all(handles).await {
            match joined {
                Ok((_, Ok(report))) => {
                    summary.cycles += 1;
                    if report == CycleReport::Completed {
                        summary.completed += 1;
                    }
                }
                Ok((id, Err(e))) => {
                    summary.cycles += 1;
                    error!(broadcast_id = %id, error = %e, "Dispatch cycle failed");
                }
                Err(e) => error!(error = %e, "Dispatch cycle task panicked"),
            }
        }

        summary
    }
}
