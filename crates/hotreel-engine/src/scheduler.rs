//! Recurrence timer for auto-updating jobs.
//!
//! One armed timer at a time. A tick that finds a run still active is dropped (no queueing,
//! no catch-up) and the timer is armed again for another full interval.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hotreel_core::ScrapeConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::OrchestratorState;
use crate::Orchestrator;

pub(crate) struct ArmedTimer {
    cancel: CancellationToken,
    due_at: DateTime<Utc>,
}

impl ArmedTimer {
    pub(crate) fn due_at(&self) -> DateTime<Utc> {
        self.due_at
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Orchestrator {
    /// Replaces any armed timer with a fresh one firing after `minutes`.
    pub(crate) fn arm_timer(&self, state: &mut OrchestratorState, config: ScrapeConfig, minutes: u32) {
        state.disarm_timer();

        let interval = Duration::from_secs(u64::from(minutes) * 60);
        let cancel = CancellationToken::new();
        let due_at = Utc::now() + chrono::Duration::minutes(i64::from(minutes));

        let token = cancel.clone();
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(interval) => this.on_tick(token, config, minutes).await,
            }
        });

        info!(minutes, due_at = %due_at, "next automatic update armed");
        state.timer = Some(ArmedTimer { cancel, due_at });
    }

    async fn on_tick(&self, token: CancellationToken, config: ScrapeConfig, minutes: u32) {
        let mut state = self.inner.state.lock().await;
        // disarmed or replaced while waiting for the lock
        if token.is_cancelled() {
            return;
        }
        state.timer = None;

        if state.stop_requested {
            info!("stop requested, automatic update not started");
            return;
        }
        if state.active.is_some() {
            info!("previous run still active, skipping this update");
            self.arm_timer(&mut state, config, minutes);
            return;
        }

        state.last_update = Some(Utc::now());
        let config = ScrapeConfig {
            auto_update: true,
            update_interval_minutes: Some(minutes),
            ..config
        };
        self.inner
            .progress
            .update(None, "automatic update starting");
        if let Err(err) = self.start_locked(&mut state, config) {
            warn!(error = %err, "automatic update did not start");
        }
    }
}
