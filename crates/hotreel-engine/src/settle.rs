use std::time::Duration;

use hotreel_adapters::{ReadyCondition, Session};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Ready,
    /// Timed out or the session errored; the caller carries on regardless.
    Degraded,
}

/// Bounded wait for a page condition. Never fails: a wait that does not resolve degrades.
#[derive(Debug, Clone, Copy)]
pub struct SettlePolicy {
    pub timeout: Duration,
}

impl SettlePolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn settle(&self, session: &mut dyn Session, condition: ReadyCondition) -> Settled {
        let session_id = session.id();
        match tokio::time::timeout(self.timeout, session.wait_for_ready(condition, self.timeout))
            .await
        {
            Ok(Ok(true)) => Settled::Ready,
            Ok(Ok(false)) => {
                warn!(session_id, ?condition, "condition not met, continuing");
                Settled::Degraded
            }
            Ok(Err(err)) => {
                warn!(session_id, ?condition, error = %err, "settle wait failed, continuing");
                Settled::Degraded
            }
            Err(_) => {
                warn!(session_id, ?condition, timeout = ?self.timeout, "settle wait timed out, continuing");
                Settled::Degraded
            }
        }
    }
}
