use tokio_util::sync::CancellationToken;

use crate::TaskError;

/// Cooperative cancellation point. Called before every navigation and settle wait.
pub fn checkpoint(cancel: &CancellationToken) -> Result<(), TaskError> {
    if cancel.is_cancelled() {
        Err(TaskError::UserStopped)
    } else {
        Ok(())
    }
}
