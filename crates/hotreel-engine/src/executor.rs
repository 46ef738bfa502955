//! Bounded fan-out over fallible, cancellable fetch callables.
//!
//! Outcomes come back in completion order. A callable that errors or panics only
//! affects its own outcome; once the cancellation token fires, no further callable
//! is started and the remaining inputs come back as [`TaskOutcome::Skipped`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("stopped by user")]
    UserStopped,
    #[error("{0}")]
    ItemFetch(String),
    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug)]
pub enum TaskOutcome<I, T> {
    Completed { input: I, output: T },
    Failed { input: I, error: TaskError },
    /// Cancellation was observed before the callable started.
    Skipped { input: I },
}

#[derive(Debug, Clone, Copy)]
pub struct TaskExecutor {
    max_concurrency: usize,
}

impl TaskExecutor {
    pub fn new(max_concurrency: usize) -> Self {
        Self { max_concurrency }
    }

    /// Effective bound for `inputs` items: `min(max, inputs)`, never below 1.
    pub fn bound_for(&self, inputs: usize) -> usize {
        self.max_concurrency.min(inputs).max(1)
    }

    pub fn spawn_all<I, T, F, Fut>(
        &self,
        inputs: Vec<I>,
        cancel: CancellationToken,
        fetch: F,
    ) -> TaskBatch<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.bound_for(inputs.len())));
        let fetch = Arc::new(fetch);
        let mut set = JoinSet::new();

        for input in inputs {
            let permits = Arc::clone(&permits);
            let fetch = Arc::clone(&fetch);
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return TaskOutcome::Skipped { input },
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return TaskOutcome::Skipped { input },
                    },
                };
                if cancel.is_cancelled() {
                    return TaskOutcome::Skipped { input };
                }

                let call = {
                    let input = input.clone();
                    let cancel = cancel.clone();
                    async move { (fetch.as_ref())(input, cancel).await }
                };
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(Ok(output)) => TaskOutcome::Completed { input, output },
                    Ok(Err(error)) => TaskOutcome::Failed { input, error },
                    Err(payload) => TaskOutcome::Failed {
                        input,
                        error: TaskError::Panicked(panic_message(payload.as_ref())),
                    },
                }
            });
        }

        TaskBatch { set }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Outcomes of one [`TaskExecutor::spawn_all`] call. Dropping it aborts unfinished tasks.
pub struct TaskBatch<I, T> {
    set: JoinSet<TaskOutcome<I, T>>,
}

impl<I: Send + 'static, T: Send + 'static> TaskBatch<I, T> {
    /// Next outcome in completion order, `None` once every task has reported.
    pub async fn next(&mut self) -> Option<TaskOutcome<I, T>> {
        loop {
            match self.set.join_next().await? {
                Ok(outcome) => return Some(outcome),
                Err(err) => warn!(error = %err, "executor task did not report an outcome"),
            }
        }
    }

    pub async fn collect(mut self) -> Vec<TaskOutcome<I, T>> {
        let mut outcomes = Vec::with_capacity(self.set.len());
        while let Some(outcome) = self.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn pending(&self) -> usize {
        self.set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn completed<I, T>(outcomes: &[TaskOutcome<I, T>]) -> usize {
        outcomes
            .iter()
            .filter(|o| matches!(o, TaskOutcome::Completed { .. }))
            .count()
    }

    #[test]
    fn bound_is_clamped_by_input_count() {
        let executor = TaskExecutor::new(10);
        assert_eq!(executor.bound_for(3), 3);
        assert_eq!(executor.bound_for(25), 10);
        assert_eq!(executor.bound_for(0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_the_bound() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let executor = TaskExecutor::new(3);

        let batch = executor.spawn_all((0..12).collect(), CancellationToken::new(), {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            move |n: u32, _cancel| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(n % 4 + 1))).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(n * 2)
                }
            }
        });

        let outcomes = batch.collect().await;
        assert_eq!(completed(&outcomes), 12);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_and_panics_stay_with_their_input() {
        let executor = TaskExecutor::new(4);
        let batch = executor.spawn_all(vec![1u32, 2, 3, 4], CancellationToken::new(), |n, _cancel| async move {
            match n {
                2 => Err(TaskError::ItemFetch("detail not found".into())),
                3 => panic!("boom on {n}"),
                _ => Ok(n),
            }
        });

        let outcomes = batch.collect().await;
        assert_eq!(completed(&outcomes), 2);
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Failed { input: 2, error } => {
                    assert_eq!(error, TaskError::ItemFetch("detail not found".into()))
                }
                TaskOutcome::Failed { input: 3, error } => {
                    assert_eq!(error, TaskError::Panicked("boom on 3".into()))
                }
                TaskOutcome::Completed { input, output } => assert_eq!(input, output),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn cancelled_batches_skip_everything_not_yet_started() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Arc::new(AtomicUsize::new(0));
        let batch = TaskExecutor::new(2).spawn_all(vec!["a", "b", "c"], cancel, {
            let started = Arc::clone(&started);
            move |s: &'static str, _cancel| {
                started.fetch_add(1, Ordering::SeqCst);
                async move { Ok(s.len()) }
            }
        });

        let outcomes = batch.collect().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| matches!(o, TaskOutcome::Skipped { .. })));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }
}
