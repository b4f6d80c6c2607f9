//! Pluggable strategies for executing a run's tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use super::execution::{Admission, RunContext, RunJob};

/// Executes the tests of a run and closes it through [`RunContext::finish_run`].
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, job: Arc<RunJob>, context: Arc<RunContext>);

    fn name(&self) -> &'static str;
}

/// One test at a time, in order. Broadcasts are fully ordered within the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

#[async_trait]
impl RunExecutor for SequentialExecutor {
    async fn execute(&self, job: Arc<RunJob>, context: Arc<RunContext>) {
        for (index, test) in job.tests.iter().enumerate() {
            match context.admit(&job, test.result_id).await {
                Admission::Run => {
                    Arc::clone(&context)
                        .run_test(Arc::clone(&job), test.clone())
                        .await;
                }
                Admission::TestCancelled => context.skip_test(&job, test.result_id).await,
                Admission::RunCancelled => {
                    context.skip_remaining(&job, &job.tests[index..]).await;
                    break;
                }
            }
        }
        context.finish_run(&job).await;
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

/// Up to `max_parallel` tests at once. Messages for one test stay in order;
/// messages for different tests may interleave.
#[derive(Debug, Clone, Copy)]
pub struct ParallelExecutor {
    max_parallel: usize,
}

impl ParallelExecutor {
    /// Executor with at least one slot.
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    /// Concurrency limit.
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }
}

#[async_trait]
impl RunExecutor for ParallelExecutor {
    async fn execute(&self, job: Arc<RunJob>, context: Arc<RunContext>) {
        let slots = Arc::new(Semaphore::new(self.max_parallel));
        let mut running = JoinSet::new();

        for (index, test) in job.tests.iter().enumerate() {
            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                error!(run_id = %job.run_id, "executor semaphore closed");
                break;
            };

            // checked after a slot frees up, immediately before the test starts
            match context.admit(&job, test.result_id).await {
                Admission::Run => {
                    debug!(run_id = %job.run_id, result_id = %test.result_id, "starting test");
                    let context = Arc::clone(&context);
                    let job = Arc::clone(&job);
                    let test = test.clone();
                    running.spawn(async move {
                        context.run_test(job, test).await;
                        drop(permit);
                    });
                }
                Admission::TestCancelled => context.skip_test(&job, test.result_id).await,
                Admission::RunCancelled => {
                    context.skip_remaining(&job, &job.tests[index..]).await;
                    break;
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                error!(run_id = %job.run_id, error = %err, "test worker failed");
            }
        }
        context.finish_run(&job).await;
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}
