use crate::retry::RetryPolicy;
use crate::Job;
use anyhow::Error;
use async_channel::Receiver;
use async_trait::async_trait;
use futures::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{sync::mpsc::UnboundedSender, time::sleep};
use tracing::*;
use uuid::Uuid;

/// How a submitted job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { attempts: u32 },
    /// Every attempt failed.
    Failed { attempts: u32, error: String },
    /// An attempt ran past the job timeout and was abandoned.
    TimedOut { attempts: u32 },
    /// Removed from the pending list before it started.
    Cleared,
    /// The queue went away without running the job.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    /// 1-based.
    pub attempt: u32,
    pub retries_left: u32,
    pub error: String,
}

/// Body executed by the queue for every job.
///
/// `run` is expected to settle its own recoverable failures into the video
/// record and return `Ok`; an `Err` (or a panic) means something unexpected
/// happened and the attempt is retried.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: &Job) -> Result<(), Error>;

    /// The job will not be attempted again. Leave its record in a terminal
    /// state.
    async fn abandon(&self, job: &Job, reason: &str);

    fn on_failed_attempt(&self, job: &Job, failed: &FailedAttempt) {
        warn!(
            message = "Video processing attempt failed",
            video_id = %job.video_id,
            attempt = failed.attempt,
            retries_left = failed.retries_left,
            error = %failed.error
        );
    }
}

#[derive(Debug)]
pub(crate) enum WorkMessage {
    JobStarted(Uuid),
    JobFinished(Uuid, JobOutcome),
}

pub(crate) async fn start(
    recv_from_queue: Receiver<Job>,
    send_to_server: UnboundedSender<WorkMessage>,
    runner: Arc<dyn JobRunner>,
    retry: RetryPolicy,
    timeout: Duration,
) {
    // The scheduler closes the channel once it has nothing left to hand out
    while let Ok(job) = recv_from_queue.recv().await {
        let job_id = job.id;
        if send_to_server.send(WorkMessage::JobStarted(job_id)).is_err() {
            error!("Scheduler gone, worker exiting");
            break;
        }
        let outcome = execute(&job, runner.as_ref(), &retry, timeout).await;
        if send_to_server
            .send(WorkMessage::JobFinished(job_id, outcome))
            .is_err()
        {
            error!("Scheduler gone, worker exiting");
            break;
        }
    }
    debug!("Worker stopped.");
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("job panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("job panicked: {s}")
    } else {
        "job panicked".to_string()
    }
}

/// Run the job body until it succeeds, times out or runs out of retries.
#[instrument(skip_all, fields(job_id = %job.id, video_id = %job.video_id))]
pub(crate) async fn execute(
    job: &Job,
    runner: &dyn JobRunner,
    retry: &RetryPolicy,
    timeout: Duration,
) -> JobOutcome {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let body = AssertUnwindSafe(runner.run(job)).catch_unwind();
        let error = match tokio::time::timeout(timeout, body).await {
            Ok(Ok(Ok(()))) => {
                debug!(message = "Job completed", attempt);
                return JobOutcome::Completed { attempts: attempt };
            }
            Ok(Ok(Err(err))) => format!("{err:#}"),
            Ok(Err(panic)) => panic_message(panic),
            Err(_) => {
                error!(message = "Job timed out, abandoning", attempt, timeout = ?timeout);
                runner
                    .abandon(job, &format!("Processing timed out after {}s", timeout.as_secs()))
                    .await;
                return JobOutcome::TimedOut { attempts: attempt };
            }
        };

        let retries_left = retry.retries_left(attempt);
        runner.on_failed_attempt(
            job,
            &FailedAttempt {
                attempt,
                retries_left,
                error: error.clone(),
            },
        );

        if retries_left == 0 {
            error!(message = "Job failed, retries exhausted", attempts = attempt, error = %error);
            runner.abandon(job, &error).await;
            return JobOutcome::Failed {
                attempts: attempt,
                error,
            };
        }

        sleep(retry.delay_for_retry(attempt - 1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts.
    #[derive(Default)]
    struct Flaky {
        failures: u32,
        panic: bool,
        hang: bool,
        calls: AtomicU32,
        attempts_seen: Mutex<Vec<FailedAttempt>>,
        abandoned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobRunner for Flaky {
        async fn run(&self, _job: &Job) -> Result<(), Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang {
                futures::future::pending::<()>().await;
            }
            if call <= self.failures {
                if self.panic {
                    panic!("boom {call}");
                }
                return Err(anyhow!("transient failure {call}"));
            }
            Ok(())
        }

        async fn abandon(&self, _job: &Job, reason: &str) {
            self.abandoned.lock().push(reason.to_string());
        }

        fn on_failed_attempt(&self, _job: &Job, failed: &FailedAttempt) {
            self.attempts_seen.lock().push(failed.clone());
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(30 * 60);

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let runner = Flaky {
            failures: 2,
            ..Default::default()
        };
        let job = Job::new("v1", "u1", "t1");
        let started = tokio::time::Instant::now();

        let outcome = execute(&job, &runner, &RetryPolicy::default(), TIMEOUT).await;

        assert_eq!(outcome, JobOutcome::Completed { attempts: 3 });
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        let seen = runner.attempts_seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!((seen[0].attempt, seen[0].retries_left), (1, 2));
        assert_eq!((seen[1].attempt, seen[1].retries_left), (2, 1));
        assert!(runner.abandoned.lock().is_empty());
        // 1s + 2s of backoff
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_abandon_the_job() {
        let runner = Flaky {
            failures: 10,
            ..Default::default()
        };
        let job = Job::new("v1", "u1", "t1");

        let outcome = execute(&job, &runner, &RetryPolicy::default(), TIMEOUT).await;

        assert_eq!(
            outcome,
            JobOutcome::Failed {
                attempts: 3,
                error: "transient failure 3".into()
            }
        );
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*runner.abandoned.lock(), vec!["transient failure 3".to_string()]);
        assert_eq!(runner.attempts_seen.lock().last().unwrap().retries_left, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panics_count_as_failed_attempts() {
        let runner = Flaky {
            failures: 1,
            panic: true,
            ..Default::default()
        };
        let job = Job::new("v1", "u1", "t1");

        let outcome = execute(&job, &runner, &RetryPolicy::default(), TIMEOUT).await;

        assert_eq!(outcome, JobOutcome::Completed { attempts: 2 });
        assert!(runner.attempts_seen.lock()[0].error.contains("boom 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_abandons_without_retry() {
        let runner = Flaky {
            hang: true,
            ..Default::default()
        };
        let job = Job::new("v1", "u1", "t1");

        let outcome = execute(&job, &runner, &RetryPolicy::default(), TIMEOUT).await;

        assert_eq!(outcome, JobOutcome::TimedOut { attempts: 1 });
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.abandoned.lock().len(), 1);
        assert!(runner.abandoned.lock()[0].contains("timed out"));
    }
}
