//! Bounded-concurrency processing queue.
//!
//! A single scheduler task owns the pending list and the set of running
//! jobs. Submitters talk to it over a command channel, a fixed pool of
//! workers pulls dispatched jobs from a bounded channel and reports back
//! when they finish.

use crate::config::QueueConfig;
use crate::worker::{self, JobOutcome, JobRunner, WorkMessage};
use crate::Job;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::*;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub concurrency_limit: usize,
    pub running_count: usize,
    pub pending_count: usize,
    pub paused: bool,
    /// Videos of the running jobs, sorted.
    pub running_videos: Vec<String>,
}

impl QueueStatus {
    pub fn is_idle(&self) -> bool {
        self.running_count == 0 && self.pending_count == 0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Processing queue is shut down")]
    ShutDown,
}

/// Resolves once the submitted job ends, whatever the outcome.
#[derive(Debug)]
pub struct JobHandle {
    job_id: Uuid,
    video_id: String,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub async fn wait(self) -> JobOutcome {
        self.outcome.await.unwrap_or(JobOutcome::Dropped)
    }
}

#[derive(Debug)]
enum Command {
    Submit {
        job: Job,
        priority: i32,
        reply: oneshot::Sender<JobOutcome>,
    },
    Pause,
    Resume,
    Clear(oneshot::Sender<usize>),
    Shutdown,
}

pub struct ProcessingQueue {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<QueueStatus>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessingQueue {
    /// Spawn the scheduler and `config.concurrency_limit` workers.
    pub fn start(config: QueueConfig, runner: Arc<dyn JobRunner>) -> Self {
        let limit = config.concurrency_limit.max(1);
        let (send_to_scheduler, recv_commands) = mpsc::unbounded_channel();
        let (send_to_server, recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
        let (send_to_queue, recv_from_queue) = async_channel::bounded::<Job>(limit);

        let mut workers = vec![];
        for worker_id in 0..limit {
            let recv_from_queue = recv_from_queue.clone();
            let send_to_server = send_to_server.clone();
            let runner = runner.clone();
            let retry = config.retry.clone();
            let timeout = config.job_timeout();
            let join_handle = tokio::spawn(
                async move {
                    worker::start(recv_from_queue, send_to_server, runner, retry, timeout).await;
                }
                .instrument(info_span!("worker", worker_id)),
            );
            workers.push(join_handle);
        }
        drop(send_to_server);

        let initial = QueueStatus {
            concurrency_limit: limit,
            running_count: 0,
            pending_count: 0,
            paused: false,
            running_videos: vec![],
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let scheduler = Scheduler {
            limit,
            pending: VecDeque::new(),
            running: HashMap::new(),
            paused: false,
            draining: false,
            next_seq: 0,
            send_to_queue,
            status: status_tx,
        };

        info!(message = "Processing queue started", concurrency_limit = limit);
        let handle = tokio::spawn(
            scheduler
                .serve(recv_commands, recv_from_worker, workers)
                .instrument(info_span!("scheduler")),
        );

        ProcessingQueue {
            commands: send_to_scheduler,
            status: status_rx,
            scheduler: Mutex::new(Some(handle)),
        }
    }

    /// Accept a job without waiting for it to be scheduled.
    pub fn submit(&self, job: Job) -> Result<JobHandle, QueueError> {
        self.submit_with_priority(job, 0)
    }

    /// Higher priorities are dispatched first, equal priorities in
    /// submission order.
    pub fn submit_with_priority(&self, job: Job, priority: i32) -> Result<JobHandle, QueueError> {
        let (reply, outcome) = oneshot::channel();
        let handle = JobHandle {
            job_id: job.id,
            video_id: job.video_id.clone(),
            outcome,
        };
        self.send(Command::Submit {
            job,
            priority,
            reply,
        })?;
        Ok(handle)
    }

    pub fn status(&self) -> QueueStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<QueueStatus> {
        self.status.clone()
    }

    /// Stop dispatching; running jobs carry on.
    pub fn pause(&self) -> Result<(), QueueError> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), QueueError> {
        self.send(Command::Resume)
    }

    /// Drop every job that has not started yet and return how many.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let (reply, count) = oneshot::channel();
        self.send(Command::Clear(reply))?;
        count.await.map_err(|_| QueueError::ShutDown)
    }

    /// Wait until nothing is pending or running.
    pub async fn idle(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.is_idle()).await;
    }

    /// Stop accepting jobs, run what is pending and wait for the workers.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(message = "Scheduler task failed", error = ?err);
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), QueueError> {
        self.commands.send(command).map_err(|_| QueueError::ShutDown)
    }
}

struct PendingJob {
    job: Job,
    priority: i32,
    seq: u64,
    waiters: Vec<oneshot::Sender<JobOutcome>>,
}

struct RunningJob {
    video_id: String,
    waiters: Vec<oneshot::Sender<JobOutcome>>,
}

struct Scheduler {
    limit: usize,
    pending: VecDeque<PendingJob>,
    running: HashMap<Uuid, RunningJob>,
    paused: bool,
    draining: bool,
    next_seq: u64,
    send_to_queue: async_channel::Sender<Job>,
    status: watch::Sender<QueueStatus>,
}

impl Scheduler {
    async fn serve(
        mut self,
        mut recv_commands: mpsc::UnboundedReceiver<Command>,
        mut recv_from_worker: mpsc::UnboundedReceiver<WorkMessage>,
        workers: Vec<JoinHandle<()>>,
    ) {
        let mut commands_open = true;

        loop {
            self.dispatch().await;
            self.publish_status();

            if self.draining && self.pending.is_empty() && self.running.is_empty() {
                break;
            }

            // Nothing to dispatch until a command or a worker report arrives
            tokio::select! {
                command = recv_commands.recv(), if commands_open => {
                    match command {
                        Some(command) => self.handle(command),
                        None => {
                            debug!("All queue handles dropped, draining");
                            commands_open = false;
                            self.draining = true;
                        }
                    }
                },
                message = recv_from_worker.recv() => {
                    match message {
                        Some(WorkMessage::JobStarted(job_id)) => {
                            debug!(message = "Starting job", job_id = ?job_id);
                        },
                        Some(WorkMessage::JobFinished(job_id, outcome)) => self.finish(job_id, outcome),
                        None => {
                            error!("Worker channel closed unexpectedly, exiting");
                            break;
                        }
                    }
                },
            }
        }

        self.send_to_queue.close();
        for job in self.pending.drain(..) {
            for waiter in job.waiters {
                let _ = waiter.send(JobOutcome::Dropped);
            }
        }

        // Wait for all workers to complete
        for result in futures::future::join_all(workers).await {
            if let Err(err) = result {
                error!(message = "Worker task failed", error = ?err);
            }
        }

        info!("Processing queue stopped.");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit {
                job,
                priority,
                reply,
            } => self.admit(job, priority, reply),
            Command::Pause => {
                info!("Processing queue paused");
                self.paused = true;
            }
            Command::Resume => {
                info!("Processing queue resumed");
                self.paused = false;
            }
            Command::Clear(reply) => {
                let count = self.pending.len();
                for job in self.pending.drain(..) {
                    for waiter in job.waiters {
                        let _ = waiter.send(JobOutcome::Cleared);
                    }
                }
                info!(message = "Processing queue cleared", dropped = count);
                let _ = reply.send(count);
            }
            Command::Shutdown => {
                info!("Processing queue shutting down, draining pending jobs");
                self.draining = true;
            }
        }
    }

    fn admit(&mut self, job: Job, priority: i32, reply: oneshot::Sender<JobOutcome>) {
        if self.draining {
            let _ = reply.send(JobOutcome::Dropped);
            return;
        }

        // A video already waiting is analyzed once for every submitter
        if let Some(existing) = self
            .pending
            .iter_mut()
            .find(|p| p.job.video_id == job.video_id)
        {
            debug!(message = "Video already pending, coalescing", video_id = %job.video_id);
            existing.priority = existing.priority.max(priority);
            existing.waiters.push(reply);
            return;
        }

        debug!(message = "Requested job", job_id = ?job.id, video_id = %job.video_id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(PendingJob {
            job,
            priority,
            seq,
            waiters: vec![reply],
        });
    }

    /// Highest priority first, oldest first among equals. Videos with a
    /// running job wait for it to finish.
    fn next_eligible(&self) -> Option<usize> {
        let busy: HashSet<&str> = self.running.values().map(|r| r.video_id.as_str()).collect();
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, p)| !busy.contains(p.job.video_id.as_str()))
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|(i, _)| i)
    }

    async fn dispatch(&mut self) {
        if self.paused && !self.draining {
            return;
        }
        while self.running.len() < self.limit {
            let Some(index) = self.next_eligible() else {
                break;
            };
            let Some(pending) = self.pending.remove(index) else {
                break;
            };
            let job_id = pending.job.id;
            self.running.insert(
                job_id,
                RunningJob {
                    video_id: pending.job.video_id.clone(),
                    waiters: pending.waiters,
                },
            );
            // Never more jobs in flight than workers, so this does not wait
            if let Err(err) = self.send_to_queue.send(pending.job).await {
                error!(message = "Worker pool closed", error = ?err);
                if let Some(running) = self.running.remove(&job_id) {
                    for waiter in running.waiters {
                        let _ = waiter.send(JobOutcome::Dropped);
                    }
                }
                break;
            }
            info!(
                message = "Job dispatched",
                running = self.running.len(),
                pending = self.pending.len()
            );
        }
    }

    fn finish(&mut self, job_id: Uuid, outcome: JobOutcome) {
        let Some(running) = self.running.remove(&job_id) else {
            warn!(message = "Finished job was not running", job_id = ?job_id);
            return;
        };
        match &outcome {
            JobOutcome::Completed { attempts } => {
                debug!(message = "Completed job", job_id = ?job_id, video_id = %running.video_id, attempts);
            }
            other => {
                warn!(message = "Job did not complete", job_id = ?job_id, video_id = %running.video_id, outcome = ?other);
            }
        }
        for waiter in running.waiters {
            let _ = waiter.send(outcome.clone());
        }
        if self.running.is_empty() && self.pending.is_empty() {
            info!("Processing queue is empty");
        }
    }

    fn publish_status(&self) {
        let mut running_videos: Vec<String> =
            self.running.values().map(|r| r.video_id.clone()).collect();
        running_videos.sort();
        let status = QueueStatus {
            concurrency_limit: self.limit,
            running_count: self.running.len(),
            pending_count: self.pending.len(),
            paused: self.paused,
            running_videos,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
