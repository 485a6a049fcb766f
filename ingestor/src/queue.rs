//! Ingestion queue and the worker pool that drains it.
//!
//! The boundary validates a reading and checks that its device exists before
//! anything is queued. Workers then persist, spike-check and fan out each job
//! with at-least-once semantics: transient storage failures are retried with
//! exponential backoff and a job that runs out of attempts is dropped and
//! announced on the exhausted channel.

use crate::errors::{Error, Result};
use crate::metrics::{
    JOBS_EXHAUSTED_TOTAL, JOBS_PROCESSED_TOTAL, JOBS_RETRIED_TOTAL, PROCESS_LATENCY_SECONDS,
    QUEUE_DEPTH, QUEUE_FULL_TOTAL, READINGS_RECEIVED_TOTAL, READINGS_REJECTED_TOTAL,
    SPIKES_TOTAL,
};
use crate::model::{DeviceId, RawReading};
use crate::notify::Notifier;
use crate::store::{DeviceRegistry, ReadingStore};
use crate::validate::{normalize_reading, validate_reading};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Queue a job was accepted on; named in worker logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Readings,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Readings => "readings_queue",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub queue: QueueName,
    pub device_id: DeviceId,
    pub payload: RawReading,
    /// Stamped on readings that arrive without their own timestamp, so a
    /// retried job stores the same time as its first attempt.
    pub received_at: DateTime<Utc>,
}

/// A job dropped after its last attempt failed.
#[derive(Debug, Clone)]
pub struct ExhaustedJob {
    pub job: Job,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Stored { spike: bool },
    /// The device was deleted after the job was accepted.
    DeviceGone,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: usize,
    pub workers: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            workers: 4,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Collaborators every job needs.
#[derive(Clone)]
pub struct IngestContext {
    pub devices: Arc<dyn DeviceRegistry>,
    pub readings: Arc<dyn ReadingStore>,
    pub notifier: Arc<dyn Notifier>,
}

/// Producer side of the readings queue, shared by every intake transport.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<Job>,
    devices: Arc<dyn DeviceRegistry>,
    next_id: Arc<AtomicU64>,
}

impl IngestQueue {
    /// Accepts a reading for asynchronous processing and returns its job id.
    ///
    /// Rejects with `Error::Validation` for missing fields and with
    /// `Error::NotFound` when the device does not exist; nothing is queued
    /// in either case.
    pub async fn enqueue(&self, payload: RawReading) -> Result<u64> {
        READINGS_RECEIVED_TOTAL.inc();

        let device_id = validate_reading(&payload).inspect_err(|_| READINGS_REJECTED_TOTAL.inc())?;

        if self.devices.find_by_id(device_id).await?.is_none() {
            READINGS_REJECTED_TOTAL.inc();
            warn!("Rejected reading for unknown device {}", device_id);
            return Err(Error::NotFound(format!("device {}", device_id)));
        }

        let job = Job {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            queue: QueueName::Readings,
            device_id,
            payload,
            received_at: Utc::now(),
        };
        let job_id = job.id;

        QUEUE_DEPTH.inc();
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                QUEUE_FULL_TOTAL.inc();
                debug!("Queue {} full, waiting for capacity", QueueName::Readings);
                if self.tx.send(job).await.is_err() {
                    QUEUE_DEPTH.dec();
                    return Err(Error::QueueClosed);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                QUEUE_DEPTH.dec();
                error!("Queue {} closed, cannot accept reading", QueueName::Readings);
                return Err(Error::QueueClosed);
            }
        }

        debug!("Queued job {} for device {}", job_id, device_id);
        Ok(job_id)
    }
}

/// Handles to the running workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    exhausted: broadcast::Sender<ExhaustedJob>,
}

impl WorkerPool {
    /// Creates the readings queue and spawns `settings.workers` workers on it.
    pub fn start(ctx: IngestContext, settings: QueueSettings) -> (IngestQueue, WorkerPool) {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let (exhausted, _) = broadcast::channel(64);

        let queue = IngestQueue {
            tx,
            devices: ctx.devices.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
        };

        let rx = Arc::new(Mutex::new(rx));
        let ctx = Arc::new(ctx);
        let settings = Arc::new(settings);
        let worker_count = settings.workers.max(1);

        info!(
            "Starting {} workers on {} (capacity={}, max_attempts={})",
            worker_count,
            QueueName::Readings,
            settings.capacity,
            settings.max_attempts
        );

        let handles = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    rx.clone(),
                    ctx.clone(),
                    settings.clone(),
                    exhausted.clone(),
                ))
            })
            .collect();

        (queue, WorkerPool { handles, exhausted })
    }

    /// Receives every job dropped after exhausting its retries.
    pub fn subscribe_exhausted(&self) -> broadcast::Receiver<ExhaustedJob> {
        self.exhausted.subscribe()
    }

    /// Waits for the workers to drain the queue.
    ///
    /// Workers stop once every `IngestQueue` clone has been dropped.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    ctx: Arc<IngestContext>,
    settings: Arc<QueueSettings>,
    exhausted: broadcast::Sender<ExhaustedJob>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };
        QUEUE_DEPTH.dec();
        run_with_retry(&ctx, job, &settings, &exhausted).await;
    }

    debug!("Worker {} stopped", worker_id);
}

async fn run_with_retry(
    ctx: &IngestContext,
    job: Job,
    settings: &QueueSettings,
    exhausted: &broadcast::Sender<ExhaustedJob>,
) {
    let start = Instant::now();
    let mut attempt = 0;
    let mut backoff = settings.initial_backoff;

    loop {
        attempt += 1;

        match process_job(ctx, &job).await {
            Ok(outcome) => {
                PROCESS_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                JOBS_PROCESSED_TOTAL.inc();
                if attempt > 1 {
                    info!(
                        "Job {} on {} processed after {} attempts: {:?}",
                        job.id, job.queue, attempt, outcome
                    );
                } else {
                    debug!("Job {} on {} processed: {:?}", job.id, job.queue, outcome);
                }
                return;
            }
            Err(e) if !e.is_transient() => {
                warn!(
                    "Dropping job {} on {} (device {}): {}",
                    job.id, job.queue, job.device_id, e
                );
                return;
            }
            Err(e) if attempt >= settings.max_attempts => {
                error!(
                    "Job {} on {} for device {} failed after {} attempts: {}",
                    job.id, job.queue, job.device_id, attempt, e
                );
                JOBS_EXHAUSTED_TOTAL.inc();
                // No receivers is fine; the counter and log above still record it.
                let _ = exhausted.send(ExhaustedJob {
                    job,
                    attempts: attempt,
                    error: e.to_string(),
                });
                return;
            }
            Err(e) => {
                JOBS_RETRIED_TOTAL.inc();
                warn!(
                    "Job {} on {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    job.id, job.queue, attempt, settings.max_attempts, e, backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Persists one reading, checks it against the device threshold and pushes
/// the real-time events.
pub async fn process_job(ctx: &IngestContext, job: &Job) -> Result<JobOutcome> {
    let Some(device) = ctx.devices.find_by_id(job.device_id).await? else {
        debug!("Device {} vanished before job {} ran", job.device_id, job.id);
        return Ok(JobOutcome::DeviceGone);
    };

    let reading = normalize_reading(device.id, &job.payload, job.received_at);

    match ctx.readings.insert(&reading).await {
        Ok(()) => {}
        Err(Error::NotFound(_)) => return Ok(JobOutcome::DeviceGone),
        Err(e) => return Err(e),
    }

    let spike = reading.is_spike(device.max_watts_threshold);
    if spike {
        SPIKES_TOTAL.inc();
        info!(
            "Spike on device {}: {}W over threshold {}W",
            device.id, reading.power_watts, device.max_watts_threshold
        );
        ctx.notifier.notify_spike(device.id, reading.power_watts).await;
    }

    ctx.notifier.broadcast_reading(device.id, &reading).await;

    Ok(JobOutcome::Stored { spike })
}
