use crate::pairing::PairingService;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub interval: Duration,
    /// Delay before the bootstrap sweep after start.
    pub initial_delay: Duration,
    pub pairing_ttl: chrono::Duration,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            initial_delay: Duration::from_secs(60),
            pairing_ttl: chrono::Duration::minutes(60),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically deletes pending devices whose pairing window has passed.
///
/// Sweeps run one at a time on a single task, so they can never overlap.
pub struct CleanupScheduler {
    pairing: Arc<PairingService>,
    settings: CleanupSettings,
    running: Mutex<Option<Running>>,
}

impl CleanupScheduler {
    pub fn new(pairing: Arc<PairingService>, settings: CleanupSettings) -> Self {
        Self {
            pairing,
            settings,
            running: Mutex::new(None),
        }
    }

    /// Starts the timer. Calling it while already running does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            warn!("Cleanup scheduler already running");
            return;
        }

        info!(
            "Starting cleanup scheduler (every {:?}, pairing TTL {} minutes)",
            self.settings.interval,
            self.settings.pairing_ttl.num_minutes()
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweeps(
            self.pairing.clone(),
            self.settings.clone(),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, handle });
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Cancels the timer and waits for a sweep in progress to finish.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!("Cleanup task failed: {}", e);
            }
            info!("Cleanup scheduler stopped");
        }
    }
}

async fn run_sweeps(
    pairing: Arc<PairingService>,
    settings: CleanupSettings,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + settings.initial_delay, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Not raced against cancellation: a sweep always runs to completion.
        sweep(&pairing, settings.pairing_ttl).await;
    }

    debug!("Cleanup loop exited");
}

async fn sweep(pairing: &PairingService, ttl: chrono::Duration) {
    match pairing.expire_stale_pending(ttl).await {
        Ok(0) => debug!("Cleanup sweep found no expired devices"),
        Ok(removed) => info!(
            "Cleaned up {} expired device(s) (pending for {}+ minutes)",
            removed,
            ttl.num_minutes()
        ),
        Err(e) => error!("Error during cleanup sweep: {}", e),
    }
}
