// Cooperative stop/pause handles shared by every worker

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const POLL_TICK: Duration = Duration::from_millis(50);
const PAUSE_TICK: Duration = Duration::from_millis(200);

/// Shared run controls. Stop is a cancellation token; pause is a polled
/// flag. Both are cooperative: in-flight network calls complete or time
/// out naturally, and both are observed before each retry attempt and
/// inside every backoff sleep.
#[derive(Clone, Default)]
pub struct RunControls {
    stop: CancellationToken,
    paused: Arc<AtomicBool>,
}

impl RunControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Interruptible sleep. Returns early when stop is requested; while
    /// paused the deadline is pushed out so pause never consumes retry
    /// budget.
    pub async fn nap(&self, dur: Duration) {
        let mut deadline = Instant::now() + dur;
        loop {
            if self.is_stopped() {
                return;
            }
            if self.is_paused() {
                sleep(PAUSE_TICK).await;
                deadline += PAUSE_TICK;
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            sleep((deadline - now).min(POLL_TICK)).await;
        }
    }

    /// Block while paused, still honoring stop.
    pub async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_stopped() {
            sleep(PAUSE_TICK).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nap_runs_to_completion() {
        let c = RunControls::new();
        let t0 = Instant::now();
        c.nap(Duration::from_millis(120)).await;
        assert!(t0.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_nap_interrupted_by_stop() {
        let c = RunControls::new();
        let c2 = c.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(60)).await;
            c2.request_stop();
        });
        let t0 = Instant::now();
        c.nap(Duration::from_secs(10)).await;
        assert!(t0.elapsed() < Duration::from_secs(2));
        assert!(c.is_stopped());
    }

    #[tokio::test]
    async fn test_pause_extends_deadline() {
        let c = RunControls::new();
        c.set_paused(true);
        let c2 = c.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            c2.set_paused(false);
        });
        let t0 = Instant::now();
        c.nap(Duration::from_millis(50)).await;
        // 50ms of nap budget must only elapse after the pause is lifted.
        assert!(t0.elapsed() >= Duration::from_millis(250));
    }
}
