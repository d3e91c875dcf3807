use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;

/// An advisory stop flag that can be waited on. Raising it is idempotent and never blocks; tasks
///  that observe it are expected to wind down cooperatively.
#[derive(Clone, Debug)]
pub struct StopSignal {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal {
            flag: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn stop(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.flag.borrow()
    }

    pub async fn stopped(&self) {
        let mut receiver = self.flag.subscribe();
        // the sender lives in self, so the channel can not be closed while we wait
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }

    /// Waits until either the signal is raised or the timeout elapses. Returns `true` if the
    ///  signal was raised, `false` if the timeout elapsed.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        time::timeout(timeout, self.stopped()).await.is_ok()
    }
}

/// Counts things (tasks, connections) that are active, so that an owner can wait until all of
///  them are released. Each [ReleaseGuard] counts once, until it is dropped.
#[derive(Clone, Debug)]
pub struct ReleaseCounter {
    count: Arc<watch::Sender<usize>>,
}

impl Default for ReleaseCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseCounter {
    pub fn new() -> ReleaseCounter {
        ReleaseCounter {
            count: Arc::new(watch::Sender::new(0)),
        }
    }

    #[must_use]
    pub fn acquire(&self) -> ReleaseGuard {
        self.count.send_modify(|count| *count += 1);
        ReleaseGuard {
            counter: self.clone(),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    pub async fn wait_all_released(&self) {
        let mut receiver = self.count.subscribe();
        let _ = receiver.wait_for(|count| *count == 0).await;
    }
}

#[derive(Debug)]
pub struct ReleaseGuard {
    counter: ReleaseCounter,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.counter.count.send_modify(|count| {
            debug_assert!(*count > 0);
            *count -= 1;
        });
    }
}
