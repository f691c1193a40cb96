use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Collapses bursts of triggers into a single run of an action.
///
/// The action runs once `delay` has passed without a new trigger. Triggers
/// arriving while the action runs schedule exactly one more run.
#[derive(Debug, Clone)]
pub struct Debouncer {
    notify: Arc<Notify>,
    delay: Duration,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Debouncer {
            notify: Arc::new(Notify::new()),
            delay,
        }
    }

    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Runs `action` after each burst of triggers. Never returns.
    pub async fn run<F, Fut>(&self, mut action: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            self.notify.notified().await;

            loop {
                tokio::select! {
                    _ = self.notify.notified() => continue,
                    _ = tokio::time::sleep(self.delay) => break,
                }
            }

            action().await;
        }
    }
}
