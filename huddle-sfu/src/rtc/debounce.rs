use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct DebounceState {
    generation: u64,
    timer: Option<CancellationToken>,
}

/// Single-flight delayed trigger.
///
/// Every `schedule` call within the quiet period cancels the previous timer
/// and re-arms it, so a burst of requests runs the action once. An action
/// that has already started is never interrupted by a later request.
pub(crate) struct Debouncer {
    interval: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    pub(crate) fn schedule<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let generation = {
            let mut state = self.state.lock();
            if let Some(previous) = state.timer.replace(token.clone()) {
                previous.cancel();
            }
            state.generation += 1;
            state.generation
        };

        let state = Arc::clone(&self.state);
        let interval = self.interval;
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            {
                let mut state = state.lock();
                if state.generation != generation {
                    return;
                }
                state.timer = None;
            }
            action().await;
        });
    }

    /// Drop any armed timer
    pub(crate) fn cancel(&self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.cancel();
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.lock().timer.is_some()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> + Send {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_run() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            debouncer.schedule(counting(&runs));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(debouncer.is_pending());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_requests_each_run() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule(counting(&runs));
        tokio::time::sleep(Duration::from_millis(80)).await;
        debouncer.schedule(counting(&runs));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule(counting(&runs));
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
