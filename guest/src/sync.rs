//! Completion barrier and one-shot signal built on `tokio::sync::watch`.

use tokio::sync::watch;
use tracing::error;

/// Counted completion barrier.
///
/// `wait()` resolves whenever the count is zero. The count may rise again
/// afterwards; later `wait()` calls then block until it drops back.
#[derive(Debug)]
pub struct WaitGroup {
    count: watch::Sender<usize>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::with_count(0)
    }

    pub fn with_count(count: usize) -> Self {
        let (count, _) = watch::channel(count);
        Self { count }
    }

    pub fn add(&self, n: usize) {
        self.count.send_modify(|c| *c += n);
    }

    pub fn done(&self) {
        self.count.send_modify(|c| match c.checked_sub(1) {
            Some(next) => *c = next,
            None => error!("wait group counter decremented below zero"),
        });
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal that transitions once from unset to set and stays set.
#[derive(Debug)]
pub struct OnceSignal<T: Clone> {
    value: watch::Sender<Option<T>>,
}

impl<T: Clone> OnceSignal<T> {
    pub fn new() -> Self {
        let (value, _) = watch::channel(None);
        Self { value }
    }

    /// Set the value. Returns false if it was already set; the first value wins.
    pub fn set(&self, value: T) -> bool {
        self.value.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn get(&self) -> Option<T> {
        self.value.borrow().clone()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.value.subscribe();
        let value = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => None,
        };
        match value {
            Some(value) => value,
            None => std::future::pending().await,
        }
    }
}

impl<T: Clone> Default for OnceSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}
