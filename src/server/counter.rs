use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Counts operations that touch shared state or do I/O, so shutdown can wait for them.
#[derive(Clone, Default, Debug)]
pub struct ProcessCounter {
    inner: Arc<CounterInner>,
}

#[derive(Default, Debug)]
struct CounterInner {
    active: AtomicUsize,
    idle: Notify,
}

/// Marks one running operation; dropping it ends the operation.
#[must_use = "the operation ends when the guard is dropped"]
#[derive(Debug)]
pub struct ProcessGuard {
    counter: ProcessCounter,
}

impl ProcessCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) -> ProcessGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ProcessGuard {
            counter: self.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolves once no operation is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking, otherwise a wakeup between the check and the await is lost.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.counter.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counter.inner.idle.notify_waiters();
        }
    }
}
