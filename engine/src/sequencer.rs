//! Async operation sequencer.
//!
//! Each store owns one [`Sequencer`]. Work handed to [`Sequencer::enqueue`]
//! is chained behind everything enqueued before it, at call time, and runs
//! only after its predecessor has settled. A failing or panicking job only
//! fails its own [`Pending`] handle; the chain continues.
//!
//! Enqueueing spawns onto the current tokio runtime, so it must be called
//! from within one.

use crate::{error::Result, Error};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type Tail = Shared<BoxFuture<'static, ()>>;
type IdleHook = Arc<dyn Fn() + Send + Sync>;

struct SequencerInner {
    tail: Mutex<Tail>,
    pending: AtomicUsize,
    on_idle: Mutex<Option<IdleHook>>,
}

/// Serializes async work into a single ordered chain.
#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<SequencerInner>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SequencerInner {
                tail: Mutex::new(futures::future::ready(()).boxed().shared()),
                pending: AtomicUsize::new(0),
                on_idle: Mutex::new(None),
            }),
        }
    }

    /// Called each time the pending count returns to zero.
    pub fn set_idle_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_idle.lock() = Some(Arc::new(hook));
    }

    /// Number of enqueued jobs that have not settled.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Append `work` to the chain. It starts once every previously enqueued
    /// job has settled.
    pub fn enqueue<F, Fut, T>(&self, work: F) -> Pending<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let next: Tail = async move {
            let _ = done_rx.await;
        }
        .boxed()
        .shared();

        let previous = std::mem::replace(&mut *self.inner.tail.lock(), next);
        let depth = self.inner.pending.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(depth, "sequencer: job enqueued");

        let guard = Settle {
            inner: Arc::clone(&self.inner),
            done: Some(done_tx),
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            previous.await;
            work().await
        });
        Pending { handle }
    }

    /// Resolves once every job enqueued so far has settled. Already resolved
    /// when nothing is pending.
    pub fn when_ready(&self) -> impl Future<Output = ()> + Send + 'static {
        let tail = (!self.is_idle()).then(|| self.inner.tail.lock().clone());
        async move {
            if let Some(tail) = tail {
                tail.await;
            }
        }
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Signals job completion on drop, including when the job panics.
struct Settle {
    inner: Arc<SequencerInner>,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for Settle {
    fn drop(&mut self) {
        let remaining = self.inner.pending.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::trace!(remaining, "sequencer: job settled");
        if remaining == 0 {
            let hook = self.inner.on_idle.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
        // successors and `when_ready` waiters observe the hook as done
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// Result of an enqueued job.
///
/// Resolves to [`Error::Cancelled`] if the job panicked or its runtime shut
/// down before it ran.
#[derive(Debug)]
pub struct Pending<T> {
    handle: JoinHandle<T>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_enqueue_order() {
        let seq = Sequencer::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (i, delay) in [(0u32, 30u64), (1, 5), (2, 15)] {
            let log = Arc::clone(&log);
            handles.push(seq.enqueue(move || async move {
                log.lock().push(format!("start {}", i));
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().push(format!("end {}", i));
                i
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert_eq!(results, vec![0, 1, 2]);
        assert_eq!(
            *log.lock(),
            vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
    }

    #[tokio::test]
    async fn failure_does_not_poison_chain() {
        let seq = Sequencer::new();
        let failed = seq.enqueue(|| async { Err::<u8, _>(Error::Aborted) });
        let next = seq.enqueue(|| async { Ok::<_, Error>(7u8) });

        assert!(matches!(failed.await.unwrap(), Err(Error::Aborted)));
        assert_eq!(next.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn panic_maps_to_cancelled() {
        let seq = Sequencer::new();
        let boom = seq.enqueue(|| async {
            if true {
                panic!("job failed");
            }
        });
        let after = seq.enqueue(|| async { "still runs" });

        assert!(matches!(boom.await, Err(Error::Cancelled)));
        assert_eq!(after.await.unwrap(), "still runs");
        assert!(seq.is_idle());
    }

    #[tokio::test]
    async fn when_ready_waits_for_all_pending() {
        let seq = Sequencer::new();
        seq.when_ready().await;

        let flag = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let flag = Arc::clone(&flag);
            let _ = seq.enqueue(move || async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(seq.pending(), 3);

        seq.when_ready().await;
        assert_eq!(flag.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn idle_hook_fires_when_drained() {
        let seq = Sequencer::new();
        let idle = Arc::new(AtomicUsize::new(0));
        let i = Arc::clone(&idle);
        seq.set_idle_hook(move || {
            i.fetch_add(1, Ordering::SeqCst);
        });

        let a = seq.enqueue(|| async { tokio::time::sleep(Duration::from_millis(5)).await });
        let b = seq.enqueue(|| async {});
        a.await.unwrap();
        b.await.unwrap();
        seq.when_ready().await;

        assert_eq!(idle.load(Ordering::SeqCst), 1);
        assert_eq!(seq.pending(), 0);
    }
}
