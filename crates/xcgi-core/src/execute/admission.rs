//! Admission control for script processes.
//!
//! A counter of running executions against a ceiling. Once the ceiling is
//! reached, callers queue in arrival order; each finished execution hands
//! its slot straight to the oldest caller still waiting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

#[derive(Debug)]
struct State {
    in_flight: usize,
    queue: VecDeque<oneshot::Sender<AdmissionPermit>>,
}

#[derive(Debug)]
struct Inner {
    ceiling: usize,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared admission controller.
#[derive(Debug, Clone)]
pub struct Admission {
    inner: Arc<Inner>,
}

/// A running slot. Dropping it releases the slot to the queue.
#[derive(Debug)]
pub struct AdmissionPermit {
    inner: Option<Arc<Inner>>,
}

impl Admission {
    /// Create a controller allowing `ceiling` concurrent executions (at least one).
    pub fn new(ceiling: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                ceiling: ceiling.max(1),
                state: Mutex::new(State {
                    in_flight: 0,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// Wait for a slot.
    ///
    /// If the future is dropped while queued, its place is skipped.
    pub async fn acquire(&self) -> AdmissionPermit {
        let rx = {
            let mut state = self.inner.lock();
            if state.in_flight < self.inner.ceiling {
                state.in_flight += 1;
                return AdmissionPermit {
                    inner: Some(self.inner.clone()),
                };
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            tracing::debug!(
                in_flight = state.in_flight,
                queued = state.queue.len(),
                "execution deferred"
            );
            rx
        };

        match rx.await {
            Ok(permit) => permit,
            // The sender lives in our own queue and is only dropped after a
            // send; an error here means the controller itself is gone.
            Err(_) => AdmissionPermit { inner: None },
        }
    }

    /// Maximum concurrent executions.
    pub fn ceiling(&self) -> usize {
        self.inner.ceiling
    }

    /// Executions currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Callers waiting for a slot, including ones that have since gone away.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        loop {
            let next = {
                let mut state = inner.lock();
                match state.queue.pop_front() {
                    Some(tx) => tx,
                    None => {
                        state.in_flight -= 1;
                        return;
                    }
                }
            };
            let permit = AdmissionPermit {
                inner: Some(inner.clone()),
            };
            match next.send(permit) {
                Ok(()) => return,
                // Waiter was cancelled; defuse the permit and try the next one.
                Err(mut permit) => {
                    permit.inner = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_admits_up_to_ceiling() {
        let admission = Admission::new(2);
        let a = admission.acquire().await;
        let _b = admission.acquire().await;
        assert_eq!(admission.in_flight(), 2);

        let waiting = tokio::spawn({
            let admission = admission.clone();
            async move { admission.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(admission.queued(), 1);
        assert!(!waiting.is_finished());

        drop(a);
        let _c = waiting.await.unwrap();
        assert_eq!(admission.in_flight(), 2);
        assert_eq!(admission.queued(), 0);
    }

    #[tokio::test]
    async fn test_queue_releases_in_fifo_order() {
        let admission = Admission::new(1);
        let first = admission.acquire().await;
        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..5 {
            let admission = admission.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let _permit = admission.acquire().await;
                let _ = order_tx.send(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
            });
            // Let each task enqueue before the next one starts.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(admission.queued(), 5);

        drop(first);
        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(order_rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let admission = Admission::new(1);
        let first = admission.acquire().await;

        let cancelled = tokio::spawn({
            let admission = admission.clone();
            async move { admission.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let kept = tokio::spawn({
            let admission = admission.clone();
            async move { admission.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(admission.queued(), 2);

        cancelled.abort();
        let _ = cancelled.await;
        drop(first);

        let permit = kept.await.unwrap();
        assert_eq!(admission.in_flight(), 1);
        drop(permit);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_ceiling() {
        let admission = Admission::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let admission = admission.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = admission.acquire().await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(admission.in_flight(), 0);
        assert_eq!(admission.queued(), 0);
    }
}
