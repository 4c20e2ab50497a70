//! Notify/wait bus for long-polling clients.
//!
//! A GET carrying a wait token parks until the collection it reads is
//! mutated, unless a mutation already happened since the token's last
//! refresh. Mutating requests notify their collection scope on success.
//!
//! Times are logical ticks from a per-bus counter; tick 0 means "never".

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

/// Wait tokens are compared on this many leading characters only.
pub const WAIT_ID_MAX_LEN: usize = 22;

/// Truncate a client wait token to its significant prefix.
pub fn wait_id(token: &str) -> &str {
    match token.char_indices().nth(WAIT_ID_MAX_LEN) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

#[derive(Debug, Default)]
struct BusState {
    clock: u64,
    last_notify: FxHashMap<String, u64>,
    last_wait: FxHashMap<String, u64>,
    listeners: FxHashMap<String, Vec<(u64, oneshot::Sender<()>)>>,
    next_listener: u64,
}

impl BusState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Per-root event bus keyed by notify id.
#[derive(Debug, Default)]
pub struct NotifyBus {
    state: Arc<Mutex<BusState>>,
}

/// Outcome of checking a wait token against a notify scope.
#[derive(Debug)]
pub enum Gate {
    /// Proceed immediately.
    Open,
    /// Park until the scope is notified.
    Closed(Subscription),
}

/// One-shot registration on a notify id.
///
/// Dropping it before notification removes the registration.
#[derive(Debug)]
pub struct Subscription {
    state: Arc<Mutex<BusState>>,
    notify_id: String,
    id: u64,
    rx: oneshot::Receiver<()>,
}

impl Subscription {
    /// Wait until the scope is notified.
    pub async fn notified(mut self) {
        let _ = (&mut self.rx).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waiting) = state.listeners.get_mut(&self.notify_id) {
            waiting.retain(|(id, _)| *id != self.id);
            if waiting.is_empty() {
                state.listeners.remove(&self.notify_id);
            }
        }
    }
}

impl NotifyBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a wait on `notify_id` with `wait_id` must park.
    ///
    /// A token never seen before proceeds. A known token parks while its
    /// last refresh is not older than the scope's last notification.
    pub fn gate(&self, notify_id: &str, wait_id: &str) -> Gate {
        let mut state = self.lock();
        let Some(&last_wait) = state.last_wait.get(wait_id) else {
            return Gate::Open;
        };
        let last_notify = state.last_notify.get(notify_id).copied().unwrap_or(0);
        if last_notify != 0 && last_wait < last_notify {
            return Gate::Open;
        }

        let (tx, rx) = oneshot::channel();
        let id = state.next_listener;
        state.next_listener += 1;
        state
            .listeners
            .entry(notify_id.to_string())
            .or_default()
            .push((id, tx));
        tracing::debug!(notify_id, wait_id, "parking long-poll");

        Gate::Closed(Subscription {
            state: self.state.clone(),
            notify_id: notify_id.to_string(),
            id,
            rx,
        })
    }

    /// Mark `wait_id` as refreshed now.
    pub fn record_wait(&self, wait_id: &str) {
        let mut state = self.lock();
        let now = state.tick();
        state.last_wait.insert(wait_id.to_string(), now);
    }

    /// Record a mutation of `notify_id` and release everyone waiting on it,
    /// in registration order. Returns how many waiters were released.
    pub fn notify(&self, notify_id: &str) -> usize {
        let mut state = self.lock();
        let now = state.tick();
        state.last_notify.insert(notify_id.to_string(), now);
        let waiting = state.listeners.remove(notify_id).unwrap_or_default();
        drop(state);

        let count = waiting.len();
        for (_, tx) in waiting {
            let _ = tx.send(());
        }
        count
    }

    /// Forget all recorded wait tokens. Parked waiters are unaffected.
    pub fn sweep_waits(&self) {
        self.lock().last_wait.clear();
    }

    /// Number of parked waiters on `notify_id`.
    pub fn waiting(&self, notify_id: &str) -> usize {
        self.lock().listeners.get(notify_id).map_or(0, Vec::len)
    }

    /// Number of remembered wait tokens.
    pub fn tracked_waits(&self) -> usize {
        self.lock().last_wait.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wait_id_truncates() {
        assert_eq!(wait_id("short"), "short");
        let long = "abcdefghijklmnopqrstuvwxyz";
        assert_eq!(wait_id(long), "abcdefghijklmnopqrstuv");
        assert_eq!(wait_id(long).len(), WAIT_ID_MAX_LEN);
        assert_eq!(wait_id("ééééééééééééééééééééééééé").chars().count(), WAIT_ID_MAX_LEN);
    }

    #[test]
    fn test_first_sighting_is_open() {
        let bus = NotifyBus::new();
        assert!(matches!(bus.gate("/items", "t1"), Gate::Open));
    }

    #[test]
    fn test_known_token_parks_until_notified() {
        let bus = NotifyBus::new();
        bus.record_wait("t1");
        let Gate::Closed(_sub) = bus.gate("/items", "t1") else {
            panic!("expected a parked waiter");
        };
        assert_eq!(bus.waiting("/items"), 1);
    }

    #[test]
    fn test_mutation_since_refresh_is_open() {
        let bus = NotifyBus::new();
        bus.record_wait("t1");
        bus.notify("/items");
        assert!(matches!(bus.gate("/items", "t1"), Gate::Open));

        // Refreshing again closes the gate until the next mutation.
        bus.record_wait("t1");
        assert!(matches!(bus.gate("/items", "t1"), Gate::Closed(_)));
    }

    #[test]
    fn test_notify_other_scope_keeps_gate_closed() {
        let bus = NotifyBus::new();
        bus.record_wait("t1");
        bus.notify("/users");
        assert!(matches!(bus.gate("/items", "t1"), Gate::Closed(_)));
    }

    #[test]
    fn test_tokens_collide_on_prefix() {
        let bus = NotifyBus::new();
        let a = "0123456789012345678901-a";
        let b = "0123456789012345678901-b";
        bus.record_wait(wait_id(a));
        assert!(matches!(bus.gate("/items", wait_id(b)), Gate::Closed(_)));
    }

    #[test]
    fn test_dropped_subscription_is_removed() {
        let bus = NotifyBus::new();
        bus.record_wait("t1");
        let gate = bus.gate("/items", "t1");
        assert_eq!(bus.waiting("/items"), 1);
        drop(gate);
        assert_eq!(bus.waiting("/items"), 0);
        assert_eq!(bus.notify("/items"), 0);
    }

    #[test]
    fn test_sweep_forgets_tokens_but_not_waiters() {
        let bus = NotifyBus::new();
        bus.record_wait("t1");
        bus.record_wait("t2");
        let _parked = bus.gate("/items", "t1");
        assert_eq!(bus.tracked_waits(), 2);

        bus.sweep_waits();
        assert_eq!(bus.tracked_waits(), 0);
        assert_eq!(bus.waiting("/items"), 1);
        assert!(matches!(bus.gate("/items", "t1"), Gate::Open));
    }

    #[tokio::test]
    async fn test_notify_releases_waiters_in_order() {
        let bus = NotifyBus::new();
        let tokens = ["c", "a", "b"];
        for token in tokens {
            bus.record_wait(token);
        }
        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        for token in tokens {
            let Gate::Closed(sub) = bus.gate("/items", token) else {
                panic!("expected a parked waiter");
            };
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                sub.notified().await;
                let _ = order_tx.send(token);
            });
        }

        let registered: Vec<u64> = bus.lock().listeners["/items"]
            .iter()
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(registered, vec![0, 1, 2]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(order_rx.try_recv().is_err());

        assert_eq!(bus.notify("/items"), 3);
        let mut released = Vec::new();
        for _ in tokens {
            released.push(order_rx.recv().await.unwrap());
        }
        assert_eq!(released, tokens);
        assert_eq!(bus.waiting("/items"), 0);
    }
}
