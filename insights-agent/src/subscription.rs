// ABOUTME: Broadcast fan-out that keeps a backlog until the first subscriber arrives.
// ABOUTME: Subscription wraps the receiver with recv/try_recv like an event receiver.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

const DEFAULT_CAPACITY: usize = 1024;

struct State<T> {
    tx: Option<broadcast::Sender<T>>,
    /// Items sent before anyone subscribed. None once claimed.
    backlog: Option<VecDeque<T>>,
}

/// Multi-consumer stream. Items sent before the first subscribe are replayed to that subscriber.
pub struct Broadcaster<T> {
    state: Mutex<State<T>>,
    capacity: usize,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(State {
                tx: Some(tx),
                backlog: Some(VecDeque::new()),
            }),
            capacity,
        }
    }

    /// Publish an item. Dropped silently after close().
    pub fn send(&self, item: T) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(backlog) = state.backlog.as_mut() {
            if backlog.len() == self.capacity {
                backlog.pop_front();
            }
            backlog.push_back(item.clone());
        }
        if let Some(tx) = state.tx.as_ref() {
            let _ = tx.send(item);
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let backlog = state.backlog.take().unwrap_or_default();
        let rx = match state.tx.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Already closed: hand out a receiver that ends right after the backlog.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        };
        Subscription { backlog, rx }
    }

    /// End every subscription once it has drained what was already sent
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tx
            .is_none()
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for a Broadcaster's items.
///
/// This is `Send` so it can be passed across async task boundaries.
pub struct Subscription<T> {
    backlog: VecDeque<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Receive the next item, or None once the stream is closed
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(item) = self.backlog.pop_front() {
            return Some(item);
        }
        loop {
            match self.rx.recv().await {
                Ok(item) => return Some(item),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber lagged, items dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an item without blocking
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(item) = self.backlog.pop_front() {
            return Some(item);
        }
        loop {
            match self.rx.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber lagged, items dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
