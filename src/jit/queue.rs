//! Compile request queue and completion tickets
//!
//! A blocking FIFO guarded by a mutex and condition variable. Keyed sends are
//! deduplicated until the item is received, so a function sits in the queue
//! at most once however many times it is requested.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashSet;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Error returned when sending on a closed queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue closed")
    }
}

impl std::error::Error for QueueClosed {}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<(Option<u64>, T)>,
    keys: FxHashSet<u64>,
    closed: bool,
}

/// Multi-producer FIFO with optional per-key deduplication
#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                keys: FxHashSet::default(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Append an item
    pub fn send(&self, item: T) -> Result<(), QueueClosed> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(QueueClosed);
        }
        state.items.push_back((None, item));
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append an item unless one with the same key is still waiting.
    /// Returns whether the item was queued.
    pub fn send_unique(&self, key: u64, item: T) -> Result<bool, QueueClosed> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(QueueClosed);
        }
        if !state.keys.insert(key) {
            return Ok(false);
        }
        state.items.push_back((Some(key), item));
        self.not_empty.notify_one();
        Ok(true)
    }

    /// Block until an item arrives; `None` once closed and drained
    pub fn recv(&self) -> Option<T> {
        let mut state = lock(&self.state);
        loop {
            if let Some(item) = Self::pop(&mut state) {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take an item without blocking
    pub fn try_recv(&self) -> Option<T> {
        Self::pop(&mut lock(&self.state))
    }

    /// Take every queued item without blocking
    pub fn drain(&self) -> Vec<T> {
        let mut state = lock(&self.state);
        state.keys.clear();
        state.items.drain(..).map(|(_, item)| item).collect()
    }

    fn pop(state: &mut QueueState<T>) -> Option<T> {
        let (key, item) = state.items.pop_front()?;
        if let Some(key) = key {
            state.keys.remove(&key);
        }
        Some(item)
    }

    /// Close the queue; receivers drain what is left and then stop
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion handle for one compile request
#[derive(Debug, Default)]
pub struct CompileTicket {
    finished: Mutex<bool>,
    done: Condvar,
}

impl CompileTicket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the request finished and wake every waiter
    pub fn finish(&self) {
        *lock(&self.finished) = true;
        self.done.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        *lock(&self.finished)
    }

    /// Block until the request finishes
    pub fn wait(&self) {
        let mut finished = lock(&self.finished);
        while !*finished {
            finished = self
                .done
                .wait(finished)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`; returns whether the request finished
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let finished = lock(&self.finished);
        let (finished, _) = self
            .done
            .wait_timeout_while(finished, timeout, |f| !*f)
            .unwrap_or_else(PoisonError::into_inner);
        *finished
    }
}
