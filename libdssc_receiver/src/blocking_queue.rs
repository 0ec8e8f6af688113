use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Open,
    /// Waiters drain the remaining items, then see the end of the queue
    Finishing,
    /// Waiters see the end of the queue immediately. Items are kept for a later reset.
    Exited,
}

/// Outcome of a bounded pop
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(T),
    Timeout,
    /// The queue was finished and is drained, or exited
    Closed,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    state: QueueState,
    consumers: usize,
    /// Bumped by every exit, so a waiter still sees an exit that a reset already undid
    exits: u64,
}

impl<T> Inner<T> {
    /// Non-blocking step of every pop: Some(result) if the caller may return. `exits` is
    /// the exit count the caller saw when it started waiting.
    fn poll(&mut self, exits: u64) -> Option<Option<T>> {
        if self.exits != exits {
            return Some(None);
        }
        match self.state {
            QueueState::Exited => Some(None),
            QueueState::Finishing => Some(self.items.pop_front()),
            QueueState::Open => self.items.pop_front().map(Some),
        }
    }
}

/// A FIFO shared between threads. Pops block until an item arrives or the queue is shut
/// down with [BlockingQueue::finish] or [BlockingQueue::exit].
///
/// Pushes are accepted in every state, so that buffers returned by consumers after a
/// shutdown are not lost.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                state: QueueState::Open,
                consumers: 0,
                exits: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.inner.lock().items.push_back(item);
        self.available.notify_one();
    }

    /// Block until an item is available. None means the queue was shut down.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let exits = inner.exits;
        loop {
            if let Some(result) = inner.poll(exits) {
                return result;
            }
            self.available.wait(&mut inner);
        }
    }

    /// Block for at most `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let exits = inner.exits;
        loop {
            match inner.poll(exits) {
                Some(Some(item)) => return Pop::Item(item),
                Some(None) => return Pop::Closed,
                None => (),
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                return match inner.poll(exits) {
                    Some(Some(item)) => Pop::Item(item),
                    Some(None) => Pop::Closed,
                    None => Pop::Timeout,
                };
            }
        }
    }

    /// Pop the front item if there is one, regardless of the queue state
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Pop the front item only if it satisfies `predicate`
    pub fn try_pop_if<F>(&self, predicate: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut inner = self.inner.lock();
        match inner.items.front() {
            Some(item) if predicate(item) => inner.items.pop_front(),
            _ => None,
        }
    }

    /// Let waiters drain the queue, then wake them with the end of the queue
    pub fn finish(&self) {
        let mut inner = self.inner.lock();
        if inner.state == QueueState::Open {
            inner.state = QueueState::Finishing;
        }
        self.available.notify_all();
    }

    /// Wake every waiter immediately
    pub fn exit(&self) {
        let mut inner = self.inner.lock();
        inner.state = QueueState::Exited;
        inner.exits += 1;
        self.available.notify_all();
    }

    /// Register `consumers` more consumers. After a shutdown the queue is re-armed once
    /// all of them have called [BlockingQueue::close].
    pub fn open(&self, consumers: usize) {
        self.inner.lock().consumers += consumers;
    }

    /// Unregister one consumer. Returns true if this was the last one and the queue was
    /// re-armed.
    pub fn close(&self) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        if inner.consumers == 0 {
            return Err(QueueError::Unbalanced);
        }
        inner.consumers -= 1;
        if inner.consumers == 0 {
            inner.state = QueueState::Open;
            return Ok(true);
        }
        Ok(false)
    }

    /// Re-arm unconditionally. Items are kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = QueueState::Open;
        inner.consumers = 0;
    }

    /// Move all items into `out`
    pub fn drain_into(&self, out: &mut Vec<T>) {
        out.extend(self.inner.lock().items.drain(..));
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    /// Advisory only, may change as soon as the lock is released
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
