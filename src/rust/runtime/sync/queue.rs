// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::parking_lot::{
    Condvar,
    Mutex,
    MutexGuard,
};
use ::std::time::Duration;

//======================================================================================================================
// Structures
//======================================================================================================================

struct QueueInner<T> {
    items: Vec<T>,
    closed: bool,
}

/// An ordered collection guarded by its own lock, with a condition that consumers can block on until the collection
/// becomes non-empty. Insertion order is preserved; consumers may take any element.
pub struct StateQueue<T> {
    name: &'static str,
    inner: Mutex<QueueInner<T>>,
    cond: Condvar,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T> StateQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(QueueInner {
                items: Vec::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends `item` and wakes one waiting consumer.
    pub fn push(&self, item: T) {
        {
            let mut inner: MutexGuard<QueueInner<T>> = self.inner.lock();
            inner.items.push(item);
        }
        self.cond.notify_one();
    }

    /// Wakes every consumer so that it re-evaluates its predicate.
    pub fn notify(&self) {
        // Taking the lock orders this wake-up after any in-progress predicate check.
        drop(self.inner.lock());
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Runs `f` with exclusive access to the underlying sequence.
    pub fn with<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        let mut inner: MutexGuard<QueueInner<T>> = self.inner.lock();
        f(&mut inner.items)
    }

    /// Removes and returns the first element matching `pred`. The lock is held for the whole scan and splice.
    pub fn remove_where(&self, pred: impl FnMut(&T) -> bool) -> Option<T> {
        let mut inner: MutexGuard<QueueInner<T>> = self.inner.lock();
        let index: usize = inner.items.iter().position(pred)?;
        Some(inner.items.remove(index))
    }

    /// Blocks until the queue is non-empty or `timeout` elapses. Returns whether the queue was observed non-empty.
    pub fn wait_non_empty(&self, timeout: Duration) -> Result<bool, Fail> {
        let mut inner: MutexGuard<QueueInner<T>> = self.inner.lock();
        if inner.items.is_empty() && !inner.closed {
            self.cond.wait_for(&mut inner, timeout);
        }
        if inner.closed {
            return Err(self.closed_failure());
        }
        Ok(!inner.items.is_empty())
    }

    /// Wakes all consumers and makes every further wait fail.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cond.notify_all();
    }

    fn closed_failure(&self) -> Fail {
        Fail::new(libc::ECANCELED, &format!("queue {} is closed", self.name))
    }
}

impl<T: Clone> StateQueue<T> {
    /// Returns a copy of the current contents, in insertion order.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().items.clone()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
