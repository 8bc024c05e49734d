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

//======================================================================================================================
// Structures
//======================================================================================================================

struct GateState {
    available: usize,
    closed: bool,
}

/// Counting semaphore that bounds how many processes may be resident in memory at the same time.
pub struct Gate {
    capacity: usize,
    state: Mutex<GateState>,
    cond: Condvar,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Gate {
    /// Creates a gate holding `capacity` permits. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity: usize = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(GateState {
                available: capacity,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Takes one permit, blocking while none is available.
    pub fn acquire(&self) -> Result<(), Fail> {
        let mut state: MutexGuard<GateState> = self.state.lock();
        while state.available == 0 && !state.closed {
            self.cond.wait(&mut state);
        }
        if state.closed {
            return Err(Fail::new(libc::ECANCELED, "multiprogramming gate is closed"));
        }
        state.available -= 1;
        trace!("acquire(): permits available={}/{}", state.available, self.capacity);
        Ok(())
    }

    /// Takes one permit if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        let mut state: MutexGuard<GateState> = self.state.lock();
        if state.closed || state.available == 0 {
            return false;
        }
        state.available -= 1;
        true
    }

    /// Returns one permit and wakes one waiter.
    pub fn release(&self) {
        {
            let mut state: MutexGuard<GateState> = self.state.lock();
            if state.available == self.capacity {
                error!("release(): permit released with none outstanding (capacity={})", self.capacity);
                return;
            }
            state.available += 1;
            trace!("release(): permits available={}/{}", state.available, self.capacity);
        }
        self.cond.notify_one();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Number of permits currently held.
    pub fn outstanding(&self) -> usize {
        self.capacity - self.available()
    }

    /// Wakes every waiter and makes further acquisitions fail.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
