// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kernel::pcb::{
        Pcb,
        Pid,
        Process,
        ProcessRef,
    },
    runtime::fail::Fail,
};
use ::parking_lot::Mutex;
use ::std::collections::HashMap;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Process table and pid allocator. Each has its own lock.
pub struct Registry {
    next_pid: Mutex<Pid>,
    table: Mutex<HashMap<Pid, ProcessRef>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Registry {
    pub fn new() -> Self {
        Self {
            next_pid: Mutex::new(0),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the next pid. Pids start at zero and are never handed out twice.
    pub fn allocate_pid(&self) -> Pid {
        let mut next_pid = self.next_pid.lock();
        let pid: Pid = *next_pid;
        *next_pid += 1;
        pid
    }

    /// Creates a record in NEW. When `pid` is given it must not be live, and the allocator skips past it.
    pub fn create(&self, pid: Option<Pid>, program: &str, size: u64, initial_estimate: f64) -> Result<ProcessRef, Fail> {
        let pid: Pid = match pid {
            Some(pid) => {
                let mut next_pid = self.next_pid.lock();
                if *next_pid <= pid {
                    *next_pid = pid + 1;
                }
                pid
            },
            None => self.allocate_pid(),
        };

        let mut table = self.table.lock();
        if table.contains_key(&pid) {
            let cause: String = format!("pid {} is already in use", pid);
            error!("create(): {}", cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        let process: ProcessRef = Process::new(Pcb::new(pid, program, size, initial_estimate));
        table.insert(pid, process.clone());
        Ok(process)
    }

    pub fn lookup(&self, pid: Pid) -> Option<ProcessRef> {
        self.table.lock().get(&pid).cloned()
    }

    pub fn remove(&self, pid: Pid) -> Option<ProcessRef> {
        self.table.lock().remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Live pids in ascending order.
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.table.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
