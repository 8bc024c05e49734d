// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kernel::pcb::{
        Pid,
        ProcessRef,
        ProcessState,
    },
    runtime::sync::StateQueue,
};
use ::parking_lot::{
    Mutex,
    MutexGuard,
};
use ::std::collections::BTreeMap;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Assignment of execution units to the processes running on them. A unit without an entry is free.
pub struct ExecMap {
    units: Mutex<BTreeMap<String, ProcessRef>>,
}

/// Every state container. Lock order: a queue before any process record, and READY before EXEC when both are held.
pub struct StateQueues {
    pub new: StateQueue<ProcessRef>,
    pub ready: StateQueue<ProcessRef>,
    pub blocked: StateQueue<ProcessRef>,
    pub susp_ready: StateQueue<ProcessRef>,
    pub susp_blocked: StateQueue<ProcessRef>,
    pub exec: ExecMap,
    exit: Mutex<Vec<ProcessRef>>,
}

/// Pids held by each container at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub new: Vec<Pid>,
    pub ready: Vec<Pid>,
    pub exec: Vec<(String, Pid)>,
    pub blocked: Vec<Pid>,
    pub susp_ready: Vec<Pid>,
    pub susp_blocked: Vec<Pid>,
    pub exit: Vec<Pid>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ExecMap {
    pub fn new() -> Self {
        Self {
            units: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<BTreeMap<String, ProcessRef>> {
        self.units.lock()
    }

    /// Assigns `process` to `unit`. Fails if the unit is taken.
    pub fn reserve(&self, unit: &str, process: ProcessRef) -> Result<(), ProcessRef> {
        let mut units = self.units.lock();
        if units.contains_key(unit) {
            return Err(process);
        }
        units.insert(unit.to_string(), process);
        Ok(())
    }

    /// Frees whatever unit `pid` occupies and returns its name.
    pub fn release(&self, pid: Pid) -> Option<(String, ProcessRef)> {
        let mut units = self.units.lock();
        let unit: String = units
            .iter()
            .find(|(_, process)| process.pid() == pid)
            .map(|(unit, _)| unit.clone())?;
        let process: ProcessRef = units.remove(&unit)?;
        debug!("release(): unit {} freed by ({})", unit, pid);
        Some((unit, process))
    }

    /// Whether `pid` still runs on `unit`.
    pub fn holds(&self, unit: &str, pid: Pid) -> bool {
        self.units.lock().get(unit).map(|p| p.pid() == pid).unwrap_or(false)
    }

    pub fn unit_of(&self, pid: Pid) -> Option<String> {
        self.units
            .lock()
            .iter()
            .find(|(_, process)| process.pid() == pid)
            .map(|(unit, _)| unit.clone())
    }

    /// First unit in `candidates` without an occupant.
    pub fn first_free(&self, candidates: &[String]) -> Option<String> {
        let units = self.units.lock();
        candidates.iter().find(|name| !units.contains_key(*name)).cloned()
    }

    pub fn len(&self) -> usize {
        self.units.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<(String, Pid)> {
        self.units
            .lock()
            .iter()
            .map(|(unit, process)| (unit.clone(), process.pid()))
            .collect()
    }
}

impl StateQueues {
    pub fn new() -> Self {
        Self {
            new: StateQueue::new("NEW"),
            ready: StateQueue::new("READY"),
            blocked: StateQueue::new("BLOCKED"),
            susp_ready: StateQueue::new("SUSP_READY"),
            susp_blocked: StateQueue::new("SUSP_BLOCKED"),
            exec: ExecMap::new(),
            exit: Mutex::new(Vec::new()),
        }
    }

    /// The ordered queue for `state`. EXEC and EXIT are not queues.
    pub fn queue(&self, state: ProcessState) -> Option<&StateQueue<ProcessRef>> {
        match state {
            ProcessState::New => Some(&self.new),
            ProcessState::Ready => Some(&self.ready),
            ProcessState::Blocked => Some(&self.blocked),
            ProcessState::SuspReady => Some(&self.susp_ready),
            ProcessState::SuspBlocked => Some(&self.susp_blocked),
            ProcessState::Exec | ProcessState::Exit => None,
        }
    }

    /// Takes `pid` out of the container for `state`. Returns `None` if it is not there.
    pub fn remove(&self, state: ProcessState, pid: Pid) -> Option<ProcessRef> {
        match state {
            ProcessState::Exec => self.exec.release(pid).map(|(_, process)| process),
            ProcessState::Exit => None,
            _ => self.queue(state)?.remove_where(|p: &ProcessRef| p.pid() == pid),
        }
    }

    /// Appends to EXIT history.
    pub fn record_exit(&self, process: ProcessRef) {
        self.exit.lock().push(process);
    }

    pub fn exited(&self) -> Vec<Pid> {
        self.exit.lock().iter().map(|p| p.pid()).collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let pids = |queue: &StateQueue<ProcessRef>| -> Vec<Pid> {
            queue.with(|items: &mut Vec<ProcessRef>| items.iter().map(|p| p.pid()).collect())
        };
        QueueSnapshot {
            new: pids(&self.new),
            ready: pids(&self.ready),
            exec: self.exec.snapshot(),
            blocked: pids(&self.blocked),
            susp_ready: pids(&self.susp_ready),
            susp_blocked: pids(&self.susp_blocked),
            exit: self.exited(),
        }
    }

    /// Wakes and cancels every waiter.
    pub fn close(&self) {
        for queue in [&self.new, &self.ready, &self.blocked, &self.susp_ready, &self.susp_blocked] {
            queue.close();
        }
    }
}

impl QueueSnapshot {
    /// Every pid with the container it was seen in. A pid listed twice breaks single ownership.
    pub fn memberships(&self) -> Vec<(Pid, ProcessState)> {
        let mut all: Vec<(Pid, ProcessState)> = Vec::new();
        all.extend(self.new.iter().map(|&pid| (pid, ProcessState::New)));
        all.extend(self.ready.iter().map(|&pid| (pid, ProcessState::Ready)));
        all.extend(self.exec.iter().map(|(_, pid)| (*pid, ProcessState::Exec)));
        all.extend(self.blocked.iter().map(|&pid| (pid, ProcessState::Blocked)));
        all.extend(self.susp_ready.iter().map(|&pid| (pid, ProcessState::SuspReady)));
        all.extend(self.susp_blocked.iter().map(|&pid| (pid, ProcessState::SuspBlocked)));
        all.extend(self.exit.iter().map(|&pid| (pid, ProcessState::Exit)));
        all
    }

    /// Processes that hold a multiprogramming permit.
    pub fn resident(&self) -> usize {
        self.ready.len() + self.exec.len() + self.blocked.len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for ExecMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for StateQueues {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
