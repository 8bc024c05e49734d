// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::parking_lot::{
    Mutex,
    MutexGuard,
};
use ::std::{
    fmt,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Process identifier.
pub type Pid = u32;

/// Scheduling state of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessState {
    New,
    Ready,
    Exec,
    Blocked,
    SuspReady,
    SuspBlocked,
    Exit,
}

/// Number of entries into a state and the time accumulated in it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateMetrics {
    pub count: u32,
    pub total: Duration,
}

/// Process control block.
#[derive(Debug)]
pub struct Pcb {
    pid: Pid,
    state: ProcessState,
    pub program: String,
    pub program_counter: u64,
    pub size: u64,
    /// Estimated length of the next burst, in milliseconds.
    pub burst_estimate: f64,
    pub block_reason: Option<String>,
    pub exit_reason: Option<String>,
    created_at: Instant,
    state_since: Instant,
    last_ready_at: Instant,
    last_exec_at: Option<Instant>,
    last_blocked_at: Option<Instant>,
    finalized_at: Option<Instant>,
    metrics: [StateMetrics; ProcessState::COUNT],
}

/// Shared handle to a process. The pid is immutable and readable without taking the lock.
pub struct Process {
    pid: Pid,
    pcb: Mutex<Pcb>,
}

/// Reference-counted process handle stored in the registry and state containers.
pub type ProcessRef = Arc<Process>;

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ProcessState {
    pub const COUNT: usize = 7;
    pub const ALL: [ProcessState; ProcessState::COUNT] = [
        ProcessState::New,
        ProcessState::Ready,
        ProcessState::Exec,
        ProcessState::Blocked,
        ProcessState::SuspReady,
        ProcessState::SuspBlocked,
        ProcessState::Exit,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Whether a process in this state holds a multiprogramming permit.
    pub fn is_resident(self) -> bool {
        matches!(self, ProcessState::Ready | ProcessState::Exec | ProcessState::Blocked)
    }
}

impl Pcb {
    pub fn new(pid: Pid, program: &str, size: u64, initial_estimate: f64) -> Self {
        let now: Instant = Instant::now();
        let mut metrics: [StateMetrics; ProcessState::COUNT] = [StateMetrics::default(); ProcessState::COUNT];
        metrics[ProcessState::New.index()].count = 1;
        info!("({}) - created - state: {}", pid, ProcessState::New);
        Self {
            pid,
            state: ProcessState::New,
            program: program.to_string(),
            program_counter: 0,
            size,
            burst_estimate: initial_estimate,
            block_reason: None,
            exit_reason: None,
            created_at: now,
            state_since: now,
            last_ready_at: now,
            last_exec_at: None,
            last_blocked_at: None,
            finalized_at: None,
            metrics,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time of the last enqueue to READY.
    pub fn last_ready_at(&self) -> Instant {
        self.last_ready_at
    }

    pub fn last_exec_at(&self) -> Option<Instant> {
        self.last_exec_at
    }

    pub fn last_blocked_at(&self) -> Option<Instant> {
        self.last_blocked_at
    }

    pub fn finalized_at(&self) -> Option<Instant> {
        self.finalized_at
    }

    pub fn metrics(&self, state: ProcessState) -> StateMetrics {
        self.metrics[state.index()]
    }

    /// Moves the record to `to`, updating counters and timestamps. Leaving EXEC folds the measured burst into the
    /// estimate: `estimate = alpha * burst + (1 - alpha) * estimate`. Returns the previous state.
    pub fn transition(&mut self, to: ProcessState, alpha: f64) -> ProcessState {
        let now: Instant = Instant::now();
        let from: ProcessState = self.state;

        self.metrics[from.index()].total += now.saturating_duration_since(self.state_since);
        self.metrics[to.index()].count += 1;

        if from == ProcessState::Exec && to != ProcessState::Exec {
            if let Some(started) = self.last_exec_at {
                let burst: f64 = now.saturating_duration_since(started).as_secs_f64() * 1000.0;
                self.burst_estimate = alpha * burst + (1.0 - alpha) * self.burst_estimate;
                debug!(
                    "({}) - burst {:.1} ms, next estimate {:.1} ms",
                    self.pid, burst, self.burst_estimate
                );
            }
        }

        match to {
            ProcessState::Ready => self.last_ready_at = now,
            ProcessState::Exec => self.last_exec_at = Some(now),
            ProcessState::Blocked => self.last_blocked_at = Some(now),
            ProcessState::Exit => self.finalized_at = Some(now),
            _ => (),
        }
        if to != ProcessState::Blocked && to != ProcessState::SuspBlocked {
            self.block_reason = None;
        }

        self.state = to;
        self.state_since = now;
        info!("({}) - state {} -> {}", self.pid, from, to);
        from
    }

    /// One-line summary of the time spent in each state.
    pub fn report(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(ProcessState::COUNT);
        for state in ProcessState::ALL {
            let m: StateMetrics = self.metrics[state.index()];
            parts.push(format!("{} ({}, {} ms)", state, m.count, m.total.as_millis()));
        }
        format!("({}) - metrics: {}", self.pid, parts.join(", "))
    }
}

impl Process {
    pub fn new(pcb: Pcb) -> ProcessRef {
        Arc::new(Self { pid: pcb.pid(), pcb: Mutex::new(pcb) })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn lock(&self) -> MutexGuard<Pcb> {
        self.pcb.lock()
    }

    pub fn state(&self) -> ProcessState {
        self.pcb.lock().state()
    }

    pub fn burst_estimate(&self) -> f64 {
        self.pcb.lock().burst_estimate
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &str = match self {
            ProcessState::New => "NEW",
            ProcessState::Ready => "READY",
            ProcessState::Exec => "EXEC",
            ProcessState::Blocked => "BLOCKED",
            ProcessState::SuspReady => "SUSP_READY",
            ProcessState::SuspBlocked => "SUSP_BLOCKED",
            ProcessState::Exit => "EXIT",
        };
        write!(f, "{}", name)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process({})", self.pid)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
