// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod config;
pub mod exec;
pub mod handlers;
pub mod io;
pub mod lts;
pub mod pcb;
pub mod peers;
pub mod policy;
pub mod queues;
pub mod registry;
pub mod sts;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kernel::{
        config::{
            SchedulerOptions,
            TransportOptions,
        },
        io::IoDispatcher,
        pcb::{
            Pid,
            ProcessRef,
            ProcessState,
        },
        peers::{
            MemoryService,
            UnitRegistry,
        },
        policy::{
            AdmissionStrategy,
            DispatchStrategy,
        },
        queues::{
            QueueSnapshot,
            StateQueues,
        },
        registry::Registry,
    },
    runtime::{
        fail::Fail,
        limits,
        sync::Gate,
        timer::Timer,
    },
};
use ::crossbeam_channel::{
    Receiver,
    RecvTimeoutError,
    Sender,
};
use ::parking_lot::Mutex;
use ::std::{
    any::Any,
    collections::HashSet,
    panic::{
        self,
        AssertUnwindSafe,
    },
    process,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Reasons recorded when a process is finalized.
pub mod exit_reason {
    pub const EXIT: &str = "EXIT";
    pub const ERROR: &str = "ERROR";
    pub const INIT_FAILED: &str = "INIT_FAILED";
    pub const IO_UNAVAILABLE: &str = "IO_UNAVAILABLE";
    pub const DUMP_FAILED: &str = "DUMP_FAILED";
    pub const SHUTDOWN: &str = "SHUTDOWN";
}

/// Pause between attempts to take a process that is moving between containers.
const RELOCATION_BACKOFF: Duration = Duration::from_millis(1);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduler context. Owns every state container, the process table, the multiprogramming gate and the peer
/// registries, and is shared by reference with every worker.
pub struct Kernel {
    options: SchedulerOptions,
    transport: TransportOptions,
    registry: Registry,
    queues: StateQueues,
    gate: Gate,
    units: UnitRegistry,
    devices: IoDispatcher,
    memory: Arc<dyn MemoryService>,
    dispatch: Box<dyn DispatchStrategy>,
    admission: Box<dyn AdmissionStrategy>,
    suspension: Timer,
    expired: Receiver<u64>,
    /// Processes already asked to give their unit back.
    pending_interrupts: Mutex<HashSet<Pid>>,
    bootstrap_admitted: AtomicBool,
    shutting_down: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Observable state of the kernel at one instant.
#[derive(Clone, Debug)]
pub struct KernelSnapshot {
    pub queues: QueueSnapshot,
    pub permits_outstanding: usize,
    pub permits_capacity: usize,
    pub live: Vec<Pid>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Kernel {
    pub fn new(
        options: SchedulerOptions,
        transport: TransportOptions,
        memory: Arc<dyn MemoryService>,
    ) -> Result<Arc<Self>, Fail> {
        let options: SchedulerOptions = options.validated();
        let (tx, expired): (Sender<u64>, Receiver<u64>) = ::crossbeam_channel::unbounded();
        let suspension: Timer = Timer::start("kernel-suspension", move |pid: u64| {
            let _ = tx.send(pid);
        })?;
        info!(
            "kernel: dispatch={} admission={} multiprogramming={} alpha={}",
            options.dispatch_policy, options.admission_policy, options.multiprogramming, options.alpha
        );
        Ok(Arc::new(Self {
            dispatch: options.dispatch_policy.strategy(),
            admission: options.admission_policy.strategy(),
            gate: Gate::new(options.multiprogramming),
            options,
            transport,
            registry: Registry::new(),
            queues: StateQueues::new(),
            units: UnitRegistry::new(),
            devices: IoDispatcher::new(),
            memory,
            suspension,
            expired,
            pending_interrupts: Mutex::new(HashSet::new()),
            bootstrap_admitted: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn transport(&self) -> TransportOptions {
        self.transport
    }

    pub fn queues(&self) -> &StateQueues {
        &self.queues
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn units(&self) -> &UnitRegistry {
        &self.units
    }

    pub fn devices(&self) -> &IoDispatcher {
        &self.devices
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Starts the admission and dispatch schedulers and the suspension worker.
    pub fn start(self: &Arc<Self>) -> Result<(), Fail> {
        let lts: JoinHandle<()> = {
            let kernel: Arc<Kernel> = self.clone();
            self.spawn_worker("kernel-lts", move || lts::run(&kernel))?
        };
        let sts: JoinHandle<()> = {
            let kernel: Arc<Kernel> = self.clone();
            self.spawn_worker("kernel-sts", move || sts::run(&kernel))?
        };
        let suspender: JoinHandle<()> = {
            let kernel: Arc<Kernel> = self.clone();
            self.spawn_worker("kernel-suspender", move || kernel.run_suspender())?
        };
        self.workers.lock().extend([lts, sts, suspender]);
        info!("schedulers started");
        Ok(())
    }

    /// Creates a process in NEW and wakes the admission scheduler.
    pub fn create_process(&self, pid: Option<Pid>, program: &str, size: u64) -> Result<ProcessRef, Fail> {
        let process: ProcessRef = self.registry.create(pid, program, size, self.options.initial_estimate)?;
        self.queues.new.push(process.clone());
        Ok(process)
    }

    pub fn lookup(&self, pid: Pid) -> Option<ProcessRef> {
        self.registry.lookup(pid)
    }

    /// Wakes the admission scheduler.
    pub fn signal_lts(&self) {
        self.queues.new.notify();
    }

    /// Wakes the dispatch scheduler.
    pub fn signal_sts(&self) {
        self.queues.ready.notify();
    }

    /// Places a process that is in no container into the container for `to` and returns its previous state. The
    /// caller must have taken the process out of its previous container.
    fn enter(&self, process: ProcessRef, to: ProcessState) -> ProcessState {
        let pid: Pid = process.pid();
        let from: ProcessState = process.lock().transition(to, self.options.alpha);
        match to {
            ProcessState::Exit => self.queues.record_exit(process),
            ProcessState::Exec => {
                // Units are only assigned by the dispatch scheduler, under the READY and EXEC locks.
                error!("enter(): ({}) cannot enter EXEC without a unit, returning it to READY", pid);
                process.lock().transition(ProcessState::Ready, self.options.alpha);
                self.queues.ready.push(process);
            },
            _ => {
                if let Some(queue) = self.queues.queue(to) {
                    queue.push(process);
                }
            },
        }
        match to {
            ProcessState::Blocked => self.suspension.arm(pid as u64, self.options.suspension_timeout),
            // The admission scheduler sleeps on NEW and checks SUSP_READY first.
            ProcessState::SuspReady => self.signal_lts(),
            _ => (),
        }
        from
    }

    /// Takes `pid` off its execution unit. Returns the unit, or `None` if the process no longer runs.
    fn take_exec(&self, pid: Pid) -> Option<String> {
        let (unit, _) = self.queues.exec.release(pid)?;
        self.pending_interrupts.lock().remove(&pid);
        Some(unit)
    }

    /// Moves a BLOCKED (or SUSP_BLOCKED) process past its blocking instruction: to READY, or to SUSP_READY if it was
    /// swapped out meanwhile. Returns false if the process was in neither state.
    pub fn complete_blocking(&self, process: &ProcessRef) -> bool {
        let pid: Pid = process.pid();
        if let Some(process) = self.queues.blocked.remove_where(|p: &ProcessRef| p.pid() == pid) {
            self.suspension.cancel(pid as u64);
            process.lock().program_counter += 1;
            self.enter(process, ProcessState::Ready);
            self.signal_sts();
            return true;
        }
        if let Some(process) = self.queues.susp_blocked.remove_where(|p: &ProcessRef| p.pid() == pid) {
            process.lock().program_counter += 1;
            self.enter(process, ProcessState::SuspReady);
            return true;
        }
        false
    }

    /// Finalizes `process`. Finalizing a process that already exited does nothing. Returns whether this call did
    /// the work.
    pub fn finalize(&self, process: &ProcessRef, reason: &str) -> bool {
        let pid: Pid = process.pid();
        let (taken, from): (ProcessRef, ProcessState) = loop {
            let state: ProcessState = process.state();
            if state == ProcessState::Exit {
                debug!("finalize(): ({}) already finalized", pid);
                return false;
            }
            if let Some(taken) = self.queues.remove(state, pid) {
                break (taken, state);
            }
            if self.is_shutting_down() {
                return false;
            }
            // Another worker is moving the process. Retry once it lands.
            thread::sleep(RELOCATION_BACKOFF);
        };
        if from == ProcessState::Exec {
            self.pending_interrupts.lock().remove(&pid);
        }

        self.suspension.cancel(pid as u64);
        taken.lock().exit_reason = Some(reason.to_string());
        self.enter(taken.clone(), ProcessState::Exit);
        info!("({}) - finalized from {}: {}", pid, from, reason);
        info!("{}", taken.lock().report());

        if from.is_resident() {
            self.gate.release();
        }
        if let Err(e) = self.memory.finalize_process(pid) {
            warn!("finalize(): memory did not release ({}): {}", pid, e);
        }
        self.registry.remove(pid);
        self.signal_lts();
        self.signal_sts();
        true
    }

    /// Swaps out a process that stayed BLOCKED for the whole suspension interval. An expiry left over from an
    /// earlier blocking period is ignored.
    pub fn suspend(self: &Arc<Self>, pid: Pid) {
        let timeout: Duration = self.options.suspension_timeout;
        let overdue = |p: &ProcessRef| {
            p.pid() == pid
                && p.lock()
                    .last_blocked_at()
                    .map_or(false, |since: Instant| since.elapsed() >= timeout)
        };
        let Some(process) = self.queues.blocked.remove_where(overdue) else {
            trace!("suspend(): ({}) is not overdue in BLOCKED", pid);
            return;
        };
        self.enter(process, ProcessState::SuspBlocked);
        self.gate.release();

        let kernel: Arc<Kernel> = self.clone();
        let swapped = self.spawn_worker("kernel-swap-out", move || {
            if let Err(e) = kernel.memory.suspend_process(pid) {
                warn!("suspend(): memory did not swap out ({}): {}", pid, e);
            }
            Ok(())
        });
        if let Err(e) = swapped {
            warn!("suspend(): {}", e);
        }
        self.signal_lts();
    }

    fn run_suspender(self: &Arc<Self>) -> Result<(), Fail> {
        loop {
            if self.is_shutting_down() {
                return Ok(());
            }
            match self.expired.recv_timeout(limits::QUEUE_WAIT_SLICE) {
                Ok(pid) => match Pid::try_from(pid) {
                    Ok(pid) => self.suspend(pid),
                    Err(_) => warn!("run_suspender(): invalid timer key {}", pid),
                },
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Spawns a named worker thread behind a fatal error boundary: an error or panic escaping `f` is logged and
    /// terminates the process, unless the kernel is shutting down.
    pub fn spawn_worker<F>(self: &Arc<Self>, name: &str, f: F) -> Result<JoinHandle<()>, Fail>
    where
        F: FnOnce() -> Result<(), Fail> + Send + 'static,
    {
        let kernel: Arc<Kernel> = self.clone();
        let worker: String = name.to_string();
        let handle: JoinHandle<()> = thread::Builder::new().name(name.to_string()).spawn(move || {
            let cause: String = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            if kernel.is_shutting_down() {
                debug!("{}: stopped during shutdown: {}", worker, cause);
                return;
            }
            error!("{}: fatal error: {}", worker, cause);
            ::log::logger().flush();
            process::exit(1);
        })?;
        Ok(handle)
    }

    /// Stops every scheduler. Blocked waiters are woken and return.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("kernel shutting down");
        self.queues.close();
        self.gate.close();
        self.suspension.stop();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            if worker.join().is_err() {
                error!("shutdown(): worker panicked");
            }
        }
    }

    pub fn snapshot(&self) -> KernelSnapshot {
        KernelSnapshot {
            queues: self.queues.snapshot(),
            permits_outstanding: self.gate.outstanding(),
            permits_capacity: self.gate.capacity(),
            live: self.registry.pids(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
