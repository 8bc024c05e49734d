// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kernel::{
        exit_reason,
        pcb::{
            Pid,
            ProcessRef,
            ProcessState,
        },
        Kernel,
    },
    runtime::{
        fail::Fail,
        limits,
    },
};
use ::std::{
    sync::{
        atomic::Ordering,
        Arc,
    },
    thread,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Admission scheduler loop. SUSP_READY has strict priority over NEW. Returns when the kernel shuts down.
pub fn run(kernel: &Arc<Kernel>) -> Result<(), Fail> {
    loop {
        if kernel.is_shutting_down() {
            return Ok(());
        }

        let swapped: Option<ProcessRef> = kernel.queues.susp_ready.with(|items| items.first().cloned());
        if let Some(process) = swapped {
            kernel.resume(&process)?;
            continue;
        }

        if !kernel.queues.new.wait_non_empty(limits::QUEUE_WAIT_SLICE)? {
            continue;
        }
        let candidate: Option<ProcessRef> = kernel
            .queues
            .new
            .with(|items| kernel.admission.select(items).map(|i| items[i].clone()));
        if let Some(candidate) = candidate {
            kernel.admit(&candidate)?;
        }
    }
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Kernel {
    /// Brings a swapped-out process back into memory and makes it READY. On failure it goes to the back of
    /// SUSP_READY.
    fn resume(&self, process: &ProcessRef) -> Result<(), Fail> {
        let pid: Pid = process.pid();
        self.gate.acquire()?;
        match self.memory.resume_process(pid) {
            Ok(()) => match self.queues.susp_ready.remove_where(|p: &ProcessRef| p.pid() == pid) {
                Some(process) => {
                    info!("({}) - resumed from swap", pid);
                    self.enter(process, ProcessState::Ready);
                    self.signal_sts();
                },
                None => {
                    // Finalized while memory was resuming it.
                    self.gate.release();
                },
            },
            Err(e) => {
                warn!("resume(): memory could not resume ({}): {}", pid, e);
                self.gate.release();
                if let Some(process) = self.queues.susp_ready.remove_where(|p: &ProcessRef| p.pid() == pid) {
                    self.queues.susp_ready.push(process);
                }
                thread::sleep(limits::QUEUE_WAIT_SLICE);
            },
        }
        Ok(())
    }

    /// Admits a NEW process: takes a permit, initializes its memory (with retries) and moves it to READY. When every
    /// attempt fails the process is finalized and the permit given back.
    fn admit(&self, candidate: &ProcessRef) -> Result<(), Fail> {
        let pid: Pid = candidate.pid();
        let bootstrap: bool =
            pid == 0 && !self.options.bootstrap_memory_init && !self.bootstrap_admitted.swap(true, Ordering::SeqCst);

        self.gate.acquire()?;
        if !bootstrap && !self.initialize_memory(candidate)? {
            self.finalize(candidate, exit_reason::INIT_FAILED);
            self.gate.release();
            return Ok(());
        }

        match self.queues.new.remove_where(|p: &ProcessRef| p.pid() == pid) {
            Some(process) => {
                self.enter(process, ProcessState::Ready);
                self.signal_sts();
            },
            None => {
                debug!("admit(): ({}) left NEW during admission", pid);
                self.gate.release();
            },
        }
        Ok(())
    }

    /// Asks memory to set the process up, retrying with a fixed delay. Returns whether it succeeded.
    fn initialize_memory(&self, candidate: &ProcessRef) -> Result<bool, Fail> {
        let pid: Pid = candidate.pid();
        let (size, program): (u64, String) = {
            let pcb = candidate.lock();
            (pcb.size, pcb.program.clone())
        };
        let attempts: u32 = self.options.memory_init_attempts;
        for attempt in 1..=attempts {
            match self.memory.init_process(pid, size, &program) {
                Ok(()) => return Ok(true),
                Err(e) => {
                    warn!(
                        "({}) - memory initialization attempt {}/{} failed: {}",
                        pid, attempt, attempts, e
                    );
                },
            }
            if attempt < attempts {
                thread::sleep(self.options.memory_init_retry_delay);
            }
            if self.is_shutting_down() {
                self.gate.release();
                return Err(Fail::new(libc::ECANCELED, "kernel is shutting down"));
            }
        }
        error!("({}) - memory initialization failed after {} attempts", pid, attempts);
        Ok(false)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
