// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kernel::{
        config::IoUnavailablePolicy,
        exit_reason,
        pcb::{
            Pid,
            ProcessRef,
            ProcessState,
        },
        peers::{
            CpuReply,
            ExecutionUnit,
            IoDevice,
            ReturnReason,
            SyscallParams,
        },
        Kernel,
    },
    runtime::{
        fail::Fail,
        limits,
    },
};
use ::std::{
    sync::Arc,
    thread,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Block reason of a process waiting for a memory dump.
pub const DUMP_BLOCK_REASON: &str = "DUMP";

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Drives one dispatched process on `unit` until it leaves EXEC.
pub fn run(kernel: &Arc<Kernel>, process: ProcessRef, unit: Arc<dyn ExecutionUnit>) -> Result<(), Fail> {
    let pid: Pid = process.pid();
    let name: String = unit.name().to_string();
    loop {
        if kernel.is_shutting_down() || !kernel.queues.exec.holds(&name, pid) {
            return Ok(());
        }
        let program_counter: u64 = process.lock().program_counter;
        trace!("({}) - executing on {} at {}", pid, name, program_counter);
        match unit.execute(pid, program_counter) {
            Ok(reply) => {
                if !kernel.handle_return(&process, reply) {
                    return Ok(());
                }
            },
            Err(e) if e.is_transport() => {
                warn!("run(): lost contact with {} while running ({}): {}", name, pid, e);
                // The unit stays reserved during the backoff.
                thread::sleep(limits::CPU_POLL_BACKOFF);
                if kernel.take_exec(pid).is_some() {
                    kernel.enter(process.clone(), ProcessState::Ready);
                    kernel.signal_sts();
                }
                return Ok(());
            },
            Err(e) => {
                error!("run(): invalid reply from {} for ({}): {}", name, pid, e);
                kernel.finalize(&process, exit_reason::ERROR);
                return Ok(());
            },
        }
    }
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Kernel {
    /// Applies what an execution unit reported for `process`. Returns true if the process keeps its unit and should be
    /// sent again.
    pub(super) fn handle_return(self: &Arc<Self>, process: &ProcessRef, reply: CpuReply) -> bool {
        let pid: Pid = process.pid();
        let reason: ReturnReason = match reply.reason {
            Some(reason) => reason,
            None => {
                if self.queues.exec.unit_of(pid).is_none() {
                    return false;
                }
                let mut pcb = process.lock();
                pcb.program_counter = match reply.program_counter {
                    Some(jump) if jump != pcb.program_counter => jump,
                    _ => pcb.program_counter + 1,
                };
                return true;
            },
        };
        debug!("({}) - returned with {:?}", pid, reason);

        match reason {
            ReturnReason::Interrupted => {
                if self.take_exec(pid).is_none() {
                    return false;
                }
                if let Some(pc) = reply.program_counter {
                    process.lock().program_counter = pc;
                }
                info!("({}) - interrupted", pid);
                self.enter(process.clone(), ProcessState::Ready);
                self.signal_sts();
                false
            },
            ReturnReason::SyscallInitProc => {
                match (reply.params.program.as_deref(), reply.params.size) {
                    (Some(program), Some(size)) => match self.create_process(None, program, size) {
                        Ok(child) => info!("({}) - created ({}) running {}", pid, child.pid(), program),
                        Err(e) => warn!("handle_return(): ({}) could not create {}: {}", pid, program, e),
                    },
                    _ => {
                        warn!("handle_return(): ({}) requested a process without program or size", pid);
                        self.finalize(process, exit_reason::ERROR);
                        return false;
                    },
                }
                {
                    let mut pcb = process.lock();
                    pcb.program_counter = reply.program_counter.unwrap_or(pcb.program_counter) + 1;
                }
                self.signal_lts();
                true
            },
            ReturnReason::SyscallIo => {
                if self.take_exec(pid).is_none() {
                    return false;
                }
                if let Some(pc) = reply.program_counter {
                    process.lock().program_counter = pc;
                }
                self.block_on_io(process, &reply.params);
                false
            },
            ReturnReason::SyscallDumpMemory => {
                if self.take_exec(pid).is_none() {
                    return false;
                }
                if let Some(pc) = reply.program_counter {
                    process.lock().program_counter = pc;
                }
                self.block_on_dump(process);
                false
            },
            ReturnReason::Exit => {
                self.finalize(process, exit_reason::EXIT);
                false
            },
            ReturnReason::Error => {
                self.finalize(process, exit_reason::ERROR);
                false
            },
        }
    }

    /// Blocks a process that holds no container on the device `params` names, or applies the unavailable-device
    /// policy if there is none.
    pub(super) fn block_on_io(self: &Arc<Self>, process: &ProcessRef, params: &SyscallParams) {
        let pid: Pid = process.pid();
        let requested: &str = params.device.as_deref().unwrap_or_default();
        let duration: u64 = params.duration.unwrap_or(0);
        let (device, handle): (String, Arc<dyn IoDevice>) = match self.devices.resolve(requested) {
            Some(resolved) => resolved,
            None => {
                warn!("({}) - no I/O device available for {:?}", pid, requested);
                self.io_unavailable(process.clone());
                return;
            },
        };

        process.lock().block_reason = Some(format!("IO_{}", device));
        self.enter(process.clone(), ProcessState::Blocked);
        info!("({}) - blocked on {} for {} ms", pid, device, duration);
        self.signal_sts();

        let kernel: Arc<Kernel> = self.clone();
        let waiting: ProcessRef = process.clone();
        let sent = self.spawn_worker("kernel-io-request", move || {
            if let Err(e) = handle.request(pid, duration) {
                warn!("block_on_io(): {} rejected ({}): {}", device, pid, e);
                kernel.abandon_io(&waiting);
            }
            Ok(())
        });
        if let Err(e) = sent {
            warn!("block_on_io(): {}", e);
            self.abandon_io(process);
        }
    }

    /// Takes back a process whose I/O request never reached a device.
    fn abandon_io(&self, process: &ProcessRef) {
        let pid: Pid = process.pid();
        if let Some(process) = self.queues.blocked.remove_where(|p: &ProcessRef| p.pid() == pid) {
            self.suspension.cancel(pid as u64);
            // BLOCKED and READY both hold a permit.
            self.io_unavailable(process);
            return;
        }
        if let Some(process) = self.queues.susp_blocked.remove_where(|p: &ProcessRef| p.pid() == pid) {
            match self.options.io_unavailable_policy {
                IoUnavailablePolicy::Continue => {
                    process.lock().program_counter += 1;
                    self.enter(process, ProcessState::SuspReady);
                },
                IoUnavailablePolicy::Finalize => {
                    self.enter(process.clone(), ProcessState::SuspReady);
                    self.finalize(&process, exit_reason::IO_UNAVAILABLE);
                },
            }
        }
    }

    /// Applies the unavailable-device policy to a resident process that holds no container.
    fn io_unavailable(&self, process: ProcessRef) {
        match self.options.io_unavailable_policy {
            IoUnavailablePolicy::Continue => {
                process.lock().program_counter += 1;
                self.enter(process, ProcessState::Ready);
                self.signal_sts();
            },
            IoUnavailablePolicy::Finalize => {
                // Park it where finalization can find it.
                self.enter(process.clone(), ProcessState::Ready);
                self.finalize(&process, exit_reason::IO_UNAVAILABLE);
            },
        }
    }

    /// Blocks a process that holds no container until memory acknowledges its dump.
    fn block_on_dump(self: &Arc<Self>, process: &ProcessRef) {
        let pid: Pid = process.pid();
        process.lock().block_reason = Some(DUMP_BLOCK_REASON.to_string());
        self.enter(process.clone(), ProcessState::Blocked);
        self.signal_sts();

        let kernel: Arc<Kernel> = self.clone();
        let dumping: ProcessRef = process.clone();
        let spawned = self.spawn_worker("kernel-dump", move || {
            match kernel.memory.dump_process(pid) {
                Ok(()) => {
                    info!("({}) - memory dump finished", pid);
                    kernel.complete_blocking(&dumping);
                },
                Err(e) => {
                    warn!("block_on_dump(): memory could not dump ({}): {}", pid, e);
                    kernel.finalize(&dumping, exit_reason::DUMP_FAILED);
                },
            }
            Ok(())
        });
        if let Err(e) = spawned {
            warn!("block_on_dump(): {}", e);
            self.finalize(process, exit_reason::DUMP_FAILED);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
