// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kernel::{
        exec,
        pcb::{
            Pid,
            ProcessRef,
            ProcessState,
        },
        peers::ExecutionUnit,
        policy,
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
// Standalone Functions
//======================================================================================================================

/// Dispatch scheduler loop. Returns when the kernel shuts down.
pub fn run(kernel: &Arc<Kernel>) -> Result<(), Fail> {
    loop {
        if kernel.is_shutting_down() {
            return Ok(());
        }
        if !kernel.queues.ready.wait_non_empty(limits::QUEUE_WAIT_SLICE)? {
            continue;
        }
        if kernel.dispatch.is_preemptive() && kernel.try_preempt() {
            thread::sleep(limits::PREEMPTION_BACKOFF);
            continue;
        }
        let unit: String = match kernel.queues.exec.first_free(&kernel.units.names()) {
            Some(unit) => unit,
            None => {
                thread::sleep(limits::CPU_POLL_BACKOFF);
                continue;
            },
        };
        kernel.dispatch_to(&unit)?;
    }
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Kernel {
    /// Asks a running process to give its unit back when the best READY candidate is strictly shorter. Returns true
    /// if a preemption is in flight.
    fn try_preempt(self: &Arc<Self>) -> bool {
        let decision: Option<(Pid, String, Pid)> = self.queues.ready.with(|ready: &mut Vec<ProcessRef>| {
            let candidate: ProcessRef = ready.get(self.dispatch.select(ready)?)?.clone();
            let estimate: f64 = candidate.burst_estimate();
            let exec = self.queues.exec.lock();
            let running: Vec<(String, Pid, f64)> = exec
                .iter()
                .map(|(unit, process)| (unit.clone(), process.pid(), process.burst_estimate()))
                .collect();
            let (unit, victim) = policy::preemption_victim(estimate, &running)?;
            Some((candidate.pid(), unit, victim))
        });
        let (pid, unit, victim): (Pid, String, Pid) = match decision {
            Some(decision) => decision,
            None => return false,
        };

        if !self.pending_interrupts.lock().insert(victim) {
            // Already asked. Wait for it to come back.
            return true;
        }
        info!("({}) - preempted by SRT for ({})", victim, pid);
        let target: Arc<dyn ExecutionUnit> = match self.units.get(&unit) {
            Some(target) => target,
            None => {
                self.pending_interrupts.lock().remove(&victim);
                return false;
            },
        };
        let kernel: Arc<Kernel> = self.clone();
        let sent = self.spawn_worker("kernel-interrupt", move || {
            if let Err(e) = target.interrupt(victim) {
                warn!("try_preempt(): {} did not accept interrupt for ({}): {}", unit, victim, e);
                kernel.pending_interrupts.lock().remove(&victim);
            }
            Ok(())
        });
        if let Err(e) = sent {
            warn!("try_preempt(): {}", e);
            self.pending_interrupts.lock().remove(&victim);
            return false;
        }
        true
    }

    /// Moves the READY process the dispatch policy picks onto `unit` and starts its execution worker.
    fn dispatch_to(self: &Arc<Self>, unit: &str) -> Result<(), Fail> {
        let chosen: Option<ProcessRef> = self.queues.ready.with(|ready: &mut Vec<ProcessRef>| {
            let index: usize = self.dispatch.select(ready)?;
            let mut exec = self.queues.exec.lock();
            if exec.contains_key(unit) {
                return None;
            }
            let process: ProcessRef = ready.remove(index);
            process.lock().transition(ProcessState::Exec, self.options.alpha);
            exec.insert(unit.to_string(), process.clone());
            Some(process)
        });
        let process: ProcessRef = match chosen {
            Some(process) => process,
            None => return Ok(()),
        };
        let pid: Pid = process.pid();

        let target: Arc<dyn ExecutionUnit> = match self.units.get(unit) {
            Some(target) => target,
            None => {
                warn!("dispatch_to(): unit {} disappeared, returning ({}) to READY", unit, pid);
                if self.take_exec(pid).is_some() {
                    self.enter(process, ProcessState::Ready);
                }
                return Ok(());
            },
        };
        info!("({}) - dispatched to {}", pid, unit);
        let kernel: Arc<Kernel> = self.clone();
        let name: String = format!("kernel-exec-{}", pid);
        self.spawn_worker(&name, move || exec::run(&kernel, process, target))?;
        Ok(())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
