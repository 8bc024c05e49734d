// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![allow(dead_code)]


//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::schedkernel::{
    kernel::{
        config::{
            SchedulerOptions,
            TransportOptions,
        },
        pcb::{
            Pid,
            ProcessRef,
        },
        Kernel,
    },
    KernelSnapshot,
    ProcessState,
};
use ::std::{
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};

use self::peers::ScriptedMemory;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Scheduler options for tests: short retry delay, suspension out of the way.
pub fn options() -> SchedulerOptions {
    SchedulerOptions {
        memory_init_retry_delay: Duration::from_millis(1),
        suspension_timeout: Duration::from_secs(60),
        ..Default::default()
    }
}

pub fn boot(options: SchedulerOptions, memory: Arc<ScriptedMemory>) -> Result<Arc<Kernel>> {
    Ok(Kernel::new(options, TransportOptions::default(), memory)?)
}

/// Polls `condition` until it holds or [TEST_TIMEOUT] passes.
pub fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) -> Result<()> {
    let deadline: Instant = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(5));
    }
    anyhow::bail!("timed out waiting for {}", what)
}

pub fn wait_for_state(process: &ProcessRef, state: ProcessState) -> Result<()> {
    let what: String = format!("({}) to reach {}", process.pid(), state);
    wait_until(&what, || process.state() == state)
}

/// Checks that every pid the kernel knows about sits in exactly one container and that permits match residency.
/// Only meaningful while nothing moves.
pub fn check_quiescent(kernel: &Kernel) -> Result<()> {
    let snapshot: KernelSnapshot = kernel.snapshot();
    let mut seen: Vec<Pid> = snapshot.queues.memberships().iter().map(|(pid, _)| *pid).collect();
    let total: usize = seen.len();
    seen.sort_unstable();
    seen.dedup();
    if seen.len() != total {
        anyhow::bail!("a process is held by two containers: {:?}", snapshot.queues);
    }
    if snapshot.permits_outstanding != snapshot.queues.resident() {
        anyhow::bail!(
            "{} permits outstanding for {} resident processes",
            snapshot.permits_outstanding,
            snapshot.queues.resident()
        );
    }
    Ok(())
}
