// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::Receiver;
use ::schedkernel::{
    kernel::{
        config::SchedulerOptions,
        exit_reason,
        pcb::{
            Pid,
            ProcessRef,
        },
        peers::{
            ExecutionUnit,
            ReturnReason,
        },
        policy::{
            AdmissionPolicy,
            DispatchPolicy,
        },
        queues::QueueSnapshot,
        Kernel,
    },
    ProcessState,
};
use ::std::{
    collections::HashSet,
    sync::Arc,
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};
use common::{
    boot,
    check_quiescent,
    options,
    peers::{
        io_request,
        returning,
        spawn,
        QueuedDevice,
        ScriptedCpu,
        ScriptedMemory,
        Step,
    },
    wait_for_state,
    wait_until,
    TEST_TIMEOUT,
};

//======================================================================================================================
// Helpers
//======================================================================================================================

fn with_cpu(kernel: &Kernel, name: &str) -> Arc<ScriptedCpu> {
    let cpu: Arc<ScriptedCpu> = Arc::new(ScriptedCpu::new(name));
    kernel.units().register(cpu.clone());
    cpu
}

fn exit_reason_of(process: &ProcessRef) -> Option<String> {
    process.lock().exit_reason.clone()
}

//======================================================================================================================
// Tests
//======================================================================================================================

#[test]
fn fifo_dispatch_follows_admission_order() -> Result<()> {
    let memory: Arc<ScriptedMemory> = Arc::new(ScriptedMemory::default());
    let kernel: Arc<Kernel> = boot(
        SchedulerOptions {
            multiprogramming: 3,
            ..options()
        },
        memory.clone(),
    )?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");

    let processes: Vec<ProcessRef> = vec![
        kernel.create_process(Some(0), "init", 64)?,
        kernel.create_process(None, "a", 64)?,
        kernel.create_process(None, "b", 64)?,
    ];
    kernel.start()?;
    for process in &processes {
        wait_for_state(process, ProcessState::Exit)?;
    }

    if cpu.first_runs() != vec![0, 1, 2] {
        anyhow::bail!("unexpected dispatch order {:?}", cpu.first_runs());
    }
    // The bootstrap process skips memory initialization.
    if *memory.initialized.lock() != vec![1, 2] {
        anyhow::bail!("unexpected initializations {:?}", memory.initialized.lock());
    }
    check_quiescent(&kernel)?;
    if kernel.gate().outstanding() != 0 {
        anyhow::bail!("every permit should be back");
    }
    kernel.shutdown();
    Ok(())
}

#[test]
fn pmcp_admits_smallest_first() -> Result<()> {
    let memory: Arc<ScriptedMemory> = Arc::new(ScriptedMemory::default());
    let kernel: Arc<Kernel> = boot(
        SchedulerOptions {
            admission_policy: AdmissionPolicy::Pmcp,
            ..options()
        },
        memory.clone(),
    )?;
    with_cpu(&kernel, "CPU1");

    let processes: Vec<ProcessRef> = vec![
        kernel.create_process(Some(1), "large", 300)?,
        kernel.create_process(Some(2), "small", 100)?,
        kernel.create_process(Some(3), "medium", 200)?,
    ];
    kernel.start()?;
    for process in &processes {
        wait_for_state(process, ProcessState::Exit)?;
    }

    if *memory.initialized.lock() != vec![2, 3, 1] {
        anyhow::bail!("admission should go by size: {:?}", memory.initialized.lock());
    }
    kernel.shutdown();
    Ok(())
}

#[test]
fn srt_preempts_the_longer_process() -> Result<()> {
    let memory: Arc<ScriptedMemory> = Arc::new(ScriptedMemory::default());
    let kernel: Arc<Kernel> = boot(
        SchedulerOptions {
            dispatch_policy: DispatchPolicy::Srt,
            multiprogramming: 2,
            initial_estimate: 500.0,
            ..options()
        },
        memory,
    )?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");
    cpu.script(0, vec![Step::Spin]);

    let long: ProcessRef = kernel.create_process(Some(0), "long", 64)?;
    kernel.start()?;
    wait_for_state(&long, ProcessState::Exec)?;

    let short: ProcessRef = kernel.create_process(None, "short", 64)?;
    short.lock().burst_estimate = 50.0;

    wait_for_state(&short, ProcessState::Exit)?;
    wait_for_state(&long, ProcessState::Exit)?;

    if *cpu.interrupt_log.lock() != vec![long.pid()] {
        anyhow::bail!("the long process should be interrupted once: {:?}", cpu.interrupt_log.lock());
    }
    if *cpu.executions.lock() != vec![long.pid(), short.pid(), long.pid()] {
        anyhow::bail!("the short process should run right after the preemption: {:?}", cpu.executions.lock());
    }
    kernel.shutdown();
    Ok(())
}

#[test]
fn permits_follow_residency_through_io() -> Result<()> {
    let memory: Arc<ScriptedMemory> = Arc::new(ScriptedMemory::default());
    let kernel: Arc<Kernel> = boot(
        SchedulerOptions {
            multiprogramming: 2,
            ..options()
        },
        memory.clone(),
    )?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");
    let (device, pending): (QueuedDevice, Receiver<Pid>) = QueuedDevice::new("IODISCO");
    kernel.devices().register(Arc::new(device));

    let mut processes: Vec<ProcessRef> = vec![kernel.create_process(Some(0), "init", 64)?];
    for _ in 0..3 {
        processes.push(kernel.create_process(None, "worker", 64)?);
    }
    for process in &processes {
        cpu.script(process.pid(), vec![io_request("DISCO", 10)]);
    }
    kernel.start()?;

    // Two resident processes end up blocked while the others wait in NEW for a permit.
    wait_until("two blocked and two new", || {
        let queues: QueueSnapshot = kernel.snapshot().queues;
        queues.blocked.len() == 2 && queues.new.len() == 2
    })?;
    check_quiescent(&kernel)?;
    if kernel.gate().outstanding() != 2 {
        anyhow::bail!("blocked processes keep their permits");
    }

    for _ in 0..processes.len() {
        let pid: Pid = pending.recv_timeout(TEST_TIMEOUT)?;
        let process: ProcessRef = match kernel.lookup(pid) {
            Some(process) => process,
            None => anyhow::bail!("({}) vanished while blocked", pid),
        };
        if process.lock().block_reason.as_deref() != Some("IO_IODISCO") {
            anyhow::bail!("block reason should name the device");
        }
        if !kernel.complete_blocking(&process) {
            anyhow::bail!("({}) should be blocked when its request arrives", pid);
        }
    }
    for process in &processes {
        wait_for_state(process, ProcessState::Exit)?;
        if process.lock().program_counter != 1 {
            anyhow::bail!("completion should move past the I/O instruction");
        }
    }

    check_quiescent(&kernel)?;
    if kernel.gate().outstanding() != 0 || kernel.gate().available() != 2 {
        anyhow::bail!("permits leaked");
    }
    if memory.finalized.lock().len() != processes.len() {
        anyhow::bail!("memory should release every process");
    }
    kernel.shutdown();
    Ok(())
}

#[test]
fn exhausted_initialization_finalizes_once() -> Result<()> {
    let memory: Arc<ScriptedMemory> = Arc::new(ScriptedMemory::default());
    let kernel: Arc<Kernel> = boot(options(), memory.clone())?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");
    memory.reject_init(1);

    let init: ProcessRef = kernel.create_process(Some(0), "init", 64)?;
    let doomed: ProcessRef = kernel.create_process(None, "doomed", 64)?;
    kernel.start()?;
    wait_for_state(&doomed, ProcessState::Exit)?;
    wait_for_state(&init, ProcessState::Exit)?;

    if exit_reason_of(&doomed).as_deref() != Some(exit_reason::INIT_FAILED) {
        anyhow::bail!("unexpected exit reason {:?}", exit_reason_of(&doomed));
    }
    if memory.attempts(doomed.pid()) != 5 {
        anyhow::bail!("expected five attempts, got {}", memory.attempts(doomed.pid()));
    }
    if cpu.executions.lock().contains(&doomed.pid()) {
        anyhow::bail!("a process that was never admitted must not run");
    }
    if kernel.gate().outstanding() != 0 || kernel.gate().available() != 1 {
        anyhow::bail!("the permit should be released exactly once");
    }
    check_quiescent(&kernel)?;
    kernel.shutdown();
    Ok(())
}

#[test]
fn long_blocked_process_is_swapped_out_and_back() -> Result<()> {
    let memory: Arc<ScriptedMemory> = Arc::new(ScriptedMemory::default());
    let kernel: Arc<Kernel> = boot(
        SchedulerOptions {
            suspension_timeout: Duration::from_millis(50),
            ..options()
        },
        memory.clone(),
    )?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");
    let (device, pending): (QueuedDevice, Receiver<Pid>) = QueuedDevice::new("IODISCO");
    kernel.devices().register(Arc::new(device));
    cpu.script(0, vec![io_request("DISCO", 1000)]);

    let sleeper: ProcessRef = kernel.create_process(Some(0), "sleeper", 64)?;
    kernel.start()?;
    if pending.recv_timeout(TEST_TIMEOUT)? != sleeper.pid() {
        anyhow::bail!("unexpected I/O request");
    }
    wait_for_state(&sleeper, ProcessState::SuspBlocked)?;
    wait_until("swap out", || memory.suspended.lock().contains(&sleeper.pid()))?;

    // The freed permit admits another process while the first one is swapped out.
    let other: ProcessRef = kernel.create_process(None, "other", 64)?;
    wait_for_state(&other, ProcessState::Exit)?;

    if !kernel.complete_blocking(&sleeper) {
        anyhow::bail!("I/O completion should reach a swapped out process");
    }
    wait_for_state(&sleeper, ProcessState::Exit)?;
    if *memory.resumed.lock() != vec![sleeper.pid()] {
        anyhow::bail!("process should be swapped back in before running");
    }
    check_quiescent(&kernel)?;
    kernel.shutdown();
    Ok(())
}

#[test]
fn rejected_resume_is_retried_without_leaking_permits() -> Result<()> {
    let memory: Arc<ScriptedMemory> = Arc::new(ScriptedMemory::default());
    let kernel: Arc<Kernel> = boot(
        SchedulerOptions {
            suspension_timeout: Duration::from_millis(50),
            ..options()
        },
        memory.clone(),
    )?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");
    let (device, pending): (QueuedDevice, Receiver<Pid>) = QueuedDevice::new("IODISCO");
    kernel.devices().register(Arc::new(device));
    cpu.script(0, vec![io_request("DISCO", 1000)]);
    memory.reject_resume(0, 2);

    let sleeper: ProcessRef = kernel.create_process(Some(0), "sleeper", 64)?;
    kernel.start()?;
    if pending.recv_timeout(TEST_TIMEOUT)? != sleeper.pid() {
        anyhow::bail!("unexpected I/O request");
    }
    wait_for_state(&sleeper, ProcessState::SuspBlocked)?;
    if !kernel.complete_blocking(&sleeper) {
        anyhow::bail!("I/O completion should reach a swapped out process");
    }

    // Between retries the process waits in SUSP_READY without a permit.
    wait_until("a rejected resume", || {
        memory.resumes_attempted(sleeper.pid()) >= 1
            && sleeper.state() == ProcessState::SuspReady
            && kernel.gate().outstanding() == 0
            && check_quiescent(&kernel).is_ok()
    })?;

    wait_for_state(&sleeper, ProcessState::Exit)?;
    if memory.resumes_attempted(sleeper.pid()) != 3 || *memory.resumed.lock() != vec![sleeper.pid()] {
        anyhow::bail!("resume should succeed on the third attempt");
    }
    check_quiescent(&kernel)?;
    if kernel.gate().outstanding() != 0 {
        anyhow::bail!("every permit should be back");
    }
    kernel.shutdown();
    Ok(())
}

#[test]
fn swapped_out_process_takes_the_permit_before_new_ones() -> Result<()> {
    let memory: Arc<ScriptedMemory> = Arc::new(ScriptedMemory::default());
    let kernel: Arc<Kernel> = boot(
        SchedulerOptions {
            suspension_timeout: Duration::from_millis(50),
            ..options()
        },
        memory.clone(),
    )?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");
    let (device, pending): (QueuedDevice, Receiver<Pid>) = QueuedDevice::new("IODISCO");
    kernel.devices().register(Arc::new(device));
    cpu.script(0, vec![io_request("DISCO", 1000), Step::Spin]);
    cpu.script(1, vec![Step::Spin]);

    let sleeper: ProcessRef = kernel.create_process(Some(0), "sleeper", 64)?;
    kernel.start()?;
    if pending.recv_timeout(TEST_TIMEOUT)? != sleeper.pid() {
        anyhow::bail!("unexpected I/O request");
    }
    wait_for_state(&sleeper, ProcessState::SuspBlocked)?;

    // A second process takes the only permit and keeps the unit busy.
    let holder: ProcessRef = kernel.create_process(Some(1), "holder", 64)?;
    wait_for_state(&holder, ProcessState::Exec)?;

    // Both a swapped out and a new process now wait for the permit.
    if !kernel.complete_blocking(&sleeper) {
        anyhow::bail!("I/O completion should reach a swapped out process");
    }
    let newcomer: ProcessRef = kernel.create_process(Some(2), "newcomer", 64)?;
    cpu.interrupt(holder.pid())?;
    wait_for_state(&holder, ProcessState::Exit)?;

    wait_for_state(&sleeper, ProcessState::Exec)?;
    if newcomer.state() != ProcessState::New || memory.attempts(newcomer.pid()) != 0 {
        anyhow::bail!("the swapped out process should be admitted first");
    }
    cpu.interrupt(sleeper.pid())?;
    wait_for_state(&sleeper, ProcessState::Exit)?;
    wait_for_state(&newcomer, ProcessState::Exit)?;
    check_quiescent(&kernel)?;
    kernel.shutdown();
    Ok(())
}

#[test]
fn unreachable_unit_is_not_a_process_fault() -> Result<()> {
    let kernel: Arc<Kernel> = boot(options(), Arc::new(ScriptedMemory::default()))?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");
    cpu.script(0, vec![Step::Unreachable]);

    let process: ProcessRef = kernel.create_process(Some(0), "init", 64)?;
    kernel.start()?;
    wait_for_state(&process, ProcessState::Exit)?;
    if exit_reason_of(&process).as_deref() != Some(exit_reason::EXIT) || cpu.executions.lock().len() != 2 {
        anyhow::bail!("process should be dispatched again and exit normally");
    }
    kernel.shutdown();
    Ok(())
}

#[test]
fn unit_reported_error_finalizes() -> Result<()> {
    let kernel: Arc<Kernel> = boot(options(), Arc::new(ScriptedMemory::default()))?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");
    cpu.script(0, vec![returning(ReturnReason::Error)]);

    let process: ProcessRef = kernel.create_process(Some(0), "init", 64)?;
    kernel.start()?;
    wait_for_state(&process, ProcessState::Exit)?;
    if exit_reason_of(&process).as_deref() != Some(exit_reason::ERROR) {
        anyhow::bail!("unexpected exit reason {:?}", exit_reason_of(&process));
    }
    kernel.shutdown();
    Ok(())
}

#[test]
fn memory_dump_blocks_until_acknowledged() -> Result<()> {
    let memory: Arc<ScriptedMemory> = Arc::new(ScriptedMemory::default());
    let kernel: Arc<Kernel> = boot(options(), memory.clone())?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");
    cpu.script(0, vec![returning(ReturnReason::SyscallDumpMemory)]);

    let process: ProcessRef = kernel.create_process(Some(0), "init", 64)?;
    kernel.start()?;
    wait_for_state(&process, ProcessState::Exit)?;
    if *memory.dumped.lock() != vec![process.pid()] || cpu.executions.lock().len() != 2 {
        anyhow::bail!("process should dump once and then run again");
    }
    if process.lock().metrics(ProcessState::Blocked).count != 1 {
        anyhow::bail!("dump should block the process once");
    }
    kernel.shutdown();
    Ok(())
}

#[test]
fn spawned_processes_go_through_admission() -> Result<()> {
    let memory: Arc<ScriptedMemory> = Arc::new(ScriptedMemory::default());
    let kernel: Arc<Kernel> = boot(options(), memory.clone())?;
    let cpu: Arc<ScriptedCpu> = with_cpu(&kernel, "CPU1");
    cpu.script(0, vec![spawn("child", 32)]);

    let parent: ProcessRef = kernel.create_process(Some(0), "init", 64)?;
    kernel.start()?;
    wait_for_state(&parent, ProcessState::Exit)?;
    wait_until("child exit", || kernel.snapshot().queues.exit.contains(&1))?;

    if *memory.initialized.lock() != vec![1] {
        anyhow::bail!("child should be initialized in memory");
    }
    if cpu.executions.lock().iter().filter(|pid| **pid == 0).count() != 2 {
        anyhow::bail!("parent should keep running after the spawn");
    }
    kernel.shutdown();
    Ok(())
}

#[test]
fn pids_are_unique_under_contention() -> Result<()> {
    let kernel: Arc<Kernel> = boot(options(), Arc::new(ScriptedMemory::default()))?;
    let mut creators: Vec<JoinHandle<Vec<Pid>>> = Vec::new();
    for _ in 0..4 {
        let kernel: Arc<Kernel> = kernel.clone();
        creators.push(thread::spawn(move || {
            (0..25)
                .filter_map(|_| kernel.create_process(None, "p", 8).ok())
                .map(|process| process.pid())
                .collect()
        }));
    }
    let mut pids: HashSet<Pid> = HashSet::new();
    for creator in creators {
        let created: Vec<Pid> = creator.join().map_err(|_| anyhow::anyhow!("creator panicked"))?;
        if created.windows(2).any(|w| w[0] >= w[1]) {
            anyhow::bail!("pids should grow in allocation order: {:?}", created);
        }
        pids.extend(created);
    }
    if pids.len() != 100 {
        anyhow::bail!("expected 100 distinct pids, got {}", pids.len());
    }
    if kernel.create_process(Some(7), "dup", 8).is_ok() {
        anyhow::bail!("a live pid must not be reused");
    }
    kernel.shutdown();
    Ok(())
}
