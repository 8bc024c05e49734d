// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::parking_lot::Mutex;
use ::schedkernel::{
    kernel::{
        config::TransportOptions,
        exit_reason,
        handlers,
        pcb::{
            Pid,
            ProcessRef,
        },
        peers::{
            ExecutionUnit,
            MemoryService,
            RemoteCpu,
            RemoteMemory,
            KERNEL_ORIGIN,
        },
        Kernel,
    },
    runtime::network::{
        message::operation,
        Handler,
        Message,
        PeerClient,
        Response,
        Server,
        Status,
    },
    ProcessState,
};
use ::serde_json::{
    json,
    Value,
};
use ::std::{
    collections::HashSet,
    io::{
        BufRead,
        BufReader,
        Write,
    },
    net::{
        SocketAddr,
        TcpListener,
        TcpStream,
    },
    sync::Arc,
    thread,
    time::Duration,
};
use common::{
    options,
    wait_for_state,
    wait_until,
};

//======================================================================================================================
// Helpers
//======================================================================================================================

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn serve<F>(f: F) -> Result<Server>
where
    F: Fn(Message) -> Response + Send + Sync + 'static,
{
    let handler: Handler = Arc::new(f);
    Ok(Server::start(loopback(), handler)?)
}

fn client(server: &Server) -> PeerClient {
    PeerClient::new("TEST", server.local_addr()).with_timeouts(Duration::from_secs(1), Duration::from_secs(5))
}

/// Memory manager that accepts everything and remembers what it was asked.
fn memory_server(log: Arc<Mutex<Vec<(String, Pid)>>>) -> Result<Server> {
    serve(move |message: Message| {
        let pid: Pid = message.payload.get("pid").and_then(Value::as_u64).unwrap_or(u64::MAX) as Pid;
        log.lock().push((message.operation.clone(), pid));
        Response::ok()
    })
}

//======================================================================================================================
// Tests
//======================================================================================================================

#[test]
fn request_gets_one_response() -> Result<()> {
    let server: Server = serve(|message: Message| Response::ok().with("echo", message.operation))?;
    let response: Response = client(&server).request(&Message::operation("TEST", "PING", json!({})))?;
    if !response.is_ok() || response.field::<String>("echo").as_deref() != Some("PING") {
        anyhow::bail!("unexpected response {:?}", response);
    }
    server.stop();
    Ok(())
}

#[test]
fn malformed_line_is_answered_with_error() -> Result<()> {
    let server: Server = serve(|_| Response::ok())?;
    let mut stream: TcpStream = TcpStream::connect(server.local_addr())?;
    stream.write_all(b"this is not json\n")?;
    let mut line: String = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    let response: Response = serde_json::from_str(&line)?;
    if response.status != Status::Error || !response.message().contains("malformed") {
        anyhow::bail!("unexpected response {:?}", response);
    }
    server.stop();
    Ok(())
}

#[test]
fn rejection_and_transport_faults_differ() -> Result<()> {
    let server: Server = serve(|_| Response::error("no memory"))?;
    let memory: RemoteMemory = RemoteMemory::new(client(&server));
    match memory.init_process(1, 64, "prog") {
        Err(e) if e.errno == libc::EACCES && !e.is_transport() => (),
        other => anyhow::bail!("expected a rejection, got {:?}", other),
    }
    server.stop();

    // Grab a port nobody listens on.
    let closed: SocketAddr = TcpListener::bind(loopback())?.local_addr()?;
    let memory: RemoteMemory = RemoteMemory::new(PeerClient::new("TEST", closed));
    match memory.init_process(1, 64, "prog") {
        Err(e) if e.is_transport() => Ok(()),
        other => anyhow::bail!("expected a transport fault, got {:?}", other),
    }
}

#[test]
fn interrupt_has_no_payload() -> Result<()> {
    let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let log: Arc<Mutex<Vec<(String, Value)>>> = seen.clone();
    let cpu: Server = serve(move |message: Message| {
        log.lock().push((message.operation.clone(), message.payload.clone()));
        Response::ok()
    })?;
    let unit: RemoteCpu = RemoteCpu::new("CPU1", client(&cpu));
    unit.interrupt(7)?;
    let expected: Vec<(String, Value)> = vec![(operation::INTERRUPT.to_string(), Value::Null)];
    if *seen.lock() != expected {
        anyhow::bail!("unexpected interrupt traffic {:?}", seen.lock());
    }
    cpu.stop();
    Ok(())
}

#[test]
fn handshaken_cpu_runs_processes_end_to_end() -> Result<()> {
    let memory_log: Arc<Mutex<Vec<(String, Pid)>>> = Arc::new(Mutex::new(Vec::new()));
    let memory: Server = memory_server(memory_log.clone())?;
    let cpu: Server = serve(|message: Message| match message.operation.as_str() {
        operation::EXECUTE => Response::ok()
            .with("pid", message.payload["pid"].clone())
            .with("motivo_retorno", "EXIT"),
        _ => Response::ok(),
    })?;

    let transport: TransportOptions = TransportOptions::default();
    let memory_client: Arc<dyn MemoryService> = Arc::new(RemoteMemory::new(PeerClient::new(
        KERNEL_ORIGIN,
        memory.local_addr(),
    )));
    let kernel: Arc<Kernel> = Kernel::new(options(), transport, memory_client)?;
    let server: Server = Server::start(loopback(), handlers::handler(kernel.clone()))?;

    let hello: Message = Message::handshake(
        "CPU",
        json!({"tipo": "CPU", "ip": "127.0.0.1", "puerto": cpu.local_addr().port(), "identificador": "CPU1"}),
    );
    client(&server).request(&hello)?.into_result()?;
    if kernel.units().names() != vec!["CPU1"] {
        anyhow::bail!("CPU should be registered by its handshake");
    }

    let init: ProcessRef = kernel.create_process(Some(0), "init", 64)?;
    let child: ProcessRef = kernel.create_process(None, "child", 64)?;
    kernel.start()?;
    wait_for_state(&init, ProcessState::Exit)?;
    wait_for_state(&child, ProcessState::Exit)?;

    let log: Vec<(String, Pid)> = memory_log.lock().clone();
    let expected: Vec<(String, Pid)> = vec![
        (operation::INIT_PROCESS.to_string(), child.pid()),
        (operation::FINALIZE_PROCESS.to_string(), child.pid()),
    ];
    if !expected.iter().all(|entry| log.contains(entry)) {
        anyhow::bail!("unexpected memory traffic {:?}", log);
    }
    if log.contains(&(operation::INIT_PROCESS.to_string(), init.pid())) {
        anyhow::bail!("bootstrap process should skip memory initialization");
    }

    kernel.shutdown();
    server.stop();
    cpu.stop();
    memory.stop();
    Ok(())
}

#[test]
fn io_completion_arrives_as_an_event() -> Result<()> {
    let memory: Server = memory_server(Arc::new(Mutex::new(Vec::new())))?;
    let memory_client: Arc<dyn MemoryService> = Arc::new(RemoteMemory::new(PeerClient::new(
        KERNEL_ORIGIN,
        memory.local_addr(),
    )));
    let kernel: Arc<Kernel> = Kernel::new(options(), TransportOptions::default(), memory_client)?;
    let server: Server = Server::start(loopback(), handlers::handler(kernel.clone()))?;
    let kernel_addr: SocketAddr = server.local_addr();

    // First EXECUTE of each pid asks for the disk, the second one exits.
    let asked: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
    let cpu: Server = serve(move |message: Message| {
        let pid: u64 = message.payload["pid"].as_u64().unwrap_or_default();
        if message.operation != operation::EXECUTE {
            return Response::ok();
        }
        if asked.lock().insert(pid) {
            Response::ok()
                .with("pid", pid)
                .with("motivo_retorno", "SYSCALL_IO")
                .with("parametros", json!({"dispositivo": "DISCO", "tiempo": 20}))
        } else {
            Response::ok().with("pid", pid).with("motivo_retorno", "EXIT")
        }
    })?;
    // The device acknowledges at once and reports completion a little later.
    let disk: Server = serve(move |message: Message| {
        let pid: Value = message.payload["pid"].clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let payload: Value = json!({"pid": pid, "evento": "IO_TERMINADA"});
            let done: Message = Message::operation("IODISCO", operation::DEFAULT, payload);
            let _ = PeerClient::new("IODISCO", kernel_addr).request(&done);
        });
        Response::ok()
    })?;

    for (kind, port) in [("CPU", cpu.local_addr().port()), ("IODISCO", disk.local_addr().port())] {
        let hello: Message = Message::handshake(kind, json!({"tipo": kind, "ip": "127.0.0.1", "puerto": port}));
        client(&server).request(&hello)?.into_result()?;
    }

    let process: ProcessRef = kernel.create_process(Some(0), "init", 64)?;
    kernel.start()?;
    wait_until("the I/O round trip", || process.lock().metrics(ProcessState::Blocked).count == 1)?;
    wait_for_state(&process, ProcessState::Exit)?;
    if process.lock().exit_reason.as_deref() != Some(exit_reason::EXIT) || process.lock().program_counter != 1 {
        anyhow::bail!("process should finish normally past its I/O");
    }

    kernel.shutdown();
    server.stop();
    cpu.stop();
    disk.stop();
    memory.stop();
    Ok(())
}
