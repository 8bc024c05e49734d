// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kernel::{
        config::TransportOptions,
        exit_reason,
        io::DEVICE_PREFIX,
        pcb::{
            Pid,
            ProcessRef,
            ProcessState,
        },
        peers::{
            CpuReply,
            RemoteCpu,
            RemoteIoDevice,
            ReturnReason,
            SyscallParams,
            KERNEL_ORIGIN,
        },
        Kernel,
    },
    runtime::{
        fail::Fail,
        network::{
            message::operation,
            Handler,
            Message,
            MessageKind,
            PeerClient,
            Response,
        },
    },
};
use ::serde::Deserialize;
use ::serde_json::Value;
use ::std::{
    str::FromStr,
    sync::Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Handshake kind announced by execution units.
const CPU_KIND: &str = "CPU";

/// Inbound event names.
mod event_name {
    pub const IO_REQUESTED: &str = "SOLICITUD_IO";
    pub const IO_FINISHED: &str = "IO_TERMINADA";
    pub const IO_FINISHED_ALT: &str = "IO_COMPLETADA";
    pub const PROCESS_FINISHED: &str = "PROCESO_TERMINADO";
}

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Handshake {
    #[serde(alias = "tipo")]
    kind: String,
    ip: Option<String>,
    #[serde(alias = "puerto")]
    port: Option<u16>,
    #[serde(alias = "nombre")]
    name: Option<String>,
    #[serde(alias = "identificador")]
    id: Option<Value>,
}

/// Payload of an inbound operation: a CPU return, an I/O lifecycle event or a termination event.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Event {
    pid: Option<Pid>,
    #[serde(alias = "pc")]
    program_counter: Option<u64>,
    #[serde(alias = "motivo_retorno")]
    return_reason: Option<String>,
    #[serde(alias = "evento")]
    event: Option<String>,
    #[serde(alias = "operacion")]
    operation: Option<String>,
    #[serde(alias = "parametros")]
    params: Option<SyscallParams>,
    #[serde(alias = "motivo")]
    reason: Option<String>,
    #[serde(flatten)]
    inline: SyscallParams,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Builds the server callback for `kernel`.
pub fn handler(kernel: Arc<Kernel>) -> Handler {
    Arc::new(move |message: Message| handle(&kernel, message))
}

/// Serves one inbound request. Failures become an ERROR response and leave the kernel untouched.
pub fn handle(kernel: &Arc<Kernel>, message: Message) -> Response {
    let result: Result<Response, Fail> = match message.kind {
        MessageKind::Handshake => handshake(kernel, &message),
        MessageKind::Operation => dispatch_event(kernel, &message),
    };
    match result {
        Ok(response) => response,
        Err(e) => {
            warn!("handle(): {} from {}: {}", message.operation, message.origin, e);
            Response::error(&e.cause)
        },
    }
}

fn handshake(kernel: &Arc<Kernel>, message: &Message) -> Result<Response, Fail> {
    let hello: Handshake = message.decode()?;
    let name: Option<String> = hello.name.clone().filter(|name| !name.is_empty());
    let is_cpu: bool = hello.kind == CPU_KIND || message.origin == CPU_KIND || name.as_deref() == Some(CPU_KIND);
    let is_io: bool = hello.kind.starts_with(DEVICE_PREFIX);
    if !is_cpu && !is_io {
        debug!("handshake(): {} introduced itself", message.origin);
        return Ok(Response::ok());
    }

    let client: PeerClient = match (hello.ip.as_deref(), hello.port) {
        (Some(ip), Some(port)) if !ip.is_empty() => {
            let transport: TransportOptions = kernel.transport();
            PeerClient::resolve(KERNEL_ORIGIN, ip, port)?
                .with_timeouts(transport.connect_timeout, transport.request_timeout)
        },
        _ => return Err(Fail::new(libc::EINVAL, "incomplete handshake")),
    };

    if is_cpu {
        let unit: String = match &hello.id {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => format!("{}{}", CPU_KIND, id),
            _ => message.origin.clone(),
        };
        kernel.units.register(Arc::new(RemoteCpu::new(&unit, client)));
        kernel.signal_sts();
    } else {
        let device: String = match name {
            Some(name) if hello.kind == DEVICE_PREFIX => format!("{}{}", DEVICE_PREFIX, name),
            _ => hello.kind.clone(),
        };
        kernel.devices.register(Arc::new(RemoteIoDevice::new(&device, client)));
    }
    Ok(Response::ok())
}

fn dispatch_event(kernel: &Arc<Kernel>, message: &Message) -> Result<Response, Fail> {
    let event: Event = message.decode()?;
    let pid: Pid = match event.pid {
        Some(pid) => pid,
        None => return Err(Fail::new(libc::EINVAL, "missing pid")),
    };
    let process: ProcessRef = match kernel.lookup(pid) {
        Some(process) => process,
        None => {
            let cause: String = format!("unknown process ({})", pid);
            return Err(Fail::new(libc::ENOENT, &cause));
        },
    };

    let name: Option<&str> = event.event.as_deref().or(event.operation.as_deref());
    let io_finished: bool = message.operation == operation::IO_COMPLETED
        || matches!(
            name,
            Some(event_name::IO_FINISHED) | Some(event_name::IO_FINISHED_ALT) | Some(operation::IO_COMPLETED)
        );
    if io_finished {
        if !kernel.complete_blocking(&process) {
            let cause: String = format!("({}) is not blocked", pid);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        info!("({}) - I/O finished", pid);
        return Ok(Response::ok());
    }

    let params: SyscallParams = event.params.clone().unwrap_or_else(|| event.inline.clone());
    if let Some(reason) = event.return_reason.as_deref().filter(|reason| !reason.is_empty()) {
        let reply: CpuReply =
            CpuReply::new(event.program_counter, Some(ReturnReason::from_str(reason)?)).with_params(params);
        kernel.handle_return(&process, reply);
        return Ok(Response::ok());
    }

    match name {
        Some(event_name::IO_REQUESTED) => {
            if kernel.take_exec(pid).is_none() {
                let cause: String = format!("({}) is not running", pid);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
            if let Some(pc) = event.program_counter {
                process.lock().program_counter = pc;
            }
            kernel.block_on_io(&process, &params);
            Ok(Response::ok())
        },
        Some(event_name::PROCESS_FINISHED) => {
            let reason: &str = event.reason.as_deref().unwrap_or(exit_reason::EXIT);
            kernel.finalize(&process, reason);
            Ok(Response::ok())
        },
        _ => {
            let cause: String = format!("unknown operation {:?}", message.operation);
            Err(Fail::new(libc::EINVAL, &cause))
        },
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
