// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kernel::pcb::Pid,
    runtime::{
        fail::Fail,
        network::{
            message::operation,
            Message,
            PeerClient,
            Response,
            Status,
        },
    },
};
use ::parking_lot::RwLock;
use ::serde::Deserialize;
use ::serde_json::{
    json,
    Value,
};
use ::std::{
    collections::BTreeMap,
    str::FromStr,
    sync::Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Origin stamped on every request the kernel sends.
pub const KERNEL_ORIGIN: &str = "KERNEL";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Why an execution unit gave a process back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnReason {
    SyscallIo,
    SyscallInitProc,
    SyscallDumpMemory,
    Exit,
    Error,
    Interrupted,
}

/// Arguments attached to a syscall return.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyscallParams {
    #[serde(alias = "dispositivo", alias = "nombre_dispositivo")]
    pub device: Option<String>,
    #[serde(alias = "tiempo", alias = "tiempo_bloqueo")]
    pub duration: Option<u64>,
    #[serde(alias = "archivo")]
    pub program: Option<String>,
    #[serde(alias = "tamano", alias = "tamanio")]
    pub size: Option<u64>,
}

/// Answer of an execution unit to `EXECUTE`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuReply {
    /// Counter reported by the unit, if any.
    pub program_counter: Option<u64>,
    pub reason: Option<ReturnReason>,
    pub params: SyscallParams,
}

#[derive(Deserialize)]
struct CpuReplyFields {
    #[serde(default, alias = "pc")]
    program_counter: Option<u64>,
    #[serde(default, alias = "motivo_retorno")]
    return_reason: Option<String>,
    #[serde(default, alias = "parametros")]
    params: Option<SyscallParams>,
}

/// Memory manager operations used by the schedulers.
pub trait MemoryService: Send + Sync {
    fn init_process(&self, pid: Pid, size: u64, program: &str) -> Result<(), Fail>;
    fn finalize_process(&self, pid: Pid) -> Result<(), Fail>;
    /// Swaps the process out.
    fn suspend_process(&self, pid: Pid) -> Result<(), Fail>;
    /// Swaps the process back in.
    fn resume_process(&self, pid: Pid) -> Result<(), Fail>;
    fn dump_process(&self, pid: Pid) -> Result<(), Fail>;
}

/// A CPU that runs processes on behalf of the kernel.
pub trait ExecutionUnit: Send + Sync {
    fn name(&self) -> &str;
    /// Runs `pid` from `program_counter` until the unit gives it back.
    fn execute(&self, pid: Pid, program_counter: u64) -> Result<CpuReply, Fail>;
    /// Asks the unit to give `pid` back as soon as possible.
    fn interrupt(&self, pid: Pid) -> Result<(), Fail>;
}

/// An I/O device. Completion is reported later through an inbound `IO_COMPLETED` event.
pub trait IoDevice: Send + Sync {
    fn name(&self) -> &str;
    fn request(&self, pid: Pid, duration_ms: u64) -> Result<(), Fail>;
}

pub struct RemoteMemory {
    client: PeerClient,
}

pub struct RemoteCpu {
    name: String,
    client: PeerClient,
}

pub struct RemoteIoDevice {
    name: String,
    client: PeerClient,
}

/// Execution units known to the kernel, keyed and ordered by name.
pub struct UnitRegistry {
    units: RwLock<BTreeMap<String, Arc<dyn ExecutionUnit>>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl CpuReply {
    pub fn new(program_counter: Option<u64>, reason: Option<ReturnReason>) -> Self {
        Self {
            program_counter,
            reason,
            params: SyscallParams::default(),
        }
    }

    pub fn with_params(mut self, params: SyscallParams) -> Self {
        self.params = params;
        self
    }

    /// Decodes an `EXECUTE` response. An ERROR status is an execution fault of the process.
    pub fn from_response(response: Response) -> Result<Self, Fail> {
        if response.status == Status::Error {
            warn!("from_response(): unit reported an error: {}", response.message());
            return Ok(Self::new(None, Some(ReturnReason::Error)));
        }
        let fields: CpuReplyFields = serde_json::from_value(Value::Object(response.fields))?;
        let reason: Option<ReturnReason> = match fields.return_reason.as_deref() {
            None | Some("") => None,
            Some(reason) => Some(ReturnReason::from_str(reason)?),
        };
        Ok(Self {
            program_counter: fields.program_counter,
            reason,
            params: fields.params.unwrap_or_default(),
        })
    }
}

impl RemoteMemory {
    pub fn new(client: PeerClient) -> Self {
        Self { client }
    }

    fn call(&self, op: &str, payload: Value) -> Result<(), Fail> {
        let message: Message = Message::operation(KERNEL_ORIGIN, op, payload);
        self.client.request(&message)?.into_result()?;
        Ok(())
    }
}

impl RemoteCpu {
    pub fn new(name: &str, client: PeerClient) -> Self {
        Self {
            name: name.to_string(),
            client,
        }
    }
}

impl RemoteIoDevice {
    pub fn new(name: &str, client: PeerClient) -> Self {
        Self {
            name: name.to_string(),
            client,
        }
    }
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self {
            units: RwLock::new(BTreeMap::new()),
        }
    }

    /// Adds `unit`, replacing a previous registration under the same name.
    pub fn register(&self, unit: Arc<dyn ExecutionUnit>) {
        let name: String = unit.name().to_string();
        if self.units.write().insert(name.clone(), unit).is_some() {
            info!("execution unit {} re-registered", name);
        } else {
            info!("execution unit {} registered", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutionUnit>> {
        self.units.read().get(name).cloned()
    }

    /// Registered names in ascending order.
    pub fn names(&self) -> Vec<String> {
        self.units.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl FromStr for ReturnReason {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYSCALL_IO" | "IO_REQUEST" => Ok(ReturnReason::SyscallIo),
            "SYSCALL_INIT_PROC" => Ok(ReturnReason::SyscallInitProc),
            "SYSCALL_DUMP_MEMORY" => Ok(ReturnReason::SyscallDumpMemory),
            "EXIT" => Ok(ReturnReason::Exit),
            "ERROR" => Ok(ReturnReason::Error),
            "INTERRUPTED" => Ok(ReturnReason::Interrupted),
            _ => {
                let cause: String = format!("unknown return reason {:?}", s);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }
}

impl MemoryService for RemoteMemory {
    fn init_process(&self, pid: Pid, size: u64, program: &str) -> Result<(), Fail> {
        self.call(
            operation::INIT_PROCESS,
            json!({"pid": pid, "size": size, "program": program}),
        )
    }

    fn finalize_process(&self, pid: Pid) -> Result<(), Fail> {
        self.call(operation::FINALIZE_PROCESS, json!({ "pid": pid }))
    }

    fn suspend_process(&self, pid: Pid) -> Result<(), Fail> {
        self.call(operation::SUSPEND_PROCESS, json!({ "pid": pid }))
    }

    fn resume_process(&self, pid: Pid) -> Result<(), Fail> {
        self.call(operation::RESUME_PROCESS, json!({ "pid": pid }))
    }

    fn dump_process(&self, pid: Pid) -> Result<(), Fail> {
        self.call(operation::DUMP_MEMORY, json!({ "pid": pid }))
    }
}

impl ExecutionUnit for RemoteCpu {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, pid: Pid, program_counter: u64) -> Result<CpuReply, Fail> {
        let message: Message = Message::operation(
            KERNEL_ORIGIN,
            operation::EXECUTE,
            json!({"pid": pid, "pc": program_counter}),
        );
        CpuReply::from_response(self.client.request(&message)?)
    }

    /// Sends `INTERRUPT` without a payload. `pid` is only logged.
    fn interrupt(&self, pid: Pid) -> Result<(), Fail> {
        trace!("interrupt(): ({}) on {}", pid, self.name);
        let message: Message = Message::operation(KERNEL_ORIGIN, operation::INTERRUPT, Value::Null);
        self.client.request(&message)?.into_result()?;
        Ok(())
    }
}

impl IoDevice for RemoteIoDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn request(&self, pid: Pid, duration_ms: u64) -> Result<(), Fail> {
        let message: Message = Message::operation(
            KERNEL_ORIGIN,
            operation::IO_REQUEST,
            json!({"pid": pid, "duration": duration_ms}),
        );
        self.client.request(&message)?.into_result()?;
        Ok(())
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
