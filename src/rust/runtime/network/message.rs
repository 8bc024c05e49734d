// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};
use ::serde_json::{
    Map,
    Value,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Operation names carried in [Message::operation].
pub mod operation {
    pub const HANDSHAKE: &str = "HANDSHAKE";
    pub const INIT_PROCESS: &str = "INIT_PROCESS";
    pub const FINALIZE_PROCESS: &str = "FINALIZE_PROCESS";
    pub const SUSPEND_PROCESS: &str = "SUSPEND_PROCESS";
    pub const RESUME_PROCESS: &str = "RESUME_PROCESS";
    pub const DUMP_MEMORY: &str = "DUMP_MEMORY";
    pub const EXECUTE: &str = "EXECUTE";
    pub const INTERRUPT: &str = "INTERRUPT";
    pub const IO_REQUEST: &str = "IO_REQUEST";
    pub const IO_COMPLETED: &str = "IO_COMPLETED";
    /// Catch-all used by peers that push events to the kernel.
    pub const DEFAULT: &str = "default";
}

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Handshake,
    Operation,
}

/// Uniform request envelope exchanged between the kernel and its peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub origin: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

/// Response envelope: a status plus free-form fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Message {
    pub fn new(origin: &str, kind: MessageKind, operation: &str, payload: Value) -> Self {
        Self {
            origin: origin.to_string(),
            kind,
            operation: operation.to_string(),
            payload,
        }
    }

    pub fn operation(origin: &str, operation: &str, payload: Value) -> Self {
        Self::new(origin, MessageKind::Operation, operation, payload)
    }

    pub fn handshake(origin: &str, payload: Value) -> Self {
        Self::new(origin, MessageKind::Handshake, operation::HANDSHAKE, payload)
    }

    /// Decodes the payload into `T`. A payload that does not match is a protocol fault.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Fail> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            fields: Map::new(),
        }
    }

    pub fn error(message: &str) -> Self {
        Self::ok().with_status(Status::Error).with("message", message)
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Reads field `key` as `T`, if present and well-typed.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.fields
            .get(key)
            .and_then(|value: &Value| serde_json::from_value(value.clone()).ok())
    }

    pub fn message(&self) -> String {
        self.field::<String>("message").unwrap_or_default()
    }

    /// Turns an ERROR status into a remote-rejection failure.
    pub fn into_result(self) -> Result<Self, Fail> {
        match self.status {
            Status::Ok => Ok(self),
            Status::Error => {
                let cause: String = format!("peer rejected request: {}", self.message());
                Err(Fail::new(libc::EACCES, &cause))
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
