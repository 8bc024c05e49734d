// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod kernel;
pub mod runtime;

pub use self::{
    kernel::{
        config::Config,
        pcb::{
            Pid,
            ProcessState,
        },
        Kernel,
        KernelSnapshot,
    },
    runtime::fail::Fail,
};
