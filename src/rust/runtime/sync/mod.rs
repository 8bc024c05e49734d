// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

mod queue;
mod semaphore;

pub use self::{
    queue::StateQueue,
    semaphore::Gate,
};
