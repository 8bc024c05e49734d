// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod message;
pub mod server;
pub mod transport;

pub use self::{
    message::{
        Message,
        MessageKind,
        Response,
        Status,
    },
    server::{
        Handler,
        Server,
    },
    transport::PeerClient,
};
