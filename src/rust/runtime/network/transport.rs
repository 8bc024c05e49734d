// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
    network::message::{
        Message,
        Response,
    },
};
use ::socket2::{
    Domain,
    Protocol,
    SockAddr,
    Socket,
    Type,
};
use ::std::{
    io::{
        BufRead,
        BufReader,
        Read,
        Write,
    },
    net::{
        SocketAddr,
        TcpStream,
        ToSocketAddrs,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Blocking request/response client for one remote peer. Every request uses a fresh connection carrying one
/// newline-terminated JSON envelope in each direction.
#[derive(Clone, Debug)]
pub struct PeerClient {
    /// Name of the local side, for logs.
    origin: String,
    remote: SocketAddr,
    connect_timeout: Duration,
    request_timeout: Duration,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl PeerClient {
    pub fn new(origin: &str, remote: SocketAddr) -> Self {
        Self {
            origin: origin.to_string(),
            remote,
            connect_timeout: limits::CONNECT_TIMEOUT_DEFAULT,
            request_timeout: limits::REQUEST_TIMEOUT_DEFAULT,
        }
    }

    /// Resolves `host:port` into a client.
    pub fn resolve(origin: &str, host: &str, port: u16) -> Result<Self, Fail> {
        match (host, port).to_socket_addrs()?.next() {
            Some(remote) => Ok(Self::new(origin, remote)),
            None => {
                let cause: String = format!("cannot resolve peer address {}:{}", host, port);
                error!("resolve(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, request_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.request_timeout = request_timeout;
        self
    }

    /// Sends `message` and waits for the peer's response. Transport problems and timeouts surface as failures with
    /// I/O errnos; an ERROR status is returned as a regular response.
    pub fn request(&self, message: &Message) -> Result<Response, Fail> {
        trace!(
            "request(): origin={} remote={:?} operation={:?}",
            self.origin,
            self.remote,
            message.operation
        );
        let mut stream: TcpStream = self.connect()?;

        let mut line: String = serde_json::to_string(message)?;
        line.push('\n');
        stream.write_all(line.as_bytes())?;
        stream.flush()?;

        let mut reader = BufReader::new(stream.take(limits::MESSAGE_SIZE_MAX as u64));
        let mut reply: String = String::new();
        if reader.read_line(&mut reply)? == 0 {
            let cause: String = format!("peer {} closed the connection without answering", self.remote);
            warn!("request(): {}", cause);
            return Err(Fail::new(libc::ECONNRESET, &cause));
        }
        Ok(serde_json::from_str::<Response>(&reply)?)
    }

    fn connect(&self) -> Result<TcpStream, Fail> {
        let socket: Socket = Socket::new(Domain::for_address(self.remote), Type::STREAM, Some(Protocol::TCP))?;
        let addr: SockAddr = SockAddr::from(self.remote);
        if let Err(e) = socket.connect_timeout(&addr, self.connect_timeout) {
            debug!("connect(): remote={:?} error={:?}", self.remote, e);
            return Err(Fail::from(e));
        }
        if socket.set_nodelay(true).is_err() {
            warn!("connect(): cannot set TCP_NODELAY option");
        }
        socket.set_read_timeout(Some(self.request_timeout))?;
        socket.set_write_timeout(Some(self.request_timeout))?;
        Ok(socket.into())
    }
}
