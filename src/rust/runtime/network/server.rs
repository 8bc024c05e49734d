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
use ::parking_lot::Mutex;
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
        TcpListener,
        TcpStream,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const LISTEN_BACKLOG: i32 = 128;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Callback that turns one inbound request into its response.
pub type Handler = Arc<dyn Fn(Message) -> Response + Send + Sync>;

/// Accepts inbound peer connections and serves each on its own thread.
pub struct Server {
    local: SocketAddr,
    stopped: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Server {
    /// Binds `local` and starts accepting connections. Each connection may carry any number of requests, one JSON
    /// line each, and every request gets exactly one response line.
    pub fn start(local: SocketAddr, handler: Handler) -> Result<Self, Fail> {
        let socket: Socket = match Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => socket,
            Err(e) => {
                let cause: String = format!("failed to create listening socket: {:?}", e);
                error!("start(): {}", cause);
                return Err(Fail::new(libc::EIO, &cause));
            },
        };
        if socket.set_reuse_address(true).is_err() {
            warn!("start(): cannot set SO_REUSEADDR option");
        }
        let addr: SockAddr = SockAddr::from(local);
        if let Err(e) = socket.bind(&addr) {
            let cause: String = format!("unable to bind {}: {:?}", local, e);
            error!("start(): {}", cause);
            return Err(Fail::from(e));
        }
        socket.listen(LISTEN_BACKLOG)?;
        let listener: TcpListener = socket.into();
        let local: SocketAddr = listener.local_addr()?;
        info!("listening for peers on {}", local);

        let stopped: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let acceptor: JoinHandle<()> = {
            let stopped: Arc<AtomicBool> = stopped.clone();
            thread::Builder::new()
                .name("kernel-acceptor".to_string())
                .spawn(move || Self::accept_loop(listener, handler, stopped))?
        };

        Ok(Self {
            local,
            stopped,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stops accepting new connections. Connections already being served run to completion.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Unblock accept().
        let _ = TcpStream::connect_timeout(&self.local, Duration::from_millis(500));
        if let Some(acceptor) = self.acceptor.lock().take() {
            if acceptor.join().is_err() {
                error!("stop(): acceptor thread panicked");
            }
        }
    }

    fn accept_loop(listener: TcpListener, handler: Handler, stopped: Arc<AtomicBool>) {
        for stream in listener.incoming() {
            if stopped.load(Ordering::SeqCst) {
                break;
            }
            let stream: TcpStream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("accept_loop(): failed to accept connection: {:?}", e);
                    continue;
                },
            };
            let handler: Handler = handler.clone();
            let spawned = thread::Builder::new()
                .name("kernel-connection".to_string())
                .spawn(move || {
                    let peer: String = stream
                        .peer_addr()
                        .map(|a: SocketAddr| a.to_string())
                        .unwrap_or_else(|_| "?".to_string());
                    if let Err(e) = Self::serve(stream, handler) {
                        debug!("serve(): connection from {} ended: {:?}", peer, e);
                    }
                });
            if let Err(e) = spawned {
                error!("accept_loop(): cannot spawn connection thread: {:?}", e);
            }
        }
        trace!("accept_loop(): stopped");
    }

    fn serve(stream: TcpStream, handler: Handler) -> Result<(), Fail> {
        let mut writer: TcpStream = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        loop {
            let mut line: String = String::new();
            let n: usize = (&mut reader)
                .take(limits::MESSAGE_SIZE_MAX as u64)
                .read_line(&mut line)?;
            if n == 0 {
                return Ok(());
            }
            if line.trim().is_empty() {
                continue;
            }

            let response: Response = match serde_json::from_str::<Message>(&line) {
                Ok(message) => {
                    trace!("serve(): origin={:?} operation={:?}", message.origin, message.operation);
                    handler(message)
                },
                Err(e) => {
                    warn!("serve(): malformed message: {:?}", e);
                    Response::error(&format!("malformed message: {}", e))
                },
            };

            let mut reply: String = serde_json::to_string(&response)?;
            reply.push('\n');
            writer.write_all(reply.as_bytes())?;
            writer.flush()?;
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
