// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::core::cmp::Reverse;
use ::crossbeam_channel::{
    Receiver,
    RecvTimeoutError,
    Sender,
};
use ::parking_lot::Mutex;
use ::std::{
    collections::{
        BinaryHeap,
        HashMap,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Structures
//==============================================================================

enum Command {
    Arm { key: u64, expiry: Instant },
    Cancel { key: u64 },
    Stop,
}

struct TimerQueueEntry {
    expiry: Instant,
    key: u64,
    generation: u64,
}

/// One-shot deadline timer keyed by an integer. Re-arming a key replaces its previous deadline. Expired keys are
/// reported to a callback on the timer's own thread.
pub struct Timer {
    commands: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Timer {
    pub fn start<F>(name: &str, on_expire: F) -> Result<Self, Fail>
    where
        F: Fn(u64) + Send + 'static,
    {
        let (commands, rx): (Sender<Command>, Receiver<Command>) = ::crossbeam_channel::unbounded();
        let worker: JoinHandle<()> = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(rx, on_expire))?;
        Ok(Self {
            commands,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Arms (or re-arms) `key` to expire after `timeout`.
    pub fn arm(&self, key: u64, timeout: Duration) {
        let expiry: Instant = Instant::now() + timeout;
        if self.commands.send(Command::Arm { key, expiry }).is_err() {
            warn!("arm(): timer is stopped (key={})", key);
        }
    }

    /// Disarms `key`. Cancelling a key that is not armed is a no-op.
    pub fn cancel(&self, key: u64) {
        let _ = self.commands.send(Command::Cancel { key });
    }

    /// Stops the timer thread. Pending deadlines are discarded.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                error!("stop(): timer thread panicked");
            }
        }
    }

    fn run<F: Fn(u64)>(rx: Receiver<Command>, on_expire: F) {
        // Use a reverse to get a min heap.
        let mut heap: BinaryHeap<Reverse<TimerQueueEntry>> = BinaryHeap::new();
        let mut armed: HashMap<u64, u64> = HashMap::new();
        let mut next_generation: u64 = 0;

        loop {
            let command: Result<Command, RecvTimeoutError> = match heap.peek() {
                Some(Reverse(entry)) => rx.recv_deadline(entry.expiry),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match command {
                Ok(Command::Arm { key, expiry }) => {
                    next_generation += 1;
                    armed.insert(key, next_generation);
                    heap.push(Reverse(TimerQueueEntry {
                        expiry,
                        key,
                        generation: next_generation,
                    }));
                },
                Ok(Command::Cancel { key }) => {
                    armed.remove(&key);
                },
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    let now: Instant = Instant::now();
                    while let Some(Reverse(entry)) = heap.peek() {
                        if now < entry.expiry {
                            break;
                        }
                        let Some(Reverse(entry)) = heap.pop() else { break };
                        // Stale entries belong to deadlines that were cancelled or re-armed.
                        if armed.get(&entry.key) == Some(&entry.generation) {
                            armed.remove(&entry.key);
                            on_expire(entry.key);
                        }
                    }
                },
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Stop);
    }
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &TimerQueueEntry) -> bool {
        // Entries only need to be compared by expiration.
        self.expiry == other.expiry
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &TimerQueueEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &TimerQueueEntry) -> core::cmp::Ordering {
        self.expiry.cmp(&other.expiry)
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
