// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use ::std::time::Duration;

/// Largest inbound or outbound message accepted on a peer connection.
pub const MESSAGE_SIZE_MAX: usize = 64 * 1024;

/// Backoff between scans for a free execution unit.
pub const CPU_POLL_BACKOFF: Duration = Duration::from_millis(200);

/// Pause taken by the dispatch loop after asking a unit to give up its process.
pub const PREEMPTION_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on how long a scheduler sleeps on a queue before re-checking shutdown and secondary queues.
pub const QUEUE_WAIT_SLICE: Duration = Duration::from_millis(250);

/// Default transport timeouts.
pub const CONNECT_TIMEOUT_DEFAULT: Duration = Duration::from_secs(2);
pub const REQUEST_TIMEOUT_DEFAULT: Duration = Duration::from_secs(10);
