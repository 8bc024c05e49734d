// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kernel::pcb::{
        Pcb,
        Pid,
        ProcessRef,
    },
    runtime::fail::Fail,
};
use ::std::{
    cmp::Ordering,
    fmt,
    str::FromStr,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Short-term (dispatch) policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchPolicy {
    Fifo,
    /// Shortest job first.
    Sjf,
    /// Shortest remaining time. Preemptive.
    Srt,
}

/// Long-term (admission) policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionPolicy {
    Fifo,
    /// Smallest process first.
    Pmcp,
}

/// Picks the next READY process to run.
pub trait DispatchStrategy: Send + Sync {
    /// Index of the chosen element of `ready`, which is in insertion order. Called with the READY lock held.
    fn select(&self, ready: &[ProcessRef]) -> Option<usize>;

    /// Whether a better READY candidate may take a unit away from a running process.
    fn is_preemptive(&self) -> bool {
        false
    }
}

/// Picks the next NEW process to admit.
pub trait AdmissionStrategy: Send + Sync {
    fn select(&self, new: &[ProcessRef]) -> Option<usize>;
}

pub struct FifoDispatch;
pub struct ShortestJobFirst;
pub struct ShortestRemainingTime;

pub struct FifoAdmission;
pub struct SmallestFirst;

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl DispatchPolicy {
    pub fn strategy(self) -> Box<dyn DispatchStrategy> {
        match self {
            DispatchPolicy::Fifo => Box::new(FifoDispatch),
            DispatchPolicy::Sjf => Box::new(ShortestJobFirst),
            DispatchPolicy::Srt => Box::new(ShortestRemainingTime),
        }
    }
}

impl AdmissionPolicy {
    pub fn strategy(self) -> Box<dyn AdmissionStrategy> {
        match self {
            AdmissionPolicy::Fifo => Box::new(FifoAdmission),
            AdmissionPolicy::Pmcp => Box::new(SmallestFirst),
        }
    }
}

/// Index of the minimum of `items` under `key`. Equal keys keep the earlier element.
fn min_by_key<K, F>(items: &[ProcessRef], mut key: F) -> Option<usize>
where
    K: PartialOrd,
    F: FnMut(&Pcb) -> K,
{
    let mut best: Option<(usize, K)> = None;
    for (i, process) in items.iter().enumerate() {
        let k: K = {
            let pcb = process.lock();
            key(&*pcb)
        };
        let better: bool = match &best {
            None => true,
            Some((_, current)) => k.partial_cmp(current) == Some(Ordering::Less),
        };
        if better {
            best = Some((i, k));
        }
    }
    best.map(|(i, _)| i)
}

/// Among `running` (unit, pid, estimate), the process with the largest estimate strictly above `candidate`.
pub fn preemption_victim(candidate: f64, running: &[(String, Pid, f64)]) -> Option<(String, Pid)> {
    running
        .iter()
        .filter(|(_, _, estimate)| *estimate > candidate)
        .fold(None::<&(String, Pid, f64)>, |best, entry| match best {
            Some(b) if b.2 >= entry.2 => Some(b),
            _ => Some(entry),
        })
        .map(|(unit, pid, _)| (unit.clone(), *pid))
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl DispatchStrategy for FifoDispatch {
    fn select(&self, ready: &[ProcessRef]) -> Option<usize> {
        if ready.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}

impl DispatchStrategy for ShortestJobFirst {
    fn select(&self, ready: &[ProcessRef]) -> Option<usize> {
        min_by_key(ready, |pcb: &Pcb| (pcb.burst_estimate, pcb.last_ready_at()))
    }
}

impl DispatchStrategy for ShortestRemainingTime {
    fn select(&self, ready: &[ProcessRef]) -> Option<usize> {
        ShortestJobFirst.select(ready)
    }

    fn is_preemptive(&self) -> bool {
        true
    }
}

impl AdmissionStrategy for FifoAdmission {
    fn select(&self, new: &[ProcessRef]) -> Option<usize> {
        if new.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}

impl AdmissionStrategy for SmallestFirst {
    fn select(&self, new: &[ProcessRef]) -> Option<usize> {
        min_by_key(new, |pcb: &Pcb| -> (u64, Instant) { (pcb.size, pcb.created_at()) })
    }
}

impl FromStr for DispatchPolicy {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "FIFO" => Ok(DispatchPolicy::Fifo),
            "SJF" => Ok(DispatchPolicy::Sjf),
            "SRT" => Ok(DispatchPolicy::Srt),
            _ => Err(Fail::new(libc::EINVAL, "unknown dispatch policy")),
        }
    }
}

impl FromStr for AdmissionPolicy {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "FIFO" => Ok(AdmissionPolicy::Fifo),
            "PMCP" => Ok(AdmissionPolicy::Pmcp),
            _ => Err(Fail::new(libc::EINVAL, "unknown admission policy")),
        }
    }
}

impl fmt::Display for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchPolicy::Fifo => write!(f, "FIFO"),
            DispatchPolicy::Sjf => write!(f, "SJF"),
            DispatchPolicy::Srt => write!(f, "SRT"),
        }
    }
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionPolicy::Fifo => write!(f, "FIFO"),
            AdmissionPolicy::Pmcp => write!(f, "PMCP"),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
