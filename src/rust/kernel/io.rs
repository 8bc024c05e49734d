// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::kernel::peers::IoDevice;
use ::parking_lot::RwLock;
use ::std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Prefix that device handshakes carry in front of the device name.
pub const DEVICE_PREFIX: &str = "IO";

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Default)]
struct Devices {
    /// Canonical name to device.
    devices: BTreeMap<String, Arc<dyn IoDevice>>,
    /// Every accepted name (canonical or short) to its canonical name.
    aliases: BTreeMap<String, String>,
}

/// Registry of I/O devices with round-robin assignment of requests that name no registered device.
pub struct IoDispatcher {
    devices: RwLock<Devices>,
    cursor: AtomicUsize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl IoDispatcher {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Devices::default()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Registers `device` under its name and, if the name carries the device prefix, under the short name too
    /// (`IODISCO` is also reachable as `DISCO`).
    pub fn register(&self, device: Arc<dyn IoDevice>) {
        let name: String = device.name().to_string();
        let mut devices = self.devices.write();
        devices.aliases.insert(name.clone(), name.clone());
        if let Some(short) = name.strip_prefix(DEVICE_PREFIX) {
            if !short.is_empty() && !devices.devices.contains_key(short) {
                devices.aliases.insert(short.to_string(), name.clone());
            }
        }
        devices.devices.insert(name.clone(), device);
        info!("I/O device {} registered", name);
    }

    /// Chooses the device for a request naming `requested`. An exact (or short) name match wins; otherwise requests
    /// are spread round-robin over all devices in name order. Returns `None` when no device is registered.
    pub fn resolve(&self, requested: &str) -> Option<(String, Arc<dyn IoDevice>)> {
        let devices = self.devices.read();
        if let Some(canonical) = devices.aliases.get(requested) {
            if let Some(device) = devices.devices.get(canonical) {
                return Some((canonical.clone(), device.clone()));
            }
        }
        if devices.devices.is_empty() {
            return None;
        }
        let n: usize = self.cursor.fetch_add(1, Ordering::Relaxed) % devices.devices.len();
        let (name, device) = devices.devices.iter().nth(n)?;
        debug!("resolve(): balancing {:?} -> {}", requested, name);
        Some((name.clone(), device.clone()))
    }

    /// Canonical device names in ascending order.
    pub fn names(&self) -> Vec<String> {
        self.devices.read().devices.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().devices.is_empty()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for IoDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
