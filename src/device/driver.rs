//! Raw PLC driver contract.
//!
//! Mirrors the vendor communication library: every call returns an integer
//! status code where `0` means success. Drivers are created on the worker
//! thread that will use them, so they do not need to be `Send`.

use super::StationId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Status code for success.
pub const STATUS_OK: i32 = 0;
/// Device name not recognised by the PLC.
pub const STATUS_BAD_DEVICE: i32 = 0x0180_8001;
/// Station did not answer the open request.
pub const STATUS_NO_RESPONSE: i32 = 0x0180_8008;
/// Operation attempted on a closed link.
pub const STATUS_NOT_OPEN: i32 = 0x0180_840B;

/// Synchronous handle to one PLC station.
pub trait PlcDriver {
    fn open(&mut self, station: StationId) -> i32;

    fn close(&mut self) -> i32;

    fn read_block(&mut self, address: &str, count: usize) -> Result<Vec<i16>, i32>;

    fn write_block(&mut self, address: &str, values: &[i16]) -> i32;
}

/// Creates a driver on the serializer's worker thread.
pub trait DriverFactory: Send + Sync {
    fn create(&self, station: StationId) -> Box<dyn PlcDriver>;
}

impl<F> DriverFactory for F
where
    F: Fn(StationId) -> Box<dyn PlcDriver> + Send + Sync,
{
    fn create(&self, station: StationId) -> Box<dyn PlcDriver> {
        self(station)
    }
}

/// Word memory shared between a simulated PLC and whoever wants to poke at it.
pub type SimulatedMemory = Arc<Mutex<HashMap<String, i16>>>;

// Word and bit devices of the common Q/L-series address space
const DEVICE_PREFIXES: [&str; 9] = ["ZR", "D", "W", "R", "M", "X", "Y", "B", "L"];

/// In-process PLC used when no vendor driver is available.
pub struct SimulatedPlc {
    memory: SimulatedMemory,
    reachable: bool,
    open: bool,
}

impl SimulatedPlc {
    pub fn new(memory: SimulatedMemory) -> Self {
        Self {
            memory,
            reachable: true,
            open: false,
        }
    }

    /// A PLC that never answers `open`.
    pub fn unreachable() -> Self {
        Self {
            memory: SimulatedMemory::default(),
            reachable: false,
            open: false,
        }
    }

    fn split_address(address: &str) -> Option<(&'static str, u32)> {
        let upper = address.to_ascii_uppercase();
        DEVICE_PREFIXES.iter().find_map(|prefix| {
            let rest = upper.strip_prefix(prefix)?;
            if rest.is_empty() {
                return None;
            }
            // X/Y/B/W are hexadecimal on this family
            let radix = if matches!(*prefix, "X" | "Y" | "B" | "W") { 16 } else { 10 };
            u32::from_str_radix(rest, radix).ok().map(|n| (*prefix, n))
        })
    }

    fn offset(address: &str, i: usize) -> Option<String> {
        let (prefix, base) = Self::split_address(address)?;
        let index = base.checked_add(u32::try_from(i).ok()?)?;
        if matches!(prefix, "X" | "Y" | "B" | "W") {
            Some(format!("{prefix}{index:X}"))
        } else {
            Some(format!("{prefix}{index}"))
        }
    }
}

impl PlcDriver for SimulatedPlc {
    fn open(&mut self, station: StationId) -> i32 {
        if !self.reachable {
            debug!("Simulated station {} unreachable", station);
            return STATUS_NO_RESPONSE;
        }
        self.open = true;
        STATUS_OK
    }

    fn close(&mut self) -> i32 {
        self.open = false;
        STATUS_OK
    }

    fn read_block(&mut self, address: &str, count: usize) -> Result<Vec<i16>, i32> {
        if !self.open {
            return Err(STATUS_NOT_OPEN);
        }
        let memory = self.memory.lock().map_err(|_| STATUS_NO_RESPONSE)?;
        (0..count)
            .map(|i| {
                let key = Self::offset(address, i).ok_or(STATUS_BAD_DEVICE)?;
                Ok(memory.get(&key).copied().unwrap_or_default())
            })
            .collect()
    }

    fn write_block(&mut self, address: &str, values: &[i16]) -> i32 {
        if !self.open {
            return STATUS_NOT_OPEN;
        }
        let Ok(mut memory) = self.memory.lock() else {
            return STATUS_NO_RESPONSE;
        };
        let mut keys = Vec::with_capacity(values.len());
        for i in 0..values.len() {
            match Self::offset(address, i) {
                Some(key) => keys.push(key),
                None => return STATUS_BAD_DEVICE,
            }
        }
        for (key, value) in keys.into_iter().zip(values) {
            memory.insert(key, *value);
        }
        STATUS_OK
    }
}

/// Hands out one [`SimulatedPlc`] per station, each with its own memory bank.
#[derive(Default)]
pub struct SimulatedPlcFactory {
    banks: Mutex<HashMap<StationId, SimulatedMemory>>,
    unreachable: HashSet<StationId>,
}

impl SimulatedPlcFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a station whose `open` always fails.
    pub fn with_unreachable(mut self, station: StationId) -> Self {
        self.unreachable.insert(station);
        self
    }

    /// Memory bank backing `station`, created on first use.
    pub fn memory(&self, station: StationId) -> SimulatedMemory {
        match self.banks.lock() {
            Ok(mut banks) => banks.entry(station).or_default().clone(),
            Err(poisoned) => poisoned.into_inner().entry(station).or_default().clone(),
        }
    }
}

impl DriverFactory for SimulatedPlcFactory {
    fn create(&self, station: StationId) -> Box<dyn PlcDriver> {
        if self.unreachable.contains(&station) {
            Box::new(SimulatedPlc::unreachable())
        } else {
            Box::new(SimulatedPlc::new(self.memory(station)))
        }
    }
}
