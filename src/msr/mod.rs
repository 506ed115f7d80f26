//! Register control unit: RAPL package power limits, turbo ratio limits and
//! per-core performance control, issued through a [`RegisterTransport`].

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use serde::Serialize;

pub mod rapl;
pub mod transport;
pub mod turbo;

pub use rapl::{PowerLimit, RaplUnits};

/// Addresses a model-specific register instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Coordinate {
    pub socket: u32,
    pub thread: u32,
    pub core: u32,
}

impl Coordinate {
    pub const fn new(socket: u32, thread: u32, core: u32) -> Self {
        Self {
            socket,
            thread,
            core,
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "socket {} core {} thread {}",
            self.socket, self.core, self.thread
        )
    }
}

/// Synchronous, blocking access to hardware registers.
pub trait RegisterTransport {
    fn read(&mut self, coord: Coordinate, address: u32) -> Result<u64>;

    fn write(&mut self, coord: Coordinate, address: u32, value: u64) -> Result<()>;
}

/// Owns a transport plus the per-core `IA32_PERF_CTL` cache. Methods take
/// `&mut self`, so concurrent control threads must share it behind a lock.
pub struct RegisterControl<T> {
    transport: T,
    package: Coordinate,
    perf_ctl: HashMap<Coordinate, u64>,
}

impl<T: RegisterTransport> RegisterControl<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            package: Coordinate::default(),
            perf_ctl: HashMap::new(),
        }
    }

    /// Coordinate used for package-scoped registers (RAPL, turbo ratios).
    pub fn with_package(mut self, package: Coordinate) -> Self {
        self.package = package;
        self
    }

    fn read_package(&mut self, address: u32) -> Result<u64> {
        self.transport.read(self.package, address)
    }

    fn write_package(&mut self, address: u32, value: u64) -> Result<()> {
        self.transport.write(self.package, address, value)
    }

    /// Reads every package-scoped register this unit programs.
    pub fn snapshot(&mut self) -> Result<RegisterSnapshot> {
        let units = self.read_power_units()?;
        let power_limit = self.read_power_limit()?;
        let turbo = self.read_turbo_ratio_limits()?;
        Ok(RegisterSnapshot {
            package: self.package,
            units,
            power_limit,
            turbo_ratio_limits: turbo.ratios(),
            turbo_ratio_raw: turbo.raw(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterSnapshot {
    pub package: Coordinate,
    pub units: RaplUnits,
    pub power_limit: PowerLimit,
    pub turbo_ratio_limits: [u8; kiln_msr_spec::TURBO_RATIO_BUCKETS],
    pub turbo_ratio_raw: u64,
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use anyhow::{anyhow, Result};

    use super::{Coordinate, RegisterControl, RegisterTransport};

    impl<T> RegisterControl<T> {
        pub(crate) fn transport(&self) -> &T {
            &self.transport
        }
    }

    /// In-memory register file that records every access.
    #[derive(Default)]
    pub(crate) struct MemoryTransport {
        pub registers: HashMap<(Coordinate, u32), u64>,
        pub reads: Vec<(Coordinate, u32)>,
        pub writes: Vec<(Coordinate, u32, u64)>,
    }

    impl MemoryTransport {
        pub fn with(mut self, coord: Coordinate, address: u32, value: u64) -> Self {
            self.registers.insert((coord, address), value);
            self
        }

        pub fn value(&self, coord: Coordinate, address: u32) -> u64 {
            self.registers.get(&(coord, address)).copied().unwrap_or(0)
        }
    }

    impl RegisterTransport for MemoryTransport {
        fn read(&mut self, coord: Coordinate, address: u32) -> Result<u64> {
            self.reads.push((coord, address));
            self.registers
                .get(&(coord, address))
                .copied()
                .ok_or_else(|| anyhow!("register {address:#x} at {coord} is not populated"))
        }

        fn write(&mut self, coord: Coordinate, address: u32, value: u64) -> Result<()> {
            self.writes.push((coord, address, value));
            self.registers.insert((coord, address), value);
            Ok(())
        }
    }
}
