use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{Coordinate, RegisterTransport};

const DEV_CPU_ROOT: &str = "/dev/cpu";

/// Maps a coordinate to the kernel's logical CPU number. Hyperthread
/// siblings are numbered after every first thread of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTopology {
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
}

impl CpuTopology {
    /// `None` when the coordinate lies beyond any representable CPU number.
    pub fn logical_cpu(&self, coord: Coordinate) -> Option<u32> {
        let cores = self.cores_per_socket.max(1);
        let threads = self.threads_per_core.max(1);
        coord
            .socket
            .checked_mul(cores)?
            .checked_mul(threads)?
            .checked_add(coord.thread.checked_mul(cores)?)?
            .checked_add(coord.core)
    }
}

/// Linux `msr` driver transport: one 8-byte positioned access per register
/// at offset `address` in `/dev/cpu/<cpu>/msr`.
pub struct DevCpuMsr {
    root: PathBuf,
    topology: CpuTopology,
    files: HashMap<u32, File>,
}

impl DevCpuMsr {
    pub fn new(topology: CpuTopology) -> Self {
        Self::with_root(DEV_CPU_ROOT, topology)
    }

    pub fn with_root(root: impl AsRef<Path>, topology: CpuTopology) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            topology,
            files: HashMap::new(),
        }
    }

    fn device_path(&self, cpu: u32) -> PathBuf {
        self.root.join(cpu.to_string()).join("msr")
    }

    fn file(&mut self, coord: Coordinate) -> Result<(u32, &File)> {
        let cpu = self
            .topology
            .logical_cpu(coord)
            .with_context(|| format!("{coord} does not map to a logical cpu"))?;
        if !self.files.contains_key(&cpu) {
            let path = self.device_path(cpu);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .with_context(|| {
                    format!(
                        "failed to open {} (is the msr module loaded and are we root?)",
                        path.display()
                    )
                })?;
            self.files.insert(cpu, file);
        }
        let file = self
            .files
            .get(&cpu)
            .with_context(|| format!("msr handle for cpu {cpu} vanished"))?;
        Ok((cpu, file))
    }
}

impl RegisterTransport for DevCpuMsr {
    fn read(&mut self, coord: Coordinate, address: u32) -> Result<u64> {
        let (cpu, file) = self.file(coord)?;
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, u64::from(address))
            .with_context(|| format!("rdmsr {address:#x} on cpu {cpu} failed"))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write(&mut self, coord: Coordinate, address: u32, value: u64) -> Result<()> {
        let (cpu, file) = self.file(coord)?;
        file.write_all_at(&value.to_le_bytes(), u64::from(address))
            .with_context(|| format!("wrmsr {address:#x}={value:#x} on cpu {cpu} failed"))
    }
}
