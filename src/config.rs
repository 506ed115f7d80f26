use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::backend::Precision;
use crate::burn::{DeviceRequest, ReadySignal, RunConfig};
use crate::msr::transport::CpuTopology;
use crate::msr::Coordinate;

/// Kiln - accelerator burn-in and package power control
///
/// Loads every visible GPU with back-to-back dense matrix multiplies, and
/// programs the RAPL, turbo ratio and performance control registers of the
/// host CPU.
#[derive(Debug, Parser)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Keep accelerators under full GEMM load until interrupted
    ///
    /// Examples:
    ///   kiln burn
    ///   kiln burn --gpus 2 --single --timeout 600
    Burn(BurnArgs),
    /// Inspect or program power and frequency registers (needs root and the msr module)
    ///
    /// Examples:
    ///   kiln msr status --json
    ///   kiln msr --socket 1 power-limit --watts 95 --seconds 1
    ///   kiln msr --core 3 turbo off
    Msr(MsrArgs),
}

#[derive(Debug, Args)]
pub struct BurnArgs {
    /// Accelerators to load: a count, or "all"
    #[arg(long, value_name = "N|all", default_value = "all", value_parser = parse_device_request)]
    pub gpus: DeviceRequest,

    /// Multiply in single precision instead of double
    #[arg(long)]
    pub single: bool,

    /// Matrix dimension; ignored when it would not fit in device memory
    #[arg(long, value_name = "N")]
    pub matrix_size: Option<u64>,

    /// Report per-device setup details
    #[arg(short, long)]
    pub verbose: bool,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Seconds between throughput reports (0 disables them)
    #[arg(long, value_name = "SECS", default_value = "10")]
    pub stats_interval: u64,
}

impl BurnArgs {
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            devices: self.gpus,
            precision: if self.single {
                Precision::Single
            } else {
                Precision::Double
            },
            matrix_size: self.matrix_size.filter(|size| *size > 0),
            verbose: self.verbose,
            ready: Arc::new(ReadySignal::new()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval))
    }
}

pub fn parse_device_request(raw: &str) -> Result<DeviceRequest, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("all") {
        return Ok(DeviceRequest::All);
    }
    raw.parse::<usize>()
        .map(DeviceRequest::Count)
        .map_err(|_| format!("expected a device count or \"all\", got {raw:?}"))
}

/// Accepts `0x`-prefixed hex or plain decimal.
pub fn parse_register_value(raw: &str) -> Result<u64, String> {
    let raw = raw.trim().replace('_', "");
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid register value {raw:?}: {err}"))
}

#[derive(Debug, Args)]
pub struct MsrArgs {
    /// Package (socket) the package-scoped registers are accessed on
    #[arg(long, global = true, default_value = "0")]
    pub socket: u32,

    /// Core for per-core registers
    #[arg(long, global = true, default_value = "0")]
    pub core: u32,

    /// Hardware thread for per-core registers
    #[arg(long, global = true, default_value = "0")]
    pub thread: u32,

    /// Physical cores per socket (defaults to the visible CPU count)
    #[arg(long, global = true)]
    pub cores_per_socket: Option<u32>,

    /// Hardware threads per core
    #[arg(long, global = true, default_value = "1")]
    pub threads_per_core: u32,

    /// Directory holding the per-CPU msr device nodes [default: /dev/cpu]
    #[arg(long, global = true, value_name = "DIR")]
    pub dev_root: Option<PathBuf>,

    #[command(subcommand)]
    pub action: MsrAction,
}

impl MsrArgs {
    pub fn topology(&self) -> CpuTopology {
        let cores_per_socket = self.cores_per_socket.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
                / self.threads_per_core.max(1)
        });
        CpuTopology {
            cores_per_socket: cores_per_socket.max(1),
            threads_per_core: self.threads_per_core.max(1),
        }
    }

    pub fn package(&self) -> Coordinate {
        Coordinate::new(self.socket, 0, 0)
    }

    pub fn target(&self) -> Coordinate {
        Coordinate::new(self.socket, self.thread, self.core)
    }
}

#[derive(Debug, Subcommand)]
pub enum MsrAction {
    /// Decode RAPL units, the package power limit and turbo ratio limits
    Status {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Program and enable the package power limit (PL1)
    PowerLimit {
        #[arg(long)]
        watts: f64,
        /// Averaging window
        #[arg(long, default_value = "1.0")]
        seconds: f64,
    },
    /// Lift the package power limit
    PowerLimitOff,
    /// Same maximum turbo ratio for 1..=4 active cores
    TurboUniform {
        #[arg(value_name = "RATIO")]
        ratio: u32,
    },
    /// Write MSR_TURBO_RATIO_LIMIT verbatim
    TurboRaw {
        #[arg(value_name = "VALUE", value_parser = parse_register_value)]
        value: u64,
    },
    /// Request a P-state ratio through IA32_PERF_CTL
    PerfTarget {
        #[arg(value_name = "RATIO")]
        ratio: u32,
    },
    /// Engage or disengage turbo through IA32_PERF_CTL
    Turbo {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}
