mod backend;
mod burn;
mod config;
mod msr;
mod ui;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::Parser;
use crossbeam_channel::{after, unbounded};

use backend::{BurnEvent, DeviceReport};
use burn::DeviceRequest;
use config::{BurnArgs, Cli, Command, MsrAction, MsrArgs, Toggle};
use msr::transport::DevCpuMsr;
use msr::{RegisterControl, RegisterSnapshot};

const MIN_EVENT_WAIT: Duration = Duration::from_millis(1);
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const MIB: u64 = 1024 * 1024;

struct Stats {
    started_at: Instant,
    devices: Vec<DeviceReport>,
}

impl Stats {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            devices: Vec::new(),
        }
    }

    fn totals(&self) -> (u64, f64) {
        self.devices.iter().fold((0, 0.0), |(multiplies, flops), device| {
            let count = device.multiplies.load(Ordering::Relaxed);
            (
                multiplies + count,
                flops + count as f64 * device.flops_per_multiply(),
            )
        })
    }

    fn print(&self) {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(0.001);
        let (multiplies, flops) = self.totals();
        ui::info(
            "STATS",
            format!(
                "{:.1}s elapsed | {} device(s) | {} multiplies | {}",
                elapsed,
                self.devices.len(),
                multiplies,
                format_flops(flops / elapsed),
            ),
        );
    }
}

fn main() {
    if let Err(err) = run() {
        ui::error("FATAL", format!("{err:#}"));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Command::Burn(args) => run_burn(args),
        Command::Msr(args) => run_msr(args),
    }
}

fn run_burn(args: &BurnArgs) -> Result<()> {
    let cfg = args.run_config();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let platform = backend::default_platform();
    ui::startup_banner(
        "accelerator burn-in",
        &[
            ("platform", platform.name().to_string()),
            ("devices", describe_request(cfg.devices)),
            ("precision", cfg.precision.label().to_string()),
            (
                "matrix",
                cfg.matrix_size
                    .map(|n| format!("{n}x{n} (if it fits)"))
                    .unwrap_or_else(|| "auto".to_string()),
            ),
            (
                "timeout",
                args.timeout
                    .map(|secs| format!("{secs}s"))
                    .unwrap_or_else(|| "until ctrl-c".to_string()),
            ),
        ],
    );

    let (event_tx, event_rx) = unbounded();
    let engine = {
        let cfg = cfg.clone();
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("kiln-burn".to_string())
            .spawn(move || burn::initialize(&cfg, &*platform, &event_tx, &shutdown))
            .map_err(|err| anyhow!("failed to spawn burn engine thread: {err}"))?
    };

    let deadline = args.timeout().map(|timeout| Instant::now() + timeout);
    let stats_interval = args.stats_interval();
    let mut stats = Stats::new();
    let mut last_stats_print = Instant::now();
    let mut ready_reported = false;

    loop {
        let wait_for = next_event_wait(deadline, last_stats_print, stats_interval);
        let disconnected = crossbeam_channel::select! {
            recv(event_rx) -> event => match event {
                Ok(event) => {
                    handle_burn_event(event, cfg.verbose, &mut stats);
                    false
                }
                Err(_) => true,
            },
            recv(after(wait_for)) -> _ => false,
        };

        if !ready_reported && cfg.ready.is_ready() {
            ready_reported = true;
            ui::success("BURN", "accelerators loaded; host stress may begin");
        }
        if disconnected {
            break;
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline)
            && !shutdown.swap(true, Ordering::SeqCst)
        {
            ui::info("BURN", "timeout reached; stopping workers");
        }

        if let Some(interval) = stats_interval {
            if last_stats_print.elapsed() >= interval && !stats.devices.is_empty() {
                stats.print();
                last_stats_print = Instant::now();
            }
        }
    }

    let outcome = engine
        .join()
        .map_err(|_| anyhow!("burn engine thread panicked"))??;
    if outcome.workers > 0 {
        stats.print();
        ui::success(
            "BURN",
            format!(
                "{} worker(s) stopped after {} multiplies",
                outcome.workers, outcome.multiplies
            ),
        );
    }
    Ok(())
}

fn handle_burn_event(event: BurnEvent, verbose: bool, stats: &mut Stats) {
    match event {
        BurnEvent::Notice { message } => {
            if verbose {
                ui::info("BURN", message);
            }
        }
        BurnEvent::Warning { device, message } => ui::warn(&ui::device_tag(device), message),
        BurnEvent::PrecisionDowngraded {
            device,
            name,
            capability,
        } => ui::warn(
            &ui::device_tag(Some(device)),
            format!(
                "{name} (compute capability {capability}) lacks double precision; \
                 burning in single precision instead"
            ),
        ),
        BurnEvent::DeviceReady(report) => {
            if verbose {
                ui::info(&ui::device_tag(Some(report.index)), describe_device(&report));
            }
            stats.devices.push(report);
        }
        BurnEvent::Error { device, message } => ui::error(&ui::device_tag(Some(device)), message),
    }
}

fn describe_request(request: DeviceRequest) -> String {
    match request {
        DeviceRequest::All => "all".to_string(),
        DeviceRequest::Count(0) => "none (host only)".to_string(),
        DeviceRequest::Count(count) => count.to_string(),
    }
}

fn describe_device(report: &DeviceReport) -> String {
    format!(
        "{} initialized: {} MiB total, {} MiB free, {} MiB in use | {}x{} {} precision, {} result buffer(s)",
        report.name,
        report.memory_total_bytes / MIB,
        report.memory_free_bytes / MIB,
        report.usable_bytes / MIB,
        report.dimension,
        report.dimension,
        report.precision.label(),
        report.iterations,
    )
}

fn next_event_wait(
    deadline: Option<Instant>,
    last_stats_print: Instant,
    stats_interval: Option<Duration>,
) -> Duration {
    let now = Instant::now();
    let mut wait = EVENT_POLL_INTERVAL;
    if let Some(deadline) = deadline {
        wait = wait.min(deadline.saturating_duration_since(now));
    }
    if let Some(interval) = stats_interval {
        wait = wait.min((last_stats_print + interval).saturating_duration_since(now));
    }
    wait.max(MIN_EVENT_WAIT)
}

fn run_msr(args: &MsrArgs) -> Result<()> {
    let transport = match &args.dev_root {
        Some(root) => DevCpuMsr::with_root(root, args.topology()),
        None => DevCpuMsr::new(args.topology()),
    };
    let mut control = RegisterControl::new(transport).with_package(args.package());
    let target = args.target();

    match &args.action {
        MsrAction::Status { json } => {
            let snapshot = control.snapshot()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshot(&snapshot);
            }
        }
        MsrAction::PowerLimit { watts, seconds } => {
            let value = control.set_power_limit(*watts, *seconds)?;
            ui::success(
                "RAPL",
                format!("package limit {watts} W over {seconds} s (MSR_PKG_POWER_LIMIT={value:#018x})"),
            );
        }
        MsrAction::PowerLimitOff => {
            let value = control.disable_power_limit()?;
            ui::success(
                "RAPL",
                format!("package limit lifted (MSR_PKG_POWER_LIMIT={value:#018x})"),
            );
        }
        MsrAction::TurboUniform { ratio } => {
            let limits = control.set_uniform_turbo_limit(*ratio)?;
            ui::success("TURBO", format!("ratio limits set to {limits}"));
        }
        MsrAction::TurboRaw { value } => {
            control.set_turbo_ratio_limits(*value)?;
            ui::success("TURBO", format!("MSR_TURBO_RATIO_LIMIT={value:#018x}"));
        }
        MsrAction::PerfTarget { ratio } => {
            let value = control.set_perf_target(*ratio, target)?;
            ui::success(
                "PERF",
                format!("{target}: target ratio {ratio:#x} (IA32_PERF_CTL={value:#018x})"),
            );
        }
        MsrAction::Turbo { state } => {
            let value = match state {
                Toggle::On => control.enable_turbo(target)?,
                Toggle::Off => control.disable_turbo(target)?,
            };
            let label = if *state == Toggle::On { "engaged" } else { "disengaged" };
            ui::success(
                "PERF",
                format!("{target}: turbo {label} (IA32_PERF_CTL={value:#018x})"),
            );
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &RegisterSnapshot) {
    let units = &snapshot.units;
    let limit = &snapshot.power_limit;
    println!("package {}", snapshot.package.socket);
    println!("{}", ui::key_value("power unit", format!("{} W", units.power_watts)));
    println!("{}", ui::key_value("energy unit", format!("{} J", units.energy_joules)));
    println!("{}", ui::key_value("time unit", format!("{} s", units.time_seconds)));
    println!(
        "{}",
        ui::key_value(
            "PL1",
            format!(
                "{} W over {:.4} s ({}{})",
                limit.watts,
                limit.window_seconds,
                if limit.enabled { "enabled" } else { "disabled" },
                if limit.clamped { ", clamped" } else { "" },
            ),
        )
    );
    println!("{}", ui::key_value("PL1 raw", format!("{:#018x}", limit.raw)));
    let ratios = snapshot
        .turbo_ratio_limits
        .iter()
        .enumerate()
        .map(|(bucket, ratio)| format!("{}c={ratio}", bucket + 1))
        .collect::<Vec<_>>()
        .join(" ");
    println!("{}", ui::key_value("turbo", ratios));
    println!(
        "{}",
        ui::key_value("turbo raw", format!("{:#018x}", snapshot.turbo_ratio_raw))
    );
}

fn format_flops(flops: f64) -> String {
    if flops >= 1e12 {
        return format!("{:.3} TFLOP/s", flops / 1e12);
    }
    if flops >= 1e9 {
        return format!("{:.3} GFLOP/s", flops / 1e9);
    }
    if flops >= 1e6 {
        return format!("{:.3} MFLOP/s", flops / 1e6);
    }
    format!("{flops:.3} FLOP/s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    use backend::Precision;

    fn report(index: usize, dimension: u64, multiplies: u64) -> DeviceReport {
        DeviceReport {
            index,
            name: format!("Test GPU {index}"),
            precision: Precision::Double,
            dimension,
            iterations: 4,
            memory_total_bytes: 16 * 1024 * MIB,
            memory_free_bytes: 15 * 1024 * MIB,
            usable_bytes: 15 * 1024 * MIB,
            multiplies: Arc::new(AtomicU64::new(multiplies)),
        }
    }

    #[test]
    fn format_flops_units() {
        assert_eq!(format_flops(5.0), "5.000 FLOP/s");
        assert_eq!(format_flops(5e6), "5.000 MFLOP/s");
        assert_eq!(format_flops(5e9), "5.000 GFLOP/s");
        assert_eq!(format_flops(5e12), "5.000 TFLOP/s");
    }

    #[test]
    fn stats_sum_flops_across_devices() {
        let mut stats = Stats::new();
        stats.devices.push(report(0, 1000, 3));
        stats.devices.push(report(1, 10, 5));
        let (multiplies, flops) = stats.totals();
        assert_eq!(multiplies, 8);
        assert_eq!(flops, 3.0 * 2e9 + 5.0 * 2e3);
    }

    #[test]
    fn ready_reports_are_tracked_even_when_quiet() {
        let mut stats = Stats::new();
        let shared = report(2, 64, 0);
        let counter = Arc::clone(&shared.multiplies);
        handle_burn_event(BurnEvent::DeviceReady(shared), false, &mut stats);
        counter.fetch_add(7, Ordering::Relaxed);
        assert_eq!(stats.totals().0, 7);
    }

    #[test]
    fn event_wait_is_bounded_by_deadline_and_poll_interval() {
        let now = Instant::now();
        assert_eq!(next_event_wait(None, now, None), EVENT_POLL_INTERVAL);
        assert_eq!(next_event_wait(Some(now), now, None), MIN_EVENT_WAIT);
        let wait = next_event_wait(None, now, Some(Duration::from_millis(50)));
        assert!(wait <= Duration::from_millis(50));
    }

    #[test]
    fn request_description() {
        assert_eq!(describe_request(DeviceRequest::All), "all");
        assert_eq!(describe_request(DeviceRequest::Count(0)), "none (host only)");
        assert_eq!(describe_request(DeviceRequest::Count(2)), "2");
    }
}
