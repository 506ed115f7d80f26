//! Accelerator burn engine: one worker thread per device, each running a
//! dense GEMM loop sized to the device's free memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;

use crate::backend::{AcceleratorPlatform, BurnEvent, Precision};

pub mod sizing;
pub mod worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    All,
    Count(usize),
}

/// One-shot latch telling the host-side load that accelerators are busy.
#[derive(Debug, Default)]
pub struct ReadySignal {
    ready: AtomicBool,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that flipped the latch.
    pub fn mark(&self) -> bool {
        !self.ready.swap(true, Ordering::AcqRel)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub devices: DeviceRequest,
    pub precision: Precision,
    pub matrix_size: Option<u64>,
    pub verbose: bool,
    pub ready: Arc<ReadySignal>,
}

impl RunConfig {
    pub fn accelerators_disabled(&self) -> bool {
        self.devices == DeviceRequest::Count(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurnOutcome {
    pub workers: usize,
    pub multiplies: u64,
}

/// Starts one burn worker per selected device and blocks until all of them
/// have been joined. Returns at once, with the ready signal set, when no
/// accelerator is usable.
///
/// Workers stop once `shutdown` is raised. A failing worker raises it itself
/// so the remaining devices wind down, and its error is returned.
pub fn initialize(
    config: &RunConfig,
    platform: &dyn AcceleratorPlatform,
    events: &Sender<BurnEvent>,
    shutdown: &AtomicBool,
) -> Result<BurnOutcome> {
    if config.accelerators_disabled() {
        notice(events, "accelerator use disabled; stressing host only");
        config.ready.mark();
        return Ok(BurnOutcome::default());
    }

    let available = platform
        .device_count()
        .with_context(|| format!("failed to enumerate {} devices", platform.name()))?;
    if available == 0 {
        notice(
            events,
            format!("no {} devices found; stressing host only", platform.name()),
        );
        config.ready.mark();
        return Ok(BurnOutcome::default());
    }

    let selected = resolve_device_count(config.devices, available, events);
    let shared = worker::WorkerShared {
        config,
        platform,
        events,
        shutdown,
    };
    run_workers(&shared, selected)
}

fn resolve_device_count(
    request: DeviceRequest,
    available: usize,
    events: &Sender<BurnEvent>,
) -> usize {
    match request {
        DeviceRequest::All => available,
        DeviceRequest::Count(requested) if requested > available => {
            let _ = events.send(BurnEvent::Warning {
                device: None,
                message: format!(
                    "requested {requested} accelerator devices but only {available} are visible; \
                     using {available} (check CUDA_VISIBLE_DEVICES)"
                ),
            });
            available
        }
        DeviceRequest::Count(requested) => requested,
    }
}

fn run_workers(shared: &worker::WorkerShared<'_>, selected: usize) -> Result<BurnOutcome> {
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(selected);
        let mut first_error = None;

        for index in 0..selected {
            let spawned = thread::Builder::new()
                .name(format!("kiln-burn-{index}"))
                .spawn_scoped(scope, move || burn_device(index, shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    shared.shutdown.store(true, Ordering::SeqCst);
                    first_error = Some(anyhow!(
                        "failed to spawn burn worker for device {index}: {err}"
                    ));
                    break;
                }
            }
        }

        let mut outcome = BurnOutcome::default();
        for handle in handles {
            outcome.workers += 1;
            match handle.join() {
                Ok(Ok(multiplies)) => outcome.multiplies += multiplies,
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    shared.shutdown.store(true, Ordering::SeqCst);
                    first_error.get_or_insert_with(|| anyhow!("burn worker panicked"));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    })
}

fn burn_device(index: usize, shared: &worker::WorkerShared<'_>) -> Result<u64> {
    let result = worker::run_worker(index, shared);
    if let Err(err) = &result {
        shared.shutdown.store(true, Ordering::SeqCst);
        let _ = shared.events.send(BurnEvent::Error {
            device: index,
            message: format!("{err:#}"),
        });
    }
    result
}

fn notice(events: &Sender<BurnEvent>, message: impl Into<String>) {
    let _ = events.send(BurnEvent::Notice {
        message: message.into(),
    });
}
