use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;

use crate::backend::{
    AcceleratorDevice, AcceleratorPlatform, BurnEvent, DeviceProperties, DeviceReport, HostMatrix,
    Precision,
};

use super::sizing::{ipow, BurnPlan};
use super::RunConfig;

/// Seed for the deterministic operand pattern.
pub const FILL_SEED: i64 = 123;
/// Only every `FILL_STRIDE`-th element is non-zero.
pub const FILL_STRIDE: usize = 128;

pub(super) struct WorkerShared<'a> {
    pub config: &'a RunConfig,
    pub platform: &'a dyn AcceleratorPlatform,
    pub events: &'a Sender<BurnEvent>,
    pub shutdown: &'a AtomicBool,
}

/// Opens, sizes, seeds and burns one device until `shutdown` is raised.
/// Returns the number of multiplies completed.
pub(super) fn run_worker(index: usize, shared: &WorkerShared<'_>) -> Result<u64> {
    let mut device = shared
        .platform
        .open(index)
        .with_context(|| format!("failed to open {} device {index}", shared.platform.name()))?;
    let properties = device.properties().clone();

    let precision = effective_precision(shared.config.precision, &properties, shared.events);
    let plan = BurnPlan::new(
        precision,
        shared.config.matrix_size,
        properties.memory_free_bytes,
    )
    .with_context(|| format!("device {index} ({})", properties.name))?;

    let dimension = usize::try_from(plan.dimension)
        .map_err(|_| anyhow!("matrix dimension {} exceeds host limits", plan.dimension))?;
    let slots = usize::try_from(plan.iterations)
        .map_err(|_| anyhow!("iteration count {} exceeds host limits", plan.iterations))?;

    {
        let a = fill_operand(precision, plan.dimension, FILL_SEED)?;
        let b = fill_operand(precision, plan.dimension, FILL_SEED)?;
        device
            .upload(dimension, &a, &b, slots)
            .with_context(|| format!("failed to stage operands on device {index}"))?;
    }

    let multiplies = Arc::new(AtomicU64::new(0));
    let _ = shared.events.send(BurnEvent::DeviceReady(DeviceReport {
        index,
        name: properties.name.clone(),
        precision,
        dimension: plan.dimension,
        iterations: plan.iterations,
        memory_total_bytes: properties.memory_total_bytes,
        memory_free_bytes: properties.memory_free_bytes,
        usable_bytes: plan.usable_bytes,
        multiplies: Arc::clone(&multiplies),
    }));

    if index == 0 {
        shared.config.ready.mark();
    }

    burn_loop(device.as_mut(), slots, &multiplies, shared.shutdown)?;
    Ok(multiplies.load(Ordering::Relaxed))
}

fn effective_precision(
    requested: Precision,
    properties: &DeviceProperties,
    events: &Sender<BurnEvent>,
) -> Precision {
    if requested == Precision::Double && !properties.capability.supports_double() {
        let _ = events.send(BurnEvent::PrecisionDowngraded {
            device: properties.index,
            name: properties.name.clone(),
            capability: properties.capability,
        });
        return Precision::Single;
    }
    requested
}

/// Shutdown is observed once per pass over all result slots.
fn burn_loop(
    device: &mut dyn AcceleratorDevice,
    slots: usize,
    multiplies: &AtomicU64,
    shutdown: &AtomicBool,
) -> Result<()> {
    while !shutdown.load(Ordering::Relaxed) {
        for slot in 0..slots {
            device.multiply(slot)?;
        }
        device.synchronize()?;
        multiplies.fetch_add(slots as u64, Ordering::Relaxed);
    }
    Ok(())
}

pub fn fill_operand(precision: Precision, dimension: u64, seed: i64) -> Result<HostMatrix> {
    let len = dimension
        .checked_mul(dimension)
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| anyhow!("matrix dimension {dimension} exceeds host address space"))?;
    let pattern = (ipow(seed, 2) % 131) * 17;
    match precision {
        Precision::Single => {
            let value = pattern as f32;
            Ok(HostMatrix::Single(strided(len, value + value / 10_000.0)?))
        }
        Precision::Double => {
            let value = pattern as f64;
            Ok(HostMatrix::Double(strided(len, value + value / 10_000.0)?))
        }
    }
}

fn strided<T: Copy + Default>(len: usize, value: T) -> Result<Vec<T>> {
    let mut values = Vec::new();
    values.try_reserve_exact(len).map_err(|_| {
        anyhow!(
            "out of memory: could not allocate {} MiB host operand",
            (len * std::mem::size_of::<T>()) / (1024 * 1024)
        )
    })?;
    values.resize(len, T::default());
    for slot in values.iter_mut().step_by(FILL_STRIDE) {
        *slot = value;
    }
    Ok(values)
}
