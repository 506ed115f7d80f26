use anyhow::{bail, Result};

use crate::backend::Precision;

/// Auto-derived dimensions are aligned to this many elements.
pub const DIMENSION_ALIGNMENT: u64 = 1024;
/// Operands A and B plus at least one result buffer.
const RESIDENT_MATRICES: u64 = 3;
const HEADROOM_NUMERATOR: u64 = 4;
const HEADROOM_DENOMINATOR: u64 = 5;
const HEADROOM_RATIO: f64 = HEADROOM_NUMERATOR as f64 / HEADROOM_DENOMINATOR as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurnPlan {
    pub precision: Precision,
    pub dimension: u64,
    pub iterations: u64,
    pub usable_bytes: u64,
}

impl BurnPlan {
    pub fn new(precision: Precision, requested: Option<u64>, available_bytes: u64) -> Result<Self> {
        let element_size = precision.element_size();
        let dimension = choose_dimension(requested, available_bytes, element_size)?;
        Ok(Self {
            precision,
            dimension,
            iterations: iteration_count(available_bytes, dimension, element_size),
            usable_bytes: available_bytes,
        })
    }
}

/// Smallest multiple of `multiple` that is >= `n`; `n` itself when `multiple` is 0.
pub fn round_up(n: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        return n;
    }
    match n % multiple {
        0 => n,
        remainder => n + multiple - remainder,
    }
}

/// Integer power by squaring. Wraps on overflow.
pub fn ipow(base: i64, exp: u32) -> i64 {
    let mut result = 1i64;
    let mut base = base;
    let mut exp = exp;
    while exp != 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        exp >>= 1;
        base = base.wrapping_mul(base);
    }
    result
}

/// `None` when the product does not fit in `u128`, i.e. never fits a device.
fn resident_bytes(dimension: u64, element_size: u64) -> Option<u128> {
    u128::from(dimension)
        .checked_mul(u128::from(dimension))?
        .checked_mul(u128::from(element_size))?
        .checked_mul(u128::from(RESIDENT_MATRICES))
}

pub fn fits_in_memory(dimension: u64, element_size: u64, available_bytes: u64) -> bool {
    resident_bytes(dimension, element_size)
        .is_some_and(|bytes| bytes <= u128::from(available_bytes))
}

fn fits_in_headroom(dimension: u64, element_size: u64, available_bytes: u64) -> bool {
    resident_bytes(dimension, element_size)
        .and_then(|bytes| bytes.checked_mul(u128::from(HEADROOM_DENOMINATOR)))
        .is_some_and(|scaled| {
            scaled <= u128::from(available_bytes) * u128::from(HEADROOM_NUMERATOR)
        })
}

/// `roundUp(floor(0.8 * sqrt(available / (element_size * 3))), 1024)`, stepped
/// back down by the alignment while the result would overflow `available_bytes`.
pub fn auto_dimension(available_bytes: u64, element_size: u64) -> Option<u64> {
    if element_size == 0 {
        return None;
    }
    let elements = available_bytes / (element_size * RESIDENT_MATRICES);
    let raw = (HEADROOM_RATIO * (elements as f64).sqrt()).floor() as u64;
    let mut dimension = round_up(raw, DIMENSION_ALIGNMENT);
    while dimension > 0 && !fits_in_memory(dimension, element_size, available_bytes) {
        dimension -= DIMENSION_ALIGNMENT;
    }
    (dimension > 0).then_some(dimension)
}

/// Keeps a requested dimension if the three resident matrices stay within
/// 80% of `available_bytes`, otherwise derives one.
pub fn choose_dimension(
    requested: Option<u64>,
    available_bytes: u64,
    element_size: u64,
) -> Result<u64> {
    if let Some(dimension) = requested.filter(|d| *d > 0) {
        if fits_in_headroom(dimension, element_size, available_bytes) {
            return Ok(dimension);
        }
    }
    match auto_dimension(available_bytes, element_size) {
        Some(dimension) => Ok(dimension),
        None => bail!(
            "insufficient device memory: {} MiB available, a {}x{} matrix needs {} MiB",
            available_bytes / (1024 * 1024),
            DIMENSION_ALIGNMENT,
            DIMENSION_ALIGNMENT,
            resident_bytes(DIMENSION_ALIGNMENT, element_size).unwrap_or(u128::MAX) / (1024 * 1024)
        ),
    }
}

/// Result buffers that fit after reserving room for the two operands.
pub fn iteration_count(usable_bytes: u64, dimension: u64, element_size: u64) -> u64 {
    let result_bytes = dimension
        .saturating_mul(dimension)
        .saturating_mul(element_size);
    if result_bytes == 0 {
        return 0;
    }
    usable_bytes.saturating_sub(result_bytes.saturating_mul(2)) / result_bytes
}
