//! Register addresses and bit layouts shared by the kiln register control unit.

pub const MSR_TURBO_RATIO_LIMIT: u32 = 0x1AD;
pub const MSR_RAPL_POWER_UNIT: u32 = 0x606;
pub const MSR_PKG_POWER_LIMIT: u32 = 0x610;
pub const IA32_PERF_CTL: u32 = 0x199;

pub const POWER_UNIT_SHIFT: u32 = 0;
pub const POWER_UNIT_WIDTH: u32 = 4;
pub const ENERGY_UNIT_SHIFT: u32 = 8;
pub const ENERGY_UNIT_WIDTH: u32 = 5;
pub const TIME_UNIT_SHIFT: u32 = 16;
pub const TIME_UNIT_WIDTH: u32 = 4;

pub const POWER_LIMIT_WIDTH: u32 = 15;
pub const POWER_LIMIT_ENABLE_BIT: u32 = 15;
pub const POWER_LIMIT_CLAMP_BIT: u32 = 16;
pub const TIME_WINDOW_SHIFT: u32 = 17;
pub const TIME_WINDOW_EXPONENT_WIDTH: u32 = 5;
pub const TIME_WINDOW_MANTISSA_WIDTH: u32 = 2;
pub const TIME_WINDOW_WIDTH: u32 = TIME_WINDOW_EXPONENT_WIDTH + TIME_WINDOW_MANTISSA_WIDTH;
/// Power field pattern written when the package limit is switched off.
pub const POWER_LIMIT_UNCONSTRAINED: u64 = 0x1FFF;

pub const TURBO_RATIO_BUCKETS: usize = 4;
pub const TURBO_RATIO_WIDTH: u32 = 8;

pub const PERF_TARGET_SHIFT: u32 = 8;
pub const PERF_TARGET_WIDTH: u32 = 8;
pub const PERF_TURBO_DISENGAGE_BIT: u32 = 32;

pub const fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

pub const fn field(value: u64, shift: u32, width: u32) -> u64 {
    (value >> shift) & mask(width)
}

pub const fn with_field(value: u64, shift: u32, width: u32, field: u64) -> u64 {
    let m = mask(width) << shift;
    (value & !m) | ((field << shift) & m)
}
