use anyhow::{bail, Context, Result};
use kiln_msr_spec::{
    field, mask, ENERGY_UNIT_SHIFT, ENERGY_UNIT_WIDTH, MSR_PKG_POWER_LIMIT, MSR_RAPL_POWER_UNIT,
    POWER_LIMIT_CLAMP_BIT, POWER_LIMIT_ENABLE_BIT, POWER_LIMIT_UNCONSTRAINED, POWER_LIMIT_WIDTH,
    POWER_UNIT_SHIFT, POWER_UNIT_WIDTH, TIME_UNIT_SHIFT, TIME_UNIT_WIDTH, TIME_WINDOW_EXPONENT_WIDTH,
    TIME_WINDOW_MANTISSA_WIDTH, TIME_WINDOW_SHIFT, TIME_WINDOW_WIDTH,
};
use serde::Serialize;

use super::{RegisterControl, RegisterTransport};

const ENABLE_BITS: u64 = (1 << POWER_LIMIT_ENABLE_BIT) | (1 << POWER_LIMIT_CLAMP_BIT);
const MAX_WINDOW_EXPONENT: u8 = mask(TIME_WINDOW_EXPONENT_WIDTH) as u8;
const MAX_WINDOW_MANTISSA: u8 = mask(TIME_WINDOW_MANTISSA_WIDTH) as u8;

/// Units decoded from `MSR_RAPL_POWER_UNIT`, each `1 / 2^field`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RaplUnits {
    pub power_watts: f64,
    pub energy_joules: f64,
    pub time_seconds: f64,
}

pub fn decode_power_units(raw: u64) -> RaplUnits {
    RaplUnits {
        power_watts: inverse_power_of_two(field(raw, POWER_UNIT_SHIFT, POWER_UNIT_WIDTH)),
        energy_joules: inverse_power_of_two(field(raw, ENERGY_UNIT_SHIFT, ENERGY_UNIT_WIDTH)),
        time_seconds: inverse_power_of_two(field(raw, TIME_UNIT_SHIFT, TIME_UNIT_WIDTH)),
    }
}

fn inverse_power_of_two(exponent: u64) -> f64 {
    1.0 / (1u64 << exponent) as f64
}

/// Averaging window stored as `2^exponent * (1 + mantissa / 4)` time units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub exponent: u8,
    pub mantissa: u8,
}

impl TimeWindow {
    pub fn from_seconds(seconds: f64, time_unit: f64) -> Self {
        let ratio = seconds / time_unit;
        if ratio.is_nan() || ratio < 1.0 {
            return Self {
                exponent: 0,
                mantissa: 0,
            };
        }
        let log = ratio.log2();
        let exponent = log.floor();
        if exponent >= f64::from(MAX_WINDOW_EXPONENT) + 1.0 {
            return Self {
                exponent: MAX_WINDOW_EXPONENT,
                mantissa: MAX_WINDOW_MANTISSA,
            };
        }
        Self {
            exponent: exponent as u8,
            mantissa: quantize_mantissa(log - exponent),
        }
    }

    pub fn from_field(raw: u64) -> Self {
        Self {
            exponent: field(raw, 0, TIME_WINDOW_EXPONENT_WIDTH) as u8,
            mantissa: field(raw, TIME_WINDOW_EXPONENT_WIDTH, TIME_WINDOW_MANTISSA_WIDTH) as u8,
        }
    }

    pub fn field(self) -> u64 {
        (u64::from(self.exponent) | (u64::from(self.mantissa) << TIME_WINDOW_EXPONENT_WIDTH))
            & mask(TIME_WINDOW_WIDTH)
    }

    pub fn seconds(self, time_unit: f64) -> f64 {
        2f64.powi(i32::from(self.exponent)) * (1.0 + f64::from(self.mantissa) / 4.0) * time_unit
    }
}

/// Buckets the fractional part of `log2(window)` into the 2-bit mantissa.
pub fn quantize_mantissa(remainder: f64) -> u8 {
    if remainder > 0.7 {
        3
    } else if remainder > 0.45 {
        2
    } else if remainder > 0.15 {
        1
    } else {
        0
    }
}

/// Builds an enabled, clamped `MSR_PKG_POWER_LIMIT` value.
pub fn encode_power_limit(watts: f64, seconds: f64, units: &RaplUnits) -> Result<u64> {
    if !watts.is_finite() || watts < 0.0 {
        bail!("power limit must be a non-negative wattage, got {watts}");
    }
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("power limit window must be a positive duration, got {seconds}s");
    }
    let power = (watts / units.power_watts).round();
    let max_power = mask(POWER_LIMIT_WIDTH);
    if power > max_power as f64 {
        bail!(
            "{watts} W exceeds the largest encodable limit of {} W",
            max_power as f64 * units.power_watts
        );
    }
    let window = TimeWindow::from_seconds(seconds, units.time_seconds);
    Ok(power as u64 | (window.field() << TIME_WINDOW_SHIFT) | ENABLE_BITS)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerLimit {
    pub raw: u64,
    pub watts: f64,
    pub window_seconds: f64,
    pub time_window: TimeWindow,
    pub enabled: bool,
    pub clamped: bool,
}

pub fn decode_power_limit(raw: u64, units: &RaplUnits) -> PowerLimit {
    let time_window = TimeWindow::from_field(field(raw, TIME_WINDOW_SHIFT, TIME_WINDOW_WIDTH));
    PowerLimit {
        raw,
        watts: field(raw, 0, POWER_LIMIT_WIDTH) as f64 * units.power_watts,
        window_seconds: time_window.seconds(units.time_seconds),
        time_window,
        enabled: field(raw, POWER_LIMIT_ENABLE_BIT, 1) == 1,
        clamped: field(raw, POWER_LIMIT_CLAMP_BIT, 1) == 1,
    }
}

/// Clears enable and clamp and forces the power field wide open. Every
/// other bit, including the time window, is kept.
pub fn unconstrained_power_limit(raw: u64) -> u64 {
    (raw & !ENABLE_BITS) | POWER_LIMIT_UNCONSTRAINED
}

impl<T: RegisterTransport> RegisterControl<T> {
    pub fn read_power_units(&mut self) -> Result<RaplUnits> {
        let raw = self
            .read_package(MSR_RAPL_POWER_UNIT)
            .context("failed to read RAPL power unit register")?;
        Ok(decode_power_units(raw))
    }

    pub fn read_power_limit(&mut self) -> Result<PowerLimit> {
        let units = self.read_power_units()?;
        let raw = self
            .read_package(MSR_PKG_POWER_LIMIT)
            .context("failed to read package power limit")?;
        Ok(decode_power_limit(raw, &units))
    }

    /// Caps package power at `watts` averaged over `seconds`. Returns the
    /// value written.
    pub fn set_power_limit(&mut self, watts: f64, seconds: f64) -> Result<u64> {
        let units = self.read_power_units()?;
        let value = encode_power_limit(watts, seconds, &units)?;
        self.write_package(MSR_PKG_POWER_LIMIT, value)
            .context("failed to write package power limit")?;
        Ok(value)
    }

    pub fn disable_power_limit(&mut self) -> Result<u64> {
        let current = self
            .read_package(MSR_PKG_POWER_LIMIT)
            .context("failed to read package power limit")?;
        let value = unconstrained_power_limit(current);
        self.write_package(MSR_PKG_POWER_LIMIT, value)
            .context("failed to write package power limit")?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msr::testing::MemoryTransport;
    use crate::msr::Coordinate;

    fn units(power_watts: f64, time_seconds: f64) -> RaplUnits {
        RaplUnits {
            power_watts,
            energy_joules: 1.0 / 16_384.0,
            time_seconds,
        }
    }

    #[test]
    fn decode_power_units_reads_power_and_time_exponents() {
        let decoded = decode_power_units((10 << 16) | (14 << 8) | 3);
        assert_eq!(decoded.power_watts, 0.125);
        assert_eq!(decoded.time_seconds, 1.0 / 1024.0);
        assert_eq!(decoded.energy_joules, 1.0 / 16_384.0);
    }

    #[test]
    fn decoded_units_are_positive_fractions() {
        for raw in [0u64, 0xF, 0x000F_1F0F, u64::MAX] {
            let decoded = decode_power_units(raw);
            for unit in [decoded.power_watts, decoded.energy_joules, decoded.time_seconds] {
                assert!(unit > 0.0 && unit <= 1.0, "unit {unit} from {raw:#x}");
            }
        }
    }

    #[test]
    fn encode_100_watts_over_one_second() {
        let value = encode_power_limit(100.0, 1.0, &units(0.125, 1.0)).expect("should encode");
        assert_eq!(value, 800 | (1 << 15) | (1 << 16));

        let window = TimeWindow::from_field(field(value, TIME_WINDOW_SHIFT, TIME_WINDOW_WIDTH));
        assert_eq!(window.exponent, 0);
        assert_eq!(window.mantissa, quantize_mantissa(0.0));
    }

    #[test]
    fn mantissa_buckets_follow_thresholds() {
        assert_eq!(quantize_mantissa(0.1), 0);
        assert_eq!(quantize_mantissa(0.15), 0);
        assert_eq!(quantize_mantissa(0.3), 1);
        assert_eq!(quantize_mantissa(0.45), 1);
        assert_eq!(quantize_mantissa(0.6), 2);
        assert_eq!(quantize_mantissa(0.7), 2);
        assert_eq!(quantize_mantissa(0.9), 3);
    }

    #[test]
    fn encoded_window_buckets_log_remainder() {
        for (remainder, bucket) in [(0.1, 0u8), (0.3, 1), (0.6, 2), (0.9, 3)] {
            let seconds = 2f64.powf(5.0 + remainder);
            let value = encode_power_limit(10.0, seconds, &units(0.125, 1.0)).expect("encode");
            let window = TimeWindow::from_field(field(value, TIME_WINDOW_SHIFT, TIME_WINDOW_WIDTH));
            assert_eq!(window.exponent, 5, "remainder {remainder}");
            assert_eq!(window.mantissa, bucket, "remainder {remainder}");
        }
    }

    #[test]
    fn window_field_never_exceeds_seven_bits() {
        for seconds in [1e-9, 0.001, 0.5, 1.0, 2.5, 28.0, 1e6, 1e30] {
            let window = TimeWindow::from_seconds(seconds, 1.0 / 1024.0);
            assert!(window.field() <= 0x7F, "{seconds}s -> {:#x}", window.field());
        }
        let saturated = TimeWindow::from_seconds(1e30, 1.0);
        assert_eq!((saturated.exponent, saturated.mantissa), (31, 3));
    }

    #[test]
    fn decode_recovers_encoded_limit() {
        let units = units(0.125, 1.0 / 1024.0);
        let value = encode_power_limit(95.5, 2.5, &units).expect("should encode");
        let decoded = decode_power_limit(value, &units);
        assert_eq!(decoded.watts, 95.5);
        assert_eq!(decoded.time_window, TimeWindow { exponent: 11, mantissa: 1 });
        assert_eq!(decoded.window_seconds, 2.5);
        assert!(decoded.enabled);
        assert!(decoded.clamped);
    }

    #[test]
    fn encode_rejects_out_of_range_inputs() {
        let units = units(0.125, 1.0);
        assert!(encode_power_limit(-1.0, 1.0, &units).is_err());
        assert!(encode_power_limit(f64::NAN, 1.0, &units).is_err());
        assert!(encode_power_limit(100.0, 0.0, &units).is_err());
        let err = encode_power_limit(5_000.0, 1.0, &units).expect_err("15-bit field overflow");
        assert!(format!("{err:#}").contains("largest encodable limit"));
    }

    #[test]
    fn unconstrained_pattern_clears_enables_and_keeps_window() {
        let current = 800 | (0x2B << TIME_WINDOW_SHIFT) | ENABLE_BITS | (1 << 63);
        let value = unconstrained_power_limit(current);
        assert_eq!(value & ENABLE_BITS, 0);
        assert_eq!(value & 0x1FFF, 0x1FFF);
        assert_eq!(field(value, TIME_WINDOW_SHIFT, TIME_WINDOW_WIDTH), 0x2B);
        assert_eq!(value >> 63, 1);
    }

    #[test]
    fn set_power_limit_uses_units_from_hardware() {
        let package = Coordinate::default();
        let transport =
            MemoryTransport::default().with(package, MSR_RAPL_POWER_UNIT, (10 << 16) | 3);
        let mut control = RegisterControl::new(transport);

        let written = control.set_power_limit(100.0, 1.0).expect("should program");

        assert_eq!(
            control.transport().writes,
            vec![(package, MSR_PKG_POWER_LIMIT, written)]
        );
        let limit = control.read_power_limit().expect("should read back");
        assert_eq!(limit.watts, 100.0);
        assert_eq!(limit.time_window, TimeWindow { exponent: 10, mantissa: 0 });
    }

    #[test]
    fn disable_power_limit_is_read_modify_write() {
        let package = Coordinate::default();
        let transport = MemoryTransport::default().with(
            package,
            MSR_PKG_POWER_LIMIT,
            0x00DD_8000_0001_8320,
        );
        let mut control = RegisterControl::new(transport);

        let written = control.disable_power_limit().expect("should disable");

        assert_eq!(written, 0x00DD_8000_0000_1FFF);
        assert_eq!(control.transport().value(package, MSR_PKG_POWER_LIMIT), written);
    }
}
