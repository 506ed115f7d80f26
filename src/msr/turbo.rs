use std::fmt;

use anyhow::{Context, Result};
use kiln_msr_spec::{
    field, mask, with_field, IA32_PERF_CTL, MSR_TURBO_RATIO_LIMIT, PERF_TARGET_SHIFT,
    PERF_TARGET_WIDTH, PERF_TURBO_DISENGAGE_BIT, TURBO_RATIO_BUCKETS, TURBO_RATIO_WIDTH,
};

use super::{Coordinate, RegisterControl, RegisterTransport};

/// `MSR_TURBO_RATIO_LIMIT`: maximum ratio for 1..=4 active cores, one byte each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurboRatioLimits(u64);

impl TurboRatioLimits {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Same ratio for every active-core bucket.
    pub fn uniform(limit: u32) -> Self {
        let ratio = u64::from(limit) & mask(TURBO_RATIO_WIDTH);
        let raw = (0..TURBO_RATIO_BUCKETS).fold(0u64, |raw, bucket| {
            raw | (ratio << (bucket as u32 * TURBO_RATIO_WIDTH))
        });
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Ratio for `active_cores` in `1..=4`.
    pub fn ratio(self, active_cores: usize) -> Option<u8> {
        if active_cores == 0 || active_cores > TURBO_RATIO_BUCKETS {
            return None;
        }
        let shift = (active_cores - 1) as u32 * TURBO_RATIO_WIDTH;
        Some(field(self.0, shift, TURBO_RATIO_WIDTH) as u8)
    }

    pub fn ratios(self) -> [u8; TURBO_RATIO_BUCKETS] {
        let mut ratios = [0u8; TURBO_RATIO_BUCKETS];
        for (bucket, ratio) in ratios.iter_mut().enumerate() {
            *ratio = self.ratio(bucket + 1).unwrap_or(0);
        }
        ratios
    }
}

impl fmt::Display for TurboRatioLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bucket, ratio) in self.ratios().iter().enumerate() {
            if bucket > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}c={:#x}", bucket + 1, ratio)?;
        }
        Ok(())
    }
}

pub fn with_perf_target(raw: u64, ratio: u32) -> u64 {
    with_field(
        raw,
        PERF_TARGET_SHIFT,
        PERF_TARGET_WIDTH,
        u64::from(ratio) & mask(PERF_TARGET_WIDTH),
    )
}

pub fn with_turbo_disengaged(raw: u64, disengaged: bool) -> u64 {
    with_field(raw, PERF_TURBO_DISENGAGE_BIT, 1, u64::from(disengaged))
}

impl<T: RegisterTransport> RegisterControl<T> {
    pub fn read_turbo_ratio_limits(&mut self) -> Result<TurboRatioLimits> {
        let raw = self
            .read_package(MSR_TURBO_RATIO_LIMIT)
            .context("failed to read turbo ratio limits")?;
        Ok(TurboRatioLimits::from_raw(raw))
    }

    /// Writes all four ratio fields verbatim.
    pub fn set_turbo_ratio_limits(&mut self, value: u64) -> Result<()> {
        self.write_package(MSR_TURBO_RATIO_LIMIT, value)
            .context("failed to write turbo ratio limits")
    }

    /// Flattens the turbo curve to a single ratio.
    pub fn set_uniform_turbo_limit(&mut self, limit: u32) -> Result<TurboRatioLimits> {
        let limits = TurboRatioLimits::uniform(limit);
        self.set_turbo_ratio_limits(limits.raw())?;
        Ok(limits)
    }

    /// Sets the target ratio field of `IA32_PERF_CTL` on `coord`. The base
    /// value is read once per coordinate and cached afterwards.
    pub fn set_perf_target(&mut self, ratio: u32, coord: Coordinate) -> Result<u64> {
        let base = self.perf_ctl_base(coord)?;
        self.write_perf_ctl(coord, with_perf_target(base, ratio))
    }

    pub fn enable_turbo(&mut self, coord: Coordinate) -> Result<u64> {
        self.toggle_turbo(coord, false)
    }

    pub fn disable_turbo(&mut self, coord: Coordinate) -> Result<u64> {
        self.toggle_turbo(coord, true)
    }

    fn toggle_turbo(&mut self, coord: Coordinate, disengaged: bool) -> Result<u64> {
        let current = self.read_perf_ctl(coord)?;
        self.write_perf_ctl(coord, with_turbo_disengaged(current, disengaged))
    }

    fn perf_ctl_base(&mut self, coord: Coordinate) -> Result<u64> {
        match self.perf_ctl.get(&coord) {
            Some(cached) => Ok(*cached),
            None => self.read_perf_ctl(coord),
        }
    }

    fn read_perf_ctl(&mut self, coord: Coordinate) -> Result<u64> {
        let raw = self
            .transport
            .read(coord, IA32_PERF_CTL)
            .with_context(|| format!("failed to read IA32_PERF_CTL on {coord}"))?;
        self.perf_ctl.insert(coord, raw);
        Ok(raw)
    }

    fn write_perf_ctl(&mut self, coord: Coordinate, value: u64) -> Result<u64> {
        self.transport
            .write(coord, IA32_PERF_CTL, value)
            .with_context(|| format!("failed to write IA32_PERF_CTL on {coord}"))?;
        self.perf_ctl.insert(coord, value);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msr::testing::MemoryTransport;

    const TURBO_BIT: u64 = 1 << 32;

    fn perf_reads(control: &RegisterControl<MemoryTransport>, coord: Coordinate) -> usize {
        control
            .transport()
            .reads
            .iter()
            .filter(|(c, address)| *c == coord && *address == IA32_PERF_CTL)
            .count()
    }

    #[test]
    fn uniform_limit_fills_all_four_buckets() {
        let mut control = RegisterControl::new(MemoryTransport::default());
        control
            .set_uniform_turbo_limit(0x12C)
            .expect("uniform limit should write");

        let limits = control
            .read_turbo_ratio_limits()
            .expect("limits should read back");
        assert_eq!(limits.raw(), 0x2C2C_2C2C);
        assert_eq!(limits.ratios(), [0x2C; 4]);
    }

    #[test]
    fn raw_limits_are_written_verbatim() {
        let mut control = RegisterControl::new(MemoryTransport::default());
        control
            .set_turbo_ratio_limits(0xFFEE_2322_2120)
            .expect("raw write should succeed");
        assert_eq!(
            control.transport().writes,
            vec![(Coordinate::default(), MSR_TURBO_RATIO_LIMIT, 0xFFEE_2322_2120)]
        );
    }

    #[test]
    fn each_bucket_decodes_its_own_byte() {
        let limits = TurboRatioLimits::from_raw(0x2023_2426);
        assert_eq!(limits.ratio(1), Some(0x26));
        assert_eq!(limits.ratio(2), Some(0x24));
        assert_eq!(limits.ratio(3), Some(0x23));
        assert_eq!(limits.ratio(4), Some(0x20));
        assert_eq!(limits.ratio(0), None);
        assert_eq!(limits.ratio(5), None);
        assert_eq!(limits.to_string(), "1c=0x26 2c=0x24 3c=0x23 4c=0x20");
    }

    #[test]
    fn perf_target_only_touches_bits_15_to_8() {
        let coord = Coordinate::new(0, 3, 0);
        let transport = MemoryTransport::default().with(coord, IA32_PERF_CTL, 0xFFFF_FFFF_FFFF_FFFF);
        let mut control = RegisterControl::new(transport);

        let written = control.set_perf_target(0x1A, coord).expect("should write");

        assert_eq!(written, 0xFFFF_FFFF_FFFF_1AFF);
    }

    #[test]
    fn perf_target_reads_each_coordinate_once() {
        let first = Coordinate::new(0, 1, 0);
        let second = Coordinate::new(0, 2, 0);
        let transport = MemoryTransport::default()
            .with(first, IA32_PERF_CTL, 0x0000_0000_0000_2000)
            .with(second, IA32_PERF_CTL, TURBO_BIT | 0x1800);
        let mut control = RegisterControl::new(transport);

        control.set_perf_target(0x10, first).expect("first");
        control.set_perf_target(0x11, first).expect("first again");
        let second_value = control.set_perf_target(0x12, second).expect("second");

        assert_eq!(perf_reads(&control, first), 1);
        assert_eq!(perf_reads(&control, second), 1);
        assert_eq!(control.transport().value(first, IA32_PERF_CTL), 0x1100);
        // second core keeps its own base, not the one cached for the first
        assert_eq!(second_value, TURBO_BIT | 0x1200);
    }

    #[test]
    fn turbo_toggle_preserves_other_bits() {
        let coord = Coordinate::new(0, 5, 0);
        let transport = MemoryTransport::default().with(coord, IA32_PERF_CTL, 0x0000_0000_0000_2A00);
        let mut control = RegisterControl::new(transport);

        let disabled = control.disable_turbo(coord).expect("disable");
        assert_eq!(disabled, TURBO_BIT | 0x2A00);
        let enabled = control.enable_turbo(coord).expect("enable");
        assert_eq!(enabled, 0x2A00);
    }

    #[test]
    fn perf_target_after_disable_turbo_keeps_turbo_off() {
        let coord = Coordinate::new(0, 0, 0);
        let transport = MemoryTransport::default().with(coord, IA32_PERF_CTL, 0x1F00);
        let mut control = RegisterControl::new(transport);

        control.set_perf_target(0x20, coord).expect("prime cache");
        control.disable_turbo(coord).expect("disable");
        let written = control.set_perf_target(0x18, coord).expect("retarget");

        assert_eq!(written, TURBO_BIT | 0x1800);
    }
}
