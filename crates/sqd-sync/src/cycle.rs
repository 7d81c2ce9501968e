//! Transfer cycle timing
//!
//! The Diretta transport schedules one transfer per cycle; the cycle
//! time is chosen so one efficient-MTU payload carries exactly one
//! cycle's worth of audio.

/// IPv6 (40) + UDP (8) header overhead subtracted from the wire MTU.
pub const IP_UDP_OVERHEAD: u32 = 48;

/// Derives cycle times from the measured path MTU.
#[derive(Debug, Clone, Copy)]
pub struct CycleCalculator {
    mtu: u32,
    efficient_mtu: u32,
}

impl CycleCalculator {
    pub fn new(mtu: u32) -> Self {
        Self {
            mtu,
            efficient_mtu: mtu.saturating_sub(IP_UDP_OVERHEAD).max(1),
        }
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Usable payload bytes per packet.
    pub fn efficient_mtu(&self) -> u32 {
        self.efficient_mtu
    }

    /// Cycle time in microseconds for a stream of the given shape,
    /// clamped to [100, 50000].
    pub fn cycle_time_us(&self, sample_rate: u32, channels: u32, bits_per_sample: u32) -> u32 {
        let bytes_per_second =
            sample_rate as f64 * channels as f64 * bits_per_sample as f64 / 8.0;
        let cycle_us = self.efficient_mtu as f64 / bytes_per_second * 1_000_000.0;
        (cycle_us.round() as u32).clamp(100, 50_000)
    }
}
