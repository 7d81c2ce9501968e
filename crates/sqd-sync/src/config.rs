//! Sync adapter configuration and tuning constants

/// SDK transfer scheduling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Fixed-size cycles.
    FixAuto,
    /// Variable cycles, SDK-chosen packet sizes.
    VarAuto,
    /// Variable cycles, maximum packet sizes.
    VarMax,
    /// Pick per format: VarAuto for DSD and low-bitrate PCM, else VarMax.
    #[default]
    Auto,
}

/// Tunables for a sync session.
#[derive(Debug, Clone)]
pub struct DirettaConfig {
    /// Transfer cycle time in microseconds when not auto-calculated.
    pub cycle_time_us: u32,
    /// Derive the cycle time from MTU and byte rate.
    pub cycle_time_auto: bool,
    pub transfer_mode: TransferMode,
    /// SDK thread-mode bitmask.
    pub thread_mode: u32,
    /// MTU override; 0 means measure.
    pub mtu: u32,
    /// MTU used when measurement fails.
    pub mtu_fallback: u32,
    /// Grace period after sink configuration before setSink retries.
    pub dac_stabilization_ms: u32,
    /// How long to wait for the target to report online after play().
    pub online_wait_ms: u32,
    /// Delay on the light format-change reopen path.
    pub format_switch_delay_ms: u32,
}

impl Default for DirettaConfig {
    fn default() -> Self {
        Self {
            cycle_time_us: 2620,
            cycle_time_auto: true,
            transfer_mode: TransferMode::Auto,
            thread_mode: 1,
            mtu: 0,
            mtu_fallback: 1500,
            dac_stabilization_ms: 100,
            online_wait_ms: 2000,
            format_switch_delay_ms: 800,
        }
    }
}

/// Bounded retry loops around SDK state changes.
pub mod retry {
    pub const OPEN_RETRIES: u32 = 3;
    pub const OPEN_DELAY_MS: u64 = 500;

    pub const SETSINK_RETRIES_FULL: u32 = 20;
    pub const SETSINK_RETRIES_QUICK: u32 = 15;
    pub const SETSINK_DELAY_FULL_MS: u64 = 500;
    pub const SETSINK_DELAY_QUICK_MS: u64 = 300;

    pub const CONNECT_RETRIES: u32 = 3;
    pub const CONNECT_DELAY_MS: u64 = 500;
}

/// Ring and prefill sizing policy.
pub mod buffer {
    /// Ring capacity in seconds of the DAC-side byte rate.
    pub const DSD_BUFFER_SECONDS: f32 = 0.8;
    pub const PCM_BUFFER_SECONDS: f32 = 0.5;

    /// Prefill durations by source class. Compressed sources have
    /// variable decode times and get the largest margin.
    pub const PREFILL_MS_COMPRESSED: usize = 200;
    pub const PREFILL_MS_UNCOMPRESSED: usize = 100;
    pub const PREFILL_MS_DSD: usize = 150;

    pub const MIN_BUFFER_BYTES: usize = 65536;
    pub const MAX_BUFFER_BYTES: usize = 16_777_216;

    /// Silence cycles emitted after the target reports online (PCM).
    /// DSD scales this to a rate-dependent warmup time instead.
    pub const POST_ONLINE_SILENCE_BUFFERS: i32 = 20;

    /// Shutdown silence bursts, before DSD-rate scaling.
    pub const CLOSE_SILENCE_PCM: i32 = 20;
    pub const CLOSE_SILENCE_DSD: i32 = 50;
    pub const PAUSE_SILENCE_PCM: i32 = 10;
    pub const PAUSE_SILENCE_DSD: i32 = 30;
    /// Flush burst on a same-format DSD reopen.
    pub const REOPEN_SILENCE_DSD: i32 = 30;

    /// Ring size for a byte rate and duration, clamped to sane bounds.
    pub fn ring_size(bytes_per_second: usize, seconds: f32) -> usize {
        let size = (bytes_per_second as f32 * seconds) as usize;
        size.clamp(MIN_BUFFER_BYTES, MAX_BUFFER_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_size_clamped() {
        // 44.1kHz/16-bit stereo is tiny, floor applies
        assert_eq!(buffer::ring_size(176_400, 0.5), buffer::MIN_BUFFER_BYTES);
        // DSD512 stereo would exceed the cap without clamping
        let dsd512_bps = (22_579_200 / 8) * 2;
        assert!(buffer::ring_size(dsd512_bps * 8, 0.8) <= buffer::MAX_BUFFER_BYTES);
    }

    #[test]
    fn test_defaults() {
        let c = DirettaConfig::default();
        assert!(c.cycle_time_auto);
        assert_eq!(c.thread_mode, 1);
        assert_eq!(c.format_switch_delay_ms, 800);
        assert_eq!(c.transfer_mode, TransferMode::Auto);
    }
}
