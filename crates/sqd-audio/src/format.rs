//! Audio format descriptors
//!
//! Per-track format as declared by the upstream player. For native DSD
//! the sample rate is the 1-bit rate (2 822 400 Hz for DSD64).

/// Base rate of the DSD64 1-bit stream (44 100 × 64).
pub const DSD64_RATE: u32 = 2_822_400;

/// Bit order of incoming DSD bytes.
///
/// DSF files store bytes LSB-first, DFF files MSB-first. The Squeezelite
/// wire formats (U32_BE / U32_LE / DoP) all deliver MSB-first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DsdLayout {
    /// Temporally-first bit is the least significant (DSF convention).
    LsbFirst,
    /// Temporally-first bit is the most significant (DFF convention).
    #[default]
    MsbFirst,
}

/// Per-track audio format descriptor.
#[derive(Debug, Clone, Copy)]
pub struct AudioFormat {
    /// Sample rate in Hz. For DSD this is the 1-bit rate.
    pub sample_rate: u32,
    /// Bits per sample: 16/24/32 for PCM, 1 for DSD.
    pub bit_depth: u32,
    /// Channel count, >= 1.
    pub channels: u32,
    /// True for 1-bit DSD streams.
    pub is_dsd: bool,
    /// Source codec was compressed (FLAC/ALAC). Only affects prefill sizing.
    pub is_compressed: bool,
    /// Bit order of incoming DSD bytes. Ignored for PCM.
    pub dsd_layout: DsdLayout,
}

impl AudioFormat {
    /// PCM format with the common defaults.
    pub fn pcm(sample_rate: u32, bit_depth: u32, channels: u32) -> Self {
        Self {
            sample_rate,
            bit_depth,
            channels,
            is_dsd: false,
            is_compressed: false,
            dsd_layout: DsdLayout::default(),
        }
    }

    /// Native DSD format at the given 1-bit rate.
    pub fn dsd(bit_rate: u32, channels: u32, layout: DsdLayout) -> Self {
        Self {
            sample_rate: bit_rate,
            bit_depth: 1,
            channels,
            is_dsd: true,
            is_compressed: false,
            dsd_layout: layout,
        }
    }

    /// DSD rate multiplier relative to DSD64 (1 for DSD64, 8 for DSD512).
    /// Returns at least 1 so delay scaling never collapses to zero.
    pub fn dsd_multiplier(&self) -> u32 {
        (self.sample_rate / DSD64_RATE).max(1)
    }

    /// Clock family of the sample rate: 44100, 48000, or 0 if neither
    /// divides it evenly.
    pub fn clock_family(&self) -> u32 {
        if self.sample_rate % 44_100 == 0 {
            44_100
        } else if self.sample_rate % 48_000 == 0 {
            48_000
        } else {
            0
        }
    }

    /// Bytes per sample of the incoming container. 24-bit PCM arrives
    /// padded to 32-bit containers on the wire.
    pub fn input_bytes_per_sample(&self) -> u32 {
        if self.is_dsd {
            1
        } else if self.bit_depth >= 24 {
            4
        } else {
            2
        }
    }
}

impl PartialEq for AudioFormat {
    /// Formats match when the DAC would not need a reconfigure: layout
    /// and compression hints do not participate.
    fn eq(&self, other: &Self) -> bool {
        self.sample_rate == other.sample_rate
            && self.bit_depth == other.bit_depth
            && self.channels == other.channels
            && self.is_dsd == other.is_dsd
    }
}

impl Eq for AudioFormat {}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_dsd {
            write!(
                f,
                "DSD{} ({}Hz/{}ch)",
                64 * self.sample_rate / DSD64_RATE,
                self.sample_rate,
                self.channels
            )
        } else {
            write!(
                f,
                "PCM {}Hz/{}bit/{}ch",
                self.sample_rate, self.bit_depth, self.channels
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_equality_ignores_hints() {
        let mut a = AudioFormat::pcm(44100, 16, 2);
        let mut b = AudioFormat::pcm(44100, 16, 2);
        a.is_compressed = true;
        b.is_compressed = false;
        assert_eq!(a, b);

        b.sample_rate = 48000;
        assert_ne!(a, b);
    }

    #[test]
    fn test_dsd_multiplier() {
        assert_eq!(AudioFormat::dsd(2_822_400, 2, DsdLayout::MsbFirst).dsd_multiplier(), 1);
        assert_eq!(AudioFormat::dsd(5_644_800, 2, DsdLayout::MsbFirst).dsd_multiplier(), 2);
        assert_eq!(AudioFormat::dsd(22_579_200, 2, DsdLayout::MsbFirst).dsd_multiplier(), 8);
        // PCM rates below DSD64 clamp to 1
        assert_eq!(AudioFormat::pcm(44100, 16, 2).dsd_multiplier(), 1);
    }

    #[test]
    fn test_clock_family() {
        assert_eq!(AudioFormat::pcm(176_400, 24, 2).clock_family(), 44_100);
        assert_eq!(AudioFormat::pcm(96_000, 24, 2).clock_family(), 48_000);
        assert_eq!(AudioFormat::dsd(2_822_400, 2, DsdLayout::MsbFirst).clock_family(), 44_100);
        assert_eq!(AudioFormat::pcm(11_025, 16, 2).clock_family(), 44_100);
    }

    #[test]
    fn test_input_container_width() {
        assert_eq!(AudioFormat::pcm(44100, 16, 2).input_bytes_per_sample(), 2);
        assert_eq!(AudioFormat::pcm(44100, 24, 2).input_bytes_per_sample(), 4);
        assert_eq!(AudioFormat::pcm(44100, 32, 2).input_bytes_per_sample(), 4);
    }
}
