//! Diretta SDK session contract
//!
//! The transport SDK is an external collaborator; the sync adapter
//! only relies on the narrow surface modelled here:
//! - a finder that lists targets and measures the path MTU
//! - a session driver with the open / setSink / connect / play
//!   lifecycle whose transfer loop pulls audio through a per-cycle
//!   `produce_stream` callback
//!
//! Production hardware binds these traits through an FFI shim around
//! the vendor SDK; the [`loopback`] driver implements them fully
//! in-process and is what the integration tests (and `--loopback`
//! operation) run against.

use std::fmt;

pub mod loopback;

// ═══════════════════════════════════════════════════════════════════════════
// FORMAT FLAGS
// ═══════════════════════════════════════════════════════════════════════════

/// Sink format selector bitfield: base rate, rate multiplier, PCM
/// width, channel count, and DSD orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatFlags(pub u32);

impl FormatFlags {
    pub const RAT_44100: FormatFlags = FormatFlags(1 << 0);
    pub const RAT_48000: FormatFlags = FormatFlags(1 << 1);

    pub const MP1: FormatFlags = FormatFlags(1 << 2);
    pub const MP2: FormatFlags = FormatFlags(1 << 3);
    pub const MP4: FormatFlags = FormatFlags(1 << 4);
    pub const MP8: FormatFlags = FormatFlags(1 << 5);
    pub const MP16: FormatFlags = FormatFlags(1 << 6);
    /// DSD multipliers, relative to the 44.1/48 kHz base rate.
    pub const MP64: FormatFlags = FormatFlags(1 << 7);
    pub const MP128: FormatFlags = FormatFlags(1 << 8);
    pub const MP256: FormatFlags = FormatFlags(1 << 9);
    pub const MP512: FormatFlags = FormatFlags(1 << 10);
    pub const MP1024: FormatFlags = FormatFlags(1 << 11);

    pub const PCM_S16: FormatFlags = FormatFlags(1 << 12);
    pub const PCM_S24: FormatFlags = FormatFlags(1 << 13);
    pub const PCM_S32: FormatFlags = FormatFlags(1 << 14);

    pub const CHA_1: FormatFlags = FormatFlags(1 << 15);
    pub const CHA_2: FormatFlags = FormatFlags(1 << 16);
    pub const CHA_4: FormatFlags = FormatFlags(1 << 17);
    pub const CHA_6: FormatFlags = FormatFlags(1 << 18);
    pub const CHA_8: FormatFlags = FormatFlags(1 << 19);

    pub const DSD1: FormatFlags = FormatFlags(1 << 20);
    pub const DSD_SIZ_32: FormatFlags = FormatFlags(1 << 21);
    pub const DSD_LSB: FormatFlags = FormatFlags(1 << 22);
    pub const DSD_MSB: FormatFlags = FormatFlags(1 << 23);
    pub const DSD_LITTLE: FormatFlags = FormatFlags(1 << 24);
    pub const DSD_BIG: FormatFlags = FormatFlags(1 << 25);

    pub const fn empty() -> Self {
        FormatFlags(0)
    }

    pub const fn contains(self, other: FormatFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Flags for a PCM stream, or `None` when the rate fits neither
    /// clock family or the shape is unsupported.
    pub fn pcm(sample_rate: u32, bits: u32, channels: u32) -> Option<Self> {
        let mut flags = match bits {
            16 => Self::PCM_S16,
            24 => Self::PCM_S24,
            32 => Self::PCM_S32,
            _ => return None,
        };
        flags = flags | Self::rate(sample_rate)? | Self::channels(channels)?;
        Some(flags)
    }

    /// Flags for a native DSD stream at the given 1-bit rate with the
    /// requested target orientation.
    pub fn dsd(bit_rate: u32, channels: u32, lsb_first: bool, little_endian: bool) -> Option<Self> {
        let (base, mult) = if bit_rate % (44_100 * 64) == 0 {
            (Self::RAT_44100, bit_rate / 44_100)
        } else if bit_rate % (48_000 * 64) == 0 {
            (Self::RAT_48000, bit_rate / 48_000)
        } else {
            return None;
        };
        let mult = match mult {
            64 => Self::MP64,
            128 => Self::MP128,
            256 => Self::MP256,
            512 => Self::MP512,
            1024 => Self::MP1024,
            _ => return None,
        };
        let orientation = if lsb_first { Self::DSD_LSB } else { Self::DSD_MSB };
        let endian = if little_endian { Self::DSD_LITTLE } else { Self::DSD_BIG };
        Some(
            Self::DSD1
                | Self::DSD_SIZ_32
                | orientation
                | endian
                | base
                | mult
                | Self::channels(channels)?,
        )
    }

    fn rate(sample_rate: u32) -> Option<Self> {
        let (base, mult) = if sample_rate % 44_100 == 0 {
            (Self::RAT_44100, sample_rate / 44_100)
        } else if sample_rate % 48_000 == 0 {
            (Self::RAT_48000, sample_rate / 48_000)
        } else {
            return None;
        };
        let mult = match mult {
            1 => Self::MP1,
            2 => Self::MP2,
            4 => Self::MP4,
            8 => Self::MP8,
            16 => Self::MP16,
            _ => return None,
        };
        Some(base | mult)
    }

    fn channels(channels: u32) -> Option<Self> {
        Some(match channels {
            1 => Self::CHA_1,
            2 => Self::CHA_2,
            4 => Self::CHA_4,
            6 => Self::CHA_6,
            8 => Self::CHA_8,
            _ => return None,
        })
    }
}

impl std::ops::BitOr for FormatFlags {
    type Output = FormatFlags;
    fn bitor(self, rhs: FormatFlags) -> FormatFlags {
        FormatFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for FormatFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TARGETS
// ═══════════════════════════════════════════════════════════════════════════

/// Opaque target address as reported by the finder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress(pub String);

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptive target metadata from discovery.
#[derive(Debug, Clone, Default)]
pub struct TargetInfo {
    pub name: String,
    pub output_name: String,
    pub product_id: u32,
    pub version: u32,
    pub multiport: bool,
}

/// Target discovery and MTU measurement.
pub trait TargetFinder: Send {
    /// All reachable targets, in stable order.
    fn find_outputs(&mut self) -> Vec<(TargetAddress, TargetInfo)>;

    /// Measured path MTU towards the target, or `None` on failure.
    fn measure_mtu(&mut self, addr: &TargetAddress) -> Option<u32>;
}

// ═══════════════════════════════════════════════════════════════════════════
// SESSION DRIVER
// ═══════════════════════════════════════════════════════════════════════════

/// Options for opening an SDK session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub thread_mode: u32,
    pub cycle_time_us: u32,
    pub name: &'static str,
    pub host_id: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            thread_mode: 1,
            cycle_time_us: 2620,
            name: "squeeze2diretta",
            host_id: 0x4452_5400,
        }
    }
}

/// Per-cycle audio source the driver pulls from.
///
/// The implementation resizes `out` to the cycle's byte count and
/// fills it (audio or silence). Returning `false` aborts the cycle.
pub trait StreamSource {
    fn produce_stream(&mut self, out: &mut Vec<u8>) -> bool;
}

/// The SDK session surface the sync adapter drives.
///
/// State-changing calls are never issued concurrently with
/// `run_cycle`; the adapter serialises them behind one lock and joins
/// its worker before `close`.
pub trait SyncDriver: Send {
    fn open(&mut self, opts: &SessionOptions) -> bool;
    fn close(&mut self);

    fn set_sink(&mut self, addr: &TargetAddress, cycle_time_us: u32, flag: bool, mtu: u32)
        -> bool;
    fn check_sink_support(&self, fmt: FormatFlags) -> bool;
    fn set_sink_configure(&mut self, fmt: FormatFlags) -> bool;
    fn sink_configure(&self) -> FormatFlags;

    fn config_transfer_fix_auto(&mut self, cycle_time_us: u32);
    fn config_transfer_var_auto(&mut self, cycle_time_us: u32);
    fn config_transfer_var_max(&mut self, cycle_time_us: u32);

    fn connect_prepare(&mut self) -> bool;
    fn connect(&mut self, flag: u32) -> bool;
    fn connect_wait(&mut self) -> bool;
    fn disconnect(&mut self, wait: bool);
    fn is_online(&self) -> bool;

    fn play(&mut self) -> bool;
    fn stop(&mut self);

    /// Run one transfer cycle, pulling audio via `produce_stream`.
    /// Returns `false` when the session is idle (nothing transferred).
    fn run_cycle(&mut self, source: &mut dyn StreamSource) -> bool;
}
