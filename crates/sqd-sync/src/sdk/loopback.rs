//! In-process loopback target
//!
//! A complete software implementation of the driver contract: honours
//! the open/setSink/connect/play lifecycle, advertises configurable
//! sink capabilities, paces transfer cycles by the configured cycle
//! time, and records everything it is fed. Stands in for the vendor
//! transport during development and drives the sync-level test suite.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{
    FormatFlags, SessionOptions, StreamSource, SyncDriver, TargetAddress, TargetFinder, TargetInfo,
};

/// Sink capabilities the loopback target advertises.
#[derive(Debug, Clone)]
pub struct SinkCaps {
    /// Accepted PCM widths.
    pub pcm_bits: Vec<u32>,
    pub dsd: bool,
    pub dsd_lsb: bool,
    pub dsd_msb: bool,
    pub dsd_little: bool,
    pub dsd_big: bool,
}

impl Default for SinkCaps {
    fn default() -> Self {
        Self {
            pcm_bits: vec![16, 24, 32],
            dsd: true,
            dsd_lsb: true,
            dsd_msb: true,
            dsd_little: true,
            dsd_big: true,
        }
    }
}

/// Observable driver transition, recorded in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Open,
    Close,
    SetSink { cycle_time_us: u32, mtu: u32 },
    SinkConfigure(FormatFlags),
    TransferMode(&'static str),
    ConnectPrepare,
    Connect,
    ConnectWait,
    Disconnect,
    Play,
    Stop,
}

#[derive(Default)]
struct Capture {
    events: Vec<DriverEvent>,
    /// One entry per transfer cycle, in order.
    cycles: Vec<Vec<u8>>,
}

/// Shared view into a loopback driver owned by the sync adapter.
#[derive(Clone)]
pub struct LoopbackHandle {
    capture: Arc<Mutex<Capture>>,
    online: Arc<AtomicBool>,
    cycles_run: Arc<AtomicU64>,
}

impl LoopbackHandle {
    pub fn events(&self) -> Vec<DriverEvent> {
        self.capture.lock().events.clone()
    }

    pub fn cycles(&self) -> Vec<Vec<u8>> {
        self.capture.lock().cycles.clone()
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Count of `Open` events, for reopen-path assertions.
    pub fn open_count(&self) -> usize {
        self.capture
            .lock()
            .events
            .iter()
            .filter(|e| **e == DriverEvent::Open)
            .count()
    }

    /// Total captured bytes in cycles that are not pure `silence`
    /// fill. Cheap enough to poll, unlike cloning the capture.
    pub fn data_byte_count(&self, silence: u8) -> usize {
        self.capture
            .lock()
            .cycles
            .iter()
            .filter(|c| c.iter().any(|&b| b != silence))
            .map(|c| c.len())
            .sum()
    }
}

/// Loopback implementation of [`SyncDriver`].
pub struct LoopbackDriver {
    caps: SinkCaps,
    paced: bool,

    sdk_open: bool,
    sink_set: bool,
    connected: bool,
    playing: bool,
    configured: FormatFlags,
    cycle_time_us: u32,

    next_cycle: Option<Instant>,
    scratch: Vec<u8>,

    capture: Arc<Mutex<Capture>>,
    online: Arc<AtomicBool>,
    cycles_run: Arc<AtomicU64>,
}

impl LoopbackDriver {
    /// Paced driver for interactive use: cycles fire on the configured
    /// cycle time, like a real transport.
    pub fn new(caps: SinkCaps) -> Self {
        Self::build(caps, true)
    }

    /// Test driver: cycles fire at a fixed fast rate regardless of the
    /// configured cycle time, so state-machine tests run in
    /// milliseconds without flooding the capture.
    pub fn unpaced(caps: SinkCaps) -> Self {
        Self::build(caps, false)
    }

    fn build(caps: SinkCaps, paced: bool) -> Self {
        Self {
            caps,
            paced,
            sdk_open: false,
            sink_set: false,
            connected: false,
            playing: false,
            configured: FormatFlags::empty(),
            cycle_time_us: 10_000,
            next_cycle: None,
            scratch: Vec::new(),
            capture: Arc::new(Mutex::new(Capture::default())),
            online: Arc::new(AtomicBool::new(false)),
            cycles_run: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            capture: Arc::clone(&self.capture),
            online: Arc::clone(&self.online),
            cycles_run: Arc::clone(&self.cycles_run),
        }
    }

    fn record(&self, event: DriverEvent) {
        self.capture.lock().events.push(event);
    }

    fn supports(&self, fmt: FormatFlags) -> bool {
        if fmt.contains(FormatFlags::DSD1) {
            if !self.caps.dsd {
                return false;
            }
            if fmt.contains(FormatFlags::DSD_LSB) && !self.caps.dsd_lsb {
                return false;
            }
            if fmt.contains(FormatFlags::DSD_MSB) && !self.caps.dsd_msb {
                return false;
            }
            if fmt.contains(FormatFlags::DSD_LITTLE) && !self.caps.dsd_little {
                return false;
            }
            if fmt.contains(FormatFlags::DSD_BIG) && !self.caps.dsd_big {
                return false;
            }
            return true;
        }

        let bits = if fmt.contains(FormatFlags::PCM_S32) {
            32
        } else if fmt.contains(FormatFlags::PCM_S24) {
            24
        } else if fmt.contains(FormatFlags::PCM_S16) {
            16
        } else {
            return false;
        };
        self.caps.pcm_bits.contains(&bits)
    }
}

impl SyncDriver for LoopbackDriver {
    fn open(&mut self, _opts: &SessionOptions) -> bool {
        self.sdk_open = true;
        self.record(DriverEvent::Open);
        true
    }

    fn close(&mut self) {
        self.sdk_open = false;
        self.sink_set = false;
        self.connected = false;
        self.playing = false;
        self.online.store(false, Ordering::Release);
        self.next_cycle = None;
        self.record(DriverEvent::Close);
    }

    fn set_sink(&mut self, _addr: &TargetAddress, cycle_time_us: u32, _flag: bool, mtu: u32) -> bool {
        if !self.sdk_open {
            return false;
        }
        self.cycle_time_us = cycle_time_us.max(100);
        self.sink_set = true;
        self.record(DriverEvent::SetSink { cycle_time_us, mtu });
        true
    }

    fn check_sink_support(&self, fmt: FormatFlags) -> bool {
        self.sdk_open && self.supports(fmt)
    }

    fn set_sink_configure(&mut self, fmt: FormatFlags) -> bool {
        if !self.sdk_open || !self.supports(fmt) {
            return false;
        }
        self.configured = fmt;
        self.record(DriverEvent::SinkConfigure(fmt));
        true
    }

    fn sink_configure(&self) -> FormatFlags {
        self.configured
    }

    fn config_transfer_fix_auto(&mut self, _cycle_time_us: u32) {
        self.record(DriverEvent::TransferMode("fix_auto"));
    }

    fn config_transfer_var_auto(&mut self, _cycle_time_us: u32) {
        self.record(DriverEvent::TransferMode("var_auto"));
    }

    fn config_transfer_var_max(&mut self, _cycle_time_us: u32) {
        self.record(DriverEvent::TransferMode("var_max"));
    }

    fn connect_prepare(&mut self) -> bool {
        self.record(DriverEvent::ConnectPrepare);
        self.sdk_open && self.sink_set
    }

    fn connect(&mut self, _flag: u32) -> bool {
        if !self.sdk_open || !self.sink_set {
            return false;
        }
        self.connected = true;
        self.record(DriverEvent::Connect);
        true
    }

    fn connect_wait(&mut self) -> bool {
        self.record(DriverEvent::ConnectWait);
        self.connected
    }

    fn disconnect(&mut self, _wait: bool) {
        self.connected = false;
        self.playing = false;
        self.online.store(false, Ordering::Release);
        self.next_cycle = None;
        self.record(DriverEvent::Disconnect);
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn play(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        self.playing = true;
        self.online.store(true, Ordering::Release);
        self.record(DriverEvent::Play);
        true
    }

    fn stop(&mut self) {
        self.playing = false;
        self.online.store(false, Ordering::Release);
        self.next_cycle = None;
        self.record(DriverEvent::Stop);
    }

    fn run_cycle(&mut self, source: &mut dyn StreamSource) -> bool {
        if !(self.sdk_open && self.connected && self.playing) {
            return false;
        }

        if self.paced {
            let now = Instant::now();
            let deadline = self.next_cycle.unwrap_or(now);
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            self.next_cycle =
                Some(deadline.max(now) + Duration::from_micros(self.cycle_time_us as u64));
        } else {
            std::thread::sleep(Duration::from_micros(50));
        }

        if !source.produce_stream(&mut self.scratch) {
            return false;
        }

        self.cycles_run.fetch_add(1, Ordering::AcqRel);
        let mut capture = self.capture.lock();
        // Bound memory for long runs; event order is what matters then.
        if capture.cycles.len() < 65_536 {
            capture.cycles.push(self.scratch.clone());
        }
        true
    }
}

/// Finder advertising a single loopback target.
pub struct LoopbackFinder {
    mtu: u32,
}

impl LoopbackFinder {
    pub fn new() -> Self {
        Self { mtu: 1500 }
    }

    pub fn with_mtu(mtu: u32) -> Self {
        Self { mtu }
    }
}

impl Default for LoopbackFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetFinder for LoopbackFinder {
    fn find_outputs(&mut self) -> Vec<(TargetAddress, TargetInfo)> {
        vec![(
            TargetAddress("loopback".into()),
            TargetInfo {
                name: "Loopback Target".into(),
                output_name: "null sink".into(),
                product_id: 0x4C4F_4F50,
                version: 148,
                multiport: false,
            },
        )]
    }

    fn measure_mtu(&mut self, _addr: &TargetAddress) -> Option<u32> {
        Some(self.mtu)
    }
}
