//! Diretta sync adapter
//!
//! The format-change state machine, the realtime consumer worker, and
//! the producer entry point. One instance owns one SDK session, one
//! worker thread, and one audio ring for the life of the bridge.
//!
//! Threading model:
//! - The bridge thread calls every state-change entry point and
//!   `send_audio`; it is the ring's single producer.
//! - The worker thread is the ring's single consumer; each transfer
//!   cycle is one bounded `produce_stream` invocation.
//! - Ring reconfiguration excludes both sides through a two-variable
//!   epoch (`reconfiguring` flag + `ring_users` count).
//! - Both hot paths cache format state behind generation counters so
//!   the steady state costs one atomic load.

use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use sqd_audio::{
    set_realtime_priority, AudioFormat, AudioRing, DsdConversionMode, S24PackMode, DSD64_RATE,
};

use crate::async_log::{self, AsyncLog, AsyncLogDrain};
use crate::config::{buffer, retry, DirettaConfig, TransferMode};
use crate::cycle::{CycleCalculator, IP_UDP_OVERHEAD};
use crate::error::{SyncError, SyncResult};
use crate::sdk::{
    FormatFlags, SessionOptions, StreamSource, SyncDriver, TargetAddress, TargetFinder, TargetInfo,
};

/// Producer backpressure threshold: wait when the ring is this full.
pub const HIGH_WATER: f32 = 0.75;

/// Coarse lifecycle state, derived from the internal flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disabled,
    Enabled,
    Open,
    Playing,
    Paused,
}

// ═══════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════

/// State shared between the bridge thread and the worker.
struct Shared {
    ring: AudioRing,

    enabled: AtomicBool,
    sdk_open: AtomicBool,
    open: AtomicBool,
    playing: AtomicBool,
    paused: AtomicBool,
    online: AtomicBool,

    running: AtomicBool,
    stop_requested: AtomicBool,
    draining: AtomicBool,
    worker_active: AtomicBool,

    reconfiguring: AtomicBool,
    ring_users: AtomicI32,

    /// Serialises sink/ring configuration against itself.
    config_mutex: Mutex<()>,

    /// Producer flow control: consumer notifies after each pop.
    flow_mutex: Mutex<()>,
    space_available: Condvar,

    /// Interruptible format-transition waits, woken by disable().
    transition_mutex: Mutex<()>,
    transition_cv: Condvar,
    transition_wakeup: AtomicBool,

    // Format parameters, written under config_mutex inside the epoch.
    sample_rate: AtomicU32,
    channels: AtomicU32,
    bytes_per_sample: AtomicU32,
    bytes_per_cycle: AtomicUsize,
    bytes_per_frame: AtomicUsize,
    frames_remainder: AtomicU32,
    frames_accumulator: AtomicU32,
    need_pack24: AtomicBool,
    need_widen_16_32: AtomicBool,
    need_widen_16_24: AtomicBool,
    is_dsd: AtomicBool,
    low_bitrate: AtomicBool,
    dsd_mode: AtomicU8,

    // Bumped (release) after a complete parameter update; the hot
    // paths reload their caches on mismatch.
    producer_gen: AtomicU32,
    consumer_gen: AtomicU32,

    prefill_target: AtomicUsize,
    prefill_complete: AtomicBool,
    post_online_done: AtomicBool,
    silence_remaining: AtomicI32,
    stabilization_count: AtomicI32,

    effective_mtu: AtomicU32,

    stream_count: AtomicU64,
    push_count: AtomicU64,
    underrun_count: AtomicU32,
    silence_chunks: AtomicU64,

    alog: AsyncLog,
}

impl Shared {
    fn new(alog: AsyncLog) -> Self {
        Self {
            ring: AudioRing::new(),
            enabled: AtomicBool::new(false),
            sdk_open: AtomicBool::new(false),
            open: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            online: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            worker_active: AtomicBool::new(false),
            reconfiguring: AtomicBool::new(false),
            ring_users: AtomicI32::new(0),
            config_mutex: Mutex::new(()),
            flow_mutex: Mutex::new(()),
            space_available: Condvar::new(),
            transition_mutex: Mutex::new(()),
            transition_cv: Condvar::new(),
            transition_wakeup: AtomicBool::new(false),
            sample_rate: AtomicU32::new(44_100),
            channels: AtomicU32::new(2),
            bytes_per_sample: AtomicU32::new(2),
            bytes_per_cycle: AtomicUsize::new(176),
            bytes_per_frame: AtomicUsize::new(0),
            frames_remainder: AtomicU32::new(0),
            frames_accumulator: AtomicU32::new(0),
            need_pack24: AtomicBool::new(false),
            need_widen_16_32: AtomicBool::new(false),
            need_widen_16_24: AtomicBool::new(false),
            is_dsd: AtomicBool::new(false),
            low_bitrate: AtomicBool::new(false),
            dsd_mode: AtomicU8::new(0),
            producer_gen: AtomicU32::new(0),
            consumer_gen: AtomicU32::new(0),
            prefill_target: AtomicUsize::new(0),
            prefill_complete: AtomicBool::new(false),
            post_online_done: AtomicBool::new(false),
            silence_remaining: AtomicI32::new(0),
            stabilization_count: AtomicI32::new(0),
            effective_mtu: AtomicU32::new(1500),
            stream_count: AtomicU64::new(0),
            push_count: AtomicU64::new(0),
            underrun_count: AtomicU32::new(0),
            silence_chunks: AtomicU64::new(0),
            alog,
        }
    }
}

fn mode_to_u8(mode: DsdConversionMode) -> u8 {
    match mode {
        DsdConversionMode::Passthrough => 0,
        DsdConversionMode::BitReverseOnly => 1,
        DsdConversionMode::ByteSwapOnly => 2,
        DsdConversionMode::BitReverseAndSwap => 3,
    }
}

fn u8_to_mode(v: u8) -> DsdConversionMode {
    match v {
        1 => DsdConversionMode::BitReverseOnly,
        2 => DsdConversionMode::ByteSwapOnly,
        3 => DsdConversionMode::BitReverseAndSwap,
        _ => DsdConversionMode::Passthrough,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RECONFIGURE EPOCH
// ═══════════════════════════════════════════════════════════════════════════

/// Scoped ring access for the hot paths. Inactive while a reconfigure
/// is pending; the caller emits silence / returns 0 instead.
struct RingGuard<'a> {
    shared: &'a Shared,
    active: bool,
}

impl<'a> RingGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        if shared.reconfiguring.load(Ordering::Acquire) {
            return Self {
                shared,
                active: false,
            };
        }
        shared.ring_users.fetch_add(1, Ordering::Acquire);
        if shared.reconfiguring.load(Ordering::Acquire) {
            // Never entered the guarded section.
            shared.ring_users.fetch_sub(1, Ordering::Relaxed);
            return Self {
                shared,
                active: false,
            };
        }
        Self {
            shared,
            active: true,
        }
    }

    fn active(&self) -> bool {
        self.active
    }
}

impl Drop for RingGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            // Release: ring writes complete before the reconfigurer
            // observes the count reaching zero.
            self.shared.ring_users.fetch_sub(1, Ordering::Release);
        }
    }
}

/// Excludes both ring sides for the duration of a reconfiguration.
struct ReconfigureGuard<'a> {
    shared: &'a Shared,
}

impl<'a> ReconfigureGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.reconfiguring.store(true, Ordering::Release);
        while shared.ring_users.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
        Self { shared }
    }
}

impl Drop for ReconfigureGuard<'_> {
    fn drop(&mut self) {
        self.shared.reconfiguring.store(false, Ordering::Release);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONSUMER (worker-side cycle producer)
// ═══════════════════════════════════════════════════════════════════════════

/// Per-cycle state owned by the worker thread. Cached fields reload
/// when the consumer generation changes.
struct CycleProducer {
    shared: Arc<Shared>,
    gen: u32,
    bytes_per_cycle: usize,
    bytes_per_frame: usize,
    frames_remainder: u32,
    silence_byte: u8,
    is_dsd: bool,
    sample_rate: u32,
    channels: u32,
}

impl CycleProducer {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            gen: u32::MAX,
            bytes_per_cycle: 0,
            bytes_per_frame: 0,
            frames_remainder: 0,
            silence_byte: 0,
            is_dsd: false,
            sample_rate: 44_100,
            channels: 2,
        }
    }

    fn reload_cache(&mut self, gen: u32) {
        let s = &*self.shared;
        self.bytes_per_cycle = s.bytes_per_cycle.load(Ordering::Acquire);
        self.bytes_per_frame = s.bytes_per_frame.load(Ordering::Acquire);
        self.frames_remainder = s.frames_remainder.load(Ordering::Acquire);
        self.silence_byte = s.ring.silence_byte();
        self.is_dsd = s.is_dsd.load(Ordering::Acquire);
        self.sample_rate = s.sample_rate.load(Ordering::Acquire);
        self.channels = s.channels.load(Ordering::Acquire);
        self.gen = gen;
    }

    /// Silence cycles after the target comes online. PCM uses a fixed
    /// count; DSD scales to a rate-dependent warmup time using the
    /// known cycle duration.
    fn stabilization_target(&self) -> i32 {
        if !self.is_dsd {
            return buffer::POST_ONLINE_SILENCE_BUFFERS;
        }

        let mult = (self.sample_rate / DSD64_RATE).max(1);
        let warmup_us = 50_000.0 * mult as f64;

        let efficient_mtu = self
            .shared
            .effective_mtu
            .load(Ordering::Acquire)
            .saturating_sub(IP_UDP_OVERHEAD)
            .max(1);
        let bytes_per_second = self.sample_rate as f64 * self.channels as f64 / 8.0;
        let cycle_us = efficient_mtu as f64 / bytes_per_second * 1_000_000.0;

        ((warmup_us / cycle_us).ceil() as i32).clamp(50, 3000)
    }

    fn fill(&mut self, out: &mut Vec<u8>) -> bool {
        let shared = Arc::clone(&self.shared);
        let s = &*shared;

        let gen = s.consumer_gen.load(Ordering::Acquire);
        if gen != self.gen {
            self.reload_cache(gen);
        }

        // 44.1kHz-family drift correction: one extra frame whenever
        // the per-cycle remainder accumulates past a millisecond.
        let mut bpc = self.bytes_per_cycle;
        if self.frames_remainder != 0 {
            let mut acc = s.frames_accumulator.load(Ordering::Relaxed);
            acc += self.frames_remainder;
            if acc >= 1000 {
                acc -= 1000;
                bpc += self.bytes_per_frame;
            }
            s.frames_accumulator.store(acc, Ordering::Relaxed);
        }
        if bpc == 0 {
            return false;
        }
        out.resize(bpc, self.silence_byte);

        let guard = RingGuard::new(s);
        if !guard.active() {
            out[..bpc].fill(self.silence_byte);
            return true;
        }

        // Pipeline-flush silence on transitions and shutdown.
        if s.silence_remaining.load(Ordering::Acquire) > 0 {
            out[..bpc].fill(self.silence_byte);
            s.silence_remaining.fetch_sub(1, Ordering::AcqRel);
            return true;
        }

        if s.stop_requested.load(Ordering::Acquire) {
            out[..bpc].fill(self.silence_byte);
            return true;
        }

        // Audible output is gated until the producer has buffered the
        // prefill target.
        if !s.prefill_complete.load(Ordering::Acquire) {
            out[..bpc].fill(self.silence_byte);
            return true;
        }

        // Post-online stabilisation: keep feeding silence while the
        // target's clock locks.
        if !s.post_online_done.load(Ordering::Acquire) {
            let target = self.stabilization_target();
            let count = s.stabilization_count.fetch_add(1, Ordering::Relaxed) + 1;
            if count >= target {
                s.post_online_done.store(true, Ordering::Release);
                s.stabilization_count.store(0, Ordering::Relaxed);
                s.alog
                    .debug(format_args!("post-online stabilisation done ({count} cycles)"));
            }
            out[..bpc].fill(self.silence_byte);
            return true;
        }

        let count = s.stream_count.fetch_add(1, Ordering::Relaxed) + 1;
        let avail = s.ring.available();

        if avail < bpc {
            // Underruns do not halt playback; they are counted and
            // summarised at session end.
            s.underrun_count.fetch_add(1, Ordering::Relaxed);
            out[..bpc].fill(self.silence_byte);
            return true;
        }

        s.ring.pop(&mut out[..bpc]);

        if count <= 5 || count % 5000 == 0 {
            s.alog.debug(format_args!(
                "cycle #{count} bytes={bpc} avail={avail} {}",
                if self.is_dsd { "[DSD]" } else { "[PCM]" }
            ));
        }

        // Wake a waiting producer; never block the cycle on the lock.
        if let Some(g) = s.flow_mutex.try_lock() {
            drop(g);
            s.space_available.notify_one();
        }

        true
    }
}

impl StreamSource for CycleProducer {
    fn produce_stream(&mut self, out: &mut Vec<u8>) -> bool {
        self.shared.worker_active.store(true, Ordering::Release);
        let result = self.fill(out);
        self.shared.worker_active.store(false, Ordering::Release);
        result
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PRODUCER CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// send_audio's cached view of the format state.
struct ProducerCache {
    gen: u32,
    is_dsd: bool,
    pack24: bool,
    widen_16_32: bool,
    widen_16_24: bool,
    channels: usize,
    bytes_per_sample: usize,
    dsd_mode: DsdConversionMode,
}

impl ProducerCache {
    fn stale() -> Self {
        Self {
            gen: u32::MAX,
            is_dsd: false,
            pack24: false,
            widen_16_32: false,
            widen_16_24: false,
            channels: 2,
            bytes_per_sample: 2,
            dsd_mode: DsdConversionMode::Passthrough,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DIRETTA SYNC
// ═══════════════════════════════════════════════════════════════════════════

/// The bridge-facing sync adapter. See the module docs for the
/// threading model.
pub struct DirettaSync {
    shared: Arc<Shared>,
    driver: Arc<Mutex<Box<dyn SyncDriver>>>,
    finder: Box<dyn TargetFinder>,
    config: DirettaConfig,
    calculator: Option<CycleCalculator>,

    target: Option<(TargetAddress, TargetInfo)>,
    target_index: Option<usize>,
    mtu_override: u32,

    worker: Option<JoinHandle<()>>,

    current_format: Option<AudioFormat>,
    previous_format: Option<AudioFormat>,

    pcache: ProducerCache,

    _log_drain: AsyncLogDrain,
}

impl DirettaSync {
    pub fn new(finder: Box<dyn TargetFinder>, driver: Box<dyn SyncDriver>) -> Self {
        let (alog, drain) = async_log::spawn();
        Self {
            shared: Arc::new(Shared::new(alog)),
            driver: Arc::new(Mutex::new(driver)),
            finder,
            config: DirettaConfig::default(),
            calculator: None,
            target: None,
            target_index: None,
            mtu_override: 0,
            worker: None,
            current_format: None,
            previous_format: None,
            pcache: ProducerCache::stale(),
            _log_drain: drain,
        }
    }

    /// 1-based selection happens in the CLI; this takes 0-based.
    pub fn set_target_index(&mut self, index: usize) {
        self.target_index = Some(index);
    }

    pub fn set_mtu(&mut self, mtu: u32) {
        self.mtu_override = mtu;
    }

    pub fn state(&self) -> SyncState {
        let s = &*self.shared;
        if !s.enabled.load(Ordering::Acquire) {
            SyncState::Disabled
        } else if !s.open.load(Ordering::Acquire) {
            SyncState::Enabled
        } else if s.paused.load(Ordering::Acquire) {
            SyncState::Paused
        } else if s.playing.load(Ordering::Acquire) {
            SyncState::Playing
        } else {
            SyncState::Open
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.current_format
    }

    pub fn is_prefill_complete(&self) -> bool {
        self.shared.prefill_complete.load(Ordering::Acquire)
    }

    pub fn prefill_target(&self) -> usize {
        self.shared.prefill_target.load(Ordering::Acquire)
    }

    pub fn underruns(&self) -> u32 {
        self.shared.underrun_count.load(Ordering::Relaxed)
    }

    /// Propagate a container-alignment hint for 24-bit sources that
    /// start with silence.
    pub fn set_s24_hint(&self, hint: S24PackMode) {
        self.shared.ring.set_s24_hint(hint);
    }

    /// Count of silence chunks injected by the bridge during stalled
    /// burst-fills (bridge-maintained, reported in dump_stats).
    pub fn note_silence_chunk(&self) {
        self.shared.silence_chunks.fetch_add(1, Ordering::Relaxed);
    }

    // ═══════════════════════════════════════════════════════════════════
    // ENABLE / DISABLE
    // ═══════════════════════════════════════════════════════════════════

    /// Discover the target, measure the MTU and open the SDK session.
    pub fn enable(&mut self, config: DirettaConfig) -> SyncResult<()> {
        if self.shared.enabled.load(Ordering::Acquire) {
            log::debug!("enable: already enabled");
            return Ok(());
        }
        self.config = config;

        let targets = self.finder.find_outputs();
        if targets.is_empty() {
            return Err(SyncError::NoTargets);
        }
        log::info!("found {} Diretta target(s)", targets.len());

        let picked = match self.target_index {
            Some(i) if i >= targets.len() => {
                return Err(SyncError::TargetIndexOutOfRange {
                    index: i,
                    count: targets.len(),
                })
            }
            Some(i) => targets[i].clone(),
            None => targets[0].clone(),
        };
        log::info!("selected target: {} ({})", picked.1.name, picked.0);

        let mtu = if self.mtu_override > 0 {
            self.mtu_override
        } else if self.config.mtu > 0 {
            self.config.mtu
        } else {
            match self.finder.measure_mtu(&picked.0) {
                Some(measured) if measured > 0 => {
                    log::info!("measured MTU: {measured}");
                    measured
                }
                _ => {
                    log::warn!(
                        "MTU measurement failed, using fallback {}",
                        self.config.mtu_fallback
                    );
                    self.config.mtu_fallback
                }
            }
        };
        self.shared.effective_mtu.store(mtu, Ordering::Release);
        self.calculator = Some(CycleCalculator::new(mtu));
        self.target = Some(picked);

        self.open_sdk_session()?;
        self.shared.enabled.store(true, Ordering::Release);
        log::info!("sync adapter enabled, MTU={mtu}");
        Ok(())
    }

    /// Hard cancellation point: wakes pending transition waits, closes
    /// the connection, joins the worker and closes the SDK. Idempotent.
    pub fn disable(&mut self) {
        log::debug!("disable");
        wake_transitions(&self.shared);

        if self.shared.open.load(Ordering::Acquire) {
            self.close();
        }

        if self.shared.enabled.load(Ordering::Acquire) {
            self.shutdown_worker();
            self.driver.lock().close();
            self.shared.sdk_open.store(false, Ordering::Release);
            self.calculator = None;
            self.shared.enabled.store(false, Ordering::Release);
        }

        self.previous_format = None;
        log::debug!("disabled");
    }

    fn open_sdk_session(&mut self) -> SyncResult<()> {
        let opts = SessionOptions {
            thread_mode: self.config.thread_mode,
            cycle_time_us: self.config.cycle_time_us,
            ..SessionOptions::default()
        };

        for attempt in 0..retry::OPEN_RETRIES {
            if attempt > 0 {
                log::debug!("SDK open retry #{attempt}");
                std::thread::sleep(Duration::from_millis(retry::OPEN_DELAY_MS));
            }
            if self.driver.lock().open(&opts) {
                self.shared.sdk_open.store(true, Ordering::Release);
                return Ok(());
            }
        }
        Err(SyncError::SdkOpenFailed {
            attempts: retry::OPEN_RETRIES,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // OPEN / CLOSE / RELEASE
    // ═══════════════════════════════════════════════════════════════════

    /// Open (or reopen) the connection for a track format. Selects the
    /// cheapest transition the previous format allows.
    pub fn open(&mut self, format: AudioFormat) -> SyncResult<()> {
        log::info!("open: {format}");

        if !self.shared.enabled.load(Ordering::Acquire) {
            return Err(SyncError::NotEnabled);
        }

        // The SDK session may have been released between tracks.
        if !self.shared.sdk_open.load(Ordering::Acquire) {
            log::info!("SDK session was released, reopening");
            self.open_sdk_session()?;
        }

        if self.shared.open.load(Ordering::Acquire) {
            if let Some(prev) = self.previous_format {
                log::info!("  previous: {prev}");
                if prev == format {
                    return self.quick_resume(format);
                }
                self.transition_teardown(prev, format)?;
            }
        }

        self.full_reset();
        self.shared
            .is_dsd
            .store(format.is_dsd, Ordering::Release);

        let (effective_rate, bits_per_sample) = if format.is_dsd {
            let byte_rate = format.sample_rate / 8;
            self.configure_sink_dsd(&format)?;
            self.configure_ring_dsd(byte_rate, format.channels);
            (format.sample_rate, 1)
        } else {
            let accepted_bits = self.configure_sink_pcm(&format)?;
            let diretta_bps = accepted_bits / 8;
            let input_bps = format.input_bytes_per_sample();
            self.configure_ring_pcm(
                format.sample_rate,
                format.channels,
                diretta_bps,
                input_bps,
                format.is_compressed,
            );
            (format.sample_rate, accepted_bits)
        };

        let cycle_us = self.cycle_time(effective_rate, format.channels, bits_per_sample);

        // Give the target time to prepare for the new format.
        std::thread::sleep(Duration::from_millis(500));

        let addr = self
            .target
            .as_ref()
            .map(|(a, _)| a.clone())
            .expect("enabled implies a selected target");
        let mtu = self.shared.effective_mtu.load(Ordering::Acquire);

        let mut sink_set = false;
        for attempt in 0..retry::SETSINK_RETRIES_FULL {
            if attempt > 0 {
                log::debug!("setSink retry #{attempt}");
                std::thread::sleep(Duration::from_millis(retry::SETSINK_DELAY_FULL_MS));
            }
            if self.driver.lock().set_sink(&addr, cycle_us, false, mtu) {
                sink_set = true;
                break;
            }
        }
        if !sink_set {
            return Err(SyncError::SetSinkFailed {
                attempts: retry::SETSINK_RETRIES_FULL,
            });
        }

        self.apply_transfer_mode(cycle_us);

        {
            let mut driver = self.driver.lock();
            if !driver.connect_prepare() {
                return Err(SyncError::ConnectPrepareFailed);
            }
        }

        let mut connected = false;
        for attempt in 0..retry::CONNECT_RETRIES {
            if attempt > 0 {
                log::debug!("connect retry #{attempt}");
                std::thread::sleep(Duration::from_millis(retry::CONNECT_DELAY_MS));
            }
            if self.driver.lock().connect(0) {
                connected = true;
                break;
            }
        }
        if !connected {
            return Err(SyncError::ConnectFailed {
                attempts: retry::CONNECT_RETRIES,
            });
        }

        if !self.driver.lock().connect_wait() {
            self.driver.lock().disconnect(false);
            return Err(SyncError::ConnectWaitFailed);
        }

        // Fresh playback state: re-arm prefill and stabilisation.
        {
            let _lock = self.shared.config_mutex.lock();
            let _epoch = ReconfigureGuard::new(&self.shared);
            self.shared.ring.clear();
        }
        self.shared.prefill_complete.store(false, Ordering::Release);
        self.shared.post_online_done.store(false, Ordering::Release);
        self.shared.stabilization_count.store(0, Ordering::Release);

        self.ensure_worker();
        self.driver.lock().play();

        if !self.wait_online(self.config.online_wait_ms) {
            log::warn!("target did not come online within {}ms", self.config.online_wait_ms);
        }

        self.shared.post_online_done.store(false, Ordering::Release);
        self.shared.stabilization_count.store(0, Ordering::Release);

        self.previous_format = Some(format);
        self.current_format = Some(format);
        self.shared.open.store(true, Ordering::Release);
        self.shared.playing.store(true, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);

        log::info!("open complete: {format}");
        Ok(())
    }

    /// Same-format reopen: flush, clear, re-arm prefill, resume. The
    /// DAC is known stable, so post-online stabilisation is NOT
    /// re-armed.
    fn quick_resume(&mut self, format: AudioFormat) -> SyncResult<()> {
        log::info!("same format, quick resume (no setSink)");

        if self.shared.is_dsd.load(Ordering::Acquire) {
            self.request_shutdown_silence(buffer::REOPEN_SILENCE_DSD);
            let start = Instant::now();
            while self.shared.silence_remaining.load(Ordering::Acquire) > 0 {
                if start.elapsed() > Duration::from_millis(100) {
                    break;
                }
                std::thread::yield_now();
            }
        }

        {
            let _lock = self.shared.config_mutex.lock();
            let _epoch = ReconfigureGuard::new(&self.shared);
            self.shared.ring.clear();
        }
        self.shared.prefill_complete.store(false, Ordering::Release);
        // post_online_done stays true: no stabilisation re-arm.
        self.shared.stabilization_count.store(0, Ordering::Release);
        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.draining.store(false, Ordering::Release);
        self.shared.silence_remaining.store(0, Ordering::Release);

        self.driver.lock().play();
        self.refresh_online();

        self.shared.playing.store(true, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
        self.current_format = Some(format);
        self.previous_format = Some(format);
        log::info!("open complete (quick)");
        Ok(())
    }

    /// Tear down and reopen the SDK for a format change, waiting long
    /// enough for the target to reset. Sink configuration is left to
    /// the caller, which knows the new cycle time.
    fn transition_teardown(
        &mut self,
        prev: AudioFormat,
        next: AudioFormat,
    ) -> SyncResult<()> {
        let was_dsd = prev.is_dsd;
        let now_dsd = next.is_dsd;
        let dsd_rate_change = was_dsd && now_dsd && prev.sample_rate != next.sample_rate;
        let pcm_rate_change = !was_dsd && !now_dsd && prev.sample_rate != next.sample_rate;

        if was_dsd && (!now_dsd || dsd_rate_change) {
            // DSD source transitions need a clean break: rate changes
            // leave stale samples in the target's pipeline and clock
            // domain switches need the PLL to re-lock.
            let mult = prev.dsd_multiplier();
            if now_dsd {
                log::info!(
                    "DSD{}->DSD{} rate change, full close/reopen",
                    64 * prev.sample_rate / DSD64_RATE,
                    64 * next.sample_rate / DSD64_RATE
                );
            } else {
                log::info!("DSD->PCM transition, full close/reopen");
            }

            self.teardown_connection();

            let mut delay_ms = 200u64 * mult as u64;
            if !now_dsd && next.sample_rate >= 176_400 {
                // High-rate PCM destinations need extra settling time.
                delay_ms += 100 * (next.sample_rate / 44_100) as u64;
            }
            log::info!("waiting {delay_ms}ms for target reset");
            self.interruptible_wait(delay_ms);
            self.reopen_sdk()?;
        } else if pcm_rate_change {
            log::info!(
                "PCM {}Hz->{}Hz rate change, full close/reopen",
                prev.sample_rate,
                next.sample_rate
            );
            self.teardown_connection();
            self.interruptible_wait(100);
            self.reopen_sdk()?;
        } else {
            let same_family =
                prev.clock_family() != 0 && prev.clock_family() == next.clock_family();
            let old_high_rate = prev.sample_rate >= 176_400;
            let new_high_rate = next.sample_rate >= 11_289_600;

            if !was_dsd && now_dsd && same_family && (old_high_rate || new_high_rate) {
                // Same-family high-rate PCM->DSD leaves the PLL stuck
                // without a full reset.
                let mult = next.dsd_multiplier();
                log::info!(
                    "high-rate PCM->DSD{} (same {}Hz family), full close/reopen",
                    64 * next.sample_rate / DSD64_RATE,
                    prev.clock_family()
                );
                self.teardown_connection();
                self.interruptible_wait(200 * mult as u64);
                self.reopen_sdk()?;
            } else {
                log::info!("format change, reopen");
                self.teardown_connection();
                self.interruptible_wait(self.config.format_switch_delay_ms as u64);
                self.reopen_sdk()?;
            }
        }
        Ok(())
    }

    /// Stop, disconnect, join the worker, close the SDK. The worker
    /// must be joined before close: the cycle callback reaches into
    /// SDK state.
    fn teardown_connection(&mut self) {
        self.shared.silence_remaining.store(0, Ordering::Release);

        {
            let mut driver = self.driver.lock();
            driver.stop();
            driver.disconnect(true);
        }
        self.shared.online.store(false, Ordering::Release);

        self.shutdown_worker();
        self.driver.lock().close();
        self.shared.sdk_open.store(false, Ordering::Release);

        self.shared.open.store(false, Ordering::Release);
        self.shared.playing.store(false, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
    }

    fn reopen_sdk(&mut self) -> SyncResult<()> {
        let opts = SessionOptions {
            thread_mode: self.config.thread_mode,
            cycle_time_us: self.config.cycle_time_us,
            ..SessionOptions::default()
        };
        if !self.driver.lock().open(&opts) {
            return Err(SyncError::SdkOpenFailed { attempts: 1 });
        }
        self.shared.sdk_open.store(true, Ordering::Release);
        log::info!("SDK session reopened");
        Ok(())
    }

    /// Reset playback counters and the ring ahead of a (re)configure.
    fn full_reset(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.draining.store(false, Ordering::Release);

        let mut waits = 0;
        while self.shared.worker_active.load(Ordering::Acquire) && waits < 50 {
            std::thread::sleep(Duration::from_millis(10));
            waits += 1;
        }

        {
            let _lock = self.shared.config_mutex.lock();
            let _epoch = ReconfigureGuard::new(&self.shared);
            let s = &*self.shared;

            s.prefill_complete.store(false, Ordering::Release);
            s.post_online_done.store(false, Ordering::Release);
            s.silence_remaining.store(0, Ordering::Release);
            s.stabilization_count.store(0, Ordering::Release);
            s.stream_count.store(0, Ordering::Release);
            s.push_count.store(0, Ordering::Release);
            s.is_dsd.store(false, Ordering::Release);
            s.need_pack24.store(false, Ordering::Release);
            s.need_widen_16_32.store(false, Ordering::Release);
            s.need_widen_16_24.store(false, Ordering::Release);
            s.low_bitrate.store(false, Ordering::Release);
            s.dsd_mode
                .store(mode_to_u8(DsdConversionMode::Passthrough), Ordering::Release);
            s.bytes_per_frame.store(0, Ordering::Release);
            s.frames_remainder.store(0, Ordering::Release);
            s.frames_accumulator.store(0, Ordering::Release);
            s.ring.clear();

            // New consumer-visible state: invalidate both caches.
            s.producer_gen.fetch_add(1, Ordering::Release);
            s.consumer_gen.fetch_add(1, Ordering::Release);
        }

        self.shared.stop_requested.store(false, Ordering::Release);
    }

    /// Close the connection but keep the SDK session for fast reuse.
    pub fn close(&mut self) {
        log::info!("close");
        if !self.shared.open.load(Ordering::Acquire) {
            log::debug!("close: not open");
            return;
        }

        let is_dsd = self.shared.is_dsd.load(Ordering::Acquire);
        self.request_shutdown_silence(if is_dsd {
            buffer::CLOSE_SILENCE_DSD
        } else {
            buffer::CLOSE_SILENCE_PCM
        });

        let start = Instant::now();
        while self.shared.silence_remaining.load(Ordering::Acquire) > 0 {
            if start.elapsed() > Duration::from_millis(150) {
                log::debug!("shutdown silence timeout");
                break;
            }
            std::thread::yield_now();
        }

        self.shared.stop_requested.store(true, Ordering::Release);

        {
            let mut driver = self.driver.lock();
            driver.stop();
            driver.disconnect(true);
        }
        self.shared.online.store(false, Ordering::Release);

        let mut waits = 0;
        while self.shared.worker_active.load(Ordering::Acquire) && waits < 50 {
            std::thread::sleep(Duration::from_millis(10));
            waits += 1;
        }

        self.shared.open.store(false, Ordering::Release);
        self.shared.playing.store(false, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);

        let underruns = self.shared.underrun_count.swap(0, Ordering::Relaxed);
        if underruns > 0 {
            log::warn!("session had {underruns} underrun(s)");
        }
        log::info!("close done");
    }

    /// Close and fully release the target so other sources can claim
    /// it. The next open() reopens the SDK automatically.
    pub fn release(&mut self) {
        log::info!("release: fully releasing target");
        if self.shared.open.load(Ordering::Acquire) {
            self.close();
        }

        if self.shared.sdk_open.load(Ordering::Acquire) {
            self.shutdown_worker();
            self.driver.lock().close();
            self.shared.sdk_open.store(false, Ordering::Release);
            // Let the target process the disconnect.
            std::thread::sleep(Duration::from_millis(100));
            log::info!("target released");
        }

        self.previous_format = None;
    }

    // ═══════════════════════════════════════════════════════════════════
    // PLAYBACK CONTROL
    // ═══════════════════════════════════════════════════════════════════

    pub fn pause(&mut self) {
        let s = &*self.shared;
        if !s.playing.load(Ordering::Acquire) || s.paused.load(Ordering::Acquire) {
            return;
        }

        let is_dsd = s.is_dsd.load(Ordering::Acquire);
        self.request_shutdown_silence(if is_dsd {
            buffer::PAUSE_SILENCE_DSD
        } else {
            buffer::PAUSE_SILENCE_PCM
        });

        let start = Instant::now();
        while self.shared.silence_remaining.load(Ordering::Acquire) > 0 {
            if start.elapsed() > Duration::from_millis(80) {
                break;
            }
            std::thread::yield_now();
        }

        self.driver.lock().stop();
        self.shared.online.store(false, Ordering::Release);
        self.shared.paused.store(true, Ordering::Release);
        log::info!("paused");
    }

    pub fn resume(&mut self) {
        if !self.shared.paused.load(Ordering::Acquire) {
            return;
        }
        log::info!("resuming from pause");

        self.shared.draining.store(false, Ordering::Release);
        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.silence_remaining.store(0, Ordering::Release);

        {
            let _lock = self.shared.config_mutex.lock();
            let _epoch = ReconfigureGuard::new(&self.shared);
            self.shared.ring.clear();
        }
        self.shared.prefill_complete.store(false, Ordering::Release);

        self.driver.lock().play();
        self.refresh_online();
        self.shared.paused.store(false, Ordering::Release);
        self.shared.playing.store(true, Ordering::Release);
    }

    /// Queue silence cycles ahead of a stop or transition. DSD scales
    /// the count with the rate: deeper pipelines need a longer flush.
    pub fn request_shutdown_silence(&self, cycles: i32) {
        let s = &*self.shared;
        let mut scaled = cycles;
        if s.is_dsd.load(Ordering::Relaxed) {
            let mult = (s.sample_rate.load(Ordering::Relaxed) / DSD64_RATE).max(1);
            scaled = cycles * mult as i32;
        }
        s.silence_remaining.store(scaled, Ordering::Release);
        s.draining.store(true, Ordering::Release);
        s.alog
            .debug(format_args!("requested {scaled} shutdown silence cycle(s)"));
    }

    // ═══════════════════════════════════════════════════════════════════
    // AUDIO DATA (producer entry)
    // ═══════════════════════════════════════════════════════════════════

    /// Push audio. Non-blocking; returns bytes consumed, 0 when gated.
    ///
    /// `num_samples` is frames for PCM and DSD bits per channel for
    /// DSD (total bytes = `num_samples * channels / 8`).
    pub fn send_audio(&mut self, data: &[u8], num_samples: usize) -> usize {
        let shared = Arc::clone(&self.shared);
        let s = &*shared;

        if s.draining.load(Ordering::Acquire) || s.stop_requested.load(Ordering::Acquire) {
            return 0;
        }
        if !s.online.load(Ordering::Acquire) && !self.refresh_online() {
            return 0;
        }

        let guard = RingGuard::new(s);
        if !guard.active() {
            return 0;
        }

        let gen = s.producer_gen.load(Ordering::Acquire);
        if gen != self.pcache.gen {
            self.pcache = ProducerCache {
                gen,
                is_dsd: s.is_dsd.load(Ordering::Acquire),
                pack24: s.need_pack24.load(Ordering::Acquire),
                widen_16_32: s.need_widen_16_32.load(Ordering::Acquire),
                widen_16_24: s.need_widen_16_24.load(Ordering::Acquire),
                channels: s.channels.load(Ordering::Acquire) as usize,
                bytes_per_sample: s.bytes_per_sample.load(Ordering::Acquire) as usize,
                dsd_mode: u8_to_mode(s.dsd_mode.load(Ordering::Acquire)),
            };
        }
        let c = &self.pcache;

        let (written, total, label) = if c.is_dsd {
            let total = (num_samples * c.channels / 8).min(data.len());
            (
                s.ring.push_dsd_planar(&data[..total], c.channels, c.dsd_mode),
                total,
                "DSD",
            )
        } else if c.pack24 {
            let total = (num_samples * 4 * c.channels).min(data.len());
            (s.ring.push_24_packed(&data[..total]), total, "PCM24")
        } else if c.widen_16_32 {
            let total = (num_samples * 2 * c.channels).min(data.len());
            (s.ring.push_16_to_32(&data[..total]), total, "PCM16->32")
        } else if c.widen_16_24 {
            let total = (num_samples * 2 * c.channels).min(data.len());
            (s.ring.push_16_to_24(&data[..total]), total, "PCM16->24")
        } else {
            let total = (num_samples * c.bytes_per_sample * c.channels).min(data.len());
            (s.ring.push(&data[..total]), total, "PCM")
        };

        if written > 0 {
            if !s.prefill_complete.load(Ordering::Acquire)
                && s.ring.available() >= s.prefill_target.load(Ordering::Acquire)
            {
                s.prefill_complete.store(true, Ordering::Release);
                s.alog.debug(format_args!(
                    "{label} prefill complete: {} bytes",
                    s.ring.available()
                ));
            }

            let count = s.push_count.fetch_add(1, Ordering::Relaxed) + 1;
            if count <= 3 || count % 500 == 0 {
                s.alog.debug(format_args!(
                    "send_audio #{count} in={total} out={written} avail={} [{label}]",
                    s.ring.available()
                ));
            }
        }

        written
    }

    /// Ring fill level in [0.0, 1.0].
    pub fn buffer_level(&self) -> f32 {
        let guard = RingGuard::new(&self.shared);
        if !guard.active() {
            return 0.0;
        }
        let size = self.shared.ring.size();
        if size == 0 {
            return 0.0;
        }
        self.shared.ring.available() as f32 / size as f32
    }

    /// Block until the consumer frees ring space or the timeout
    /// elapses. Returns true when notified.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        let mut guard = self.shared.flow_mutex.lock();
        !self
            .shared
            .space_available
            .wait_for(&mut guard, timeout)
            .timed_out()
    }

    pub fn dump_stats(&self) {
        let s = &*self.shared;
        log::info!(
            "stats: cycles={} pushes={} underruns={} silence_chunks={} ring={}/{} prefill_target={} s24={:?}",
            s.stream_count.load(Ordering::Relaxed),
            s.push_count.load(Ordering::Relaxed),
            s.underrun_count.load(Ordering::Relaxed),
            s.silence_chunks.load(Ordering::Relaxed),
            s.ring.available(),
            s.ring.size(),
            s.prefill_target.load(Ordering::Relaxed),
            s.ring.s24_mode(),
        );
    }

    // ═══════════════════════════════════════════════════════════════════
    // SINK / RING CONFIGURATION
    // ═══════════════════════════════════════════════════════════════════

    /// Probe PCM widths 32 -> 24 -> 16 and configure the first one the
    /// sink accepts. Returns the accepted width.
    fn configure_sink_pcm(&mut self, format: &AudioFormat) -> SyncResult<u32> {
        let _lock = self.shared.config_mutex.lock();
        let mut driver = self.driver.lock();

        for bits in [32u32, 24, 16] {
            if let Some(flags) = FormatFlags::pcm(format.sample_rate, bits, format.channels) {
                if driver.check_sink_support(flags) {
                    driver.set_sink_configure(flags);
                    log::info!(
                        "sink PCM: {}Hz {}ch {}-bit",
                        format.sample_rate,
                        format.channels,
                        bits
                    );
                    return Ok(bits);
                }
            }
        }
        Err(SyncError::NoSupportedPcmFormat {
            rate: format.sample_rate,
            channels: format.channels,
        })
    }

    /// Probe DSD orientations (LSB,BIG) -> (MSB,BIG) -> (LSB,LITTLE)
    /// -> (MSB,LITTLE) and derive the ring conversion mode from the
    /// accepted one.
    fn configure_sink_dsd(&mut self, format: &AudioFormat) -> SyncResult<()> {
        let _lock = self.shared.config_mutex.lock();
        let mut driver = self.driver.lock();

        let source_is_lsb = format.dsd_layout == sqd_audio::DsdLayout::LsbFirst;

        for (target_lsb, target_little) in [(true, false), (false, false), (true, true), (false, true)]
        {
            let Some(flags) =
                FormatFlags::dsd(format.sample_rate, format.channels, target_lsb, target_little)
            else {
                continue;
            };
            if !driver.check_sink_support(flags) {
                continue;
            }
            driver.set_sink_configure(flags);

            let need_bit_reverse = source_is_lsb != target_lsb;
            let need_byte_swap = target_little;
            let mode = match (need_bit_reverse, need_byte_swap) {
                (false, false) => DsdConversionMode::Passthrough,
                (true, false) => DsdConversionMode::BitReverseOnly,
                (false, true) => DsdConversionMode::ByteSwapOnly,
                (true, true) => DsdConversionMode::BitReverseAndSwap,
            };
            self.shared
                .dsd_mode
                .store(mode_to_u8(mode), Ordering::Release);

            log::info!(
                "sink DSD: {} | {} ({mode:?})",
                if target_lsb { "LSB" } else { "MSB" },
                if target_little { "LITTLE" } else { "BIG" },
            );
            return Ok(());
        }

        Err(SyncError::NoSupportedDsdFormat {
            rate: format.sample_rate,
            channels: format.channels,
        })
    }

    fn configure_ring_pcm(
        &mut self,
        rate: u32,
        channels: u32,
        diretta_bps: u32,
        input_bps: u32,
        is_compressed: bool,
    ) {
        let _lock = self.shared.config_mutex.lock();
        let _epoch = ReconfigureGuard::new(&self.shared);
        let s = &*self.shared;

        s.sample_rate.store(rate, Ordering::Release);
        s.channels.store(channels, Ordering::Release);
        s.bytes_per_sample.store(diretta_bps, Ordering::Release);
        s.need_pack24
            .store(diretta_bps == 3 && input_bps == 4, Ordering::Release);
        s.need_widen_16_32
            .store(diretta_bps == 4 && input_bps == 2, Ordering::Release);
        s.need_widen_16_24
            .store(diretta_bps == 3 && input_bps == 2, Ordering::Release);
        s.is_dsd.store(false, Ordering::Release);
        s.low_bitrate
            .store(diretta_bps <= 2 && rate <= 48_000, Ordering::Release);
        s.dsd_mode
            .store(mode_to_u8(DsdConversionMode::Passthrough), Ordering::Release);

        let bytes_per_second = rate as usize * channels as usize * diretta_bps as usize;
        s.ring.resize(
            buffer::ring_size(bytes_per_second, buffer::PCM_BUFFER_SECONDS),
            0x00,
        );

        let bytes_per_frame = (channels * diretta_bps) as usize;
        let frames_base = (rate / 1000) as usize;
        let frames_remainder = rate % 1000;
        let bytes_per_cycle = frames_base * bytes_per_frame;

        s.bytes_per_frame.store(bytes_per_frame, Ordering::Release);
        s.frames_remainder.store(frames_remainder, Ordering::Release);
        s.frames_accumulator.store(0, Ordering::Release);
        s.bytes_per_cycle.store(bytes_per_cycle, Ordering::Release);

        let target_buffers =
            self.aligned_prefill(bytes_per_second, bytes_per_cycle, false, is_compressed);
        let prefill = prefill_bytes(
            target_buffers,
            bytes_per_cycle,
            bytes_per_frame,
            frames_remainder,
        );
        s.prefill_target.store(prefill, Ordering::Release);
        s.prefill_complete.store(false, Ordering::Release);

        // Publish last: caches reload a complete parameter set.
        s.producer_gen.fetch_add(1, Ordering::Release);
        s.consumer_gen.fetch_add(1, Ordering::Release);

        log::info!(
            "ring PCM: {rate}Hz {channels}ch {diretta_bps}Bps buffer={} prefill={target_buffers} cycles ({prefill} bytes, {})",
            s.ring.size(),
            if is_compressed { "compressed" } else { "uncompressed" },
        );
    }

    fn configure_ring_dsd(&mut self, byte_rate: u32, channels: u32) {
        let _lock = self.shared.config_mutex.lock();
        let _epoch = ReconfigureGuard::new(&self.shared);
        let s = &*self.shared;

        s.is_dsd.store(true, Ordering::Release);
        s.need_pack24.store(false, Ordering::Release);
        s.need_widen_16_32.store(false, Ordering::Release);
        s.need_widen_16_24.store(false, Ordering::Release);
        s.channels.store(channels, Ordering::Release);
        s.low_bitrate.store(false, Ordering::Release);
        s.sample_rate.store(byte_rate * 8, Ordering::Release);
        s.bytes_per_sample.store(1, Ordering::Release);

        let bytes_per_second = (byte_rate as usize) * channels as usize;
        s.ring.resize(
            buffer::ring_size(bytes_per_second, buffer::DSD_BUFFER_SECONDS),
            0x69,
        );

        // One millisecond of DSD per cycle, rounded up to whole
        // 4-byte-per-channel groups with a floor of 64 bytes.
        let group = 4 * channels as usize;
        let per_ms = (byte_rate / 1000) as usize * channels as usize;
        let bytes_per_cycle = (per_ms.div_ceil(group) * group).max(64);

        s.bytes_per_cycle.store(bytes_per_cycle, Ordering::Release);
        s.bytes_per_frame.store(0, Ordering::Release);
        s.frames_remainder.store(0, Ordering::Release);
        s.frames_accumulator.store(0, Ordering::Release);

        let target_buffers = self.aligned_prefill(bytes_per_second, bytes_per_cycle, true, false);
        let prefill = target_buffers * bytes_per_cycle;
        s.prefill_target.store(prefill, Ordering::Release);
        s.prefill_complete.store(false, Ordering::Release);

        s.producer_gen.fetch_add(1, Ordering::Release);
        s.consumer_gen.fetch_add(1, Ordering::Release);

        log::info!(
            "ring DSD: byteRate={byte_rate} ch={channels} buffer={} prefill={target_buffers} cycles ({prefill} bytes)",
            s.ring.size(),
        );
    }

    /// Prefill as a whole-cycle count: 8 cycles minimum, a quarter of
    /// the ring maximum.
    fn aligned_prefill(
        &self,
        bytes_per_second: usize,
        bytes_per_cycle: usize,
        is_dsd: bool,
        is_compressed: bool,
    ) -> usize {
        let target_ms = if is_dsd {
            buffer::PREFILL_MS_DSD
        } else if is_compressed {
            buffer::PREFILL_MS_COMPRESSED
        } else {
            buffer::PREFILL_MS_UNCOMPRESSED
        };

        let target_bytes = bytes_per_second * target_ms / 1000;
        let mut buffers = target_bytes.div_ceil(bytes_per_cycle.max(1));

        let ring_size = self.shared.ring.size();
        let max_buffers = if ring_size > 0 && bytes_per_cycle > 0 {
            ring_size / (4 * bytes_per_cycle)
        } else {
            100
        };

        buffers = buffers.max(8);
        buffers.min(max_buffers.max(1))
    }

    fn cycle_time(&self, sample_rate: u32, channels: u32, bits_per_sample: u32) -> u32 {
        if !self.config.cycle_time_auto {
            return self.config.cycle_time_us;
        }
        match &self.calculator {
            Some(calc) => calc.cycle_time_us(sample_rate, channels, bits_per_sample),
            None => self.config.cycle_time_us,
        }
    }

    fn apply_transfer_mode(&mut self, cycle_us: u32) {
        let mut driver = self.driver.lock();
        match self.config.transfer_mode {
            TransferMode::Auto => {
                let dsd = self.shared.is_dsd.load(Ordering::Acquire);
                let low = self.shared.low_bitrate.load(Ordering::Acquire);
                if dsd || low {
                    log::debug!("transfer mode: VarAuto");
                    driver.config_transfer_var_auto(cycle_us);
                } else {
                    log::debug!("transfer mode: VarMax");
                    driver.config_transfer_var_max(cycle_us);
                }
            }
            TransferMode::FixAuto => driver.config_transfer_fix_auto(cycle_us),
            TransferMode::VarAuto => driver.config_transfer_var_auto(cycle_us),
            TransferMode::VarMax => driver.config_transfer_var_max(cycle_us),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // WORKER LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════

    /// Spawn the transport worker if it is not running.
    fn ensure_worker(&mut self) {
        if self.shared.running.load(Ordering::Acquire) && self.worker.is_some() {
            return;
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        self.shared.running.store(true, Ordering::Release);
        self.shared.stop_requested.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let driver = Arc::clone(&self.driver);

        let handle = std::thread::Builder::new()
            .name("sqd-sync-worker".into())
            .spawn(move || {
                set_realtime_priority(50);
                let mut producer = CycleProducer::new(Arc::clone(&shared));
                while shared.running.load(Ordering::Acquire) {
                    let progressed = driver.lock().run_cycle(&mut producer);
                    if !progressed {
                        std::thread::sleep(Duration::from_micros(100));
                    }
                }
                log::debug!("sync worker exiting");
            })
            .expect("failed to spawn sync worker");

        self.worker = Some(handle);
        log::debug!("sync worker started");
    }

    fn shutdown_worker(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);

        let mut waits = 0;
        while self.shared.worker_active.load(Ordering::Acquire) && waits < 100 {
            std::thread::sleep(Duration::from_millis(10));
            waits += 1;
        }

        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // WAITS
    // ═══════════════════════════════════════════════════════════════════

    /// Sleep that disable() can interrupt. Returns true on a full
    /// timeout, false when woken early.
    fn interruptible_wait(&self, ms: u64) -> bool {
        interruptible_wait_on(&self.shared, ms)
    }

    fn wait_online(&self, timeout_ms: u32) -> bool {
        let start = Instant::now();
        let timeout = Duration::from_millis(timeout_ms as u64);

        loop {
            if self.refresh_online() {
                log::debug!("online after {}ms", start.elapsed().as_millis());
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Query the driver's online state and mirror it into the flag the
    /// producer hot path reads.
    fn refresh_online(&self) -> bool {
        let online = self.driver.lock().is_online();
        self.shared.online.store(online, Ordering::Release);
        online
    }
}

impl Drop for DirettaSync {
    fn drop(&mut self) {
        self.disable();
    }
}

/// Wake every thread parked in a format-transition wait.
fn wake_transitions(shared: &Shared) {
    {
        let _lock = shared.transition_mutex.lock();
        shared.transition_wakeup.store(true, Ordering::Release);
    }
    shared.transition_cv.notify_all();
}

/// Block on the transition condvar for up to `ms` milliseconds.
/// Returns true on a full timeout, false when woken early (the wake
/// flag is consumed).
fn interruptible_wait_on(shared: &Shared, ms: u64) -> bool {
    let mut guard = shared.transition_mutex.lock();
    let result = shared.transition_cv.wait_while_for(
        &mut guard,
        |_| !shared.transition_wakeup.load(Ordering::Acquire),
        Duration::from_millis(ms),
    );
    if !result.timed_out() {
        shared.transition_wakeup.store(false, Ordering::Release);
        return false;
    }
    true
}

/// Exact prefill byte count for a whole-cycle target. For
/// 44.1kHz-family rates the sum follows the remainder-accumulator
/// pattern so the target lands on a true cycle boundary.
fn prefill_bytes(
    buffers: usize,
    bytes_per_cycle: usize,
    bytes_per_frame: usize,
    frames_remainder: u32,
) -> usize {
    if frames_remainder == 0 {
        return buffers * bytes_per_cycle;
    }
    let mut total = 0usize;
    let mut acc = 0u32;
    for _ in 0..buffers {
        let mut bytes = bytes_per_cycle;
        acc += frames_remainder;
        if acc >= 1000 {
            acc -= 1000;
            bytes += bytes_per_frame;
        }
        total += bytes;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefill_bytes_integer_rate() {
        // 48kHz stereo 32-bit: 48 frames * 8 bytes, no remainder.
        assert_eq!(prefill_bytes(10, 48 * 8, 8, 0), 10 * 48 * 8);
    }

    #[test]
    fn test_prefill_bytes_remainder_pattern() {
        // 44.1kHz stereo 32-bit: base 44 frames/cycle, remainder 100.
        // Every 10th cycle carries one extra frame.
        let total = prefill_bytes(10, 44 * 8, 8, 100);
        assert_eq!(total, 10 * 44 * 8 + 8);

        // Over 1000 cycles the extra frames make the rate exact.
        let one_second = prefill_bytes(1000, 44 * 8, 8, 100);
        assert_eq!(one_second, 44_100 * 8);
    }

    #[test]
    fn test_interruptible_wait_wakes_promptly() {
        let (alog, _drain) = async_log::spawn();
        let shared = Arc::new(Shared::new(alog));

        let waiter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let start = Instant::now();
                let timed_out = interruptible_wait_on(&shared, 1000);
                (timed_out, start.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        wake_transitions(&shared);

        let (timed_out, elapsed) = waiter.join().unwrap();
        assert!(!timed_out, "wait should be interrupted, not timed out");
        // Orders of magnitude below the 1s timeout.
        assert!(elapsed < Duration::from_millis(500), "woke after {elapsed:?}");
    }

    #[test]
    fn test_interruptible_wait_times_out_without_wake() {
        let (alog, _drain) = async_log::spawn();
        let shared = Arc::new(Shared::new(alog));
        let start = Instant::now();
        assert!(interruptible_wait_on(&shared, 30));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [
            DsdConversionMode::Passthrough,
            DsdConversionMode::BitReverseOnly,
            DsdConversionMode::ByteSwapOnly,
            DsdConversionMode::BitReverseAndSwap,
        ] {
            assert_eq!(u8_to_mode(mode_to_u8(mode)), mode);
        }
    }
}
