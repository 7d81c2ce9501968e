//! Lock-Free Audio Ring Buffer
//!
//! Single-producer single-consumer byte ring between the pipe reader
//! and the realtime transport worker:
//! - Power-of-two capacity, positions stored modulo size
//! - Wait-free push/pop with acquire/release ordering
//! - In-place format conversions through private staging buffers
//! - S24 container alignment autodetection
//!
//! CRITICAL: the consumer side never blocks. All operations truncate
//! instead of failing; the caller reads backpressure from the returned
//! byte counts.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::convert::{
    interleave_dsd, pack_s24_lsb, pack_s24_msb, widen_16_to_24, widen_16_to_32, DsdConversionMode,
};

/// Size of each conversion staging buffer.
const STAGING_SIZE: usize = 65536;

/// Deferred S24 samples tolerated before committing to a default
/// alignment (~1 second of silence at 48 kHz).
const DEFERRED_TIMEOUT_SAMPLES: usize = 48_000;

/// Container alignment of 24-bit samples inside their 32-bit quads.
///
/// Two layouts exist in the wild and metadata alone cannot tell them
/// apart: LSB-aligned `[b0 b1 b2 0]` and MSB-aligned `[0 b1 b2 b3]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum S24PackMode {
    /// Not yet determined.
    #[default]
    Unknown,
    /// Data in bytes 0-2, byte 3 is padding.
    LsbAligned,
    /// Data in bytes 1-3, byte 0 is padding.
    MsbAligned,
    /// Only silence seen so far; decision postponed.
    Deferred,
}

/// Lock-free SPSC byte ring with in-place format conversion.
///
/// Exactly one producer thread may call the `push_*` family,
/// `direct_write_region`/`commit_direct_write` and the S24 accessors;
/// exactly one consumer thread may call `pop`. `resize` and `clear`
/// mutate non-atomic state and must only run while both sides are
/// excluded (the sync adapter brackets them in its reconfigure epoch).
pub struct AudioRing {
    /// Ring storage. Reallocated only inside a reconfigure epoch.
    buf: UnsafeCell<Box<[u8]>>,
    size: AtomicUsize,
    mask: AtomicUsize,
    /// Producer-owned position, modulo size.
    write_pos: AtomicUsize,
    /// Consumer-owned position, modulo size.
    read_pos: AtomicUsize,
    /// 0x00 for PCM, 0x69 for DSD idle.
    silence_byte: AtomicU8,

    // Staging buffers for conversions that need a linear destination
    // before the (possibly wrapping) copy into the ring. Producer-only.
    staging_pack24: UnsafeCell<Box<[u8]>>,
    staging_widen: UnsafeCell<Box<[u8]>>,
    staging_dsd: UnsafeCell<Box<[u8]>>,

    // S24 detection state. Producer-only, except reset in clear().
    s24_mode: Cell<S24PackMode>,
    s24_hint: Cell<S24PackMode>,
    s24_confirmed: Cell<bool>,
    s24_deferred_samples: Cell<usize>,
}

// SAFETY: the SPSC contract above confines every non-atomic field to a
// single thread at a time: staging buffers and S24 cells to the
// producer, the buffer allocation to reconfigure epochs during which
// neither side holds a ring-access guard. Position exchange between
// the two sides goes exclusively through the release/acquire atomics.
unsafe impl Send for AudioRing {}
unsafe impl Sync for AudioRing {}

impl Default for AudioRing {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRing {
    /// Create an empty ring; call `resize` before use.
    pub fn new() -> Self {
        Self {
            buf: UnsafeCell::new(Box::from([])),
            size: AtomicUsize::new(0),
            mask: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            silence_byte: AtomicU8::new(0),
            staging_pack24: UnsafeCell::new(vec![0u8; STAGING_SIZE].into_boxed_slice()),
            staging_widen: UnsafeCell::new(vec![0u8; STAGING_SIZE].into_boxed_slice()),
            staging_dsd: UnsafeCell::new(vec![0u8; STAGING_SIZE].into_boxed_slice()),
            s24_mode: Cell::new(S24PackMode::Unknown),
            s24_hint: Cell::new(S24PackMode::Unknown),
            s24_confirmed: Cell::new(false),
            s24_deferred_samples: Cell::new(0),
        }
    }

    /// Resize to at least `min_size` bytes (rounded up to a power of
    /// two), set the silence byte, reset positions and S24 state, and
    /// fill the whole buffer with silence.
    ///
    /// Must only be called inside a reconfigure epoch.
    pub fn resize(&self, min_size: usize, silence_byte: u8) {
        let size = min_size.next_power_of_two().max(2);
        // SAFETY: reconfigure epoch excludes both producer and consumer.
        unsafe {
            *self.buf.get() = vec![silence_byte; size].into_boxed_slice();
        }
        self.size.store(size, Ordering::Release);
        self.mask.store(size - 1, Ordering::Release);
        self.silence_byte.store(silence_byte, Ordering::Release);
        self.clear();
    }

    /// Reset positions and S24 detection. Size and contents unchanged.
    ///
    /// Must only be called inside a reconfigure epoch.
    pub fn clear(&self) {
        self.write_pos.store(0, Ordering::Release);
        self.read_pos.store(0, Ordering::Release);
        self.s24_mode.set(S24PackMode::Unknown);
        self.s24_hint.set(S24PackMode::Unknown);
        self.s24_confirmed.set(false);
        self.s24_deferred_samples.set(0);
    }

    /// Overwrite the whole buffer with the silence byte.
    pub fn fill_with_silence(&self) {
        let size = self.size.load(Ordering::Acquire);
        let silence = self.silence_byte.load(Ordering::Relaxed);
        // SAFETY: only called inside a reconfigure epoch.
        unsafe {
            let buf = &mut *self.buf.get();
            buf[..size].fill(silence);
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn silence_byte(&self) -> u8 {
        self.silence_byte.load(Ordering::Acquire)
    }

    /// Bytes available for reading.
    #[inline]
    pub fn available(&self) -> usize {
        if self.size.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let wp = self.write_pos.load(Ordering::Acquire);
        let rp = self.read_pos.load(Ordering::Acquire);
        wp.wrapping_sub(rp) & self.mask.load(Ordering::Relaxed)
    }

    /// Bytes available for writing. One byte is reserved so a full ring
    /// is distinguishable from an empty one.
    #[inline]
    pub fn free_space(&self) -> usize {
        if self.size.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let wp = self.write_pos.load(Ordering::Acquire);
        let rp = self.read_pos.load(Ordering::Acquire);
        rp.wrapping_sub(wp).wrapping_sub(1) & self.mask.load(Ordering::Relaxed)
    }

    // ═══════════════════════════════════════════════════════════════════
    // DIRECT WRITE
    // ═══════════════════════════════════════════════════════════════════

    /// Contiguous writable region of at least `needed` bytes, or `None`
    /// when the write would wrap (fall back to `push`).
    ///
    /// Producer-only. The returned slice is valid until
    /// `commit_direct_write`.
    #[allow(clippy::mut_from_ref)]
    pub fn direct_write_region(&self, needed: usize) -> Option<&mut [u8]> {
        let size = self.size.load(Ordering::Acquire);
        if size == 0 || needed == 0 {
            return None;
        }

        let wp = self.write_pos.load(Ordering::Relaxed);
        let rp = self.read_pos.load(Ordering::Acquire);
        let mask = self.mask.load(Ordering::Relaxed);

        let free = rp.wrapping_sub(wp).wrapping_sub(1) & mask;
        if free < needed {
            return None;
        }

        // Contiguous run: up to the read position when it is ahead,
        // otherwise up to the physical end of the buffer.
        let contiguous = if rp > wp { rp - wp - 1 } else { size - wp };
        if contiguous < needed {
            return None;
        }

        // SAFETY: single producer; region [wp, wp+contiguous) is free
        // space the consumer will not touch before commit.
        unsafe {
            let ptr = (*self.buf.get()).as_ptr() as *mut u8;
            Some(std::slice::from_raw_parts_mut(ptr.add(wp), contiguous))
        }
    }

    /// Advance the write position after writing into a direct region.
    #[inline]
    pub fn commit_direct_write(&self, written: usize) {
        if written == 0 || self.size.load(Ordering::Relaxed) == 0 {
            return;
        }
        let wp = self.write_pos.load(Ordering::Relaxed);
        let mask = self.mask.load(Ordering::Relaxed);
        self.write_pos
            .store(wp.wrapping_add(written) & mask, Ordering::Release);
    }

    // ═══════════════════════════════════════════════════════════════════
    // PUSH (producer)
    // ═══════════════════════════════════════════════════════════════════

    /// Copy bytes into the ring, truncating to free space.
    /// Returns bytes actually written.
    pub fn push(&self, data: &[u8]) -> usize {
        let size = self.size.load(Ordering::Acquire);
        if size == 0 {
            return 0;
        }
        let len = data.len().min(self.free_space());
        if len == 0 {
            return 0;
        }

        // Fast path: contiguous region, no wraparound.
        if let Some(region) = self.direct_write_region(len) {
            region[..len].copy_from_slice(&data[..len]);
            self.commit_direct_write(len);
            return len;
        }

        let wp = self.write_pos.load(Ordering::Relaxed);
        let mask = self.mask.load(Ordering::Relaxed);
        let first = len.min(size - wp);

        // SAFETY: single producer; [wp, wp+first) and [0, len-first)
        // are free space.
        unsafe {
            let ptr = (*self.buf.get()).as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(wp), first);
            if first < len {
                std::ptr::copy_nonoverlapping(data.as_ptr().add(first), ptr, len - first);
            }
        }

        self.write_pos
            .store(wp.wrapping_add(len) & mask, Ordering::Release);
        len
    }

    /// Push S24-in-S32 input (4 bytes per sample) as packed S24,
    /// detecting container alignment from the sample data.
    /// Returns *input* bytes consumed.
    pub fn push_24_packed(&self, data: &[u8]) -> usize {
        if self.size.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let mut samples = data.len() / 4;
        samples = samples
            .min(STAGING_SIZE / 3)
            .min(self.free_space() / 3);
        if samples == 0 {
            return 0;
        }

        let mode = self.s24_update(data, samples);

        // SAFETY: producer-only staging buffer.
        let staging = unsafe { &mut *self.staging_pack24.get() };
        let staged = if mode == S24PackMode::MsbAligned {
            pack_s24_msb(staging, data, samples)
        } else {
            pack_s24_lsb(staging, data, samples)
        };

        let written = self.write_staged(staging.as_ptr(), staged);
        (written / 3) * 4
    }

    /// Push S16 LE input widened to MSB-aligned S32.
    /// Returns input bytes consumed.
    pub fn push_16_to_32(&self, data: &[u8]) -> usize {
        if self.size.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let mut samples = data.len() / 2;
        samples = samples
            .min(STAGING_SIZE / 4)
            .min(self.free_space() / 4);
        if samples == 0 {
            return 0;
        }

        // SAFETY: producer-only staging buffer.
        let staging = unsafe { &mut *self.staging_widen.get() };
        let staged = widen_16_to_32(staging, data, samples);
        let written = self.write_staged(staging.as_ptr(), staged);
        (written / 4) * 2
    }

    /// Push S16 LE input widened to packed S24.
    /// Returns input bytes consumed.
    pub fn push_16_to_24(&self, data: &[u8]) -> usize {
        if self.size.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let mut samples = data.len() / 2;
        samples = samples
            .min(STAGING_SIZE / 3)
            .min(self.free_space() / 3);
        if samples == 0 {
            return 0;
        }

        // SAFETY: producer-only staging buffer.
        let staging = unsafe { &mut *self.staging_widen.get() };
        let staged = widen_16_to_24(staging, data, samples);
        let written = self.write_staged(staging.as_ptr(), staged);
        (written / 3) * 2
    }

    /// Push planar DSD, interleaving 4-byte groups per channel with the
    /// given conversion mode. Only whole groups are consumed; partial
    /// groups remain with the caller. Returns input bytes consumed.
    pub fn push_dsd_planar(
        &self,
        data: &[u8],
        channels: usize,
        mode: DsdConversionMode,
    ) -> usize {
        if self.size.load(Ordering::Acquire) == 0 || channels == 0 {
            return 0;
        }

        let max_bytes = data.len().min(STAGING_SIZE).min(self.free_space());
        let bytes_per_channel = max_bytes / channels;
        let complete_groups = bytes_per_channel / 4;
        let usable = complete_groups * 4 * channels;
        if usable == 0 {
            return 0;
        }

        // The input runs are planar over the whole of `data`, so pick
        // group-aligned prefixes of each channel run.
        let src_per_channel = data.len() / channels;
        // SAFETY: producer-only staging buffer.
        let staging = unsafe { &mut *self.staging_dsd.get() };
        let per_channel = complete_groups * 4;
        if src_per_channel == per_channel {
            interleave_dsd(staging, &data[..usable], channels, mode);
        } else {
            // Compact the consumed prefix of each channel run first.
            let compact = unsafe { &mut *self.staging_widen.get() };
            for ch in 0..channels {
                compact[ch * per_channel..(ch + 1) * per_channel]
                    .copy_from_slice(&data[ch * src_per_channel..ch * src_per_channel + per_channel]);
            }
            interleave_dsd(staging, &compact[..usable], channels, mode);
        }

        self.write_staged(staging.as_ptr(), usable)
    }

    // ═══════════════════════════════════════════════════════════════════
    // POP (consumer)
    // ═══════════════════════════════════════════════════════════════════

    /// Read up to `dst.len()` bytes, truncating to available data.
    /// Returns bytes read.
    pub fn pop(&self, dst: &mut [u8]) -> usize {
        let size = self.size.load(Ordering::Acquire);
        if size == 0 {
            return 0;
        }
        let len = dst.len().min(self.available());
        if len == 0 {
            return 0;
        }

        let rp = self.read_pos.load(Ordering::Relaxed);
        let mask = self.mask.load(Ordering::Relaxed);
        let first = len.min(size - rp);

        // SAFETY: single consumer; [rp, rp+len) holds committed data.
        unsafe {
            let ptr = (*self.buf.get()).as_ptr();
            std::ptr::copy_nonoverlapping(ptr.add(rp), dst.as_mut_ptr(), first);
            if first < len {
                std::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr().add(first), len - first);
            }
        }

        self.read_pos
            .store(rp.wrapping_add(len) & mask, Ordering::Release);
        len
    }

    // ═══════════════════════════════════════════════════════════════════
    // S24 DETECTION
    // ═══════════════════════════════════════════════════════════════════

    /// Set the alignment hint used as fallback while the stream is
    /// still silent. Sample-based detection overrides the hint once a
    /// non-zero sample shows up.
    pub fn set_s24_hint(&self, hint: S24PackMode) {
        self.s24_hint.set(hint);
        self.s24_confirmed.set(false);
        let mode = self.s24_mode.get();
        if mode == S24PackMode::Unknown || mode == S24PackMode::Deferred {
            self.s24_mode.set(hint);
        }
    }

    /// Committed (or provisional) pack mode, for diagnostics.
    pub fn s24_mode(&self) -> S24PackMode {
        self.s24_mode.get()
    }

    /// Run the detection state machine over a batch and return the
    /// effective mode to pack with.
    fn s24_update(&self, data: &[u8], samples: usize) -> S24PackMode {
        let mode = self.s24_mode.get();
        let hint = self.s24_hint.get();

        let needs_detection = mode == S24PackMode::Unknown
            || mode == S24PackMode::Deferred
            || (mode == hint && !self.s24_confirmed.get());

        if needs_detection {
            match detect_s24(data, samples) {
                S24PackMode::Deferred => {
                    let seen = self.s24_deferred_samples.get() + samples;
                    self.s24_deferred_samples.set(seen);
                    if seen > DEFERRED_TIMEOUT_SAMPLES {
                        let committed = if hint != S24PackMode::Unknown {
                            hint
                        } else {
                            S24PackMode::LsbAligned
                        };
                        self.s24_mode.set(committed);
                        self.s24_confirmed.set(true);
                        log::debug!("S24 detection timed out on silence, committing {committed:?}");
                    } else {
                        self.s24_mode.set(S24PackMode::Deferred);
                    }
                }
                detected => {
                    self.s24_mode.set(detected);
                    self.s24_confirmed.set(true);
                    self.s24_deferred_samples.set(0);
                    log::debug!("S24 alignment detected: {detected:?}");
                }
            }
        }

        match self.s24_mode.get() {
            S24PackMode::Deferred | S24PackMode::Unknown => {
                if hint != S24PackMode::Unknown {
                    hint
                } else {
                    S24PackMode::LsbAligned
                }
            }
            m => m,
        }
    }

    /// Copy staged conversion output into the ring with wraparound,
    /// truncating to free space. Returns bytes written.
    ///
    /// Takes a raw pointer so callers can keep the staging borrow live
    /// across the call; the staged region never aliases the ring.
    fn write_staged(&self, staged: *const u8, len: usize) -> usize {
        let size = self.size.load(Ordering::Relaxed);
        if size == 0 || len == 0 {
            return 0;
        }

        let wp = self.write_pos.load(Ordering::Relaxed);
        let rp = self.read_pos.load(Ordering::Acquire);
        let mask = self.mask.load(Ordering::Relaxed);

        let free = rp.wrapping_sub(wp).wrapping_sub(1) & mask;
        let len = len.min(free);
        if len == 0 {
            return 0;
        }

        let first = len.min(size - wp);
        // SAFETY: single producer; destination ranges are free space.
        unsafe {
            let ptr = (*self.buf.get()).as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(staged, ptr.add(wp), first);
            if first < len {
                std::ptr::copy_nonoverlapping(staged.add(first), ptr, len - first);
            }
        }

        self.write_pos
            .store(wp.wrapping_add(len) & mask, Ordering::Release);
        len
    }
}

/// Inspect up to 64 samples for the S24 container alignment.
fn detect_s24(data: &[u8], samples: usize) -> S24PackMode {
    let check = samples.min(64);
    let mut all_zero_lsb = true;
    let mut all_zero_msb = true;

    for i in 0..check {
        if data[i * 4] != 0 {
            all_zero_lsb = false;
        }
        if data[i * 4 + 3] != 0 {
            all_zero_msb = false;
        }
    }

    match (all_zero_lsb, all_zero_msb) {
        (false, true) => S24PackMode::LsbAligned,
        (true, false) => S24PackMode::MsbAligned,
        (true, true) => S24PackMode::Deferred,
        // Both positions carry data: ambiguous, LSB is the common case.
        (false, false) => S24PackMode::LsbAligned,
    }
}
