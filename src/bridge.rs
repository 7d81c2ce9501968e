//! Bridge orchestrator
//!
//! Drives the whole data path: parses in-band format headers, opens
//! and reopens the sync adapter, burst-fills the ring after format
//! changes, and pumps audio with consumer-driven backpressure in the
//! steady state. DSD wire layouts are converted to planar form here,
//! just before handoff to the adapter.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use sqd_audio::convert::{dop_to_planar, dsd_wire_to_planar};
use sqd_audio::AudioFormat;
use sqd_sync::sync::HIGH_WATER;
use sqd_sync::{DirettaSync, SyncError};

use crate::header::{DsdKind, HeaderError, StreamHeader, HEADER_LEN, MAGIC};
use crate::pipe::{PipeError, PipeReader, PipeSource};

/// Steady-state read size.
const READ_CHUNK: usize = 16_384;

/// Silence injected per stalled burst-fill round.
const SILENCE_CHUNK: usize = 4096;

/// Burst-fill gives up on prefill after this long.
const BURST_FILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Producer-side flow-control wait quantum.
const FLOW_WAIT: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Stream desync: a header was expected and did not parse. No
    /// resync is attempted - terminating beats emitting noise.
    #[error("protocol error: {0}")]
    Protocol(#[from] HeaderError),

    #[error("pipe error: {0}")]
    Pipe(io::Error),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Session totals, reported at shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeStats {
    pub headers: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub silence_chunks: u64,
}

/// One bridge session over one child pipe.
pub struct Bridge<'a, R: PipeSource> {
    sync: &'a mut DirettaSync,
    reader: PipeReader<R>,
    shutdown: &'a AtomicBool,
    stats_requested: &'a AtomicBool,

    dsd_kind: DsdKind,

    /// Unconsumed wire bytes carried between reads (sub-frame tails).
    carry: Vec<u8>,
    /// Scratch for the current chunk.
    scratch: Vec<u8>,
    /// Planar DSD conversion output.
    planar: Vec<u8>,

    stats: BridgeStats,
}

impl<'a, R: PipeSource> Bridge<'a, R> {
    pub fn new(
        sync: &'a mut DirettaSync,
        reader: PipeReader<R>,
        shutdown: &'a AtomicBool,
        stats_requested: &'a AtomicBool,
    ) -> Self {
        Self {
            sync,
            reader,
            shutdown,
            stats_requested,
            dsd_kind: DsdKind::Pcm,
            carry: Vec::new(),
            scratch: Vec::new(),
            planar: Vec::new(),
            stats: BridgeStats::default(),
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Run until EOF, shutdown, or a fatal error. Closes and disables
    /// the sync adapter on the way out.
    pub fn run(&mut self) -> Result<BridgeStats, BridgeError> {
        let result = self.pump();
        self.sync.close();
        self.sync.disable();
        result.map(|_| self.stats)
    }

    fn pump(&mut self) -> Result<(), BridgeError> {
        'stream: loop {
            if self.stopping() {
                break;
            }

            // A track boundary: the next bytes must be a header.
            let mut raw = [0u8; HEADER_LEN];
            match self.reader.read_exact(&mut raw) {
                Ok(()) => {}
                Err(PipeError::Eof) => break,
                Err(PipeError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(PipeError::Io(e)) => return Err(BridgeError::Pipe(e)),
            }

            let header = StreamHeader::parse(&raw).map_err(|e| {
                log::error!("stream desync: {e}");
                e
            })?;
            let format = header.to_audio_format();
            self.stats.headers += 1;
            log::info!("format header: {format}");

            self.sync.open(format)?;
            self.dsd_kind = header.dsd_kind;
            self.carry.clear();
            self.planar.clear();

            self.burst_fill(format)?;

            // Steady state until the next header or EOF.
            loop {
                if self.stopping() {
                    break 'stream;
                }
                if self.stats_requested.swap(false, Ordering::AcqRel) {
                    self.sync.dump_stats();
                }

                match self.reader.peek(4) {
                    Ok(magic) if magic == MAGIC => continue 'stream,
                    Ok(_) => {}
                    Err(PipeError::Eof) => {
                        // Fewer than 4 bytes remain; drain and stop.
                        self.drain_tail(format)?;
                        break 'stream;
                    }
                    Err(PipeError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(PipeError::Io(e)) => return Err(BridgeError::Pipe(e)),
                }

                // Consumer-driven backpressure: hold off while the
                // ring is above the high-water mark.
                while self.sync.buffer_level() > HIGH_WATER && !self.stopping() {
                    self.sync.wait_for_space(FLOW_WAIT);
                }

                match self.take_chunk(READ_CHUNK) {
                    Ok(true) => self.forward_audio(format)?,
                    Ok(false) => {
                        self.drain_tail(format)?;
                        break 'stream;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Let the consumer play out what was already delivered; cutting
        // the ring off here would drop the tail of the last track. A
        // sub-cycle residual can never drain, so stop once the level
        // holds still.
        if self.sync.is_prefill_complete() {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut last_level = f32::MAX;
            let mut stalled_since = Instant::now();
            while !self.stopping() && Instant::now() < deadline {
                let level = self.sync.buffer_level();
                if level <= 0.0 {
                    break;
                }
                if level < last_level {
                    last_level = level;
                    stalled_since = Instant::now();
                } else if stalled_since.elapsed() > Duration::from_millis(250) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        log::info!(
            "stream ended: {} header(s), {} bytes in, {} bytes out",
            self.stats.headers,
            self.stats.bytes_in,
            self.stats.bytes_out
        );
        Ok(())
    }

    /// Fill the ring as fast as the pipe allows until prefill
    /// completes. When the pipe stalls first, inject bounded silence
    /// so a gated consumer cannot deadlock the producer.
    fn burst_fill(&mut self, format: AudioFormat) -> Result<(), BridgeError> {
        let deadline = Instant::now() + BURST_FILL_TIMEOUT;

        while !self.sync.is_prefill_complete() && !self.stopping() {
            if Instant::now() >= deadline {
                log::warn!("burst-fill timed out before prefill completion");
                break;
            }

            // A mid-burst header ends this track's fill.
            match self.reader.peek(4) {
                Ok(magic) if magic == MAGIC => return Ok(()),
                Ok(_) => {}
                Err(PipeError::Eof) => return Ok(()),
                Err(PipeError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(PipeError::Io(e)) => return Err(BridgeError::Pipe(e)),
            }

            match self.reader.poll_readable(FLOW_WAIT) {
                Ok(true) => match self.take_chunk(READ_CHUNK) {
                    Ok(true) => self.forward_audio(format)?,
                    Ok(false) => return Ok(()),
                    Err(e) => return Err(e),
                },
                Ok(false) => {
                    self.inject_silence(format);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(BridgeError::Pipe(e)),
            }
        }
        Ok(())
    }

    /// Read the next chunk into scratch. Ok(false) on EOF.
    fn take_chunk(&mut self, n: usize) -> Result<bool, BridgeError> {
        self.scratch.clear();
        match self.reader.read_up_to(n) {
            Ok(chunk) => {
                self.scratch.extend_from_slice(chunk);
                Ok(true)
            }
            Err(PipeError::Eof) => Ok(false),
            Err(PipeError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {
                Ok(true) // empty scratch; caller's next loop re-checks
            }
            Err(PipeError::Io(e)) => Err(BridgeError::Pipe(e)),
        }
    }

    /// Flush any carried sub-frame tail at end of stream. Whole frames
    /// in the carry go out; a truncated trailing frame is dropped.
    fn drain_tail(&mut self, format: AudioFormat) -> Result<(), BridgeError> {
        self.scratch.clear();
        self.forward_audio(format)
    }

    /// Convert and hand the scratch chunk to the sync adapter,
    /// consuming whole frames and carrying the remainder.
    fn forward_audio(&mut self, format: AudioFormat) -> Result<(), BridgeError> {
        self.stats.bytes_in += self.scratch.len() as u64;
        self.carry.extend_from_slice(&self.scratch);

        let channels = format.channels as usize;

        if format.is_dsd {
            let wire_frame = 4 * channels;
            let frames = self.carry.len() / wire_frame;
            if frames == 0 {
                return Ok(());
            }
            let wire_len = frames * wire_frame;

            let bytes_per_channel = match self.dsd_kind {
                DsdKind::Dop => 2 * frames,
                _ => 4 * frames,
            };
            self.planar.resize(bytes_per_channel * channels, 0);

            let per_channel = match self.dsd_kind {
                DsdKind::Dop => dop_to_planar(&mut self.planar, &self.carry[..wire_len], channels),
                _ => dsd_wire_to_planar(&mut self.planar, &self.carry[..wire_len], channels),
            };
            self.carry.drain(..wire_len);

            self.send_planar_dsd(per_channel, channels);
        } else {
            let in_frame = (format.input_bytes_per_sample() * format.channels) as usize;
            let mut off = 0usize;

            loop {
                if self.stopping() {
                    break;
                }
                let frames = (self.carry.len() - off) / in_frame;
                if frames == 0 {
                    break;
                }
                let end = self.carry.len();
                let consumed = self.sync.send_audio(&self.carry[off..end], frames);
                if consumed == 0 {
                    if !self.sync.is_playing() {
                        break;
                    }
                    self.sync.wait_for_space(FLOW_WAIT);
                    continue;
                }
                off += consumed;
                self.stats.bytes_out += consumed as u64;
            }
            self.carry.drain(..off);
        }

        Ok(())
    }

    /// Push planar DSD until it is fully consumed, re-compacting the
    /// per-channel tails after partial consumption.
    fn send_planar_dsd(&mut self, mut per_channel: usize, channels: usize) {
        while per_channel > 0 && !self.stopping() {
            let total = per_channel * channels;
            let bits_per_channel = per_channel * 8;
            let consumed = self
                .sync
                .send_audio(&self.planar[..total], bits_per_channel);

            if consumed == 0 {
                if !self.sync.is_playing() {
                    return;
                }
                self.sync.wait_for_space(FLOW_WAIT);
                continue;
            }
            self.stats.bytes_out += consumed as u64;

            let consumed_per_channel = consumed / channels;
            let remain = per_channel - consumed_per_channel;
            if remain > 0 {
                // Shift each channel's unconsumed tail to the front of
                // its new, shorter run.
                for ch in 0..channels {
                    let src = ch * per_channel + consumed_per_channel;
                    self.planar.copy_within(src..src + remain, ch * remain);
                }
            }
            per_channel = remain;
        }
    }

    /// Bounded silence into the ring while the pipe is stalled and the
    /// consumer is still gated on prefill.
    fn inject_silence(&mut self, format: AudioFormat) {
        let channels = format.channels as usize;

        let consumed = if format.is_dsd {
            let per_channel = SILENCE_CHUNK / channels;
            self.planar.clear();
            self.planar.resize(per_channel * channels, 0x69);
            self.sync
                .send_audio(&self.planar, per_channel * 8)
        } else {
            let in_frame = (format.input_bytes_per_sample() * format.channels) as usize;
            let frames = SILENCE_CHUNK / in_frame;
            self.scratch.clear();
            self.scratch.resize(frames * in_frame, 0x00);
            self.sync.send_audio(&self.scratch, frames)
        };

        if consumed > 0 {
            self.stats.silence_chunks += 1;
            self.sync.note_silence_chunk();
            self.stats.bytes_out += consumed as u64;
            log::debug!("injected {consumed} silence byte(s) during stalled burst-fill");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::encode_header;
    use crate::pipe::PipeSource;
    use std::io::{Cursor, Read};

    use sqd_audio::convert::widen_16_to_32;
    use sqd_sync::sdk::loopback::DriverEvent;
    use sqd_sync::{
        DirettaConfig, DirettaSync, FormatFlags, LoopbackDriver, LoopbackFinder, LoopbackHandle,
        SinkCaps,
    };

    /// In-memory pipe; always readable, EOF at the end.
    struct MemSource(Cursor<Vec<u8>>);

    impl Read for MemSource {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            self.0.read(out)
        }
    }

    impl PipeSource for MemSource {}

    fn run_bridge(stream: Vec<u8>, caps: SinkCaps) -> (BridgeStats, LoopbackHandle) {
        let driver = LoopbackDriver::unpaced(caps);
        let handle = driver.handle();
        let mut sync = DirettaSync::new(Box::new(LoopbackFinder::new()), Box::new(driver));
        sync.enable(DirettaConfig {
            format_switch_delay_ms: 50,
            ..DirettaConfig::default()
        })
        .unwrap();

        let shutdown = AtomicBool::new(false);
        let stats_requested = AtomicBool::new(false);
        let reader = PipeReader::new(MemSource(Cursor::new(stream)));
        let stats = Bridge::new(&mut sync, reader, &shutdown, &stats_requested)
            .run()
            .unwrap();
        (stats, handle)
    }

    /// Cycles carrying ring data (neither PCM nor DSD gate silence).
    fn data_bytes(handle: &LoopbackHandle) -> Vec<u8> {
        handle
            .cycles()
            .into_iter()
            .filter(|c| c.iter().any(|&b| b != 0x00) && c.iter().any(|&b| b != 0x69))
            .flatten()
            .collect()
    }

    /// Gapless playback: one header, two tracks of audio, no ring
    /// reset in between, byte-exact output.
    #[test]
    fn test_gapless_pcm_single_header() {
        let mut input = Vec::new();
        // Two "tracks" of 1 second each, same format, no second header.
        for i in 0..2 * 176_400usize {
            input.push((i % 251) as u8 + 1);
        }

        let mut stream = encode_header(2, 16, 0, 44_100).to_vec();
        stream.extend_from_slice(&input);

        let (stats, handle) = run_bridge(stream, SinkCaps::default());

        assert_eq!(stats.headers, 1);
        assert_eq!(handle.open_count(), 1, "gapless stream must not reopen");

        // The sink took 32-bit, so the bridge widened 16 -> 32.
        let mut expected = vec![0u8; input.len() * 2];
        widen_16_to_32(&mut expected, &input, input.len() / 2);

        // The drain stops once less than one cycle remains; everything
        // emitted must match the widened input byte-for-byte.
        let got = data_bytes(&handle);
        assert!(
            got.len() + 360 >= expected.len() && got.len() <= expected.len(),
            "played {} of {} bytes",
            got.len(),
            expected.len()
        );
        assert_eq!(got[..], expected[..got.len()]);
    }

    /// DoP track: the bridge extracts native DSD and the DAC sees
    /// planar bytes interleaved in 4-byte groups.
    #[test]
    fn test_dop_extraction_end_to_end() {
        let caps = SinkCaps {
            dsd_lsb: false,
            ..SinkCaps::default()
        };

        // [pad LSB MSB marker] per channel; DSD64 over DoP at 176.4k.
        let frames = 60_000usize;
        let mut stream = encode_header(2, 24, 1, 176_400).to_vec();
        for _ in 0..frames {
            stream.extend_from_slice(&[0x00, 0xAA, 0xBB, 0x05, 0x00, 0xCC, 0xDD, 0xFA]);
        }

        let (stats, handle) = run_bridge(stream, caps);
        assert_eq!(stats.headers, 1);

        let got = data_bytes(&handle);
        assert!(!got.is_empty(), "DoP audio should reach the sink");
        // Group pattern: 4 left bytes then 4 right bytes.
        for chunk in got.chunks(8).take(1000) {
            assert_eq!(chunk, &[0xBB, 0xAA, 0xBB, 0xAA, 0xDD, 0xCC, 0xDD, 0xCC]);
        }
    }

    /// Mid-stream PCM -> DSD header triggers a reopen with DSD sink
    /// flags and 0x69 gate silence.
    #[test]
    fn test_format_change_reopens_for_dsd() {
        let caps = SinkCaps {
            dsd_lsb: false,
            ..SinkCaps::default()
        };

        let mut stream = encode_header(2, 16, 0, 44_100).to_vec();
        for i in 0..88_200usize {
            stream.push((i % 251) as u8 + 1);
        }
        stream.extend_from_slice(&encode_header(2, 1, 3, 88_200));
        // Native DSD wire words; enough to pass DSD prefill.
        for i in 0..240_000usize {
            stream.push((i % 97) as u8 + 1);
        }

        let (stats, handle) = run_bridge(stream, caps);

        assert_eq!(stats.headers, 2);
        assert!(handle.open_count() >= 2, "format change must reopen the SDK");

        // The second sink configuration selects DSD.
        let dsd_configs: Vec<_> = handle
            .events()
            .iter()
            .filter_map(|e| match e {
                DriverEvent::SinkConfigure(f) if f.contains(FormatFlags::DSD1) => Some(*f),
                _ => None,
            })
            .collect();
        assert!(!dsd_configs.is_empty());
        assert!(dsd_configs[0].contains(FormatFlags::MP64));

        // Gate silence after the transition is the DSD idle byte.
        let cycles = handle.cycles();
        assert!(
            cycles.iter().any(|c| !c.is_empty() && c.iter().all(|&b| b == 0x69)),
            "expected 0x69 silence cycles after the DSD reopen"
        );
    }

    /// A stats request mid-stream must not disturb the audio path.
    #[test]
    fn test_stats_request_is_harmless() {
        let driver = LoopbackDriver::unpaced(SinkCaps::default());
        let mut sync = DirettaSync::new(Box::new(LoopbackFinder::new()), Box::new(driver));
        sync.enable(DirettaConfig::default()).unwrap();

        let mut stream = encode_header(2, 16, 0, 44_100).to_vec();
        for i in 0..88_200usize {
            stream.push((i % 251) as u8 + 1);
        }

        let shutdown = AtomicBool::new(false);
        let stats_requested = AtomicBool::new(true); // pending from the start
        let reader = PipeReader::new(MemSource(Cursor::new(stream)));
        let stats = Bridge::new(&mut sync, reader, &shutdown, &stats_requested)
            .run()
            .unwrap();

        assert_eq!(stats.headers, 1);
        assert!(!stats_requested.load(Ordering::Acquire), "request consumed");
    }

    /// Garbage where a header must be is a protocol error, not noise.
    #[test]
    fn test_desync_terminates() {
        let driver = LoopbackDriver::unpaced(SinkCaps::default());
        let mut sync = DirettaSync::new(Box::new(LoopbackFinder::new()), Box::new(driver));
        sync.enable(DirettaConfig::default()).unwrap();

        let stream = vec![0xDEu8; 64]; // no SQFH anywhere
        let shutdown = AtomicBool::new(false);
        let stats_requested = AtomicBool::new(false);
        let reader = PipeReader::new(MemSource(Cursor::new(stream)));
        let result = Bridge::new(&mut sync, reader, &shutdown, &stats_requested).run();

        assert!(matches!(result, Err(BridgeError::Protocol(_))));
    }

    /// Shutdown raised before the stream starts exits cleanly.
    #[test]
    fn test_shutdown_flag_stops_bridge() {
        let driver = LoopbackDriver::unpaced(SinkCaps::default());
        let mut sync = DirettaSync::new(Box::new(LoopbackFinder::new()), Box::new(driver));
        sync.enable(DirettaConfig::default()).unwrap();

        let mut stream = encode_header(2, 16, 0, 44_100).to_vec();
        stream.extend_from_slice(&[1u8; 4096]);

        let shutdown = AtomicBool::new(true);
        let stats_requested = AtomicBool::new(false);
        let reader = PipeReader::new(MemSource(Cursor::new(stream)));
        let stats = Bridge::new(&mut sync, reader, &shutdown, &stats_requested)
            .run()
            .unwrap();
        assert_eq!(stats.headers, 0);
    }
}

