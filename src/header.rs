//! In-band stream format header
//!
//! The patched Squeezelite emits a 16-byte little-endian header at the
//! start of the stream and on every mid-stream format change:
//!
//! | offset | size | field       |
//! |-------:|-----:|-------------|
//! |      0 |    4 | magic "SQFH"|
//! |      4 |    1 | version (1) |
//! |      5 |    1 | channels    |
//! |      6 |    1 | bit depth   |
//! |      7 |    1 | dsd format  |
//! |      8 |    4 | sample rate |
//! |     12 |    4 | reserved    |
//!
//! After a header, audio always restarts on a frame boundary of the
//! newly declared format.

use thiserror::Error;

use sqd_audio::{AudioFormat, DsdLayout};

/// Header magic, also scanned for by the pipe reader.
pub const MAGIC: [u8; 4] = *b"SQFH";

/// Wire size of the header.
pub const HEADER_LEN: usize = 16;

const HEADER_VERSION: u8 = 1;

/// Payload encoding declared by the header's dsd_format field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsdKind {
    /// Plain PCM in S32_LE containers.
    Pcm,
    /// DSD-over-PCM markers in S32 containers.
    Dop,
    /// Native DSD packed into U32_LE words.
    U32Le,
    /// Native DSD packed into U32_BE words.
    U32Be,
}

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("bad magic {0:02x?} (stream desync)")]
    BadMagic([u8; 4]),

    #[error("unsupported header version {0}")]
    BadVersion(u8),

    #[error("invalid channel count {0}")]
    BadChannels(u8),

    #[error("invalid bit depth {0}")]
    BadBitDepth(u8),

    #[error("invalid dsd format {0}")]
    BadDsdKind(u8),

    #[error("invalid sample rate {0}")]
    BadSampleRate(u32),
}

/// A parsed format header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub channels: u8,
    pub bit_depth: u8,
    pub dsd_kind: DsdKind,
    pub sample_rate: u32,
}

impl StreamHeader {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self, HeaderError> {
        if raw[0..4] != MAGIC {
            return Err(HeaderError::BadMagic([raw[0], raw[1], raw[2], raw[3]]));
        }
        if raw[4] != HEADER_VERSION {
            return Err(HeaderError::BadVersion(raw[4]));
        }

        let channels = raw[5];
        if channels == 0 {
            return Err(HeaderError::BadChannels(channels));
        }

        let bit_depth = raw[6];
        if !matches!(bit_depth, 1 | 16 | 24 | 32) {
            return Err(HeaderError::BadBitDepth(bit_depth));
        }

        let dsd_kind = match raw[7] {
            0 => DsdKind::Pcm,
            1 => DsdKind::Dop,
            2 => DsdKind::U32Le,
            3 => DsdKind::U32Be,
            other => return Err(HeaderError::BadDsdKind(other)),
        };

        let sample_rate = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        if sample_rate == 0 {
            return Err(HeaderError::BadSampleRate(sample_rate));
        }

        Ok(Self {
            channels,
            bit_depth,
            dsd_kind,
            sample_rate,
        })
    }

    /// DAC-side format this header declares.
    ///
    /// Native DSD words carry 32 bits per channel per frame, DoP
    /// containers carry 16, so the true 1-bit rate is the header rate
    /// times that factor. Squeezelite delivers DSD bytes MSB-first in
    /// both cases.
    pub fn to_audio_format(&self) -> AudioFormat {
        match self.dsd_kind {
            DsdKind::Pcm => AudioFormat::pcm(
                self.sample_rate,
                self.bit_depth as u32,
                self.channels as u32,
            ),
            DsdKind::U32Le | DsdKind::U32Be => AudioFormat::dsd(
                self.sample_rate * 32,
                self.channels as u32,
                DsdLayout::MsbFirst,
            ),
            DsdKind::Dop => AudioFormat::dsd(
                self.sample_rate * 16,
                self.channels as u32,
                DsdLayout::MsbFirst,
            ),
        }
    }
}

/// Build a header's wire form; test-side counterpart of `parse`.
#[cfg(test)]
pub fn encode_header(channels: u8, bit_depth: u8, dsd_format: u8, sample_rate: u32) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[0..4].copy_from_slice(&MAGIC);
    raw[4] = HEADER_VERSION;
    raw[5] = channels;
    raw[6] = bit_depth;
    raw[7] = dsd_format;
    raw[8..12].copy_from_slice(&sample_rate.to_le_bytes());
    raw
}
