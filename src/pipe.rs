//! Header-preserving pipe reader
//!
//! Buffered byte reader over the child's stdout. The one hard
//! guarantee: `read_up_to` never hands out bytes that belong to an
//! embedded "SQFH" header - the returned slice is truncated in front
//! of any full magic, and in front of a magic prefix touching the end
//! of the buffered region (it might continue in the next read).
//!
//! All consuming operations drain the internal buffer first, so an
//! EINTR during a refill loses nothing and the caller can retry after
//! checking its shutdown flag.

use std::io::{self, Read};
use std::time::Duration;

use thiserror::Error;

use crate::header::MAGIC;

/// Internal buffer size.
const PIPE_BUF_SIZE: usize = 65536;

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("end of stream")]
    Eof,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A byte source the reader can additionally poll for readability.
/// In-memory sources are always readable; pipe-backed sources poll
/// their descriptor.
pub trait PipeSource: Read {
    fn poll_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }
}

impl PipeSource for std::process::ChildStdout {
    fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        use std::os::fd::AsRawFd;

        let mut fds = libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: valid pollfd array of length 1.
        let ret = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(ret > 0)
    }
}

/// Buffered reader with peek and header-aware bounded reads.
pub struct PipeReader<R: PipeSource> {
    src: R,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl<R: PipeSource> PipeReader<R> {
    pub fn new(src: R) -> Self {
        Self {
            src,
            buf: vec![0u8; PIPE_BUF_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// Pull more bytes from the source. Returns 0 at EOF.
    fn fill_some(&mut self) -> io::Result<usize> {
        if self.end == self.buf.len() {
            if self.start == 0 {
                // Buffer genuinely full; the caller must consume first.
                return Ok(0);
            }
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let n = self.src.read(&mut self.buf[self.end..])?;
        self.end += n;
        Ok(n)
    }

    /// True when a read would not block (buffered data or readable
    /// source).
    pub fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.buffered() > 0 {
            return Ok(true);
        }
        self.src.poll_readable(timeout)
    }

    /// Make the next `n` bytes visible without consuming them.
    /// `Err(Eof)` when the stream ends first.
    pub fn peek(&mut self, n: usize) -> Result<&[u8], PipeError> {
        assert!(n <= self.buf.len());
        while self.buffered() < n {
            if self.fill_some()? == 0 {
                return Err(PipeError::Eof);
            }
        }
        Ok(&self.buf[self.start..self.start + n])
    }

    /// Read exactly `out.len()` bytes. `Err(Eof)` when the stream ends
    /// first (any buffered prefix stays buffered).
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<(), PipeError> {
        let n = out.len();
        let got = self.peek(n)?;
        out.copy_from_slice(got);
        self.start += n;
        Ok(())
    }

    /// Return up to `n` buffered bytes, never crossing an embedded
    /// header. Byte 0 of the returned region is exempt from the scan
    /// (the caller peeks for a leading header before calling).
    pub fn read_up_to(&mut self, n: usize) -> Result<&[u8], PipeError> {
        if self.buffered() == 0 {
            loop {
                match self.fill_some() {
                    Ok(0) => return Err(PipeError::Eof),
                    Ok(_) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let region = &self.buf[self.start..self.end];
        let mut len = region.len().min(n);

        // Truncate in front of a complete magic at any offset > 0.
        if region.len() >= MAGIC.len() {
            for k in 1..region.len() - MAGIC.len() + 1 {
                if k >= len {
                    break;
                }
                if region[k..k + MAGIC.len()] == MAGIC {
                    len = k;
                    break;
                }
            }
        }

        // A magic prefix ending exactly at the buffered edge might be
        // a header split across reads; hold those bytes back.
        let tail_scan_from = region.len().saturating_sub(MAGIC.len() - 1).max(1);
        for k in tail_scan_from..region.len() {
            if k >= len {
                break;
            }
            if MAGIC.starts_with(&region[k..]) {
                len = k;
                break;
            }
        }

        let out = &self.buf[self.start..self.start + len];
        self.start += len;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::encode_header;
    use std::collections::VecDeque;

    /// Scripted source: yields the queued chunks one `read` at a time.
    struct ChunkSource {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkSource {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
            }
        }

        fn whole(data: Vec<u8>) -> Self {
            Self::new(vec![data])
        }
    }

    impl Read for ChunkSource {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let Some(chunk) = self.chunks.front_mut() else {
                return Ok(0);
            };
            let n = chunk.len().min(out.len());
            out[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.chunks.pop_front();
            }
            Ok(n)
        }
    }

    impl PipeSource for ChunkSource {}

    #[test]
    fn test_read_exact_and_peek() {
        let mut r = PipeReader::new(ChunkSource::whole(vec![1, 2, 3, 4, 5, 6]));
        assert_eq!(r.peek(4).unwrap(), &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        r.read_exact(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        let mut out = [0u8; 4];
        assert!(matches!(r.read_exact(&mut out), Err(PipeError::Eof)));
    }

    #[test]
    fn test_read_up_to_plain_audio() {
        let mut r = PipeReader::new(ChunkSource::whole(vec![9u8; 100]));
        let got = r.read_up_to(64).unwrap();
        assert_eq!(got.len(), 64);
        let got = r.read_up_to(64).unwrap();
        assert_eq!(got.len(), 36);
        assert!(matches!(r.read_up_to(64), Err(PipeError::Eof)));
    }

    #[test]
    fn test_read_up_to_stops_before_header() {
        // audio | header | audio
        let mut data = vec![0xAAu8; 10];
        data.extend_from_slice(&encode_header(2, 16, 0, 44_100));
        data.extend_from_slice(&[0xBB; 8]);

        let mut r = PipeReader::new(ChunkSource::whole(data));
        let got = r.read_up_to(1024).unwrap();
        assert_eq!(got, &[0xAA; 10][..]);

        // The header is fully preserved for the caller.
        assert_eq!(r.peek(4).unwrap(), &MAGIC);
        let mut hdr = [0u8; 16];
        r.read_exact(&mut hdr).unwrap();
        assert_eq!(&hdr[0..4], &MAGIC);

        assert_eq!(r.read_up_to(1024).unwrap(), &[0xBB; 8][..]);
    }

    #[test]
    fn test_header_split_across_reads_is_withheld() {
        // First chunk ends mid-magic; the reader must not hand "SQ"
        // out as audio.
        let mut first = vec![0x11u8; 6];
        first.extend_from_slice(b"SQ");
        let mut second = b"FH".to_vec();
        second.extend_from_slice(&encode_header(2, 16, 0, 48_000)[4..]);
        second.extend_from_slice(&[0x22; 4]);

        let mut r = PipeReader::new(ChunkSource::new(vec![first, second]));

        let got = r.read_up_to(1024).unwrap();
        assert_eq!(got, &[0x11; 6][..]);

        // Next peek completes the magic from the second chunk.
        assert_eq!(r.peek(4).unwrap(), &MAGIC);
    }

    #[test]
    fn test_partial_magic_at_eof_is_released_by_peek_failure() {
        // Stream ends with a stray "SQ": read_up_to withholds it, and
        // peek(4) reports EOF so the bridge can drain and stop.
        let mut data = vec![0x33u8; 5];
        data.extend_from_slice(b"SQ");
        let mut r = PipeReader::new(ChunkSource::whole(data));

        let got = r.read_up_to(1024).unwrap();
        assert_eq!(got, &[0x33; 5][..]);
        assert!(matches!(r.peek(4), Err(PipeError::Eof)));
    }

    #[test]
    fn test_magic_never_crossed_under_any_chunking() {
        // Property-style sweep: the same stream delivered with every
        // chunk size from 1 to 24 never yields audio containing the
        // magic.
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0x55; 13]);
        stream.extend_from_slice(&encode_header(2, 24, 0, 96_000));
        stream.extend_from_slice(&[0x66; 17]);

        for chunk_size in 1..=24 {
            let chunks: Vec<Vec<u8>> = stream.chunks(chunk_size).map(|c| c.to_vec()).collect();
            let mut r = PipeReader::new(ChunkSource::new(chunks));

            let mut audio = Vec::new();
            loop {
                match r.peek(4) {
                    Ok(m) if m == MAGIC => break,
                    Ok(_) => {}
                    Err(PipeError::Eof) => break,
                    Err(e) => panic!("{e}"),
                }
                match r.read_up_to(7) {
                    Ok(got) => audio.extend_from_slice(got),
                    Err(PipeError::Eof) => break,
                    Err(e) => panic!("{e}"),
                }
            }

            assert_eq!(audio, vec![0x55; 13], "chunk_size={chunk_size}");
            let mut hdr = [0u8; 16];
            r.read_exact(&mut hdr).unwrap();
            assert_eq!(&hdr[0..4], &MAGIC, "chunk_size={chunk_size}");
        }
    }
}
