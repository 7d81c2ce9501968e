//! Non-blocking logging for audio hot paths
//!
//! The producer push and the transfer cycle must never block on the
//! logger. Debug records are formatted into fixed-size buffers, queued
//! on a bounded lock-free channel, and drained by a dedicated thread
//! that forwards them through the `log` facade. A full queue drops the
//! record and counts the drop.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Queue depth; roughly a second of very chatty debug output.
const QUEUE_CAPACITY: usize = 1024;

/// Maximum text bytes per record; longer messages are truncated.
const RECORD_TEXT: usize = 240;

/// One queued log record. Fixed-size so queueing never allocates.
#[derive(Clone, Copy)]
struct LogRecord {
    at: Instant,
    len: usize,
    text: [u8; RECORD_TEXT],
}

struct FixedBuf {
    buf: [u8; RECORD_TEXT],
    len: usize,
}

impl fmt::Write for FixedBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = RECORD_TEXT - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Handle shared with the hot paths. Cheap to clone.
#[derive(Clone)]
pub struct AsyncLog {
    tx: Sender<LogRecord>,
    dropped: Arc<AtomicU64>,
}

impl AsyncLog {
    /// Queue a debug record. Non-blocking; drops when the queue is
    /// full or debug logging is disabled.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }

        let mut buf = FixedBuf {
            buf: [0u8; RECORD_TEXT],
            len: 0,
        };
        // Truncation is the only possible "failure" and is fine here.
        let _ = buf.write_fmt(args);

        let record = LogRecord {
            at: Instant::now(),
            len: buf.len,
            text: buf.buf,
        };

        if let Err(TrySendError::Full(_)) = self.tx.try_send(record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Owns the drain thread; dropping it flushes and joins.
pub struct AsyncLogDrain {
    handle: Option<JoinHandle<()>>,
    tx: Option<Sender<LogRecord>>,
    dropped: Arc<AtomicU64>,
}

/// Start the drain thread and return the producer handle plus the
/// drain owner.
pub fn spawn() -> (AsyncLog, AsyncLogDrain) {
    let (tx, rx) = bounded::<LogRecord>(QUEUE_CAPACITY);
    let dropped = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let handle = std::thread::Builder::new()
        .name("sqd-log-drain".into())
        .spawn(move || drain_loop(rx, started))
        .expect("failed to spawn log drain thread");

    (
        AsyncLog {
            tx: tx.clone(),
            dropped: Arc::clone(&dropped),
        },
        AsyncLogDrain {
            handle: Some(handle),
            tx: Some(tx),
            dropped,
        },
    )
}

fn drain_loop(rx: Receiver<LogRecord>, started: Instant) {
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(record) => {
                let text = std::str::from_utf8(&record.text[..record.len]).unwrap_or("<bad utf8>");
                let us = record.at.duration_since(started).as_micros();
                log::debug!("[+{us}us] {text}");
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl Drop for AsyncLogDrain {
    fn drop(&mut self) {
        // Closing our sender ends the drain loop once the queue empties
        // (hot-path handles hold clones; by teardown they are gone).
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            log::warn!("async log queue dropped {dropped} record(s)");
        }
    }
}
