//! sqd-sync: the Diretta transport adapter
//!
//! Owns the SDK session, the realtime worker thread, and the audio
//! ring. The bridge pushes converted audio through [`DirettaSync`];
//! the worker pulls exactly one cycle's worth of bytes per transfer
//! cycle, emitting silence while gated (prefill, stabilisation,
//! transitions, underruns).
//!
//! ```text
//!              producer (bridge thread)          consumer (worker)
//!                     │                                 │
//!   send_audio ──────▶│  AudioRing (SPSC, lock-free)    │──▶ SyncDriver
//!                     │                                 │    run_cycle
//!        open/close ──┴── state machine, config mutex ──┘
//! ```

pub mod async_log;
pub mod config;
pub mod cycle;
pub mod error;
pub mod sdk;
pub mod sync;

pub use config::{DirettaConfig, TransferMode};
pub use cycle::CycleCalculator;
pub use error::{SyncError, SyncResult};
pub use sdk::loopback::{LoopbackDriver, LoopbackFinder, LoopbackHandle, SinkCaps};
pub use sdk::{FormatFlags, SessionOptions, StreamSource, SyncDriver, TargetAddress, TargetFinder, TargetInfo};
pub use sync::{DirettaSync, SyncState};
