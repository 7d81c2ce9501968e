//! sqd-audio: the bridge's audio data plane
//!
//! Everything on the byte path between the player pipe and the Diretta
//! transport worker:
//!
//! ```text
//! ┌────────────┐    ┌───────────────┐    ┌────────────┐
//! │ pipe bytes │───▶│ convert       │───▶│ AudioRing  │───▶ transport
//! │ (producer) │    │ (pack/widen/  │    │ (SPSC,     │     worker
//! │            │    │  DSD layouts) │    │  lock-free)│
//! └────────────┘    └───────────────┘    └────────────┘
//! ```
//!
//! The ring is the only producer/consumer boundary; conversions happen
//! in-place on the producer side through staging buffers owned by the
//! ring, or as pure slice transforms in `convert` for the wire-layout
//! changes the bridge applies before pushing.

pub mod convert;
pub mod format;
pub mod ring;
pub mod thread_priority;

pub use convert::{DsdConversionMode, BIT_REVERSE};
pub use format::{AudioFormat, DsdLayout, DSD64_RATE};
pub use ring::{AudioRing, S24PackMode};
pub use thread_priority::{set_realtime_priority, PriorityResult};
