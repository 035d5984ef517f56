//! Tape transport core: the driver trait, shared per-session state, and the
//! error type common to every tape format driver.
//!
//! A tape is a sample-clocked storage medium. The virtual machine calls
//! [`Tape::run_one_sample`] once per emulated sample period and exchanges
//! quantized signal levels through [`Tape::set_input_signal`] /
//! [`Tape::output_signal`]. Playback and the motor are independent gates:
//! the per-sample tick does nothing unless both are on.

mod error;
mod tape;

pub use error::TapeError;
pub use tape::{OpenMode, Tape, TapeState};

/// Lowest supported tape sample rate, in Hz.
pub const MIN_SAMPLE_RATE: u32 = 10_000;
/// Highest supported tape sample rate, in Hz.
pub const MAX_SAMPLE_RATE: u32 = 120_000;
/// Sample rate used when a format does not carry its own.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;
