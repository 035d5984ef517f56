//! Tape subsystem entry point.
//!
//! [`open_tape_file`] detects the format of a tape image and constructs
//! the matching driver. Each driver's own header validation is the probe:
//! a driver that does not recognize the file returns
//! [`TapeError::NotRecognized`] and the next one is tried, so a real I/O
//! error anywhere aborts detection instead of being mistaken for "wrong
//! format". A rejected probe drops its file handle before the next
//! attempt.

use std::path::Path;

use format_ep_tape::EpTape;
use format_epte::EpteTape;
use format_tzx::TzxTape;
use tape_wav::WavTape;

pub use format_ep_tape::EpTape as NativeTape;
pub use format_epte::EpteTape as LegacyTape;
pub use format_tzx::TzxTape as PulseArchiveTape;
pub use tape_core::{
    DEFAULT_SAMPLE_RATE, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE, OpenMode, Tape, TapeError, TapeState,
};
pub use tape_wav::{FirBandPass, WavTape as SoundFileTape};

/// Open a tape image, detecting its format.
///
/// Probe order: pulse archive (TZX/TAP), legacy chunked, sound file, then
/// the native format. The native driver accepts anything (headerless files
/// are raw 1-bit data to it), so it doubles as the fallback; it is also
/// used directly for [`OpenMode::Create`] and for paths that do not exist
/// yet, where there is nothing to probe.
///
/// `sample_rate` and `bits_per_sample` are the caller's requested tape
/// parameters; drivers with their own notion of either (a native header,
/// a WAV spec) keep their own.
///
/// # Errors
///
/// Any error other than a failed probe is propagated; if every probe
/// rejects the file, the native driver's failure is the caller's error.
pub fn open_tape_file(
    path: &Path,
    mode: OpenMode,
    sample_rate: u32,
    bits_per_sample: u8,
) -> Result<Box<dyn Tape>, TapeError> {
    if mode == OpenMode::Create || !path.exists() {
        return Ok(Box::new(EpTape::open(
            path,
            mode,
            sample_rate,
            bits_per_sample,
        )?));
    }
    match TzxTape::open(path, bits_per_sample) {
        Ok(tape) => return Ok(Box::new(tape)),
        Err(TapeError::NotRecognized) => {}
        Err(e) => return Err(e),
    }
    match EpteTape::open(path, bits_per_sample) {
        Ok(tape) => return Ok(Box::new(tape)),
        Err(TapeError::NotRecognized) => {}
        Err(e) => return Err(e),
    }
    match WavTape::open(path, mode, bits_per_sample) {
        Ok(tape) => return Ok(Box::new(tape)),
        Err(TapeError::NotRecognized) => {}
        Err(e) => return Err(e),
    }
    Ok(Box::new(EpTape::open(
        path,
        mode,
        sample_rate,
        bits_per_sample,
    )?))
}
