//! The `Tape` trait and the transport state every driver embeds.

use crate::TapeError;

/// How to open a tape file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open read-write if possible, or create a new file if it does not
    /// exist; fall back to read-only if the file cannot be written.
    ReadWrite,
    /// Open read-write, failing if the file does not exist; fall back to
    /// read-only if the file cannot be written.
    ReadWriteExisting,
    /// Open an existing file read-only.
    ReadOnly,
    /// Create a new file in read-write mode, truncating any existing file.
    Create,
}

/// Per-session transport bookkeeping shared by all drivers.
///
/// Signal levels are quantized to `[0, 2^requested_bits_per_sample - 1]`.
/// Positions and lengths are in samples; `tape_position <= tape_length`
/// holds except while actively recording (recording extends the tape).
#[derive(Debug)]
pub struct TapeState {
    pub sample_rate: u32,
    pub file_bits_per_sample: u8,
    pub requested_bits_per_sample: u8,
    pub is_read_only: bool,
    pub is_playback_on: bool,
    pub is_record_on: bool,
    pub is_motor_on: bool,
    pub tape_length: u64,
    pub tape_position: u64,
    pub input_state: u8,
    pub output_state: u8,
}

impl TapeState {
    /// Create transport state for the given requested bit depth.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` unless the depth is 1, 2, 4, or 8.
    pub fn new(bits_per_sample: u8) -> Result<Self, TapeError> {
        if !matches!(bits_per_sample, 1 | 2 | 4 | 8) {
            return Err(TapeError::InvalidParameter("tape sample size"));
        }
        Ok(Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            file_bits_per_sample: 1,
            requested_bits_per_sample: bits_per_sample,
            is_read_only: true,
            is_playback_on: false,
            is_record_on: false,
            is_motor_on: false,
            tape_length: 0,
            tape_position: 0,
            input_state: 0,
            output_state: 0,
        })
    }
}

/// A tape format driver.
///
/// Drivers implement [`state`](Tape::state), [`state_mut`](Tape::state_mut)
/// and [`run_sample`](Tape::run_sample); the transport defaults here take
/// care of gating, and the cue-point operations default to no-ops for
/// formats without a cue table.
pub trait Tape {
    /// Shared transport state.
    fn state(&self) -> &TapeState;
    /// Shared transport state, mutable.
    fn state_mut(&mut self) -> &mut TapeState;

    /// Driver-specific work for one sample period. Called only while
    /// playback and the motor are both on.
    fn run_sample(&mut self) -> Result<(), TapeError>;

    /// Run tape emulation for one sample period (`1 / sample_rate()`
    /// seconds). A no-op unless both playback and the motor are on.
    ///
    /// # Errors
    ///
    /// Read-write drivers surface deferred page-flush failures here when a
    /// page boundary is crossed.
    fn run_one_sample(&mut self) -> Result<(), TapeError> {
        if self.state().is_playback_on && self.state().is_motor_on {
            self.run_sample()
        } else {
            Ok(())
        }
    }

    /// Turn the motor on or off. Read-write drivers flush pending page
    /// writes on motor-off.
    fn set_is_motor_on(&mut self, on: bool) -> Result<(), TapeError> {
        self.state_mut().is_motor_on = on;
        Ok(())
    }

    /// Start playback. The motor must also be on to actually play.
    fn play(&mut self) {
        let s = self.state_mut();
        s.is_playback_on = true;
        s.is_record_on = false;
    }

    /// Start recording; on a read-only tape this degrades to [`play`](Tape::play).
    fn record(&mut self) {
        let s = self.state_mut();
        s.is_playback_on = true;
        s.is_record_on = !s.is_read_only;
    }

    /// Stop playback and recording. Read-write drivers flush pending page
    /// writes here.
    fn stop(&mut self) -> Result<(), TapeError> {
        let s = self.state_mut();
        s.is_playback_on = false;
        s.is_record_on = false;
        Ok(())
    }

    /// Set the input signal level for recording.
    fn set_input_signal(&mut self, level: u8) {
        self.state_mut().input_state = level;
    }

    /// Current output signal level.
    fn output_signal(&self) -> u8 {
        self.state().output_state
    }

    /// Seek to the given time in seconds. Defaults to a no-op; read-only
    /// stream decoders typically support only rewinding.
    fn seek(&mut self, seconds: f64) -> Result<(), TapeError> {
        let _ = seconds;
        Ok(())
    }

    /// Seek forward or backward to the nearest cue point, or by `seconds`
    /// if there is none in that direction.
    fn seek_to_cue_point(&mut self, forward: bool, seconds: f64) -> Result<(), TapeError> {
        let _ = (forward, seconds);
        Ok(())
    }

    /// Create a cue point at the current position. No effect on formats
    /// without a cue table, or on read-only tapes.
    fn add_cue_point(&mut self) -> Result<(), TapeError> {
        Ok(())
    }

    /// Delete the cue point nearest to the current position.
    fn delete_nearest_cue_point(&mut self) -> Result<(), TapeError> {
        Ok(())
    }

    /// Delete all cue points.
    fn delete_all_cue_points(&mut self) -> Result<(), TapeError> {
        Ok(())
    }

    /// Sample rate of the tape emulation, in Hz.
    fn sample_rate(&self) -> u32 {
        self.state().sample_rate
    }

    /// Number of bits (1, 2, 4, or 8) per sample in the tape file.
    fn sample_size(&self) -> u8 {
        self.state().file_bits_per_sample
    }

    /// Whether the tape file was opened read-only.
    fn is_read_only(&self) -> bool {
        self.state().is_read_only
    }

    /// Whether the motor is currently on.
    fn is_motor_on(&self) -> bool {
        self.state().is_motor_on
    }

    /// Current tape position, in seconds.
    fn position(&self) -> f64 {
        self.state().tape_position as f64 / f64::from(self.state().sample_rate)
    }

    /// Tape length, in seconds.
    fn length(&self) -> f64 {
        self.state().tape_length as f64 / f64::from(self.state().sample_rate)
    }

    /// Whether the position has reached the end of the tape. Meaningful
    /// only while reading; cleared by an explicit reposition.
    fn is_end_of_tape(&self) -> bool {
        self.state().tape_position >= self.state().tape_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-memory driver used to exercise the trait defaults.
    struct NullTape {
        state: TapeState,
        samples_run: u32,
    }

    impl NullTape {
        fn new(read_only: bool) -> Self {
            let mut state = TapeState::new(1).expect("valid bit depth");
            state.is_read_only = read_only;
            Self {
                state,
                samples_run: 0,
            }
        }
    }

    impl Tape for NullTape {
        fn state(&self) -> &TapeState {
            &self.state
        }
        fn state_mut(&mut self) -> &mut TapeState {
            &mut self.state
        }
        fn run_sample(&mut self) -> Result<(), TapeError> {
            self.samples_run += 1;
            Ok(())
        }
    }

    #[test]
    fn rejects_invalid_bit_depth() {
        for bits in [0u8, 3, 5, 6, 7, 9, 16] {
            assert!(TapeState::new(bits).is_err(), "bits = {bits}");
        }
        for bits in [1u8, 2, 4, 8] {
            assert!(TapeState::new(bits).is_ok(), "bits = {bits}");
        }
    }

    #[test]
    fn tick_is_gated_on_motor_and_playback() {
        let mut t = NullTape::new(false);
        t.run_one_sample().expect("tick");
        assert_eq!(t.samples_run, 0, "stopped, motor off");

        t.play();
        t.run_one_sample().expect("tick");
        assert_eq!(t.samples_run, 0, "playing, motor off");

        t.set_is_motor_on(true).expect("motor");
        t.run_one_sample().expect("tick");
        assert_eq!(t.samples_run, 1, "playing, motor on");

        t.stop().expect("stop");
        t.run_one_sample().expect("tick");
        assert_eq!(t.samples_run, 1, "stopped again");
    }

    #[test]
    fn record_on_read_only_degrades_to_play() {
        let mut t = NullTape::new(true);
        t.record();
        assert!(t.state().is_playback_on);
        assert!(!t.state().is_record_on);

        let mut t = NullTape::new(false);
        t.record();
        assert!(t.state().is_playback_on);
        assert!(t.state().is_record_on);
    }

    #[test]
    fn play_cancels_recording() {
        let mut t = NullTape::new(false);
        t.record();
        assert!(t.state().is_record_on);
        t.play();
        assert!(t.state().is_playback_on);
        assert!(!t.state().is_record_on);
    }

    #[test]
    fn end_of_tape_tracks_position_against_length() {
        let mut t = NullTape::new(false);
        assert!(t.is_end_of_tape(), "empty tape is at its end");
        t.state_mut().tape_length = 100;
        assert!(!t.is_end_of_tape());
        t.state_mut().tape_position = 100;
        assert!(t.is_end_of_tape());
    }

    #[test]
    fn positions_are_reported_in_seconds() {
        let mut t = NullTape::new(false);
        t.state_mut().sample_rate = 24_000;
        t.state_mut().tape_position = 12_000;
        t.state_mut().tape_length = 48_000;
        assert!((t.position() - 0.5).abs() < 1e-9);
        assert!((t.length() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn signal_levels_round_trip() {
        let mut t = NullTape::new(false);
        t.set_input_signal(7);
        assert_eq!(t.state().input_state, 7);
        t.state_mut().output_state = 3;
        assert_eq!(t.output_signal(), 3);
    }
}
