//! Pulse archive tape driver, read-only.
//!
//! Handles TZX containers (signature `"ZXTape!\x1A"` plus a version pair)
//! and headerless TAP streams (recognized by a 19-byte standard header
//! record whose bytes XOR to zero). The file is decoded as it plays, one
//! block at a time; nothing is pre-parsed.
//!
//! The central state is a per-sample pulse generator: a pulse timer counts
//! down, and at zero either the next pulse of the current run is emitted
//! (toggle level, reload timer, decrement the run counter) or a per-mode
//! continuation runs — the next data bit, the next pulse-sequence entry,
//! the next direct-recording sample, or the next block header from the
//! file. All timing fields are converted once per block from Z80 T-states
//! to tape samples: `samples = round(t_states * rate / 3_500_000)`.
//!
//! Malformed input never surfaces as an error from the block stream: a
//! truncated read, a bad length, or an unknown block ID resets the decoder
//! and marks logical end of tape.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tape_core::{Tape, TapeError, TapeState};

/// Container signature (followed by major and minor version bytes).
const TZX_MAGIC: &[u8; 8] = b"ZXTape!\x1A";
/// Reference Z80 clock all T-state fields are expressed against.
const CPU_CLOCK: u64 = 3_500_000;

// Standard ROM loader timings, in T-states.
const PILOT_PULSE: u32 = 2168;
const SYNC1_PULSE: u32 = 667;
const SYNC2_PULSE: u32 = 735;
const ZERO_PULSE: u32 = 855;
const ONE_PULSE: u32 = 1710;
const HEADER_PILOT_COUNT: u32 = 8063;
const DATA_PILOT_COUNT: u32 = 3223;

/// Pause appended after every headerless TAP record, in milliseconds.
const TAP_PAUSE_MS: u32 = 1000;

/// Upper bound on zero-length pulse steps within one sample. Degenerate
/// timing fields (T-state counts that round to zero samples) would
/// otherwise spin the generator forever.
const PULSE_GUARD: u32 = 256;

/// What the pulse generator does once the current pulse run is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuation {
    /// Read the next block header from the file.
    NextBlock,
    /// Pilot tone finished; emit the first sync pulse.
    Sync1,
    /// First sync pulse finished; emit the second.
    Sync2,
    /// Emit the next data bit (two equal pulses, MSB first).
    DataBit,
    /// Emit the next direct-recording source sample (level set, not toggled).
    DirectSample,
    /// Emit the next entry of a raw pulse sequence.
    PulseSeq,
}

/// Active loop-block bookkeeping (loops do not nest).
#[derive(Debug, Clone, Copy)]
struct LoopState {
    /// File offset of the first block inside the loop.
    body_offset: u64,
    /// Tape position at loop entry or at the last jump back.
    position: u64,
    remaining: u16,
}

/// Streaming TZX/TAP driver.
pub struct TzxTape {
    state: TapeState,
    file: BufReader<File>,
    tap_mode: bool,
    /// File offset of the first block (past the signature in TZX mode).
    data_start: u64,
    end_of_tape: bool,

    level: u8,
    pulse_timer: u64,
    pulse_length: u64,
    pulse_count: u32,
    cont: Continuation,

    // Current block parameters.
    shift_reg: u8,
    bits_remaining: u8,
    data_bytes_remaining: u64,
    used_bits_last: u8,
    zero_len: u64,
    one_len: u64,
    sync1_len: u64,
    sync2_len: u64,
    pause_samples: u64,
    seq_remaining: u16,
    /// Direct recording: tape samples per source sample, 1/`CPU_CLOCK`
    /// fixed point.
    direct_step: u64,
    direct_accum: u64,
    loop_state: Option<LoopState>,
}

impl TzxTape {
    /// Open a TZX or headerless TAP file read-only.
    ///
    /// # Errors
    ///
    /// `NotRecognized` if the file carries neither the container signature
    /// nor a valid headerless first record; `Io` if the file cannot be
    /// opened or read.
    pub fn open(path: &Path, bits_per_sample: u8) -> Result<Self, TapeError> {
        let state = TapeState::new(bits_per_sample)?;
        let file = File::open(path)?;
        let mut file = BufReader::new(file);

        let mut sig = [0u8; 10];
        let tap_mode = match file.read_exact(&mut sig) {
            Ok(()) if sig[..8] == TZX_MAGIC[..] => false,
            _ => {
                // Headerless TAP: the first record must be a standard
                // 19-byte header whose bytes XOR to zero.
                file.seek(SeekFrom::Start(0))?;
                let mut rec = [0u8; 21];
                if file.read_exact(&mut rec).is_err()
                    || rec[0] != 0x13
                    || rec[1] != 0x00
                    || rec[2..].iter().fold(0u8, |x, &b| x ^ b) != 0
                {
                    return Err(TapeError::NotRecognized);
                }
                true
            }
        };

        let mut tape = Self {
            state,
            file,
            tap_mode,
            data_start: if tap_mode { 0 } else { 10 },
            end_of_tape: false,
            level: 0,
            pulse_timer: 0,
            pulse_length: 0,
            pulse_count: 0,
            cont: Continuation::NextBlock,
            shift_reg: 0,
            bits_remaining: 0,
            data_bytes_remaining: 0,
            used_bits_last: 8,
            zero_len: 0,
            one_len: 0,
            sync1_len: 0,
            sync2_len: 0,
            pause_samples: 0,
            seq_remaining: 0,
            direct_step: 0,
            direct_accum: 0,
            loop_state: None,
        };
        tape.rewind();
        Ok(tape)
    }

    /// Reset the decoder and reposition at the first block.
    fn rewind(&mut self) {
        self.end_of_tape = false;
        self.level = 0;
        self.pulse_timer = 0;
        self.pulse_length = 0;
        self.pulse_count = 0;
        self.cont = Continuation::NextBlock;
        self.bits_remaining = 0;
        self.data_bytes_remaining = 0;
        self.seq_remaining = 0;
        self.direct_accum = 0;
        self.loop_state = None;
        self.state.tape_position = 0;
        self.state.output_state = 0;
        if self.state.tape_length == 0 {
            self.state.tape_length = 1;
        }
        if self.file.seek(SeekFrom::Start(self.data_start)).is_err() {
            self.set_end_of_tape();
        }
    }

    /// Fail closed: whatever went wrong becomes a normal end of tape.
    fn set_end_of_tape(&mut self) {
        self.end_of_tape = true;
        self.level = 0;
        self.pulse_timer = 0;
        self.pulse_count = 0;
        self.loop_state = None;
        self.state.tape_length = self.state.tape_position;
    }

    fn high_level(&self) -> u8 {
        1u8 << (self.state.requested_bits_per_sample - 1)
    }

    /// Convert a T-state count to tape samples, rounding to nearest.
    fn t_states_to_samples(&self, t: u32) -> u64 {
        (u64::from(t) * u64::from(self.state.sample_rate) + CPU_CLOCK / 2) / CPU_CLOCK
    }

    fn ms_to_samples(&self, ms: u32) -> u64 {
        u64::from(ms) * u64::from(self.state.sample_rate) / 1000
    }

    fn read_u8(&mut self) -> Option<u8> {
        let mut b = [0u8; 1];
        self.file.read_exact(&mut b).ok()?;
        Some(b[0])
    }

    fn read_u16_le(&mut self) -> Option<u32> {
        let mut b = [0u8; 2];
        self.file.read_exact(&mut b).ok()?;
        Some(u32::from(u16::from_le_bytes(b)))
    }

    fn read_u24_le(&mut self) -> Option<u64> {
        let mut b = [0u8; 3];
        self.file.read_exact(&mut b).ok()?;
        Some(u64::from(b[0]) | (u64::from(b[1]) << 8) | (u64::from(b[2]) << 16))
    }

    fn read_u32_le(&mut self) -> Option<u64> {
        let mut b = [0u8; 4];
        self.file.read_exact(&mut b).ok()?;
        Some(u64::from(u32::from_le_bytes(b)))
    }

    /// Read the flag byte of a data block without consuming it.
    fn peek_u8(&mut self) -> Option<u8> {
        let b = self.read_u8()?;
        self.file.seek_relative(-1).ok()?;
        Some(b)
    }

    fn skip(&mut self, n: u64) -> Option<()> {
        self.file.seek_relative(i64::try_from(n).ok()?).ok()
    }

    /// One pulse generator step at a timer boundary: emit the next pulse
    /// of the current run, or dispatch the per-mode continuation.
    fn step(&mut self) {
        if self.pulse_count > 0 {
            self.pulse_count -= 1;
            self.level = if self.level == 0 { self.high_level() } else { 0 };
            self.pulse_timer = self.pulse_length;
            return;
        }
        match self.cont {
            Continuation::NextBlock => self.next_block(),
            Continuation::Sync1 => {
                self.pulse_length = self.sync1_len;
                self.pulse_count = 1;
                self.cont = Continuation::Sync2;
            }
            Continuation::Sync2 => {
                self.pulse_length = self.sync2_len;
                self.pulse_count = 1;
                self.cont = Continuation::DataBit;
            }
            Continuation::DataBit => self.next_data_bit(),
            Continuation::DirectSample => self.next_direct_sample(),
            Continuation::PulseSeq => self.next_seq_pulse(),
        }
    }

    /// Queue the next data bit as a pair of equal pulses, MSB first. The
    /// used-bits count of the last byte ends the block at the right bit.
    fn next_data_bit(&mut self) {
        if self.bits_remaining == 0 {
            if self.data_bytes_remaining == 0 {
                self.start_pause();
                return;
            }
            let Some(b) = self.read_u8() else {
                self.set_end_of_tape();
                return;
            };
            self.shift_reg = b;
            self.data_bytes_remaining -= 1;
            self.bits_remaining = if self.data_bytes_remaining == 0 {
                self.used_bits_last
            } else {
                8
            };
            if self.bits_remaining == 0 {
                self.start_pause();
                return;
            }
        }
        self.bits_remaining -= 1;
        let bit = self.shift_reg & 0x80 != 0;
        self.shift_reg <<= 1;
        self.pulse_length = if bit { self.one_len } else { self.zero_len };
        self.pulse_count = 2;
    }

    /// Direct recording: the level is set from the data bit rather than
    /// toggled, and each source sample holds for a resampled duration
    /// accumulated in 1/`CPU_CLOCK` fixed point.
    fn next_direct_sample(&mut self) {
        if self.bits_remaining == 0 {
            if self.data_bytes_remaining == 0 {
                self.start_pause();
                return;
            }
            let Some(b) = self.read_u8() else {
                self.set_end_of_tape();
                return;
            };
            self.shift_reg = b;
            self.data_bytes_remaining -= 1;
            self.bits_remaining = if self.data_bytes_remaining == 0 {
                self.used_bits_last
            } else {
                8
            };
            if self.bits_remaining == 0 {
                self.start_pause();
                return;
            }
        }
        self.bits_remaining -= 1;
        let bit = self.shift_reg & 0x80 != 0;
        self.shift_reg <<= 1;
        self.level = if bit { self.high_level() } else { 0 };
        let total = self.direct_accum + self.direct_step;
        self.pulse_timer = total / CPU_CLOCK;
        self.direct_accum = total % CPU_CLOCK;
    }

    fn next_seq_pulse(&mut self) {
        if self.seq_remaining == 0 {
            self.cont = Continuation::NextBlock;
            return;
        }
        self.seq_remaining -= 1;
        let Some(t) = self.read_u16_le() else {
            self.set_end_of_tape();
            return;
        };
        self.pulse_length = self.t_states_to_samples(t);
        self.pulse_count = 1;
    }

    /// End of block data: force the level low for the block's pause, then
    /// continue with the next block.
    fn start_pause(&mut self) {
        self.level = 0;
        self.pulse_timer = self.pause_samples;
        self.cont = Continuation::NextBlock;
    }

    /// Common setup for standard-speed data: ROM timings, pilot count by
    /// flag byte (8063 for a header, 3223 otherwise).
    fn setup_standard_block(&mut self, length: u64, pause_ms: u32) {
        let Some(flag) = self.peek_u8() else {
            self.set_end_of_tape();
            return;
        };
        self.zero_len = self.t_states_to_samples(ZERO_PULSE);
        self.one_len = self.t_states_to_samples(ONE_PULSE);
        self.sync1_len = self.t_states_to_samples(SYNC1_PULSE);
        self.sync2_len = self.t_states_to_samples(SYNC2_PULSE);
        self.used_bits_last = 8;
        self.data_bytes_remaining = length;
        self.bits_remaining = 0;
        self.pause_samples = self.ms_to_samples(pause_ms);
        self.pulse_length = self.t_states_to_samples(PILOT_PULSE);
        self.pulse_count = if flag == 0x00 {
            HEADER_PILOT_COUNT
        } else {
            DATA_PILOT_COUNT
        };
        self.cont = Continuation::Sync1;
    }

    fn next_tap_record(&mut self) {
        // End of the record stream is the normal end of the tape.
        let Some(length) = self.read_u16_le() else {
            self.set_end_of_tape();
            return;
        };
        if length == 0 {
            return;
        }
        self.setup_standard_block(u64::from(length), TAP_PAUSE_MS);
    }

    /// Read and set up the next block header. Every failure path here is
    /// fail-closed.
    fn next_block(&mut self) {
        if self.tap_mode {
            self.next_tap_record();
            return;
        }
        let Some(id) = self.read_u8() else {
            self.set_end_of_tape();
            return;
        };
        match id {
            // Standard speed data.
            0x10 => {
                let (Some(pause_ms), Some(length)) = (self.read_u16_le(), self.read_u16_le())
                else {
                    self.set_end_of_tape();
                    return;
                };
                if length == 0 {
                    return;
                }
                self.setup_standard_block(u64::from(length), pause_ms);
            }
            // Turbo speed data: explicit timings, 3-byte length, used bits.
            0x11 => {
                let (
                    Some(pilot),
                    Some(sync1),
                    Some(sync2),
                    Some(zero),
                    Some(one),
                    Some(pilot_count),
                    Some(used_bits),
                    Some(pause_ms),
                    Some(length),
                ) = (
                    self.read_u16_le(),
                    self.read_u16_le(),
                    self.read_u16_le(),
                    self.read_u16_le(),
                    self.read_u16_le(),
                    self.read_u16_le(),
                    self.read_u8(),
                    self.read_u16_le(),
                    self.read_u24_le(),
                )
                else {
                    self.set_end_of_tape();
                    return;
                };
                self.zero_len = self.t_states_to_samples(zero);
                self.one_len = self.t_states_to_samples(one);
                self.sync1_len = self.t_states_to_samples(sync1);
                self.sync2_len = self.t_states_to_samples(sync2);
                self.used_bits_last = if used_bits == 0 || used_bits > 8 {
                    8
                } else {
                    used_bits
                };
                self.data_bytes_remaining = length;
                self.bits_remaining = 0;
                self.pause_samples = self.ms_to_samples(pause_ms);
                self.pulse_length = self.t_states_to_samples(pilot);
                self.pulse_count = pilot_count;
                self.cont = Continuation::Sync1;
            }
            // Pure tone.
            0x12 => {
                let (Some(pulse), Some(count)) = (self.read_u16_le(), self.read_u16_le()) else {
                    self.set_end_of_tape();
                    return;
                };
                self.pulse_length = self.t_states_to_samples(pulse);
                self.pulse_count = count;
                self.cont = Continuation::NextBlock;
            }
            // Raw pulse sequence.
            0x13 => {
                let Some(count) = self.read_u8() else {
                    self.set_end_of_tape();
                    return;
                };
                self.seq_remaining = u16::from(count);
                self.cont = Continuation::PulseSeq;
            }
            // Pure data: bits with no pilot or sync prefix.
            0x14 => {
                let (Some(zero), Some(one), Some(used_bits), Some(pause_ms), Some(length)) = (
                    self.read_u16_le(),
                    self.read_u16_le(),
                    self.read_u8(),
                    self.read_u16_le(),
                    self.read_u24_le(),
                ) else {
                    self.set_end_of_tape();
                    return;
                };
                self.zero_len = self.t_states_to_samples(zero);
                self.one_len = self.t_states_to_samples(one);
                self.used_bits_last = if used_bits == 0 || used_bits > 8 {
                    8
                } else {
                    used_bits
                };
                self.data_bytes_remaining = length;
                self.bits_remaining = 0;
                self.pause_samples = self.ms_to_samples(pause_ms);
                self.cont = Continuation::DataBit;
            }
            // Direct recording.
            0x15 => {
                let (Some(t_per_sample), Some(pause_ms), Some(used_bits), Some(length)) = (
                    self.read_u16_le(),
                    self.read_u16_le(),
                    self.read_u8(),
                    self.read_u24_le(),
                ) else {
                    self.set_end_of_tape();
                    return;
                };
                self.direct_step = u64::from(t_per_sample) * u64::from(self.state.sample_rate);
                self.direct_accum = 0;
                self.used_bits_last = if used_bits == 0 || used_bits > 8 {
                    8
                } else {
                    used_bits
                };
                self.data_bytes_remaining = length;
                self.bits_remaining = 0;
                self.pause_samples = self.ms_to_samples(pause_ms);
                self.cont = Continuation::DirectSample;
            }
            // Pause, or stop the tape when the duration is zero.
            0x20 => {
                let Some(pause_ms) = self.read_u16_le() else {
                    self.set_end_of_tape();
                    return;
                };
                if pause_ms == 0 {
                    self.state.is_playback_on = false;
                    self.state.is_record_on = false;
                    return;
                }
                self.pause_samples = self.ms_to_samples(pause_ms);
                self.start_pause();
            }
            // Group start (skip name) and group end.
            0x21 => {
                let skipped = self
                    .read_u8()
                    .and_then(|n| self.skip(u64::from(n)));
                if skipped.is_none() {
                    self.set_end_of_tape();
                }
            }
            0x22 => {}
            // Loop start.
            0x24 => {
                let (Some(repetitions), Ok(body_offset)) =
                    (self.read_u16_le(), self.file.stream_position())
                else {
                    self.set_end_of_tape();
                    return;
                };
                self.loop_state = Some(LoopState {
                    body_offset,
                    position: self.state.tape_position,
                    remaining: repetitions as u16,
                });
            }
            // Loop end. A body that produced no tape progress would loop
            // forever on the same file range, so it fails closed instead.
            0x25 => {
                if let Some(mut lp) = self.loop_state.take() {
                    if lp.remaining > 1 {
                        if self.state.tape_position == lp.position {
                            self.set_end_of_tape();
                            return;
                        }
                        lp.remaining -= 1;
                        lp.position = self.state.tape_position;
                        if self.file.seek(SeekFrom::Start(lp.body_offset)).is_err() {
                            self.set_end_of_tape();
                            return;
                        }
                        self.loop_state = Some(lp);
                    }
                }
            }
            // Text description.
            0x30 => {
                let skipped = self
                    .read_u8()
                    .and_then(|n| self.skip(u64::from(n)));
                if skipped.is_none() {
                    self.set_end_of_tape();
                }
            }
            // Message: display time byte, then length-prefixed text.
            0x31 => {
                let skipped = self
                    .read_u8()
                    .and(self.read_u8())
                    .and_then(|n| self.skip(u64::from(n)));
                if skipped.is_none() {
                    self.set_end_of_tape();
                }
            }
            // Archive info.
            0x32 => {
                let skipped = self.read_u16_le().and_then(|n| self.skip(u64::from(n)));
                if skipped.is_none() {
                    self.set_end_of_tape();
                }
            }
            // Hardware type: 3 bytes per entry.
            0x33 => {
                let skipped = self
                    .read_u8()
                    .and_then(|n| self.skip(u64::from(n) * 3));
                if skipped.is_none() {
                    self.set_end_of_tape();
                }
            }
            // Custom info: 16-byte identifier, then a 32-bit length.
            0x35 => {
                let skipped = self
                    .skip(16)
                    .and_then(|()| self.read_u32_le())
                    .and_then(|n| self.skip(n));
                if skipped.is_none() {
                    self.set_end_of_tape();
                }
            }
            // Glue block: re-validate the signature tail of a concatenated
            // container.
            0x5A => {
                let mut tail = [0u8; 9];
                if self.file.read_exact(&mut tail).is_err() || tail[..7] != TZX_MAGIC[1..] {
                    self.set_end_of_tape();
                }
            }
            _ => self.set_end_of_tape(),
        }
    }
}

impl Tape for TzxTape {
    fn state(&self) -> &TapeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TapeState {
        &mut self.state
    }

    fn run_sample(&mut self) -> Result<(), TapeError> {
        if self.end_of_tape {
            self.state.output_state = 0;
            return Ok(());
        }
        if self.pulse_timer == 0 {
            let mut guard = PULSE_GUARD;
            while self.pulse_timer == 0 && !self.end_of_tape && self.state.is_playback_on {
                self.step();
                guard -= 1;
                if guard == 0 {
                    self.set_end_of_tape();
                }
            }
        }
        if self.end_of_tape {
            self.state.output_state = 0;
            return Ok(());
        }
        if self.pulse_timer > 0 {
            self.pulse_timer -= 1;
        }
        self.state.output_state = self.level;
        self.state.tape_position += 1;
        self.state.tape_length = self.state.tape_position + 1;
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<(), TapeError> {
        if seconds <= 0.0 {
            self.rewind();
        }
        Ok(())
    }

    fn seek_to_cue_point(&mut self, forward: bool, seconds: f64) -> Result<(), TapeError> {
        let _ = seconds;
        if !forward {
            self.rewind();
        }
        Ok(())
    }
}
