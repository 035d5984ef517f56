//! Legacy chunked tape format ("EPTE"), read-only.
//!
//! # File layout
//!
//! - Bytes 0-511: chunk directory of 128 little-endian u32 words; chunk *i*
//!   spans `word[i] .. word[i+1]` within the data area. The 32-byte ASCII
//!   signature `"ENTERPRISE 128K TAPE FILE       "` sits at offset 128,
//!   overlapping the unused middle of the directory.
//! - Bytes 512..: chunk data, a plain byte stream.
//!
//! # Signal reconstruction
//!
//! The driver regenerates a self-clocking square wave at 24 kHz: between
//! chunks a leader of 1024 half-periods of width 5, then a sync bit of two
//! 8-sample half-periods, then the chunk's bytes LSB first. A 0 bit is a
//! pair of 6-sample half-periods, a 1 bit a pair of 4-sample half-periods.
//! End of tape is reached when the byte counter and the leader counter are
//! both exhausted.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tape_core::{Tape, TapeError, TapeState};

/// Signature at offset 128 (25 characters padded with spaces to 32).
const EPTE_MAGIC: &[u8; 32] = b"ENTERPRISE 128K TAPE FILE       ";
/// File offset of the signature.
const MAGIC_OFFSET: u64 = 128;
/// Start of chunk data.
const DATA_OFFSET: u64 = 512;
/// Number of chunk directory words.
const DIRECTORY_WORDS: usize = 128;
/// Half-periods in an inter-chunk leader.
const LEADER_HALF_PERIODS: u64 = 1024;
/// Leader half-period width in samples.
const LEADER_WIDTH: u8 = 5;

/// Legacy chunked format driver.
pub struct EpteTape {
    state: TapeState,
    file: BufReader<File>,
    file_size: u64,
    bytes_remaining: u64,
    end_of_tape: bool,
    shift_reg: u8,
    bits_remaining: u8,
    half_period_samples: u8,
    samples_remaining: u64,
    leader_sample_cnt: u64,
    chunk_bytes_remaining: u64,
    chunk_cnt: usize,
}

impl EpteTape {
    /// Open an EPTE tape file read-only.
    ///
    /// # Errors
    ///
    /// `NotRecognized` if the file is shorter than 512 bytes or the
    /// signature at offset 128 does not match; `Io` if the file cannot be
    /// opened or read.
    pub fn open(path: &Path, bits_per_sample: u8) -> Result<Self, TapeError> {
        let state = TapeState::new(bits_per_sample)?;
        let file = File::open(path)?;
        let mut file = BufReader::new(file);
        let file_size = file.seek(SeekFrom::End(0))?;
        if file_size < DATA_OFFSET {
            return Err(TapeError::NotRecognized);
        }
        file.seek(SeekFrom::Start(MAGIC_OFFSET))?;
        let mut magic = [0u8; 32];
        file.read_exact(&mut magic)?;
        if &magic != EPTE_MAGIC {
            return Err(TapeError::NotRecognized);
        }
        let mut tape = Self {
            state,
            file,
            file_size,
            bytes_remaining: 0,
            end_of_tape: false,
            shift_reg: 0,
            bits_remaining: 0,
            half_period_samples: LEADER_WIDTH,
            samples_remaining: 0,
            leader_sample_cnt: 0,
            chunk_bytes_remaining: 0,
            chunk_cnt: 0,
        };
        tape.rewind();
        Ok(tape)
    }

    /// Reset the whole decode state and reposition at the first data byte.
    fn rewind(&mut self) {
        self.state.tape_length = 0;
        self.state.tape_position = 0;
        self.state.output_state = 0;
        self.bytes_remaining = 0;
        self.end_of_tape = false;
        self.shift_reg = 0;
        self.bits_remaining = 0;
        self.half_period_samples = LEADER_WIDTH;
        self.samples_remaining = 0;
        self.leader_sample_cnt = 0;
        self.chunk_bytes_remaining = 0;
        self.chunk_cnt = 0;
        if self.file_size > DATA_OFFSET {
            self.bytes_remaining = self.file_size - DATA_OFFSET;
            self.state.tape_length = self.bytes_remaining * 80;
            let _ = self.file.seek(SeekFrom::Start(DATA_OFFSET));
        }
    }

    /// Read one data byte; a failed read decodes as 0xFF (the byte counter
    /// bounds how far that can run).
    fn read_byte(&mut self) -> u8 {
        let mut b = [0u8; 1];
        match self.file.read_exact(&mut b) {
            Ok(()) => b[0],
            Err(_) => 0xFF,
        }
    }

    fn read_u32_le(&mut self) -> u64 {
        let mut b = [0u8; 4];
        match self.file.read_exact(&mut b) {
            Ok(()) => u64::from(u32::from_le_bytes(b)),
            Err(_) => 0,
        }
    }

    /// Advance to the next chunk in the directory; falls back to the rest
    /// of the file when the directory entry is unusable. The entry is
    /// untrusted: a chunk can never claim more bytes than the data area
    /// still holds.
    fn next_chunk(&mut self) {
        let mut start_pos = 0u64;
        let mut end_pos = 0u64;
        if self.chunk_cnt < DIRECTORY_WORDS {
            let _ = self
                .file
                .seek(SeekFrom::Start((self.chunk_cnt as u64) << 2));
            start_pos = self.read_u32_le();
            self.chunk_cnt += 1;
            if self.chunk_cnt < DIRECTORY_WORDS {
                end_pos = self.read_u32_le();
            }
            let _ = self.file.seek(SeekFrom::Start(start_pos + DATA_OFFSET));
        }
        self.chunk_bytes_remaining = if end_pos > start_pos {
            (end_pos - start_pos).min(self.bytes_remaining)
        } else {
            self.bytes_remaining
        };
    }
}

impl Tape for EpteTape {
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
        if self.samples_remaining == 0 {
            // Half-period boundary: toggle and pick the next width.
            let high = 1u8 << (self.state.requested_bits_per_sample - 1);
            self.state.output_state = if self.state.output_state == 0 { high } else { 0 };
            if self.half_period_samples == 8 {
                // Sync bit: both halves 8 wide; the 6 seeds the next width.
                if self.state.output_state == 0 {
                    self.half_period_samples = 6;
                }
                self.samples_remaining = 8;
            } else {
                if self.state.output_state != 0 && self.leader_sample_cnt == 0 {
                    if self.bits_remaining == 0 {
                        if self.chunk_bytes_remaining > 0 {
                            self.chunk_bytes_remaining -= 1;
                            self.shift_reg = self.read_byte();
                            self.bytes_remaining -= 1;
                            self.bits_remaining = 8;
                        } else {
                            // End of chunk: start the leader.
                            self.half_period_samples = LEADER_WIDTH;
                            self.leader_sample_cnt =
                                LEADER_HALF_PERIODS * u64::from(LEADER_WIDTH);
                        }
                    }
                    if self.bits_remaining > 0 {
                        self.bits_remaining -= 1;
                        self.half_period_samples = if self.shift_reg & 0x01 == 0 {
                            6 // bit = 0
                        } else {
                            4 // bit = 1
                        };
                        self.shift_reg >>= 1;
                    }
                }
                self.samples_remaining = u64::from(self.half_period_samples);
            }
        }
        if self.leader_sample_cnt > 0 {
            self.leader_sample_cnt -= 1;
            if self.leader_sample_cnt == 0 {
                if self.bytes_remaining == 0 {
                    // Leader and byte counter both exhausted: end of tape.
                    self.end_of_tape = true;
                    self.state.output_state = 0;
                    self.samples_remaining = 0;
                    self.state.tape_position = self.state.tape_length;
                    return Ok(());
                }
                // Sync bit precedes the next chunk.
                self.half_period_samples = 8;
                self.next_chunk();
            }
        }
        if self.samples_remaining > 0 {
            self.samples_remaining -= 1;
        }
        self.state.tape_position += 1;
        self.state.tape_length = self.state.tape_position
            + self.bytes_remaining * 80
            + self.leader_sample_cnt
            + 1;
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
