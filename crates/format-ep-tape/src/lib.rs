//! Native tape image format: the read-write, round-trippable container.
//!
//! # File layout (bit-exact)
//!
//! A fixed 4096-byte header of 1024 big-endian u32 words:
//!
//! - Words 0-1: magic (`0x0275CD72`, `0x1C445126`)
//! - Word 2: bits per sample in the file (1, 2, 4, or 8)
//! - Word 3: sample rate in Hz (10,000 to 120,000)
//! - Words 4-1022: cue point table — sample positions in sorted order,
//!   padded with `0xFFFFFFFF` (at most 1019 entries)
//! - Word 1023: must be `0xFFFFFFFF`
//!
//! The payload is a sequence of blocks of `512 × bits` bytes, each encoding
//! 4096 samples packed MSB first.
//!
//! Files without the magic header are accepted as headerless raw sample
//! data (1 bit per sample, 24 kHz, no cue table); that fallback is what
//! makes this driver the universal last resort of the detection factory.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tape_core::{MAX_SAMPLE_RATE, MIN_SAMPLE_RATE, OpenMode, Tape, TapeError, TapeState};

/// First magic word of the native header.
pub const MAGIC_1: u32 = 0x0275_CD72;
/// Second magic word of the native header.
pub const MAGIC_2: u32 = 0x1C44_5126;

/// Samples per payload block (and per in-memory page).
const BLOCK_SAMPLES: usize = 4096;
/// Header size in u32 words.
const HEADER_WORDS: usize = 1024;
/// Header size in bytes.
const HEADER_BYTES: u64 = 4096;
/// First cue table slot within the header.
const CUE_BASE: usize = 4;
/// Maximum number of cue points (slots 4..=1022; 1023 is the sentinel).
const MAX_CUE_POINTS: usize = 1019;
/// Cue table sentinel / padding value.
const CUE_SENTINEL: u32 = 0xFFFF_FFFF;

/// Native format tape driver.
pub struct EpTape {
    state: TapeState,
    file: File,
    /// One unpacked 4096-sample page, in the requested bit depth's range.
    buf: Box<[u8; BLOCK_SAMPLES]>,
    header: Box<[u32; HEADER_WORDS]>,
    cue_point_cnt: usize,
    buffer_dirty: bool,
    using_new_format: bool,
}

impl EpTape {
    /// Open or create the tape file at `path`.
    ///
    /// `sample_rate` and `bits_per_sample` apply only when a new file is
    /// created; an existing file's header wins, and samples are converted
    /// between the file depth and `bits_per_sample` on the fly.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for a bad sample rate or bit depth, `Io` when the
    /// file cannot be opened or created.
    pub fn open(
        path: &Path,
        mode: OpenMode,
        sample_rate: u32,
        bits_per_sample: u8,
    ) -> Result<Self, TapeError> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
            return Err(TapeError::InvalidParameter("tape sample rate"));
        }
        let mut state = TapeState::new(bits_per_sample)?;
        state.is_read_only = false;

        let mut file = None;
        if matches!(mode, OpenMode::ReadWrite | OpenMode::ReadWriteExisting) {
            file = OpenOptions::new().read(true).write(true).open(path).ok();
        }
        if file.is_none() && mode != OpenMode::Create {
            if let Ok(f) = File::open(path) {
                state.is_read_only = true;
                file = Some(f);
            }
        }
        if let Some(f) = file {
            Self::open_existing(state, f)
        } else if matches!(mode, OpenMode::ReadWrite | OpenMode::Create) {
            Self::create_new(state, path, sample_rate)
        } else {
            Err(TapeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "tape file does not exist",
            )))
        }
    }

    fn create_new(mut state: TapeState, path: &Path, sample_rate: u32) -> Result<Self, TapeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        state.sample_rate = sample_rate;
        state.file_bits_per_sample = state.requested_bits_per_sample;
        let mut header = Box::new([CUE_SENTINEL; HEADER_WORDS]);
        header[0] = MAGIC_1;
        header[1] = MAGIC_2;
        header[2] = u32::from(state.file_bits_per_sample);
        header[3] = state.sample_rate;
        let mut tape = Self {
            state,
            file,
            buf: Box::new([0; BLOCK_SAMPLES]),
            header,
            cue_point_cnt: 0,
            buffer_dirty: false,
            using_new_format: true,
        };
        if let Err(e) = tape.write_header() {
            // Leave no half-written file behind.
            let _ = std::fs::remove_file(path);
            return Err(e);
        }
        Ok(tape)
    }

    fn open_existing(mut state: TapeState, mut file: File) -> Result<Self, TapeError> {
        let file_size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        let mut header = Box::new([CUE_SENTINEL; HEADER_WORDS]);
        let mut using_new_format = false;
        let mut cue_point_cnt = 0;
        if file_size >= HEADER_BYTES {
            let mut raw = [0u8; HEADER_BYTES as usize];
            file.read_exact(&mut raw)?;
            for (word, bytes) in header.iter_mut().zip(raw.chunks_exact(4)) {
                *word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            if header[0] == MAGIC_1
                && header[1] == MAGIC_2
                && matches!(header[2], 1 | 2 | 4 | 8)
                && (u64::from(MIN_SAMPLE_RATE)..=u64::from(MAX_SAMPLE_RATE))
                    .contains(&u64::from(header[3]))
                && header[HEADER_WORDS - 1] == CUE_SENTINEL
            {
                using_new_format = true;
                state.sample_rate = header[3];
                state.file_bits_per_sample = header[2] as u8;
                // Defend against unsorted cue tables written by other tools.
                header[CUE_BASE..HEADER_WORDS - 1].sort_unstable();
                while header[CUE_BASE + cue_point_cnt] != CUE_SENTINEL {
                    cue_point_cnt += 1;
                }
            }
        }
        if !using_new_format {
            // Headerless raw data: synthesize an in-memory header (never
            // written back; the file has no cue table).
            header.fill(CUE_SENTINEL);
            header[0] = MAGIC_1;
            header[1] = MAGIC_2;
            header[2] = u32::from(state.file_bits_per_sample);
            header[3] = state.sample_rate;
        }
        let mut data_bytes = file_size;
        if using_new_format {
            data_bytes -= HEADER_BYTES;
        }
        state.tape_length = data_bytes * 8 / u64::from(state.file_bits_per_sample);

        let mut tape = Self {
            state,
            file,
            buf: Box::new([0; BLOCK_SAMPLES]),
            header,
            cue_point_cnt,
            buffer_dirty: false,
            using_new_format,
        };
        tape.read_buffer();
        tape.unpack_samples();
        Ok(tape)
    }

    /// Current payload block size in bytes.
    fn block_size(&self) -> usize {
        512 * usize::from(self.state.file_bits_per_sample)
    }

    /// Binary search the cue table for `pos`. Returns the index of the
    /// match or of the nearest entry at or below it, and whether the match
    /// was exact.
    fn find_cue_point(&self, pos: u64) -> (usize, bool) {
        let table = &self.header[CUE_BASE..];
        let pos = u32::try_from(pos.min(0xFFFF_FFFE)).unwrap_or(0xFFFF_FFFE);
        let mut min = 0usize;
        let mut max = self.cue_point_cnt;
        while min + 1 < max {
            let mid = (min + max) >> 1;
            if pos > table[mid] {
                min = mid;
            } else if pos < table[mid] {
                max = mid;
            } else {
                return (mid, true);
            }
        }
        (min, table[min] == pos)
    }

    /// Convert the unpacked page back to the file's bit depth and pack it
    /// MSB first into the front of `buf`.
    fn pack_samples(&mut self) {
        let file_bits = self.state.file_bits_per_sample;
        let req_bits = self.state.requested_bits_per_sample;
        let max_value = ((1u32 << req_bits) - 1) as u8;
        if file_bits == req_bits {
            for s in self.buf.iter_mut() {
                *s = (*s).min(max_value);
            }
        } else if file_bits < req_bits {
            let shift = req_bits - file_bits;
            for s in self.buf.iter_mut() {
                *s = (*s).min(max_value) >> shift;
            }
        } else {
            let shift = file_bits - req_bits;
            for s in self.buf.iter_mut() {
                *s = (*s).min(max_value) << shift;
            }
        }
        if file_bits != 8 {
            let n_bits = u32::from(file_bits);
            let mut byte_buf = 0u32;
            let mut bit_cnt = 8u32;
            let mut write_pos = 0usize;
            for i in 0..BLOCK_SAMPLES {
                byte_buf = (byte_buf << n_bits) | u32::from(self.buf[i]);
                bit_cnt -= n_bits;
                if bit_cnt == 0 {
                    self.buf[write_pos] = byte_buf as u8;
                    write_pos += 1;
                    byte_buf = 0;
                    bit_cnt = 8;
                }
            }
        }
    }

    /// Unpack the front of `buf` (file bit depth, MSB first) into 4096
    /// samples at the requested bit depth.
    fn unpack_samples(&mut self) {
        let file_bits = self.state.file_bits_per_sample;
        let req_bits = self.state.requested_bits_per_sample;
        if file_bits != 8 {
            let n_bits = u32::from(file_bits);
            let bit_mask = (1u32 << n_bits) - 1;
            let mut byte_buf = 0u32;
            let mut bit_cnt = 0u32;
            let mut read_pos = self.block_size();
            for i in (0..BLOCK_SAMPLES).rev() {
                if bit_cnt == 0 {
                    read_pos -= 1;
                    byte_buf = u32::from(self.buf[read_pos]);
                    bit_cnt = 8;
                }
                self.buf[i] = (byte_buf & bit_mask) as u8;
                byte_buf >>= n_bits;
                bit_cnt -= n_bits;
            }
        }
        if file_bits < req_bits {
            let shift = req_bits - file_bits;
            for s in self.buf.iter_mut() {
                *s <<= shift;
            }
        } else if file_bits > req_bits {
            let shift = file_bits - req_bits;
            for s in self.buf.iter_mut() {
                *s >>= shift;
            }
        }
    }

    /// Write the packed page to its block in the file. The final block of
    /// the tape is written only up to the last recorded sample, so the file
    /// size tracks the tape length exactly (rounded up to whole bytes).
    fn write_buffer(&mut self) -> Result<(), TapeError> {
        let block_size = self.block_size();
        let bits = u64::from(self.state.file_bits_per_sample);
        let block_start = self.state.tape_position >> 12 << 12;
        let mut file_pos = (self.state.tape_position >> 12) * block_size as u64;
        if self.using_new_format {
            file_pos += HEADER_BYTES;
        }
        let samples_in_block = self
            .state
            .tape_length
            .saturating_sub(block_start)
            .min(BLOCK_SAMPLES as u64);
        let byte_count = ((samples_in_block * bits).div_ceil(8)) as usize;
        if byte_count == 0 {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(file_pos))?;
        self.file.write_all(&self.buf[..byte_count])?;
        self.file.flush()?;
        Ok(())
    }

    /// Read the current position's block into the page, zero-padding past
    /// the end of the file. Read failures leave a zeroed page and are not
    /// errors (matching long-standing behavior; a short tape reads as
    /// silence).
    fn read_buffer(&mut self) {
        let block_size = self.block_size();
        self.buf[..block_size].fill(0);
        if (self.state.tape_position & !0xFFF) >= self.state.tape_length {
            return;
        }
        let mut file_pos = (self.state.tape_position >> 12) * block_size as u64;
        if self.using_new_format {
            file_pos += HEADER_BYTES;
        }
        if self.file.seek(SeekFrom::Start(file_pos)).is_err() {
            return;
        }
        let mut total = 0usize;
        while total < block_size {
            match self.file.read(&mut self.buf[total..block_size]) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
    }

    /// Serialize the header as big-endian words and write it at offset 0.
    fn write_header(&mut self) -> Result<(), TapeError> {
        if !self.using_new_format {
            return Ok(());
        }
        let mut raw = [0u8; HEADER_BYTES as usize];
        for (word, bytes) in self.header.iter().zip(raw.chunks_exact_mut(4)) {
            bytes.copy_from_slice(&word.to_be_bytes());
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&raw)?;
        self.file.flush()?;
        Ok(())
    }

    /// Flush the page if dirty. The page stays valid (and unpacked) whether
    /// or not the write succeeded; the error is the caller's to surface.
    fn flush_buffer(&mut self) -> Result<(), TapeError> {
        if !self.buffer_dirty {
            return Ok(());
        }
        self.pack_samples();
        let result = self.write_buffer();
        self.unpack_samples();
        self.buffer_dirty = false;
        result
    }

    /// Seek to an absolute sample position, flushing and reloading the page
    /// when a block boundary is crossed. A flush failure is reported only
    /// after the new page has been loaded.
    fn seek_samples(&mut self, pos: u64) -> Result<(), TapeError> {
        let pos = pos.min(self.state.tape_length);
        let old_block = self.state.tape_position >> 12;
        let new_block = pos >> 12;
        if new_block == old_block {
            self.state.tape_position = pos;
            return Ok(());
        }
        let flush_result = self.flush_buffer();
        self.state.tape_position = pos;
        self.read_buffer();
        self.unpack_samples();
        flush_result
    }

    fn add_cue(&mut self) -> Result<(), TapeError> {
        if self.state.is_read_only || self.cue_point_cnt >= MAX_CUE_POINTS || !self.using_new_format
        {
            return Ok(());
        }
        let pos =
            u32::try_from(self.state.tape_position.min(0xFFFF_FFFE)).unwrap_or(0xFFFF_FFFE);
        let (_, exact) = self.find_cue_point(u64::from(pos));
        if exact {
            return Ok(());
        }
        let table = &mut self.header[CUE_BASE..];
        table[self.cue_point_cnt] = pos;
        self.cue_point_cnt += 1;
        // Single backward pass from the tail restores sorted order.
        let mut i = self.cue_point_cnt - 1;
        while i != 0 {
            i -= 1;
            if table[i] < table[i + 1] {
                break;
            }
            table.swap(i, i + 1);
        }
        self.write_header()
    }

    fn delete_nearest_cue(&mut self) -> Result<(), TapeError> {
        if self.state.is_read_only || self.cue_point_cnt < 1 {
            return Ok(());
        }
        let pos =
            u32::try_from(self.state.tape_position.min(0xFFFF_FFFE)).unwrap_or(0xFFFF_FFFE);
        let table = &mut self.header[CUE_BASE..];
        let mut ndx = 0usize;
        let mut nearest = u32::MAX;
        for (i, &cue) in table[..self.cue_point_cnt].iter().enumerate() {
            let diff = cue.abs_diff(pos);
            if diff >= nearest {
                break;
            }
            nearest = diff;
            ndx = i;
        }
        for i in ndx + 1..self.cue_point_cnt {
            table[i - 1] = table[i];
        }
        self.cue_point_cnt -= 1;
        table[self.cue_point_cnt] = CUE_SENTINEL;
        self.write_header()
    }

    fn delete_all_cues(&mut self) -> Result<(), TapeError> {
        if self.state.is_read_only || self.cue_point_cnt < 1 {
            return Ok(());
        }
        self.header[CUE_BASE..].fill(CUE_SENTINEL);
        self.cue_point_cnt = 0;
        self.write_header()
    }

    /// Number of cue points currently defined.
    #[must_use]
    pub fn cue_point_count(&self) -> usize {
        self.cue_point_cnt
    }
}

impl Tape for EpTape {
    fn state(&self) -> &TapeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TapeState {
        &mut self.state
    }

    fn run_sample(&mut self) -> Result<(), TapeError> {
        let idx = (self.state.tape_position & 0xFFF) as usize;
        self.state.output_state = self.buf[idx];
        if self.state.is_record_on {
            self.buf[idx] = self.state.input_state;
            self.buffer_dirty = true;
        }
        let mut pos = self.state.tape_position + 1;
        if self.state.is_record_on {
            // Recording extends the tape.
            if pos > self.state.tape_length {
                self.state.tape_length = pos;
            }
        } else {
            pos = pos.min(self.state.tape_length);
        }
        if self.state.is_record_on && self.cue_point_cnt > 0 {
            let (_, exact) = self.find_cue_point(pos);
            if exact {
                // Recording over a cue point deletes it.
                let saved = self.state.tape_position;
                self.state.tape_position = pos;
                let result = self.delete_nearest_cue();
                self.state.tape_position = saved;
                result?;
            }
        }
        let old_block = self.state.tape_position >> 12;
        let new_block = pos >> 12;
        if new_block == old_block {
            self.state.tape_position = pos;
            return Ok(());
        }
        let flush_result = self.flush_buffer();
        self.state.tape_position = pos;
        self.read_buffer();
        self.unpack_samples();
        flush_result
    }

    fn set_is_motor_on(&mut self, on: bool) -> Result<(), TapeError> {
        self.state.is_motor_on = on;
        if on { Ok(()) } else { self.flush_buffer() }
    }

    fn stop(&mut self) -> Result<(), TapeError> {
        self.state.is_playback_on = false;
        self.state.is_record_on = false;
        self.flush_buffer()
    }

    fn seek(&mut self, seconds: f64) -> Result<(), TapeError> {
        let pos = if seconds > 0.0 {
            (seconds * f64::from(self.state.sample_rate) + 0.5) as u64
        } else {
            0
        };
        self.seek_samples(pos)
    }

    fn seek_to_cue_point(&mut self, forward: bool, seconds: f64) -> Result<(), TapeError> {
        if self.cue_point_cnt > 0 {
            let (ndx, _) = self.find_cue_point(self.state.tape_position);
            let table = &self.header[CUE_BASE..];
            let cue = u64::from(table[ndx]);
            if (cue < self.state.tape_position && !forward)
                || (cue > self.state.tape_position && forward)
            {
                return self.seek_samples(cue);
            } else if ndx > 0 && !forward {
                let prev = u64::from(table[ndx - 1]);
                return self.seek_samples(prev);
            } else if ndx + 1 < self.cue_point_cnt && forward {
                let next = u64::from(table[ndx + 1]);
                return self.seek_samples(next);
            }
        }
        let t = seconds.max(0.0);
        let here = self.position();
        if forward {
            self.seek(here + t)
        } else {
            self.seek(here - t)
        }
    }

    fn add_cue_point(&mut self) -> Result<(), TapeError> {
        self.add_cue()
    }

    fn delete_nearest_cue_point(&mut self) -> Result<(), TapeError> {
        self.delete_nearest_cue()
    }

    fn delete_all_cue_points(&mut self) -> Result<(), TapeError> {
        self.delete_all_cues()
    }
}

impl Drop for EpTape {
    fn drop(&mut self) {
        // Best effort: callers that need the error call stop() first.
        let _ = self.flush_buffer();
    }
}
