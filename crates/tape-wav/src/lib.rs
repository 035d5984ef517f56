//! Generic sound-file tape driver.
//!
//! Wraps a multi-channel PCM WAV file and exposes one channel as the tape
//! signal, using the same 1024-frame page cache and dirty-flag discipline
//! as the native driver. Integer widths and 32-bit float go through hound;
//! 64-bit IEEE float frames are read straight from the data chunk. Recording requantizes the narrow input level to
//! full 16-bit range and patches the samples back into the file in place;
//! it is only available for 16-bit integer PCM and never extends the file.
//! An optional FIR band-pass (see [`fir`]) cleans up noisy recordings at
//! page-load time.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec};
use tape_core::{OpenMode, Tape, TapeError, TapeState};

pub mod fir;

pub use fir::FirBandPass;

/// Frames per cached page.
const PAGE_FRAMES: u64 = 1024;
/// FIR kernel length (forced odd by the filter).
const FIR_TAPS: usize = 257;

/// WAVE format tag for IEEE float.
const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;

/// In-place write-back target for 16-bit PCM files.
struct WriteBack {
    file: File,
    /// Byte offset of the data chunk payload.
    data_offset: u64,
}

/// Where the frames come from. hound decodes everything up to 32-bit
/// float; 64-bit float frames are read straight from the data chunk.
enum Source {
    Decoded(WavReader<std::io::BufReader<File>>),
    Float64 { file: File, data_offset: u64 },
}

/// WAV-backed tape driver.
pub struct WavTape {
    state: TapeState,
    source: Source,
    spec: WavSpec,
    writer: Option<WriteBack>,
    channel: u16,
    invert: bool,
    /// One page of the selected channel, normalized to i16.
    buf: Vec<i16>,
    page_frame: u64,
    buffer_dirty: bool,
    filter: Option<FirBandPass>,
}

impl WavTape {
    /// Open a WAV file. Recording is enabled only for 16-bit integer PCM
    /// opened in a writable mode on a writable file; anything else degrades
    /// to read-only.
    ///
    /// # Errors
    ///
    /// `NotRecognized` if the file is neither a WAV format hound can
    /// decode nor 64-bit IEEE float; `Io` on plain I/O failures.
    pub fn open(path: &Path, mode: OpenMode, bits_per_sample: u8) -> Result<Self, TapeError> {
        let mut state = TapeState::new(bits_per_sample)?;
        let (source, spec, total) = match WavReader::open(path) {
            Ok(r) => {
                let spec = r.spec();
                let total = u64::from(r.duration());
                (Source::Decoded(r), spec, total)
            }
            Err(hound::Error::IoError(e)) => return Err(TapeError::Io(e)),
            Err(_) => open_float64(path)?,
        };

        let writable = !matches!(mode, OpenMode::ReadOnly)
            && spec.sample_format == SampleFormat::Int
            && spec.bits_per_sample == 16;
        let writer = if writable {
            // A file we cannot reopen read-write silently degrades, like
            // the native driver's read-only fallback.
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(mut f) => find_chunk(&mut f, b"data")?.map(|(data_offset, _)| WriteBack {
                    file: f,
                    data_offset,
                }),
                Err(_) => None,
            }
        } else {
            None
        };

        state.sample_rate = spec.sample_rate;
        state.file_bits_per_sample = spec.bits_per_sample as u8;
        state.is_read_only = writer.is_none();
        state.tape_length = total;

        let mut tape = Self {
            state,
            source,
            spec,
            writer,
            channel: 0,
            invert: false,
            buf: vec![0; PAGE_FRAMES as usize],
            page_frame: 0,
            buffer_dirty: false,
            filter: None,
        };
        tape.load_page();
        Ok(tape)
    }

    /// Select the source channel and signal polarity.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if the channel does not exist. A pending page is
    /// flushed first; its write error surfaces here.
    pub fn set_parameters(&mut self, channel: u16, invert: bool) -> Result<(), TapeError> {
        if channel >= self.spec.channels {
            return Err(TapeError::InvalidParameter("sound file channel"));
        }
        let flush_result = self.flush_page();
        self.channel = channel;
        self.invert = invert;
        if let Some(f) = self.filter.as_mut() {
            f.reset();
        }
        self.load_page();
        flush_result
    }

    /// Enable the playback band-pass filter with the given cutoffs in Hz.
    pub fn enable_fir_filter(&mut self, min_freq: f32, max_freq: f32) -> Result<(), TapeError> {
        let flush_result = self.flush_page();
        self.filter = Some(FirBandPass::new(
            FIR_TAPS,
            min_freq,
            max_freq,
            self.state.sample_rate as f32,
            PAGE_FRAMES as usize,
        ));
        self.load_page();
        flush_result
    }

    pub fn disable_fir_filter(&mut self) -> Result<(), TapeError> {
        let flush_result = self.flush_page();
        self.filter = None;
        self.load_page();
        flush_result
    }

    fn quantize(&self, sample: i16) -> u8 {
        let s = if self.invert { !sample } else { sample };
        let u = (i32::from(s) + 32768) as u32;
        (u >> (16 - self.state.requested_bits_per_sample)) as u8
    }

    /// Requantize an input level to full 16-bit range.
    fn requantize(&self, level: u8) -> i16 {
        let max = (1u32 << self.state.requested_bits_per_sample) - 1;
        let s = (u32::from(level).min(max) * 65535 / max) as i32 - 32768;
        let s = s as i16;
        if self.invert { !s } else { s }
    }

    /// Load the page containing the current position, zero-padding past
    /// the end of the file. Read failures leave silence, as in the native
    /// driver. The FIR filter is applied here, except while recording.
    fn load_page(&mut self) {
        let base = (self.state.tape_position / PAGE_FRAMES) * PAGE_FRAMES;
        self.page_frame = base;
        self.buf.fill(0);
        let total = self.state.tape_length;
        if base >= total {
            return;
        }
        let frames = ((total - base).min(PAGE_FRAMES)) as usize;
        let channels = usize::from(self.spec.channels);
        let ch = usize::from(self.channel);
        let wanted = frames * channels;
        match &mut self.source {
            Source::Decoded(reader) => {
                if reader.seek(base as u32).is_err() {
                    return;
                }
                match self.spec.sample_format {
                    SampleFormat::Int => {
                        let bits = self.spec.bits_per_sample;
                        for (i, s) in reader.samples::<i32>().take(wanted).enumerate() {
                            let Ok(v) = s else { break };
                            if i % channels == ch {
                                self.buf[i / channels] = normalize_int(v, bits);
                            }
                        }
                    }
                    SampleFormat::Float => {
                        for (i, s) in reader.samples::<f32>().take(wanted).enumerate() {
                            let Ok(v) = s else { break };
                            if i % channels == ch {
                                self.buf[i / channels] = (v.clamp(-1.0, 1.0) * 32767.0) as i16;
                            }
                        }
                    }
                }
            }
            Source::Float64 { file, data_offset } => {
                let stride = channels as u64 * 8;
                if file
                    .seek(SeekFrom::Start(*data_offset + base * stride))
                    .is_err()
                {
                    return;
                }
                let mut raw = vec![0u8; wanted * 8];
                if file.read_exact(&mut raw).is_err() {
                    return;
                }
                for (i, sample) in raw.chunks_exact(8).enumerate() {
                    if i % channels == ch {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(sample);
                        let v = f64::from_le_bytes(b);
                        self.buf[i / channels] = (v.clamp(-1.0, 1.0) * 32767.0) as i16;
                    }
                }
            }
        }
        if !self.state.is_record_on {
            if let Some(flt) = self.filter.as_mut() {
                let mut fbuf: Vec<f32> =
                    self.buf.iter().map(|&s| f32::from(s) / 32768.0).collect();
                flt.apply(&mut fbuf);
                for (dst, &y) in self.buf.iter_mut().zip(&fbuf) {
                    *dst = (y * 32768.0).clamp(-32768.0, 32767.0) as i16;
                }
            }
        }
    }

    /// Patch the page's samples of the selected channel back into the
    /// file. Only frames inside the file are written; the file never
    /// grows.
    fn flush_page(&mut self) -> Result<(), TapeError> {
        if !self.buffer_dirty {
            return Ok(());
        }
        self.buffer_dirty = false;
        let Some(wb) = self.writer.as_mut() else {
            return Ok(());
        };
        let stride = u64::from(self.spec.channels) * 2;
        let frames = (self
            .state
            .tape_length
            .saturating_sub(self.page_frame)
            .min(PAGE_FRAMES)) as usize;
        let base = wb.data_offset + self.page_frame * stride + u64::from(self.channel) * 2;
        for (i, &s) in self.buf[..frames].iter().enumerate() {
            wb.file.seek(SeekFrom::Start(base + i as u64 * stride))?;
            wb.file.write_all(&s.to_le_bytes())?;
        }
        wb.file.flush()?;
        Ok(())
    }
}

impl Tape for WavTape {
    fn state(&self) -> &TapeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TapeState {
        &mut self.state
    }

    fn run_sample(&mut self) -> Result<(), TapeError> {
        let total = self.state.tape_length;
        let pos = self.state.tape_position;
        if pos >= total {
            self.state.output_state = 0;
            return Ok(());
        }
        let idx = (pos - self.page_frame) as usize;
        self.state.output_state = self.quantize(self.buf[idx]);
        if self.state.is_record_on {
            self.buf[idx] = self.requantize(self.state.input_state);
            self.buffer_dirty = true;
        }
        let new_pos = (pos + 1).min(total);
        if new_pos / PAGE_FRAMES == pos / PAGE_FRAMES {
            self.state.tape_position = new_pos;
            return Ok(());
        }
        let flush_result = self.flush_page();
        self.state.tape_position = new_pos;
        self.load_page();
        flush_result
    }

    fn record(&mut self) {
        self.state.is_playback_on = true;
        self.state.is_record_on = !self.state.is_read_only;
        if self.state.is_record_on && self.filter.is_some() {
            // The cached page holds filtered samples; recording must patch
            // against the raw data.
            self.load_page();
        }
    }

    fn set_is_motor_on(&mut self, on: bool) -> Result<(), TapeError> {
        self.state.is_motor_on = on;
        if on { Ok(()) } else { self.flush_page() }
    }

    fn stop(&mut self) -> Result<(), TapeError> {
        self.state.is_playback_on = false;
        self.state.is_record_on = false;
        self.flush_page()
    }

    fn seek(&mut self, seconds: f64) -> Result<(), TapeError> {
        let pos = if seconds > 0.0 {
            (seconds * f64::from(self.state.sample_rate) + 0.5) as u64
        } else {
            0
        };
        let flush_result = self.flush_page();
        self.state.tape_position = pos.min(self.state.tape_length);
        if let Some(f) = self.filter.as_mut() {
            f.reset();
        }
        self.load_page();
        flush_result
    }
}

impl Drop for WavTape {
    fn drop(&mut self) {
        // Best effort: callers that need the error call stop() first.
        let _ = self.flush_page();
    }
}

/// Scale an integer PCM sample of the given width to i16.
fn normalize_int(v: i32, bits: u16) -> i16 {
    if bits <= 16 {
        (v << (16 - bits)) as i16
    } else {
        (v >> (bits - 16)) as i16
    }
}

/// Open a 64-bit IEEE float WAV for direct frame reads, read-only.
fn open_float64(path: &Path) -> Result<(Source, WavSpec, u64), TapeError> {
    let mut file = File::open(path)?;
    let Some(fmt) = read_format_chunk(&mut file)? else {
        return Err(TapeError::NotRecognized);
    };
    if fmt.format_tag != WAVE_FORMAT_IEEE_FLOAT || fmt.bits_per_sample != 64 || fmt.channels == 0
    {
        return Err(TapeError::NotRecognized);
    }
    let Some((data_offset, data_size)) = find_chunk(&mut file, b"data")? else {
        return Err(TapeError::NotRecognized);
    };
    let spec = WavSpec {
        channels: fmt.channels,
        sample_rate: fmt.sample_rate,
        bits_per_sample: 64,
        sample_format: SampleFormat::Float,
    };
    let total = data_size / (u64::from(fmt.channels) * 8);
    Ok((Source::Float64 { file, data_offset }, spec, total))
}

struct RawFormat {
    format_tag: u16,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
}

fn read_format_chunk(file: &mut File) -> Result<Option<RawFormat>, TapeError> {
    let Some((offset, size)) = find_chunk(file, b"fmt ")? else {
        return Ok(None);
    };
    if size < 16 {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut raw = [0u8; 16];
    if file.read_exact(&mut raw).is_err() {
        return Ok(None);
    }
    Ok(Some(RawFormat {
        format_tag: u16::from_le_bytes([raw[0], raw[1]]),
        channels: u16::from_le_bytes([raw[2], raw[3]]),
        sample_rate: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        bits_per_sample: u16::from_le_bytes([raw[14], raw[15]]),
    }))
}

/// Locate a RIFF chunk; returns the payload offset and size.
fn find_chunk(file: &mut File, id: &[u8; 4]) -> Result<Option<(u64, u64)>, TapeError> {
    file.seek(SeekFrom::Start(0))?;
    let mut hdr = [0u8; 12];
    if file.read_exact(&mut hdr).is_err() || &hdr[0..4] != b"RIFF" || &hdr[8..12] != b"WAVE" {
        return Ok(None);
    }
    let mut pos = 12u64;
    loop {
        let mut chunk = [0u8; 8];
        if file.read_exact(&mut chunk).is_err() {
            return Ok(None);
        }
        pos += 8;
        let size = u64::from(u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]));
        if &chunk[0..4] == id {
            return Ok(Some((pos, size)));
        }
        // Chunks are word aligned.
        pos += size + (size & 1);
        file.seek(SeekFrom::Start(pos))?;
    }
}
