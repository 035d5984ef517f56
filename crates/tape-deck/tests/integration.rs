//! End-to-end tests of format detection and the recording round trip.

use std::path::PathBuf;

use tape_deck::{OpenMode, TapeError, open_tape_file};

fn path_in(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[test]
fn create_record_and_reopen_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = path_in(&dir, "session.tape");
    let pattern = |i: u64| u8::from((i / 4) % 2 == 0);

    {
        let mut tape = open_tape_file(&path, OpenMode::Create, 24_000, 1).expect("create");
        assert!(!tape.is_read_only());
        tape.record();
        tape.set_is_motor_on(true).expect("motor");
        for i in 0..5000 {
            tape.set_input_signal(pattern(i));
            tape.run_one_sample().expect("tick");
        }
        tape.stop().expect("flush");
    }

    let mut tape = open_tape_file(&path, OpenMode::ReadWrite, 24_000, 1).expect("reopen");
    assert!(!tape.is_read_only());
    assert_eq!(tape.state().tape_length, 5000, "length survives reopen");
    assert_eq!(tape.sample_rate(), 24_000);
    assert_eq!(tape.sample_size(), 1);
    tape.play();
    tape.set_is_motor_on(true).expect("motor");
    for i in 0..5000 {
        tape.run_one_sample().expect("tick");
        assert_eq!(tape.output_signal(), pattern(i), "sample {i}");
    }
    assert!(tape.is_end_of_tape());
}

#[test]
fn detects_pulse_archive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = path_in(&dir, "image.tzx");
    let mut raw = b"ZXTape!\x1a\x01\x14".to_vec();
    // Pure tone: 3500 T-states (24 samples), 4 pulses.
    raw.extend_from_slice(&[0x12, 0xAC, 0x0D, 0x04, 0x00]);
    std::fs::write(&path, raw).expect("write");

    let mut tape = open_tape_file(&path, OpenMode::ReadWrite, 24_000, 1).expect("open");
    assert!(tape.is_read_only(), "pulse archives never record");
    assert_eq!(tape.sample_rate(), 24_000);
    tape.play();
    tape.set_is_motor_on(true).expect("motor");
    let mut levels = Vec::new();
    for _ in 0..120 {
        tape.run_one_sample().expect("tick");
        levels.push(tape.output_signal());
    }
    let transitions = levels.windows(2).filter(|w| w[0] != w[1]).count();
    assert_eq!(transitions, 3, "four tone pulses");
    assert!(tape.is_end_of_tape());
}

#[test]
fn detects_headerless_tap_by_checksum() {
    let dir = tempfile::tempdir().expect("tempdir");

    // A standard 19-byte header record whose bytes XOR to zero.
    let mut body = vec![0x00u8, 0x03];
    body.extend_from_slice(b"data      ");
    body.extend_from_slice(&[0x10, 0x00, 0x00, 0x00, 0x00, 0x00]);
    let checksum = body.iter().fold(0u8, |x, &b| x ^ b);
    body.push(checksum);
    let mut rec = vec![0x13, 0x00];
    rec.extend_from_slice(&body);

    let good = path_in(&dir, "good.tap");
    std::fs::write(&good, &rec).expect("write");
    let tape = open_tape_file(&good, OpenMode::ReadWrite, 24_000, 1).expect("open");
    assert!(tape.is_read_only(), "recognized as a pulse archive");

    // Break the checksum: no probe matches and the native driver takes the
    // bytes as headerless raw samples, read-write.
    rec[10] ^= 0x55;
    let bad = path_in(&dir, "bad.tap");
    std::fs::write(&bad, &rec).expect("write");
    let tape = open_tape_file(&bad, OpenMode::ReadWrite, 24_000, 1).expect("open");
    assert!(!tape.is_read_only());
    assert_eq!(
        tape.state().tape_length,
        rec.len() as u64 * 8,
        "raw fallback is one bit per sample"
    );
}

#[test]
fn detects_legacy_chunked_image() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = path_in(&dir, "legacy.ept");
    let data = [0x55u8, 0xAA, 0x0F];
    let mut raw = vec![0u8; 512];
    raw[0..4].copy_from_slice(&0u32.to_le_bytes());
    raw[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
    raw[128..160].copy_from_slice(b"ENTERPRISE 128K TAPE FILE       ");
    raw.extend_from_slice(&data);
    std::fs::write(&path, raw).expect("write");

    let tape = open_tape_file(&path, OpenMode::ReadWrite, 24_000, 1).expect("open");
    assert!(tape.is_read_only());
    assert_eq!(tape.state().tape_length, data.len() as u64 * 80);
}

#[test]
fn detects_sound_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = path_in(&dir, "audio.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
    for i in 0..2000i32 {
        writer
            .write_sample(((i % 100) * 600 - 30_000) as i16)
            .expect("write sample");
    }
    writer.finalize().expect("finalize");

    let tape = open_tape_file(&path, OpenMode::ReadWrite, 24_000, 8).expect("open");
    assert_eq!(tape.sample_rate(), 44_100, "the WAV spec wins");
    assert_eq!(tape.sample_size(), 16);
    assert!(!tape.is_read_only(), "16-bit PCM records in place");
    assert_eq!(tape.state().tape_length, 2000);
}

#[test]
fn missing_path_creates_a_native_tape() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = path_in(&dir, "fresh.tape");
    let tape = open_tape_file(&path, OpenMode::ReadWrite, 48_000, 2).expect("create");
    assert!(!tape.is_read_only());
    assert_eq!(tape.sample_rate(), 48_000);
    assert_eq!(tape.sample_size(), 2);
    drop(tape);
    let meta = std::fs::metadata(&path).expect("file exists");
    assert_eq!(meta.len(), 4096, "header only, no samples yet");
}

#[test]
fn missing_path_read_only_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = path_in(&dir, "nope.tape");
    assert!(matches!(
        open_tape_file(&path, OpenMode::ReadOnly, 24_000, 1),
        Err(TapeError::Io(_))
    ));
}
