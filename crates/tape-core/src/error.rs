//! Error type shared by all tape drivers.

use std::fmt;
use std::io;

/// Errors raised by tape drivers and the format-detection factory.
#[derive(Debug)]
pub enum TapeError {
    /// A constructor argument was out of range (sample rate, bit depth,
    /// channel index).
    InvalidParameter(&'static str),
    /// The file's header did not match this driver's format. Used by the
    /// factory to try the next format; never surfaced to callers.
    NotRecognized,
    /// An open/seek/read/write failure, including disk full on a deferred
    /// page flush.
    Io(io::Error),
    /// The file matched a format but carried invalid structure (bad cue
    /// table, impossible chunk ranges).
    CorruptData(String),
}

impl fmt::Display for TapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter(what) => write!(f, "invalid parameter: {what}"),
            Self::NotRecognized => write!(f, "file format not recognized"),
            Self::Io(e) => write!(f, "tape file I/O error: {e}"),
            Self::CorruptData(what) => write!(f, "corrupt tape data: {what}"),
        }
    }
}

impl std::error::Error for TapeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TapeError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_source_is_preserved() {
        let e = TapeError::from(io::Error::new(io::ErrorKind::WriteZero, "disk full"));
        assert!(matches!(e, TapeError::Io(_)));
        assert!(std::error::Error::source(&e).is_some());
        assert!(e.to_string().contains("disk full"));
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            TapeError::InvalidParameter("tape sample rate").to_string(),
            "invalid parameter: tape sample rate"
        );
        assert_eq!(
            TapeError::NotRecognized.to_string(),
            "file format not recognized"
        );
    }
}
