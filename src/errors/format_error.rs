//! Error types for weight file decoding.

use thiserror::Error;

/// Errors raised while reading or writing `.npy` weight files.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Not an NPY file: bad magic string")]
    BadMagic,

    #[error("Unsupported NPY format version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("Malformed NPY header: {reason}")]
    MalformedHeader { reason: String },

    #[error("Unsupported element type '{descr}': only little-endian f32 ('<f4') is accepted")]
    UnsupportedDtype { descr: String },

    #[error("Expected a 2-dimensional array, found rank {rank}")]
    UnsupportedRank { rank: usize },

    #[error("Fortran-ordered arrays are not supported")]
    FortranOrder,

    #[error("Payload holds {actual} bytes but shape ({rows}, {cols}) needs {expected}")]
    PayloadSizeMismatch {
        rows: usize,
        cols: usize,
        expected: usize,
        actual: usize,
    },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
