// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::fmt;

/// Errors that can occur during mesh construction, setup, I/O, or raytracing.
#[derive(Debug)]
pub enum RaytraceError {
    /// An input array has the wrong length.
    WrongSize {
        /// What was being sized (e.g. "slowness field", "receiver table").
        what: &'static str,
        /// The expected length.
        expected: usize,
        /// The length provided.
        got: usize,
    },
    /// A source or receiver lies outside the mesh.
    OutOfGrid {
        /// "source" or "receiver".
        what: &'static str,
        /// The row index in the input table.
        index: usize,
        /// The offending coordinates.
        point: [f64; 3],
    },
    /// Requested solver is not one of fsm/spm/dspm.
    UnknownMethod(String),
    /// Two requested options cannot be combined.
    IncompatibleOptions(String),
    /// The fast sweeping solver did not meet its tolerance within the
    /// iteration limit. Reported as a warning; partial results are kept.
    ConvergenceFailure {
        /// Number of passes performed.
        passes: usize,
        /// Largest traveltime change during the last pass.
        residual: f64,
    },
    /// The backward gradient walk failed for one receiver.
    RaytraceFailure {
        /// The receiver row index.
        receiver: usize,
        /// Explanation of the failure.
        reason: String,
    },
    /// Explicit worker id is not below the configured pool size.
    ThreadOutOfRange {
        /// The requested worker id.
        thread_no: usize,
        /// The configured pool size.
        nthreads: usize,
    },
    /// The mesh arrays violate a structural invariant.
    InvalidMesh(String),
    /// Slowness value is not positive and finite.
    InvalidSlowness {
        /// The flat index of the invalid value.
        index: usize,
        /// The invalid value.
        value: f64,
    },
    /// A cooperative cancellation was requested during a dispatch.
    Cancelled {
        /// Number of events that had not completed.
        pending: usize,
    },
    /// Unsupported data type in file.
    UnsupportedDtype(String),
    /// Unsupported file format (unrecognized extension).
    UnsupportedFileFormat(String),
    /// I/O error occurred.
    IoError(std::io::Error),
    /// Other error with a descriptive message.
    Other(String),
}

impl fmt::Display for RaytraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaytraceError::WrongSize {
                what,
                expected,
                got,
            } => {
                write!(
                    f,
                    "wrong size for {}: expected {}, got {}",
                    what, expected, got
                )
            }
            RaytraceError::OutOfGrid { what, index, point } => {
                write!(
                    f,
                    "{} {} at ({}, {}, {}) is outside the mesh",
                    what, index, point[0], point[1], point[2]
                )
            }
            RaytraceError::UnknownMethod(name) => {
                write!(f, "unknown method '{}' (expected fsm, spm or dspm)", name)
            }
            RaytraceError::IncompatibleOptions(reason) => {
                write!(f, "incompatible options: {}", reason)
            }
            RaytraceError::ConvergenceFailure { passes, residual } => {
                write!(
                    f,
                    "fast sweeping did not converge after {} passes (residual {:e})",
                    passes, residual
                )
            }
            RaytraceError::RaytraceFailure { receiver, reason } => {
                write!(f, "raytracing failed for receiver {}: {}", receiver, reason)
            }
            RaytraceError::ThreadOutOfRange {
                thread_no,
                nthreads,
            } => {
                write!(
                    f,
                    "thread_no {} out of range (pool size {})",
                    thread_no, nthreads
                )
            }
            RaytraceError::InvalidMesh(reason) => write!(f, "invalid mesh: {}", reason),
            RaytraceError::InvalidSlowness { index, value } => {
                write!(
                    f,
                    "invalid slowness at index {}: {} (must be positive and finite)",
                    index, value
                )
            }
            RaytraceError::Cancelled { pending } => {
                write!(f, "dispatch cancelled with {} pending events", pending)
            }
            RaytraceError::UnsupportedDtype(dtype) => write!(f, "unsupported dtype: {}", dtype),
            RaytraceError::UnsupportedFileFormat(ext) => {
                write!(f, "unsupported file format: {}", ext)
            }
            RaytraceError::IoError(e) => write!(f, "I/O error: {}", e),
            RaytraceError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RaytraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RaytraceError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RaytraceError {
    fn from(e: std::io::Error) -> Self {
        RaytraceError::IoError(e)
    }
}

/// Convenience type alias for Results with RaytraceError.
pub type Result<T> = std::result::Result<T, RaytraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_wrong_size() {
        let e = RaytraceError::WrongSize {
            what: "slowness field",
            expected: 24,
            got: 10,
        };
        assert_eq!(
            e.to_string(),
            "wrong size for slowness field: expected 24, got 10"
        );
    }

    #[test]
    fn display_out_of_grid() {
        let e = RaytraceError::OutOfGrid {
            what: "source",
            index: 2,
            point: [2.0, 0.0, 0.0],
        };
        assert_eq!(e.to_string(), "source 2 at (2, 0, 0) is outside the mesh");
    }

    #[test]
    fn display_unknown_method() {
        let e = RaytraceError::UnknownMethod("fdm".to_string());
        assert_eq!(
            e.to_string(),
            "unknown method 'fdm' (expected fsm, spm or dspm)"
        );
    }

    #[test]
    fn display_thread_out_of_range() {
        let e = RaytraceError::ThreadOutOfRange {
            thread_no: 4,
            nthreads: 4,
        };
        assert_eq!(e.to_string(), "thread_no 4 out of range (pool size 4)");
    }

    #[test]
    fn display_invalid_slowness() {
        let e = RaytraceError::InvalidSlowness {
            index: 5,
            value: -0.5,
        };
        assert_eq!(
            e.to_string(),
            "invalid slowness at index 5: -0.5 (must be positive and finite)"
        );
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let e: RaytraceError = io_err.into();
        assert!(matches!(e, RaytraceError::IoError(_)));
        assert!(e.to_string().contains("test"));
    }

    #[test]
    fn display_cancelled() {
        let e = RaytraceError::Cancelled { pending: 3 };
        assert_eq!(e.to_string(), "dispatch cancelled with 3 pending events");
    }
}
