// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! Per-packet conditions (receive timeout, tag mismatch, rate limiting) are
//! silent drops and never surface as errors; this enum covers conditions that
//! abort an operation or degrade a subsystem.

use std::io;

/// Errors surfaced by the probe engine, responder, and analyzer.
#[derive(Debug)]
pub enum Error {
    /// Configuration failed validation; one entry per offending field.
    ConfigInvalid(Vec<String>),
    /// Neither `LATTICE_SECRET_HEX` nor `LATTICE_SECRET` is set.
    SecretMissing,
    /// The shared secret is malformed or shorter than the 16-byte minimum.
    SecretInvalid(String),
    /// Binding a probe or responder socket failed.
    BindFailed(String),
    /// A datagram send failed at the socket layer.
    SendFailed(String),
    /// The session log does not exist.
    LogMissing(String),
    /// A calibration pack could not be parsed or applied.
    CalibrationInvalid(String),
    /// A calibration task is already running on the background worker.
    CalibrationRunning,
    /// Fewer than three endpoints with coordinates and valid samples.
    InsufficientData,
    /// Underlying I/O error.
    Io(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ConfigInvalid(fields) => {
                write!(f, "invalid configuration: {}", fields.join("; "))
            }
            Error::SecretMissing => {
                write!(f, "no shared secret: set LATTICE_SECRET_HEX (hex) or LATTICE_SECRET (raw)")
            }
            Error::SecretInvalid(msg) => write!(f, "invalid shared secret: {}", msg),
            Error::BindFailed(msg) => write!(f, "bind failed: {}", msg),
            Error::SendFailed(msg) => write!(f, "send failed: {}", msg),
            Error::LogMissing(path) => write!(f, "log file not found: {}", path),
            Error::CalibrationInvalid(msg) => write!(f, "invalid calibration: {}", msg),
            Error::CalibrationRunning => write!(f, "a calibration task is already running"),
            Error::InsufficientData => {
                write!(f, "insufficient data: need >=3 endpoints with coordinates and samples")
            }
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for results using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
