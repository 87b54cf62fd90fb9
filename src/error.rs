// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Error taxonomy for the codec layer.
//!
//! Only genuine failures are errors. Protocol outcomes a caller is expected
//! to handle in its loop (no data yet, end-of-stream, resolution change,
//! corrupted frame) are reported through [`crate::codec::Status`] and
//! [`crate::codec::Output`] instead.

use std::{io, path::PathBuf};

use nix::errno::Errno;

use crate::fourcc::FourCC;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing argument: {0}")]
    NullArgument(&'static str),

    #[error("{op} failed: {errno}")]
    Ioctl { op: &'static str, errno: Errno },

    #[error("readiness wait failed: {0}")]
    Poll(Errno),

    #[error("unsupported format {requested}, driver selected {actual}")]
    UnsupportedFormat { requested: FourCC, actual: FourCC },

    #[error("geometry mismatch: requested {requested:?}, driver returned {actual:?}")]
    GeometryMismatch {
        requested: (u32, u32),
        actual: (u32, u32),
    },

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("buffer index {index} out of range ({count} buffers)")]
    InvalidIndex { index: u32, count: usize },

    #[error("buffer {0} is owned by the driver")]
    BufferQueued(u32),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("cannot open {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no codec backend named {0:?}")]
    UnknownBackend(String),
}

impl Error {
    pub(crate) fn ioctl(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| Error::Ioctl { op, errno }
    }

    /// Stable integer code so callers can branch without string inspection.
    ///
    /// - 1xx: arguments
    /// - 2xx: kernel calls and readiness waits
    /// - 3xx: formats
    /// - 4xx: memory
    /// - 5xx: buffer ownership and state
    /// - 6xx: device and I/O
    pub fn error_code(&self) -> u32 {
        match self {
            Self::NullArgument(_) => 100,
            Self::Ioctl { .. } => 200,
            Self::Poll(_) => 201,
            Self::UnsupportedFormat { .. } => 300,
            Self::GeometryMismatch { .. } => 301,
            Self::Allocation(_) => 400,
            Self::BufferTooSmall { .. } => 401,
            Self::InvalidIndex { .. } => 500,
            Self::BufferQueued(_) => 501,
            Self::InvalidState(_) => 502,
            Self::Open { .. } => 600,
            Self::Io(_) => 601,
            Self::UnknownBackend(_) => 602,
        }
    }

    /// Errno reported by the kernel, if this error came from an ioctl.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Ioctl { errno, .. } | Self::Poll(errno) => Some(*errno),
            _ => None,
        }
    }

    /// Setup failures after which no usable codec exists.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Open { .. } | Self::Allocation(_) | Self::UnsupportedFormat { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_error_carries_op_and_errno() {
        let err = Error::ioctl("VIDIOC_QBUF")(Errno::EINVAL);
        assert_eq!(err.error_code(), 200);
        assert_eq!(err.errno(), Some(Errno::EINVAL));
        assert!(err.to_string().contains("VIDIOC_QBUF"));
    }

    #[test]
    fn codes_are_distinct() {
        let errors = [
            Error::NullArgument("media"),
            Error::Ioctl {
                op: "VIDIOC_DQBUF",
                errno: Errno::EIO,
            },
            Error::Poll(Errno::EINTR),
            Error::UnsupportedFormat {
                requested: crate::fourcc::H264,
                actual: crate::fourcc::HEVC,
            },
            Error::Allocation("heap".to_string()),
        ];
        let mut codes: Vec<u32> = errors.iter().map(Error::error_code).collect();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::Allocation("cma".to_string()).is_fatal());
        assert!(!Error::BufferQueued(3).is_fatal());
    }
}
