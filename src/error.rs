//! Error types surfaced by the translation layer and its flash collaborator.

use std::io;

use deku::DekuError;
use thiserror::Error;

/// Failures reported by a [`Vfl`](crate::vfl::Vfl) implementation for a single operation
#[derive(Error, Debug)]
pub enum VflError {
    #[error("uncorrectable read at page {0}")]
    Uncorrectable(u32),

    #[error("program failed at page {0}")]
    ProgramFailed(u32),

    #[error("erase failed on block {0}")]
    EraseFailed(u32),

    #[error("page {0} programmed out of order")]
    OutOfOrder(u32),

    #[error("page {0} is beyond the end of the medium")]
    OutOfRange(u32),

    #[error("buffer is not page-sized")]
    BadBuffer,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reasons a checkpoint could not be used. None of these fail an open; they all fall back to a
/// full scan of the medium.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum CheckpointError {
    #[error("no checkpoint present")]
    NotFound,

    #[error("checkpoint superseded by later writes")]
    Stale,

    #[error("unsupported checkpoint version {0:02x?}")]
    UnsupportedVersion([u8; 4]),

    #[error("checkpoint page {0} is unreadable or corrupt")]
    Corrupt(u32),

    #[error("checkpoint was written for a different geometry ({0})")]
    GeometryMismatch(&'static str),
}

/// Violations of the mapping invariants. These are never repaired.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum ConsistencyError {
    #[error("page {page} holds logical page {found:#x}, expected {expected:#x}")]
    LpnMismatch { page: u32, expected: u32, found: u32 },

    #[error("page {0} has the wrong page type")]
    WrongPageType(u32),

    #[error("valid page count of block {0} would go negative")]
    ValidCountUnderflow(u32),

    #[error("logical page {0:#x} would have two live mappings")]
    DoubleMapping(u32),

    #[error("block {block} still has {valid} valid pages after reclaim")]
    ValidCountLeft { block: u32, valid: u32 },
}

#[derive(Error, Debug)]
pub enum FtlError {
    #[error("request {lpn}+{count} exceeds {total} logical pages")]
    OutOfRange { lpn: u32, count: u32, total: u32 },

    #[error("buffer holds {have} bytes, request needs {need}")]
    BufferSize { have: usize, need: usize },

    #[error("unsupported geometry: {0}")]
    Geometry(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Media(#[from] VflError),

    #[error("no free blocks left")]
    Capacity,

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error("checkpoint unusable: {0}")]
    Recovery(#[from] CheckpointError),

    #[error("out of memory allocating restore scratch space")]
    OutOfMemory,

    #[error("metadata encoding failed: {0}")]
    Codec(#[from] DekuError),
}

impl FtlError {
    /// Does this error leave the instance unusable?
    ///
    /// Argument errors reject a request before any state is touched, a media error means one
    /// request could not be served, and a checkpoint error only ever selects the restore path.
    /// Everything else means the in-memory state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::OutOfRange { .. } | Self::BufferSize { .. } | Self::Media(_) | Self::Recovery(_)
        )
    }
}

#[test]
fn test_fatal_classification() {
    let arg = FtlError::OutOfRange {
        lpn: 10,
        count: 2,
        total: 11,
    };
    assert!(!arg.is_fatal());
    assert!(!FtlError::from(CheckpointError::Stale).is_fatal());
    assert!(FtlError::Capacity.is_fatal());
    assert!(FtlError::from(ConsistencyError::ValidCountUnderflow(3)).is_fatal());
    assert!(!FtlError::from(VflError::Uncorrectable(7)).is_fatal());
    assert!(FtlError::OutOfMemory.is_fatal());
}
