//! Request values submitted to the scheduler.

use tokio::time::Instant;

/// What kind of filesystem operation a request describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Read,
    Write,
    Open,
    Close,
    Fsync,
    Metadata,
    Allocate,
}

/// A single timed filesystem operation.
///
/// The adapter fills in the fields that apply to the operation: reads,
/// writes and allocations carry a byte range, fsync and close carry only a
/// path, and pure metadata operations carry neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub ty: RequestType,

    /// When the operation was submitted. Durations are reported relative to
    /// this, so a request that waits in the reorder queue still charges the
    /// caller from the moment it arrived.
    pub timestamp: Instant,

    /// The file being accessed; empty for pure metadata operations.
    pub path: String,

    /// Byte offset of the access.
    pub start: u64,

    /// Byte count of the access.
    pub size: u64,
}

impl Request {
    pub fn read(path: impl Into<String>, start: u64, size: u64, timestamp: Instant) -> Request {
        Request {
            ty: RequestType::Read,
            timestamp,
            path: path.into(),
            start,
            size,
        }
    }

    pub fn write(path: impl Into<String>, start: u64, size: u64, timestamp: Instant) -> Request {
        Request {
            ty: RequestType::Write,
            timestamp,
            path: path.into(),
            start,
            size,
        }
    }

    pub fn allocate(
        path: impl Into<String>,
        start: u64,
        size: u64,
        timestamp: Instant,
    ) -> Request {
        Request {
            ty: RequestType::Allocate,
            timestamp,
            path: path.into(),
            start,
            size,
        }
    }

    pub fn open(path: impl Into<String>, timestamp: Instant) -> Request {
        Request {
            ty: RequestType::Open,
            timestamp,
            path: path.into(),
            start: 0,
            size: 0,
        }
    }

    pub fn close(path: impl Into<String>, timestamp: Instant) -> Request {
        Request {
            ty: RequestType::Close,
            timestamp,
            path: path.into(),
            start: 0,
            size: 0,
        }
    }

    pub fn fsync(path: impl Into<String>, timestamp: Instant) -> Request {
        Request {
            ty: RequestType::Fsync,
            timestamp,
            path: path.into(),
            start: 0,
            size: 0,
        }
    }

    pub fn metadata(timestamp: Instant) -> Request {
        Request {
            ty: RequestType::Metadata,
            timestamp,
            path: String::new(),
            start: 0,
            size: 0,
        }
    }
}
