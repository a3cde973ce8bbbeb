//! The serial device model.
//!
//! [`DeviceContext`] is, conceptually, the physical medium after any
//! reordering has been applied: it can run one request at a time, it has an
//! arm position (tracked as the first byte past the last sequential access),
//! and it is busy until its last accepted request finishes. Computing a
//! request's duration is pure; executing it commits the request against the
//! device state.

use std::time::Duration;

use tokio::time::Instant;

use crate::cache::WriteBackCache;
use crate::config::{DeviceConfig, FsyncStrategy, WriteStrategy};
use crate::request::{Request, RequestType};

pub(crate) struct DeviceContext {
    config: DeviceConfig,

    /// For the last accessed file, the offset of the first byte we have not
    /// accessed. Used to decide whether an access is sequential.
    first_unseen_byte: u64,

    /// Accesses to a different file are never sequential. `None` once the
    /// tracked file is closed.
    last_accessed_file: Option<String>,

    /// The device runs one request at a time; it is occupied until here.
    busy_until: Instant,

    /// Present iff the profile models a write-back cache.
    write_back_cache: Option<WriteBackCache>,
}

impl DeviceContext {
    pub(crate) fn new(config: DeviceConfig, now: Instant) -> DeviceContext {
        let write_back_cache = match config.fsync_strategy {
            FsyncStrategy::WriteBackCached => Some(WriteBackCache::new(config.clone())),
            _ => None,
        };

        DeviceContext {
            config,
            first_unseen_byte: 0,
            last_accessed_file: None,
            busy_until: now,
            write_back_cache,
        }
    }

    pub(crate) fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// How long `req` would take if it ran next, including any residual busy
    /// time it has to absorb. Does not change the device state.
    pub(crate) fn compute_time(&self, req: &Request) -> Duration {
        let base = match req.ty {
            RequestType::Metadata | RequestType::Open | RequestType::Close => {
                self.config.metadata_op_time
            }
            RequestType::Allocate => self.seek_time_for(req) + self.config.allocate_time(req.size),
            RequestType::Read => self.seek_time_for(req) + self.config.read_time(req.size),
            RequestType::Write => match self.config.write_strategy {
                WriteStrategy::Fast => Duration::ZERO,
                WriteStrategy::Simulate => {
                    self.seek_time_for(req) + self.config.write_time(req.size)
                }
            },
            RequestType::Fsync => match self.config.fsync_strategy {
                FsyncStrategy::None => Duration::ZERO,
                FsyncStrategy::Dumb => self.config.seek_time * 10,
                FsyncStrategy::WriteBackCached => {
                    let pending = self
                        .write_back_cache
                        .as_ref()
                        .map_or(0, |cache| cache.unwritten_bytes(&req.path));
                    self.config.seek_time + self.config.write_time(pending)
                }
            },
        };

        // A request queued while the device is busy absorbs the residual
        // busy time; one arriving after busy_until starts immediately.
        self.busy_until.max(req.timestamp) + base - req.timestamp
    }

    /// Commit `req` against the device state.
    pub(crate) fn execute(&mut self, req: &Request) {
        // The gap since the last request finished is idle device time; grant
        // it to the write-back cache.
        let spare_time = req.timestamp.duration_since(self.busy_until);
        if !spare_time.is_zero() {
            if let Some(cache) = &mut self.write_back_cache {
                cache.write_back(spare_time);
            }
        }

        self.busy_until = req.timestamp + self.compute_time(req);

        match req.ty {
            RequestType::Metadata | RequestType::Open | RequestType::Allocate => {}
            RequestType::Close => {
                if let Some(cache) = &mut self.write_back_cache {
                    cache.close(&req.path);
                }
                if self.last_accessed_file.as_deref() == Some(req.path.as_str()) {
                    self.last_accessed_file = None;
                    self.first_unseen_byte = 0;
                }
            }
            RequestType::Read => {
                self.last_accessed_file = Some(req.path.clone());
                self.first_unseen_byte = req.start + req.size;
            }
            RequestType::Write => {
                match self.config.write_strategy {
                    // Fast writes don't consume the arm.
                    WriteStrategy::Fast => {}
                    WriteStrategy::Simulate => {
                        self.last_accessed_file = Some(req.path.clone());
                        self.first_unseen_byte = req.start + req.size;
                    }
                }

                if let Some(cache) = &mut self.write_back_cache {
                    cache.write(&req.path, req.size);
                }
            }
            RequestType::Fsync => {
                if let Some(cache) = &mut self.write_back_cache {
                    cache.write_back_file(&req.path);
                }
            }
        }
    }

    /// Whether `req` pays a seek: it does when it touches a different file
    /// than the last access, goes backwards, or jumps forward past the seek
    /// window.
    fn seek_time_for(&self, req: &Request) -> Duration {
        let same_file = self.last_accessed_file.as_deref() == Some(req.path.as_str());
        if !same_file
            || self.first_unseen_byte > req.start
            || req.start - self.first_unseen_byte >= self.config.seek_window
        {
            return self.config.seek_time;
        }
        Duration::ZERO
    }

    #[cfg(test)]
    pub(crate) fn unwritten_bytes(&self, path: &str) -> u64 {
        self.write_back_cache
            .as_ref()
            .map_or(0, |cache| cache.unwritten_bytes(path))
    }
}
