//! Read/write reorder queue.
//!
//! Reads and writes sit here briefly before they hit the device, so that a
//! request arriving slightly later can slot in ahead of earlier ones when
//! that forms (or extends) a sequential run on the same file. How far back a
//! newcomer may jump is bounded by the profile's `request_reorder_max_delay`.

use std::time::Duration;

use tokio::time::Instant;

use crate::device::DeviceContext;
use crate::request::Request;

/// A queued request together with the channel its duration goes out on.
pub(crate) struct Entry {
    pub(crate) request: Request,
    pub(crate) response: tokio::sync::oneshot::Sender<Duration>,
}

/// An ordered sequence of pending reads and writes. Typical length is
/// bounded by the reorder delay times the request rate, so a vector with
/// linear scans is plenty.
pub(crate) struct ReorderQueue {
    entries: Vec<Entry>,
}

impl ReorderQueue {
    pub(crate) fn new() -> ReorderQueue {
        ReorderQueue {
            entries: Vec::with_capacity(16),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a request, possibly ahead of queued ones.
    ///
    /// Scanning from the tail, each queued request on the same path offers a
    /// slot: after it, if the newcomer starts at or past its end; before it,
    /// if the newcomer ends at or before its start. The slot with the
    /// smallest byte gap wins. The scan stops at the first request too old
    /// to be overtaken; nothing at or before it can have the newcomer placed
    /// in front.
    pub(crate) fn push(&mut self, entry: Entry, device: &DeviceContext) {
        let max_delay = device.config().request_reorder_max_delay;
        let req = &entry.request;
        let req_end = req.start + req.size;

        let mut best_diff = u64::MAX;
        let mut best_idx = self.entries.len();

        for i in (0..self.entries.len()).rev() {
            let other = &self.entries[i].request;
            let other_end = other.start + other.size;

            if other.path == req.path && req.start >= other_end {
                let diff = req.start - other_end;
                if diff < best_diff {
                    best_diff = diff;
                    best_idx = i + 1;
                }
            }

            if req.timestamp > other.timestamp + max_delay {
                break;
            }

            if other.path == req.path && req_end <= other.start {
                let diff = other.start - req_end;
                if diff < best_diff {
                    best_diff = diff;
                    best_idx = i;
                }
            }
        }

        self.entries.insert(best_idx, entry);
    }

    /// Remove and return the head, provided its cutoff has passed.
    pub(crate) fn pop(&mut self, now: Instant, device: &DeviceContext) -> Option<Entry> {
        if !self.ready(now, device) {
            return None;
        }
        Some(self.entries.remove(0))
    }

    /// Remove and return the head regardless of its cutoff. Used when the
    /// scheduler shuts down and nothing new can arrive to overtake it.
    pub(crate) fn pop_front(&mut self) -> Option<Entry> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries.remove(0))
    }

    /// The head's cutoff, if there is a head. The scheduler arms its wake-up
    /// timer from this after every event, since executing any request can
    /// change the head's computed duration and therefore its cutoff.
    pub(crate) fn next_cutoff(&self, device: &DeviceContext) -> Option<Instant> {
        self.entries
            .first()
            .map(|entry| cutoff_time(&entry.request, device))
    }

    fn ready(&self, now: Instant, device: &DeviceContext) -> bool {
        match self.entries.first() {
            Some(entry) => now > cutoff_time(&entry.request, device),
            None => false,
        }
    }
}

/// The earliest moment a request may leave the queue: halfway into the time
/// it would currently take. Waiting half the duration gives still-arriving
/// requests a chance to overtake, while bounding how long the head can be
/// held up.
fn cutoff_time(req: &Request, device: &DeviceContext) -> Instant {
    req.timestamp + device.compute_time(req) / 2
}
