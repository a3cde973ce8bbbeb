//! The scheduler: single owner of the device model.
//!
//! Many callers (one per in-flight filesystem operation) submit requests
//! concurrently; a single event-loop task serialises them against the
//! [`DeviceContext`] and answers each with the duration the caller must
//! observe. Reads and writes detour through the [`ReorderQueue`]; everything
//! else is answered in submission order.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::config::DeviceConfig;
use crate::device::DeviceContext;
use crate::queue::{Entry, ReorderQueue};
use crate::request::{Request, RequestType};
use crate::TRACING_TARGET;

/// The pop check is strict, so aim the wake-up slightly past the cutoff; a
/// timer armed exactly at it could never satisfy the check.
const WAKEUP_SLACK: Duration = Duration::from_millis(1);

/// Handle for submitting requests. Cheap to clone; the event loop runs until
/// every handle is gone.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<Entry>,
}

impl Scheduler {
    /// Spawn the event-loop task for `config`. Must be called from within a
    /// tokio runtime.
    pub fn new(config: DeviceConfig) -> Scheduler {
        let (tx, rx) = mpsc::channel(64);

        let event_loop = EventLoop {
            device: DeviceContext::new(config, Instant::now()),
            queue: ReorderQueue::new(),
            rx,
        };
        tokio::spawn(event_loop.run());

        Scheduler { tx }
    }

    /// Submit a request and wait for the duration the caller must observe
    /// before completing it.
    ///
    /// The duration is relative to the request's timestamp, so a caller that
    /// spent `elapsed` here (or doing the real I/O) still has
    /// `duration - elapsed` left to sleep.
    pub async fn schedule(&self, request: Request) -> Duration {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(Entry { request, response })
            .await
            .expect("scheduler event loop terminated");
        rx.await.expect("scheduler event loop terminated")
    }

    /// Like [`Scheduler::schedule`], callable from threads outside the
    /// runtime (the FUSE adapter's dispatch threads).
    pub fn schedule_blocking(&self, request: Request) -> Duration {
        let (response, rx) = oneshot::channel();
        self.tx
            .blocking_send(Entry { request, response })
            .expect("scheduler event loop terminated");
        rx.blocking_recv().expect("scheduler event loop terminated")
    }
}

struct EventLoop {
    device: DeviceContext,
    queue: ReorderQueue,
    rx: mpsc::Receiver<Entry>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            let wakeup = self.queue.next_cutoff(&self.device);

            tokio::select! {
                maybe_entry = self.rx.recv() => {
                    match maybe_entry {
                        Some(entry) => self.accept(entry),
                        None => break,
                    }
                }
                // Re-armed every iteration: executing any request moves
                // busy_until and the arm, which can change the head's
                // computed duration and therefore its cutoff.
                _ = sleep_until(wakeup.unwrap_or_else(Instant::now) + WAKEUP_SLACK),
                    if wakeup.is_some() => {}
            }

            self.drain_ready();
        }

        // Every handle is gone; nothing new can arrive to overtake what is
        // still queued, so answer it in queue order.
        while let Some(entry) = self.queue.pop_front() {
            self.respond(entry);
        }
    }

    fn accept(&mut self, entry: Entry) {
        match entry.request.ty {
            RequestType::Read | RequestType::Write => {
                self.queue.push(entry, &self.device);
            }
            _ => self.respond(entry),
        }
    }

    fn drain_ready(&mut self) {
        loop {
            let now = Instant::now();
            match self.queue.pop(now, &self.device) {
                Some(entry) => self.respond(entry),
                None => break,
            }
        }
    }

    /// Compute the request's duration against the current device state,
    /// commit it, and answer the caller.
    fn respond(&mut self, entry: Entry) {
        let duration = self.device.compute_time(&entry.request);
        self.device.execute(&entry.request);

        tracing::trace!(
            target: TRACING_TARGET,
            ty = ?entry.request.ty,
            path = %entry.request.path,
            start = entry.request.start,
            size = entry.request.size,
            ?duration,
            "execute",
        );

        // The caller may have given up waiting; that's its business.
        let _ = entry.response.send(duration);
    }
}
