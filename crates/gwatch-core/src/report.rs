//! Event report loop: drains one trace and forwards archived events.
//!
//! Each archived event becomes a `TsWrite` on the capsule channel addressed
//! to `/capsule/{capsule_id}/{domain}event`, indexed by the event id.
//! Events popped before they are archived wait in a local staging queue.

use crate::event::{ArchivedEvent, EventDomain, EventId, TICK_BEGIN, TICK_END, now_ticks};
use crate::trace::EventTrace;
use crate::{Error, Result};
use gwatch_codec::CapsuleEnvelope;
use gwatch_codec::payload::TsWrite;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Device-wide synchronization used when GPU events are still pending at
/// shutdown. `Err` carries the device error code.
pub trait DeviceSync: Send + Sync {
    fn synchronize(&self) -> std::result::Result<(), i64>;
}

/// No attached device; synchronization always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevice;

impl DeviceSync for NoDevice {
    fn synchronize(&self) -> std::result::Result<(), i64> {
        Ok(())
    }
}

/// Destination for report envelopes.
pub trait ReportSink: Send + Sync {
    fn report(&self, envelope: &CapsuleEnvelope) -> Result<()>;
}

/// Report URI for events of `domain`.
#[must_use]
pub fn report_uri(capsule_id: &str, domain: EventDomain) -> String {
    format!("/capsule/{capsule_id}/{}event", domain.name())
}

/// Wrap an archived event in the capsule-channel write that reports it.
pub fn report_envelope(capsule_id: &str, event: &ArchivedEvent) -> CapsuleEnvelope {
    let timestamp = now_ticks();
    CapsuleEnvelope::new(
        event.global_id(),
        TsWrite {
            uri: report_uri(capsule_id, event.domain()),
            index: event.id(),
            timestamp: event.tick(TICK_BEGIN).unwrap_or(timestamp),
            end_timestamp: event.tick(TICK_END).unwrap_or(timestamp),
            payload: event.to_json(),
        },
    )
}

/// Counters returned when a loop finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReportStats {
    pub reported: u64,
    pub send_failures: u64,
    pub forced: u64,
    pub dropped: u64,
}

impl std::ops::AddAssign for ReportStats {
    fn add_assign(&mut self, other: Self) {
        self.reported += other.reported;
        self.send_failures += other.send_failures;
        self.forced += other.forced;
        self.dropped += other.dropped;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Reported,
    Staged,
    Idle,
    Finished,
}

pub struct ReportLoop {
    capsule_id: String,
    trace: Arc<EventTrace>,
    sink: Arc<dyn ReportSink>,
    device: Arc<dyn DeviceSync>,
    stop: Arc<AtomicBool>,
    idle_backoff: Duration,
    grace: Duration,
    staging: VecDeque<EventId>,
    deadline: Option<Instant>,
    device_synced: bool,
    stats: ReportStats,
}

impl ReportLoop {
    pub fn new(
        capsule_id: impl Into<String>,
        trace: Arc<EventTrace>,
        sink: Arc<dyn ReportSink>,
        device: Arc<dyn DeviceSync>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            capsule_id: capsule_id.into(),
            trace,
            sink,
            device,
            stop,
            idle_backoff: Duration::from_micros(200),
            grace: Duration::from_millis(2000),
            staging: VecDeque::new(),
            deadline: None,
            device_synced: false,
            stats: ReportStats::default(),
        }
    }

    #[must_use]
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run on a dedicated OS thread.
    pub fn spawn(self) -> Result<std::thread::JoinHandle<ReportStats>> {
        let name = format!("gw-report-{}", self.trace.name());
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(Error::from)
    }

    pub fn run(mut self) -> ReportStats {
        loop {
            match self.step() {
                Step::Reported | Step::Staged => {}
                Step::Idle => std::thread::sleep(self.idle_backoff),
                Step::Finished => break,
            }
        }
        tracing::debug!(trace = %self.trace.name(), stats = ?self.stats, "report loop finished");
        self.stats
    }

    fn step(&mut self) -> Step {
        let stopping = self.stop.load(Ordering::Acquire);
        if stopping {
            let deadline = *self.deadline.get_or_insert_with(|| Instant::now() + self.grace);
            if self.staging.is_empty() && self.trace.is_empty() {
                return Step::Finished;
            }
            if Instant::now() >= deadline {
                self.expire();
                return Step::Finished;
            }
            self.sync_device_if_gpu_pending();
        }

        if let Some(id) = self.staging.pop_front() {
            if self.trace.is_archived(id) {
                self.emit(id);
                return Step::Reported;
            }
            self.staging.push_back(id);
        }

        match self.trace.pop() {
            Some(id) if self.trace.is_archived(id) => {
                self.emit(id);
                Step::Reported
            }
            Some(id) => {
                self.staging.push_back(id);
                Step::Staged
            }
            None => Step::Idle,
        }
    }

    /// When the oldest staged event is GPU work, synchronize the device once.
    /// A device error completes every staged GPU event with that code.
    fn sync_device_if_gpu_pending(&mut self) {
        if self.device_synced {
            return;
        }
        let Some(&front) = self.staging.front() else {
            return;
        };
        if self.trace.domain_of(front) != Some(EventDomain::Gpu) || self.trace.is_archived(front) {
            return;
        }
        self.device_synced = true;
        if let Err(code) = self.device.synchronize() {
            tracing::warn!(
                trace = %self.trace.name(),
                code,
                "device synchronize failed at shutdown"
            );
            let gpu_ids: Vec<EventId> = self
                .staging
                .iter()
                .copied()
                .filter(|id| self.trace.domain_of(*id) == Some(EventDomain::Gpu))
                .collect();
            for id in gpu_ids {
                if self.trace.force_complete(id, code).is_ok() {
                    self.stats.forced += 1;
                }
            }
        }
    }

    /// Grace period over: report what can be completed, drop the rest.
    fn expire(&mut self) {
        while let Some(id) = self.trace.pop() {
            self.staging.push_back(id);
        }
        let mut dropped = 0;
        while let Some(id) = self.staging.pop_front() {
            if !self.trace.is_archived(id) {
                if self.trace.domain_of(id) == Some(EventDomain::Gpu)
                    && self.trace.force_complete(id, 0).is_ok()
                {
                    self.stats.forced += 1;
                } else {
                    self.trace.retire(id);
                    dropped += 1;
                    continue;
                }
            }
            self.emit(id);
        }
        if dropped > 0 {
            self.stats.dropped += dropped;
            metrics::counter!("capsule.report.dropped").increment(dropped);
            tracing::warn!(
                trace = %self.trace.name(),
                dropped,
                "shutdown grace expired, unarchived events dropped"
            );
        }
    }

    fn emit(&mut self, id: EventId) {
        let Some(event) = self.trace.archived(id) else {
            return;
        };
        let envelope = report_envelope(&self.capsule_id, &event);
        match self.sink.report(&envelope) {
            Ok(()) => self.stats.reported += 1,
            Err(err) => {
                self.stats.send_failures += 1;
                metrics::counter!("capsule.report.send_failures").increment(1);
                tracing::warn!(
                    trace = %self.trace.name(),
                    event_id = id,
                    error = %err,
                    "failed to report event"
                );
            }
        }
        self.trace.retire(id);
    }
}
