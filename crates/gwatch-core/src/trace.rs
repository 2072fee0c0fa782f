//! Per-thread event traces.
//!
//! An [`EventTrace`] owns every event pushed into it in an arena keyed by
//! [`EventId`]. The bounded queue only carries ids, so the report loop and
//! the producing thread never share ownership of an event. Parent and
//! related links are id/global-id lookups, never references.

use crate::event::{ArchivedEvent, Event, EventDomain, EventId, TICK_BEGIN, TICK_END};
use crate::{Error, Result};
use crossbeam::queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Metadata key stamped on events completed without their producer.
pub const META_RETURN_CODE: &str = "return code";

enum Slot {
    Pending(Event),
    Archived(Arc<ArchivedEvent>),
}

/// Bounded event queue plus the `(domain, thread)` parent stacks of one
/// traced thread.
pub struct EventTrace {
    name: RwLock<String>,
    queue: ArrayQueue<EventId>,
    slots: Mutex<HashMap<EventId, Slot>>,
    parents: Mutex<HashMap<(EventDomain, u64), Vec<EventId>>>,
    next_id: AtomicU64,
    locked: AtomicBool,
}

impl std::fmt::Debug for EventTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTrace")
            .field("name", &*self.name.read())
            .field("queued", &self.queue.len())
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

impl EventTrace {
    /// # Panics
    /// Panics when `capacity == 0`; config validation rejects that value.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: RwLock::new(name.into()),
            queue: ArrayQueue::new(capacity),
            slots: Mutex::new(HashMap::new()),
            parents: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            locked: AtomicBool::new(false),
        }
    }

    /// Default trace name for a capsule.
    #[must_use]
    pub fn default_name(capsule_global_id: &str) -> String {
        format!("capsule_event_trace-{capsule_global_id}")
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// Take ownership of `event`, assign its id and global id, resolve its
    /// parent from the matching parent stack, and enqueue it.
    ///
    /// Dropped with `NotReady` while the trace is locked, and with `Failed`
    /// when the queue is full.
    pub fn push(&self, mut event: Event) -> Result<(EventId, String)> {
        if self.is_locked() {
            tracing::debug!(
                trace = %self.name(),
                event = event.name(),
                "trace locked, event dropped"
            );
            return Err(Error::not_ready("event trace is locked"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let global_id = format!(
            "{}-{}-{}-{}",
            self.name.read(),
            event.domain().name(),
            event.thread_id(),
            id
        );
        event.id = Some(id);
        event.global_id = Some(global_id.clone());
        event.parent_id = self
            .parents
            .lock()
            .get(&(event.domain(), event.thread_id()))
            .and_then(|stack| stack.last().copied());

        self.slots.lock().insert(id, Slot::Pending(event));
        if self.queue.push(id).is_err() {
            self.slots.lock().remove(&id);
            tracing::warn!(trace = %self.name(), event_id = id, "trace queue full, event dropped");
            return Err(Error::failed("event trace queue is full"));
        }
        Ok((id, global_id))
    }

    /// Dequeue the oldest pushed id. Does not wait for archival.
    pub fn pop(&self) -> Option<EventId> {
        self.queue.pop()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Refuse new pushes; already queued events stay.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn with_pending<T>(&self, id: EventId, f: impl FnOnce(&mut Event) -> T) -> Result<T> {
        match self.slots.lock().get_mut(&id) {
            Some(Slot::Pending(event)) => Ok(f(event)),
            Some(Slot::Archived(_)) => Err(Error::invalid_input(format!(
                "event {id} is archived and can no longer change"
            ))),
            None => Err(Error::not_exist(format!("event {id}"))),
        }
    }

    pub fn record_tick(&self, id: EventId, name: &str) -> Result<()> {
        self.with_pending(id, |event| event.record_tick(name))
    }

    pub fn record_tick_at(&self, id: EventId, name: &str, tick: u64) -> Result<()> {
        self.with_pending(id, |event| event.record_tick_at(name, tick))
    }

    pub fn set_metadata(&self, id: EventId, key: &str, value: impl Into<Value>) -> Result<()> {
        self.with_pending(id, |event| event.set_metadata(key, value))
    }

    /// Link two pending events both ways by global id.
    pub fn relate(&self, a: EventId, b: EventId) -> Result<()> {
        let mut slots = self.slots.lock();
        let global_of = |slots: &HashMap<EventId, Slot>, id: EventId| match slots.get(&id) {
            Some(Slot::Pending(event)) => event
                .global_id()
                .map(str::to_string)
                .ok_or_else(|| Error::not_exist(format!("event {id} was never pushed"))),
            Some(Slot::Archived(_)) => Err(Error::invalid_input(format!(
                "event {id} is archived and can no longer change"
            ))),
            None => Err(Error::not_exist(format!("event {id}"))),
        };
        let a_global = global_of(&slots, a)?;
        let b_global = global_of(&slots, b)?;
        if let Some(Slot::Pending(event)) = slots.get_mut(&a) {
            event.add_related(b_global);
        }
        if let Some(Slot::Pending(event)) = slots.get_mut(&b) {
            event.add_related(a_global);
        }
        Ok(())
    }

    /// Seal an event. Later mutations of `id` fail.
    pub fn archive(&self, id: EventId) -> Result<Arc<ArchivedEvent>> {
        let mut slots = self.slots.lock();
        match slots.remove(&id) {
            Some(Slot::Pending(event)) => {
                let archived = Arc::new(event.archive());
                slots.insert(id, Slot::Archived(Arc::clone(&archived)));
                Ok(archived)
            }
            Some(archived @ Slot::Archived(_)) => {
                slots.insert(id, archived);
                Err(Error::already_exist(format!("event {id} already archived")))
            }
            None => Err(Error::not_exist(format!("event {id}"))),
        }
    }

    /// Stamp `end` and a return code on a pending event and archive it.
    /// Used when the producer can no longer complete the event itself.
    pub fn force_complete(&self, id: EventId, return_code: i64) -> Result<Arc<ArchivedEvent>> {
        self.with_pending(id, |event| {
            event.record_tick(TICK_END);
            event.set_metadata(META_RETURN_CODE, return_code);
        })?;
        self.archive(id)
    }

    #[must_use]
    pub fn is_archived(&self, id: EventId) -> bool {
        matches!(self.slots.lock().get(&id), Some(Slot::Archived(_)))
    }

    #[must_use]
    pub fn archived(&self, id: EventId) -> Option<Arc<ArchivedEvent>> {
        match self.slots.lock().get(&id) {
            Some(Slot::Archived(event)) => Some(Arc::clone(event)),
            _ => None,
        }
    }

    #[must_use]
    pub fn domain_of(&self, id: EventId) -> Option<EventDomain> {
        self.slots.lock().get(&id).map(|slot| match slot {
            Slot::Pending(event) => event.domain(),
            Slot::Archived(event) => event.domain(),
        })
    }

    /// Free the arena slot once the event has been reported.
    pub fn retire(&self, id: EventId) {
        self.slots.lock().remove(&id);
    }

    /// Archived events still held in the arena.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ArchivedEvent>> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Archived(event) => Some(Arc::clone(event)),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    /// Make a pushed event the parent of later pushes on its
    /// `(domain, thread)`.
    pub fn push_parent(&self, id: EventId) -> Result<()> {
        let key = match self.slots.lock().get(&id) {
            Some(Slot::Pending(event)) => (event.domain(), event.thread_id()),
            Some(Slot::Archived(event)) => (event.domain(), event.thread_id()),
            None => return Err(Error::not_exist(format!("event {id}"))),
        };
        self.parents.lock().entry(key).or_default().push(id);
        Ok(())
    }

    pub fn pop_parent(&self, domain: EventDomain, thread_id: u64) -> Result<EventId> {
        let popped = self
            .parents
            .lock()
            .get_mut(&(domain, thread_id))
            .and_then(Vec::pop);
        popped.ok_or_else(|| {
            tracing::warn!(
                trace = %self.name(),
                %domain,
                thread_id,
                "pop_parent on an empty parent stack"
            );
            Error::not_exist(format!("no parent event for {domain} on thread {thread_id}"))
        })
    }

    #[must_use]
    pub fn latest_parent(&self, domain: EventDomain, thread_id: u64) -> Option<EventId> {
        self.parents
            .lock()
            .get(&(domain, thread_id))
            .and_then(|stack| stack.last().copied())
    }
}

/// Traces keyed by the producing thread's ordinal.
#[derive(Debug, Default)]
pub struct TraceRegistry {
    traces: Mutex<HashMap<u64, Arc<EventTrace>>>,
}

impl TraceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the trace for `thread` and whether it was just created.
    pub fn get_or_create(
        &self,
        thread: u64,
        create: impl FnOnce() -> EventTrace,
    ) -> (Arc<EventTrace>, bool) {
        let mut traces = self.traces.lock();
        if let Some(trace) = traces.get(&thread) {
            return (Arc::clone(trace), false);
        }
        let trace = Arc::new(create());
        traces.insert(thread, Arc::clone(&trace));
        (trace, true)
    }

    #[must_use]
    pub fn get(&self, thread: u64) -> Option<Arc<EventTrace>> {
        self.traces.lock().get(&thread).cloned()
    }

    /// Forget `thread`'s trace. Holders of the `Arc` keep it alive.
    pub fn remove(&self, thread: u64) -> Option<Arc<EventTrace>> {
        self.traces.lock().remove(&thread)
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<EventTrace>> {
        self.traces.lock().values().cloned().collect()
    }

    pub fn lock_all(&self) {
        for trace in self.traces.lock().values() {
            trace.lock();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.traces.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only timeline over archived events, ordered by `begin` tick.
#[derive(Debug, Clone, Default)]
pub struct TraceView {
    events: Vec<Arc<ArchivedEvent>>,
}

impl TraceView {
    pub fn load(events: impl IntoIterator<Item = Arc<ArchivedEvent>>) -> Self {
        let mut view = Self {
            events: events.into_iter().collect(),
        };
        view.sort();
        view
    }

    fn sort(&mut self) {
        self.events.sort_by_key(|event| {
            (
                event.tick(TICK_BEGIN).is_none(),
                event.tick(TICK_BEGIN).unwrap_or(u64::MAX),
                event.id(),
            )
        });
    }

    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.events.extend(other.events);
        self.sort();
        self
    }

    #[must_use]
    pub fn events(&self) -> &[Arc<ArchivedEvent>] {
        &self.events
    }

    /// Events grouped per producing thread, each group in timeline order.
    #[must_use]
    pub fn by_thread(&self) -> std::collections::BTreeMap<u64, Vec<Arc<ArchivedEvent>>> {
        let mut groups: std::collections::BTreeMap<u64, Vec<_>> = Default::default();
        for event in &self.events {
            groups
                .entry(event.thread_id())
                .or_default()
                .push(Arc::clone(event));
        }
        groups
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Array(self.events.iter().map(|event| event.to_json()).collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl std::ops::Add for TraceView {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        self.merge(other)
    }
}
