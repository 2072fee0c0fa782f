//! Event model: one traced happening with named ticks and metadata.
//!
//! An [`Event`] is freely mutable while instrumentation fills it in.
//! [`Event::archive`] consumes it and yields an [`ArchivedEvent`], which has
//! no mutators and is shared across threads behind an `Arc`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sequential id of an event within one trace.
pub type EventId = u64;

/// Tick name conventionally stamped when an event starts.
pub const TICK_BEGIN: &str = "begin";
/// Tick name conventionally stamped when an event completes.
pub const TICK_END: &str = "end";

/// Which layer produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventDomain {
    Cpu,
    Gpu,
    App,
    /// Events produced by gwatch itself.
    Internal,
}

impl EventDomain {
    pub const ALL: [Self; 4] = [Self::Cpu, Self::Gpu, Self::App, Self::Internal];

    /// Numeric wire code.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::Cpu => 100,
            Self::Gpu => 200,
            Self::App => 300,
            Self::Internal => 400,
        }
    }

    /// Codes are range-based: 100-199 CPU, 200-299 GPU, 300-399 APP, 400+ internal.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            100..=199 => Some(Self::Cpu),
            200..=299 => Some(Self::Gpu),
            300..=399 => Some(Self::App),
            400.. => Some(Self::Internal),
            _ => None,
        }
    }

    /// Short name used in global ids and report URIs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::App => "app",
            Self::Internal => "gwatch",
        }
    }
}

impl std::fmt::Display for EventDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

static NEXT_THREAD_ORDINAL: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ORDINAL: Cell<u64> = const { Cell::new(0) };
}

/// Small process-unique id of the calling thread, assigned on first use.
#[must_use]
pub fn current_thread_ordinal() -> u64 {
    THREAD_ORDINAL.with(|cell| {
        let mut ordinal = cell.get();
        if ordinal == 0 {
            ordinal = NEXT_THREAD_ORDINAL.fetch_add(1, Ordering::Relaxed);
            cell.set(ordinal);
        }
        ordinal
    })
}

/// Current timestamp in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_ticks() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map_or(0, |ns| ns.max(0) as u64)
}

/// An event still being filled in by instrumentation.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    name: String,
    domain: EventDomain,
    thread_id: u64,
    ticks: BTreeMap<String, u64>,
    metadata: Vec<(String, Value)>,
    related_ids: BTreeSet<String>,
    pub(crate) id: Option<EventId>,
    pub(crate) global_id: Option<String>,
    pub(crate) parent_id: Option<EventId>,
}

impl Event {
    /// Event produced on the calling thread.
    pub fn new(name: impl Into<String>, domain: EventDomain) -> Self {
        Self::on_thread(name, domain, current_thread_ordinal())
    }

    pub fn on_thread(name: impl Into<String>, domain: EventDomain, thread_id: u64) -> Self {
        Self {
            name: name.into(),
            domain,
            thread_id,
            ticks: BTreeMap::new(),
            metadata: Vec::new(),
            related_ids: BTreeSet::new(),
            id: None,
            global_id: None,
            parent_id: None,
        }
    }

    pub fn cpu(name: impl Into<String>) -> Self {
        Self::new(name, EventDomain::Cpu)
    }

    pub fn app(name: impl Into<String>) -> Self {
        Self::new(name, EventDomain::App)
    }

    /// GPU work issued from the calling thread onto a device stream.
    pub fn gpu(name: impl Into<String>, device_id: i32, stream_id: u64) -> Self {
        let mut event = Self::new(name, EventDomain::Gpu);
        event.set_metadata("device_id", json!(device_id));
        event.set_metadata("stream_id", json!(stream_id));
        event
    }

    /// Stamp `name` with the current time, replacing any earlier value.
    pub fn record_tick(&mut self, name: impl Into<String>) {
        self.record_tick_at(name, now_ticks());
    }

    pub fn record_tick_at(&mut self, name: impl Into<String>, tick: u64) {
        self.ticks.insert(name.into(), tick);
    }

    /// Append a metadata pair. Duplicate keys are kept in order.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.push((key.into(), value.into()));
    }

    pub(crate) fn add_related(&mut self, global_id: String) {
        self.related_ids.insert(global_id);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn domain(&self) -> EventDomain {
        self.domain
    }

    #[must_use]
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    #[must_use]
    pub fn tick(&self, name: &str) -> Option<u64> {
        self.ticks.get(name).copied()
    }

    #[must_use]
    pub fn metadata(&self) -> &[(String, Value)] {
        &self.metadata
    }

    /// Assigned when the event is pushed into a trace.
    #[must_use]
    pub fn id(&self) -> Option<EventId> {
        self.id
    }

    #[must_use]
    pub fn global_id(&self) -> Option<&str> {
        self.global_id.as_deref()
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<EventId> {
        self.parent_id
    }

    /// Seal the event. Ticks, metadata and links can no longer change.
    #[must_use]
    pub fn archive(self) -> ArchivedEvent {
        ArchivedEvent {
            id: self.id.unwrap_or_default(),
            global_id: self.global_id.unwrap_or_default(),
            name: self.name,
            domain: self.domain,
            thread_id: self.thread_id,
            ticks: self.ticks,
            metadata: self.metadata,
            related_ids: self.related_ids,
            parent_id: self.parent_id,
        }
    }
}

/// A completed event. Immutable and safe to read from any thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedEvent {
    id: EventId,
    global_id: String,
    name: String,
    domain: EventDomain,
    thread_id: u64,
    ticks: BTreeMap<String, u64>,
    metadata: Vec<(String, Value)>,
    related_ids: BTreeSet<String>,
    parent_id: Option<EventId>,
}

impl ArchivedEvent {
    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    #[must_use]
    pub fn global_id(&self) -> &str {
        &self.global_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn domain(&self) -> EventDomain {
        self.domain
    }

    #[must_use]
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    #[must_use]
    pub fn tick(&self, name: &str) -> Option<u64> {
        self.ticks.get(name).copied()
    }

    #[must_use]
    pub fn ticks(&self) -> &BTreeMap<String, u64> {
        &self.ticks
    }

    #[must_use]
    pub fn metadata(&self) -> &[(String, Value)] {
        &self.metadata
    }

    #[must_use]
    pub fn related_ids(&self) -> &BTreeSet<String> {
        &self.related_ids
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<EventId> {
        self.parent_id
    }

    /// Record body carried in the report payload.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let metadata: Vec<Value> = self
            .metadata
            .iter()
            .map(|(key, value)| json!([key, value]))
            .collect();
        json!({
            "name": self.name,
            "id": self.id,
            "global_id": self.global_id,
            "list_related_event_global_idx": self.related_ids,
            "has_parent": self.parent_id.is_some(),
            "parent_id": self.parent_id.unwrap_or_default(),
            "type": self.domain.code(),
            "thread_id": self.thread_id,
            "ticks": self.ticks,
            "metadata": metadata,
        })
    }

    /// Rebuild an event from its report body.
    pub fn from_json(value: &Value) -> crate::Result<Self> {
        let field = |key: &str| {
            value
                .get(key)
                .ok_or_else(|| crate::Error::invalid_input(format!("event record missing {key}")))
        };
        let as_u64 = |key: &str| -> crate::Result<u64> {
            field(key)?
                .as_u64()
                .ok_or_else(|| crate::Error::invalid_input(format!("event {key} is not a u64")))
        };

        let code = u32::try_from(as_u64("type")?)
            .map_err(|_| crate::Error::invalid_input("event type out of range"))?;
        let domain = EventDomain::from_code(code)
            .ok_or_else(|| crate::Error::invalid_input(format!("unknown event type {code}")))?;
        let has_parent = field("has_parent")?.as_bool().unwrap_or(false);
        let ticks: BTreeMap<String, u64> = serde_json::from_value(field("ticks")?.clone())?;
        let related_ids: BTreeSet<String> =
            serde_json::from_value(field("list_related_event_global_idx")?.clone())?;
        let pairs: Vec<(String, Value)> = serde_json::from_value(field("metadata")?.clone())?;

        Ok(Self {
            id: as_u64("id")?,
            global_id: field("global_id")?.as_str().unwrap_or_default().to_string(),
            name: field("name")?.as_str().unwrap_or_default().to_string(),
            domain,
            thread_id: as_u64("thread_id")?,
            ticks,
            metadata: pairs,
            related_ids,
            parent_id: if has_parent {
                Some(as_u64("parent_id")?)
            } else {
                None
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_codes() {
        for domain in EventDomain::ALL {
            assert_eq!(EventDomain::from_code(domain.code()), Some(domain));
        }
        assert_eq!(EventDomain::from_code(150), Some(EventDomain::Cpu));
        assert_eq!(EventDomain::from_code(0), None);
        assert_eq!(EventDomain::Internal.name(), "gwatch");
    }

    #[test]
    fn record_tick_overwrites() {
        let mut event = Event::cpu("region");
        event.record_tick_at(TICK_BEGIN, 5);
        event.record_tick_at(TICK_BEGIN, 9);
        event.record_tick_at(TICK_END, 12);
        assert_eq!(event.tick(TICK_BEGIN), Some(9));
        assert_eq!(event.tick(TICK_END), Some(12));
    }

    #[test]
    fn metadata_keeps_duplicates_in_order() {
        let mut event = Event::app("step");
        event.set_metadata("k", 1);
        event.set_metadata("k", "two");
        assert_eq!(
            event.metadata(),
            &[("k".to_string(), json!(1)), ("k".to_string(), json!("two"))]
        );
    }

    #[test]
    fn gpu_events_carry_device_and_stream() {
        let event = Event::gpu("kernel", 1, 7);
        assert_eq!(event.domain(), EventDomain::Gpu);
        assert_eq!(event.metadata()[0], ("device_id".to_string(), json!(1)));
        assert_eq!(event.metadata()[1], ("stream_id".to_string(), json!(7)));
    }

    #[test]
    fn thread_ordinals_are_stable_and_distinct() {
        let here = current_thread_ordinal();
        assert_eq!(here, current_thread_ordinal());
        let there = std::thread::spawn(current_thread_ordinal).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn archived_form_reflects_mutations() {
        let mut event = Event::on_thread("launch", EventDomain::Cpu, 3);
        event.id = Some(4);
        event.global_id = Some("t-cpu-3-4".into());
        event.parent_id = Some(2);
        event.record_tick_at(TICK_BEGIN, 100);
        event.set_metadata("grid", json!([1, 1, 1]));
        event.add_related("t-gpu-3-5".into());
        let archived = event.archive();

        let value = archived.to_json();
        assert_eq!(value["name"], "launch");
        assert_eq!(value["global_id"], "t-cpu-3-4");
        assert_eq!(value["has_parent"], true);
        assert_eq!(value["parent_id"], 2);
        assert_eq!(value["type"], 100);
        assert_eq!(value["ticks"], json!({"begin": 100}));
        assert_eq!(value["metadata"], json!([["grid", [1, 1, 1]]]));
        assert_eq!(value["list_related_event_global_idx"], json!(["t-gpu-3-5"]));

        assert_eq!(ArchivedEvent::from_json(&value).unwrap(), archived);
    }

    #[test]
    fn from_json_rejects_unknown_domain() {
        let mut value = Event::cpu("x").archive().to_json();
        value["type"] = json!(7);
        assert!(ArchivedEvent::from_json(&value).is_err());
    }
}
