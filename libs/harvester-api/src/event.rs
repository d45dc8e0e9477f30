use std::time::SystemTime;

/// Event timestamp: seconds since the epoch plus a nanosecond part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => Self { secs: d.as_secs() as i64, nanos: d.subsec_nanos() },
            Err(_) => Self::default(),
        }
    }
}

/// Handle into an [`EventGroup`]'s string arena.
///
/// Refs are only minted by [`EventGroup::alloc`] and stay valid for the
/// lifetime of the group: the arena is append-only, so offsets never move.
/// Resolving a ref against a group other than the one that minted it is a
/// logic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringRef {
    offset: u32,
    len: u32,
}

impl StringRef {
    pub const EMPTY: StringRef = StringRef { offset: 0, len: 0 };

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Append-only byte arena backing all string data of one group.
#[derive(Debug, Default)]
struct Arena {
    bytes: Vec<u8>,
}

impl Arena {
    fn alloc(&mut self, s: &str) -> StringRef {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        StringRef { offset, len: s.len() as u32 }
    }

    fn resolve(&self, r: StringRef) -> &str {
        let bytes = &self.bytes[r.offset as usize..(r.offset + r.len) as usize];
        // Safety: refs are only minted by `alloc`, which copies whole UTF-8
        // strings, and the arena is append-only.
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }
}

/// One telemetry record inside a group.
#[derive(Debug)]
pub enum Event {
    Log(LogEvent),
    Metric(MetricEvent),
    Span(SpanEvent),
}

impl Event {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Event::Log(e) => e.timestamp,
            Event::Metric(e) => e.timestamp,
            Event::Span(e) => e.timestamp,
        }
    }
}

/// A log line (or discovery record) as a set of key/value fields.
#[derive(Debug, Default)]
pub struct LogEvent {
    pub timestamp: Timestamp,
    pub contents: Vec<(StringRef, StringRef)>,
}

impl LogEvent {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp, contents: Vec::new() }
    }
}

/// A single numeric sample with a label set.
#[derive(Debug)]
pub struct MetricEvent {
    pub timestamp: Timestamp,
    pub name: StringRef,
    pub value: f64,
    pub labels: Vec<(StringRef, StringRef)>,
}

/// A finished span.
#[derive(Debug)]
pub struct SpanEvent {
    pub timestamp: Timestamp,
    pub trace_id: StringRef,
    pub span_id: StringRef,
    pub name: StringRef,
    pub duration_ms: u64,
}

/// Provenance of a group: which config produced it and from what source.
#[derive(Debug, Clone, Default)]
pub struct GroupMetadata {
    pub config_name: String,
    /// Source path, scrape target, or collector name.
    pub source: String,
    pub acquired_at: Timestamp,
}

/// Arena-backed batch of events, moved as a unit through the pipeline.
///
/// The group exclusively owns its arena, events, and tags. It is moved,
/// never cloned, across pipeline stages; `seal` marks the hand-off from the
/// producing input to the queue.
#[derive(Debug, Default)]
pub struct EventGroup {
    arena: Arena,
    events: Vec<Event>,
    tags: Vec<(StringRef, StringRef)>,
    metadata: GroupMetadata,
    sealed: bool,
}

impl EventGroup {
    pub fn new(metadata: GroupMetadata) -> Self {
        Self {
            arena: Arena::default(),
            events: Vec::new(),
            tags: Vec::new(),
            metadata,
            sealed: false,
        }
    }

    /// Copy `s` into the arena and return a handle to it.
    pub fn alloc(&mut self, s: &str) -> StringRef {
        debug_assert!(!self.sealed, "allocation after seal");
        self.arena.alloc(s)
    }

    pub fn resolve(&self, r: StringRef) -> &str {
        self.arena.resolve(r)
    }

    /// Mark the input → queue hand-off: the arena takes no further writes
    /// while the group sits in the queue. Idempotent.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Reopen the group for the processor chain. Called by the worker once
    /// it holds exclusive ownership of the dequeued group.
    pub fn unseal(&mut self) {
        self.sealed = false;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn push_event(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut Vec<Event> {
        &mut self.events
    }

    /// Replace the event container, returning the old one. Processors use
    /// this to rewrite a group in place.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn set_events(&mut self, events: Vec<Event>) {
        self.events = events;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Attach a tag that applies to every event in the group. A tag set
    /// twice keeps the last value.
    pub fn set_tag(&mut self, key: &str, value: &str) {
        debug_assert!(!self.sealed, "tag write after seal");
        let v = self.arena.alloc(value);
        if let Some(existing) = self
            .tags
            .iter_mut()
            .find(|(k, _)| self.arena.resolve(*k) == key)
        {
            existing.1 = v;
            return;
        }
        let k = self.arena.alloc(key);
        self.tags.push((k, v));
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| self.arena.resolve(*k) == key)
            .map(|(_, v)| self.arena.resolve(*v))
    }

    pub fn tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags
            .iter()
            .map(|(k, v)| (self.arena.resolve(*k), self.arena.resolve(*v)))
    }

    pub fn metadata(&self) -> &GroupMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut GroupMetadata {
        &mut self.metadata
    }

    /// Deep copy for multi-flusher fan-out. Stage hand-off always moves a
    /// group; this is the one explicit copy point, used when a pipeline
    /// routes one group to more than one flusher.
    pub fn duplicate(&self) -> EventGroup {
        let mut copy = EventGroup::new(self.metadata.clone());
        for (k, v) in &self.tags {
            let nk = copy.arena.alloc(self.arena.resolve(*k));
            let nv = copy.arena.alloc(self.arena.resolve(*v));
            copy.tags.push((nk, nv));
        }
        for event in &self.events {
            let copied = match event {
                Event::Log(e) => Event::Log(LogEvent {
                    timestamp: e.timestamp,
                    contents: e
                        .contents
                        .iter()
                        .map(|(k, v)| {
                            (
                                copy.arena.alloc(self.arena.resolve(*k)),
                                copy.arena.alloc(self.arena.resolve(*v)),
                            )
                        })
                        .collect(),
                }),
                Event::Metric(e) => Event::Metric(MetricEvent {
                    timestamp: e.timestamp,
                    name: copy.arena.alloc(self.arena.resolve(e.name)),
                    value: e.value,
                    labels: e
                        .labels
                        .iter()
                        .map(|(k, v)| {
                            (
                                copy.arena.alloc(self.arena.resolve(*k)),
                                copy.arena.alloc(self.arena.resolve(*v)),
                            )
                        })
                        .collect(),
                }),
                Event::Span(e) => Event::Span(SpanEvent {
                    timestamp: e.timestamp,
                    trace_id: copy.arena.alloc(self.arena.resolve(e.trace_id)),
                    span_id: copy.arena.alloc(self.arena.resolve(e.span_id)),
                    name: copy.arena.alloc(self.arena.resolve(e.name)),
                    duration_ms: e.duration_ms,
                }),
            };
            copy.events.push(copied);
        }
        copy.sealed = self.sealed;
        copy
    }

    /// Field lookup helper for log events.
    pub fn log_field<'a>(&'a self, event: &LogEvent, key: &str) -> Option<&'a str> {
        event
            .contents
            .iter()
            .find(|(k, _)| self.resolve(*k) == key)
            .map(|(_, v)| self.resolve(*v))
    }
}
