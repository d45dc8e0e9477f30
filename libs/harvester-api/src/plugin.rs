use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::config::PipelineContext;
use crate::error::PluginError;
use crate::event::EventGroup;
use crate::sender::SenderQueueItem;

/// Opaque handle identifying one pipeline's queue pair. Minted by the queue
/// manager at pipeline creation; stable for the pipeline's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey(u64);

impl QueueKey {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Identity assigned to a plugin at construction. The id is monotonic
/// within a pipeline and doubles as the logical name in telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMeta {
    pub plugin_id: String,
}

impl PluginMeta {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self { plugin_id: plugin_id.into() }
    }
}

/// Outcome of pushing a group into a process queue. On `QueueFull` the
/// group is handed back so the producer can retry after backing off.
#[derive(Debug)]
pub enum PushError {
    QueueFull(EventGroup),
    QueueNotFound,
}

/// Where inputs hand off their groups. Implemented by the queue managers.
pub trait GroupSink: Send + Sync {
    fn push(&self, key: QueueKey, group: EventGroup) -> Result<(), PushError>;

    /// False while the queue is above its high-water mark, paused, or
    /// missing. Inputs consult this before building a new group.
    fn is_valid_to_push(&self, key: QueueKey) -> bool;
}

/// Runtime context handed to an input's poll loop.
pub struct InputContext {
    pub key: QueueKey,
    pub sink: Arc<dyn GroupSink>,
    pub pipeline: PipelineContext,
}

/// Event source. Owns its poll loop: the engine spawns `run` as a task and
/// drives `stop` on shutdown.
pub trait Input: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&mut self, config: &Value, ctx: &PipelineContext) -> Result<(), PluginError>;

    /// Drive the source until shutdown. On `QueueFull` the input must back
    /// off (see [`Backoff`]); it must not spin.
    fn run(
        &self,
        ctx: InputContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>>;

    /// Signal graceful shutdown. Idempotent; must drain any owned worker.
    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>>;
}

/// In-place group transform. `process` may drop all events by emptying the
/// container; compiled patterns are immutable after init and shared across
/// worker threads.
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&mut self, config: &Value, ctx: &PipelineContext) -> Result<(), PluginError>;

    fn process(&self, group: &mut EventGroup);
}

/// Flusher parameters discovered at init and consumed by the engine-side
/// batcher.
#[derive(Debug, Clone)]
pub struct FlusherSpec {
    /// Destination descriptor (remote endpoint, file path, ...). One sender
    /// queue exists per destination.
    pub destination: String,
    /// Batches older than this are flushed by the timeout flush manager.
    /// Zero means "flush on the next scan".
    pub flush_timeout_secs: u64,
    /// A batch reaching this many events is flushed immediately.
    pub max_batch_events: usize,
}

/// Result of one delivery attempt.
#[derive(Debug)]
pub enum SendResult {
    Ok,
    /// Recoverable; retry no earlier than `after` (None = manager default).
    Retry { after: Option<Duration> },
    /// Dead-letter path; the item is dropped and counted.
    Permanent,
}

/// Batch sink. Serialization happens on the flush path; `export` performs
/// the actual delivery and is the only async plugin call on the hot path.
pub trait Flusher: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&mut self, config: &Value, ctx: &PipelineContext) -> Result<FlusherSpec, PluginError>;

    /// Serialize one batch into a sender-queue item payload.
    fn serialize(&self, groups: Vec<EventGroup>) -> Result<bytes::Bytes, PluginError>;

    /// Deliver one payload to the destination.
    fn export(
        &self,
        item: &SenderQueueItem,
    ) -> Pin<Box<dyn Future<Output = SendResult> + Send + '_>>;

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>>;
}

// ---------------------------------------------------------------------------
// Backoff — shared by inputs on QueueFull
// ---------------------------------------------------------------------------

/// Exponential backoff with jitter. Doubles on each failure up to `cap`;
/// every wait carries up to 25% random jitter so stalled inputs do not wake
/// in lockstep.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, current: base }
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Next wait interval, advancing the backoff state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        let jitter = rand::rng().random_range(0.0..0.25);
        delay.mul_f64(1.0 + jitter)
    }

    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let d1 = b.next_delay();
        let d2 = b.next_delay();
        let d3 = b.next_delay();
        let d4 = b.next_delay();
        assert!(d1 >= Duration::from_millis(100) && d1 <= Duration::from_millis(125));
        assert!(d2 >= Duration::from_millis(200) && d2 <= Duration::from_millis(250));
        // Capped at 350ms from the third failure on.
        assert!(d3 >= Duration::from_millis(350) && d3 <= Duration::from_millis(438));
        assert!(d4 >= Duration::from_millis(350) && d4 <= Duration::from_millis(438));
    }

    #[test]
    fn backoff_reset_restarts_from_base() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        b.next_delay();
        b.next_delay();
        b.reset();
        let d = b.next_delay();
        assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(125));
    }
}
