pub mod bounded;
pub mod exactly_once;
pub mod process_manager;
pub mod sender;
pub mod sender_manager;

use harvester_api::plugin::QueueKey;

/// Upstream feedback hook. Registered with a bounded queue; invoked when
/// the queue crosses its low watermark downward (resume) or its high
/// watermark upward (pause). Signals are idempotent.
pub trait Feedback: Send + Sync {
    fn on_pause(&self, key: QueueKey);
    fn on_resume(&self, key: QueueKey);
}
