use bytes::Bytes;

use crate::plugin::QueueKey;

/// A serialized batch awaiting network send.
///
/// The item exclusively owns its payload. `queue_key` + `flusher_index` is
/// the weak back-reference to the originating pipeline: the sender loop
/// resolves it through the pipeline manager at send time, and an ack for a
/// pipeline that is gone is a counted no-op.
#[derive(Debug)]
pub struct SenderQueueItem {
    pub queue_key: QueueKey,
    /// Position of the producing flusher within its pipeline.
    pub flusher_index: usize,
    /// Destination descriptor; one sender queue exists per destination.
    pub destination: String,
    pub payload: Bytes,
    pub event_count: usize,
    pub batch_key: u64,
    /// Delivery attempts so far. Maintained by the sender queue manager.
    pub attempt: u32,
    /// Exactly-once pairing: the checkpoint hash key this item belongs to.
    pub hash_key: Option<String>,
    /// Exactly-once pairing: unique id of this send within the hash key.
    pub sequence_id: Option<u64>,
}

impl SenderQueueItem {
    pub fn new(
        queue_key: QueueKey,
        flusher_index: usize,
        destination: impl Into<String>,
        payload: Bytes,
        event_count: usize,
        batch_key: u64,
    ) -> Self {
        Self {
            queue_key,
            flusher_index,
            destination: destination.into(),
            payload,
            event_count,
            batch_key,
            attempt: 0,
            hash_key: None,
            sequence_id: None,
        }
    }
}
