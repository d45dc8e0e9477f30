use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::Bytes;
use serde_json::{Map, Value, json};

use harvester_api::config::{self, PipelineContext};
use harvester_api::error::PluginError;
use harvester_api::event::{Event, EventGroup};
use harvester_api::plugin::{Flusher, FlusherSpec, SendResult};
use harvester_api::sender::SenderQueueItem;

pub const TYPE_NAME: &str = "flusher_file";

const KNOWN_KEYS: &[&str] = &["Path", "FlushTimeoutSecs", "MaxBatchEvents"];

/// Appends serialized batches to a local file as JSON lines. The simplest
/// complete sink: it exercises the batcher, the timeout flush manager, and
/// the sender queue retry path end to end.
pub struct FileFlusher {
    path: PathBuf,
}

impl FileFlusher {
    pub fn new() -> Self {
        Self { path: PathBuf::new() }
    }

    fn event_to_json(group: &EventGroup, event: &Event) -> Value {
        let ts = event.timestamp();
        let tags: Map<String, Value> = group
            .tags()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        match event {
            Event::Log(e) => {
                let contents: Map<String, Value> = e
                    .contents
                    .iter()
                    .map(|(k, v)| {
                        (group.resolve(*k).to_string(), Value::String(group.resolve(*v).to_string()))
                    })
                    .collect();
                json!({
                    "kind": "log",
                    "timestamp": ts.secs,
                    "timestampNanosecond": ts.nanos,
                    "tags": tags,
                    "contents": contents,
                })
            }
            Event::Metric(e) => {
                let labels: Map<String, Value> = e
                    .labels
                    .iter()
                    .map(|(k, v)| {
                        (group.resolve(*k).to_string(), Value::String(group.resolve(*v).to_string()))
                    })
                    .collect();
                json!({
                    "kind": "metric",
                    "timestamp": ts.secs,
                    "timestampNanosecond": ts.nanos,
                    "tags": tags,
                    "name": group.resolve(e.name),
                    "value": e.value,
                    "labels": labels,
                })
            }
            Event::Span(e) => json!({
                "kind": "span",
                "timestamp": ts.secs,
                "timestampNanosecond": ts.nanos,
                "tags": tags,
                "traceId": group.resolve(e.trace_id),
                "spanId": group.resolve(e.span_id),
                "name": group.resolve(e.name),
                "durationMs": e.duration_ms,
            }),
        }
    }
}

impl Default for FileFlusher {
    fn default() -> Self {
        Self::new()
    }
}

impl Flusher for FileFlusher {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn init(&mut self, config: &Value, ctx: &PipelineContext) -> Result<FlusherSpec, PluginError> {
        config::warn_unknown_keys(config, KNOWN_KEYS, ctx, TYPE_NAME);
        self.path = PathBuf::from(config::required_string(config, "Path")?);
        let flush_timeout_secs = config::optional_u64(config, "FlushTimeoutSecs", 5, ctx, TYPE_NAME);
        let max_batch_events =
            config::optional_u64(config, "MaxBatchEvents", 512, ctx, TYPE_NAME).max(1) as usize;
        Ok(FlusherSpec {
            destination: self.path.display().to_string(),
            flush_timeout_secs,
            max_batch_events,
        })
    }

    fn serialize(&self, groups: Vec<EventGroup>) -> Result<Bytes, PluginError> {
        let mut out = Vec::new();
        for group in &groups {
            for event in group.events() {
                let line = serde_json::to_string(&Self::event_to_json(group, event))?;
                out.extend_from_slice(line.as_bytes());
                out.push(b'\n');
            }
        }
        Ok(Bytes::from(out))
    }

    fn export(
        &self,
        item: &SenderQueueItem,
    ) -> Pin<Box<dyn Future<Output = SendResult> + Send + '_>> {
        let payload = item.payload.clone();
        Box::pin(async move {
            let result = async {
                use tokio::io::AsyncWriteExt;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?;
                file.write_all(&payload).await?;
                file.flush().await?;
                Ok::<(), std::io::Error>(())
            }
            .await;
            match result {
                Ok(()) => SendResult::Ok,
                Err(e) if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
                {
                    tracing::warn!(path = %self.path.display(), error = %e, "file sink unusable");
                    SendResult::Permanent
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "file write failed, will retry");
                    SendResult::Retry { after: None }
                }
            }
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use harvester_api::event::{GroupMetadata, LogEvent, Timestamp};
    use harvester_api::plugin::QueueKey;
    use serde_json::json;

    use super::*;

    fn ctx() -> PipelineContext {
        PipelineContext::new("test_config")
    }

    fn group() -> EventGroup {
        let mut g = EventGroup::new(GroupMetadata {
            config_name: "cfg".into(),
            source: "src".into(),
            acquired_at: Timestamp::now(),
        });
        g.set_tag("host.name", "h1");
        let mut e = LogEvent::new(Timestamp { secs: 12345678, nanos: 9 });
        let k = g.alloc("content");
        let v = g.alloc("line1");
        e.contents.push((k, v));
        g.push_event(Event::Log(e));
        g
    }

    #[test]
    fn init_requires_path() {
        let mut f = FileFlusher::new();
        assert!(f.init(&json!({}), &ctx()).is_err());
        let spec = f.init(&json!({ "Path": "/tmp/out.log" }), &ctx()).unwrap();
        assert_eq!(spec.destination, "/tmp/out.log");
        assert_eq!(spec.flush_timeout_secs, 5);
    }

    #[test]
    fn serializes_json_lines() {
        let f = FileFlusher::new();
        let payload = f.serialize(vec![group(), group()]).unwrap();
        let text = std::str::from_utf8(&payload).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["kind"], "log");
        assert_eq!(parsed["timestamp"], 12345678);
        assert_eq!(parsed["tags"]["host.name"], "h1");
        assert_eq!(parsed["contents"]["content"], "line1");
    }

    #[tokio::test]
    async fn export_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut f = FileFlusher::new();
        f.init(&json!({ "Path": path }), &ctx()).unwrap();

        let payload = f.serialize(vec![group()]).unwrap();
        let item = SenderQueueItem::new(
            QueueKey::from_raw(1),
            0,
            path.display().to_string(),
            payload,
            1,
            0,
        );
        assert!(matches!(f.export(&item).await, SendResult::Ok));
        assert!(matches!(f.export(&item).await, SendResult::Ok));

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 2);
    }
}
