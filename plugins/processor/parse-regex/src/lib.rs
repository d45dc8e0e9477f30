use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use harvester_api::config::{self, PipelineContext};
use harvester_api::error::PluginError;
use harvester_api::event::{Event, EventGroup, LogEvent};
use harvester_api::metrics::{Counter, MetricsRecord, names};
use harvester_api::plugin::Processor;

pub const TYPE_NAME: &str = "processor_parse_regex";

const KNOWN_KEYS: &[&str] = &[
    "SourceKey",
    "Regex",
    "Keys",
    "KeepingSourceWhenParseFail",
    "KeepingSourceWhenParseSucceed",
    "RenamedSourceKey",
];

/// Extracts fields from one source key by regex capture groups.
///
/// The compiled pattern is immutable after init and shared across worker
/// threads.
pub struct ParseRegexProcessor {
    source_key: String,
    regex: Option<Regex>,
    keys: Vec<String>,
    keeping_source_when_parse_fail: bool,
    keeping_source_when_parse_succeed: bool,
    renamed_source_key: String,
    out_key_not_found_events_total: Option<Arc<Counter>>,
    discarded_events_total: Option<Arc<Counter>>,
}

impl ParseRegexProcessor {
    pub fn new() -> Self {
        Self {
            source_key: String::new(),
            regex: None,
            keys: Vec::new(),
            keeping_source_when_parse_fail: false,
            keeping_source_when_parse_succeed: false,
            renamed_source_key: String::new(),
            out_key_not_found_events_total: None,
            discarded_events_total: None,
        }
    }

    /// Returns the rewritten event, or None when the unparsable event is
    /// to be discarded.
    fn parse_event(&self, group: &mut EventGroup, event: LogEvent) -> Option<LogEvent> {
        let Some(regex) = &self.regex else {
            return Some(event);
        };
        let Some(source) = group.log_field(&event, &self.source_key).map(str::to_string) else {
            if let Some(c) = &self.out_key_not_found_events_total {
                c.add(1);
            }
            return Some(event);
        };

        let captures = regex.captures(&source);
        let Some(captures) = captures else {
            if self.keeping_source_when_parse_fail {
                let mut kept = LogEvent::new(event.timestamp);
                let k = group.alloc(&self.renamed_source_key);
                let v = group.alloc(&source);
                kept.contents.push((k, v));
                return Some(kept);
            }
            if let Some(c) = &self.discarded_events_total {
                c.add(1);
            }
            return None;
        };

        let mut parsed = LogEvent::new(event.timestamp);
        for (i, key) in self.keys.iter().enumerate() {
            let value = captures.get(i + 1).map_or("", |m| m.as_str());
            let k = group.alloc(key);
            let v = group.alloc(value);
            parsed.contents.push((k, v));
        }
        if self.keeping_source_when_parse_succeed && !self.keys.iter().any(|k| *k == self.renamed_source_key)
        {
            let k = group.alloc(&self.renamed_source_key);
            let v = group.alloc(&source);
            parsed.contents.push((k, v));
        }
        Some(parsed)
    }
}

impl Default for ParseRegexProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for ParseRegexProcessor {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn init(&mut self, config: &Value, ctx: &PipelineContext) -> Result<(), PluginError> {
        config::warn_unknown_keys(config, KNOWN_KEYS, ctx, TYPE_NAME);

        self.source_key = config::required_string(config, "SourceKey")?;
        let pattern = config::required_string(config, "Regex")?;
        self.regex = Some(Regex::new(&pattern)?);
        self.keys = config::optional_string_list(config, "Keys", ctx, TYPE_NAME)
            .filter(|keys| !keys.is_empty())
            .ok_or_else(|| PluginError::config("missing required param 'Keys'"))?;
        self.keeping_source_when_parse_fail =
            config::optional_bool(config, "KeepingSourceWhenParseFail", false, ctx, TYPE_NAME);
        self.keeping_source_when_parse_succeed =
            config::optional_bool(config, "KeepingSourceWhenParseSucceed", false, ctx, TYPE_NAME);
        self.renamed_source_key = config::optional_string(config, "RenamedSourceKey", ctx, TYPE_NAME)
            .unwrap_or_else(|| self.source_key.clone());

        let record = ctx.metrics.clone().unwrap_or_else(MetricsRecord::detached);
        self.out_key_not_found_events_total =
            Some(record.counter(names::OUT_KEY_NOT_FOUND_EVENTS_TOTAL));
        self.discarded_events_total = Some(record.counter(names::DISCARDED_EVENTS_TOTAL));
        Ok(())
    }

    fn process(&self, group: &mut EventGroup) {
        let events = group.take_events();
        let mut kept = Vec::with_capacity(events.len());
        for event in events {
            match event {
                Event::Log(log) => {
                    if let Some(parsed) = self.parse_event(group, log) {
                        kept.push(Event::Log(parsed));
                    }
                }
                other => kept.push(other),
            }
        }
        group.set_events(kept);
    }
}

#[cfg(test)]
mod tests {
    use harvester_api::event::{GroupMetadata, Timestamp};
    use serde_json::json;

    use super::*;

    fn ctx() -> PipelineContext {
        PipelineContext::new("test_config")
    }

    fn init(config: Value) -> ParseRegexProcessor {
        let mut p = ParseRegexProcessor::new();
        p.init(&config, &ctx()).unwrap();
        p
    }

    fn group_with_line(line: &str) -> EventGroup {
        let mut g = EventGroup::new(GroupMetadata::default());
        let mut e = LogEvent::new(Timestamp { secs: 12345678, nanos: 0 });
        let k = g.alloc("content");
        let v = g.alloc(line);
        e.contents.push((k, v));
        g.push_event(Event::Log(e));
        g
    }

    fn field<'a>(g: &'a EventGroup, key: &str) -> Option<&'a str> {
        let Event::Log(log) = &g.events()[0] else {
            panic!("expected log event");
        };
        g.log_field(log, key)
    }

    #[test]
    fn init_requires_source_key_regex_and_keys() {
        let mut p = ParseRegexProcessor::new();
        assert!(p.init(&json!({ "Regex": "(.*)", "Keys": ["k"] }), &ctx()).is_err());
        let mut p = ParseRegexProcessor::new();
        assert!(
            p.init(&json!({ "SourceKey": "content", "Regex": "(", "Keys": ["k"] }), &ctx())
                .is_err()
        );
        let mut p = ParseRegexProcessor::new();
        assert!(
            p.init(&json!({ "SourceKey": "content", "Regex": "(.*)" }), &ctx())
                .is_err()
        );
    }

    #[test]
    fn keys_accept_comma_joined_form() {
        let p = init(json!({
            "SourceKey": "content",
            "Regex": r"(\d+)\s+(\d+)",
            "Keys": ["k1,k2"]
        }));
        assert_eq!(p.keys, vec!["k1", "k2"]);
    }

    #[test]
    fn parses_capture_groups_into_keys() {
        let p = init(json!({
            "SourceKey": "content",
            "Regex": r"(\w+)\t(\w+).*",
            "Keys": ["key1", "key2"]
        }));
        let mut g = group_with_line("value1\tvalue2\trest");
        p.process(&mut g);
        assert_eq!(field(&g, "key1"), Some("value1"));
        assert_eq!(field(&g, "key2"), Some("value2"));
        assert_eq!(field(&g, "content"), None);
    }

    #[test]
    fn keeps_renamed_source_on_success_when_configured() {
        let p = init(json!({
            "SourceKey": "content",
            "Regex": r"(\w+)\t(\w+).*",
            "Keys": ["key1", "key2"],
            "KeepingSourceWhenParseSucceed": true,
            "RenamedSourceKey": "rawLog"
        }));
        let mut g = group_with_line("value1\tvalue2");
        p.process(&mut g);
        assert_eq!(field(&g, "key1"), Some("value1"));
        assert_eq!(field(&g, "rawLog"), Some("value1\tvalue2"));
    }

    #[test]
    fn unmatched_event_kept_under_renamed_key() {
        let p = init(json!({
            "SourceKey": "content",
            "Regex": r"(\d+)\t(\d+)",
            "Keys": ["key1", "key2"],
            "KeepingSourceWhenParseFail": true,
            "RenamedSourceKey": "rawLog"
        }));
        let mut g = group_with_line("not numbers");
        p.process(&mut g);
        assert_eq!(g.len(), 1);
        assert_eq!(field(&g, "rawLog"), Some("not numbers"));
        assert_eq!(field(&g, "key1"), None);
    }

    #[test]
    fn unmatched_event_discarded_by_default() {
        let p = init(json!({
            "SourceKey": "content",
            "Regex": r"(\d+)\t(\d+)",
            "Keys": ["key1", "key2"]
        }));
        let mut g = group_with_line("not numbers");
        p.process(&mut g);
        assert!(g.is_empty());
    }

    #[test]
    fn missing_source_key_counts_and_keeps_event() {
        let p = init(json!({
            "SourceKey": "content",
            "Regex": "(.*)",
            "Keys": ["content"]
        }));
        let mut g = EventGroup::new(GroupMetadata::default());
        let mut e = LogEvent::new(Timestamp::default());
        let k = g.alloc("other");
        let v = g.alloc("value");
        e.contents.push((k, v));
        g.push_event(Event::Log(e));
        p.process(&mut g);
        assert_eq!(g.len(), 1);
        assert_eq!(field(&g, "other"), Some("value"));
        assert_eq!(
            p.out_key_not_found_events_total.as_ref().unwrap().value(),
            1
        );
    }
}
