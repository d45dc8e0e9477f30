pub mod stat;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde_json::Value;

use harvester_api::config::{self, PipelineContext};
use harvester_api::error::PluginError;
use harvester_api::event::{Event, EventGroup, GroupMetadata, LogEvent, Timestamp};
use harvester_api::plugin::{Backoff, Input, InputContext, PushError};

use crate::stat::{CLK_TCK, ProcessStat, parse_boot_time, parse_stat_line};

pub const TYPE_NAME: &str = "input_host_monitor";

const KNOWN_KEYS: &[&str] = &["IntervalSecs", "TopN", "ProcPath"];

#[derive(Debug, Clone, Copy)]
struct CpuSnapshot {
    total_ticks: u64,
    at: Instant,
}

/// Singleton input emitting process entity records from `/proc`.
///
/// Each cycle walks all processes, diffs CPU ticks against the previous
/// cycle, and emits the top-N processes by CPU share.
pub struct HostMonitorInput {
    interval: Duration,
    top_n: usize,
    proc_root: PathBuf,
    /// Host boot time, read from `<proc>/stat` once and cached.
    boot_time: OnceLock<i64>,
    prev: Mutex<HashMap<i32, CpuSnapshot>>,
}

impl HostMonitorInput {
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(30),
            top_n: 20,
            proc_root: PathBuf::from("/proc"),
            boot_time: OnceLock::new(),
            prev: Mutex::new(HashMap::new()),
        }
    }

    fn boot_time(&self) -> i64 {
        *self.boot_time.get_or_init(|| {
            std::fs::read_to_string(self.proc_root.join("stat"))
                .ok()
                .and_then(|raw| parse_boot_time(&raw))
                .unwrap_or_else(|| {
                    tracing::warn!(
                        proc = %self.proc_root.display(),
                        "could not read host boot time, start times will be zero"
                    );
                    0
                })
        })
    }

    fn walk_processes(&self) -> Vec<ProcessStat> {
        let entries = match std::fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(proc = %self.proc_root.display(), error = %e, "proc walk failed");
                return Vec::new();
            }
        };
        let mut stats = Vec::new();
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            let Ok(line) = std::fs::read_to_string(entry.path().join("stat")) else {
                // The process exited between the walk and the read.
                continue;
            };
            if let Some(stat) = parse_stat_line(pid, line.trim_end()) {
                stats.push(stat);
            }
        }
        stats
    }

    /// One collection cycle: CPU percent against the previous cycle, then
    /// the top-N processes by CPU.
    fn collect(&self, config_name: &str) -> EventGroup {
        let now = Instant::now();
        let boot_time = self.boot_time();
        let mut stats = self.walk_processes();

        let mut percents: HashMap<i32, f64> = HashMap::new();
        {
            let mut prev = match self.prev.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut next = HashMap::with_capacity(stats.len());
            for stat in &stats {
                let total = stat.utime_ticks + stat.stime_ticks;
                if let Some(snapshot) = prev.get(&stat.pid) {
                    let elapsed = now.duration_since(snapshot.at).as_secs_f64();
                    if elapsed > 0.0 {
                        let delta = total.saturating_sub(snapshot.total_ticks) as f64;
                        percents.insert(stat.pid, delta / CLK_TCK as f64 / elapsed * 100.0);
                    }
                }
                next.insert(stat.pid, CpuSnapshot { total_ticks: total, at: now });
            }
            // Dead pids drop out with the map swap.
            *prev = next;
        }

        stats.sort_by(|a, b| {
            let pa = percents.get(&a.pid).copied().unwrap_or(0.0);
            let pb = percents.get(&b.pid).copied().unwrap_or(0.0);
            pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
        });
        stats.truncate(self.top_n);

        let mut group = EventGroup::new(GroupMetadata {
            config_name: config_name.to_string(),
            source: "host_monitor".to_string(),
            acquired_at: Timestamp::now(),
        });
        for stat in &stats {
            let cpu = percents.get(&stat.pid).copied().unwrap_or(0.0);
            let start_time = boot_time + (stat.start_ticks / CLK_TCK) as i64;
            let mut event = LogEvent::new(Timestamp::now());
            let mut push = |group: &mut EventGroup, event: &mut LogEvent, k: &str, v: String| {
                let key = group.alloc(k);
                let value = group.alloc(&v);
                event.contents.push((key, value));
            };
            push(&mut group, &mut event, "pid", stat.pid.to_string());
            push(&mut group, &mut event, "comm", stat.comm.clone());
            push(&mut group, &mut event, "state", stat.state.to_string());
            push(&mut group, &mut event, "ppid", stat.ppid.to_string());
            push(&mut group, &mut event, "num.threads", stat.num_threads.to_string());
            push(&mut group, &mut event, "vsize", stat.vsize.to_string());
            push(&mut group, &mut event, "rss", stat.rss.to_string());
            push(&mut group, &mut event, "processor", stat.processor.to_string());
            push(&mut group, &mut event, "cpu.percent", format!("{cpu:.2}"));
            push(&mut group, &mut event, "start.time", start_time.to_string());
            group.push_event(Event::Log(event));
        }
        group
    }
}

impl Default for HostMonitorInput {
    fn default() -> Self {
        Self::new()
    }
}

impl Input for HostMonitorInput {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn init(&mut self, config: &Value, ctx: &PipelineContext) -> Result<(), PluginError> {
        config::warn_unknown_keys(config, KNOWN_KEYS, ctx, TYPE_NAME);
        self.interval =
            Duration::from_secs(config::optional_u64(config, "IntervalSecs", 30, ctx, TYPE_NAME).max(1));
        self.top_n = config::optional_u64(config, "TopN", 20, ctx, TYPE_NAME).max(1) as usize;
        if let Some(path) = config::optional_string(config, "ProcPath", ctx, TYPE_NAME) {
            self.proc_root = PathBuf::from(path);
        }
        Ok(())
    }

    fn run(
        &self,
        ctx: InputContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        Box::pin(async move {
            let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(30));
            loop {
                if !ctx.sink.is_valid_to_push(ctx.key) {
                    backoff.wait().await;
                    continue;
                }
                let mut group = self.collect(&ctx.pipeline.config_name);
                if !group.is_empty() {
                    loop {
                        match ctx.sink.push(ctx.key, group) {
                            Ok(()) => {
                                backoff.reset();
                                break;
                            }
                            Err(PushError::QueueFull(returned)) => {
                                group = returned;
                                backoff.wait().await;
                            }
                            Err(PushError::QueueNotFound) => return Ok(()),
                        }
                    }
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fake_proc(processes: &[(i32, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stat"), "cpu  1 2 3 4\nbtime 1700000000\n").unwrap();
        for (pid, line) in processes {
            let pid_dir = dir.path().join(pid.to_string());
            std::fs::create_dir(&pid_dir).unwrap();
            std::fs::write(pid_dir.join("stat"), line).unwrap();
        }
        dir
    }

    fn stat_line(pid: i32, comm: &str, utime: u64) -> String {
        let mut fields: Vec<String> = vec![
            pid.to_string(),
            format!("({comm})"),
            "S".into(),
            "1".into(),
        ];
        // pgrp..cmajflt (fields 4..=12).
        fields.extend(std::iter::repeat_n("0".to_string(), 9));
        fields.push(utime.to_string()); // 13 utime
        fields.push("5".into()); // 14 stime
        fields.extend(["0".into(), "0".into()]); // 15, 16
        fields.extend(["20".into(), "0".into()]); // 17 priority, 18 nice
        fields.push("3".into()); // 19 num_threads
        fields.push("0".into()); // 20
        fields.push("4200".into()); // 21 starttime
        fields.push("10000000".into()); // 22 vsize
        fields.push("250".into()); // 23 rss
        // rsslim..exit_signal (fields 24..=37).
        fields.extend(std::iter::repeat_n("0".to_string(), 14));
        fields.push("2".into()); // 38 processor
        fields.extend(["0".into(), "0".into()]); // trailing fields
        fields.join(" ")
    }

    fn input(dir: &tempfile::TempDir, top_n: u64) -> HostMonitorInput {
        let mut input = HostMonitorInput::new();
        input
            .init(
                &json!({ "ProcPath": dir.path(), "TopN": top_n }),
                &PipelineContext::new("test_config"),
            )
            .unwrap();
        input
    }

    #[test]
    fn collects_process_entities() {
        let dir = fake_proc(&[
            (10, &stat_line(10, "init", 100)),
            (20, &stat_line(20, "tmux: server", 200)),
        ]);
        let input = input(&dir, 20);
        let group = input.collect("test_config");
        assert_eq!(group.len(), 2);

        let comms: Vec<&str> = group
            .events()
            .iter()
            .map(|e| {
                let Event::Log(log) = e else { panic!("expected log") };
                group.log_field(log, "comm").unwrap()
            })
            .collect();
        // Bracketed comm with a space inside survives parsing.
        assert!(comms.contains(&"tmux: server"));

        let Event::Log(log) = &group.events()[0] else {
            panic!("expected log")
        };
        assert_eq!(group.log_field(log, "processor"), Some("2"));
        // btime 1700000000 + 4200 ticks / 100 Hz.
        assert_eq!(group.log_field(log, "start.time"), Some("1700000042"));
    }

    #[test]
    fn top_n_limits_output() {
        let dir = fake_proc(&[
            (10, &stat_line(10, "a", 1)),
            (20, &stat_line(20, "b", 2)),
            (30, &stat_line(30, "c", 3)),
        ]);
        let input = input(&dir, 2);
        let group = input.collect("test_config");
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn cpu_percent_uses_previous_cycle() {
        let dir = fake_proc(&[(10, &stat_line(10, "busy", 100))]);
        let input = input(&dir, 20);
        input.collect("test_config");

        // Second cycle: 50 extra ticks.
        std::fs::write(
            dir.path().join("10").join("stat"),
            stat_line(10, "busy", 150),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let group = input.collect("test_config");
        let Event::Log(log) = &group.events()[0] else {
            panic!("expected log")
        };
        let cpu: f64 = group.log_field(log, "cpu.percent").unwrap().parse().unwrap();
        assert!(cpu > 0.0);
    }
}
