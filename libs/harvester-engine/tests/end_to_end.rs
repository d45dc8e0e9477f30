//! Whole-agent flow with the built-in plugins: container discovery input →
//! tag processor → file flusher, through the real queues and timers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use harvester_engine::agent::Agent;
use harvester_engine::config::AgentConfig;
use harvester_engine::registry::PluginRegistry;

async fn wait_for_file(path: &std::path::Path, deadline: Duration) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovery_records_reach_the_file_sink() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("containers.json");
    let out_file = dir.path().join("out.log");
    std::fs::write(
        &state_file,
        json!([
            {
                "id": "c1", "name": "web-ctr",
                "k8s_labels": { "app": "web-1", "env": "prod" }
            },
            {
                "id": "c2", "name": "api-ctr",
                "k8s_labels": { "app": "api", "env": "prod" }
            }
        ])
        .to_string(),
    )
    .unwrap();

    let registry = Arc::new(PluginRegistry::new());
    registry.load(&[]).unwrap();

    let config = AgentConfig::parse(
        &json!({
            "worker_threads": 1,
            "pipelines": [{
                "name": "containers",
                "priority": 0,
                "inputs": [{
                    "Type": "input_container_discovery",
                    "StateFile": state_file,
                    "IntervalSecs": 1,
                    "ContainerFilters": {
                        "IncludeK8sLabel": { "app": "^web-.*$", "env": "prod" }
                    }
                }],
                "processors": [{ "Type": "processor_tag", "Hostname": "host-1" }],
                "flushers": [{
                    "Type": "flusher_file",
                    "Path": out_file,
                    "FlushTimeoutSecs": 0
                }]
            }]
        })
        .to_string(),
    )
    .unwrap();

    let agent = Agent::bootstrap(config, registry).await.unwrap();
    let runtime = agent.runtime().clone();
    assert!(
        wait_for_file(&out_file, Duration::from_secs(5)).await,
        "no output written within the deadline"
    );
    agent.shutdown().await;

    let written = std::fs::read_to_string(&out_file).unwrap();
    let first: Value = serde_json::from_str(written.lines().next().unwrap()).unwrap();
    assert_eq!(first["kind"], "log");
    assert_eq!(first["contents"]["container.id"], "c1");
    // The excluded container never shows up.
    assert!(!written.contains("c2"));
    // The tag processor ran before the flusher.
    assert_eq!(first["tags"]["host.name"], "host-1");

    // Every plugin instance reported through the metrics snapshot.
    let snapshot = runtime.metrics.snapshot();
    for plugin_type in ["input_container_discovery", "processor_tag", "flusher_file"] {
        assert!(
            snapshot.iter().any(|record| {
                record.labels.iter().any(|(k, v)| k == "plugin_type" && v == plugin_type)
            }),
            "no metrics record for {plugin_type}"
        );
    }
}
