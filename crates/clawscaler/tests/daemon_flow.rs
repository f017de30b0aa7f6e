//! Daemon integration tests.
//!
//! These run a full daemon against an in-memory metric source and control
//! plane and talk to it over its status listener.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use claw_autoscaler::{InMemoryControlPlane, WorkloadId};
use claw_metrics::{
    now_millis, InMemorySource, LabelSet, MetricName, MetricSource, Observation, SeriesId,
};
use clawscaler::{Daemon, DaemonConfig, RunningDaemon, SourceConfig};

const POLICIES: &str = r#"{
    "version": 1,
    "policies": [
        {
            "workload": "web",
            "min_replicas": 2,
            "max_replicas": 5,
            "metrics": [
                {
                    "name": "cpu",
                    "selector": "pod_cpu_utilization{app=\"web\"}",
                    "kind": "gauge",
                    "mode": "average_value",
                    "target": 50
                }
            ]
        }
    ]
}"#;

// ============================================================================
// Helpers
// ============================================================================

fn policy_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Two pods reporting `value` over the last ten seconds.
fn report_cpu(source: &InMemorySource, value: f64) {
    source.store().clear();
    let name = MetricName::new("pod_cpu_utilization").unwrap();
    let now = now_millis();
    for pod in ["web-0", "web-1"] {
        let labels = LabelSet::new().with("app", "web").with("kubernetes_pod_name", pod);
        let id = SeriesId::new(name.clone(), labels);
        source.store().push_all(
            &id,
            [Observation::new(now - 10_000, value), Observation::new(now, value)],
        );
    }
}

struct Harness {
    source: Arc<InMemorySource>,
    control_plane: Arc<InMemoryControlPlane>,
    running: RunningDaemon,
    token: tokio_util::sync::CancellationToken,
    _policies: tempfile::NamedTempFile,
}

impl Harness {
    async fn start() -> Self {
        let policies = policy_file(POLICIES);
        let mut config = DaemonConfig::new(policies.path());
        config.source = SourceConfig::InMemory;
        config.period_secs = 1;
        config.listen_addr = Some(SocketAddr::from(([127, 0, 0, 1], 0)));

        let source = Arc::new(InMemorySource::new());
        let control_plane = Arc::new(InMemoryControlPlane::new());
        let daemon = Daemon::new(config)
            .unwrap()
            .with_source(Arc::clone(&source) as Arc<dyn MetricSource>)
            .with_control_plane(Arc::clone(&control_plane));
        let token = daemon.shutdown_token();
        let running = daemon.start().await.unwrap();

        Self {
            source,
            control_plane,
            running,
            token,
            _policies: policies,
        }
    }

    fn url(&self, path: &str) -> String {
        let addr = self.running.status_addr().unwrap();
        format!("http://{addr}{path}")
    }

    fn replicas(&self) -> u32 {
        self.control_plane.current(&WorkloadId::new("web")).unwrap()
    }

    async fn stop(self) {
        self.token.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.running.wait())
            .await
            .unwrap()
            .unwrap();
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn dry_run_starts_at_minimum() {
    let h = Harness::start().await;
    assert_eq!(h.replicas(), 2);
    h.stop().await;
}

#[tokio::test]
async fn high_load_scales_up() {
    let h = Harness::start().await;
    report_cpu(&h.source, 100.0);

    let source = Arc::clone(&h.source);
    let control_plane = Arc::clone(&h.control_plane);
    let scaled = wait_for(|| {
        // Keep the gauge fresh between ticks.
        report_cpu(&source, 100.0);
        control_plane.current(&WorkloadId::new("web")).unwrap_or(0) > 2
    })
    .await;
    assert!(scaled, "workload never scaled up");
    assert!(h.replicas() <= 5);

    h.stop().await;
}

#[tokio::test]
async fn status_endpoint_reports_workloads() {
    let h = Harness::start().await;
    report_cpu(&h.source, 50.0);

    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .get(h.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["workload"], "web");

    let metrics = client.get(h.url("/metrics")).send().await.unwrap().text().await.unwrap();
    assert!(metrics.contains("clawscaler_"));

    h.stop().await;
}

#[tokio::test]
async fn no_metrics_keeps_replicas() {
    let h = Harness::start().await;
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(h.replicas(), 2);
    assert_eq!(h.control_plane.change_count(&WorkloadId::new("web")), 0);
    h.stop().await;
}
