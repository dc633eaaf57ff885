//! Bounded self-healing for missing-artifact workload failures.
//!
//! A recurring failure class on managed clusters: workloads stuck in image
//! pull loops because the artifact they reference is gone from the local
//! registry. The loop enumerates the failing workloads, maps each missing
//! reference to a rebuildable unit through a static table, rebuilds the
//! deduplicated set, republishes grouped by tag, restarts the consumers,
//! and re-verifies each one with a single bounded retry. Partial success is
//! reported per consumer, never silently swallowed.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::context::CommandRunner;
use crate::util::retry;

/// A workload failing because its backing artifact is unavailable.
#[derive(Debug, Clone, PartialEq)]
pub struct FailingWorkload {
    /// Consumer name (deployment) to restart after republish
    pub name: String,
    /// Missing artifact reference, e.g. `registry.local/auth-service:v3`
    pub artifact_ref: String,
}

/// Cluster operations seam.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Workloads currently failing on a missing artifact, with the
    /// reference they could not resolve.
    async fn failing_workloads(&self) -> Result<Vec<FailingWorkload>>;
    async fn rebuild(&self, unit: &str) -> Result<()>;
    async fn publish(&self, unit: &str, tag: &str) -> Result<()>;
    async fn restart(&self, consumer: &str) -> Result<()>;
    async fn is_healthy(&self, consumer: &str) -> Result<bool>;
}

/// Static mapping from artifact references to rebuildable units.
/// References that match no rule are reported and skipped.
pub struct RebuildRule {
    /// Matches when the artifact reference (sans tag) ends with this name
    pub artifact: &'static str,
    /// Build unit handed to the build command
    pub unit: &'static str,
}

pub const REBUILD_RULES: &[RebuildRule] = &[
    RebuildRule { artifact: "auth-service", unit: "auth-service" },
    RebuildRule { artifact: "media-index", unit: "media-index" },
    RebuildRule { artifact: "media-ui", unit: "media-ui" },
    RebuildRule { artifact: "backup-agent", unit: "backup-agent" },
];

/// Transient repair plan derived from the failing set. Never persisted.
#[derive(Debug, Default, PartialEq)]
pub struct RepairPlan {
    /// Deduplicated units to rebuild
    pub rebuilds: BTreeSet<String>,
    /// tag -> units: each (unit, tag) pair is published exactly once
    pub publishes: BTreeMap<String, BTreeSet<String>>,
    /// Consumers to restart after publish, in first-seen order
    pub restarts: Vec<String>,
    /// Workloads whose reference matched no rebuild rule
    pub unrecognized: Vec<FailingWorkload>,
}

impl RepairPlan {
    /// Build a plan from the failing workloads.
    pub fn build(failing: &[FailingWorkload]) -> Self {
        let mut plan = Self::default();
        for workload in failing {
            let (artifact, tag) = split_ref(&workload.artifact_ref);
            let Some(rule) = REBUILD_RULES.iter().find(|r| artifact_matches(artifact, r.artifact))
            else {
                plan.unrecognized.push(workload.clone());
                continue;
            };
            plan.rebuilds.insert(rule.unit.to_string());
            plan.publishes
                .entry(tag.to_string())
                .or_default()
                .insert(rule.unit.to_string());
            if !plan.restarts.contains(&workload.name) {
                plan.restarts.push(workload.name.clone());
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.rebuilds.is_empty() && self.unrecognized.is_empty()
    }
}

/// `registry.local/auth-service:v3` -> (`registry.local/auth-service`, `v3`)
fn split_ref(artifact_ref: &str) -> (&str, &str) {
    match artifact_ref.rsplit_once(':') {
        // A colon before the last slash is a registry port, not a tag
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (artifact_ref, "latest"),
    }
}

fn artifact_matches(artifact: &str, rule_name: &str) -> bool {
    artifact == rule_name || artifact.ends_with(&format!("/{rule_name}"))
}

/// Outcome of one healing pass, reported per consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct HealReport {
    pub recovered: Vec<String>,
    pub unrecovered: Vec<String>,
    /// Workload names whose reference matched no rebuild rule
    pub skipped: Vec<String>,
}

impl HealReport {
    pub fn clean() -> Self {
        Self { recovered: Vec::new(), unrecovered: Vec::new(), skipped: Vec::new() }
    }

    /// The pass converged: every restarted consumer reports healthy.
    /// Skipped (unrecognized) workloads do not count as convergence
    /// failures; they are surfaced separately.
    pub fn converged(&self) -> bool {
        self.unrecovered.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} recovered, {} unrecovered, {} unrecognized",
            self.recovered.len(),
            self.unrecovered.len(),
            self.skipped.len()
        )
    }
}

pub struct SelfHealer {
    ops: Arc<dyn ClusterOps>,
    /// Delay before a consumer's single bounded re-check
    verify_delay: Duration,
}

impl SelfHealer {
    pub fn new(ops: Arc<dyn ClusterOps>, verify_delay: Duration) -> Self {
        Self { ops, verify_delay }
    }

    /// One healing pass. Errors only on infrastructure failures (listing,
    /// rebuild, publish); consumers that stay unhealthy after the bounded
    /// retry are reported in the result, not as an error.
    pub async fn heal(&self) -> Result<HealReport> {
        let failing = self
            .ops
            .failing_workloads()
            .await
            .context("failed to enumerate failing workloads")?;
        if failing.is_empty() {
            info!("self-heal: nothing is failing");
            return Ok(HealReport::clean());
        }

        let plan = RepairPlan::build(&failing);
        for workload in &plan.unrecognized {
            warn!(
                workload = %workload.name,
                artifact = %workload.artifact_ref,
                "no rebuild rule for artifact; skipping"
            );
        }
        if plan.rebuilds.is_empty() {
            // Nothing rebuildable: report, do not pretend to converge.
            return Ok(HealReport {
                recovered: Vec::new(),
                unrecovered: Vec::new(),
                skipped: plan.unrecognized.iter().map(|w| w.name.clone()).collect(),
            });
        }

        info!(
            rebuilds = plan.rebuilds.len(),
            consumers = plan.restarts.len(),
            "self-heal: rebuilding missing artifacts"
        );
        for unit in &plan.rebuilds {
            self.ops
                .rebuild(unit)
                .await
                .with_context(|| format!("rebuild of {unit} failed"))?;
        }
        for (tag, units) in &plan.publishes {
            for unit in units {
                self.ops
                    .publish(unit, tag)
                    .await
                    .with_context(|| format!("publish of {unit}:{tag} failed"))?;
            }
        }
        for consumer in &plan.restarts {
            self.ops
                .restart(consumer)
                .await
                .with_context(|| format!("restart of {consumer} failed"))?;
        }

        let mut report = HealReport::clean();
        report.skipped = plan.unrecognized.iter().map(|w| w.name.clone()).collect();
        for consumer in &plan.restarts {
            let healthy = retry(2, self.verify_delay, 1.0, || async move {
                match self.ops.is_healthy(consumer).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(anyhow::anyhow!("{consumer} not healthy yet")),
                    Err(err) => Err(err),
                }
            })
            .await
            .is_ok();

            if healthy {
                report.recovered.push(consumer.clone());
            } else {
                warn!(consumer = %consumer, "consumer did not recover after bounded retry");
                report.unrecovered.push(consumer.clone());
            }
        }
        info!(summary = %report.summary(), "self-heal pass finished");
        Ok(report)
    }
}

/// Production cluster ops over kubectl and the configured build/publish
/// commands.
pub struct KubeClusterOps {
    runner: Arc<dyn CommandRunner>,
    kubectl: String,
    build_cmd: String,
    publish_cmd: String,
}

impl KubeClusterOps {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        kubectl: String,
        build_cmd: String,
        publish_cmd: String,
    ) -> Self {
        Self { runner, kubectl, build_cmd, publish_cmd }
    }
}

#[async_trait]
impl ClusterOps for KubeClusterOps {
    async fn failing_workloads(&self) -> Result<Vec<FailingWorkload>> {
        // owner-name, status, image for every pod; one pod per line
        let output = self
            .runner
            .run(
                &self.kubectl,
                &[
                    "get", "pods", "--all-namespaces", "--no-headers",
                    "-o",
                    "custom-columns=OWNER:.metadata.labels.app,STATUS:.status.containerStatuses[0].state.waiting.reason,IMAGE:.spec.containers[0].image",
                ],
            )
            .await?;
        if !output.success() {
            bail!("kubectl pod listing failed: {}", output.stderr.trim());
        }
        Ok(parse_failing_pods(&output.stdout))
    }

    async fn rebuild(&self, unit: &str) -> Result<()> {
        let output = self.runner.run(&self.build_cmd, &[unit]).await?;
        if !output.success() {
            bail!("{} {unit} failed: {}", self.build_cmd, output.stderr.trim());
        }
        Ok(())
    }

    async fn publish(&self, unit: &str, tag: &str) -> Result<()> {
        let output = self.runner.run(&self.publish_cmd, &[unit, tag]).await?;
        if !output.success() {
            bail!("{} {unit} {tag} failed: {}", self.publish_cmd, output.stderr.trim());
        }
        Ok(())
    }

    async fn restart(&self, consumer: &str) -> Result<()> {
        let target = format!("deployment/{consumer}");
        let output = self
            .runner
            .run(&self.kubectl, &["rollout", "restart", &target])
            .await?;
        if !output.success() {
            bail!("restart of {consumer} failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn is_healthy(&self, consumer: &str) -> Result<bool> {
        let target = format!("deployment/{consumer}");
        let output = self
            .runner
            .run(&self.kubectl, &["rollout", "status", &target, "--timeout=30s"])
            .await?;
        Ok(output.success())
    }
}

/// Workloads in an image-pull failure state, from the custom-columns
/// listing above.
fn parse_failing_pods(stdout: &str) -> Vec<FailingWorkload> {
    stdout
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let (owner, status, image) = (cols.first()?, cols.get(1)?, cols.get(2)?);
            if *status == "ImagePullBackOff" || *status == "ErrImagePull" {
                Some(FailingWorkload {
                    name: (*owner).to_string(),
                    artifact_ref: (*image).to_string(),
                })
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted cluster with controllable recovery behavior:
    /// a consumer recovers once the cluster has seen `heal_after` health
    /// checks for it.
    struct FakeCluster {
        failing: Vec<FailingWorkload>,
        rebuilds: Mutex<Vec<String>>,
        publishes: Mutex<Vec<(String, String)>>,
        restarts: Mutex<Vec<String>>,
        health_checks: Mutex<BTreeMap<String, u32>>,
        heal_after: BTreeMap<String, u32>,
    }

    impl FakeCluster {
        fn new(failing: Vec<FailingWorkload>) -> Self {
            Self {
                failing,
                rebuilds: Mutex::new(Vec::new()),
                publishes: Mutex::new(Vec::new()),
                restarts: Mutex::new(Vec::new()),
                health_checks: Mutex::new(BTreeMap::new()),
                heal_after: BTreeMap::new(),
            }
        }

        fn heal_after(mut self, consumer: &str, checks: u32) -> Self {
            self.heal_after.insert(consumer.to_string(), checks);
            self
        }
    }

    #[async_trait]
    impl ClusterOps for FakeCluster {
        async fn failing_workloads(&self) -> Result<Vec<FailingWorkload>> {
            Ok(self.failing.clone())
        }

        async fn rebuild(&self, unit: &str) -> Result<()> {
            self.rebuilds.lock().unwrap().push(unit.to_string());
            Ok(())
        }

        async fn publish(&self, unit: &str, tag: &str) -> Result<()> {
            self.publishes.lock().unwrap().push((unit.to_string(), tag.to_string()));
            Ok(())
        }

        async fn restart(&self, consumer: &str) -> Result<()> {
            self.restarts.lock().unwrap().push(consumer.to_string());
            Ok(())
        }

        async fn is_healthy(&self, consumer: &str) -> Result<bool> {
            let mut checks = self.health_checks.lock().unwrap();
            let seen = checks.entry(consumer.to_string()).or_insert(0);
            *seen += 1;
            let needed = self.heal_after.get(consumer).copied().unwrap_or(1);
            Ok(*seen >= needed)
        }
    }

    fn failing(name: &str, artifact: &str) -> FailingWorkload {
        FailingWorkload { name: name.to_string(), artifact_ref: artifact.to_string() }
    }

    fn healer(cluster: Arc<FakeCluster>) -> SelfHealer {
        SelfHealer::new(cluster, Duration::from_millis(1))
    }

    #[test]
    fn split_ref_handles_tags_and_registry_ports() {
        assert_eq!(split_ref("registry.local/auth-service:v3"), ("registry.local/auth-service", "v3"));
        assert_eq!(split_ref("auth-service"), ("auth-service", "latest"));
        assert_eq!(
            split_ref("registry.local:5000/media-ui"),
            ("registry.local:5000/media-ui", "latest")
        );
    }

    #[test]
    fn plan_deduplicates_shared_rebuilds_and_groups_by_tag() {
        let plan = RepairPlan::build(&[
            failing("auth-a", "registry.local/auth-service:v3"),
            failing("auth-b", "registry.local/auth-service:v3"),
            failing("index", "registry.local/media-index:v3"),
            failing("mystery", "registry.local/unknown-thing:v1"),
        ]);

        assert_eq!(plan.rebuilds.len(), 2, "shared rebuild counted once");
        let v3_units = plan.publishes.get("v3").unwrap();
        assert_eq!(v3_units.len(), 2);
        assert_eq!(plan.restarts, vec!["auth-a", "auth-b", "index"]);
        assert_eq!(plan.unrecognized.len(), 1);
        assert_eq!(plan.unrecognized[0].name, "mystery");
    }

    #[tokio::test]
    async fn heal_with_nothing_failing_is_a_clean_converged_report() {
        let cluster = Arc::new(FakeCluster::new(vec![]));
        let report = healer(cluster).heal().await.unwrap();
        assert!(report.converged());
        assert!(report.recovered.is_empty());
    }

    #[tokio::test]
    async fn heal_rebuilds_publishes_restarts_and_reports_recovery() {
        let cluster = Arc::new(FakeCluster::new(vec![
            failing("auth-a", "registry.local/auth-service:v3"),
            failing("index", "registry.local/media-index:v3"),
        ]));
        let report = healer(cluster.clone()).heal().await.unwrap();

        assert_eq!(cluster.rebuilds.lock().unwrap().len(), 2);
        // Each (unit, tag) published exactly once
        let publishes = cluster.publishes.lock().unwrap();
        assert_eq!(publishes.len(), 2);
        assert!(publishes.contains(&("auth-service".to_string(), "v3".to_string())));
        assert_eq!(cluster.restarts.lock().unwrap().len(), 2);

        assert!(report.converged());
        assert_eq!(report.recovered, vec!["auth-a", "index"]);
    }

    #[tokio::test]
    async fn slow_consumer_recovers_on_the_bounded_retry() {
        let cluster = Arc::new(
            FakeCluster::new(vec![failing("auth-a", "registry.local/auth-service:v3")])
                .heal_after("auth-a", 2),
        );
        let report = healer(cluster.clone()).heal().await.unwrap();

        assert!(report.converged());
        assert_eq!(*cluster.health_checks.lock().unwrap().get("auth-a").unwrap(), 2);
    }

    #[tokio::test]
    async fn stuck_consumer_is_reported_not_swallowed() {
        let cluster = Arc::new(
            FakeCluster::new(vec![
                failing("auth-a", "registry.local/auth-service:v3"),
                failing("index", "registry.local/media-index:v3"),
            ])
            .heal_after("index", 99),
        );
        let report = healer(cluster.clone()).heal().await.unwrap();

        assert!(!report.converged());
        assert_eq!(report.recovered, vec!["auth-a"]);
        assert_eq!(report.unrecovered, vec!["index"]);
        // Exactly one extra attempt for the stuck consumer
        assert_eq!(*cluster.health_checks.lock().unwrap().get("index").unwrap(), 2);
    }

    #[tokio::test]
    async fn all_unrecognized_refs_skip_the_rebuild_entirely() {
        let cluster = Arc::new(FakeCluster::new(vec![failing(
            "mystery",
            "registry.local/unknown:v1",
        )]));
        let report = healer(cluster.clone()).heal().await.unwrap();

        assert!(cluster.rebuilds.lock().unwrap().is_empty());
        assert_eq!(report.skipped, vec!["mystery"]);
        assert!(report.converged(), "unrecognized refs are not convergence failures");
    }

    #[test]
    fn parse_failing_pods_picks_image_pull_states() {
        let stdout = "\
auth-a   ImagePullBackOff   registry.local/auth-service:v3
web      <none>             registry.local/web:v1
index    ErrImagePull       registry.local/media-index:v3
";
        let found = parse_failing_pods(stdout);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "auth-a");
        assert_eq!(found[1].artifact_ref, "registry.local/media-index:v3");
    }

    #[test]
    fn heal_report_summary_counts_each_class() {
        let report = HealReport {
            recovered: vec!["a".into()],
            unrecovered: vec!["b".into(), "c".into()],
            skipped: vec![],
        };
        assert_eq!(report.summary(), "1 recovered, 2 unrecovered, 0 unrecognized");
        assert!(!report.converged());
    }
}
