//! Phase descriptors and the static phase registry.
//!
//! Every run executes the same ordered pipeline. Phases are immutable
//! descriptors created once at process start; the registry is a pure lookup
//! table with no behavior of its own.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// A single named unit of orchestrated work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    /// Ordinal phase id; phases execute in ascending id order.
    pub id: u32,
    /// Short machine name (e.g. "config-render")
    pub name: String,
    /// Human-readable description shown in `list-phases`
    pub description: String,
    /// Ids of phases that must be complete before this one runs
    #[serde(default)]
    pub depends_on: Vec<u32>,
    /// Whether the pipeline can safely be restarted from this phase
    #[serde(default)]
    pub safe_restart_point: bool,
    /// Whether this phase's effects derive from the digested input files.
    /// A content-digest mismatch invalidates completions from the first
    /// digest-sensitive phase onward.
    #[serde(default)]
    pub digest_sensitive: bool,
}

impl Phase {
    pub fn new(id: u32, name: &str, description: &str, depends_on: Vec<u32>) -> Self {
        Self {
            id,
            name: name.to_string(),
            description: description.to_string(),
            depends_on,
            safe_restart_point: false,
            digest_sensitive: false,
        }
    }

    pub fn safe_restart(mut self) -> Self {
        self.safe_restart_point = true;
        self
    }

    pub fn digest_sensitive(mut self) -> Self {
        self.digest_sensitive = true;
        self
    }
}

/// Ordered, static table of all pipeline phases.
#[derive(Debug, Clone)]
pub struct PhaseRegistry {
    phases: Vec<Phase>,
}

impl PhaseRegistry {
    /// The standard deployment pipeline.
    pub fn standard() -> Self {
        Self {
            phases: vec![
                Phase::new(1, "preflight", "Host sanity checks (disk, network, privileges)", vec![])
                    .safe_restart(),
                Phase::new(2, "base-packages", "Install the base package set", vec![1]),
                Phase::new(3, "config-render", "Render configuration templates", vec![1])
                    .digest_sensitive(),
                Phase::new(4, "secrets", "Generate and install missing secrets", vec![3])
                    .digest_sensitive(),
                Phase::new(5, "hardware", "Detect GPU/CPU and record the hardware profile", vec![2]),
                Phase::new(6, "services", "Enable and start host services", vec![3, 4])
                    .digest_sensitive(),
                Phase::new(7, "cluster", "Bootstrap the workload cluster", vec![6]).safe_restart(),
                Phase::new(8, "workloads", "Deploy cluster workloads", vec![7]).digest_sensitive(),
                Phase::new(9, "verify", "End-to-end verification of the deployed host", vec![8]),
            ],
        }
    }

    /// Build a registry from an explicit table. Used by tests.
    pub fn from_phases(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn get(&self, id: u32) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn dependencies_of(&self, id: u32) -> Vec<u32> {
        self.get(id).map(|p| p.depends_on.clone()).unwrap_or_default()
    }

    pub fn is_safe_restart_point(&self, id: u32) -> bool {
        self.get(id).map(|p| p.safe_restart_point).unwrap_or(false)
    }

    /// First phase whose effects derive from the digested inputs.
    /// Completions from this phase onward are stale after a digest change.
    pub fn first_digest_sensitive(&self) -> Option<u32> {
        self.phases.iter().find(|p| p.digest_sensitive).map(|p| p.id)
    }

    pub fn last_id(&self) -> Option<u32> {
        self.phases.last().map(|p| p.id)
    }

    /// Check table consistency: ids strictly ascending and every dependency
    /// names an earlier phase in the table.
    pub fn validate(&self) -> Result<()> {
        let mut prev: Option<u32> = None;
        for phase in &self.phases {
            if let Some(prev) = prev {
                if phase.id <= prev {
                    bail!("phase ids must be strictly ascending: {} follows {}", phase.id, prev);
                }
            }
            for dep in &phase.depends_on {
                if *dep >= phase.id {
                    bail!("phase {} depends on {}, which does not precede it", phase.id, dep);
                }
                if self.get(*dep).is_none() {
                    bail!("phase {} depends on unknown phase {}", phase.id, dep);
                }
            }
            prev = Some(phase.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_is_valid() {
        let registry = PhaseRegistry::standard();
        registry.validate().unwrap();
        assert_eq!(registry.phases().first().unwrap().id, 1);
        assert_eq!(registry.last_id(), Some(9));
    }

    #[test]
    fn get_and_dependencies_of() {
        let registry = PhaseRegistry::standard();
        let services = registry.get(6).unwrap();
        assert_eq!(services.name, "services");
        assert_eq!(registry.dependencies_of(6), vec![3, 4]);
        assert!(registry.dependencies_of(99).is_empty());
    }

    #[test]
    fn safe_restart_points_are_marked() {
        let registry = PhaseRegistry::standard();
        assert!(registry.is_safe_restart_point(1));
        assert!(registry.is_safe_restart_point(7));
        assert!(!registry.is_safe_restart_point(4));
        assert!(!registry.is_safe_restart_point(99));
    }

    #[test]
    fn first_digest_sensitive_is_config_render() {
        let registry = PhaseRegistry::standard();
        assert_eq!(registry.first_digest_sensitive(), Some(3));
    }

    #[test]
    fn validate_rejects_forward_dependency() {
        let registry = PhaseRegistry::from_phases(vec![
            Phase::new(1, "a", "first", vec![]),
            Phase::new(2, "b", "second", vec![3]),
        ]);
        let err = registry.validate().unwrap_err().to_string();
        assert!(err.contains("does not precede"), "unexpected error: {err}");
    }

    #[test]
    fn validate_rejects_unordered_ids() {
        let registry = PhaseRegistry::from_phases(vec![
            Phase::new(2, "b", "second", vec![]),
            Phase::new(1, "a", "first", vec![]),
        ]);
        assert!(registry.validate().is_err());
    }

    #[test]
    fn phase_serialization_roundtrip() {
        let phase = Phase::new(3, "config-render", "Render templates", vec![1]).digest_sensitive();
        let json = serde_json::to_string(&phase).unwrap();
        let parsed: Phase = serde_json::from_str(&json).unwrap();
        assert_eq!(phase, parsed);
    }

    #[test]
    fn phase_deserialization_defaults_optional_fields() {
        let json = r#"{"id": 1, "name": "preflight", "description": "checks"}"#;
        let phase: Phase = serde_json::from_str(json).unwrap();
        assert!(phase.depends_on.is_empty());
        assert!(!phase.safe_restart_point);
        assert!(!phase.digest_sensitive);
    }
}
