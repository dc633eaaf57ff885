//! Durable run state: which phases completed, health-check history, and the
//! content digest used for staleness detection.
//!
//! The state file is the single unit of truth for resume. Every mutation goes
//! through an atomic read-modify-write (write to a temp file, rename over the
//! original) so an interrupted run never leaves a torn record. The store
//! assumes a single writer; cross-process exclusion is the lock manager's job.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::health::HealthStatus;
use crate::phase::PhaseRegistry;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletedStep {
    pub step: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckEntry {
    pub phase: u32,
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub message: String,
}

/// The persisted state record, serialized as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub schema_version: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_steps: Vec<CompletedStep>,
    pub health_checks: Vec<HealthCheckEntry>,
    pub last_error: Option<String>,
    pub last_exit_code: Option<i32>,
    pub content_digest: Option<String>,
}

impl Default for StateRecord {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            started_at: None,
            completed_steps: Vec::new(),
            health_checks: Vec::new(),
            last_error: None,
            last_exit_code: None,
            content_digest: None,
        }
    }
}

impl StateRecord {
    pub fn is_complete(&self, step: u32) -> bool {
        self.completed_steps.iter().any(|s| s.step == step)
    }

    /// First phase id not present in `completed_steps`, scanning the
    /// registry in order. `None` when every phase is complete.
    pub fn first_incomplete(&self, registry: &PhaseRegistry) -> Option<u32> {
        registry
            .phases()
            .iter()
            .find(|p| !self.is_complete(p.id))
            .map(|p| p.id)
    }

    /// Most recent recorded health outcome for a phase.
    pub fn last_health(&self, phase: u32) -> Option<&HealthCheckEntry> {
        self.health_checks.iter().rev().find(|h| h.phase == phase)
    }
}

/// Owner of the persisted state file. All mutators persist atomically.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, creating a default one if the file is absent.
    pub fn load(&self) -> Result<StateRecord> {
        if !self.path.exists() {
            return Ok(StateRecord::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))
    }

    /// Persist `record` via temp-file-then-rename.
    pub fn save(&self, record: &StateRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }
        let content =
            serde_json::to_string_pretty(record).context("Failed to serialize state record")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write temp state file: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut StateRecord)) -> Result<()> {
        let mut record = self.load()?;
        f(&mut record);
        self.save(&record)
    }

    /// Stamp `started_at` on the first run.
    pub fn ensure_started(&self) -> Result<()> {
        self.update(|r| {
            if r.started_at.is_none() {
                r.started_at = Some(Utc::now());
            }
        })
    }

    /// Mark a step complete. A step appears at most once; re-marking
    /// refreshes its timestamp.
    pub fn mark_complete(&self, step: u32) -> Result<()> {
        self.update(|r| {
            r.completed_steps.retain(|s| s.step != step);
            r.completed_steps.push(CompletedStep { step, completed_at: Utc::now() });
            r.completed_steps.sort_by_key(|s| s.step);
        })
    }

    pub fn is_complete(&self, step: u32) -> Result<bool> {
        Ok(self.load()?.is_complete(step))
    }

    pub fn record_health_check(&self, phase: u32, status: HealthStatus, message: &str) -> Result<()> {
        self.update(|r| {
            r.health_checks.push(HealthCheckEntry {
                phase,
                status,
                checked_at: Utc::now(),
                message: message.to_string(),
            });
        })
    }

    pub fn record_error(&self, message: &str, exit_code: i32) -> Result<()> {
        self.update(|r| {
            r.last_error = Some(message.to_string());
            r.last_exit_code = Some(exit_code);
        })
    }

    pub fn digest(&self) -> Result<Option<String>> {
        Ok(self.load()?.content_digest)
    }

    pub fn set_digest(&self, digest: &str) -> Result<()> {
        self.update(|r| r.content_digest = Some(digest.to_string()))
    }

    /// Drop completion markers for every step >= `min_phase`.
    /// Used by drift repair and digest invalidation.
    pub fn remove_steps_from(&self, min_phase: u32) -> Result<Vec<u32>> {
        let mut removed = Vec::new();
        self.update(|r| {
            removed = r
                .completed_steps
                .iter()
                .filter(|s| s.step >= min_phase)
                .map(|s| s.step)
                .collect();
            r.completed_steps.retain(|s| s.step < min_phase);
        })?;
        Ok(removed)
    }

    /// Archive the current state file with a timestamp suffix and start fresh.
    /// Returns the archive path when a file existed.
    pub fn reset(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let archive = self.path.with_extension(format!("json.{stamp}.bak"));
        fs::rename(&self.path, &archive)
            .with_context(|| format!("Failed to archive state file to {}", archive.display()))?;
        Ok(Some(archive))
    }
}

/// Digest of the phase-defining inputs (templates, deploy config).
///
/// Stable across runs: files are hashed in sorted relative-path order,
/// path bytes included so renames change the digest. A missing inputs
/// directory hashes to the digest of the empty set.
pub fn compute_digest(inputs_dir: &Path) -> Result<String> {
    let mut files: Vec<PathBuf> = Vec::new();
    if inputs_dir.is_dir() {
        for entry in WalkDir::new(inputs_dir) {
            let entry = entry.with_context(|| {
                format!("Failed to walk inputs directory: {}", inputs_dir.display())
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    for file in &files {
        let rel = file.strip_prefix(inputs_dir).unwrap_or(file);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let bytes = fs::read(file)
            .with_context(|| format!("Failed to read digest input: {}", file.display()))?;
        hasher.update(&bytes);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare the recorded digest against the current one.
///
/// Returns the first phase id to invalidate when they disagree, `None`
/// when the record is fresh or carries no digest yet.
pub fn check_drift(
    record: &StateRecord,
    registry: &PhaseRegistry,
    current_digest: &str,
) -> Option<u32> {
    match &record.content_digest {
        Some(recorded) if recorded != current_digest => registry.first_digest_sensitive(),
        _ => None,
    }
}
