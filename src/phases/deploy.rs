//! Deployment phases: template rendering, secrets, host services.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{PhaseHandler, PhaseOutcome};
use crate::context::RunContext;
use crate::health::HealthCheckResult;

/// Secrets every deployment needs; generated once, never overwritten.
const SECRET_NAMES: &[&str] = &["db_password", "session_key", "registry_token"];

/// Host services enabled by the services phase.
const SERVICES: &[&str] = &["nginx", "chrony", "node_exporter"];

/// Render configuration templates into the active config directory.
///
/// Templates live in the digest-covered inputs directory; `{{hostname}}`
/// is the only substitution. Rendering is idempotent.
pub struct ConfigRenderPhase;

impl ConfigRenderPhase {
    pub fn rendered_dir(ctx: &RunContext) -> PathBuf {
        ctx.config.state_dir.join("rendered")
    }

    fn template_files(ctx: &RunContext) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if ctx.config.inputs_dir.is_dir() {
            for entry in WalkDir::new(&ctx.config.inputs_dir).into_iter().flatten() {
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
        }
        files.sort();
        files
    }
}

#[async_trait]
impl PhaseHandler for ConfigRenderPhase {
    async fn execute(&self, ctx: &RunContext) -> Result<PhaseOutcome> {
        let templates = Self::template_files(ctx);
        if templates.is_empty() {
            return Ok(PhaseOutcome::failed(format!(
                "no templates found under {}",
                ctx.config.inputs_dir.display()
            )));
        }

        let hostname = ctx.runner.run("hostname", &[]).await?.stdout.trim().to_string();
        let out_dir = Self::rendered_dir(ctx);

        for template in &templates {
            let rel = template
                .strip_prefix(&ctx.config.inputs_dir)
                .unwrap_or(template);
            let dest = out_dir.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let content = std::fs::read_to_string(template)
                .with_context(|| format!("Failed to read template {}", template.display()))?;
            let rendered = content.replace("{{hostname}}", &hostname);
            std::fs::write(&dest, rendered)
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            debug!(template = %rel.display(), "rendered");
        }

        Ok(PhaseOutcome::success_with(format!("rendered {} templates", templates.len())))
    }

    async fn health_check(&self, ctx: &RunContext) -> Result<HealthCheckResult> {
        let expected = Self::template_files(ctx).len();
        let out_dir = Self::rendered_dir(ctx);
        let rendered = WalkDir::new(&out_dir)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .count();
        Ok(if rendered == expected && expected > 0 {
            HealthCheckResult::pass(format!("{rendered} rendered files match the template set"))
        } else {
            HealthCheckResult::fail(format!("expected {expected} rendered files, found {rendered}"))
        })
    }

    /// Clear partial renders so a retry starts from a clean slate.
    async fn remediate(&self, ctx: &RunContext) -> Result<()> {
        let out_dir = Self::rendered_dir(ctx);
        if out_dir.exists() {
            std::fs::remove_dir_all(&out_dir)
                .with_context(|| format!("Failed to clear {}", out_dir.display()))?;
            info!(dir = %out_dir.display(), "cleared partially rendered config");
        }
        Ok(())
    }

    async fn probe_outputs(&self, ctx: &RunContext) -> Result<bool> {
        let expected = Self::template_files(ctx).len();
        if expected == 0 {
            return Ok(false);
        }
        let rendered = WalkDir::new(Self::rendered_dir(ctx))
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .count();
        Ok(rendered == expected)
    }
}

/// Generate missing secrets. Existing secrets are left untouched.
pub struct SecretsPhase;

impl SecretsPhase {
    fn secrets_dir(ctx: &RunContext) -> PathBuf {
        ctx.config.state_dir.join("secrets")
    }
}

#[async_trait]
impl PhaseHandler for SecretsPhase {
    async fn execute(&self, ctx: &RunContext) -> Result<PhaseOutcome> {
        let dir = Self::secrets_dir(ctx);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create secrets dir: {}", dir.display()))?;

        let mut generated = 0usize;
        for name in SECRET_NAMES {
            let path = dir.join(name);
            if path.exists() {
                continue;
            }
            let output = ctx.run_ok("openssl", &["rand", "-hex", "32"]).await?;
            let value = output.stdout.trim();
            if value.is_empty() {
                return Ok(PhaseOutcome::failed(format!("openssl produced an empty value for {name}")));
            }
            std::fs::write(&path, value)
                .with_context(|| format!("Failed to write secret {}", path.display()))?;
            generated += 1;
        }
        Ok(PhaseOutcome::success_with(format!(
            "{generated} generated, {} already present",
            SECRET_NAMES.len() - generated
        )))
    }

    async fn health_check(&self, ctx: &RunContext) -> Result<HealthCheckResult> {
        let dir = Self::secrets_dir(ctx);
        let mut missing = Vec::new();
        for name in SECRET_NAMES {
            let path = dir.join(name);
            let populated = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
            if !populated {
                missing.push(*name);
            }
        }
        Ok(if missing.is_empty() {
            HealthCheckResult::pass("all secrets present and non-empty")
        } else {
            HealthCheckResult::fail(format!("missing or empty secrets: {}", missing.join(", ")))
        })
    }

    async fn probe_outputs(&self, ctx: &RunContext) -> Result<bool> {
        let dir = Self::secrets_dir(ctx);
        Ok(SECRET_NAMES.iter().all(|name| {
            std::fs::metadata(dir.join(name)).map(|m| m.len() > 0).unwrap_or(false)
        }))
    }
}

/// Enable and start the host service set.
pub struct ServicesPhase;

#[async_trait]
impl PhaseHandler for ServicesPhase {
    async fn execute(&self, ctx: &RunContext) -> Result<PhaseOutcome> {
        for &service in SERVICES {
            ctx.run_ok("systemctl", &["enable", "--now", service])
                .await
                .with_context(|| format!("failed to enable {service}"))?;
        }
        Ok(PhaseOutcome::success_with(format!("{} services enabled", SERVICES.len())))
    }

    async fn health_check(&self, ctx: &RunContext) -> Result<HealthCheckResult> {
        let mut inactive = Vec::new();
        for &service in SERVICES {
            let output = ctx.runner.run("systemctl", &["is-active", service]).await?;
            if !output.success() {
                inactive.push(service);
            }
        }
        Ok(if inactive.is_empty() {
            HealthCheckResult::pass("all services active")
        } else if inactive.len() < SERVICES.len() {
            HealthCheckResult::warn(format!("services not active: {}", inactive.join(", ")))
        } else {
            HealthCheckResult::fail("no managed service is active".to_string())
        })
    }

    async fn remediate(&self, ctx: &RunContext) -> Result<()> {
        ctx.run_ok("systemctl", &["daemon-reload"]).await?;
        Ok(())
    }
}
