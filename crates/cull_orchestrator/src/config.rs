use crate::error::{PipelineError, Result};
use crate::keys;
use crate::retry::RetryPolicy;
use crate::stage::RESERVED_STAGE_NAMES;
use clap::Args;
use geocull::AttrFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use vtxc::BodyEncoding;

/// Runtime knobs for one pipeline run. Built once and shared read-only.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Upper bound on the stored size of any chunk, in bytes.
    #[arg(long, env = "CULL_CHUNK_BYTES", default_value_t = 10_000_000)]
    pub chunk_bytes: usize,

    /// Chunks processed concurrently within a stage.
    #[arg(long, env = "CULL_MAX_IN_FLIGHT", default_value_t = 8)]
    pub max_in_flight: usize,

    /// Deflate chunk bodies.
    #[arg(long, env = "CULL_DEFLATE", default_value_t = false)]
    pub deflate: bool,

    /// Store attempts per operation, including the first.
    #[arg(long, env = "CULL_RETRY_ATTEMPTS", default_value_t = 5)]
    pub retry_attempts: u32,

    #[arg(long, env = "CULL_RETRY_INITIAL_MS", default_value_t = 200)]
    pub retry_initial_ms: u64,

    #[arg(long, env = "CULL_RETRY_MAX_MS", default_value_t = 10_000)]
    pub retry_max_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 10_000_000,
            max_in_flight: 8,
            deflate: false,
            retry_attempts: 5,
            retry_initial_ms: 200,
            retry_max_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    pub fn encoding(&self) -> BodyEncoding {
        if self.deflate {
            BodyEncoding::Deflate
        } else {
            BodyEncoding::Raw
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            initial_ms: self.retry_initial_ms,
            max_ms: self.retry_max_ms.max(self.retry_initial_ms),
            multiplier: 2.0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let smallest = vtxc::encoded_len(1, true);
        if self.chunk_bytes < smallest {
            return Err(PipelineError::plan(format!(
                "chunk budget of {} bytes cannot hold a single point; need at least {smallest}",
                self.chunk_bytes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintMode {
    /// Drop points inside any constraint polygon.
    Cull,
    /// Drop points inside constraint records with negative signed area.
    Islands,
}

/// Vector source of the region to keep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub filter: Option<AttrFilter>,
    /// Feature property used as the shape id when the feature has no `id`.
    #[serde(default)]
    pub id_property: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    /// Stage name; becomes part of every chunk key the stage writes.
    pub name: String,
    pub mode: ConstraintMode,
    /// Vector source; the region shapes are used when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub filter: Option<AttrFilter>,
}

/// What to reduce and against which geometry, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub dataset: String,
    pub region: RegionSpec,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
}

impl PipelinePlan {
    /// Loads a JSON plan. Relative source paths resolve against the plan's directory.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| PipelineError::source_error(path.display(), e.to_string()))?;
        let mut plan: PipelinePlan = serde_json::from_slice(&bytes)?;

        if let Some(base) = path.parent() {
            plan.rebase(base);
        }
        plan.validate()?;
        Ok(plan)
    }

    fn rebase(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.region.path);
        for c in &mut self.constraints {
            if let Some(p) = c.path.as_mut() {
                fix(p);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !keys::is_valid_name(&self.dataset) {
            return Err(PipelineError::plan(format!(
                "dataset name '{}' must be lowercase ascii, digits or '_'",
                self.dataset
            )));
        }

        let mut seen = HashSet::new();
        for c in &self.constraints {
            if !keys::is_valid_name(&c.name) {
                return Err(PipelineError::plan(format!("invalid constraint name '{}'", c.name)));
            }
            if RESERVED_STAGE_NAMES.contains(&c.name.as_str()) {
                return Err(PipelineError::plan(format!(
                    "constraint name '{}' is reserved",
                    c.name
                )));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(PipelineError::plan(format!("duplicate constraint '{}'", c.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"{
        "dataset": "gom",
        "region": { "path": "water.geojson", "filter": { "key": "LAND", "equals": "n" } },
        "constraints": [
            { "name": "closures", "mode": "cull", "path": "closures.geojson" },
            { "name": "islands", "mode": "islands" }
        ]
    }"#;

    #[test]
    fn plan_parses_and_rebases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, PLAN).unwrap();

        let plan = PipelinePlan::from_path(&path).unwrap();
        assert_eq!(plan.dataset, "gom");
        assert_eq!(plan.region.path, dir.path().join("water.geojson"));
        assert_eq!(plan.region.filter, Some(AttrFilter::new("LAND", "n")));
        assert_eq!(plan.constraints[0].mode, ConstraintMode::Cull);
        assert_eq!(plan.constraints[1].mode, ConstraintMode::Islands);
        assert!(plan.constraints[1].path.is_none());
    }

    #[test]
    fn reserved_and_duplicate_names_are_rejected() {
        let mut plan: PipelinePlan = serde_json::from_str(PLAN).unwrap();
        plan.constraints[0].name = "final".into();
        assert!(matches!(plan.validate(), Err(PipelineError::Plan(_))));

        plan.constraints[0].name = "islands".into();
        assert!(matches!(plan.validate(), Err(PipelineError::Plan(_))));
    }

    #[test]
    fn config_defaults() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.encoding(), BodyEncoding::Raw);
        assert_eq!(config.retry_policy().max_attempts, 5);

        let tiny = PipelineConfig {
            chunk_bytes: 8,
            ..PipelineConfig::default()
        };
        assert!(tiny.validate().is_err());
    }

    #[test]
    fn budget_must_fit_one_point_with_z() {
        let with_budget = |chunk_bytes| PipelineConfig {
            chunk_bytes,
            ..PipelineConfig::default()
        };
        // Above the header, below one record.
        assert!(matches!(with_budget(40).validate(), Err(PipelineError::Plan(_))));
        assert!(with_budget(vtxc::encoded_len(1, true) - 1).validate().is_err());
        assert!(with_budget(vtxc::encoded_len(1, true)).validate().is_ok());
    }
}
