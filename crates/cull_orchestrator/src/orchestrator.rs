//! Stage sequencing with resumable, chunked persistence.
//!
//! Every stage records its expected part count in a manifest before it
//! writes anything. On each run the orchestrator lists the stage's keys,
//! reconciles [`PipelineState`] with what actually exists and executes only
//! the missing parts. A chunk is the unit of work, of atomic persistence
//! and of cancellation.

use crate::chunking;
use crate::codec::{self, PointChunk};
use crate::config::{ConstraintMode, PipelineConfig, PipelinePlan};
use crate::error::{PipelineError, Result, StoreError};
use crate::export::{self, ExportFormat};
use crate::keys;
use crate::metrics::Metrics;
use crate::retry::{self, RetryPolicy, RetryingStore};
use crate::source::{self, PointSource};
use crate::stage::{Kernel, Stage, FINAL_STAGE, RAW_STAGE, REGION_HULLS_STAGE, REGION_SHAPES_STAGE};
use crate::state::{PipelineState, StateSnapshot};
use crate::store::ChunkStore;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use geocull::{island_select, Point, Polygon, PolygonSet};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, OnceCell};

/// Written under `{dataset}/_manifest/{stage}` before any chunk of the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageManifest {
    pub stage: String,
    pub parts: u32,
    pub has_z: bool,
    /// Stage whose chunks this one consumes.
    #[serde(default)]
    pub input: Option<String>,
    /// Total points, when known up front.
    #[serde(default)]
    pub points: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub parts: u32,
    pub written: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub dataset: String,
    pub points: usize,
    pub stage: StageReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub dataset: String,
    pub run_id: String,
    pub stages: Vec<StageReport>,
    pub final_points: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub expected: Option<u32>,
    pub present: u32,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub dataset: String,
    pub current_stage: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub region_hulls: Option<usize>,
    pub stages: Vec<StageStatus>,
}

/// Region geometry, loaded at most once per run.
struct Region {
    shapes: Vec<Polygon>,
    set: Arc<PolygonSet>,
}

struct RunCtx<'p> {
    plan: &'p PipelinePlan,
    region: OnceCell<Region>,
}

pub struct Orchestrator {
    store: Arc<dyn ChunkStore>,
    config: Arc<PipelineConfig>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
    cancel: watch::Receiver<bool>,
}

impl Orchestrator {
    /// Wraps `store` in the retry layer described by `config`.
    pub fn new<S: ChunkStore + 'static>(store: S, config: PipelineConfig, metrics: Arc<Metrics>) -> Self {
        let policy = config.retry_policy();
        let store = RetryingStore::new(store, policy).with_counter(metrics.store_retries_total.clone());
        // With the sender gone the flag stays `false`.
        let (_tx, cancel) = watch::channel(false);
        Self {
            store: Arc::new(store),
            config: Arc::new(config),
            policy,
            metrics,
            cancel,
        }
    }

    /// Stop between chunks once the channel carries `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    // --- store access -------------------------------------------------------

    fn escalate(&self, err: StoreError) -> PipelineError {
        retry::escalate(err, &self.policy)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.store.exists(key).await.map_err(|e| self.escalate(e))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.store.get(key).await.map_err(|e| self.escalate(e))
    }

    async fn get_opt(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.store.get(key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(self.escalate(e)),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.store.put(key, bytes).await.map_err(|e| self.escalate(e))
    }

    /// Part indices present for `stage`, ascending.
    async fn list_parts(&self, dataset: &str, stage: &str) -> Result<Vec<u32>> {
        let prefix = keys::stage_prefix(dataset, stage);
        let listed = self
            .store
            .list_by_prefix(&prefix)
            .await
            .map_err(|e| self.escalate(e))?;
        Ok(keys::sort_by_part(&prefix, listed)
            .into_iter()
            .map(|(p, _)| p)
            .collect())
    }

    async fn read_manifest(&self, dataset: &str, stage: &str) -> Result<Option<StageManifest>> {
        match self.get_opt(&keys::manifest_key(dataset, stage)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Records `wanted` unless a manifest exists; an existing one must agree.
    async fn ensure_manifest(&self, dataset: &str, wanted: StageManifest) -> Result<StageManifest> {
        if let Some(existing) = self.read_manifest(dataset, &wanted.stage).await? {
            if existing.parts != wanted.parts || existing.has_z != wanted.has_z {
                return Err(PipelineError::NotReady {
                    stage: wanted.stage,
                    reason: format!(
                        "stored manifest has {} parts (z: {}), inputs now yield {} parts (z: {})",
                        existing.parts, existing.has_z, wanted.parts, wanted.has_z
                    ),
                });
            }
            return Ok(existing);
        }
        let key = keys::manifest_key(dataset, &wanted.stage);
        self.put(&key, &serde_json::to_vec(&wanted)?).await?;
        Ok(wanted)
    }

    async fn read_snapshot(&self, dataset: &str) -> Result<Option<StateSnapshot>> {
        match self.get_opt(&keys::state_key(dataset)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn load_state(&self, dataset: &str) -> Result<PipelineState> {
        match self.read_snapshot(dataset).await? {
            Some(snap) if snap.dataset == dataset => {
                tracing::info!(
                    dataset,
                    previous_run = %snap.run_id,
                    stage = ?snap.current_stage,
                    "Resuming from checkpoint"
                );
                Ok(PipelineState::restore(&snap))
            }
            _ => Ok(PipelineState::new(dataset)),
        }
    }

    async fn checkpoint(&self, state: &PipelineState) -> Result<()> {
        let snap = state.snapshot();
        self.put(&keys::state_key(state.dataset()), &serde_json::to_vec_pretty(&snap)?)
            .await
    }

    /// Failure-path checkpoint; the stage error is what gets returned.
    async fn checkpoint_quietly(&self, state: &PipelineState) {
        if let Err(e) = self.checkpoint(state).await {
            tracing::warn!(dataset = state.dataset(), error = %e, "Failed to write checkpoint");
        }
    }

    // --- ingest -------------------------------------------------------------

    /// Loads a point source and stores it as the dataset's `raw` stage.
    pub async fn ingest(&self, dataset: &str, path: &Path) -> Result<IngestReport> {
        let owned = path.to_path_buf();
        let src = tokio::task::spawn_blocking(move || source::load_points(&owned)).await??;
        self.ingest_points(dataset, src).await
    }

    pub async fn ingest_points(&self, dataset: &str, src: PointSource) -> Result<IngestReport> {
        self.config.validate()?;
        if !keys::is_valid_name(dataset) {
            return Err(PipelineError::plan(format!("invalid dataset name '{dataset}'")));
        }

        let name = RAW_STAGE;
        let started = Instant::now();
        let state = self.load_state(dataset).await?;
        state.enter(name);

        let ranges = chunking::split_ranges(src.points.len(), self.config.chunk_bytes, src.has_z);
        let manifest = self
            .ensure_manifest(
                dataset,
                StageManifest {
                    stage: name.to_string(),
                    parts: part_count(&ranges)?,
                    has_z: src.has_z,
                    input: None,
                    points: Some(src.points.len() as u64),
                },
            )
            .await?;

        let result = self
            .write_split(dataset, name, &src.points, &ranges, src.has_z, &state)
            .await;
        let report = match result {
            Ok(r) => r,
            Err(e) => {
                self.checkpoint_quietly(&state).await;
                return Err(e);
            }
        };
        self.checkpoint(&state).await?;

        tracing::info!(
            dataset,
            points = src.points.len(),
            parts = manifest.parts,
            written = report.written,
            skipped = report.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ingest complete"
        );
        Ok(IngestReport {
            dataset: dataset.to_string(),
            points: src.points.len(),
            stage: report,
        })
    }

    /// Writes every part of `ranges` not yet present under `stage`.
    async fn write_split(
        &self,
        dataset: &str,
        stage: &str,
        points: &[Point],
        ranges: &[Range<usize>],
        has_z: bool,
        state: &PipelineState,
    ) -> Result<StageReport> {
        let parts = part_count(ranges)?;
        state.set_expected(stage, parts);
        state.reconcile(stage, self.list_parts(dataset, stage).await?);

        let missing = state.missing(stage);
        let skipped = parts as usize - missing.len();
        self.metrics.record_skip(stage, skipped);

        let encoding = self.config.encoding();
        let budget = self.config.chunk_bytes;
        let written = stream::iter(missing)
            .map(|part| async move {
                if self.is_cancelled() {
                    return Err(PipelineError::Cancelled(stage.to_string()));
                }
                let key = keys::chunk_key(dataset, stage, part);
                let chunk = PointChunk::new(part, has_z, points[ranges[part as usize].clone()].to_vec());
                let bytes = codec::encode_chunk(&key, &chunk, encoding, budget)?;
                self.put(&key, &bytes).await?;
                state.mark_done(stage, part);
                self.metrics.record_chunk(stage, chunk.points.len(), chunk.points.len());
                Ok::<(), PipelineError>(())
            })
            .buffer_unordered(self.config.in_flight())
            .try_fold(0usize, |n, ()| async move { Ok(n + 1) })
            .await?;

        self.require_complete(stage, state)?;
        Ok(StageReport {
            stage: stage.to_string(),
            parts,
            written,
            skipped,
        })
    }

    fn require_complete(&self, stage: &str, state: &PipelineState) -> Result<()> {
        if state.is_complete(stage) {
            return Ok(());
        }
        Err(PipelineError::NotReady {
            stage: stage.to_string(),
            reason: format!(
                "{} of {} parts recorded",
                state.completed_count(stage),
                state.expected(stage).unwrap_or(0)
            ),
        })
    }

    // --- run ----------------------------------------------------------------

    /// Runs every stage after `raw`, skipping chunks that already exist.
    pub async fn run(&self, plan: &PipelinePlan) -> Result<RunReport> {
        plan.validate()?;
        self.config.validate()?;
        let dataset = plan.dataset.as_str();

        let raw = self.read_manifest(dataset, RAW_STAGE).await?.ok_or_else(|| {
            PipelineError::NotReady {
                stage: Stage::ExtentPruned.name().to_string(),
                reason: format!("dataset '{dataset}' has not been ingested"),
            }
        })?;

        let state = self.load_state(dataset).await?;
        state.set_expected(&raw.stage, raw.parts);
        state.reconcile(&raw.stage, self.list_parts(dataset, &raw.stage).await?);
        if !state.is_complete(&raw.stage) {
            return Err(PipelineError::NotReady {
                stage: Stage::ExtentPruned.name().to_string(),
                reason: format!(
                    "raw ingest incomplete: {} of {} parts present",
                    state.completed_count(&raw.stage),
                    raw.parts
                ),
            });
        }

        tracing::info!(dataset, run_id = state.run_id(), raw_parts = raw.parts, "Pipeline run starting");

        let ctx = RunCtx {
            plan,
            region: OnceCell::new(),
        };
        let mut reports = Vec::new();
        let mut input = raw;

        for stage in Stage::sequence(plan).into_iter().skip(1) {
            let started = Instant::now();
            state.enter(stage.name());

            let outcome = match &stage {
                Stage::Final => self.compact(dataset, &input, &state).await,
                _ => self.run_chunk_stage(&ctx, &stage, &input, &state).await,
            };
            let (manifest, report) = match outcome {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(dataset, stage = %stage, error = %e, "Stage failed; progress checkpointed");
                    self.checkpoint_quietly(&state).await;
                    return Err(e);
                }
            };

            self.metrics
                .stage_seconds
                .with_label_values(&[stage.name()])
                .observe(started.elapsed().as_secs_f64());
            self.checkpoint(&state).await?;
            tracing::info!(
                dataset,
                stage = %stage,
                parts = report.parts,
                written = report.written,
                skipped = report.skipped,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stage complete"
            );

            reports.push(report);
            input = manifest;
        }

        Ok(RunReport {
            dataset: dataset.to_string(),
            run_id: state.run_id().to_string(),
            stages: reports,
            final_points: input.points.unwrap_or(0),
        })
    }

    async fn run_chunk_stage(
        &self,
        ctx: &RunCtx<'_>,
        stage: &Stage,
        input: &StageManifest,
        state: &PipelineState,
    ) -> Result<(StageManifest, StageReport)> {
        let dataset = ctx.plan.dataset.as_str();
        let name = stage.name();

        // Output part i is the reduction of input part i.
        let manifest = self
            .ensure_manifest(
                dataset,
                StageManifest {
                    stage: name.to_string(),
                    parts: input.parts,
                    has_z: input.has_z,
                    input: Some(input.stage.clone()),
                    points: None,
                },
            )
            .await?;
        state.set_expected(name, manifest.parts);
        state.reconcile(name, self.list_parts(dataset, name).await?);

        let missing = state.missing(name);
        let skipped = manifest.parts as usize - missing.len();
        self.metrics.record_skip(name, skipped);

        let mut written = 0;
        if missing.is_empty() {
            tracing::info!(dataset, stage = name, parts = manifest.parts, "Stage already complete");
        } else {
            let kernel = Arc::new(self.kernel_for(ctx, stage).await?);
            tracing::info!(dataset, stage = name, missing = missing.len(), skipped, "Processing chunks");
            written = self
                .process_parts(dataset, &input.stage, name, missing, kernel, state)
                .await?;
        }

        self.require_complete(name, state)?;
        let report = StageReport {
            stage: name.to_string(),
            parts: manifest.parts,
            written,
            skipped,
        };
        Ok((manifest, report))
    }

    async fn process_parts(
        &self,
        dataset: &str,
        input: &str,
        stage: &str,
        parts: Vec<u32>,
        kernel: Arc<Kernel>,
        state: &PipelineState,
    ) -> Result<usize> {
        stream::iter(parts)
            .map(|part| {
                let kernel = kernel.clone();
                async move {
                    if self.is_cancelled() {
                        return Err(PipelineError::Cancelled(stage.to_string()));
                    }
                    let _in_flight = self.metrics.chunk_in_flight();
                    self.transform_part(dataset, input, stage, part, kernel, state).await
                }
            })
            .buffer_unordered(self.config.in_flight())
            .try_fold(0usize, |n, ()| async move { Ok(n + 1) })
            .await
    }

    async fn transform_part(
        &self,
        dataset: &str,
        input: &str,
        stage: &str,
        part: u32,
        kernel: Arc<Kernel>,
        state: &PipelineState,
    ) -> Result<()> {
        let in_key = keys::chunk_key(dataset, input, part);
        let out_key = keys::chunk_key(dataset, stage, part);

        let chunk = codec::decode_chunk(&in_key, &self.get(&in_key).await?)?;
        if chunk.sequence != part {
            tracing::warn!(key = %in_key, sequence = chunk.sequence, "Chunk sequence does not match its key");
        }
        let has_z = chunk.has_z;
        let points_in = chunk.points.len();

        let kept = tokio::task::spawn_blocking(move || kernel.apply(&chunk.points)).await?;
        let out = PointChunk::new(part, has_z, kept);
        let bytes = codec::encode_chunk(&out_key, &out, self.config.encoding(), self.config.chunk_bytes)?;
        self.put(&out_key, &bytes).await?;

        state.mark_done(stage, part);
        self.metrics.record_chunk(stage, points_in, out.points.len());
        tracing::debug!(key = %out_key, points_in, points_kept = out.points.len(), "Chunk written");
        Ok(())
    }

    /// Gathers the survivors of `input` and re-chunks them to the byte budget.
    async fn compact(
        &self,
        dataset: &str,
        input: &StageManifest,
        state: &PipelineState,
    ) -> Result<(StageManifest, StageReport)> {
        let name = FINAL_STAGE;

        if let Some(existing) = self.read_manifest(dataset, name).await? {
            state.set_expected(name, existing.parts);
            state.reconcile(name, self.list_parts(dataset, name).await?);
            if state.is_complete(name) {
                self.metrics.record_skip(name, existing.parts as usize);
                tracing::info!(dataset, stage = name, parts = existing.parts, "Stage already complete");
                let report = StageReport {
                    stage: name.to_string(),
                    parts: existing.parts,
                    written: 0,
                    skipped: existing.parts as usize,
                };
                return Ok((existing, report));
            }
        }

        let chunks = self.read_parts(dataset, &input.stage, input.parts).await?;
        let points: Vec<Point> = chunks.into_iter().flat_map(|c| c.points).collect();
        let ranges = chunking::split_ranges(points.len(), self.config.chunk_bytes, input.has_z);

        let manifest = self
            .ensure_manifest(
                dataset,
                StageManifest {
                    stage: name.to_string(),
                    parts: part_count(&ranges)?,
                    has_z: input.has_z,
                    input: Some(input.stage.clone()),
                    points: Some(points.len() as u64),
                },
            )
            .await?;

        let report = self
            .write_split(dataset, name, &points, &ranges, input.has_z, state)
            .await?;
        Ok((manifest, report))
    }

    /// Chunks `0..parts` of `stage`, in part order.
    async fn read_parts(&self, dataset: &str, stage: &str, parts: u32) -> Result<Vec<PointChunk>> {
        stream::iter(0..parts)
            .map(|part| async move {
                if self.is_cancelled() {
                    return Err(PipelineError::Cancelled(stage.to_string()));
                }
                let key = keys::chunk_key(dataset, stage, part);
                let bytes = self.get(&key).await?;
                codec::decode_chunk(&key, &bytes)
            })
            .buffered(self.config.in_flight())
            .try_collect()
            .await
    }

    // --- geometry -----------------------------------------------------------

    async fn kernel_for(&self, ctx: &RunCtx<'_>, stage: &Stage) -> Result<Kernel> {
        Ok(match stage {
            Stage::ExtentPruned => Kernel::ExtentPrune(self.region(ctx).await?.set.clone()),
            Stage::HullPruned => Kernel::HullPrune(self.region(ctx).await?.set.clone()),
            Stage::ExactCulled => Kernel::Crop(self.region(ctx).await?.set.clone()),
            Stage::Constraint { index, name, mode } => {
                Kernel::Cull(self.constraint_set(ctx, *index, name, *mode).await?)
            }
            Stage::RawLoaded | Stage::Final => {
                return Err(PipelineError::plan(format!("stage {stage} has no per-chunk reduction")))
            }
        })
    }

    async fn region<'c>(&self, ctx: &'c RunCtx<'_>) -> Result<&'c Region> {
        ctx.region.get_or_try_init(|| self.load_region(ctx.plan)).await
    }

    /// Region shapes come from the store when a previous run persisted them.
    async fn load_region(&self, plan: &PipelinePlan) -> Result<Region> {
        let dataset = plan.dataset.as_str();
        let key = keys::shapes_key(dataset, REGION_SHAPES_STAGE);

        let shapes = match self.get_opt(&key).await? {
            Some(bytes) => codec::decode_shapes(&bytes)?,
            None => {
                let region = plan.region.clone();
                let shapes = tokio::task::spawn_blocking(move || -> Result<Vec<Polygon>> {
                    let all = source::load_polygons(&region.path, region.id_property.as_deref())?;
                    Ok(source::apply_filter(all, region.filter.as_ref()))
                })
                .await??;
                self.put(&key, &codec::encode_shapes(&shapes)?).await?;
                shapes
            }
        };

        let set = self.prepare(shapes.clone()).await?;
        let hulls_key = keys::hulls_key(dataset, REGION_HULLS_STAGE);
        if !self.exists(&hulls_key).await? {
            self.put(&hulls_key, &codec::encode_hulls(&set.hulls())?).await?;
        }

        tracing::info!(dataset, polygons = set.len(), skipped = set.skipped(), "Region geometry ready");
        Ok(Region { shapes, set })
    }

    async fn constraint_set(
        &self,
        ctx: &RunCtx<'_>,
        index: usize,
        name: &str,
        mode: ConstraintMode,
    ) -> Result<Arc<PolygonSet>> {
        let dataset = ctx.plan.dataset.as_str();
        let constraint = ctx
            .plan
            .constraints
            .get(index)
            .ok_or_else(|| PipelineError::plan(format!("no constraint at position {index}")))?;
        let key = keys::shapes_key(dataset, name);

        let shapes = match self.get_opt(&key).await? {
            Some(bytes) => codec::decode_shapes(&bytes)?,
            None => {
                let filter = constraint.filter.clone();
                let shapes = match &constraint.path {
                    Some(path) => {
                        let path = path.clone();
                        tokio::task::spawn_blocking(move || -> Result<Vec<Polygon>> {
                            let all = source::load_polygons(&path, None)?;
                            Ok(select(source::apply_filter(all, filter.as_ref()), mode))
                        })
                        .await??
                    }
                    None => {
                        let region = self.region(ctx).await?.shapes.clone();
                        select(source::apply_filter(region, filter.as_ref()), mode)
                    }
                };
                self.put(&key, &codec::encode_shapes(&shapes)?).await?;
                shapes
            }
        };

        tracing::info!(dataset, stage = name, mode = ?mode, polygons = shapes.len(), "Constraint geometry ready");
        self.prepare(shapes).await
    }

    async fn prepare(&self, shapes: Vec<Polygon>) -> Result<Arc<PolygonSet>> {
        let set = tokio::task::spawn_blocking(move || PolygonSet::new(shapes)).await?;
        self.metrics
            .degenerate_polygons_total
            .inc_by(set.skipped() as u64);
        Ok(Arc::new(set))
    }

    // --- inspection ---------------------------------------------------------

    pub async fn status(&self, plan: &PipelinePlan) -> Result<StatusReport> {
        let dataset = plan.dataset.as_str();
        let snapshot = self.read_snapshot(dataset).await?;

        let mut stages = Vec::new();
        for name in Stage::names(plan) {
            let expected = self.read_manifest(dataset, &name).await?.map(|m| m.parts);
            let listed = self.list_parts(dataset, &name).await?;
            let present = listed
                .iter()
                .filter(|p| expected.map_or(true, |n| **p < n))
                .count() as u32;
            stages.push(StageStatus {
                complete: expected == Some(present),
                stage: name,
                expected,
                present,
            });
        }

        let region_hulls = match self
            .get_opt(&keys::hulls_key(dataset, REGION_HULLS_STAGE))
            .await?
        {
            Some(bytes) => Some(codec::decode_hulls(&bytes)?.len()),
            None => None,
        };

        Ok(StatusReport {
            dataset: dataset.to_string(),
            current_stage: snapshot.as_ref().and_then(|s| s.current_stage.clone()),
            updated_at: snapshot.map(|s| s.updated_at),
            region_hulls,
            stages,
        })
    }

    /// Every chunk of a completed stage, in part order.
    pub async fn read_stage(&self, dataset: &str, stage: &str) -> Result<Vec<PointChunk>> {
        let manifest = self
            .read_manifest(dataset, stage)
            .await?
            .ok_or_else(|| PipelineError::NotReady {
                stage: stage.to_string(),
                reason: "stage has not started".into(),
            })?;
        self.read_parts(dataset, stage, manifest.parts).await
    }

    /// Writes the `final` stage out of the store. Returns files or points written.
    pub async fn export(&self, dataset: &str, out: &Path, format: ExportFormat) -> Result<usize> {
        let stage = FINAL_STAGE;
        let chunks = self.read_stage(dataset, stage).await?;
        let out = out.to_path_buf();
        let encoding = self.config.encoding();

        let written = tokio::task::spawn_blocking(move || match format {
            ExportFormat::Vtxc => export::write_vtxc_dir(&out, stage, &chunks, encoding),
            ExportFormat::Xyz => export::write_xyz(&out, &chunks),
        })
        .await??;

        tracing::info!(dataset, format = ?format, written, "Export complete");
        Ok(written)
    }
}

fn select(shapes: Vec<Polygon>, mode: ConstraintMode) -> Vec<Polygon> {
    match mode {
        ConstraintMode::Cull => shapes,
        ConstraintMode::Islands => island_select(&shapes),
    }
}

fn part_count(ranges: &[Range<usize>]) -> Result<u32> {
    u32::try_from(ranges.len()).map_err(|_| PipelineError::plan("part count exceeds u32"))
}
