use async_trait::async_trait;
use cull_orchestrator::store::StoreResult;
use cull_orchestrator::{
    ChunkStore, ConstraintMode, ConstraintSpec, ExportFormat, FsStore, MemoryStore, Metrics,
    Orchestrator, PipelineConfig, PipelineError, PipelinePlan, PointSource, RegionSpec, StoreError,
};
use geocull::Point;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fails every put under `prefix` after the first `allow`.
#[derive(Debug)]
struct FailAfter {
    inner: MemoryStore,
    prefix: String,
    allow: usize,
    seen: AtomicUsize,
    transient_every: Option<usize>,
}

impl FailAfter {
    fn new(inner: MemoryStore, prefix: &str, allow: usize) -> Self {
        Self {
            inner,
            prefix: prefix.to_string(),
            allow,
            seen: AtomicUsize::new(0),
            transient_every: None,
        }
    }

    /// Every `n`th put anywhere fails once with a retryable error.
    fn flaky(inner: MemoryStore, n: usize) -> Self {
        Self {
            transient_every: Some(n),
            ..Self::new(inner, "", usize::MAX)
        }
    }
}

#[async_trait]
impl ChunkStore for FailAfter {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        if key.starts_with(&self.prefix) {
            let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(every) = self.transient_every {
                if n % every == 0 {
                    return Err(StoreError::transient(key, "503 slow down"));
                }
            } else if n > self.allow {
                return Err(StoreError::io(key, std::io::ErrorKind::PermissionDenied.into()));
            }
        }
        self.inner.put(key, bytes).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.list_by_prefix(prefix).await
    }
}

fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> String {
    format!(
        r#"{{ "type": "FeatureCollection", "features": [ {{ "type": "Feature", "properties": {{ "LAND": "n" }},
             "geometry": {{ "type": "Polygon", "coordinates": [[[{x0},{y0}],[{x1},{y0}],[{x1},{y1}],[{x0},{y1}],[{x0},{y0}]]] }} }} ] }}"#
    )
}

fn plan(dir: &Path) -> PipelinePlan {
    let region = dir.join("region.geojson");
    let closures = dir.join("closures.geojson");
    std::fs::write(&region, square(0.0, 0.0, 30.0, 30.0)).unwrap();
    std::fs::write(&closures, square(10.0, 10.0, 20.0, 20.0)).unwrap();
    PipelinePlan {
        dataset: "bathy".into(),
        region: RegionSpec {
            path: region,
            filter: None,
            id_property: None,
        },
        constraints: vec![ConstraintSpec {
            name: "closures".into(),
            mode: ConstraintMode::Cull,
            path: Some(closures),
            filter: None,
        }],
    }
}

/// 40x40 grid with depths; the region covers the south-west 30x30.
fn grid() -> PointSource {
    let points = (0..40)
        .flat_map(|j| {
            (0..40).map(move |i| Point::new(i as f64 + 0.5, j as f64 + 0.5, 1.0).with_z(-((i * j) as f64)))
        })
        .collect();
    PointSource { points, has_z: true }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        chunk_bytes: vtxc::encoded_len(100, true),
        max_in_flight: 4,
        retry_initial_ms: 1,
        retry_max_ms: 5,
        ..PipelineConfig::default()
    }
}

fn orchestrator<S: ChunkStore + 'static>(store: S) -> Orchestrator {
    Orchestrator::new(store, config(), Arc::new(Metrics::new()))
}

fn without_state(store: &MemoryStore) -> Vec<(String, Vec<u8>)> {
    store
        .entries()
        .into_iter()
        .filter(|(k, _)| !k.ends_with("/_state"))
        .collect()
}

async fn uninterrupted(plan: &PipelinePlan) -> MemoryStore {
    let store = MemoryStore::new();
    let orch = orchestrator(store.clone());
    orch.ingest_points("bathy", grid()).await.unwrap();
    orch.run(plan).await.unwrap();
    store
}

#[tokio::test]
async fn interrupted_run_resumes_to_identical_output() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(dir.path());
    let reference = uninterrupted(&plan).await;

    let store = MemoryStore::new();
    orchestrator(store.clone()).ingest_points("bathy", grid()).await.unwrap();

    // 1600 points at 100 per chunk: 16 parts, fail after half.
    let metrics = Arc::new(Metrics::new());
    let failing = Orchestrator::new(
        FailAfter::new(store.clone(), "bathy/extent-", 8),
        config(),
        metrics.clone(),
    );
    let err = failing.run(&plan).await.unwrap_err();
    assert!(matches!(err, PipelineError::Store(StoreError::Io { .. })), "{err}");
    // Chunks abandoned mid-flight give their gauge slot back.
    assert_eq!(metrics.chunks_in_flight.get(), 0);

    let extent_parts = store
        .entries()
        .iter()
        .filter(|(k, _)| k.starts_with("bathy/extent-"))
        .count();
    assert_eq!(extent_parts, 8);

    let report = orchestrator(store.clone()).run(&plan).await.unwrap();
    let extent = &report.stages[0];
    assert_eq!((extent.stage.as_str(), extent.written, extent.skipped), ("extent", 8, 8));

    assert_eq!(without_state(&store), without_state(&reference));
}

#[tokio::test]
async fn transient_store_failures_are_absorbed() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(dir.path());
    let reference = uninterrupted(&plan).await;

    let store = MemoryStore::new();
    let metrics = Arc::new(Metrics::new());
    let orch = Orchestrator::new(FailAfter::flaky(store.clone(), 3), config(), metrics.clone());
    orch.ingest_points("bathy", grid()).await.unwrap();
    let report = orch.run(&plan).await.unwrap();

    assert_eq!(report.final_points, 30 * 30 - 10 * 10);
    assert!(metrics.store_retries_total.get() > 0);
    assert_eq!(without_state(&store), without_state(&reference));
}

#[tokio::test]
async fn filesystem_store_runs_and_exports() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(dir.path());
    let store = FsStore::new(dir.path().join("store"));

    let orch = orchestrator(store.clone());
    orch.ingest_points("bathy", grid()).await.unwrap();
    let report = orch.run(&plan).await.unwrap();
    assert_eq!(report.final_points, 800);

    let out = dir.path().join("out/bathy.xyz");
    assert_eq!(orch.export("bathy", &out, ExportFormat::Xyz).await.unwrap(), 800);
    let back = cull_orchestrator::source::read_xyz(&out).unwrap();
    assert!(back.has_z);
    assert_eq!(back.points.len(), 800);

    let files = orch
        .export("bathy", &dir.path().join("vtxc"), ExportFormat::Vtxc)
        .await
        .unwrap();
    assert_eq!(files, report.stages.last().unwrap().parts as usize);

    // A second process over the same directory finds everything done.
    let again = orchestrator(store).run(&plan).await.unwrap();
    assert!(again.stages.iter().all(|s| s.written == 0));
}
