use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

/// Progress of one dataset: expected part count and completed parts per stage.
///
/// Workers of a stage append disjoint parts; each append is a single
/// bitmap insert under the map's shard lock.
pub struct PipelineState {
    dataset: String,
    run_id: String,
    expected: DashMap<String, u32>,
    completed: DashMap<String, RoaringBitmap>,
    current: RwLock<Option<String>>,
    /// Stages in the order they were first seen.
    order: RwLock<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: String,
    pub expected: Option<u32>,
    pub completed: Vec<u32>,
}

impl StageProgress {
    pub fn is_complete(&self) -> bool {
        self.expected
            .is_some_and(|n| self.completed.len() == n as usize)
    }
}

/// Serialized checkpoint stored under `{dataset}/_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub dataset: String,
    pub run_id: String,
    pub current_stage: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub stages: Vec<StageProgress>,
}

impl PipelineState {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            run_id: uuid::Uuid::new_v4().to_string(),
            expected: DashMap::new(),
            completed: DashMap::new(),
            current: RwLock::new(None),
            order: RwLock::new(Vec::new()),
        }
    }

    fn track(&self, stage: &str) {
        if self.order.read().iter().any(|s| s == stage) {
            return;
        }
        let mut order = self.order.write();
        if !order.iter().any(|s| s == stage) {
            order.push(stage.to_string());
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn enter(&self, stage: &str) {
        *self.current.write() = Some(stage.to_string());
    }

    pub fn current_stage(&self) -> Option<String> {
        self.current.read().clone()
    }

    pub fn set_expected(&self, stage: &str, parts: u32) {
        self.track(stage);
        self.expected.insert(stage.to_string(), parts);
        // Drop anything recorded beyond the new part range.
        if let Some(mut done) = self.completed.get_mut(stage) {
            done.remove_range(parts..);
        }
    }

    pub fn expected(&self, stage: &str) -> Option<u32> {
        self.expected.get(stage).map(|v| *v)
    }

    pub fn mark_done(&self, stage: &str, part: u32) {
        self.track(stage);
        self.completed
            .entry(stage.to_string())
            .or_default()
            .insert(part);
    }

    pub fn completed_count(&self, stage: &str) -> u64 {
        self.completed.get(stage).map_or(0, |b| b.len())
    }

    /// Replace the completed set with the parts actually present in the store.
    pub fn reconcile<I>(&self, stage: &str, present: I)
    where
        I: IntoIterator<Item = u32>,
    {
        self.track(stage);
        let limit = self.expected(stage);
        let bitmap: RoaringBitmap = present
            .into_iter()
            .filter(|p| limit.map_or(true, |n| *p < n))
            .collect();
        self.completed.insert(stage.to_string(), bitmap);
    }

    /// Parts of `stage` not yet completed, ascending. Empty when the stage is unplanned.
    pub fn missing(&self, stage: &str) -> Vec<u32> {
        let Some(n) = self.expected(stage) else {
            return Vec::new();
        };
        let done = self.completed.get(stage);
        (0..n)
            .filter(|p| !done.as_ref().is_some_and(|b| b.contains(*p)))
            .collect()
    }

    pub fn is_complete(&self, stage: &str) -> bool {
        self.expected(stage)
            .is_some_and(|n| self.completed_count(stage) == u64::from(n))
    }

    pub fn progress(&self, stage: &str) -> StageProgress {
        StageProgress {
            stage: stage.to_string(),
            expected: self.expected(stage),
            completed: self
                .completed
                .get(stage)
                .map(|b| b.iter().collect())
                .unwrap_or_default(),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let order = self.order.read().clone();
        StateSnapshot {
            dataset: self.dataset.clone(),
            run_id: self.run_id.clone(),
            current_stage: self.current_stage(),
            updated_at: Utc::now(),
            stages: order.iter().map(|s| self.progress(s)).collect(),
        }
    }

    pub fn restore(snapshot: &StateSnapshot) -> Self {
        let state = Self::new(snapshot.dataset.clone());
        *state.current.write() = snapshot.current_stage.clone();
        for s in &snapshot.stages {
            state.track(&s.stage);
            if let Some(n) = s.expected {
                state.expected.insert(s.stage.clone(), n);
            }
            state
                .completed
                .insert(s.stage.clone(), s.completed.iter().copied().collect());
        }
        state
    }
}
