//! Resumable point-cloud reduction against vector constraints.
//!
//! A dataset is ingested once into budget-sized chunks, then narrowed stage by
//! stage (extent, hull, exact region crop, configured exclusions) and finally
//! compacted. Every chunk lands in a [`ChunkStore`] under
//! `{dataset}/{stage}-{part}`, so an interrupted run resumes where it stopped.

pub mod chunking;
pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod keys;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod source;
pub mod stage;
pub mod state;
pub mod store;

pub use codec::PointChunk;
pub use config::{ConstraintMode, ConstraintSpec, PipelineConfig, PipelinePlan, RegionSpec};
pub use error::{PipelineError, Result, StoreError};
pub use export::ExportFormat;
pub use metrics::Metrics;
pub use orchestrator::{IngestReport, Orchestrator, RunReport, StageManifest, StageReport, StatusReport};
pub use retry::{RetryPolicy, RetryingStore};
pub use source::PointSource;
pub use stage::Stage;
pub use state::PipelineState;
pub use store::{ChunkStore, FsStore, MemoryStore};
