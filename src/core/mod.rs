//! Core compositing stages

pub mod chunk_planner;
pub mod clean_mask;
pub mod composite;
pub mod compositor;
pub mod geomedian;
pub mod chunk_worker;
pub mod time_recombine;
pub mod geo_recombine;
pub mod orchestrator;

// Re-export main types
pub use chunk_planner::{split_geographic, split_temporal, ChunkPlan, ChunkPlanner, ChunkingParams, GeoChunk, TimeChunk};
pub use clean_mask::{derive_clean_mask, extract_clean_mask, CleanMaskParams, CleanMaskRule, CoverType};
pub use composite::{Accumulator, Composite, MaskedSeries, Objective};
pub use compositor::{
    composite, CompositeAlgorithm, Compositor, MeanCompositor, MedianCompositor, MosaicCompositor, NdviCompositor,
};
pub use geomedian::{geometric_median, medoid, GeomedianCompositor, MedoidCompositor};
pub use chunk_worker::{ChunkOutput, ChunkWorker, PartialResult};
pub use time_recombine::{GeoChunkResult, TimeRecombiner};
pub use geo_recombine::{GeoRecombiner, QueryOutput};
pub use orchestrator::{ChunkTask, Query, QueryOutcome, QueryState, TaskOrchestrator, TaskStatus};
