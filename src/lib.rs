//! cube-compositor: chunked spatiotemporal compositing of Earth-observation rasters
//!
//! A query is split into geographic and time chunks, each chunk is reduced
//! under a pluggable compositing algorithm on a worker pool, and the partial
//! results are folded back together into one raster plus per-acquisition
//! metadata. Archive access and status reporting are injected capabilities.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    AcquisitionDate, AcquisitionStats, BandArray, CleanMask, CubeError, CubeResult, DataType,
    GeoTransform, Metadata, RasterTile, SpatialExtent, TimeRange,
};
pub use config::{EngineConfig, GeomedianParams, NdviParams};
pub use io::{CancellationFlag, DataSource, InMemoryArchive, InMemoryStatus, LoadRequest, QueryStatus, StatusReporter};
pub use crate::core::{
    ChunkingParams, CleanMaskRule, CompositeAlgorithm, Compositor, Query, QueryOutcome, QueryOutput,
    QueryState, TaskOrchestrator,
};

/// Run a query to completion on a fresh orchestrator
pub fn run_query(
    query: Query,
    config: EngineConfig,
    source: std::sync::Arc<dyn DataSource>,
    status: std::sync::Arc<dyn StatusReporter>,
) -> CubeResult<QueryOutcome> {
    TaskOrchestrator::new(query, config, source, status).run()
}
