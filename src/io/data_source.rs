//! Archive access capability consumed by the engine.

use crate::types::{AcquisitionDate, RasterTile, SpatialExtent, TimeRange};
use serde::{Deserialize, Serialize};

/// What the engine asks an archive for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub product: String,
    pub platform: String,
    pub bands: Vec<String>,
    pub extent: SpatialExtent,
    pub time_range: TimeRange,
}

impl LoadRequest {
    /// Same request narrowed to a chunk
    pub fn narrowed(&self, extent: SpatialExtent, time_range: TimeRange) -> Self {
        Self {
            extent,
            time_range,
            ..self.clone()
        }
    }
}

/// Archive access, injected into every worker.
///
/// Implementations live outside the crate, so failures are reported as
/// `anyhow::Error` and classified by the caller.
pub trait DataSource: Send + Sync {
    /// Acquisition timestamps that intersect the request
    fn list_acquisitions(&self, request: &LoadRequest) -> anyhow::Result<Vec<AcquisitionDate>>;

    /// Raw bands over the request, or `None` when nothing intersects it.
    ///
    /// The returned tile must carry a time axis and every requested band.
    fn load(&self, request: &LoadRequest) -> anyhow::Result<Option<RasterTile>>;
}
