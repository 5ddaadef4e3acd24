//! Engine configuration.

use crate::core::clean_mask::CleanMaskParams;
use crate::types::{CubeError, CubeResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Band names used by the NDVI compositors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdviParams {
    pub nir_band: String,
    pub red_band: String,
}

impl Default for NdviParams {
    fn default() -> Self {
        Self {
            nir_band: "nir".to_string(),
            red_band: "red".to_string(),
        }
    }
}

/// Stopping rules for the iterative geometric median
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeomedianParams {
    pub max_iterations: usize,
    /// Stop once an iteration moves the estimate less than this (Euclidean)
    pub tolerance: f64,
}

impl Default for GeomedianParams {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 1e-7,
        }
    }
}

/// Configuration shared by every query run by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size.
    pub workers: usize,

    /// Side of a geographic chunk in degrees.
    pub geo_chunk_size: f64,

    /// Acquisitions per time chunk. When unset, `time_chunk_count` is used.
    pub time_chunk_size: Option<usize>,

    /// Number of near-equal time chunks when no chunk size is set.
    pub time_chunk_count: usize,

    /// How often the orchestrator polls for cancellation while waiting on workers.
    pub poll_interval_ms: u64,

    /// Root directory for query-scoped scratch files.
    pub scratch_dir: Option<PathBuf>,

    pub clean_mask: CleanMaskParams,
    pub ndvi: NdviParams,
    pub geomedian: GeomedianParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: rayon::current_num_threads().max(1),
            geo_chunk_size: 0.5,
            time_chunk_size: None,
            time_chunk_count: 4,
            poll_interval_ms: 50,
            scratch_dir: None,
            clean_mask: CleanMaskParams::default(),
            ndvi: NdviParams::default(),
            geomedian: GeomedianParams::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CUBE_WORKERS") {
            if let Ok(workers) = val.parse() {
                config.workers = workers;
            }
        }

        if let Ok(val) = std::env::var("CUBE_GEO_CHUNK_SIZE") {
            if let Ok(size) = val.parse() {
                config.geo_chunk_size = size;
            }
        }

        if let Ok(val) = std::env::var("CUBE_TIME_CHUNK_SIZE") {
            config.time_chunk_size = val.parse().ok();
        }

        if let Ok(val) = std::env::var("CUBE_TIME_CHUNK_COUNT") {
            if let Ok(count) = val.parse() {
                config.time_chunk_count = count;
            }
        }

        if let Ok(val) = std::env::var("CUBE_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                config.poll_interval_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("CUBE_SCRATCH_DIR") {
            config.scratch_dir = Some(PathBuf::from(val));
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> CubeResult<()> {
        if self.workers == 0 {
            return Err(CubeError::Config("workers must be > 0".to_string()));
        }

        if !(self.geo_chunk_size.is_finite() && self.geo_chunk_size > 0.0) {
            return Err(CubeError::Config("geo_chunk_size must be > 0".to_string()));
        }

        if self.time_chunk_size == Some(0) {
            return Err(CubeError::Config("time_chunk_size must be > 0".to_string()));
        }

        if self.time_chunk_count == 0 {
            return Err(CubeError::Config("time_chunk_count must be > 0".to_string()));
        }

        if self.geomedian.max_iterations == 0 {
            return Err(CubeError::Config("geomedian.max_iterations must be > 0".to_string()));
        }

        Ok(())
    }

    /// Scratch root: configured directory, else the user cache dir, else the system temp dir.
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("cube-compositor")))
            .unwrap_or_else(std::env::temp_dir)
    }
}
