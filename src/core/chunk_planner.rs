use crate::config::EngineConfig;
use crate::types::{AcquisitionDate, CubeError, CubeResult, SpatialExtent, TimeRange, COORD_TOLERANCE};
use serde::{Deserialize, Serialize};

/// Chunk sizing carried by each query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingParams {
    /// Side of a geographic chunk in degrees
    pub geo_chunk_size: f64,
    /// Acquisitions per time chunk; `None` splits into `time_chunk_count` runs
    pub time_chunk_size: Option<usize>,
    pub time_chunk_count: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl ChunkingParams {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            geo_chunk_size: config.geo_chunk_size,
            time_chunk_size: config.time_chunk_size,
            time_chunk_count: config.time_chunk_count,
        }
    }
}

/// Spatial partition of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoChunk {
    pub index: usize,
    pub extent: SpatialExtent,
}

/// Contiguous run of acquisitions, in fold order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeChunk {
    pub index: usize,
    pub acquisitions: Vec<AcquisitionDate>,
}

impl TimeChunk {
    /// Inclusive range spanning the chunk's acquisitions
    pub fn time_range(&self) -> Option<TimeRange> {
        let start = self.acquisitions.iter().min()?;
        let end = self.acquisitions.iter().max()?;
        Some(TimeRange { start: *start, end: *end })
    }
}

/// Complete partitioning of a query
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub geo_chunks: Vec<GeoChunk>,
    pub time_chunks: Vec<TimeChunk>,
}

impl ChunkPlan {
    pub fn task_count(&self) -> usize {
        self.geo_chunks.len() * self.time_chunks.len()
    }
}

/// Splits a query into geo and time chunks
pub struct ChunkPlanner {
    params: ChunkingParams,
}

impl ChunkPlanner {
    pub fn new(params: ChunkingParams) -> Self {
        Self { params }
    }

    /// Plan a query. Fails before producing anything if there are no acquisitions.
    pub fn plan(
        &self,
        extent: &SpatialExtent,
        acquisitions: &[AcquisitionDate],
        reverse: bool,
    ) -> CubeResult<ChunkPlan> {
        let time_chunks = split_temporal(
            acquisitions,
            self.params.time_chunk_size,
            self.params.time_chunk_count,
            reverse,
        )?;
        let geo_chunks = split_geographic(extent, self.params.geo_chunk_size)?;

        log::info!(
            "Planned {} geo chunks x {} time chunks ({} acquisitions)",
            geo_chunks.len(),
            time_chunks.len(),
            acquisitions.len()
        );

        Ok(ChunkPlan { geo_chunks, time_chunks })
    }
}

fn axis_steps(span: f64, chunk_size: f64) -> usize {
    ((span / chunk_size) - COORD_TOLERANCE).ceil().max(1.0) as usize
}

/// Tile `extent` into `chunk_size`-degree boxes, row-major from the north-west corner.
///
/// The last row and column absorb the remainder and may be smaller.
pub fn split_geographic(extent: &SpatialExtent, chunk_size: f64) -> CubeResult<Vec<GeoChunk>> {
    extent.validate()?;
    if !(chunk_size.is_finite() && chunk_size > 0.0) {
        return Err(CubeError::Config(format!("geo chunk size must be > 0, got {}", chunk_size)));
    }

    let rows = axis_steps(extent.height(), chunk_size);
    let cols = axis_steps(extent.width(), chunk_size);
    let mut chunks = Vec::with_capacity(rows * cols);

    for row in 0..rows {
        let lat_max = extent.lat_max - row as f64 * chunk_size;
        let lat_min = if row + 1 == rows {
            extent.lat_min
        } else {
            extent.lat_max - (row + 1) as f64 * chunk_size
        };
        for col in 0..cols {
            let lon_min = extent.lon_min + col as f64 * chunk_size;
            let lon_max = if col + 1 == cols {
                extent.lon_max
            } else {
                extent.lon_min + (col + 1) as f64 * chunk_size
            };
            chunks.push(GeoChunk {
                index: chunks.len(),
                extent: SpatialExtent { lat_min, lat_max, lon_min, lon_max },
            });
        }
    }

    log::debug!("Split extent into {} x {} geo chunks", rows, cols);
    Ok(chunks)
}

/// Slice acquisitions into contiguous time chunks.
///
/// Acquisitions are sorted ascending and de-duplicated first. With `chunk_size`
/// set, each run holds that many acquisitions (the last may be shorter);
/// otherwise the list is split into `chunk_count` near-equal runs. `reverse`
/// flips both the run order and the order inside each run.
pub fn split_temporal(
    acquisitions: &[AcquisitionDate],
    chunk_size: Option<usize>,
    chunk_count: usize,
    reverse: bool,
) -> CubeResult<Vec<TimeChunk>> {
    if acquisitions.is_empty() {
        return Err(CubeError::InsufficientData(
            "No acquisitions match the requested extent and time range".to_string(),
        ));
    }

    let mut sorted = acquisitions.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut runs: Vec<Vec<AcquisitionDate>> = match chunk_size {
        Some(0) => {
            return Err(CubeError::Config("time chunk size must be > 0".to_string()));
        }
        Some(size) => sorted.chunks(size).map(|run| run.to_vec()).collect(),
        None => {
            if chunk_count == 0 {
                return Err(CubeError::Config("time chunk count must be > 0".to_string()));
            }
            let count = chunk_count.min(sorted.len());
            let base = sorted.len() / count;
            let extra = sorted.len() % count;
            let mut runs = Vec::with_capacity(count);
            let mut start = 0;
            for i in 0..count {
                let len = base + usize::from(i < extra);
                runs.push(sorted[start..start + len].to_vec());
                start += len;
            }
            runs
        }
    };

    if reverse {
        runs.reverse();
        for run in runs.iter_mut() {
            run.reverse();
        }
    }

    Ok(runs
        .into_iter()
        .enumerate()
        .map(|(index, acquisitions)| TimeChunk { index, acquisitions })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn dates(n: u32) -> Vec<AcquisitionDate> {
        (1..=n).map(|d| Utc.with_ymd_and_hms(2021, 3, d, 10, 0, 0).unwrap()).collect()
    }

    #[test]
    fn test_single_chunk_when_extent_equals_chunk_size() {
        let extent = SpatialExtent::new(0.0, 0.5, 10.0, 10.5).unwrap();
        let chunks = split_geographic(&extent, 0.5).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].extent, extent);
    }

    #[test]
    fn test_geo_chunks_tile_extent() {
        let extent = SpatialExtent::new(-1.0, 0.3, 5.0, 6.2).unwrap();
        let chunks = split_geographic(&extent, 0.5).unwrap();
        // 1.3 deg tall -> 3 rows, 1.2 deg wide -> 3 cols
        assert_eq!(chunks.len(), 9);

        let area: f64 = chunks.iter().map(|c| c.extent.height() * c.extent.width()).sum();
        assert!((area - extent.height() * extent.width()).abs() < 1e-9);

        // Row-major from the north-west corner
        assert!((chunks[0].extent.lat_max - 0.3).abs() < 1e-12);
        assert!((chunks[0].extent.lon_min - 5.0).abs() < 1e-12);
        assert!((chunks[1].extent.lon_min - 5.5).abs() < 1e-12);
        assert!((chunks[3].extent.lat_max - (-0.2)).abs() < 1e-12);
        assert!((chunks[8].extent.lat_min - (-1.0)).abs() < 1e-12);
        assert!((chunks[8].extent.lon_max - 6.2).abs() < 1e-12);

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn test_temporal_split_by_size() {
        let chunks = split_temporal(&dates(5), Some(2), 1, false).unwrap();
        let lens: Vec<usize> = chunks.iter().map(|c| c.acquisitions.len()).collect();
        assert_eq!(lens, vec![2, 2, 1]);
        let flat: Vec<_> = chunks.iter().flat_map(|c| c.acquisitions.clone()).collect();
        assert_eq!(flat, dates(5));
    }

    #[test]
    fn test_temporal_split_by_count_is_near_equal() {
        let chunks = split_temporal(&dates(7), None, 3, false).unwrap();
        let lens: Vec<usize> = chunks.iter().map(|c| c.acquisitions.len()).collect();
        assert_eq!(lens, vec![3, 2, 2]);
    }

    #[test]
    fn test_temporal_split_reverse() {
        let mut shuffled = dates(5);
        shuffled.swap(0, 4);
        let chunks = split_temporal(&shuffled, Some(2), 1, true).unwrap();
        let flat: Vec<_> = chunks.iter().flat_map(|c| c.acquisitions.clone()).collect();
        let mut expected = dates(5);
        expected.reverse();
        // Runs [1,2] [3,4] [5] reversed -> [5] [4,3] [2,1]
        assert_eq!(flat, expected);
        assert_eq!(chunks[0].acquisitions.len(), 1);
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn test_empty_acquisitions_is_insufficient_data() {
        let err = split_temporal(&[], Some(2), 1, false).unwrap_err();
        assert!(matches!(err, CubeError::InsufficientData(_)));
    }

    #[test]
    fn test_time_chunk_range() {
        let chunks = split_temporal(&dates(4), Some(2), 1, true).unwrap();
        let range = chunks[0].time_range().unwrap();
        assert_eq!(range.start, dates(4)[2]);
        assert_eq!(range.end, dates(4)[3]);
    }
}
