use crate::core::chunk_planner::{GeoChunk, TimeChunk};
use crate::core::clean_mask::{extract_clean_mask, CleanMaskParams, CleanMaskRule};
use crate::core::composite::{Composite, MaskedSeries};
use crate::core::compositor::Compositor;
use crate::io::{CancellationFlag, DataSource, LoadRequest, ScratchStore};
use crate::types::{AcquisitionStats, CubeError, CubeResult, Metadata, RasterTile, SpatialExtent, COORD_TOLERANCE};
use ndarray::Axis;
use serde::{Deserialize, Serialize};

/// What one chunk contributes to its geo chunk's time fold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartialResult {
    /// Already reduced (foldable algorithms)
    Composite(Composite),
    /// Masked samples kept for a reduction over the whole series
    Series(MaskedSeries),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkOutput {
    pub geo_chunk: usize,
    pub time_chunk: usize,
    pub partial: PartialResult,
    pub metadata: Metadata,
}

/// Loads and reduces one geo chunk x time chunk
pub struct ChunkWorker {
    request: LoadRequest,
    clean_mask: CleanMaskParams,
    rule: CleanMaskRule,
    cancel: CancellationFlag,
}

impl ChunkWorker {
    /// `request` names the measurement bands; the QA band is added here.
    pub fn new(
        mut request: LoadRequest,
        clean_mask: CleanMaskParams,
        rule: CleanMaskRule,
        cancel: CancellationFlag,
    ) -> Self {
        if !request.bands.contains(&clean_mask.qa_band) {
            request.bands.push(clean_mask.qa_band.clone());
        }
        Self {
            request,
            clean_mask,
            rule,
            cancel,
        }
    }

    /// Process one chunk.
    ///
    /// Returns `Ok(None)` when cancelled before starting, when the source has
    /// nothing for the chunk, or when the load failed (the chunk then counts
    /// as fully missing). Any other failure is returned.
    pub fn process(
        &self,
        geo: &GeoChunk,
        time: &TimeChunk,
        source: &dyn DataSource,
        compositor: &dyn Compositor,
    ) -> CubeResult<Option<ChunkOutput>> {
        if self.cancel.is_cancelled() {
            log::debug!("Skipping chunk g{} t{}: query cancelled", geo.index, time.index);
            return Ok(None);
        }

        let tile = match self.load(geo, time, source) {
            Ok(Some(tile)) => tile,
            Ok(None) => {
                log::debug!("No data for chunk g{} t{}", geo.index, time.index);
                return Ok(None);
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("{}; treating chunk as empty", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut tile = tile;
        let mask = extract_clean_mask(&mut tile, &self.clean_mask, &self.rule)?;
        let series = MaskedSeries::from_tile(&tile, &mask)?;

        let (_, rows, cols) = series.shape();
        let mut metadata = Metadata::new();
        for (t, date) in series.times.iter().enumerate() {
            let clean = mask.index_axis(Axis(0), t).iter().filter(|&&c| c).count() as u64;
            let mut stats = AcquisitionStats::new(clean, (rows * cols) as u64);
            stats.counters = compositor.acquisition_counters(&series, t)?;
            metadata.insert(*date, stats);
        }

        let partial = if compositor.is_foldable() {
            PartialResult::Composite(compositor.reduce(&series, None)?)
        } else {
            PartialResult::Series(series)
        };

        log::debug!(
            "Chunk g{} t{}: {} acquisitions over {} x {} pixels",
            geo.index,
            time.index,
            metadata.len(),
            rows,
            cols
        );

        Ok(Some(ChunkOutput {
            geo_chunk: geo.index,
            time_chunk: time.index,
            partial,
            metadata,
        }))
    }

    /// Process a chunk and persist its output. Returns whether anything was written.
    pub fn process_and_store(
        &self,
        geo: &GeoChunk,
        time: &TimeChunk,
        source: &dyn DataSource,
        compositor: &dyn Compositor,
        store: &ScratchStore,
    ) -> CubeResult<bool> {
        match self.process(geo, time, source, compositor)? {
            Some(output) => {
                store.put(geo.index, time.index, &output)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Fetch the chunk and keep only the chunk's acquisitions, oldest first,
    /// over the pixels the chunk owns
    fn load(&self, geo: &GeoChunk, time: &TimeChunk, source: &dyn DataSource) -> CubeResult<Option<RasterTile>> {
        let Some(range) = time.time_range() else {
            return Ok(None);
        };
        let request = self.request.narrowed(geo.extent, range);
        let load_error = |message: String| CubeError::ChunkLoad {
            geo_chunk: geo.index,
            time_chunk: time.index,
            message,
        };

        let tile = match source.load(&request) {
            Ok(Some(tile)) => tile,
            Ok(None) => return Ok(None),
            Err(e) => return Err(load_error(format!("{:#}", e))),
        };
        tile.validate().map_err(|e| load_error(e.to_string()))?;
        if tile.is_empty() {
            return Ok(None);
        }

        let times = tile
            .times
            .as_ref()
            .ok_or_else(|| load_error("source returned a tile without a time axis".to_string()))?;
        let mut keep: Vec<usize> = (0..times.len())
            .filter(|&i| time.acquisitions.contains(&times[i]))
            .collect();
        if keep.is_empty() {
            return Ok(None);
        }
        keep.sort_by_key(|&i| times[i]);

        let (rows, cols) = owned_pixels(&tile, &geo.extent, &self.request.extent);
        if rows.is_empty() || cols.is_empty() {
            return Ok(None);
        }

        let whole_grid = rows.len() == tile.latitude.len() && cols.len() == tile.longitude.len();
        if whole_grid && keep.len() == times.len() && keep.windows(2).all(|w| w[0] < w[1]) {
            return Ok(Some(tile));
        }
        Ok(Some(tile.select(&keep, &rows, &cols)))
    }
}

/// Row and column indices of `tile` owned by the chunk covering `chunk`.
///
/// Chunk bounds are inclusive, so a seam row or column is loaded by both
/// neighbours. An interior south edge belongs to the chunk below and an
/// interior east edge to the chunk on the right; the query's own outer edges
/// stay with the chunks that touch them.
fn owned_pixels(tile: &RasterTile, chunk: &SpatialExtent, query: &SpatialExtent) -> (Vec<usize>, Vec<usize>) {
    let south_is_seam = chunk.lat_min > query.lat_min + COORD_TOLERANCE;
    let east_is_seam = chunk.lon_max < query.lon_max - COORD_TOLERANCE;

    let rows = tile
        .latitude
        .iter()
        .enumerate()
        .filter(|(_, lat)| !(south_is_seam && **lat <= chunk.lat_min + COORD_TOLERANCE))
        .map(|(i, _)| i)
        .collect();
    let cols = tile
        .longitude
        .iter()
        .enumerate()
        .filter(|(_, lon)| !(east_is_seam && **lon >= chunk.lon_max - COORD_TOLERANCE))
        .map(|(i, _)| i)
        .collect();
    (rows, cols)
}
