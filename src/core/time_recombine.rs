use crate::core::chunk_worker::{ChunkOutput, PartialResult};
use crate::core::composite::{Composite, MaskedSeries};
use crate::core::compositor::Compositor;
use crate::io::ScratchStore;
use crate::types::{CubeError, CubeResult, Metadata};

/// One geo chunk after its time fold. `composite` is `None` when no time
/// chunk produced data.
#[derive(Debug, Clone)]
pub struct GeoChunkResult {
    pub geo_chunk: usize,
    pub composite: Option<Composite>,
    pub metadata: Metadata,
}

/// Folds a geo chunk's time-chunk partials in time chunk order
pub struct TimeRecombiner<'a> {
    compositor: &'a dyn Compositor,
}

impl<'a> TimeRecombiner<'a> {
    pub fn new(compositor: &'a dyn Compositor) -> Self {
        Self { compositor }
    }

    /// Recombine partials for `geo_chunk`. Completion order does not matter;
    /// outputs are sorted by time chunk before folding and `None` entries are skipped.
    pub fn recombine(&self, geo_chunk: usize, outputs: Vec<Option<ChunkOutput>>) -> CubeResult<GeoChunkResult> {
        let mut outputs: Vec<ChunkOutput> = outputs.into_iter().flatten().collect();
        outputs.sort_by_key(|o| o.time_chunk);

        let mut metadata = Metadata::new();
        let mut running: Option<Composite> = None;
        let mut series: Vec<MaskedSeries> = Vec::new();

        for output in outputs {
            if output.geo_chunk != geo_chunk {
                return Err(CubeError::Compute(format!(
                    "partial for geo chunk {} handed to geo chunk {}",
                    output.geo_chunk, geo_chunk
                )));
            }
            metadata.merge(output.metadata);

            match (output.partial, self.compositor.is_foldable()) {
                (PartialResult::Composite(next), true) => {
                    running = Some(match running {
                        Some(prev) => self.compositor.combine(prev, next)?,
                        None => next,
                    });
                }
                (PartialResult::Series(part), false) => series.push(part),
                _ => {
                    return Err(CubeError::Compute(format!(
                        "partial result kind does not match {} compositor",
                        self.compositor.name()
                    )))
                }
            }
        }

        if !series.is_empty() {
            let assembled = MaskedSeries::concat(series)?;
            log::debug!(
                "Reducing {} assembled time steps for geo chunk {}",
                assembled.time_len(),
                geo_chunk
            );
            running = Some(self.compositor.reduce(&assembled, None)?);
        }

        Ok(GeoChunkResult {
            geo_chunk,
            composite: running,
            metadata,
        })
    }

    /// Take every stored partial of `geo_chunk` out of scratch and recombine them
    pub fn recombine_from_store(
        &self,
        geo_chunk: usize,
        time_chunk_count: usize,
        store: &ScratchStore,
    ) -> CubeResult<GeoChunkResult> {
        let mut outputs = Vec::with_capacity(time_chunk_count);
        for time_chunk in 0..time_chunk_count {
            outputs.push(store.take::<ChunkOutput>(geo_chunk, time_chunk)?);
        }
        self.recombine(geo_chunk, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::composite::Accumulator;
    use crate::core::compositor::{MeanCompositor, MosaicCompositor};
    use crate::core::geomedian::MedoidCompositor;
    use crate::types::{AcquisitionDate, AcquisitionStats, BandArray, RasterTile};
    use chrono::{TimeZone, Utc};
    use ndarray::Array3;

    fn date(day: u32) -> AcquisitionDate {
        Utc.with_ymd_and_hms(2016, 8, day, 0, 0, 0).unwrap()
    }

    fn series(days: &[u32], values: Vec<f32>) -> MaskedSeries {
        let n = days.len();
        let tile = RasterTile::new(vec![0.0], vec![0.0], Some(days.iter().map(|&d| date(d)).collect()), -9999.0)
            .with_band("red", BandArray::Float32(Array3::from_shape_vec((n, 1, 1), values).unwrap()))
            .unwrap();
        MaskedSeries::from_tile(&tile, &Array3::from_elem((n, 1, 1), true)).unwrap()
    }

    fn output(compositor: &dyn Compositor, time_chunk: usize, days: &[u32], values: Vec<f32>) -> ChunkOutput {
        let s = series(days, values);
        let mut metadata = Metadata::new();
        for &d in days {
            metadata.insert(date(d), AcquisitionStats::new(1, 1));
        }
        let partial = if compositor.is_foldable() {
            PartialResult::Composite(compositor.reduce(&s, None).unwrap())
        } else {
            PartialResult::Series(s)
        };
        ChunkOutput { geo_chunk: 0, time_chunk, partial, metadata }
    }

    #[test]
    fn test_sorts_before_folding() {
        let mosaic = MosaicCompositor::new(false);
        let outputs = vec![
            Some(output(&mosaic, 1, &[3], vec![30.0])),
            None,
            Some(output(&mosaic, 0, &[1], vec![10.0])),
        ];
        let result = TimeRecombiner::new(&mosaic).recombine(0, outputs).unwrap();
        let composite = result.composite.unwrap();
        assert_eq!(composite.band("red").unwrap()[[0, 0]], 10.0);
        assert_eq!(result.metadata.len(), 2);
    }

    #[test]
    fn test_mean_fold_matches_whole_series() {
        let outputs = vec![
            Some(output(&MeanCompositor, 0, &[1, 2], vec![1.0, 2.0])),
            Some(output(&MeanCompositor, 1, &[3], vec![9.0])),
        ];
        let result = TimeRecombiner::new(&MeanCompositor).recombine(0, outputs).unwrap();
        let composite = result.composite.unwrap();
        assert_eq!(composite.band("red").unwrap()[[0, 0]], 4.0);
        assert!(matches!(composite.state, Accumulator::Mean { .. }));
    }

    #[test]
    fn test_non_foldable_reduces_once() {
        let outputs = vec![
            Some(output(&MedoidCompositor, 0, &[1, 2], vec![1.0, 2.0])),
            Some(output(&MedoidCompositor, 1, &[3], vec![100.0])),
        ];
        let result = TimeRecombiner::new(&MedoidCompositor).recombine(0, outputs).unwrap();
        assert_eq!(result.composite.unwrap().band("red").unwrap()[[0, 0]], 2.0);
        assert_eq!(result.metadata.len(), 3);
    }

    #[test]
    fn test_all_empty_has_no_composite() {
        let result = TimeRecombiner::new(&MeanCompositor).recombine(4, vec![None, None]).unwrap();
        assert!(result.composite.is_none());
        assert!(result.metadata.is_empty());
        assert_eq!(result.geo_chunk, 4);
    }

    #[test]
    fn test_recombine_from_store_consumes_entries() {
        let root = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(root.path()).unwrap();
        store.put(0, 1, &output(&MeanCompositor, 1, &[2], vec![4.0])).unwrap();
        store.put(0, 0, &output(&MeanCompositor, 0, &[1], vec![2.0])).unwrap();

        let result = TimeRecombiner::new(&MeanCompositor)
            .recombine_from_store(0, 3, &store)
            .unwrap();
        assert_eq!(result.composite.unwrap().band("red").unwrap()[[0, 0]], 3.0);
        assert!(store.is_empty());
    }
}
