use crate::config::EngineConfig;
use crate::core::composite::{Accumulator, Composite, MaskedSeries, Objective};
use crate::core::geomedian::{GeomedianCompositor, MedoidCompositor};
use crate::types::{CleanMask, CubeError, CubeResult, RasterTile};
use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Available compositing algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeAlgorithm {
    MostRecent,
    LeastRecent,
    Mean,
    Median,
    MaxNdvi,
    MinNdvi,
    Geomedian,
    Medoid,
}

impl CompositeAlgorithm {
    /// `reverse_time` a query gets when it does not set one
    pub fn default_reverse_time(self) -> bool {
        matches!(self, CompositeAlgorithm::MostRecent)
    }

    /// Whether partial results can be folded one time chunk at a time
    pub fn is_foldable(self) -> bool {
        !matches!(self, CompositeAlgorithm::Geomedian | CompositeAlgorithm::Medoid)
    }

    /// Instantiate the compositor strategy for a query
    pub fn build(self, reverse_time: bool, config: &EngineConfig) -> Arc<dyn Compositor> {
        match self {
            CompositeAlgorithm::MostRecent | CompositeAlgorithm::LeastRecent => {
                Arc::new(MosaicCompositor::for_algorithm(self, reverse_time))
            }
            CompositeAlgorithm::Mean => Arc::new(MeanCompositor),
            CompositeAlgorithm::Median => Arc::new(MedianCompositor),
            CompositeAlgorithm::MaxNdvi => Arc::new(NdviCompositor::new(
                Objective::Maximize,
                &config.ndvi.nir_band,
                &config.ndvi.red_band,
            )),
            CompositeAlgorithm::MinNdvi => Arc::new(NdviCompositor::new(
                Objective::Minimize,
                &config.ndvi.nir_band,
                &config.ndvi.red_band,
            )),
            CompositeAlgorithm::Geomedian => Arc::new(GeomedianCompositor::new(config.geomedian.clone())),
            CompositeAlgorithm::Medoid => Arc::new(MedoidCompositor),
        }
    }
}

impl CompositeAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            CompositeAlgorithm::MostRecent => "most_recent",
            CompositeAlgorithm::LeastRecent => "least_recent",
            CompositeAlgorithm::Mean => "mean",
            CompositeAlgorithm::Median => "median",
            CompositeAlgorithm::MaxNdvi => "max_ndvi",
            CompositeAlgorithm::MinNdvi => "min_ndvi",
            CompositeAlgorithm::Geomedian => "geomedian",
            CompositeAlgorithm::Medoid => "medoid",
        }
    }
}

impl std::fmt::Display for CompositeAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CompositeAlgorithm {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "most_recent" => Ok(CompositeAlgorithm::MostRecent),
            "least_recent" => Ok(CompositeAlgorithm::LeastRecent),
            "mean" => Ok(CompositeAlgorithm::Mean),
            "median" => Ok(CompositeAlgorithm::Median),
            "max_ndvi" => Ok(CompositeAlgorithm::MaxNdvi),
            "min_ndvi" => Ok(CompositeAlgorithm::MinNdvi),
            "geomedian" => Ok(CompositeAlgorithm::Geomedian),
            "medoid" => Ok(CompositeAlgorithm::Medoid),
            other => Err(CubeError::InvalidQuery(format!("Unknown compositing algorithm: {}", other))),
        }
    }
}

/// A pixel-compositing strategy.
///
/// Implementations never fail on pixels without observations; those stay NaN
/// and come out as `no_data`.
pub trait Compositor: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_foldable(&self) -> bool {
        true
    }

    /// Reduce one masked time series to a composite
    fn reduce_series(&self, series: &MaskedSeries) -> CubeResult<Composite>;

    /// Fold `next` into `running`. `running` comes first in fold order.
    ///
    /// Also used to resolve pixels shared by two geo chunks.
    fn combine(&self, running: Composite, next: Composite) -> CubeResult<Composite>;

    /// Reduce `series`, continuing from a prior running composite when given
    fn reduce(&self, series: &MaskedSeries, intermediate: Option<Composite>) -> CubeResult<Composite> {
        let partial = self.reduce_series(series)?;
        match intermediate {
            Some(running) => self.combine(running, partial),
            None => Ok(partial),
        }
    }

    /// Extra per-acquisition counters recorded in the query metadata
    fn acquisition_counters(&self, _series: &MaskedSeries, _t: usize) -> CubeResult<BTreeMap<String, u64>> {
        Ok(BTreeMap::new())
    }

    /// Reject band lists the algorithm cannot work with
    fn check_bands(&self, _bands: &[String]) -> CubeResult<()> {
        Ok(())
    }
}

/// Composite a raw tile under a clean mask. `no_data` comes from the tile.
pub fn composite(
    compositor: &dyn Compositor,
    tile: &RasterTile,
    clean_mask: &CleanMask,
    intermediate: Option<Composite>,
) -> CubeResult<Composite> {
    let series = MaskedSeries::from_tile(tile, clean_mask)?;
    compositor.reduce(&series, intermediate)
}

/// Copy every band at pixels where `running` has nothing and `next` has a full pixel
pub(crate) fn fill_missing_pixels(mut running: Composite, next: &Composite) -> Composite {
    let (rows, cols) = running.shape();
    for r in 0..rows {
        for c in 0..cols {
            if !running.pixel_present(r, c) && next.pixel_present(r, c) {
                for (name, plane) in running.values.iter_mut() {
                    plane[[r, c]] = next.values[name][[r, c]];
                }
            }
        }
    }
    running
}

/// First valid observation along time (most recent first when `reverse_time`)
pub struct MosaicCompositor {
    algorithm: CompositeAlgorithm,
    reverse_time: bool,
}

impl MosaicCompositor {
    /// Named after the direction it scans in
    pub fn new(reverse_time: bool) -> Self {
        let algorithm = if reverse_time {
            CompositeAlgorithm::MostRecent
        } else {
            CompositeAlgorithm::LeastRecent
        };
        Self::for_algorithm(algorithm, reverse_time)
    }

    /// Keeps the requested algorithm's name even when the query overrides its direction
    pub fn for_algorithm(algorithm: CompositeAlgorithm, reverse_time: bool) -> Self {
        Self { algorithm, reverse_time }
    }
}

impl Compositor for MosaicCompositor {
    fn name(&self) -> &'static str {
        self.algorithm.as_str()
    }

    fn reduce_series(&self, series: &MaskedSeries) -> CubeResult<Composite> {
        let (t_len, rows, cols) = series.shape();
        let order: Vec<usize> = if self.reverse_time {
            (0..t_len).rev().collect()
        } else {
            (0..t_len).collect()
        };

        let present = ndarray::Array3::from_shape_fn((t_len, rows, cols), |(i, r, c)| {
            series.sample_present(order[i], r, c)
        });

        let mut out = series.empty_composite(Accumulator::Selection);
        for r in 0..rows {
            for c in 0..cols {
                let first = (0..t_len).find(|&i| present[[i, r, c]]);
                if let Some(i) = first {
                    let src = order[i];
                    for (name, plane) in out.values.iter_mut() {
                        plane[[r, c]] = series.bands[name][[src, r, c]];
                    }
                }
            }
        }
        Ok(out)
    }

    fn combine(&self, running: Composite, next: Composite) -> CubeResult<Composite> {
        running.ensure_compatible(&next)?;
        Ok(fill_missing_pixels(running, &next))
    }
}

/// Per-pixel mean over valid samples
pub struct MeanCompositor;

impl Compositor for MeanCompositor {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn reduce_series(&self, series: &MaskedSeries) -> CubeResult<Composite> {
        let mut sums = BTreeMap::new();
        let mut counts = BTreeMap::new();
        for (name, cube) in &series.bands {
            let sum = cube.fold_axis(Axis(0), 0.0, |acc, &v| if v.is_nan() { *acc } else { acc + v });
            let count = cube.fold_axis(Axis(0), 0u32, |acc, &v| if v.is_nan() { *acc } else { acc + 1 });
            sums.insert(name.clone(), sum);
            counts.insert(name.clone(), count);
        }

        let mut out = series.empty_composite(Accumulator::Selection);
        for (name, plane) in out.values.iter_mut() {
            *plane = mean_plane(&sums[name], &counts[name]);
        }
        out.state = Accumulator::Mean { sum: sums, count: counts };
        Ok(out)
    }

    fn combine(&self, mut running: Composite, next: Composite) -> CubeResult<Composite> {
        running.ensure_compatible(&next)?;
        let Accumulator::Mean { sum: nsum, count: ncount } = next.state else {
            return Err(CubeError::Compute("mean fold requires mean accumulators".to_string()));
        };
        let Accumulator::Mean { sum, count } = &mut running.state else {
            return Err(CubeError::Compute("mean fold requires mean accumulators".to_string()));
        };

        for (name, plane) in sum.iter_mut() {
            *plane += &nsum[name];
        }
        for (name, plane) in count.iter_mut() {
            *plane += &ncount[name];
        }
        for (name, plane) in running.values.iter_mut() {
            *plane = mean_plane(&sum[name], &count[name]);
        }
        Ok(running)
    }
}

fn mean_plane(sum: &Array2<f64>, count: &Array2<u32>) -> Array2<f64> {
    Zip::from(sum)
        .and(count)
        .map_collect(|&s, &n| if n == 0 { f64::NAN } else { s / n as f64 })
}

/// Per-pixel median over valid samples.
///
/// The accumulator keeps every valid sample, sorted, so folding time chunks
/// gives the same median as reducing the joined series.
pub struct MedianCompositor;

fn sorted_samples(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut samples: Vec<f64> = values.filter(|v| !v.is_nan()).collect();
    samples.sort_by(|a, b| a.total_cmp(b));
    samples
}

fn sorted_median(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return f64::NAN;
    }
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2.0
    } else {
        samples[mid]
    }
}

fn merge_sorted(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] <= b[j] {
            merged.push(a[i]);
            i += 1;
        } else {
            merged.push(b[j]);
            j += 1;
        }
    }
    merged.extend_from_slice(&a[i..]);
    merged.extend_from_slice(&b[j..]);
    merged
}

impl Compositor for MedianCompositor {
    fn name(&self) -> &'static str {
        "median"
    }

    fn reduce_series(&self, series: &MaskedSeries) -> CubeResult<Composite> {
        let mut out = series.empty_composite(Accumulator::Selection);
        let mut samples = BTreeMap::new();
        for (name, cube) in &series.bands {
            let pixel_samples = cube.map_axis(Axis(0), |lane| sorted_samples(lane.iter().copied()));
            out.values.insert(name.clone(), pixel_samples.map(|s| sorted_median(s)));
            samples.insert(name.clone(), pixel_samples);
        }
        out.state = Accumulator::Median { samples };
        Ok(out)
    }

    fn combine(&self, mut running: Composite, next: Composite) -> CubeResult<Composite> {
        running.ensure_compatible(&next)?;
        let nsamples = match next.state {
            Accumulator::Median { samples } => samples,
            _ => return Err(CubeError::Compute("median fold requires median accumulators".to_string())),
        };
        let samples = match &mut running.state {
            Accumulator::Median { samples } => samples,
            _ => return Err(CubeError::Compute("median fold requires median accumulators".to_string())),
        };

        for (name, plane) in running.values.iter_mut() {
            let held = samples.get_mut(name).ok_or_else(|| {
                CubeError::Compute(format!("median samples missing for band '{}'", name))
            })?;
            let incoming = nsamples.get(name).ok_or_else(|| {
                CubeError::Compute(format!("median samples missing for band '{}'", name))
            })?;
            Zip::from(plane).and(held).and(incoming).for_each(|m, s, n| {
                if n.is_empty() {
                    return;
                }
                *s = merge_sorted(s, n);
                *m = sorted_median(s);
            });
        }
        Ok(running)
    }
}

/// Keeps, per pixel, every band from the time slice with the best NDVI
pub struct NdviCompositor {
    objective: Objective,
    nir_band: String,
    red_band: String,
}

impl NdviCompositor {
    pub fn new(objective: Objective, nir_band: &str, red_band: &str) -> Self {
        Self {
            objective,
            nir_band: nir_band.to_string(),
            red_band: red_band.to_string(),
        }
    }

    /// NDVI for one time slice; NaN wherever either input is missing or the sum is zero
    pub fn ndvi_slice(&self, series: &MaskedSeries, t: usize) -> CubeResult<Array2<f64>> {
        let nir = series.band(&self.nir_band)?.index_axis(Axis(0), t);
        let red = series.band(&self.red_band)?.index_axis(Axis(0), t);
        Ok(Zip::from(&nir).and(&red).map_collect(|&n, &r| {
            let denom = n + r;
            if n.is_nan() || r.is_nan() || denom == 0.0 {
                f64::NAN
            } else {
                (n - r) / denom
            }
        }))
    }
}

impl Compositor for NdviCompositor {
    fn name(&self) -> &'static str {
        match self.objective {
            Objective::Maximize => "max_ndvi",
            Objective::Minimize => "min_ndvi",
        }
    }

    fn reduce_series(&self, series: &MaskedSeries) -> CubeResult<Composite> {
        let (t_len, rows, cols) = series.shape();
        let sentinel = self.objective.sentinel();
        let mut best = Array2::from_elem((rows, cols), sentinel);
        let mut out = series.empty_composite(Accumulator::Selection);

        for t in 0..t_len {
            let ndvi = self.ndvi_slice(series, t)?;
            for r in 0..rows {
                for c in 0..cols {
                    let score = if ndvi[[r, c]].is_nan() { sentinel } else { ndvi[[r, c]] };
                    if self.objective.beats(score, best[[r, c]]) {
                        best[[r, c]] = score;
                        for (name, plane) in out.values.iter_mut() {
                            plane[[r, c]] = series.bands[name][[t, r, c]];
                        }
                    }
                }
            }
        }

        out.state = Accumulator::BestScore { score: best, objective: self.objective };
        Ok(out)
    }

    fn combine(&self, mut running: Composite, next: Composite) -> CubeResult<Composite> {
        running.ensure_compatible(&next)?;
        let next_score = match &next.state {
            Accumulator::BestScore { score, .. } => score,
            _ => return Err(CubeError::Compute("NDVI fold requires best-score accumulators".to_string())),
        };
        let best = match &mut running.state {
            Accumulator::BestScore { score, .. } => score,
            _ => return Err(CubeError::Compute("NDVI fold requires best-score accumulators".to_string())),
        };

        let (rows, cols) = best.dim();
        for r in 0..rows {
            for c in 0..cols {
                if self.objective.beats(next_score[[r, c]], best[[r, c]]) {
                    best[[r, c]] = next_score[[r, c]];
                    for (name, plane) in running.values.iter_mut() {
                        plane[[r, c]] = next.values[name][[r, c]];
                    }
                }
            }
        }
        Ok(running)
    }

    fn acquisition_counters(&self, series: &MaskedSeries, t: usize) -> CubeResult<BTreeMap<String, u64>> {
        let valid = self.ndvi_slice(series, t)?.iter().filter(|v| !v.is_nan()).count() as u64;
        let mut counters = BTreeMap::new();
        counters.insert("ndvi_valid_pixels".to_string(), valid);
        Ok(counters)
    }

    fn check_bands(&self, bands: &[String]) -> CubeResult<()> {
        for required in [&self.nir_band, &self.red_band] {
            if !bands.iter().any(|b| b == required) {
                return Err(CubeError::InvalidQuery(format!(
                    "{} needs band '{}' in the query",
                    self.name(),
                    required
                )));
            }
        }
        Ok(())
    }
}
