//! Multivariate per-pixel center statistics.
//!
//! Both reductions look at every band jointly and need the whole time series of
//! a geo chunk at once, so they cannot be folded chunk by chunk. Pixels are
//! independent, which is where the parallelism goes.

use crate::config::GeomedianParams;
use crate::core::composite::{Accumulator, Composite, MaskedSeries};
use crate::core::compositor::{fill_missing_pixels, Compositor};
use crate::types::{CubeError, CubeResult};

/// Maps one pixel's observation vectors (one per valid time step) to a center
type PixelReducer<'a> = dyn Fn(&[Vec<f64>]) -> Vec<f64> + Sync + 'a;

fn pixel_observations(series: &MaskedSeries, names: &[&String], row: usize, col: usize) -> Vec<Vec<f64>> {
    (0..series.time_len())
        .filter(|&t| series.sample_present(t, row, col))
        .map(|t| names.iter().map(|name| series.bands[*name][[t, row, col]]).collect())
        .collect()
}

#[cfg(feature = "parallel")]
fn reduce_all_pixels(series: &MaskedSeries, names: &[&String], reducer: &PixelReducer) -> Vec<Option<Vec<f64>>> {
    use rayon::prelude::*;

    let cols = series.longitude.len();
    let pixels = series.latitude.len() * cols;
    (0..pixels)
        .into_par_iter()
        .map(|idx| {
            let obs = pixel_observations(series, names, idx / cols, idx % cols);
            if obs.is_empty() {
                None
            } else {
                Some(reducer(&obs))
            }
        })
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn reduce_all_pixels(series: &MaskedSeries, names: &[&String], reducer: &PixelReducer) -> Vec<Option<Vec<f64>>> {
    let cols = series.longitude.len();
    let pixels = series.latitude.len() * cols;
    (0..pixels)
        .map(|idx| {
            let obs = pixel_observations(series, names, idx / cols, idx % cols);
            if obs.is_empty() {
                None
            } else {
                Some(reducer(&obs))
            }
        })
        .collect()
}

fn reduce_per_pixel(series: &MaskedSeries, reducer: &PixelReducer) -> Composite {
    let names: Vec<&String> = series.bands.keys().collect();
    let cols = series.longitude.len();
    let results = reduce_all_pixels(series, &names, reducer);

    let mut out = series.empty_composite(Accumulator::Selection);
    for (idx, center) in results.into_iter().enumerate() {
        let Some(center) = center else { continue };
        let (row, col) = (idx / cols, idx % cols);
        for (b, name) in names.iter().enumerate() {
            if let Some(plane) = out.values.get_mut(*name) {
                plane[[row, col]] = center[b];
            }
        }
    }
    out
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

/// Weiszfeld iteration from the coordinate-wise mean
pub fn geometric_median(observations: &[Vec<f64>], params: &GeomedianParams) -> Vec<f64> {
    let dims = observations[0].len();
    let n = observations.len() as f64;
    let mut estimate: Vec<f64> = (0..dims)
        .map(|d| observations.iter().map(|o| o[d]).sum::<f64>() / n)
        .collect();

    for _ in 0..params.max_iterations {
        let mut numerator = vec![0.0; dims];
        let mut denominator = 0.0;
        for obs in observations {
            let dist = distance(obs, &estimate);
            // a point sitting on the estimate has no defined weight
            if dist < 1e-12 {
                continue;
            }
            let weight = 1.0 / dist;
            for d in 0..dims {
                numerator[d] += obs[d] * weight;
            }
            denominator += weight;
        }
        if denominator == 0.0 {
            break;
        }
        let next: Vec<f64> = numerator.iter().map(|v| v / denominator).collect();
        let shift = distance(&next, &estimate);
        estimate = next;
        if shift < params.tolerance {
            break;
        }
    }
    estimate
}

/// The observation with the smallest summed distance to all others (earliest on ties)
pub fn medoid(observations: &[Vec<f64>]) -> Vec<f64> {
    let mut best = 0;
    let mut best_cost = f64::INFINITY;
    for (i, candidate) in observations.iter().enumerate() {
        let cost: f64 = observations.iter().map(|o| distance(candidate, o)).sum();
        if cost < best_cost {
            best_cost = cost;
            best = i;
        }
    }
    observations[best].clone()
}

fn reject_intermediate(name: &str, intermediate: &Option<Composite>) -> CubeResult<()> {
    if intermediate.is_some() {
        return Err(CubeError::Compute(format!(
            "{} cannot be folded incrementally; reduce the assembled time series instead",
            name
        )));
    }
    Ok(())
}

/// Per-pixel geometric median across all bands
pub struct GeomedianCompositor {
    params: GeomedianParams,
}

impl GeomedianCompositor {
    pub fn new(params: GeomedianParams) -> Self {
        Self { params }
    }
}

impl Compositor for GeomedianCompositor {
    fn name(&self) -> &'static str {
        "geomedian"
    }

    fn is_foldable(&self) -> bool {
        false
    }

    fn reduce_series(&self, series: &MaskedSeries) -> CubeResult<Composite> {
        log::debug!(
            "Geomedian over {} time steps, {} x {} pixels",
            series.time_len(),
            series.latitude.len(),
            series.longitude.len()
        );
        let params = &self.params;
        Ok(reduce_per_pixel(series, &|obs: &[Vec<f64>]| geometric_median(obs, params)))
    }

    fn reduce(&self, series: &MaskedSeries, intermediate: Option<Composite>) -> CubeResult<Composite> {
        reject_intermediate(self.name(), &intermediate)?;
        self.reduce_series(series)
    }

    /// Only used at geo chunk seams, where both sides saw the same samples
    fn combine(&self, running: Composite, next: Composite) -> CubeResult<Composite> {
        running.ensure_compatible(&next)?;
        Ok(fill_missing_pixels(running, &next))
    }
}

/// Per-pixel medoid across all bands
pub struct MedoidCompositor;

impl Compositor for MedoidCompositor {
    fn name(&self) -> &'static str {
        "medoid"
    }

    fn is_foldable(&self) -> bool {
        false
    }

    fn reduce_series(&self, series: &MaskedSeries) -> CubeResult<Composite> {
        Ok(reduce_per_pixel(series, &|obs: &[Vec<f64>]| medoid(obs)))
    }

    fn reduce(&self, series: &MaskedSeries, intermediate: Option<Composite>) -> CubeResult<Composite> {
        reject_intermediate(self.name(), &intermediate)?;
        self.reduce_series(series)
    }

    fn combine(&self, running: Composite, next: Composite) -> CubeResult<Composite> {
        running.ensure_compatible(&next)?;
        Ok(fill_missing_pixels(running, &next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BandArray, RasterTile};
    use approx::assert_abs_diff_eq;
    use chrono::{TimeZone, Utc};
    use ndarray::Array3;

    fn series(red: Vec<f32>, nir: Vec<f32>, mask: Vec<bool>) -> MaskedSeries {
        let n = red.len();
        let times = (0..n)
            .map(|i| Utc.with_ymd_and_hms(2018, 1, 1 + i as u32, 0, 0, 0).unwrap())
            .collect();
        let tile = RasterTile::new(vec![0.0], vec![0.0], Some(times), -9999.0)
            .with_band("red", BandArray::Float32(Array3::from_shape_vec((n, 1, 1), red).unwrap()))
            .unwrap()
            .with_band("nir", BandArray::Float32(Array3::from_shape_vec((n, 1, 1), nir).unwrap()))
            .unwrap();
        let mask = Array3::from_shape_vec((n, 1, 1), mask).unwrap();
        MaskedSeries::from_tile(&tile, &mask).unwrap()
    }

    #[test]
    fn test_geometric_median_collinear_points() {
        let obs = vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![10.0, 10.0]];
        let center = geometric_median(&obs, &GeomedianParams::default());
        assert_abs_diff_eq!(center[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(center[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_geometric_median_square_center() {
        let obs = vec![vec![0.0, 0.0], vec![2.0, 0.0], vec![0.0, 2.0], vec![2.0, 2.0]];
        let center = geometric_median(&obs, &GeomedianParams::default());
        assert_abs_diff_eq!(center[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(center[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_medoid_picks_real_observation() {
        let obs = vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![10.0, 10.0]];
        assert_eq!(medoid(&obs), vec![1.0, 1.0]);
    }

    #[test]
    fn test_geomedian_skips_masked_samples() {
        let s = series(vec![1.0, 2.0, 500.0], vec![1.0, 2.0, 500.0], vec![true, true, false]);
        let out = GeomedianCompositor::new(GeomedianParams::default()).reduce(&s, None).unwrap();
        assert_abs_diff_eq!(out.band("red").unwrap()[[0, 0]], 1.5, epsilon = 1e-6);
    }

    #[test]
    fn test_medoid_all_masked_is_missing() {
        let s = series(vec![1.0, 2.0], vec![3.0, 4.0], vec![false, false]);
        let out = MedoidCompositor.reduce(&s, None).unwrap();
        assert!(out.band("nir").unwrap()[[0, 0]].is_nan());
    }

    #[test]
    fn test_not_foldable() {
        let s = series(vec![1.0], vec![1.0], vec![true]);
        let partial = MedoidCompositor.reduce(&s, None).unwrap();
        assert!(!MedoidCompositor.is_foldable());
        assert!(MedoidCompositor.reduce(&s, Some(partial)).is_err());
    }
}
