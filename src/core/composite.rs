//! Floating-point working representations used by the compositors.
//!
//! Raw tiles are promoted once into a [`MaskedSeries`] where every missing
//! sample (masked out, or equal to `no_data`) is NaN. Reductions produce a
//! [`Composite`]: per-band 2D planes plus whatever accumulator the algorithm
//! needs to keep folding. Only [`Composite::into_tile`] goes back to typed bands.

use crate::types::{
    AcquisitionDate, BandArray, CleanMask, CubeError, CubeResult, DataType, RasterTile,
};
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Direction in which a best-score composite competes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    Maximize,
    Minimize,
}

impl Objective {
    /// Score that loses against every real score
    pub fn sentinel(self) -> f64 {
        match self {
            Objective::Maximize => f64::NEG_INFINITY,
            Objective::Minimize => f64::INFINITY,
        }
    }

    /// Strictly better; ties keep the incumbent
    pub fn beats(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Objective::Maximize => candidate > incumbent,
            Objective::Minimize => candidate < incumbent,
        }
    }
}

/// Algorithm-specific state carried alongside the composite planes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Accumulator {
    /// Pixel selection (mosaics, geomedian, medoid): the planes are the state
    Selection,
    /// Running per-band sum and sample count
    Mean {
        sum: BTreeMap<String, Array2<f64>>,
        count: BTreeMap<String, Array2<u32>>,
    },
    /// Per-band sorted valid samples behind each median
    Median { samples: BTreeMap<String, Array2<Vec<f64>>> },
    /// Running best score per pixel
    BestScore { score: Array2<f64>, objective: Objective },
}

impl Accumulator {
    fn blank(&self, shape: (usize, usize)) -> Self {
        match self {
            Accumulator::Selection => Accumulator::Selection,
            Accumulator::Mean { sum, count } => Accumulator::Mean {
                sum: sum.keys().map(|k| (k.clone(), Array2::zeros(shape))).collect(),
                count: count.keys().map(|k| (k.clone(), Array2::zeros(shape))).collect(),
            },
            Accumulator::Median { samples } => Accumulator::Median {
                samples: samples.keys().map(|k| (k.clone(), Array2::from_elem(shape, Vec::new()))).collect(),
            },
            Accumulator::BestScore { objective, .. } => Accumulator::BestScore {
                score: Array2::from_elem(shape, objective.sentinel()),
                objective: *objective,
            },
        }
    }

    fn select(&self, rows: &[usize], cols: &[usize]) -> Self {
        match self {
            Accumulator::Selection => Accumulator::Selection,
            Accumulator::Mean { sum, count } => Accumulator::Mean {
                sum: select_planes(sum, rows, cols),
                count: select_planes(count, rows, cols),
            },
            Accumulator::Median { samples } => Accumulator::Median {
                samples: select_planes(samples, rows, cols),
            },
            Accumulator::BestScore { score, objective } => Accumulator::BestScore {
                score: select_plane(score, rows, cols),
                objective: *objective,
            },
        }
    }

    fn assign(&mut self, rows: &[usize], cols: &[usize], window: &Accumulator) -> CubeResult<()> {
        match (self, window) {
            (Accumulator::Selection, Accumulator::Selection) => {}
            (Accumulator::Mean { sum, count }, Accumulator::Mean { sum: wsum, count: wcount }) => {
                assign_planes(sum, rows, cols, wsum)?;
                assign_planes(count, rows, cols, wcount)?;
            }
            (Accumulator::Median { samples }, Accumulator::Median { samples: wsamples }) => {
                assign_planes(samples, rows, cols, wsamples)?;
            }
            (Accumulator::BestScore { score, .. }, Accumulator::BestScore { score: wscore, .. }) => {
                assign_plane(score, rows, cols, wscore);
            }
            _ => {
                return Err(CubeError::Compute(
                    "cannot assign composite window with a different accumulator kind".to_string(),
                ))
            }
        }
        Ok(())
    }
}

fn select_plane<T: Clone>(plane: &Array2<T>, rows: &[usize], cols: &[usize]) -> Array2<T> {
    plane.select(Axis(0), rows).select(Axis(1), cols)
}

fn select_planes<T: Clone>(
    planes: &BTreeMap<String, Array2<T>>,
    rows: &[usize],
    cols: &[usize],
) -> BTreeMap<String, Array2<T>> {
    planes
        .iter()
        .map(|(k, v)| (k.clone(), select_plane(v, rows, cols)))
        .collect()
}

fn assign_plane<T: Clone>(plane: &mut Array2<T>, rows: &[usize], cols: &[usize], window: &Array2<T>) {
    for (wr, &r) in rows.iter().enumerate() {
        for (wc, &c) in cols.iter().enumerate() {
            plane[[r, c]] = window[[wr, wc]].clone();
        }
    }
}

fn assign_planes<T: Clone>(
    planes: &mut BTreeMap<String, Array2<T>>,
    rows: &[usize],
    cols: &[usize],
    window: &BTreeMap<String, Array2<T>>,
) -> CubeResult<()> {
    for (name, plane) in planes.iter_mut() {
        let src = window
            .get(name)
            .ok_or_else(|| CubeError::Compute(format!("band '{}' missing from composite window", name)))?;
        assign_plane(plane, rows, cols, src);
    }
    Ok(())
}

/// A reduced raster (NaN = missing) plus its accumulator.
///
/// Created fresh per geo chunk and mutated only by sequential folds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composite {
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub no_data: f64,
    pub dtypes: BTreeMap<String, DataType>,
    pub values: BTreeMap<String, Array2<f64>>,
    pub state: Accumulator,
}

impl Composite {
    pub fn shape(&self) -> (usize, usize) {
        (self.latitude.len(), self.longitude.len())
    }

    pub fn band(&self, name: &str) -> Option<&Array2<f64>> {
        self.values.get(name)
    }

    /// True when every band has a value at this pixel
    pub fn pixel_present(&self, row: usize, col: usize) -> bool {
        self.values.values().all(|plane| !plane[[row, col]].is_nan())
    }

    /// Same bands and accumulator kind over a new grid, with nothing observed yet
    pub fn blank_like(&self, latitude: Vec<f64>, longitude: Vec<f64>) -> Composite {
        let shape = (latitude.len(), longitude.len());
        Composite {
            values: self
                .values
                .keys()
                .map(|k| (k.clone(), Array2::from_elem(shape, f64::NAN)))
                .collect(),
            state: self.state.blank(shape),
            dtypes: self.dtypes.clone(),
            no_data: self.no_data,
            latitude,
            longitude,
        }
    }

    /// Window at the given row and column indices
    pub fn select(&self, rows: &[usize], cols: &[usize]) -> Composite {
        Composite {
            latitude: rows.iter().map(|&r| self.latitude[r]).collect(),
            longitude: cols.iter().map(|&c| self.longitude[c]).collect(),
            no_data: self.no_data,
            dtypes: self.dtypes.clone(),
            values: select_planes(&self.values, rows, cols),
            state: self.state.select(rows, cols),
        }
    }

    /// Write `window` back at the given row and column indices
    pub fn assign(&mut self, rows: &[usize], cols: &[usize], window: &Composite) -> CubeResult<()> {
        if window.shape() != (rows.len(), cols.len()) {
            return Err(CubeError::Compute(format!(
                "window shape {:?} does not match {} rows x {} cols",
                window.shape(),
                rows.len(),
                cols.len()
            )));
        }
        assign_planes(&mut self.values, rows, cols, &window.values)?;
        self.state.assign(rows, cols, &window.state)
    }

    /// Check that `other` can be folded into `self`
    pub fn ensure_compatible(&self, other: &Composite) -> CubeResult<()> {
        if self.shape() != other.shape() {
            return Err(CubeError::Compute(format!(
                "composite shapes differ: {:?} vs {:?}",
                self.shape(),
                other.shape()
            )));
        }
        if self.values.keys().ne(other.values.keys()) {
            return Err(CubeError::Compute("composites carry different bands".to_string()));
        }
        Ok(())
    }

    /// Re-insert `no_data` where the value is NaN and cast each band back to its type
    pub fn into_tile(self) -> CubeResult<RasterTile> {
        let mut tile = RasterTile::new(self.latitude, self.longitude, None, self.no_data);
        for (name, plane) in self.values {
            let dtype = self.dtypes.get(&name).copied().unwrap_or(DataType::Float64);
            let band = BandArray::from_f64(dtype, &plane.insert_axis(Axis(0)), self.no_data)?;
            tile = tile.with_band(name, band)?;
        }
        Ok(tile)
    }
}

/// Time series of bands with every missing sample set to NaN
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskedSeries {
    pub times: Vec<AcquisitionDate>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub no_data: f64,
    pub dtypes: BTreeMap<String, DataType>,
    pub bands: BTreeMap<String, Array3<f64>>,
}

impl MaskedSeries {
    /// Promote `tile` to f64, treating unclean and `no_data` samples as NaN
    pub fn from_tile(tile: &RasterTile, mask: &CleanMask) -> CubeResult<Self> {
        let times = tile
            .times
            .clone()
            .ok_or_else(|| CubeError::Compute("cannot composite a tile without a time axis".to_string()))?;
        if mask.dim() != tile.shape() {
            return Err(CubeError::Compute(format!(
                "clean mask shape {:?} does not match tile shape {:?}",
                mask.dim(),
                tile.shape()
            )));
        }

        let no_data = tile.no_data;
        let mut bands = BTreeMap::new();
        let mut dtypes = BTreeMap::new();
        for (name, band) in &tile.bands {
            let mut values = band.to_f64();
            ndarray::Zip::from(&mut values).and(mask).for_each(|v, &clean| {
                if !clean || *v == no_data {
                    *v = f64::NAN;
                }
            });
            dtypes.insert(name.clone(), band.dtype());
            bands.insert(name.clone(), values);
        }

        Ok(Self {
            times,
            latitude: tile.latitude.clone(),
            longitude: tile.longitude.clone(),
            no_data,
            dtypes,
            bands,
        })
    }

    /// Join series that share a grid along the time axis, in the given order
    pub fn concat(parts: Vec<MaskedSeries>) -> CubeResult<Self> {
        let mut iter = parts.into_iter();
        let mut joined = iter
            .next()
            .ok_or_else(|| CubeError::Compute("no series to concatenate".to_string()))?;
        for part in iter {
            if part.latitude.len() != joined.latitude.len()
                || part.longitude.len() != joined.longitude.len()
                || part.bands.keys().ne(joined.bands.keys())
            {
                return Err(CubeError::Compute(
                    "cannot concatenate series over different grids or bands".to_string(),
                ));
            }
            for (name, values) in joined.bands.iter_mut() {
                let next = &part.bands[name];
                *values = ndarray::concatenate(Axis(0), &[values.view(), next.view()])
                    .map_err(|e| CubeError::Compute(format!("time concatenation failed: {}", e)))?;
            }
            joined.times.extend(part.times);
        }
        Ok(joined)
    }

    pub fn time_len(&self) -> usize {
        self.times.len()
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.times.len(), self.latitude.len(), self.longitude.len())
    }

    pub fn band(&self, name: &str) -> CubeResult<&Array3<f64>> {
        self.bands
            .get(name)
            .ok_or_else(|| CubeError::Compute(format!("band '{}' not present in series", name)))
    }

    /// Whether every band has a value at (t, row, col)
    pub fn sample_present(&self, t: usize, row: usize, col: usize) -> bool {
        self.bands.values().all(|cube| !cube[[t, row, col]].is_nan())
    }

    /// All-NaN composite over this series' grid
    pub fn empty_composite(&self, state: Accumulator) -> Composite {
        let shape = (self.latitude.len(), self.longitude.len());
        Composite {
            latitude: self.latitude.clone(),
            longitude: self.longitude.clone(),
            no_data: self.no_data,
            dtypes: self.dtypes.clone(),
            values: self
                .bands
                .keys()
                .map(|k| (k.clone(), Array2::from_elem(shape, f64::NAN)))
                .collect(),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn tile() -> RasterTile {
        let times = vec![
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap(),
        ];
        RasterTile::new(vec![1.0], vec![0.0, 1.0], Some(times), -9999.0)
            .with_band(
                "red",
                BandArray::Int16(Array3::from_shape_vec((2, 1, 2), vec![10, -9999, 30, 40]).unwrap()),
            )
            .unwrap()
    }

    #[test]
    fn test_from_tile_masks_unclean_and_no_data() {
        let mask = Array3::from_shape_vec((2, 1, 2), vec![true, true, false, true]).unwrap();
        let series = MaskedSeries::from_tile(&tile(), &mask).unwrap();
        let red = series.band("red").unwrap();
        assert_eq!(red[[0, 0, 0]], 10.0);
        assert!(red[[0, 0, 1]].is_nan());
        assert!(red[[1, 0, 0]].is_nan());
        assert_eq!(red[[1, 0, 1]], 40.0);
        assert_eq!(series.dtypes["red"], DataType::Int16);
    }

    #[test]
    fn test_concat_appends_time() {
        let mask = Array3::from_elem((2, 1, 2), true);
        let a = MaskedSeries::from_tile(&tile(), &mask).unwrap();
        let joined = MaskedSeries::concat(vec![a.clone(), a]).unwrap();
        assert_eq!(joined.shape(), (4, 1, 2));
        assert_eq!(joined.band("red").unwrap()[[2, 0, 0]], 10.0);
    }

    #[test]
    fn test_select_and_assign_roundtrip_window() {
        let mask = Array3::from_elem((2, 1, 2), true);
        let series = MaskedSeries::from_tile(&tile(), &mask).unwrap();
        let mut composite = series.empty_composite(Accumulator::Selection);
        composite.values.get_mut("red").unwrap()[[0, 1]] = 7.0;

        let mut full = composite.blank_like(vec![2.0, 1.0], vec![0.0, 1.0, 2.0]);
        full.assign(&[1], &[0, 1], &composite).unwrap();
        assert_eq!(full.band("red").unwrap()[[1, 1]], 7.0);
        assert!(full.band("red").unwrap()[[0, 1]].is_nan());

        let window = full.select(&[1], &[1]);
        assert_eq!(window.band("red").unwrap()[[0, 0]], 7.0);
    }

    #[test]
    fn test_into_tile_restores_type() {
        let mask = Array3::from_elem((2, 1, 2), true);
        let series = MaskedSeries::from_tile(&tile(), &mask).unwrap();
        let out = series.empty_composite(Accumulator::Selection).into_tile().unwrap();
        assert_eq!(out.shape(), (1, 1, 2));
        match out.band("red").unwrap() {
            BandArray::Int16(arr) => assert!(arr.iter().all(|&v| v == -9999)),
            other => panic!("unexpected dtype {:?}", other.dtype()),
        }
    }
}
