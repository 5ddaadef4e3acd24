use chrono::{DateTime, Utc};
use ndarray::{Array3, Axis};
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance (degrees) used when comparing coordinates and chunk bounds
pub const COORD_TOLERANCE: f64 = 1e-9;

/// A single observation timestamp
pub type AcquisitionDate = DateTime<Utc>;

/// Clean-data mask stacked over time (time x lat x lon), true where the pixel is usable
pub type CleanMask = Array3<bool>;

/// Geographic bounding box in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialExtent {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl SpatialExtent {
    /// Create an extent, rejecting empty or inverted boxes
    pub fn new(lat_min: f64, lat_max: f64, lon_min: f64, lon_max: f64) -> CubeResult<Self> {
        let extent = Self { lat_min, lat_max, lon_min, lon_max };
        extent.validate()?;
        Ok(extent)
    }

    pub fn validate(&self) -> CubeResult<()> {
        let finite = [self.lat_min, self.lat_max, self.lon_min, self.lon_max]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.lat_min >= self.lat_max || self.lon_min >= self.lon_max {
            return Err(CubeError::InvalidQuery(format!(
                "extent must satisfy min < max on both axes, got lat [{}, {}] lon [{}, {}]",
                self.lat_min, self.lat_max, self.lon_min, self.lon_max
            )));
        }
        Ok(())
    }

    pub fn height(&self) -> f64 {
        self.lat_max - self.lat_min
    }

    pub fn width(&self) -> f64 {
        self.lon_max - self.lon_min
    }

    pub fn contains_lat(&self, lat: f64) -> bool {
        lat >= self.lat_min - COORD_TOLERANCE && lat <= self.lat_max + COORD_TOLERANCE
    }

    pub fn contains_lon(&self, lon: f64) -> bool {
        lon >= self.lon_min - COORD_TOLERANCE && lon <= self.lon_max + COORD_TOLERANCE
    }
}

/// Inclusive time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> CubeResult<Self> {
        if start > end {
            return Err(CubeError::InvalidQuery(format!(
                "time range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: &AcquisitionDate) -> bool {
        *date >= self.start && *date <= self.end
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Derive a north-up transform from pixel-center coordinate vectors.
    ///
    /// Needs at least two coordinates on each axis to know the pixel size,
    /// and both axes evenly spaced.
    pub fn from_coordinates(latitude: &[f64], longitude: &[f64]) -> Option<Self> {
        let pixel_height = uniform_step(latitude)?;
        let pixel_width = uniform_step(longitude)?;
        Some(Self {
            top_left_x: longitude[0] - pixel_width / 2.0,
            pixel_width,
            rotation_x: 0.0,
            top_left_y: latitude[0] - pixel_height / 2.0,
            rotation_y: 0.0,
            pixel_height,
        })
    }
}

/// Spacing of an evenly spaced axis, `None` when shorter than two or uneven
fn uniform_step(axis: &[f64]) -> Option<f64> {
    if axis.len() < 2 {
        return None;
    }
    let step = (axis[axis.len() - 1] - axis[0]) / (axis.len() - 1) as f64;
    if step == 0.0 {
        return None;
    }
    let tolerance = step.abs() * 1e-6;
    let even = axis.windows(2).all(|w| ((w[1] - w[0]) - step).abs() <= tolerance);
    even.then_some(step)
}

/// Storage type of a band, restored after compositing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    UInt8,
    Int16,
    UInt16,
    Int32,
    Float32,
    Float64,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::UInt8 => write!(f, "uint8"),
            DataType::Int16 => write!(f, "int16"),
            DataType::UInt16 => write!(f, "uint16"),
            DataType::Int32 => write!(f, "int32"),
            DataType::Float32 => write!(f, "float32"),
            DataType::Float64 => write!(f, "float64"),
        }
    }
}

/// Typed band cube (time x lat x lon)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BandArray {
    UInt8(Array3<u8>),
    Int16(Array3<i16>),
    UInt16(Array3<u16>),
    Int32(Array3<i32>),
    Float32(Array3<f32>),
    Float64(Array3<f64>),
}

macro_rules! with_band_array {
    ($band:expr, $arr:ident => $body:expr) => {
        match $band {
            BandArray::UInt8($arr) => $body,
            BandArray::Int16($arr) => $body,
            BandArray::UInt16($arr) => $body,
            BandArray::Int32($arr) => $body,
            BandArray::Float32($arr) => $body,
            BandArray::Float64($arr) => $body,
        }
    };
}

macro_rules! map_band_array {
    ($band:expr, $arr:ident => $body:expr) => {
        match $band {
            BandArray::UInt8($arr) => BandArray::UInt8($body),
            BandArray::Int16($arr) => BandArray::Int16($body),
            BandArray::UInt16($arr) => BandArray::UInt16($body),
            BandArray::Int32($arr) => BandArray::Int32($body),
            BandArray::Float32($arr) => BandArray::Float32($body),
            BandArray::Float64($arr) => BandArray::Float64($body),
        }
    };
}

impl BandArray {
    pub fn dtype(&self) -> DataType {
        match self {
            BandArray::UInt8(_) => DataType::UInt8,
            BandArray::Int16(_) => DataType::Int16,
            BandArray::UInt16(_) => DataType::UInt16,
            BandArray::Int32(_) => DataType::Int32,
            BandArray::Float32(_) => DataType::Float32,
            BandArray::Float64(_) => DataType::Float64,
        }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        with_band_array!(self, arr => arr.dim())
    }

    /// Promote to f64 without any masking
    pub fn to_f64(&self) -> Array3<f64> {
        with_band_array!(self, arr => promote(arr))
    }

    /// Cast a floating cube back to `dtype`, writing `no_data` wherever the value is NaN
    pub fn from_f64(dtype: DataType, values: &Array3<f64>, no_data: f64) -> CubeResult<Self> {
        Ok(match dtype {
            DataType::UInt8 => BandArray::UInt8(demote(values, no_data)?),
            DataType::Int16 => BandArray::Int16(demote(values, no_data)?),
            DataType::UInt16 => BandArray::UInt16(demote(values, no_data)?),
            DataType::Int32 => BandArray::Int32(demote(values, no_data)?),
            DataType::Float32 => BandArray::Float32(demote(values, no_data)?),
            DataType::Float64 => BandArray::Float64(demote(values, no_data)?),
        })
    }

    /// Gather the given indices along one axis
    pub fn select(&self, axis: Axis, indices: &[usize]) -> Self {
        map_band_array!(self, arr => arr.select(axis, indices))
    }
}

fn promote<T: Copy + ToPrimitive>(values: &Array3<T>) -> Array3<f64> {
    values.mapv(|v| v.to_f64().unwrap_or(f64::NAN))
}

fn demote<T: Copy + NumCast>(values: &Array3<f64>, no_data: f64) -> CubeResult<Array3<T>> {
    let fill: T = NumCast::from(no_data).ok_or_else(|| {
        CubeError::Compute(format!(
            "no_data value {} is not representable as {}",
            no_data,
            std::any::type_name::<T>()
        ))
    })?;
    let mut out_of_range = 0usize;
    let demoted = values.mapv(|v| {
        if v.is_nan() {
            return fill;
        }
        NumCast::from(v).unwrap_or_else(|| {
            out_of_range += 1;
            fill
        })
    });
    if out_of_range > 0 {
        log::warn!(
            "{} values out of range for {} were written as no_data",
            out_of_range,
            std::any::type_name::<T>()
        );
    }
    Ok(demoted)
}

/// Multi-band raster over a lat/lon grid, optionally with a time axis.
///
/// Every band is stored as a (time, lat, lon) cube. Tiles without a time
/// axis (composites) hold a single time slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterTile {
    pub bands: BTreeMap<String, BandArray>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub times: Option<Vec<AcquisitionDate>>,
    pub no_data: f64,
}

impl RasterTile {
    pub fn new(
        latitude: Vec<f64>,
        longitude: Vec<f64>,
        times: Option<Vec<AcquisitionDate>>,
        no_data: f64,
    ) -> Self {
        Self {
            bands: BTreeMap::new(),
            latitude,
            longitude,
            times,
            no_data,
        }
    }

    /// Add a band, checking that its shape matches the tile grid
    pub fn with_band(mut self, name: impl Into<String>, band: BandArray) -> CubeResult<Self> {
        let name = name.into();
        if band.dim() != self.shape() {
            return Err(CubeError::Compute(format!(
                "band '{}' has shape {:?}, tile expects {:?}",
                name,
                band.dim(),
                self.shape()
            )));
        }
        self.bands.insert(name, band);
        Ok(self)
    }

    pub fn band(&self, name: &str) -> Option<&BandArray> {
        self.bands.get(name)
    }

    pub fn take_band(&mut self, name: &str) -> Option<BandArray> {
        self.bands.remove(name)
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.keys().cloned().collect()
    }

    pub fn time_len(&self) -> usize {
        self.times.as_ref().map(|t| t.len()).unwrap_or(1)
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.time_len(), self.latitude.len(), self.longitude.len())
    }

    pub fn is_empty(&self) -> bool {
        let (t, y, x) = self.shape();
        t == 0 || y == 0 || x == 0 || self.bands.is_empty()
    }

    /// Sub-tile at the given time, row and column indices
    pub fn select(&self, time_idx: &[usize], rows: &[usize], cols: &[usize]) -> RasterTile {
        let bands = self
            .bands
            .iter()
            .map(|(name, band)| {
                let cut = band
                    .select(Axis(0), time_idx)
                    .select(Axis(1), rows)
                    .select(Axis(2), cols);
                (name.clone(), cut)
            })
            .collect();
        RasterTile {
            bands,
            latitude: rows.iter().map(|&r| self.latitude[r]).collect(),
            longitude: cols.iter().map(|&c| self.longitude[c]).collect(),
            times: self
                .times
                .as_ref()
                .map(|t| time_idx.iter().map(|&i| t[i]).collect()),
            no_data: self.no_data,
        }
    }

    pub fn validate(&self) -> CubeResult<()> {
        let shape = self.shape();
        for (name, band) in &self.bands {
            if band.dim() != shape {
                return Err(CubeError::Compute(format!(
                    "band '{}' has shape {:?}, tile expects {:?}",
                    name,
                    band.dim(),
                    shape
                )));
            }
        }
        Ok(())
    }
}

/// Per-acquisition statistics accumulated across chunks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionStats {
    pub clean_pixel_count: u64,
    pub pixel_count: u64,
    /// Algorithm-specific counters, summed on merge
    pub counters: BTreeMap<String, u64>,
}

impl AcquisitionStats {
    pub fn new(clean_pixel_count: u64, pixel_count: u64) -> Self {
        Self {
            clean_pixel_count,
            pixel_count,
            counters: BTreeMap::new(),
        }
    }

    pub fn clean_pixel_percentage(&self) -> f64 {
        if self.pixel_count == 0 {
            0.0
        } else {
            100.0 * self.clean_pixel_count as f64 / self.pixel_count as f64
        }
    }

    fn absorb(&mut self, other: AcquisitionStats) {
        self.clean_pixel_count += other.clean_pixel_count;
        self.pixel_count += other.pixel_count;
        for (key, value) in other.counters {
            *self.counters.entry(key).or_insert(0) += value;
        }
    }
}

/// Acquisition date -> statistics map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: BTreeMap<AcquisitionDate, AcquisitionStats>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: AcquisitionDate, stats: AcquisitionStats) {
        self.entries.insert(date, stats);
    }

    /// Sum counters on matching dates, insert the rest
    pub fn merge(&mut self, other: Metadata) {
        for (date, stats) in other.entries {
            self.entries.entry(date).or_default().absorb(stats);
        }
    }

    pub fn get(&self, date: &AcquisitionDate) -> Option<&AcquisitionStats> {
        self.entries.get(date)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AcquisitionDate, &AcquisitionStats)> {
        self.entries.iter()
    }

    pub fn acquisitions(&self) -> Vec<AcquisitionDate> {
        self.entries.keys().copied().collect()
    }

    pub fn total_clean_pixels(&self) -> u64 {
        self.entries.values().map(|s| s.clean_pixel_count).sum()
    }
}

/// Error types for compositing queries
#[derive(Debug, thiserror::Error)]
pub enum CubeError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Chunk load failed (geo chunk {geo_chunk}, time chunk {time_chunk}): {message}")]
    ChunkLoad {
        geo_chunk: usize,
        time_chunk: usize,
        message: String,
    },

    #[error("Compute error: {0}")]
    Compute(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl CubeError {
    /// Only chunk load failures are absorbed at chunk granularity
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CubeError::ChunkLoad { .. })
    }
}

/// Result type for compositing operations
pub type CubeResult<T> = Result<T, CubeError>;
