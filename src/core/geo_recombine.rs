use crate::core::composite::Composite;
use crate::core::compositor::Compositor;
use crate::core::time_recombine::GeoChunkResult;
use crate::types::{
    CubeError, CubeResult, GeoTransform, Metadata, RasterTile, SpatialExtent, COORD_TOLERANCE,
};

/// Final product of a query, handed to external encoders
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub tile: RasterTile,
    pub metadata: Metadata,
    /// Requested extent
    pub bounds: SpatialExtent,
    /// `None` when the grid is a single row or column, or unevenly spaced
    pub geotransform: Option<GeoTransform>,
}

/// Assembles per-geo-chunk composites into the full extent
pub struct GeoRecombiner<'a> {
    compositor: &'a dyn Compositor,
}

impl<'a> GeoRecombiner<'a> {
    pub fn new(compositor: &'a dyn Compositor) -> Self {
        Self { compositor }
    }

    /// Place every chunk on the output grid (latitude descending, longitude
    /// ascending) spanning `bounds`. Grid cells no chunk delivered stay
    /// `no_data`. Pixels shared by neighbouring chunks go through the
    /// compositor's `combine`, in geo chunk order.
    pub fn recombine(&self, bounds: SpatialExtent, mut chunks: Vec<GeoChunkResult>) -> CubeResult<QueryOutput> {
        chunks.sort_by_key(|c| c.geo_chunk);

        let mut metadata = Metadata::new();
        let mut composites: Vec<Composite> = Vec::new();
        for chunk in chunks {
            metadata.merge(chunk.metadata);
            if let Some(composite) = chunk.composite {
                composites.push(composite);
            }
        }

        if composites.is_empty() {
            return Err(CubeError::InsufficientData(
                "No geo chunk produced any data for the requested extent".to_string(),
            ));
        }

        let latitude = full_axis(
            composites.iter().map(|c| c.latitude.as_slice()),
            bounds.lat_min,
            bounds.lat_max,
            true,
        );
        let longitude = full_axis(
            composites.iter().map(|c| c.longitude.as_slice()),
            bounds.lon_min,
            bounds.lon_max,
            false,
        );
        let mut full = composites[0].blank_like(latitude, longitude);

        for composite in composites {
            let rows = locate(&full.latitude, &composite.latitude)?;
            let cols = locate(&full.longitude, &composite.longitude)?;
            let window = full.select(&rows, &cols);
            let merged = self.compositor.combine(window, composite)?;
            full.assign(&rows, &cols, &merged)?;
        }

        let (rows, cols) = full.shape();
        log::info!("Assembled {} x {} output grid", rows, cols);

        let geotransform = GeoTransform::from_coordinates(&full.latitude, &full.longitude);
        if geotransform.is_none() && rows > 1 && cols > 1 {
            log::warn!("Output grid is unevenly spaced; no geotransform emitted");
        }
        Ok(QueryOutput {
            tile: full.into_tile()?,
            metadata,
            bounds,
            geotransform,
        })
    }
}

/// Ascending, tolerance-deduplicated union of coordinate vectors
fn union_axis<'c>(axes: impl Iterator<Item = &'c [f64]>) -> Vec<f64> {
    let mut all: Vec<f64> = axes.flat_map(|a| a.iter().copied()).collect();
    all.sort_by(|a, b| a.total_cmp(b));
    all.dedup_by(|a, b| (*a - *b).abs() <= COORD_TOLERANCE);
    all
}

/// Every grid coordinate over `[lo, hi]`, at the pixel spacing of the chunks.
///
/// Coordinates a chunk delivered are kept as delivered; the gaps left by empty
/// chunks are filled on the same lattice. Falls back to the plain union when
/// no chunk is two pixels wide on this axis or the chunks disagree on the lattice.
fn full_axis<'c>(axes: impl Iterator<Item = &'c [f64]>, lo: f64, hi: f64, descending: bool) -> Vec<f64> {
    let axes: Vec<&[f64]> = axes.collect();
    let observed = union_axis(axes.iter().copied());
    let mut axis = match lattice_step(&axes, &observed) {
        Some(step) => fill_lattice(&observed, step, lo, hi),
        None => observed,
    };
    if descending {
        axis.reverse();
    }
    axis
}

fn lattice_step(axes: &[&[f64]], observed: &[f64]) -> Option<f64> {
    let step = axes
        .iter()
        .find(|a| a.len() >= 2)
        .map(|a| (a[1] - a[0]).abs())
        .filter(|s| *s > COORD_TOLERANCE)?;
    let anchor = *observed.first()?;
    let on_lattice = observed.iter().all(|&v| {
        let k = ((v - anchor) / step).round();
        (anchor + k * step - v).abs() <= COORD_TOLERANCE
    });
    if !on_lattice {
        log::warn!("Geo chunks do not share a pixel lattice; output keeps only delivered coordinates");
        return None;
    }
    Some(step)
}

fn fill_lattice(observed: &[f64], step: f64, lo: f64, hi: f64) -> Vec<f64> {
    let (Some(&first), Some(&last)) = (observed.first(), observed.last()) else {
        return Vec::new();
    };
    let lo = lo.min(first);
    let hi = hi.max(last);
    let k_min = ((lo - first) / step - 1e-6).ceil() as i64;
    let k_max = ((hi - first) / step + 1e-6).floor() as i64;

    let mut delivered = observed.iter().copied().peekable();
    let mut axis = Vec::new();
    for k in k_min..=k_max {
        let lattice = first + k as f64 * step;
        while delivered.next_if(|&v| v < lattice - COORD_TOLERANCE).is_some() {}
        match delivered.next_if(|&v| (v - lattice).abs() <= COORD_TOLERANCE) {
            Some(v) => axis.push(v),
            None => axis.push(lattice),
        }
    }
    axis
}

fn locate(axis: &[f64], coords: &[f64]) -> CubeResult<Vec<usize>> {
    coords
        .iter()
        .map(|&v| {
            axis.iter()
                .position(|&a| (a - v).abs() <= COORD_TOLERANCE)
                .ok_or_else(|| CubeError::Compute(format!("coordinate {} not on the output grid", v)))
        })
        .collect()
}
