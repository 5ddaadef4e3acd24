use crate::io::data_source::{DataSource, LoadRequest};
use crate::types::{AcquisitionDate, CubeError, CubeResult, RasterTile};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Archive backed by a single in-memory tile (time x lat x lon).
///
/// Requests are answered by inclusive selection on coordinates and times.
pub struct InMemoryArchive {
    tile: RasterTile,
    loads: AtomicUsize,
}

impl InMemoryArchive {
    pub fn new(tile: RasterTile) -> CubeResult<Self> {
        tile.validate()?;
        if tile.times.is_none() {
            return Err(CubeError::InvalidQuery(
                "an archive tile needs a time axis".to_string(),
            ));
        }
        Ok(Self {
            tile,
            loads: AtomicUsize::new(0),
        })
    }

    pub fn tile(&self) -> &RasterTile {
        &self.tile
    }

    /// Number of `load` calls served so far
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn grid_indices(&self, request: &LoadRequest) -> (Vec<usize>, Vec<usize>) {
        let rows = self
            .tile
            .latitude
            .iter()
            .enumerate()
            .filter(|(_, lat)| request.extent.contains_lat(**lat))
            .map(|(i, _)| i)
            .collect();
        let cols = self
            .tile
            .longitude
            .iter()
            .enumerate()
            .filter(|(_, lon)| request.extent.contains_lon(**lon))
            .map(|(i, _)| i)
            .collect();
        (rows, cols)
    }

    fn time_indices(&self, request: &LoadRequest) -> Vec<usize> {
        self.tile
            .times
            .as_deref()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .filter(|(_, t)| request.time_range.contains(t))
            .map(|(i, _)| i)
            .collect()
    }
}

impl DataSource for InMemoryArchive {
    fn list_acquisitions(&self, request: &LoadRequest) -> anyhow::Result<Vec<AcquisitionDate>> {
        let (rows, cols) = self.grid_indices(request);
        if rows.is_empty() || cols.is_empty() {
            return Ok(Vec::new());
        }
        let times = self.tile.times.as_deref().unwrap_or_default();
        Ok(self.time_indices(request).into_iter().map(|i| times[i]).collect())
    }

    fn load(&self, request: &LoadRequest) -> anyhow::Result<Option<RasterTile>> {
        self.loads.fetch_add(1, Ordering::SeqCst);

        for band in &request.bands {
            if self.tile.band(band).is_none() {
                anyhow::bail!("band '{}' not in archive", band);
            }
        }

        let (rows, cols) = self.grid_indices(request);
        let time_idx = self.time_indices(request);
        if rows.is_empty() || cols.is_empty() || time_idx.is_empty() {
            return Ok(None);
        }

        let mut cut = self.tile.select(&time_idx, &rows, &cols);
        cut.bands.retain(|name, _| request.bands.contains(name));
        Ok(Some(cut))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BandArray, SpatialExtent, TimeRange};
    use chrono::{TimeZone, Utc};
    use ndarray::Array3;

    fn archive() -> InMemoryArchive {
        let times = (1..=3)
            .map(|d| Utc.with_ymd_and_hms(2020, 5, d, 0, 0, 0).unwrap())
            .collect();
        let red = Array3::from_shape_fn((3, 2, 2), |(t, r, c)| (t * 100 + r * 10 + c) as i16);
        let tile = RasterTile::new(vec![1.0, 0.0], vec![10.0, 11.0], Some(times), -9999.0)
            .with_band("red", BandArray::Int16(red.clone()))
            .unwrap()
            .with_band("green", BandArray::Int16(red))
            .unwrap();
        InMemoryArchive::new(tile).unwrap()
    }

    fn request(extent: SpatialExtent, from: u32, to: u32) -> LoadRequest {
        LoadRequest {
            product: "ls8_sr".to_string(),
            platform: "LANDSAT_8".to_string(),
            bands: vec!["red".to_string()],
            extent,
            time_range: TimeRange::new(
                Utc.with_ymd_and_hms(2020, 5, from, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2020, 5, to, 0, 0, 0).unwrap(),
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_load_selects_inclusive_window() {
        let archive = archive();
        let extent = SpatialExtent::new(0.5, 1.0, 10.0, 10.5).unwrap();
        let tile = archive.load(&request(extent, 2, 3)).unwrap().unwrap();
        assert_eq!(tile.shape(), (2, 1, 1));
        assert_eq!(tile.band_names(), vec!["red".to_string()]);
        match tile.band("red").unwrap() {
            BandArray::Int16(arr) => assert_eq!(arr[[0, 0, 0]], 100),
            other => panic!("unexpected dtype {:?}", other.dtype()),
        }
        assert_eq!(archive.load_count(), 1);
    }

    #[test]
    fn test_load_outside_extent_is_none() {
        let archive = archive();
        let extent = SpatialExtent::new(5.0, 6.0, 10.0, 11.0).unwrap();
        assert!(archive.load(&request(extent, 1, 3)).unwrap().is_none());
        assert!(archive.list_acquisitions(&request(extent, 1, 3)).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_band_is_an_error() {
        let archive = archive();
        let extent = SpatialExtent::new(0.0, 1.0, 10.0, 11.0).unwrap();
        let mut req = request(extent, 1, 3);
        req.bands.push("swir2".to_string());
        assert!(archive.load(&req).is_err());
    }
}
