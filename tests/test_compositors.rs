use approx::assert_abs_diff_eq;
use chrono::{TimeZone, Utc};
use cube_compositor::core::{
    composite, Composite, Compositor, MeanCompositor, MedianCompositor, MosaicCompositor, NdviCompositor,
    Objective,
};
use cube_compositor::{AcquisitionDate, BandArray, CleanMask, RasterTile};
use ndarray::Array3;

const NO_DATA: f64 = -9999.0;

fn times(n: usize) -> Vec<AcquisitionDate> {
    (0..n)
        .map(|i| Utc.with_ymd_and_hms(2014, 1 + i as u32, 5, 0, 0, 0).unwrap())
        .collect()
}

/// 9 time steps over a 3 x 4 grid with scattered clouds and no_data
fn series_fixture() -> (RasterTile, CleanMask) {
    let shape = (9, 3, 4);
    let red = Array3::from_shape_fn(shape, |(t, r, c)| {
        if (t + r) % 7 == 3 && c == 1 {
            -9999
        } else {
            200 + ((t * 31 + r * 17 + c * 5) % 60) as i16
        }
    });
    let nir = Array3::from_shape_fn(shape, |(t, r, c)| 300 + ((t * 23 + r * 7 + c * 13) % 120) as i16);
    let mask = Array3::from_shape_fn(shape, |(t, r, c)| (t * 3 + r + 2 * c) % 4 != 0);

    let tile = RasterTile::new(vec![0.2, 0.1, 0.0], vec![5.0, 5.1, 5.2, 5.3], Some(times(9)), NO_DATA)
        .with_band("red", BandArray::Int16(red))
        .unwrap()
        .with_band("nir", BandArray::Int16(nir))
        .unwrap();
    (tile, mask)
}

fn slice(tile: &RasterTile, mask: &CleanMask, range: std::ops::Range<usize>) -> (RasterTile, CleanMask) {
    let idx: Vec<usize> = range.collect();
    let rows: Vec<usize> = (0..tile.latitude.len()).collect();
    let cols: Vec<usize> = (0..tile.longitude.len()).collect();
    let sub = tile.select(&idx, &rows, &cols);
    let sub_mask = mask.select(ndarray::Axis(0), &idx);
    (sub, sub_mask)
}

/// fold(fold(A, B), C) in the given chunk order
fn fold_chunks(compositor: &dyn Compositor, order: &[std::ops::Range<usize>]) -> Composite {
    let (tile, mask) = series_fixture();
    let mut running = None;
    for range in order {
        let (t, m) = slice(&tile, &mask, range.clone());
        running = Some(composite(compositor, &t, &m, running).unwrap());
    }
    running.unwrap()
}

fn whole(compositor: &dyn Compositor) -> Composite {
    let (tile, mask) = series_fixture();
    composite(compositor, &tile, &mask, None).unwrap()
}

fn assert_same_values(a: &Composite, b: &Composite, epsilon: f64) {
    assert_eq!(a.values.keys().collect::<Vec<_>>(), b.values.keys().collect::<Vec<_>>());
    for (name, plane) in &a.values {
        let other = &b.values[name];
        for (x, y) in plane.iter().zip(other.iter()) {
            if x.is_nan() || y.is_nan() {
                assert!(x.is_nan() && y.is_nan(), "band {}: {} vs {}", name, x, y);
            } else {
                assert_abs_diff_eq!(*x, *y, epsilon = epsilon);
            }
        }
    }
}

#[test]
fn test_mean_fold_is_associative() {
    let _ = env_logger::builder().is_test(true).try_init();
    let folded = fold_chunks(&MeanCompositor, &[0..3, 3..6, 6..9]);
    assert_same_values(&folded, &whole(&MeanCompositor), 1e-9);
}

#[test]
fn test_least_recent_fold_is_associative() {
    let compositor = MosaicCompositor::new(false);
    let folded = fold_chunks(&compositor, &[0..2, 2..7, 7..9]);
    assert_same_values(&folded, &whole(&compositor), 0.0);
}

#[test]
fn test_most_recent_fold_runs_newest_chunk_first() {
    let compositor = MosaicCompositor::new(true);
    let folded = fold_chunks(&compositor, &[6..9, 3..6, 0..3]);
    assert_same_values(&folded, &whole(&compositor), 0.0);
}

#[test]
fn test_ndvi_folds_are_associative() {
    for objective in [Objective::Maximize, Objective::Minimize] {
        let compositor = NdviCompositor::new(objective, "nir", "red");
        let folded = fold_chunks(&compositor, &[0..4, 4..5, 5..9]);
        assert_same_values(&folded, &whole(&compositor), 0.0);
    }
}

#[test]
fn test_median_fold_of_balanced_chunks() {
    let values: Vec<i16> = (1..=9).collect();
    let tile = RasterTile::new(vec![0.0], vec![0.0], Some(times(9)), NO_DATA)
        .with_band("red", BandArray::Int16(Array3::from_shape_vec((9, 1, 1), values).unwrap()))
        .unwrap();
    let mask = Array3::from_elem((9, 1, 1), true);

    let mut running = None;
    for range in [0..3, 3..6, 6..9] {
        let (t, m) = slice(&tile, &mask, range);
        running = Some(composite(&MedianCompositor, &t, &m, running).unwrap());
    }
    let folded = running.unwrap();
    let direct = composite(&MedianCompositor, &tile, &mask, None).unwrap();
    assert_abs_diff_eq!(folded.band("red").unwrap()[[0, 0]], 5.0, epsilon = 1e-12);
    assert_abs_diff_eq!(direct.band("red").unwrap()[[0, 0]], 5.0, epsilon = 1e-12);
}

#[test]
fn test_median_fold_matches_direct_median() {
    for order in [[0..3, 3..6, 6..9], [0..1, 1..7, 7..9]] {
        let folded = fold_chunks(&MedianCompositor, &order);
        assert_same_values(&folded, &whole(&MedianCompositor), 1e-9);
    }
}

#[test]
fn test_median_fold_of_skewed_chunks() {
    // one chunk full of low values, the other full of high ones
    let values: Vec<i16> = vec![0, 0, 1000, 1000, 1000];
    let tile = RasterTile::new(vec![0.0], vec![0.0], Some(times(5)), NO_DATA)
        .with_band("red", BandArray::Int16(Array3::from_shape_vec((5, 1, 1), values).unwrap()))
        .unwrap();
    let mask = Array3::from_elem((5, 1, 1), true);

    let (a, ma) = slice(&tile, &mask, 0..3);
    let (b, mb) = slice(&tile, &mask, 3..5);
    let first = composite(&MedianCompositor, &a, &ma, None).unwrap();
    let folded = composite(&MedianCompositor, &b, &mb, Some(first)).unwrap();
    let direct = composite(&MedianCompositor, &tile, &mask, None).unwrap();

    assert_eq!(direct.band("red").unwrap()[[0, 0]], 1000.0);
    assert_eq!(folded.band("red").unwrap()[[0, 0]], 1000.0);
}

#[test]
fn test_most_recent_example() {
    let tile = RasterTile::new(vec![0.0], vec![0.0], Some(times(4)), NO_DATA)
        .with_band(
            "red",
            BandArray::Int16(Array3::from_shape_vec((4, 1, 1), vec![-9999, 5, -9999, 3]).unwrap()),
        )
        .unwrap();
    let mask = Array3::from_shape_vec((4, 1, 1), vec![false, true, false, true]).unwrap();

    let forward = composite(&MosaicCompositor::new(false), &tile, &mask, None).unwrap();
    let reverse = composite(&MosaicCompositor::new(true), &tile, &mask, None).unwrap();
    assert_eq!(forward.band("red").unwrap()[[0, 0]], 5.0);
    assert_eq!(reverse.band("red").unwrap()[[0, 0]], 3.0);
}

#[test]
fn test_max_ndvi_never_mixes_slices() {
    let (tile, mask) = series_fixture();
    let compositor = NdviCompositor::new(Objective::Maximize, "nir", "red");
    let out = composite(&compositor, &tile, &mask, None).unwrap();

    let red = tile.band("red").unwrap().to_f64();
    let nir = tile.band("nir").unwrap().to_f64();
    for r in 0..3 {
        for c in 0..4 {
            let picked_red = out.band("red").unwrap()[[r, c]];
            let picked_nir = out.band("nir").unwrap()[[r, c]];
            if picked_red.is_nan() {
                continue;
            }
            let source_slice = (0..9).find(|&t| mask[[t, r, c]] && red[[t, r, c]] == picked_red && nir[[t, r, c]] == picked_nir);
            assert!(source_slice.is_some(), "pixel ({}, {}) mixes bands from different slices", r, c);
        }
    }
}

#[test]
fn test_output_restores_band_types() {
    let (tile, mask) = series_fixture();
    let out = composite(&MeanCompositor, &tile, &mask, None).unwrap().into_tile().unwrap();
    assert!(out.times.is_none());
    assert_eq!(out.shape(), (1, 3, 4));
    assert!(matches!(out.band("red"), Some(BandArray::Int16(_))));
    assert!(matches!(out.band("nir"), Some(BandArray::Int16(_))));
}
