use crate::types::{BandArray, CleanMask, CubeError, CubeResult, RasterTile};
use serde::{Deserialize, Serialize};

/// Landsat 5/7 pixel_qa values for clear land and water
const LANDSAT_7_CLEAR: &[i64] = &[66, 130];
const LANDSAT_7_WATER: &[i64] = &[68, 132];

/// Landsat 8 pixel_qa values for clear land and water
const LANDSAT_8_CLEAR: &[i64] = &[322, 386, 834, 898, 1346];
const LANDSAT_8_WATER: &[i64] = &[324, 388, 836, 900, 1348];

/// Surface types counted as clean
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoverType {
    Clear,
    Water,
}

/// How a QA band value maps to clean / contaminated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CleanMaskRule {
    /// Landsat 5/7 collection pixel_qa
    Landsat7PixelQa,
    /// Landsat 8 collection pixel_qa
    Landsat8PixelQa,
    /// Clean iff the QA value is in the list
    AcceptedValues(Vec<i64>),
    /// Clean iff none of these bits are set
    ClearBits { bad_bits: u64 },
}

impl CleanMaskRule {
    /// Pick the pixel_qa rule for a platform identifier such as `LANDSAT_8`
    pub fn for_platform(platform: &str) -> Option<Self> {
        match platform.to_uppercase().as_str() {
            "LANDSAT_5" | "LANDSAT_7" => Some(CleanMaskRule::Landsat7PixelQa),
            "LANDSAT_8" => Some(CleanMaskRule::Landsat8PixelQa),
            _ => None,
        }
    }

    fn is_clean(&self, value: i64, cover_types: &[CoverType]) -> bool {
        match self {
            CleanMaskRule::Landsat7PixelQa => {
                table_match(value, cover_types, LANDSAT_7_CLEAR, LANDSAT_7_WATER)
            }
            CleanMaskRule::Landsat8PixelQa => {
                table_match(value, cover_types, LANDSAT_8_CLEAR, LANDSAT_8_WATER)
            }
            CleanMaskRule::AcceptedValues(values) => values.contains(&value),
            CleanMaskRule::ClearBits { bad_bits } => value >= 0 && (value as u64) & bad_bits == 0,
        }
    }
}

fn table_match(value: i64, cover_types: &[CoverType], clear: &[i64], water: &[i64]) -> bool {
    cover_types.iter().any(|cover| match cover {
        CoverType::Clear => clear.contains(&value),
        CoverType::Water => water.contains(&value),
    })
}

/// Clean mask settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanMaskParams {
    /// Name of the QA band requested alongside the measurement bands
    pub qa_band: String,
    /// Explicit rule; when `None` the rule is chosen from the query platform
    pub rule: Option<CleanMaskRule>,
    pub cover_types: Vec<CoverType>,
}

impl Default for CleanMaskParams {
    fn default() -> Self {
        Self {
            qa_band: "pixel_qa".to_string(),
            rule: None,
            cover_types: vec![CoverType::Clear, CoverType::Water],
        }
    }
}

impl CleanMaskParams {
    /// The rule to apply for `platform`
    pub fn resolve_rule(&self, platform: &str) -> CubeResult<CleanMaskRule> {
        match &self.rule {
            Some(rule) => Ok(rule.clone()),
            None => CleanMaskRule::for_platform(platform).ok_or_else(|| {
                CubeError::Config(format!(
                    "No clean mask rule configured and none known for platform '{}'",
                    platform
                ))
            }),
        }
    }
}

/// Build the clean mask for every time slice of `qa`.
///
/// The QA band's own `no_data` value is never clean.
pub fn derive_clean_mask(
    qa: &BandArray,
    no_data: f64,
    rule: &CleanMaskRule,
    cover_types: &[CoverType],
) -> CleanMask {
    qa.to_f64().mapv(|v| {
        if v.is_nan() || v == no_data || v.fract() != 0.0 {
            false
        } else {
            rule.is_clean(v as i64, cover_types)
        }
    })
}

/// Pull the QA band out of `tile` and turn it into a clean mask
pub fn extract_clean_mask(
    tile: &mut RasterTile,
    params: &CleanMaskParams,
    rule: &CleanMaskRule,
) -> CubeResult<CleanMask> {
    let qa = tile.take_band(&params.qa_band).ok_or_else(|| {
        CubeError::Compute(format!("QA band '{}' missing from loaded tile", params.qa_band))
    })?;
    Ok(derive_clean_mask(&qa, tile.no_data, rule, &params.cover_types))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_landsat8_clear_and_water() {
        let qa = BandArray::UInt16(Array3::from_shape_vec((1, 1, 4), vec![322, 324, 480, 1]).unwrap());
        let mask = derive_clean_mask(&qa, 1.0, &CleanMaskRule::Landsat8PixelQa, &[CoverType::Clear, CoverType::Water]);
        assert_eq!(mask.iter().copied().collect::<Vec<_>>(), vec![true, true, false, false]);

        let clear_only = derive_clean_mask(&qa, 1.0, &CleanMaskRule::Landsat8PixelQa, &[CoverType::Clear]);
        assert_eq!(clear_only.iter().copied().collect::<Vec<_>>(), vec![true, false, false, false]);
    }

    #[test]
    fn test_landsat7_values() {
        let qa = BandArray::Int16(Array3::from_shape_vec((2, 1, 1), vec![66, 72]).unwrap());
        let mask = derive_clean_mask(&qa, -9999.0, &CleanMaskRule::Landsat7PixelQa, &[CoverType::Clear]);
        assert!(mask[[0, 0, 0]]);
        assert!(!mask[[1, 0, 0]]);
    }

    #[test]
    fn test_clear_bits_rule() {
        let qa = BandArray::Int32(Array3::from_shape_vec((1, 1, 3), vec![0, 8, 2]).unwrap());
        let mask = derive_clean_mask(&qa, -1.0, &CleanMaskRule::ClearBits { bad_bits: 0b1000 }, &[]);
        assert_eq!(mask.iter().copied().collect::<Vec<_>>(), vec![true, false, true]);
    }

    #[test]
    fn test_no_data_qa_is_never_clean() {
        let qa = BandArray::Int32(Array3::from_shape_vec((1, 1, 2), vec![5, -9999]).unwrap());
        let rule = CleanMaskRule::AcceptedValues(vec![5, -9999]);
        let mask = derive_clean_mask(&qa, -9999.0, &rule, &[]);
        assert_eq!(mask.iter().copied().collect::<Vec<_>>(), vec![true, false]);
    }

    #[test]
    fn test_rule_for_platform() {
        assert_eq!(CleanMaskRule::for_platform("landsat_7"), Some(CleanMaskRule::Landsat7PixelQa));
        assert_eq!(CleanMaskRule::for_platform("LANDSAT_8"), Some(CleanMaskRule::Landsat8PixelQa));
        assert!(CleanMaskParams::default().resolve_rule("SENTINEL_2").is_err());
    }
}
