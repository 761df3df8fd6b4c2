//! Nodata-aware mask algebra.
//!
//! Mask rasters use the values `0` (background), `1` (foreground) and
//! [`MASK_NODATA`]. Both operations compute the foreground test first and
//! then overwrite nodata cells, so a nodata sentinel that also passes the
//! foreground test still ends up as nodata.

use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

use crate::raster::{PixelFunction, StoreError};

/// Nodata value of every mask raster.
pub const MASK_NODATA: f64 = 2.0;

/// Nodata value of distance-to-channel rasters.
pub const DISTANCE_NODATA: f64 = -1.0;

/// Returns true if `value` is the nodata sentinel. NaN sentinels match NaN.
pub fn is_nodata(value: f64, nodata: f64) -> bool {
    if nodata.is_nan() {
        value.is_nan()
    } else {
        value == nodata
    }
}

/// Pixel algebra applied by the masking stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MaskOp {
    /// `1` where the input is positive, else `0`; input nodata becomes
    /// `target_nodata`. Without a base nodata no cell is nodata.
    Threshold {
        base_nodata: Option<f64>,
        target_nodata: f64,
    },

    /// `1` where either input holds a positive value that is not its nodata,
    /// else `0`; cells where both inputs are nodata become `target_nodata`.
    ConjunctiveJoin {
        a_nodata: f64,
        b_nodata: f64,
        target_nodata: f64,
    },
}

impl MaskOp {
    /// Channel-mask conversion of a raster with the given nodata.
    pub fn channel(base_nodata: Option<f64>) -> Self {
        Self::Threshold {
            base_nodata,
            target_nodata: MASK_NODATA,
        }
    }

    /// Join of a channel mask with a distance-to-channel raster.
    pub fn coverage() -> Self {
        Self::ConjunctiveJoin {
            a_nodata: MASK_NODATA,
            b_nodata: DISTANCE_NODATA,
            target_nodata: MASK_NODATA,
        }
    }

    /// Output nodata value.
    pub fn target_nodata(&self) -> f64 {
        match self {
            Self::Threshold { target_nodata, .. } | Self::ConjunctiveJoin { target_nodata, .. } => {
                *target_nodata
            }
        }
    }

    /// Thresholds a single array.
    pub fn threshold(
        array: &ArrayView2<'_, f64>,
        base_nodata: Option<f64>,
        target_nodata: f64,
    ) -> Array2<f64> {
        let mut result = array.mapv(|a| if a > 0.0 { 1.0 } else { 0.0 });
        if let Some(nodata) = base_nodata {
            Zip::from(&mut result).and(array).for_each(|r, &a| {
                if is_nodata(a, nodata) {
                    *r = target_nodata;
                }
            });
        }
        result
    }

    /// Joins two arrays of equal shape.
    pub fn join(
        mask_a: &ArrayView2<'_, f64>,
        mask_b: &ArrayView2<'_, f64>,
        a_nodata: f64,
        b_nodata: f64,
        target_nodata: f64,
    ) -> Array2<f64> {
        let mut result = Array2::zeros(mask_a.raw_dim());
        // A nodata side never counts as foreground.
        Zip::from(&mut result)
            .and(mask_a)
            .and(mask_b)
            .for_each(|r, &a, &b| {
                let a_set = a > 0.0 && !is_nodata(a, a_nodata);
                let b_set = b > 0.0 && !is_nodata(b, b_nodata);
                *r = if a_set || b_set { 1.0 } else { 0.0 };
            });
        Zip::from(&mut result)
            .and(mask_a)
            .and(mask_b)
            .for_each(|r, &a, &b| {
                if is_nodata(a, a_nodata) && is_nodata(b, b_nodata) {
                    *r = target_nodata;
                }
            });
        result
    }
}

impl PixelFunction for MaskOp {
    fn name(&self) -> &str {
        match self {
            Self::Threshold { .. } => "threshold_mask",
            Self::ConjunctiveJoin { .. } => "conjunctive_join",
        }
    }

    fn arity(&self) -> usize {
        match self {
            Self::Threshold { .. } => 1,
            Self::ConjunctiveJoin { .. } => 2,
        }
    }

    fn evaluate(&self, inputs: &[ArrayView2<'_, f64>]) -> Result<Array2<f64>, StoreError> {
        if inputs.len() != self.arity() {
            return Err(StoreError::InvalidArgument(format!(
                "{} expects {} inputs, got {}",
                self.name(),
                self.arity(),
                inputs.len()
            )));
        }

        match *self {
            Self::Threshold {
                base_nodata,
                target_nodata,
            } => Ok(Self::threshold(&inputs[0], base_nodata, target_nodata)),
            Self::ConjunctiveJoin {
                a_nodata,
                b_nodata,
                target_nodata,
            } => {
                if inputs[0].dim() != inputs[1].dim() {
                    return Err(StoreError::ShapeMismatch {
                        expected: inputs[0].dim(),
                        actual: inputs[1].dim(),
                    });
                }
                Ok(Self::join(
                    &inputs[0],
                    &inputs[1],
                    a_nodata,
                    b_nodata,
                    target_nodata,
                ))
            }
        }
    }
}
