use ndarray::{Array2, ArrayView1};

use super::constants::*;
use super::error::CorrectionError;

/// Undo the wrap of the gray counter: codes below the threshold belong past the top of
/// the 8 bit range.
#[inline]
pub fn gcc_unwrap(value: u16) -> u16 {
    if value < GCC_WRAP_THRESHOLD {
        value + GCC_WRAP_OFFSET
    } else {
        value
    }
}

/// Unwrap a sample, subtract its correction and clamp to the ADC range
#[inline]
pub fn apply_correction(value: u16, correction: f32) -> u16 {
    let corrected = (gcc_unwrap(value) as f32 - correction).round();
    corrected.clamp(0.0, MAX_ADC_VALUE as f32) as u16
}

/// Per pixel, per SRAM address offsets subtracted while sorting.
///
/// The table is indexed by image pixel, then SRAM address (frame).
#[derive(Debug, Clone, PartialEq)]
pub struct SramCorrection {
    table: Array2<f32>,
}

impl SramCorrection {
    pub fn new(table: Array2<f32>) -> Result<Self, CorrectionError> {
        let (pixels, depth) = table.dim();
        if pixels != NUM_PIXELS || depth == 0 {
            return Err(CorrectionError::BadShape((pixels, depth), NUM_PIXELS));
        }
        Ok(Self {
            table: table.as_standard_layout().into_owned(),
        })
    }

    /// A table applying no offset, only the gray counter unwrap and clamping
    pub fn zeros(depth: usize) -> Self {
        Self {
            table: Array2::zeros((NUM_PIXELS, depth)),
        }
    }

    pub fn depth(&self) -> usize {
        self.table.ncols()
    }

    /// The table must cover every frame of the trains it is applied to
    pub fn check_depth(&self, frames: usize) -> Result<(), CorrectionError> {
        if self.depth() < frames {
            return Err(CorrectionError::TooShallow(self.depth(), frames));
        }
        Ok(())
    }

    pub fn pixel(&self, image_pixel: usize) -> ArrayView1<'_, f32> {
        self.table.row(image_pixel)
    }

    #[inline]
    pub fn get(&self, image_pixel: usize, sram: usize) -> f32 {
        self.table[[image_pixel, sram]]
    }
}
