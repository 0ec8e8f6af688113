use rayon::prelude::*;

use super::constants::*;
use super::train_buffer::{Layout, TrainBuffer};

const MAX_REPORTED_ERRORS: u64 = 100;

/// Value the data receiver sends for a pixel in DR dummy data mode. Upper row ASICs count
/// their pixels backwards.
pub fn dummy_dr_value(asic: usize, asic_pixel: usize) -> u16 {
    let index = if asic >= NUM_ASIC_COLS {
        NUM_ASIC_PIXELS - asic_pixel - 1
    } else {
        asic_pixel
    };
    let col = index % ASIC_SIDE;
    let row = index / ASIC_SIDE;
    let value = if col < 32 { 33 - col } else { col + 2 };
    ((value + row * ASIC_SIDE) % 512) as u16
}

/// Result of checking one train
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckResult {
    pub errors: u64,
    pub words: u64,
}

/// Compares trains against the DR dummy pattern. The per-ASIC sample buffers are kept
/// between trains.
#[derive(Debug, Default)]
pub struct DummyDataCheck {
    scratch: Vec<Vec<u16>>,
}

impl DummyDataCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare every sample of every present ASIC against the DR dummy pattern
    pub fn check(&mut self, train: &TrainBuffer) -> CheckResult {
        let frames = train.pulse_count();
        let asics = train.asics();
        if self.scratch.len() < asics.len() {
            self.scratch.resize_with(asics.len(), Vec::new);
        }
        let errors: u64 = self.scratch[..asics.len()]
            .par_iter_mut()
            .zip(asics.par_iter())
            .map(|(samples, asic)| {
                samples.resize(frames, 0);
                check_asic(train, *asic, samples)
            })
            .sum();
        CheckResult {
            errors,
            words: (frames * asics.len() * NUM_ASIC_PIXELS) as u64,
        }
    }
}

fn check_asic(train: &TrainBuffer, asic: usize, samples: &mut [u16]) -> u64 {
    let frames = samples.len();
    let mut errors = 0u64;
    for pixel in 0..NUM_ASIC_PIXELS {
        let expected = dummy_dr_value(asic, pixel);
        if train.fill_pixel_samples(asic, pixel, samples).is_err() {
            errors += frames as u64;
            continue;
        }
        for (frame, value) in samples.iter().enumerate() {
            if *value != expected {
                if errors < MAX_REPORTED_ERRORS {
                    log::debug!(
                        "Dummy data mismatch in ASIC {asic} pixel {pixel} frame {frame}: expected {expected}, got {value}"
                    );
                }
                errors += 1;
            }
        }
    }
    errors
}

/// Count samples of an image-wise train which do not fit the 9 bit ADC range
pub fn count_out_of_range(train: &TrainBuffer) -> usize {
    if train.layout() != Layout::Image {
        return 0;
    }
    train
        .data()
        .par_chunks(NUM_PIXELS)
        .map(|frame| frame.iter().filter(|v| **v > MAX_ADC_VALUE).count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TrainGenerator;

    fn load(generator: &TrainGenerator, train_id: u64) -> TrainBuffer {
        let bytes = generator.train_bytes(train_id);
        let mut buffer = TrainBuffer::new(generator.pulses);
        buffer.as_bytes_mut()[..bytes.len()].copy_from_slice(&bytes);
        buffer.parse(bytes.len(), generator.asics()).unwrap();
        buffer
    }

    #[test]
    fn test_dummy_values() {
        assert_eq!(dummy_dr_value(0, 0), 33);
        assert_eq!(dummy_dr_value(0, 31), 2);
        assert_eq!(dummy_dr_value(0, 32), 34);
        assert_eq!(dummy_dr_value(0, 64), 33 + 64);
        assert_eq!(dummy_dr_value(8, 4095), 33);
        assert_eq!(dummy_dr_value(0, 4095), (65 + 63 * 64) % 512);
    }

    #[test]
    fn test_dummy_train_passes() {
        let generator = TrainGenerator::dummy(2, vec![0, 8]);
        let mut train = load(&generator, 1);
        assert_eq!(train.test_pattern(), Some(DR_DUMMY_DATA_TESTPATTERN));
        let mut check = DummyDataCheck::new();
        let result = check.check(&train);
        assert_eq!(result.errors, 0);
        assert_eq!(result.words, 2 * 2 * 4096);

        let index = train.sample_index(1, 8, 10).unwrap();
        train.data_mut()[index] += 1;
        assert_eq!(check.check(&train).errors, 1);
    }

    #[test]
    fn test_scratch_follows_train_shape() {
        let mut check = DummyDataCheck::new();
        let deep = load(&TrainGenerator::dummy(3, vec![1, 2, 9]), 1);
        let shallow = load(&TrainGenerator::dummy(1, vec![4]), 2);
        assert_eq!(check.check(&deep).errors, 0);
        assert_eq!(check.check(&shallow).errors, 0);
        assert_eq!(check.check(&shallow).words, 4096);
        assert_eq!(check.check(&deep).words, 3 * 3 * 4096);
        assert_eq!(check.check(&deep).errors, 0);
    }

    #[test]
    fn test_out_of_range_count() {
        let generator = TrainGenerator::new(2, vec![3]);
        let mut train = load(&generator, 1);
        assert_eq!(count_out_of_range(&train), 0);
        train.data_mut()[17] = 512;
        train.data_mut()[NUM_PIXELS + 5] = 1000;
        assert_eq!(count_out_of_range(&train), 2);
    }
}
