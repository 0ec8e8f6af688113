//! Conversions between the sample layouts of a train.
//!
//! The wire delivers frames in image order. Consumers work on pixel-wise trains where the
//! samples of one pixel are contiguous. The conversion walks the pixel address table and
//! runs on a rayon pool:
//!
//! - ladder mode (several ASICs) splits the output into one work unit per pixel run,
//! - single ASIC mode splits the ASIC's 64 pixel rows and walks the frames inside each
//!   unit, keeping the reads of one frame close together.
//!
//! When a correction table is given every sample is unwrapped, offset and clamped while
//! being copied. Without a table samples are copied unchanged.
use rayon::prelude::*;
use rayon::ThreadPool;

use super::constants::*;
use super::correction::{apply_correction, SramCorrection};
use super::error::{ReceiverError, TrainFormatError};
use super::pixel_map::pixel_map;
use super::train_buffer::{Layout, TrainBuffer};

/// Index of the first sample of an ASIC pixel in frame 0 of an image- or ASIC-wise train
#[inline]
fn frame_offset(layout: Layout, asic: usize, asic_pixel: usize) -> usize {
    match layout {
        Layout::Asic => asic * NUM_ASIC_PIXELS + asic_pixel,
        _ => pixel_map().image_pixel(asic, asic_pixel),
    }
}

/// Copy the frames of one pixel into `out`
#[inline]
fn copy_pixel(
    input: &[u16],
    layout: Layout,
    frames: usize,
    asic: usize,
    asic_pixel: usize,
    correction: Option<&SramCorrection>,
    out: &mut [u16],
) {
    let offset = frame_offset(layout, asic, asic_pixel);
    match correction {
        Some(table) => {
            let pixel_correction = table.pixel(pixel_map().image_pixel(asic, asic_pixel));
            for frame in 0..frames {
                out[frame] = apply_correction(
                    input[frame * NUM_PIXELS + offset],
                    pixel_correction[frame],
                );
            }
        }
        None => {
            for frame in 0..frames {
                out[frame] = input[frame * NUM_PIXELS + offset];
            }
        }
    }
}

/// Re-layout an image- or ASIC-wise train into `output` as a pixel-wise train.
///
/// Only the ASICs listed in the input train are sorted; they are packed in list order.
/// The metadata of the input is copied along.
pub fn sort_to_pixel_wise(
    input: &TrainBuffer,
    output: &mut TrainBuffer,
    correction: Option<&SramCorrection>,
    pool: &ThreadPool,
) -> Result<(), ReceiverError> {
    let layout = input.layout();
    if layout == Layout::Pixel {
        return Err(TrainFormatError::UnsupportedConversion {
            from: layout.to_string(),
            to: Layout::Pixel.to_string(),
        }
        .into());
    }
    let frames = input.pulse_count();
    if frames > output.depth() {
        return Err(TrainFormatError::CapacityTooSmall(output.capacity_bytes(), frames).into());
    }
    if let Some(table) = correction {
        table.check_depth(frames)?;
    }

    output.copy_meta_from(input, Layout::Pixel);
    let stride = output.depth();
    let asics = input.asics();
    let in_data = input.data();
    let out_data = &mut output.data_mut()[..asics.len() * NUM_ASIC_PIXELS * stride];

    if let [asic] = asics {
        let asic = *asic;
        pool.install(|| {
            out_data
                .par_chunks_mut(ASIC_SIDE * stride)
                .enumerate()
                .for_each(|(row, rows_out)| {
                    let first_pixel = row * ASIC_SIDE;
                    for frame in 0..frames {
                        let frame_data = &in_data[frame * NUM_PIXELS..(frame + 1) * NUM_PIXELS];
                        for col in 0..ASIC_SIDE {
                            let pixel = first_pixel + col;
                            let value = frame_data[frame_offset(layout, asic, pixel)];
                            rows_out[col * stride + frame] = match correction {
                                Some(table) => apply_correction(
                                    value,
                                    table.get(pixel_map().image_pixel(asic, pixel), frame),
                                ),
                                None => value,
                            };
                        }
                    }
                });
        });
    } else {
        pool.install(|| {
            out_data
                .par_chunks_mut(stride)
                .enumerate()
                .for_each(|(run, out)| {
                    let asic = asics[run / NUM_ASIC_PIXELS];
                    let asic_pixel = run % NUM_ASIC_PIXELS;
                    copy_pixel(in_data, layout, frames, asic, asic_pixel, correction, out);
                });
        });
    }
    Ok(())
}

/// Re-layout a pixel-wise train into `output` as an image-wise train. Pixels of ASICs
/// not present in the train are zeroed.
pub fn sort_to_image_wise(
    input: &TrainBuffer,
    output: &mut TrainBuffer,
    pool: &ThreadPool,
) -> Result<(), ReceiverError> {
    if input.layout() != Layout::Pixel {
        return Err(TrainFormatError::UnsupportedConversion {
            from: input.layout().to_string(),
            to: Layout::Image.to_string(),
        }
        .into());
    }
    let frames = input.pulse_count();
    if frames > output.depth() {
        return Err(TrainFormatError::CapacityTooSmall(output.capacity_bytes(), frames).into());
    }

    output.copy_meta_from(input, Layout::Image);
    let stride = input.depth();
    let asics = input.asics();
    let in_data = input.data();
    let map = pixel_map();
    pool.install(|| {
        output
            .data_mut()
            .par_chunks_mut(NUM_PIXELS)
            .enumerate()
            .for_each(|(frame, image)| {
                image.fill(0);
                for (index, asic) in asics.iter().enumerate() {
                    let asic_data = &in_data[index * NUM_ASIC_PIXELS * stride..];
                    for (pixel, image_pixel) in map.asic_image_pixels(*asic).iter().enumerate() {
                        image[*image_pixel as usize] = asic_data[pixel * stride + frame];
                    }
                }
            });
    });
    Ok(())
}

/// Build the rayon pool used for sorting
pub fn build_sort_pool(threads: usize) -> Result<ThreadPool, std::io::Error> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|index| format!("dssc-sort-{index}"))
        .build()
        .map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TrainGenerator;
    use ndarray::Array2;

    const DEPTH: usize = 5;

    fn load(generator: &TrainGenerator, train_id: u64) -> TrainBuffer {
        let bytes = generator.train_bytes(train_id);
        let mut buffer = TrainBuffer::new(DEPTH);
        buffer.as_bytes_mut()[..bytes.len()].copy_from_slice(&bytes);
        buffer.parse(bytes.len(), generator.asics()).unwrap();
        buffer
    }

    fn pool() -> ThreadPool {
        build_sort_pool(2).unwrap()
    }

    #[test]
    fn test_ladder_sort() {
        let generator = TrainGenerator::new(3, vec![0, 5, 12]);
        let input = load(&generator, 11);
        let mut output = TrainBuffer::new(DEPTH);
        sort_to_pixel_wise(&input, &mut output, None, &pool()).unwrap();

        assert_eq!(output.layout(), Layout::Pixel);
        assert_eq!(output.train_id(), 11);
        assert!(output.is_valid());
        assert!(output.train_trailer().magic_ok());
        assert_eq!(output.cell_ids().collect::<Vec<_>>(), vec![0, 1, 2]);
        for (index, asic) in [0usize, 5, 12].iter().enumerate() {
            for pixel in [0, 63, 64, 2000, 4095] {
                let run = (index * NUM_ASIC_PIXELS + pixel) * DEPTH;
                for frame in 0..3 {
                    assert_eq!(
                        output.data()[run + frame],
                        generator.sample_value(11, frame, *asic, pixel)
                    );
                }
            }
        }
    }

    #[test]
    fn test_single_asic_sort_matches_ladder_sort() {
        let generator = TrainGenerator::new(4, vec![9]);
        let input = load(&generator, 2);
        let mut output = TrainBuffer::new(DEPTH);
        sort_to_pixel_wise(&input, &mut output, None, &pool()).unwrap();
        for pixel in 0..NUM_ASIC_PIXELS {
            for frame in 0..4 {
                assert_eq!(
                    output.sample(frame, 9, pixel).unwrap(),
                    generator.sample_value(2, frame, 9, pixel)
                );
            }
        }
    }

    #[test]
    fn test_asic_wise_input() {
        let mut generator = TrainGenerator::new(2, vec![1, 14]);
        generator.specific.flags.sort_asic_wise = true;
        let input = load(&generator, 3);
        assert_eq!(input.layout(), Layout::Asic);
        let mut output = TrainBuffer::new(DEPTH);
        sort_to_pixel_wise(&input, &mut output, None, &pool()).unwrap();
        assert_eq!(
            output.sample(1, 14, 77).unwrap(),
            generator.sample_value(3, 1, 14, 77)
        );
    }

    #[test]
    fn test_round_trip() {
        let generator = TrainGenerator::new(3, vec![2, 8, 15]);
        let input = load(&generator, 4);
        let pool = pool();
        let mut pixel_wise = TrainBuffer::new(DEPTH);
        sort_to_pixel_wise(&input, &mut pixel_wise, None, &pool).unwrap();
        let mut image_wise = TrainBuffer::new(DEPTH);
        sort_to_image_wise(&pixel_wise, &mut image_wise, &pool).unwrap();

        assert_eq!(image_wise.layout(), Layout::Image);
        assert_eq!(image_wise.data(), input.data());
        let meta = input.format().meta_bytes();
        let start = input.format().total_bytes() - meta;
        assert_eq!(
            &image_wise.as_bytes()[start..start + meta],
            &input.as_bytes()[start..start + meta]
        );
    }

    #[test]
    fn test_correction_applied() {
        let generator = TrainGenerator::new(2, vec![0, 8]);
        let mut input = load(&generator, 1);
        let wrapped = input.sample_index(0, 8, 3).unwrap();
        input.data_mut()[wrapped] = 1;

        let mut table = Array2::zeros((NUM_PIXELS, DEPTH));
        let image = pixel_map().image_pixel(0, 10);
        table[[image, 1]] = 2.0;
        let correction = SramCorrection::new(table).unwrap();
        let mut output = TrainBuffer::new(DEPTH);
        sort_to_pixel_wise(&input, &mut output, Some(&correction), &pool()).unwrap();

        assert_eq!(output.sample(0, 8, 3).unwrap(), 257);
        assert_eq!(
            output.sample(1, 0, 10).unwrap(),
            generator.sample_value(1, 1, 0, 10) - 2
        );

        // single ASIC mode applies the same correction
        let single = TrainGenerator::new(2, vec![0]);
        let input = load(&single, 1);
        sort_to_pixel_wise(&input, &mut output, Some(&correction), &pool()).unwrap();
        assert_eq!(
            output.sample(1, 0, 10).unwrap(),
            single.sample_value(1, 1, 0, 10) - 2
        );
    }

    #[test]
    fn test_rejected_conversions() {
        let generator = TrainGenerator::new(3, vec![0]);
        let input = load(&generator, 1);
        let pool = pool();
        let mut output = TrainBuffer::new(DEPTH);
        assert!(sort_to_image_wise(&input, &mut output, &pool).is_err());

        let mut shallow = TrainBuffer::new(2);
        assert!(sort_to_pixel_wise(&input, &mut shallow, None, &pool).is_err());

        let correction = SramCorrection::zeros(2);
        assert!(sort_to_pixel_wise(&input, &mut output, Some(&correction), &pool).is_err());
    }
}
