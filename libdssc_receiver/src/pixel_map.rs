// The sensor is a 2 x 8 tiling of 64 x 64 pixel ASICs, giving a 128 x 512 image:
//
//   image row 127  +----+----+----+----+----+----+----+----+
//                  | 15 | 14 | 13 | 12 | 11 | 10 |  9 |  8 |   upper row, rotated
//   image row 64   +----+----+----+----+----+----+----+----+
//                  |  0 |  1 |  2 |  3 |  4 |  5 |  6 |  7 |   lower row
//   image row 0    +----+----+----+----+----+----+----+----+
//
// The upper row is mounted rotated by 180 degrees, so both its column order and its
// local pixel order run backwards: local pixel 0 of ASIC 8 is the last image pixel of
// the image. The wire sends frames in image order, consumers want ASIC/pixel order, so
// every reshuffle goes through this table.
use once_cell::sync::Lazy;

use super::constants::*;

static PIXEL_MAP: Lazy<PixelMap> = Lazy::new(PixelMap::build);

/// The process wide pixel address table. Built on first use, read only afterwards.
pub fn pixel_map() -> &'static PixelMap {
    &PIXEL_MAP
}

/// Image pixel of a local ASIC pixel
pub fn calc_image_pixel(asic: usize, asic_pixel: usize) -> usize {
    let upper = asic >= NUM_ASIC_COLS;
    let (block_col, local) = if upper {
        (
            NUM_ASIC_COLS - 1 - (asic - NUM_ASIC_COLS),
            NUM_ASIC_PIXELS - 1 - asic_pixel,
        )
    } else {
        (asic, asic_pixel)
    };
    let row = local / ASIC_SIDE + if upper { ASIC_SIDE } else { 0 };
    let col = local % ASIC_SIDE + block_col * ASIC_SIDE;
    row * IMAGE_WIDTH + col
}

/// ASIC and local ASIC pixel of an image pixel
pub fn calc_asic_pixel(image_pixel: usize) -> (usize, usize) {
    let row = image_pixel / IMAGE_WIDTH;
    let col = image_pixel % IMAGE_WIDTH;
    let block_row = row / ASIC_SIDE;
    let block_col = col / ASIC_SIDE;
    let local = (row % ASIC_SIDE) * ASIC_SIDE + col % ASIC_SIDE;
    if block_row == 0 {
        (block_col, local)
    } else {
        (
            NUM_ASIC_COLS + (NUM_ASIC_COLS - 1 - block_col),
            NUM_ASIC_PIXELS - 1 - local,
        )
    }
}

/// PixelMap holds both directions of the (ASIC, local pixel) <-> image pixel mapping.
///
/// Entries are indexed by `asic * NUM_ASIC_PIXELS + asic_pixel` (forward) and by image
/// pixel (inverse).
#[derive(Debug)]
pub struct PixelMap {
    image_of: Box<[u32]>,
    asic_pixel_of: Box<[u32]>,
}

impl PixelMap {
    fn build() -> Self {
        let mut image_of = vec![0u32; NUM_PIXELS].into_boxed_slice();
        let mut asic_pixel_of = vec![0u32; NUM_PIXELS].into_boxed_slice();
        for asic in 0..NUM_ASICS {
            for pixel in 0..NUM_ASIC_PIXELS {
                let global = asic * NUM_ASIC_PIXELS + pixel;
                let image = calc_image_pixel(asic, pixel);
                image_of[global] = image as u32;
                asic_pixel_of[image] = global as u32;
            }
        }
        log::debug!("Built pixel address table for {NUM_PIXELS} pixels");
        Self {
            image_of,
            asic_pixel_of,
        }
    }

    /// Image pixel of a local ASIC pixel
    #[inline]
    pub fn image_pixel(&self, asic: usize, asic_pixel: usize) -> usize {
        self.image_of[asic * NUM_ASIC_PIXELS + asic_pixel] as usize
    }

    /// Global ASIC pixel (`asic * 4096 + local`) of an image pixel
    #[inline]
    pub fn asic_pixel(&self, image_pixel: usize) -> usize {
        self.asic_pixel_of[image_pixel] as usize
    }

    #[inline]
    pub fn asic_of(&self, image_pixel: usize) -> usize {
        self.asic_pixel(image_pixel) / NUM_ASIC_PIXELS
    }

    /// The image pixels of one ASIC, ordered by local pixel
    pub fn asic_image_pixels(&self, asic: usize) -> &[u32] {
        &self.image_of[asic * NUM_ASIC_PIXELS..(asic + 1) * NUM_ASIC_PIXELS]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bijection() {
        let map = pixel_map();
        let mut seen = vec![false; NUM_PIXELS];
        for asic in 0..NUM_ASICS {
            for pixel in 0..NUM_ASIC_PIXELS {
                let image = map.image_pixel(asic, pixel);
                assert!(!seen[image], "image pixel {image} mapped twice");
                seen[image] = true;
                assert_eq!(map.asic_pixel(image), asic * NUM_ASIC_PIXELS + pixel);
                assert_eq!(calc_asic_pixel(image), (asic, pixel));
            }
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_lower_row_is_plain_tiling() {
        assert_eq!(calc_image_pixel(0, 0), 0);
        assert_eq!(calc_image_pixel(0, 63), 63);
        assert_eq!(calc_image_pixel(0, 64), IMAGE_WIDTH);
        assert_eq!(calc_image_pixel(1, 0), 64);
        assert_eq!(calc_image_pixel(7, 4095), 63 * IMAGE_WIDTH + IMAGE_WIDTH - 1);
    }

    #[test]
    fn test_upper_row_is_mirrored() {
        // ASIC 8 sits in the right most column of the upper row, pixel 0 in its far corner
        assert_eq!(calc_image_pixel(8, 0), NUM_PIXELS - 1);
        assert_eq!(calc_image_pixel(8, 4095), 64 * IMAGE_WIDTH + 7 * 64);
        // ASIC 15 sits in the left most column
        assert_eq!(calc_image_pixel(15, 4095), 64 * IMAGE_WIDTH);
        assert_eq!(pixel_map().asic_of(64 * IMAGE_WIDTH), 15);
    }
}
