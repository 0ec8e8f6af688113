//! Byte offsets of the sections of a train.
//!
//! A train is laid out as
//!
//! ```text
//! | header 64B | data | cell ids | pulse ids | status | lengths | specific 160B | asic trailers 256B | train trailer 32B |
//! ```
//!
//! The descriptor blocks are each padded to a multiple of 32 bytes. The data block holds
//! `pulses` frames of the full 16 ASIC image, except for pixel-wise trains which reserve
//! `depth` samples for every pixel.
use std::fmt::Display;
use std::str::FromStr;

use super::constants::*;
use super::error::TrainFormatError;

/// The three orderings of the sample data of a train
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    /// frame, then image pixel. The order on the wire.
    #[default]
    Image,
    /// frame, then ASIC, then local pixel
    Asic,
    /// ASIC, then local pixel, then frame
    Pixel,
}

impl Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layout::Image => write!(f, "imagewise"),
            Layout::Asic => write!(f, "asicwise"),
            Layout::Pixel => write!(f, "pixelwise"),
        }
    }
}

impl FromStr for Layout {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "imagewise" => Ok(Layout::Image),
            "asicwise" => Ok(Layout::Asic),
            "pixelwise" => Ok(Layout::Pixel),
            _ => Err(format!("Unknown data layout {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Header,
    Data,
    CellIds,
    PulseIds,
    Status,
    Lengths,
    Specific,
    AsicTrailers,
    TrainTrailer,
}

fn padded(bytes: usize) -> usize {
    bytes.div_ceil(DESCRIPTOR_ALIGN) * DESCRIPTOR_ALIGN
}

/// Geometry of a single train: its pulse count, layout and (for pixel-wise trains) the
/// reserved per pixel depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainFormat {
    pub pulses: usize,
    pub layout: Layout,
    pub depth: usize,
}

impl TrainFormat {
    pub fn new(pulses: usize, layout: Layout, depth: usize) -> Self {
        Self {
            pulses,
            layout,
            depth,
        }
    }

    /// The format of a train as it arrives on the wire
    pub fn wire(pulses: usize) -> Self {
        Self::new(pulses, Layout::Image, pulses)
    }

    /// Number of samples stored per pixel in the data block
    pub fn pixel_stride(&self) -> usize {
        match self.layout {
            Layout::Pixel => self.depth,
            _ => self.pulses,
        }
    }

    pub fn section_bytes(&self, section: Section) -> usize {
        match section {
            Section::Header => TRAIN_HEADER_BYTES,
            Section::Data => self.pixel_stride() * NUM_PIXELS * 2,
            Section::CellIds => padded(self.pulses * 2),
            Section::PulseIds => padded(self.pulses * 8),
            Section::Status => padded(self.pulses * 2),
            Section::Lengths => padded(self.pulses * 4),
            Section::Specific => SPECIFIC_BYTES,
            Section::AsicTrailers => ASIC_TRAILER_BLOCK_BYTES,
            Section::TrainTrailer => TRAIN_TRAILER_BYTES,
        }
    }

    /// First byte of a section
    pub fn section_start(&self, section: Section) -> usize {
        const ORDER: [Section; 9] = [
            Section::Header,
            Section::Data,
            Section::CellIds,
            Section::PulseIds,
            Section::Status,
            Section::Lengths,
            Section::Specific,
            Section::AsicTrailers,
            Section::TrainTrailer,
        ];
        ORDER
            .iter()
            .take_while(|s| **s != section)
            .map(|s| self.section_bytes(*s))
            .sum()
    }

    /// Total number of bytes from the header up to the end of the train trailer
    pub fn total_bytes(&self) -> usize {
        self.section_start(Section::TrainTrailer) + TRAIN_TRAILER_BYTES
    }

    /// Everything following the data block
    pub fn meta_bytes(&self) -> usize {
        self.total_bytes() - self.section_start(Section::CellIds)
    }

    /// Number of datagrams needed to send a train of this format
    pub fn num_packets(&self) -> usize {
        let total = self.total_bytes();
        // a train which fills its last datagram is closed by an empty one
        total / PACKET_PAYLOAD_SIZE + 1
    }
}

/// Bytes a buffer must hold to store any train up to `depth` pulses in any layout,
/// including the slack needed to receive one more full datagram.
pub fn max_train_bytes(depth: usize) -> usize {
    TrainFormat::new(depth, Layout::Pixel, depth).total_bytes() + RECV_WINDOW
}

/// Check a pulse count read from a header against the depth of the buffer
pub fn check_pulse_count(pulses: u64, depth: usize) -> Result<usize, TrainFormatError> {
    if pulses == 0 || pulses > depth as u64 {
        return Err(TrainFormatError::BadPulseCount(pulses, depth));
    }
    Ok(pulses as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_offsets() {
        let format = TrainFormat::wire(1);
        assert_eq!(format.section_start(Section::Data), 64);
        assert_eq!(format.section_start(Section::CellIds), 64 + 131072);
        // one pulse pads every descriptor block to 32 bytes
        assert_eq!(format.section_start(Section::Specific), 64 + 131072 + 4 * 32);
        assert_eq!(
            format.total_bytes(),
            64 + 131072 + 4 * 32 + SPECIFIC_BYTES + ASIC_TRAILER_BLOCK_BYTES + 32
        );
    }

    #[test]
    fn test_descriptor_padding() {
        let format = TrainFormat::wire(800);
        assert_eq!(format.section_bytes(Section::CellIds), 1600);
        assert_eq!(format.section_bytes(Section::PulseIds), 6400);
        assert_eq!(format.section_bytes(Section::Lengths), 3200);
        let odd = TrainFormat::wire(17);
        assert_eq!(odd.section_bytes(Section::CellIds), 64);
        assert_eq!(odd.section_bytes(Section::PulseIds), 160);
    }

    #[test]
    fn test_pixel_layout_reserves_depth() {
        let pixel = TrainFormat::new(10, Layout::Pixel, 800);
        let image = TrainFormat::new(10, Layout::Image, 800);
        assert_eq!(pixel.section_bytes(Section::Data), 800 * NUM_PIXELS * 2);
        assert_eq!(image.section_bytes(Section::Data), 10 * NUM_PIXELS * 2);
        assert_eq!(pixel.meta_bytes(), image.meta_bytes());
    }

    #[test]
    fn test_layout_names() {
        for layout in [Layout::Image, Layout::Asic, Layout::Pixel] {
            assert_eq!(layout.to_string().parse::<Layout>().unwrap(), layout);
        }
        assert!("sideways".parse::<Layout>().is_err());
        assert!(check_pulse_count(0, 800).is_err());
        assert!(check_pulse_count(801, 800).is_err());
        assert_eq!(check_pulse_count(800, 800), Ok(800));
    }
}
