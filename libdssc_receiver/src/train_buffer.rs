use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::error::TrainFormatError;
use super::pixel_map::pixel_map;
use super::train_data::{AsicTrailer, SpecificData, TrainHeader, TrainTrailer};
pub use super::train_format::Layout;
use super::train_format::{check_pulse_count, max_train_bytes, Section, TrainFormat};

/// Storage for one train.
///
/// A TrainBuffer is allocated once, sized for the deepest train in any layout plus one
/// datagram of slack, and then reused for every train that passes through it. The raw
/// bytes are kept in a `u16` vector so that samples can be addressed directly; byte
/// views for receiving and for section access are taken with bytemuck. Samples and
/// fields are little endian on the wire, matching the host representation on the
/// platforms the receiver runs on.
///
/// Besides the raw bytes the buffer carries the parsed metadata of the train it holds:
/// header, device specific data, ASIC trailers, train trailer, the current layout and
/// the list of ASICs present in the payload.
#[derive(Debug, Clone)]
pub struct TrainBuffer {
    words: Vec<u16>,
    depth: usize,
    valid: bool,
    train_id: u64,
    pulses: usize,
    layout: Layout,
    asics: Vec<usize>,
    header: TrainHeader,
    specific: SpecificData,
    asic_trailers: [AsicTrailer; NUM_ASICS],
    trailer: TrainTrailer,
}

impl TrainBuffer {
    /// Allocate a buffer able to hold trains of up to `depth` pulses per pixel
    pub fn new(depth: usize) -> Self {
        let words = max_train_bytes(depth).div_ceil(2);
        Self {
            words: vec![0; words],
            depth,
            valid: false,
            train_id: INVALID_TRAIN_ID,
            pulses: 0,
            layout: Layout::Image,
            asics: Vec::with_capacity(NUM_ASICS),
            header: TrainHeader::default(),
            specific: SpecificData::default(),
            asic_trailers: [AsicTrailer::default(); NUM_ASICS],
            trailer: TrainTrailer::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn capacity_bytes(&self) -> usize {
        self.words.len() * 2
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Train id of the held train, or [INVALID_TRAIN_ID] if the buffer holds no train
    pub fn train_id(&self) -> u64 {
        self.train_id
    }

    pub fn pulse_count(&self) -> usize {
        self.pulses
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The ASICs present in the payload, ascending
    pub fn asics(&self) -> &[usize] {
        &self.asics
    }

    pub fn header(&self) -> &TrainHeader {
        &self.header
    }

    pub fn specific_data(&self) -> &SpecificData {
        &self.specific
    }

    pub fn asic_trailer(&self, asic: usize) -> &AsicTrailer {
        &self.asic_trailers[asic]
    }

    pub fn asic_trailers(&self) -> &[AsicTrailer; NUM_ASICS] {
        &self.asic_trailers
    }

    pub fn train_trailer(&self) -> &TrainTrailer {
        &self.trailer
    }

    /// Test pattern reported by the first present ASIC
    pub fn test_pattern(&self) -> Option<u16> {
        self.asics
            .first()
            .map(|asic| self.asic_trailers[*asic].test_pattern)
    }

    pub fn format(&self) -> TrainFormat {
        TrainFormat::new(self.pulses, self.layout, self.depth)
    }

    /// Mark the buffer as holding no train
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.train_id = INVALID_TRAIN_ID;
        self.pulses = 0;
    }

    pub fn set_asics(&mut self, asics: &[usize]) {
        self.asics.clear();
        self.asics.extend_from_slice(asics);
    }

    /// Parse the train held in the first `received_bytes` bytes of the buffer.
    ///
    /// The train is expected in wire format. The layout becomes ASIC-wise if the device
    /// flags say the IOB already sorted the data, image-wise otherwise. On success the
    /// buffer is valid.
    pub fn parse(&mut self, received_bytes: usize, asics: &[usize]) -> Result<(), TrainFormatError> {
        self.invalidate();
        let available = received_bytes.min(self.capacity_bytes());
        let header = TrainHeader::read(&self.as_bytes()[..available])?;
        let pulses = check_pulse_count(header.pulse_count, self.depth)?;
        let wire = TrainFormat::wire(pulses);
        if available < wire.total_bytes() {
            return Err(TrainFormatError::Truncated {
                needed: wire.total_bytes(),
                available,
            });
        }

        self.header = header;
        self.pulses = pulses;
        self.layout = Layout::Image;
        self.read_meta();
        if self.specific.flags.sort_asic_wise {
            self.layout = Layout::Asic;
        }
        self.set_asics(asics);
        self.train_id = header.train_id;
        self.valid = true;
        Ok(())
    }

    /// Decode the sections following the data block for the current format
    fn read_meta(&mut self) {
        let format = self.format();
        let bytes = self.as_bytes();
        let specific = SpecificData::read(&bytes[format.section_start(Section::Specific)..]);
        let trailers = AsicTrailer::read_block(&bytes[format.section_start(Section::AsicTrailers)..]);
        let trailer = TrainTrailer::read(&bytes[format.section_start(Section::TrainTrailer)..]);
        self.specific = specific;
        self.asic_trailers = trailers;
        self.trailer = trailer;
    }

    /// Copy header and all metadata of `other` into this buffer, positioned for `layout`.
    /// The sample data is not touched. The buffer takes over the validity of `other`.
    pub fn copy_meta_from(&mut self, other: &TrainBuffer, layout: Layout) {
        let src_format = other.format();
        let dst_format = TrainFormat::new(other.pulses, layout, self.depth);
        let src_start = src_format.section_start(Section::CellIds);
        let dst_start = dst_format.section_start(Section::CellIds);
        let len = src_format.meta_bytes();

        let src = other.as_bytes();
        let dst = self.as_bytes_mut();
        dst[..TRAIN_HEADER_BYTES].copy_from_slice(&src[..TRAIN_HEADER_BYTES]);
        dst[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);

        self.valid = other.valid;
        self.train_id = other.train_id;
        self.pulses = other.pulses;
        self.layout = layout;
        self.set_asics(&other.asics);
        self.header = other.header;
        self.specific = other.specific;
        self.asic_trailers = other.asic_trailers;
        self.trailer = other.trailer;
    }

    /// Word range of the sample data block for the current format
    fn data_range(&self) -> Range<usize> {
        let format = self.format();
        let start = format.section_start(Section::Data) / 2;
        start..start + format.section_bytes(Section::Data) / 2
    }

    /// The sample data in the current layout
    pub fn data(&self) -> &[u16] {
        &self.words[self.data_range()]
    }

    pub fn data_mut(&mut self) -> &mut [u16] {
        let range = self.data_range();
        &mut self.words[range]
    }

    fn section(&self, section: Section) -> &[u8] {
        let format = self.format();
        let start = format.section_start(section);
        &self.as_bytes()[start..start + format.section_bytes(section)]
    }

    pub fn cell_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.section(Section::CellIds)
            .chunks_exact(2)
            .take(self.pulses)
            .map(LittleEndian::read_u16)
    }

    pub fn pulse_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.section(Section::PulseIds)
            .chunks_exact(8)
            .take(self.pulses)
            .map(LittleEndian::read_u64)
    }

    pub fn statuses(&self) -> impl Iterator<Item = u16> + '_ {
        self.section(Section::Status)
            .chunks_exact(2)
            .take(self.pulses)
            .map(LittleEndian::read_u16)
    }

    pub fn lengths(&self) -> impl Iterator<Item = u32> + '_ {
        self.section(Section::Lengths)
            .chunks_exact(4)
            .take(self.pulses)
            .map(LittleEndian::read_u32)
    }

    /// Position of an ASIC in the payload of a pixel-wise train
    fn asic_index(&self, asic: usize) -> Result<usize, TrainFormatError> {
        self.asics
            .iter()
            .position(|a| *a == asic)
            .ok_or(TrainFormatError::AsicNotPresent(asic))
    }

    /// Index into [TrainBuffer::data] of one sample
    pub fn sample_index(
        &self,
        frame: usize,
        asic: usize,
        asic_pixel: usize,
    ) -> Result<usize, TrainFormatError> {
        if frame >= self.pulses {
            return Err(TrainFormatError::FrameOutOfRange(frame, self.pulses));
        }
        Ok(match self.layout {
            Layout::Image => frame * NUM_PIXELS + pixel_map().image_pixel(asic, asic_pixel),
            Layout::Asic => frame * NUM_PIXELS + asic * NUM_ASIC_PIXELS + asic_pixel,
            Layout::Pixel => {
                (self.asic_index(asic)? * NUM_ASIC_PIXELS + asic_pixel) * self.depth + frame
            }
        })
    }

    pub fn sample(
        &self,
        frame: usize,
        asic: usize,
        asic_pixel: usize,
    ) -> Result<u16, TrainFormatError> {
        Ok(self.data()[self.sample_index(frame, asic, asic_pixel)?])
    }

    /// Write one frame in image order into `out`. Pixels of absent ASICs are zeroed.
    pub fn fill_frame(&self, frame: usize, out: &mut [u16]) -> Result<(), TrainFormatError> {
        if frame >= self.pulses {
            return Err(TrainFormatError::FrameOutOfRange(frame, self.pulses));
        }
        if self.layout == Layout::Image {
            out[..NUM_PIXELS].copy_from_slice(&self.data()[frame * NUM_PIXELS..(frame + 1) * NUM_PIXELS]);
            return Ok(());
        }
        out[..NUM_PIXELS].fill(0);
        let map = pixel_map();
        for asic in self.asics.iter() {
            for (pixel, image) in map.asic_image_pixels(*asic).iter().enumerate() {
                out[*image as usize] = self.sample(frame, *asic, pixel)?;
            }
        }
        Ok(())
    }

    /// Write one frame of one ASIC in local pixel order into `out`
    pub fn fill_asic_frame(
        &self,
        frame: usize,
        asic: usize,
        out: &mut [u16],
    ) -> Result<(), TrainFormatError> {
        if !self.asics.contains(&asic) {
            return Err(TrainFormatError::AsicNotPresent(asic));
        }
        for (pixel, value) in out[..NUM_ASIC_PIXELS].iter_mut().enumerate() {
            *value = self.sample(frame, asic, pixel)?;
        }
        Ok(())
    }

    /// Write all frames of one pixel into `out`
    pub fn fill_pixel_samples(
        &self,
        asic: usize,
        asic_pixel: usize,
        out: &mut [u16],
    ) -> Result<(), TrainFormatError> {
        if self.pulses == 0 {
            return Ok(());
        }
        if self.layout == Layout::Pixel {
            let start = self.sample_index(0, asic, asic_pixel)?;
            out[..self.pulses].copy_from_slice(&self.data()[start..start + self.pulses]);
            return Ok(());
        }
        for (frame, value) in out[..self.pulses].iter_mut().enumerate() {
            *value = self.sample(frame, asic, asic_pixel)?;
        }
        Ok(())
    }

    /// Add the samples of the frames in `sram` to `sums`, indexed by global ASIC pixel
    /// (`asic * 4096 + pixel`). Frames past the end of the train are ignored.
    pub fn accumulate(&self, sram: Range<usize>, sums: &mut [u64]) -> Result<(), TrainFormatError> {
        let frames = sram.start.min(self.pulses)..sram.end.min(self.pulses);
        for asic in self.asics.iter() {
            for pixel in 0..NUM_ASIC_PIXELS {
                let sum = &mut sums[asic * NUM_ASIC_PIXELS + pixel];
                for frame in frames.clone() {
                    *sum += self.sample(frame, *asic, pixel)? as u64;
                }
            }
        }
        Ok(())
    }
}
