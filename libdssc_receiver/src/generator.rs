use std::io;
use std::net::{SocketAddr, UdpSocket};

use byteorder::{ByteOrder, LittleEndian};

use super::config::Config;
use super::constants::*;
use super::datagram::DatagramTrailer;
use super::dummy_check::dummy_dr_value;
use super::pixel_map::pixel_map;
use super::train_data::{AsicTrailer, SpecificData, TrainHeader, TrainTrailer};
use super::train_format::{Section, TrainFormat};

/// TrainGenerator builds synthetic trains in wire format.
///
/// Trains are bit exact: header, data, descriptors, device specific block, ASIC trailers
/// and train trailer are laid out as the IOB sends them. Sample values are a function of
/// train id, frame, ASIC and pixel (see [TrainGenerator::sample_value]), or the DR dummy
/// pattern when `dummy_dr_data` is set. Pixels of ASICs not in the generator's list are
/// sent as zeros.
#[derive(Debug, Clone)]
pub struct TrainGenerator {
    pub pulses: usize,
    asics: Vec<usize>,
    pub specific: SpecificData,
    pub test_pattern: u16,
    pub dummy_dr_data: bool,
}

impl TrainGenerator {
    pub fn new(pulses: usize, asics: Vec<usize>) -> Self {
        Self {
            pulses,
            asics,
            specific: SpecificData::default(),
            test_pattern: DEFAULT_EXPECTED_TESTPATTERN,
            dummy_dr_data: false,
        }
    }

    /// A generator sending the ASICs enabled in `config`
    pub fn from_config(config: &Config, pulses: usize) -> Self {
        let mut generator = Self::new(pulses, config.sending_asics());
        generator.test_pattern = config.expected_test_pattern;
        generator
    }

    /// A generator sending DR dummy data
    pub fn dummy(pulses: usize, asics: Vec<usize>) -> Self {
        let mut generator = Self::new(pulses, asics);
        generator.dummy_dr_data = true;
        generator.test_pattern = DR_DUMMY_DATA_TESTPATTERN;
        generator.specific.flags.send_dummy_dr_data = true;
        generator
    }

    pub fn asics(&self) -> &[usize] {
        &self.asics
    }

    pub fn format(&self) -> TrainFormat {
        TrainFormat::wire(self.pulses)
    }

    /// The value sent for one sample
    pub fn sample_value(&self, train_id: u64, frame: usize, asic: usize, asic_pixel: usize) -> u16 {
        if self.dummy_dr_data {
            return dummy_dr_value(asic, asic_pixel);
        }
        let seed = (train_id as usize)
            .wrapping_mul(7)
            .wrapping_add(frame * 131 + asic * 4099 + asic_pixel);
        (GCC_WRAP_THRESHOLD as usize + seed % 500) as u16
    }

    /// Write the train with `train_id` into `out`, returning the number of bytes written
    pub fn write_train(&self, train_id: u64, out: &mut [u8]) -> usize {
        let format = self.format();
        let total = format.total_bytes();
        let out = &mut out[..total];
        out.fill(0);

        TrainHeader {
            magic: MAGIC_HEADER,
            major_version: 2,
            minor_version: 0,
            train_id,
            data_id: 0,
            det_link_id: 0,
            tb_link_id: 0,
            pulse_count: self.pulses as u64,
            det_specific_length: SPECIFIC_BYTES as u32,
            tb_specific_length: 0,
        }
        .write(out);

        let data_start = format.section_start(Section::Data);
        let asic_wise = self.specific.flags.sort_asic_wise;
        let map = pixel_map();
        for frame in 0..self.pulses {
            for asic in self.asics.iter() {
                for pixel in 0..NUM_ASIC_PIXELS {
                    let index = if asic_wise {
                        asic * NUM_ASIC_PIXELS + pixel
                    } else {
                        map.image_pixel(*asic, pixel)
                    };
                    let byte = data_start + (frame * NUM_PIXELS + index) * 2;
                    LittleEndian::write_u16(
                        &mut out[byte..],
                        self.sample_value(train_id, frame, *asic, pixel),
                    );
                }
            }
        }

        let cell_ids = format.section_start(Section::CellIds);
        let pulse_ids = format.section_start(Section::PulseIds);
        let lengths = format.section_start(Section::Lengths);
        for frame in 0..self.pulses {
            LittleEndian::write_u16(&mut out[cell_ids + frame * 2..], frame as u16);
            LittleEndian::write_u64(
                &mut out[pulse_ids + frame * 8..],
                train_id * 1000 + frame as u64,
            );
            LittleEndian::write_u32(&mut out[lengths + frame * 4..], (NUM_PIXELS * 2) as u32);
        }

        self.specific
            .write(&mut out[format.section_start(Section::Specific)..]);
        let trailers = format.section_start(Section::AsicTrailers);
        for asic in self.asics.iter() {
            AsicTrailer {
                temp0: 200 + *asic as u16,
                temp1: 300,
                veto_count: 0,
                ro_xor: 0,
                test_pattern: self.test_pattern,
            }
            .write(&mut out[trailers + asic * ASIC_TRAILER_BYTES..]);
        }
        TrainTrailer {
            magic: MAGIC_TRAILER,
            ..Default::default()
        }
        .write(&mut out[format.section_start(Section::TrainTrailer)..]);
        total
    }

    pub fn train_bytes(&self, train_id: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; self.format().total_bytes()];
        self.write_train(train_id, &mut bytes);
        bytes
    }

    /// Split a train into the datagrams the IOB would send
    pub fn datagrams(&self, train_id: u64, frame_id: u32) -> Vec<Vec<u8>> {
        let train = self.train_bytes(train_id);
        let mut datagrams = Vec::with_capacity(self.format().num_packets());
        let mut scratch = Vec::with_capacity(PACKET_SIZE);
        // collecting into memory cannot fail
        let _ = for_each_datagram(&train, frame_id, &mut scratch, |datagram| {
            datagrams.push(datagram.to_vec());
            Ok(())
        });
        datagrams
    }
}

/// Packetize a train, calling `send` with every datagram in order.
///
/// Each datagram carries up to 8184 payload bytes followed by the trailer. A train whose
/// size is a multiple of the payload size is closed with an empty datagram so that the
/// last datagram is always shorter than [PACKET_SIZE].
pub fn for_each_datagram<F>(
    train: &[u8],
    frame_id: u32,
    scratch: &mut Vec<u8>,
    mut send: F,
) -> io::Result<usize>
where
    F: FnMut(&[u8]) -> io::Result<()>,
{
    let mut chunks: Vec<&[u8]> = train.chunks(PACKET_PAYLOAD_SIZE).collect();
    if train.len() % PACKET_PAYLOAD_SIZE == 0 {
        chunks.push(&[]);
    }
    let last = chunks.len() - 1;
    for (packet, chunk) in chunks.iter().enumerate() {
        scratch.clear();
        scratch.extend_from_slice(chunk);
        scratch.resize(chunk.len() + PACKET_TRAILER_SIZE, 0);
        let mut flags = 0;
        if packet == 0 {
            flags |= PACKET_SOF_FLAG;
        }
        if packet == last {
            flags |= PACKET_EOF_FLAG;
        }
        DatagramTrailer {
            frame_id,
            packet_id: packet as u16,
            flags,
        }
        .write(scratch.as_mut_slice());
        send(scratch.as_slice())?;
    }
    Ok(chunks.len())
}

/// Send one packetized train over UDP. Returns the number of datagrams sent.
pub fn send_train(
    socket: &UdpSocket,
    target: SocketAddr,
    train: &[u8],
    frame_id: u32,
    scratch: &mut Vec<u8>,
) -> io::Result<usize> {
    for_each_datagram(train, frame_id, scratch, |datagram| {
        socket.send_to(datagram, target)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_sizes() {
        let generator = TrainGenerator::new(2, vec![0, 1]);
        let datagrams = generator.datagrams(3, 9);
        assert_eq!(datagrams.len(), generator.format().num_packets());
        let (last, full) = datagrams.split_last().unwrap();
        assert!(full.iter().all(|d| d.len() == PACKET_SIZE));
        assert!(last.len() < PACKET_SIZE);

        let first = DatagramTrailer::read(&datagrams[0]);
        assert!(first.is_sof());
        assert_eq!(first.frame_id, 9);
        let end = DatagramTrailer::read(last);
        assert!(end.is_eof());
        assert_eq!(end.packet_id as usize, datagrams.len() - 1);

        let payload: usize = datagrams.iter().map(|d| d.len() - PACKET_TRAILER_SIZE).sum();
        assert_eq!(payload, generator.format().total_bytes());
    }

    #[test]
    fn test_exact_multiple_is_closed_by_empty_datagram() {
        let train = vec![1u8; 2 * PACKET_PAYLOAD_SIZE];
        let mut sizes = Vec::new();
        let mut scratch = Vec::new();
        let count = for_each_datagram(&train, 0, &mut scratch, |d| {
            sizes.push(d.len());
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(sizes, vec![PACKET_SIZE, PACKET_SIZE, PACKET_TRAILER_SIZE]);
    }

    #[test]
    fn test_absent_asics_are_zero() {
        let generator = TrainGenerator::new(1, vec![4]);
        let train = generator.train_bytes(1);
        let image = pixel_map().image_pixel(5, 0);
        let byte = TRAIN_HEADER_BYTES + image * 2;
        assert_eq!(LittleEndian::read_u16(&train[byte..]), 0);
        let image = pixel_map().image_pixel(4, 0);
        let byte = TRAIN_HEADER_BYTES + image * 2;
        assert_eq!(
            LittleEndian::read_u16(&train[byte..]),
            generator.sample_value(1, 0, 4, 0)
        );
    }
}
