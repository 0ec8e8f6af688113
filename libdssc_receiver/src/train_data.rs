use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::error::TrainFormatError;

/// Convert a 9 bit gray counter code to binary.
///
/// The two most significant bits are sent in plain binary, the lower seven in gray code.
pub fn convert_gcc(gray: u16) -> u16 {
    let mut result = gray & 256;
    result |= gray & 128;
    for bit in [64, 32, 16, 8, 4, 2, 1] {
        result |= (gray ^ (result >> 1)) & bit;
    }
    result
}

/// Inverse of [convert_gcc]
pub fn to_gcc(binary: u16) -> u16 {
    (binary & 0x180) | ((binary ^ (binary >> 1)) & 0x7F)
}

/// The 64 byte header at the start of every train
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainHeader {
    pub magic: u64,
    pub major_version: u32,
    pub minor_version: u32,
    pub train_id: u64,
    pub data_id: u64,
    pub det_link_id: u32,
    pub tb_link_id: u32,
    pub pulse_count: u64,
    pub det_specific_length: u32,
    pub tb_specific_length: u32,
}

impl TrainHeader {
    /// Parse the header at the start of `bytes`, checking the magic number
    pub fn read(bytes: &[u8]) -> Result<Self, TrainFormatError> {
        if bytes.len() < TRAIN_HEADER_BYTES {
            return Err(TrainFormatError::Truncated {
                needed: TRAIN_HEADER_BYTES,
                available: bytes.len(),
            });
        }
        let magic = LittleEndian::read_u64(&bytes[HEADER_MAGIC_OFFSET..]);
        if magic != MAGIC_HEADER {
            return Err(TrainFormatError::BadMagicHeader(magic));
        }
        Ok(Self {
            magic,
            major_version: LittleEndian::read_u32(&bytes[HEADER_MAJOR_VERSION_OFFSET..]),
            minor_version: LittleEndian::read_u32(&bytes[HEADER_MINOR_VERSION_OFFSET..]),
            train_id: LittleEndian::read_u64(&bytes[HEADER_TRAIN_ID_OFFSET..]),
            data_id: LittleEndian::read_u64(&bytes[HEADER_DATA_ID_OFFSET..]),
            det_link_id: LittleEndian::read_u32(&bytes[HEADER_DET_LINK_ID_OFFSET..]),
            tb_link_id: LittleEndian::read_u32(&bytes[HEADER_TB_LINK_ID_OFFSET..]),
            pulse_count: LittleEndian::read_u64(&bytes[HEADER_PULSE_COUNT_OFFSET..]),
            det_specific_length: LittleEndian::read_u32(
                &bytes[HEADER_DET_SPECIFIC_LENGTH_OFFSET..],
            ),
            tb_specific_length: LittleEndian::read_u32(&bytes[HEADER_TB_SPECIFIC_LENGTH_OFFSET..]),
        })
    }

    /// Serialize into the first 64 bytes of `bytes`. Unused header bytes are zeroed.
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..TRAIN_HEADER_BYTES].fill(0);
        LittleEndian::write_u64(&mut bytes[HEADER_MAGIC_OFFSET..], self.magic);
        LittleEndian::write_u32(&mut bytes[HEADER_MAJOR_VERSION_OFFSET..], self.major_version);
        LittleEndian::write_u32(&mut bytes[HEADER_MINOR_VERSION_OFFSET..], self.minor_version);
        LittleEndian::write_u64(&mut bytes[HEADER_TRAIN_ID_OFFSET..], self.train_id);
        LittleEndian::write_u64(&mut bytes[HEADER_DATA_ID_OFFSET..], self.data_id);
        LittleEndian::write_u32(&mut bytes[HEADER_DET_LINK_ID_OFFSET..], self.det_link_id);
        LittleEndian::write_u32(&mut bytes[HEADER_TB_LINK_ID_OFFSET..], self.tb_link_id);
        LittleEndian::write_u64(&mut bytes[HEADER_PULSE_COUNT_OFFSET..], self.pulse_count);
        LittleEndian::write_u32(
            &mut bytes[HEADER_DET_SPECIFIC_LENGTH_OFFSET..],
            self.det_specific_length,
        );
        LittleEndian::write_u32(
            &mut bytes[HEADER_TB_SPECIFIC_LENGTH_OFFSET..],
            self.tb_specific_length,
        );
    }
}

/// Peek at the train id of a datagram which might start a train. Returns None if the
/// datagram does not carry the magic header.
pub fn peek_train_start(bytes: &[u8]) -> Option<u64> {
    if bytes.len() < HEADER_TRAIN_ID_OFFSET + 8 {
        return None;
    }
    if LittleEndian::read_u64(&bytes[HEADER_MAGIC_OFFSET..]) != MAGIC_HEADER {
        return None;
    }
    Some(LittleEndian::read_u64(&bytes[HEADER_TRAIN_ID_OFFSET..]))
}

/// The 32 byte trailer closing every train
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainTrailer {
    pub checksum0: u64,
    pub checksum1: u64,
    pub status: u64,
    pub magic: u64,
}

impl TrainTrailer {
    pub fn read(bytes: &[u8]) -> Self {
        Self {
            checksum0: LittleEndian::read_u64(&bytes[0..]),
            checksum1: LittleEndian::read_u64(&bytes[8..]),
            status: LittleEndian::read_u64(&bytes[16..]),
            magic: LittleEndian::read_u64(&bytes[24..]),
        }
    }

    pub fn write(&self, bytes: &mut [u8]) {
        LittleEndian::write_u64(&mut bytes[0..], self.checksum0);
        LittleEndian::write_u64(&mut bytes[8..], self.checksum1);
        LittleEndian::write_u64(&mut bytes[16..], self.status);
        LittleEndian::write_u64(&mut bytes[24..], self.magic);
    }

    pub fn magic_ok(&self) -> bool {
        self.magic == MAGIC_TRAILER
    }
}

/// Data flags set by the IOB firmware, sent in the upper byte of PPT word 5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataFlags {
    pub sort_asic_wise: bool,
    pub rotate_ladder: bool,
    pub send_dummy_dr_data: bool,
    pub send_raw_data: bool,
    pub send_conv_data: bool,
    pub send_reord_data: bool,
    pub single_ddr3_block: bool,
    pub clone_eth0_to_eth1: bool,
}

impl DataFlags {
    pub fn from_bits(bits: u8) -> Self {
        let bit = |n: u8| bits & (1 << n) != 0;
        Self {
            sort_asic_wise: bit(0),
            rotate_ladder: bit(1),
            send_dummy_dr_data: bit(2),
            send_raw_data: bit(3),
            send_conv_data: bit(4),
            send_reord_data: bit(5),
            single_ddr3_block: bit(6),
            clone_eth0_to_eth1: bit(7),
        }
    }

    pub fn bits(&self) -> u8 {
        [
            self.sort_asic_wise,
            self.rotate_ladder,
            self.send_dummy_dr_data,
            self.send_raw_data,
            self.send_conv_data,
            self.send_reord_data,
            self.single_ddr3_block,
            self.clone_eth0_to_eth1,
        ]
        .iter()
        .enumerate()
        .fold(0u8, |acc, (n, set)| acc | ((*set as u8) << n))
    }
}

/// Decoded PPT part of the device specific block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpecificData {
    pub ppt_veto_count: u16,
    pub num_pre_burst_vetos: u16,
    pub user_specific: [u16; 3],
    pub module_nr: u8,
    pub iob_serial: u32,
    pub flags: DataFlags,
}

impl SpecificData {
    pub const PPT_WORDS: usize = PPT_SPECIFIC_BYTES / 2;

    /// Decode from the 16 PPT bytes at the start of the device specific block
    pub fn read(bytes: &[u8]) -> Self {
        let mut words = [0u16; Self::PPT_WORDS];
        LittleEndian::read_u16_into(&bytes[..PPT_SPECIFIC_BYTES], &mut words);
        Self {
            ppt_veto_count: words[0],
            num_pre_burst_vetos: words[1],
            user_specific: [words[2], words[3], words[4]],
            module_nr: (words[5] & 0xF) as u8,
            iob_serial: ((words[7] as u32) << 16) + words[6] as u32,
            flags: DataFlags::from_bits((words[5] >> 8) as u8),
        }
    }

    pub fn write(&self, bytes: &mut [u8]) {
        let words: [u16; Self::PPT_WORDS] = [
            self.ppt_veto_count,
            self.num_pre_burst_vetos,
            self.user_specific[0],
            self.user_specific[1],
            self.user_specific[2],
            ((self.flags.bits() as u16) << 8) | (self.module_nr as u16 & 0xF),
            (self.iob_serial & 0xFFFF) as u16,
            (self.iob_serial >> 16) as u16,
        ];
        LittleEndian::write_u16_into(&words, &mut bytes[..PPT_SPECIFIC_BYTES]);
    }
}

/// One 16 byte ASIC trailer, temperatures already converted from gray code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsicTrailer {
    pub temp0: u16,
    pub temp1: u16,
    pub veto_count: u32,
    /// Readout XOR diagnostic, 21 significant bits
    pub ro_xor: u32,
    pub test_pattern: u16,
}

impl AsicTrailer {
    const RO_XOR_MASK: u32 = (1 << 21) - 1;

    pub fn read(bytes: &[u8]) -> Self {
        Self {
            temp0: convert_gcc(LittleEndian::read_u16(&bytes[0..])),
            temp1: convert_gcc(LittleEndian::read_u16(&bytes[2..])),
            veto_count: LittleEndian::read_u32(&bytes[4..]),
            ro_xor: LittleEndian::read_u32(&bytes[8..]) & Self::RO_XOR_MASK,
            test_pattern: LittleEndian::read_u16(&bytes[14..]),
        }
    }

    pub fn write(&self, bytes: &mut [u8]) {
        LittleEndian::write_u16(&mut bytes[0..], to_gcc(self.temp0));
        LittleEndian::write_u16(&mut bytes[2..], to_gcc(self.temp1));
        LittleEndian::write_u32(&mut bytes[4..], self.veto_count);
        LittleEndian::write_u32(&mut bytes[8..], self.ro_xor & Self::RO_XOR_MASK);
        bytes[12..14].fill(0);
        LittleEndian::write_u16(&mut bytes[14..], self.test_pattern);
    }

    /// Decode all 16 trailers of the ASIC trailer block
    pub fn read_block(bytes: &[u8]) -> [Self; NUM_ASICS] {
        let mut trailers = [Self::default(); NUM_ASICS];
        for (trailer, chunk) in trailers
            .iter_mut()
            .zip(bytes.chunks_exact(ASIC_TRAILER_BYTES))
        {
            *trailer = Self::read(chunk);
        }
        trailers
    }
}
