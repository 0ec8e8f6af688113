use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::train_data::peek_train_start;

/// The 8 byte trailer at the end of every datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatagramTrailer {
    pub frame_id: u32,
    pub packet_id: u16,
    /// Start/end of frame flags. Informational only, sequencing relies on the packet id.
    pub flags: u8,
}

impl DatagramTrailer {
    /// Read the trailer of a complete datagram
    pub fn read(datagram: &[u8]) -> Self {
        let trailer = &datagram[datagram.len() - PACKET_TRAILER_SIZE..];
        Self {
            frame_id: LittleEndian::read_u32(&trailer[0..]),
            packet_id: LittleEndian::read_u16(&trailer[4..]),
            flags: trailer[7],
        }
    }

    /// Write the trailer into the last 8 bytes of `datagram`
    pub fn write(&self, datagram: &mut [u8]) {
        let start = datagram.len() - PACKET_TRAILER_SIZE;
        let trailer = &mut datagram[start..];
        LittleEndian::write_u32(&mut trailer[0..], self.frame_id);
        LittleEndian::write_u16(&mut trailer[4..], self.packet_id);
        trailer[6] = 0;
        trailer[7] = self.flags;
    }

    pub fn is_sof(&self) -> bool {
        self.flags & PACKET_SOF_FLAG != 0
    }

    pub fn is_eof(&self) -> bool {
        self.flags & PACKET_EOF_FLAG != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssemblyState {
    /// Waiting for the first datagram of a train
    #[default]
    AwaitingSof,
    Receiving { frame_id: u32, next_packet: u16 },
}

/// Outcome of feeding one datagram to the [FrameAssembler]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Not part of a train and not a start of train
    Ignored,
    /// A start of train older than the watermark
    BelowWatermark(u64),
    /// A new train was started
    Started,
    Continued,
    /// The train is complete and occupies the first `bytes` bytes of the buffer
    Complete { bytes: usize },
    /// The train in progress was dropped. If the offending datagram was itself a start of
    /// train it has been moved to the front of the buffer and a new train is in progress.
    /// `lost_packets` is the size of the sequence gap, 0 if nothing went missing.
    Discarded { restarted: bool, lost_packets: u64 },
}

/// FrameAssembler is the per-train datagram state machine.
///
/// Datagrams are received directly into the train buffer at [FrameAssembler::offset].
/// Each datagram adds its payload (everything but the 8 byte trailer) to the train, so the
/// offset advances by `len - 8` and the trailer of one datagram is overwritten by the next
/// one. A datagram shorter than [PACKET_SIZE] completes the train.
///
/// The assembler never allocates and performs no IO. It only looks at the bytes of the
/// buffer it is handed, which keeps it testable with synthetic datagram vectors.
#[derive(Debug, Clone, Default)]
pub struct FrameAssembler {
    state: AssemblyState,
    offset: usize,
    watermark: u64,
}

impl FrameAssembler {
    pub fn new(watermark: u64) -> Self {
        Self {
            state: AssemblyState::AwaitingSof,
            offset: 0,
            watermark,
        }
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    /// Where the next datagram must be received
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Trains with an id below the watermark are never started
    pub fn set_watermark(&mut self, watermark: u64) {
        self.watermark = watermark;
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.state, AssemblyState::Receiving { .. })
    }

    /// Drop any train in progress. Returns true if a train was in progress.
    pub fn abandon(&mut self) -> bool {
        let was_receiving = self.is_receiving();
        self.state = AssemblyState::AwaitingSof;
        self.offset = 0;
        was_receiving
    }

    /// Process the datagram of `len` bytes which was just received into
    /// `buffer[self.offset()..]`.
    pub fn accept(&mut self, buffer: &mut [u8], len: usize) -> Progress {
        if len < PACKET_TRAILER_SIZE || self.offset + len > buffer.len() {
            return self.discard();
        }
        let datagram = &buffer[self.offset..self.offset + len];
        let trailer = DatagramTrailer::read(datagram);

        match self.state {
            AssemblyState::AwaitingSof => self.try_start(buffer, len, trailer),
            AssemblyState::Receiving {
                frame_id,
                next_packet,
            } => {
                if trailer.frame_id != frame_id || trailer.packet_id != next_packet {
                    log::trace!(
                        "Sequence break in frame {frame_id}: expected packet {next_packet}, got frame {} packet {}",
                        trailer.frame_id,
                        trailer.packet_id
                    );
                    let lost_packets = if trailer.frame_id == frame_id
                        && trailer.packet_id > next_packet
                    {
                        u64::from(trailer.packet_id - next_packet)
                    } else {
                        1
                    };
                    return self.restart_from(buffer, len, trailer, lost_packets);
                }
                self.offset += len - PACKET_TRAILER_SIZE;
                if len < PACKET_SIZE {
                    return self.complete();
                }
                if self.offset + RECV_WINDOW > buffer.len() {
                    // train does not fit the buffer
                    return self.discard();
                }
                self.state = AssemblyState::Receiving {
                    frame_id,
                    next_packet: next_packet.wrapping_add(1),
                };
                Progress::Continued
            }
        }
    }

    fn try_start(&mut self, buffer: &[u8], len: usize, trailer: DatagramTrailer) -> Progress {
        debug_assert_eq!(self.offset, 0);
        if trailer.packet_id != 0 {
            return Progress::Ignored;
        }
        match peek_train_start(&buffer[..len]) {
            None => Progress::Ignored,
            Some(train_id) if train_id < self.watermark => Progress::BelowWatermark(train_id),
            Some(_) => {
                self.offset = len - PACKET_TRAILER_SIZE;
                if len < PACKET_SIZE {
                    return self.complete();
                }
                self.state = AssemblyState::Receiving {
                    frame_id: trailer.frame_id,
                    next_packet: 1,
                };
                Progress::Started
            }
        }
    }

    /// A sequence break discards the train. A break caused by the start of the next train
    /// immediately begins assembling that train.
    fn restart_from(
        &mut self,
        buffer: &mut [u8],
        len: usize,
        trailer: DatagramTrailer,
        lost_packets: u64,
    ) -> Progress {
        let start = self.offset;
        self.state = AssemblyState::AwaitingSof;
        self.offset = 0;
        let restarted = if trailer.packet_id == 0
            && peek_train_start(&buffer[start..start + len]).is_some()
        {
            buffer.copy_within(start..start + len, 0);
            self.try_start(buffer, len, trailer) == Progress::Started
        } else {
            false
        };
        Progress::Discarded {
            restarted,
            lost_packets,
        }
    }

    fn complete(&mut self) -> Progress {
        let bytes = self.offset;
        self.state = AssemblyState::AwaitingSof;
        self.offset = 0;
        Progress::Complete { bytes }
    }

    fn discard(&mut self) -> Progress {
        if self.abandon() {
            Progress::Discarded {
                restarted: false,
                lost_packets: 0,
            }
        } else {
            Progress::Ignored
        }
    }
}
