// Detector geometry
pub const NUM_ASICS: usize = 16;
pub const NUM_ASIC_ROWS: usize = 2;
pub const NUM_ASIC_COLS: usize = 8;
pub const ASIC_SIDE: usize = 64; // ASICs are 64x64 pixels
pub const NUM_ASIC_PIXELS: usize = ASIC_SIDE * ASIC_SIDE;
pub const NUM_PIXELS: usize = NUM_ASICS * NUM_ASIC_PIXELS;
pub const IMAGE_WIDTH: usize = NUM_ASIC_COLS * ASIC_SIDE;
/// Number of SRAM cells per pixel, the maximum depth of a train
pub const MAX_SRAM_DEPTH: usize = 800;
pub const ALL_ASICS_MASK: u16 = 0xFFFF;

// Wire protocol
pub const PACKET_SIZE: usize = 8192;
pub const PACKET_TRAILER_SIZE: usize = 8;
pub const PACKET_PAYLOAD_SIZE: usize = PACKET_SIZE - PACKET_TRAILER_SIZE;
/// Room given to every receive, one byte more than a datagram so oversized ones show
pub const RECV_WINDOW: usize = PACKET_SIZE + 1;
pub const PACKET_SOF_FLAG: u8 = 0x80;
pub const PACKET_EOF_FLAG: u8 = 0x40;
pub const MAGIC_HEADER: u64 = 0x58544446BEEFFACE;
pub const MAGIC_TRAILER: u64 = 0x58544446DEADABCD;

// Train sections in bytes
pub const TRAIN_HEADER_BYTES: usize = 64;
pub const TRAIN_HEADER_WORDS: usize = TRAIN_HEADER_BYTES / 2;
pub const TRAIN_TRAILER_BYTES: usize = 32;
pub const ASIC_TRAILER_BYTES: usize = 16;
pub const ASIC_TRAILER_BLOCK_BYTES: usize = NUM_ASICS * ASIC_TRAILER_BYTES;
pub const PPT_SPECIFIC_BYTES: usize = 16;
pub const SIB_SPECIFIC_BYTES: usize = 144;
pub const SPECIFIC_BYTES: usize = PPT_SPECIFIC_BYTES + SIB_SPECIFIC_BYTES;
pub const DESCRIPTOR_ALIGN: usize = 32;

// Header field offsets in bytes
pub const HEADER_MAGIC_OFFSET: usize = 0;
pub const HEADER_MAJOR_VERSION_OFFSET: usize = 8;
pub const HEADER_MINOR_VERSION_OFFSET: usize = 12;
pub const HEADER_TRAIN_ID_OFFSET: usize = 16;
pub const HEADER_DATA_ID_OFFSET: usize = 24;
pub const HEADER_DET_LINK_ID_OFFSET: usize = 32;
pub const HEADER_TB_LINK_ID_OFFSET: usize = 36;
pub const HEADER_PULSE_COUNT_OFFSET: usize = 40;
pub const HEADER_DET_SPECIFIC_LENGTH_OFFSET: usize = 48;
pub const HEADER_TB_SPECIFIC_LENGTH_OFFSET: usize = 52;

// Sample conversion
pub const GCC_WRAP_THRESHOLD: u16 = 4;
pub const GCC_WRAP_OFFSET: u16 = 256;
pub const MAX_ADC_VALUE: u16 = 511;

// Test patterns found in the ASIC trailers
pub const DR_DUMMY_DATA_TESTPATTERN: u16 = 0x1;
pub const IOB_DUMMY_DATA_TESTPATTERN: u16 = 0x2;
pub const DEFAULT_EXPECTED_TESTPATTERN: u16 = 5;

/// Train id of a buffer that holds no data
pub const INVALID_TRAIN_ID: u64 = u64::MAX;

// Network defaults
pub const DEFAULT_UDP_PORT: u16 = 8000;
pub const UDP_PORT_SEARCH_RANGE: u16 = 100;
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 300;
pub const DEFAULT_SOCKET_RECV_BUFFER: usize = 110_000_000;
pub const MAX_SORT_THREADS: usize = 8;
