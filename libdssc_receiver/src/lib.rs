//! # dssc_receiver
//!
//! dssc_receiver receives the data trains of a DSSC detector module, written in Rust. A
//! train is streamed by the module's readout board over UDP as a sequence of jumbo
//! datagrams. dssc_receiver assembles the datagrams into complete trains, reshuffles the
//! frame-ordered samples into pixel-ordered samples (optionally applying an SRAM
//! correction) and hands the sorted trains to consumers through a small, blocking API.
//!
//! ## Building & Install
//!
//! To build and install the CLI use `cargo install --path ./dssc_receiver_cli` from the
//! top level repository. The library is used by depending on `libdssc_receiver`.
//!
//! ## Overview
//!
//! - [receiver::Receiver] runs the datagram state machine of [datagram::FrameAssembler]
//! over a [receiver::DatagramSource] (a UDP socket in production, memory in tests).
//! Lost datagrams discard the train in flight; these events are counted, never raised.
//! - [buffer_pool::BufferPool] hands a fixed set of [train_buffer::TrainBuffer]s between
//! threads as move-only [buffer_pool::TrainHandle]s.
//! - [sorter::Sorter] owns the receive and sort threads and two pools, and is the
//! consumer API: `start`, `get_next`, `release`, `set_watermark`, `dismiss_below`,
//! `stop`, and `read_from_directory` to replay train files instead of receiving.
//!
//! ## Configuration
//!
//! The YAML format of a configuration file is as follows:
//!
//! ```yml
//! udp_port: 8000
//! socket_timeout_ms: 300
//! socket_recv_buffer: 110000000
//! unsorted_pool_size: 10
//! sorted_pool_size: 3
//! asic_mask: 65535
//! sram_depth: 800
//! drop_oldest: true
//! sort_threads: 0
//! check_dummy_data: false
//! expected_test_pattern: 5
//! max_files: 0
//! ```
//!
//! - `udp_port`: first port tried; taken ports are skipped. 0 lets the OS pick a port.
//! - `asic_mask`: bit n enables ASIC n. With more than one ASIC the module runs in
//! ladder mode.
//! - `sram_depth`: maximum number of frames per train the buffers are sized for.
//! - `drop_oldest`: when consumers fall behind, drop the oldest sorted train instead of
//! stalling the receiver.
//! - `sort_threads`: 0 picks a count from the available cores.
//!
//! ## Train Layouts
//!
//! Received trains are image-wise (`frame * 65536 + image pixel`), or ASIC-wise when the
//! module sorts by ASIC. Sorted trains are pixel-wise: the samples of one pixel are
//! contiguous, and only the enabled ASICs are stored, in ascending order.
pub mod blocking_queue;
pub mod buffer_pool;
pub mod config;
pub mod constants;
pub mod correction;
pub mod datagram;
pub mod dummy_check;
pub mod error;
pub mod file_source;
pub mod generator;
pub mod pixel_map;
pub mod receiver;
pub mod reshuffle;
pub mod sorter;
pub mod status;
pub mod stop;
pub mod train_buffer;
pub mod train_data;
pub mod train_file;
pub mod train_format;
