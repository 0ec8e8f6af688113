use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rayon::ThreadPool;
use socket2::{Domain, Protocol, Socket, Type};

use super::config::Config;
use super::constants::*;
use super::correction::SramCorrection;
use super::datagram::{FrameAssembler, Progress};
use super::error::ReceiverError;
use super::reshuffle::sort_to_pixel_wise;
use super::status::Counters;
use super::stop::StopSignal;
use super::train_buffer::TrainBuffer;

/// Anything datagrams can be received from
pub trait DatagramSource: Send {
    /// Receive one datagram into `buf`. Returns `Ok(None)` if nothing arrived within the
    /// source's timeout.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

/// UDP socket bound to the first free port at or above the configured one
#[derive(Debug)]
pub struct UdpSource {
    socket: UdpSocket,
}

impl UdpSource {
    pub fn bind(config: &Config) -> Result<Self, ReceiverError> {
        let first = config.udp_port;
        let ports = if first == 0 {
            0..1
        } else {
            first..first.saturating_add(UDP_PORT_SEARCH_RANGE)
        };
        for port in ports.clone() {
            match Self::bind_port(port, config) {
                Ok(socket) => {
                    let source = Self { socket };
                    log::info!("Receiver bound to UDP port {}", source.port()?);
                    return Ok(source);
                }
                Err(e) => log::debug!("Could not bind UDP port {port}: {e}"),
            }
        }
        Err(ReceiverError::NoFreePort(ports.start, ports.end))
    }

    fn bind_port(port: u16, config: &Config) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_recv_buffer_size(config.socket_recv_buffer) {
            log::warn!(
                "Could not set socket receive buffer to {}: {e}",
                human_bytes::human_bytes(config.socket_recv_buffer as f64)
            );
        }
        let address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&address.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(config.socket_timeout()))?;
        Ok(socket)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.local_addr()?.port())
    }
}

impl DatagramSource for UdpSource {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(len) => Ok(Some(len)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Datagrams held in memory. An empty source behaves like a socket timeout.
#[derive(Debug, Default)]
pub struct MemorySource {
    datagrams: VecDeque<Vec<u8>>,
    idle: Duration,
}

impl MemorySource {
    pub fn new<I: IntoIterator<Item = Vec<u8>>>(datagrams: I) -> Self {
        Self {
            datagrams: datagrams.into_iter().collect(),
            idle: Duration::ZERO,
        }
    }

    /// Sleep for `idle` before reporting a timeout, like a socket would
    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    pub fn push(&mut self, datagram: Vec<u8>) {
        self.datagrams.push_back(datagram);
    }
}

impl DatagramSource for MemorySource {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.datagrams.pop_front() {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(Some(len))
            }
            None => {
                if !self.idle.is_zero() {
                    std::thread::sleep(self.idle);
                }
                Ok(None)
            }
        }
    }
}

/// Outcome of one receive cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// A valid train is in the buffer
    Ok,
    /// No train completed within the socket timeout; the buffer is invalid
    Timeout,
    /// A valid train is in the buffer but its ASIC trailer reports an unexpected test
    /// pattern
    TestPattern(u16),
}

/// Receiver assembles trains from a [DatagramSource].
///
/// Each call to [Receiver::receive_train] runs the datagram state machine until one
/// train is complete or the source times out. Sequence breaks, truncated trains and
/// trains below the watermark are dropped and counted, never returned as errors.
pub struct Receiver {
    source: Box<dyn DatagramSource>,
    assembler: FrameAssembler,
    watermark: Arc<AtomicU64>,
    counters: Arc<Counters>,
    asics: Vec<usize>,
    expected_test_pattern: u16,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("assembler", &self.assembler)
            .field("asics", &self.asics)
            .finish()
    }
}

impl Receiver {
    pub fn new(config: &Config, source: Box<dyn DatagramSource>, counters: Arc<Counters>) -> Self {
        Self {
            source,
            assembler: FrameAssembler::new(0),
            watermark: Arc::new(AtomicU64::new(0)),
            counters,
            asics: config.sending_asics(),
            expected_test_pattern: config.expected_test_pattern,
        }
    }

    /// Create a Receiver listening on UDP
    pub fn bind(config: &Config, counters: Arc<Counters>) -> Result<Self, ReceiverError> {
        let source = UdpSource::bind(config)?;
        Ok(Self::new(config, Box::new(source), counters))
    }

    /// Shared watermark; trains with a smaller id are ignored
    pub fn watermark_handle(&self) -> Arc<AtomicU64> {
        self.watermark.clone()
    }

    /// Follow a watermark owned by someone else
    pub fn share_watermark(&mut self, watermark: Arc<AtomicU64>) {
        self.watermark = watermark;
    }

    pub fn set_watermark(&self, train_id: u64) {
        self.watermark.store(train_id, Ordering::Relaxed);
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Receive datagrams into `buffer` until a train completes or the source times out.
    ///
    /// Returns early with [RecvStatus::Timeout] when `stop` is raised.
    pub fn receive_train(
        &mut self,
        buffer: &mut TrainBuffer,
        stop: &StopSignal,
    ) -> Result<RecvStatus, ReceiverError> {
        if buffer.capacity_bytes() < RECV_WINDOW {
            return Err(ReceiverError::BufferTooSmall(buffer.capacity_bytes()));
        }
        buffer.invalidate();
        self.assembler.abandon();
        loop {
            if !self.assembler.is_receiving() {
                if stop.is_stopped() {
                    return Ok(RecvStatus::Timeout);
                }
                self.assembler
                    .set_watermark(self.watermark.load(Ordering::Relaxed));
            }

            let bytes = buffer.as_bytes_mut();
            let offset = self.assembler.offset();
            let end = (offset + RECV_WINDOW).min(bytes.len());
            let len = match self.source.recv(&mut bytes[offset..end])? {
                Some(len) => len,
                None => {
                    Counters::incr(&self.counters.timeouts);
                    if self.assembler.abandon() {
                        Counters::incr(&self.counters.discarded_trains);
                        log::warn!("Socket timeout while receiving a train, train discarded");
                    }
                    return Ok(RecvStatus::Timeout);
                }
            };

            if len > PACKET_SIZE {
                Counters::incr(&self.counters.oversized_datagrams);
                if self.assembler.abandon() {
                    Counters::incr(&self.counters.discarded_trains);
                }
                log::warn!("Dropped a datagram longer than {PACKET_SIZE} bytes");
                continue;
            }

            match self.assembler.accept(bytes, len) {
                Progress::Ignored | Progress::Started | Progress::Continued => (),
                Progress::BelowWatermark(train_id) => {
                    Counters::incr(&self.counters.below_watermark);
                    log::trace!("Ignoring train {train_id} below the watermark");
                }
                Progress::Discarded {
                    restarted,
                    lost_packets,
                } => {
                    Counters::incr(&self.counters.discarded_trains);
                    Counters::add(&self.counters.lost_packets, lost_packets);
                    log::warn!("Lost packets, train discarded (next train started: {restarted})");
                }
                Progress::Complete { bytes } => match buffer.parse(bytes, &self.asics) {
                    Ok(()) => return Ok(self.finish_train(buffer)),
                    Err(e) => {
                        Counters::incr(&self.counters.discarded_trains);
                        log::warn!("Discarding received train: {e}");
                    }
                },
            }
        }
    }

    fn finish_train(&self, buffer: &TrainBuffer) -> RecvStatus {
        Counters::incr(&self.counters.received_trains);
        self.counters
            .last_train_id
            .store(buffer.train_id(), Ordering::Relaxed);
        match buffer.test_pattern() {
            Some(pattern)
                if pattern != self.expected_test_pattern
                    && pattern != DR_DUMMY_DATA_TESTPATTERN
                    && pattern != IOB_DUMMY_DATA_TESTPATTERN =>
            {
                Counters::incr(&self.counters.test_pattern_mismatches);
                log::debug!(
                    "Train {} reports test pattern {pattern}, expected {}",
                    buffer.train_id(),
                    self.expected_test_pattern
                );
                RecvStatus::TestPattern(pattern)
            }
            _ => RecvStatus::Ok,
        }
    }

    /// Receive one train and sort it to pixel-wise layout on the calling thread
    pub fn receive_and_sort(
        &mut self,
        unsorted: &mut TrainBuffer,
        sorted: &mut TrainBuffer,
        correction: Option<&SramCorrection>,
        pool: &ThreadPool,
        stop: &StopSignal,
    ) -> Result<RecvStatus, ReceiverError> {
        let status = self.receive_train(unsorted, stop)?;
        if status == RecvStatus::Timeout {
            sorted.invalidate();
            return Ok(status);
        }
        sort_to_pixel_wise(unsorted, sorted, correction, pool)?;
        Counters::incr(&self.counters.sorted_trains);
        Ok(status)
    }
}
