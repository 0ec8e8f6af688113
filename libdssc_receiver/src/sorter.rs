use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::ThreadPool;

use super::blocking_queue::Pop;
use super::buffer_pool::{BufferPool, PoolPolicy, TrainHandle};
use super::config::Config;
use super::constants::DR_DUMMY_DATA_TESTPATTERN;
use super::correction::SramCorrection;
use super::dummy_check::{count_out_of_range, CheckResult, DummyDataCheck};
use super::error::SorterError;
use super::file_source::{read_train_files, TrainFileStack};
use super::receiver::{DatagramSource, Receiver, RecvStatus};
use super::reshuffle::{build_sort_pool, sort_to_pixel_wise};
use super::status::{Counters, SorterStatus};
use super::stop::StopSignal;

/// Result of asking the Sorter for the next train
#[derive(Debug)]
pub enum NextTrain {
    /// A pixel-wise train. Hand it back with [Sorter::release] when done.
    Train(TrainHandle),
    Timeout,
    /// The Sorter is stopped, or its source ran dry and every sorted train was taken
    Ended,
}

impl NextTrain {
    pub fn into_train(self) -> Option<TrainHandle> {
        match self {
            Self::Train(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Threads owned by a running Sorter
#[derive(Default)]
struct Workers {
    producer: Option<JoinHandle<Result<Option<Receiver>, SorterError>>>,
    sorter: Option<JoinHandle<Result<(), SorterError>>>,
    /// Kept between runs so a restart reuses the bound port
    receiver: Option<Receiver>,
}

impl Workers {
    fn join(&mut self) -> Result<(), SorterError> {
        let mut result = Ok(());
        if let Some(producer) = self.producer.take() {
            match producer.join() {
                Ok(Ok(receiver)) => self.receiver = receiver,
                Ok(Err(e)) => result = Err(e),
                Err(_) => result = Err(SorterError::WorkerPanicked),
            }
        }
        if let Some(sorter) = self.sorter.take() {
            match sorter.join() {
                Ok(Ok(())) => (),
                Ok(Err(e)) => result = result.and(Err(e)),
                Err(_) => result = result.and(Err(SorterError::WorkerPanicked)),
            }
        }
        result
    }
}

/// The sort stage: takes received trains, re-applies the watermark, checks them and
/// reshuffles them into the sorted pool
struct SortStage {
    unsorted: Arc<BufferPool>,
    sorted: Arc<BufferPool>,
    counters: Arc<Counters>,
    watermark: Arc<AtomicU64>,
    sort_pool: Arc<ThreadPool>,
    correction: Option<Arc<SramCorrection>>,
    check_dummy_data: bool,
    dummy_check: DummyDataCheck,
    stop: StopSignal,
}

impl SortStage {
    fn run(mut self) -> Result<(), SorterError> {
        let result = self.sort_trains();
        // consumers drain what is left, then see the end
        self.sorted.finish();
        result
    }

    fn sort_trains(&mut self) -> Result<(), SorterError> {
        while let Some(input) = self.unsorted.take_ready() {
            if self.stop.is_stopped() {
                self.unsorted.release(input)?;
                break;
            }
            if input.train_id() < self.watermark.load(Ordering::Relaxed) {
                Counters::incr(&self.counters.dismissed_trains);
                log::trace!("Dropping train {} below the watermark", input.train_id());
                self.unsorted.release(input)?;
                continue;
            }
            self.check(&input);

            let Some(mut output) = self.sorted.take_free() else {
                self.unsorted.release(input)?;
                break;
            };
            let sorted = sort_to_pixel_wise(
                &input,
                &mut output,
                self.correction.as_deref(),
                &self.sort_pool,
            );
            self.unsorted.release(input)?;
            match sorted {
                Ok(()) => {
                    Counters::incr(&self.counters.sorted_trains);
                    self.sorted.publish(output)?;
                }
                Err(e) => {
                    Counters::incr(&self.counters.discarded_trains);
                    log::warn!("Could not sort train: {e}");
                    self.sorted.release(output)?;
                }
            }
        }
        Ok(())
    }

    /// Range and dummy data checks, run on the sort threads
    fn check(&mut self, train: &TrainHandle) {
        let check_dummy =
            self.check_dummy_data && train.test_pattern() == Some(DR_DUMMY_DATA_TESTPATTERN);
        let dummy_check = &mut self.dummy_check;
        let (out_of_range, dummy): (usize, Option<CheckResult>) = self.sort_pool.install(|| {
            (
                count_out_of_range(train),
                check_dummy.then(|| dummy_check.check(train)),
            )
        });
        if out_of_range > 0 {
            Counters::add(&self.counters.out_of_range_samples, out_of_range as u64);
            log::debug!(
                "Train {} has {out_of_range} samples out of the ADC range",
                train.train_id()
            );
        }
        if let Some(result) = dummy {
            Counters::add(&self.counters.dummy_errors, result.errors);
            Counters::add(&self.counters.dummy_words, result.words);
            if result.errors > 0 {
                log::warn!(
                    "Train {} has {} of {} samples differing from the dummy data",
                    train.train_id(),
                    result.errors,
                    result.words
                );
            }
        }
    }
}

/// Receive until stopped, publishing every complete train to `unsorted`
fn receive_trains(
    mut receiver: Receiver,
    unsorted: Arc<BufferPool>,
    stop: StopSignal,
) -> Result<Option<Receiver>, SorterError> {
    while !stop.is_stopped() {
        let Some(mut handle) = unsorted.take_free() else {
            break;
        };
        match receiver.receive_train(&mut handle, &stop) {
            Ok(RecvStatus::Timeout) => unsorted.release(handle)?,
            Ok(_) => unsorted.publish(handle)?,
            Err(e) => {
                log::error!("Receiver failed: {e}");
                unsorted.release(handle)?;
                unsorted.finish();
                return Err(e.into());
            }
        }
    }
    Ok(Some(receiver))
}

/// Sorter runs the receive and sort stages on their own threads and hands pixel-wise
/// trains to consumers.
///
/// Trains travel from the unsorted pool (filled by the Receiver or a directory of train
/// files) through the sort thread into the sorted pool. Consumers take them with
/// [Sorter::get_next] and must hand them back with [Sorter::release]. Every method takes
/// `&self`, so a Sorter can be shared between a control thread and consumers.
pub struct Sorter {
    config: Config,
    unsorted: Arc<BufferPool>,
    sorted: Arc<BufferPool>,
    counters: Arc<Counters>,
    watermark: Arc<AtomicU64>,
    stop: StopSignal,
    running: AtomicBool,
    sort_pool: Arc<ThreadPool>,
    correction: Mutex<Option<Arc<SramCorrection>>>,
    workers: Mutex<Workers>,
}

impl std::fmt::Debug for Sorter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sorter")
            .field("running", &self.is_running())
            .field("unsorted", &self.unsorted)
            .field("sorted", &self.sorted)
            .finish()
    }
}

impl Sorter {
    pub fn new(config: Config) -> Result<Self, SorterError> {
        config.validate()?;
        let unsorted = BufferPool::new(
            "unsorted",
            config.unsorted_pool_size,
            config.sram_depth,
            PoolPolicy::Block,
        )?;
        let sorted_policy = if config.drop_oldest {
            PoolPolicy::DropOldest
        } else {
            PoolPolicy::Block
        };
        let sorted = BufferPool::new(
            "sorted",
            config.sorted_pool_size,
            config.sram_depth,
            sorted_policy,
        )?;
        let sort_threads = config.sort_thread_count();
        let sort_pool = build_sort_pool(sort_threads)?;
        log::info!(
            "Sorter created for ASICs {:?} with depth {} and {sort_threads} sort threads",
            config.sending_asics(),
            config.sram_depth
        );
        Ok(Self {
            config,
            unsorted: Arc::new(unsorted),
            sorted: Arc::new(sorted),
            counters: Arc::new(Counters::new()),
            watermark: Arc::new(AtomicU64::new(0)),
            stop: StopSignal::new(),
            running: AtomicBool::new(false),
            sort_pool: Arc::new(sort_pool),
            correction: Mutex::new(None),
            workers: Mutex::new(Workers::default()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Install or remove the correction table applied while sorting. Only allowed while
    /// stopped.
    pub fn set_correction(&self, correction: Option<SramCorrection>) -> Result<(), SorterError> {
        if self.is_running() {
            return Err(SorterError::AlreadyRunning);
        }
        if let Some(table) = &correction {
            table.check_depth(self.config.sram_depth)?;
        }
        *self.correction.lock() = correction.map(Arc::new);
        Ok(())
    }

    /// Start receiving over UDP. Does nothing if the Sorter already runs.
    pub fn start(&self) -> Result<(), SorterError> {
        let mut workers = self.workers.lock();
        if self.is_running() {
            log::debug!("Sorter already running");
            return Ok(());
        }
        let receiver = match workers.receiver.take() {
            Some(receiver) => receiver,
            None => Receiver::bind(&self.config, self.counters.clone())?,
        };
        self.launch_receiver(&mut workers, receiver)
    }

    /// Start receiving from any datagram source
    pub fn start_with_source(&self, source: Box<dyn DatagramSource>) -> Result<(), SorterError> {
        let mut workers = self.workers.lock();
        if self.is_running() {
            return Err(SorterError::AlreadyRunning);
        }
        let receiver = Receiver::new(&self.config, source, self.counters.clone());
        self.launch_receiver(&mut workers, receiver)
    }

    fn launch_receiver(
        &self,
        workers: &mut Workers,
        mut receiver: Receiver,
    ) -> Result<(), SorterError> {
        receiver.share_watermark(self.watermark.clone());
        self.rearm();
        self.launch_sort_stage(workers)?;
        let unsorted = self.unsorted.clone();
        let stop = self.stop.clone();
        let producer = std::thread::Builder::new()
            .name(String::from("dssc-receive"))
            .spawn(move || receive_trains(receiver, unsorted, stop));
        self.finish_launch(workers, producer)
    }

    /// Sort the train files of a directory instead of receiving. Consumed files are moved
    /// to `path/done`, malformed ones to `path/rejected`. The Sorter ends once no train
    /// files are left.
    pub fn read_from_directory(&self, path: &Path) -> Result<(), SorterError> {
        let mut workers = self.workers.lock();
        if self.is_running() {
            return Err(SorterError::AlreadyRunning);
        }
        let mut stack = TrainFileStack::new(path, self.config.max_files)?;
        self.rearm();
        self.launch_sort_stage(&mut workers)?;
        let unsorted = self.unsorted.clone();
        let counters = self.counters.clone();
        let stop = self.stop.clone();
        let asics = self.config.sending_asics();
        let producer = std::thread::Builder::new()
            .name(String::from("dssc-files"))
            .spawn(move || -> Result<Option<Receiver>, SorterError> {
                let result = read_train_files(&mut stack, &unsorted, &asics, &counters, &stop);
                unsorted.finish();
                let published = result?;
                log::info!("Read {published} trains from {} files", stack.files_taken());
                Ok(None)
            });
        self.finish_launch(&mut workers, producer)
    }

    /// Return waiting buffers to the free queues and re-open both pools. The pools stay
    /// exited from a stop until here, so late consumers still see the end.
    fn rearm(&self) {
        self.stop.rearm();
        self.unsorted.reset();
        self.sorted.reset();
    }

    fn launch_sort_stage(&self, workers: &mut Workers) -> Result<(), SorterError> {
        let stage = SortStage {
            unsorted: self.unsorted.clone(),
            sorted: self.sorted.clone(),
            counters: self.counters.clone(),
            watermark: self.watermark.clone(),
            sort_pool: self.sort_pool.clone(),
            correction: self.correction.lock().clone(),
            check_dummy_data: self.config.check_dummy_data,
            dummy_check: DummyDataCheck::new(),
            stop: self.stop.clone(),
        };
        let sorter = std::thread::Builder::new()
            .name(String::from("dssc-sort"))
            .spawn(move || stage.run())?;
        workers.sorter = Some(sorter);
        Ok(())
    }

    fn finish_launch(
        &self,
        workers: &mut Workers,
        producer: std::io::Result<JoinHandle<Result<Option<Receiver>, SorterError>>>,
    ) -> Result<(), SorterError> {
        match producer {
            Ok(producer) => {
                workers.producer = Some(producer);
                self.running.store(true, Ordering::Release);
                log::info!("Sorter started");
                Ok(())
            }
            Err(e) => {
                self.shut_down(workers)?;
                Err(e.into())
            }
        }
    }

    /// Stop every worker. Blocked consumers wake with [NextTrain::Ended], and so does every
    /// later [Sorter::get_next] until the next start. Waiting trains return to the free
    /// queues on that start. Calling stop on a stopped Sorter does nothing.
    pub fn stop(&self) -> Result<(), SorterError> {
        let mut workers = self.workers.lock();
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.shut_down(&mut workers);
        log::info!("Sorter stopped: {}", self.status().summary());
        result
    }

    fn shut_down(&self, workers: &mut Workers) -> Result<(), SorterError> {
        self.running.store(false, Ordering::Release);
        self.stop.stop();
        self.unsorted.exit();
        self.sorted.exit();
        workers.join()
    }

    /// Wait up to `timeout` for the next sorted train. Trains below the watermark are
    /// released on the way.
    pub fn get_next(&self, timeout: Duration) -> NextTrain {
        if !self.is_running() {
            return NextTrain::Ended;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.sorted.take_ready_timeout(remaining) {
                Pop::Item(handle) => {
                    if handle.train_id() >= self.watermark.load(Ordering::Relaxed) {
                        return NextTrain::Train(handle);
                    }
                    Counters::incr(&self.counters.dismissed_trains);
                    if let Err(e) = self.sorted.release(handle) {
                        log::error!("Could not release a stale train: {e}");
                    }
                }
                Pop::Timeout => return NextTrain::Timeout,
                Pop::Closed => return NextTrain::Ended,
            }
        }
    }

    /// Hand a train from [Sorter::get_next] back to the Sorter
    pub fn release(&self, handle: TrainHandle) -> Result<(), SorterError> {
        Ok(self.sorted.release(handle)?)
    }

    /// Ignore every train with an id below `train_id` from now on
    pub fn set_watermark(&self, train_id: u64) {
        log::debug!("Watermark set to train {train_id}");
        self.watermark.store(train_id, Ordering::Relaxed);
    }

    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Relaxed)
    }

    /// Release every waiting train below `train_id` from both pools. Returns the number of
    /// released trains.
    pub fn dismiss_below(&self, train_id: u64) -> usize {
        let dismissed = self.sorted.dismiss_below(train_id) + self.unsorted.dismiss_below(train_id);
        Counters::add(&self.counters.dismissed_trains, dismissed as u64);
        dismissed
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn status(&self) -> SorterStatus {
        SorterStatus {
            running: self.is_running(),
            watermark: self.watermark(),
            unsorted_fill: self.unsorted.ready_len(),
            unsorted_capacity: self.unsorted.capacity(),
            sorted_fill: self.sorted.ready_len(),
            sorted_capacity: self.sorted.capacity(),
            dropped_trains: self.sorted.dropped() + self.unsorted.dropped(),
            ..SorterStatus::from_counters(&self.counters)
        }
    }
}

impl Drop for Sorter {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Sorter failed while stopping: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TrainGenerator;
    use crate::receiver::MemorySource;
    use crate::train_buffer::Layout;
    use crate::train_file::write_train_bytes;

    const DEPTH: usize = 2;

    fn config() -> Config {
        Config {
            udp_port: 0,
            socket_timeout_ms: 50,
            asic_mask: 0b11,
            sram_depth: DEPTH,
            unsorted_pool_size: 4,
            sorted_pool_size: 4,
            drop_oldest: false,
            sort_threads: 2,
            ..Default::default()
        }
    }

    fn source(generator: &TrainGenerator, ids: &[u64]) -> Box<MemorySource> {
        let datagrams = ids
            .iter()
            .enumerate()
            .flat_map(|(frame, id)| generator.datagrams(*id, frame as u32 + 1));
        Box::new(MemorySource::new(datagrams).with_idle(Duration::from_millis(20)))
    }

    fn next_id(sorter: &Sorter) -> Option<u64> {
        let handle = sorter.get_next(Duration::from_secs(2)).into_train()?;
        let id = handle.train_id();
        sorter.release(handle).unwrap();
        Some(id)
    }

    #[test]
    fn test_memory_pipeline() {
        let generator = TrainGenerator::new(DEPTH, vec![0, 1]);
        let sorter = Sorter::new(config()).unwrap();
        sorter.start_with_source(source(&generator, &[1, 2, 3])).unwrap();
        for id in 1..=3 {
            let handle = sorter.get_next(Duration::from_secs(2)).into_train().unwrap();
            assert_eq!(handle.train_id(), id);
            assert_eq!(handle.layout(), Layout::Pixel);
            assert_eq!(
                handle.sample(1, 1, 123).unwrap(),
                generator.sample_value(id, 1, 1, 123)
            );
            sorter.release(handle).unwrap();
        }
        assert!(matches!(
            sorter.get_next(Duration::from_millis(100)),
            NextTrain::Timeout
        ));
        assert!(matches!(
            sorter.start_with_source(source(&generator, &[])),
            Err(SorterError::AlreadyRunning)
        ));
        sorter.stop().unwrap();
        sorter.stop().unwrap();
        let status = sorter.status();
        assert!(!status.running);
        assert_eq!(status.sorted_trains, 3);
        assert_eq!(status.unsorted_fill, 0);
    }

    #[test]
    fn test_dummy_data_checked_while_sorting() {
        let generator = TrainGenerator::dummy(DEPTH, vec![0, 1]);
        let sorter = Sorter::new(Config {
            check_dummy_data: true,
            ..config()
        })
        .unwrap();
        sorter.start_with_source(source(&generator, &[1, 2])).unwrap();
        assert_eq!(next_id(&sorter), Some(1));
        assert_eq!(next_id(&sorter), Some(2));
        sorter.stop().unwrap();
        let status = sorter.status();
        assert_eq!(status.dummy_words, 2 * (DEPTH * 2 * 4096) as u64);
        assert_eq!(status.dummy_errors, 0);
        assert_eq!(status.out_of_range_samples, 0);
    }

    #[test]
    fn test_watermark() {
        let generator = TrainGenerator::new(1, vec![0, 1]);
        let sorter = Sorter::new(config()).unwrap();
        sorter.set_watermark(6);
        sorter.start_with_source(source(&generator, &[5, 7])).unwrap();
        assert_eq!(next_id(&sorter), Some(7));
        assert!(matches!(
            sorter.get_next(Duration::from_millis(100)),
            NextTrain::Timeout
        ));
        sorter.stop().unwrap();
    }

    #[test]
    fn test_dismiss_below() {
        let generator = TrainGenerator::new(1, vec![0, 1]);
        let sorter = Sorter::new(config()).unwrap();
        sorter.start_with_source(source(&generator, &[1, 2, 3])).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sorter.status().sorted_trains < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sorter.dismiss_below(3), 2);
        assert_eq!(next_id(&sorter), Some(3));
        sorter.stop().unwrap();
    }

    #[test]
    fn test_stop_wakes_consumers() {
        let sorter = Arc::new(Sorter::new(config()).unwrap());
        let generator = TrainGenerator::new(1, vec![0, 1]);
        sorter.start_with_source(source(&generator, &[])).unwrap();
        let consumers: Vec<_> = (0..8)
            .map(|_| {
                let sorter = sorter.clone();
                std::thread::spawn(move || {
                    let ended =
                        matches!(sorter.get_next(Duration::from_secs(30)), NextTrain::Ended);
                    (ended, Instant::now())
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(100));
        let stopped = Instant::now();
        sorter.stop().unwrap();
        for consumer in consumers {
            let (ended, woke) = consumer.join().unwrap();
            assert!(ended);
            assert!(woke.saturating_duration_since(stopped) < Duration::from_millis(300));
        }
        assert!(matches!(
            sorter.get_next(Duration::from_secs(1)),
            NextTrain::Ended
        ));
    }

    #[test]
    fn test_read_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let generator = TrainGenerator::new(DEPTH, vec![0, 1]);
        for id in [10u64, 11] {
            let path = dir.path().join(format!("TrainData_{id}.raw"));
            write_train_bytes(&path, &generator.train_bytes(id)).unwrap();
        }
        let sorter = Sorter::new(config()).unwrap();
        sorter.read_from_directory(dir.path()).unwrap();
        let mut ids = vec![next_id(&sorter).unwrap(), next_id(&sorter).unwrap()];
        ids.sort();
        assert_eq!(ids, vec![10, 11]);
        assert!(matches!(
            sorter.get_next(Duration::from_secs(2)),
            NextTrain::Ended
        ));
        assert_eq!(sorter.status().files_read, 2);
        sorter.stop().unwrap();

        // the pools are usable again after a stop
        assert!(sorter.read_from_directory(dir.path()).is_ok());
        sorter.stop().unwrap();
        assert!(matches!(
            sorter.read_from_directory(&dir.path().join("missing")),
            Err(SorterError::FileSourceError(_))
        ));
    }

    #[test]
    fn test_correction_requires_stopped_sorter() {
        let sorter = Sorter::new(config()).unwrap();
        sorter
            .set_correction(Some(SramCorrection::zeros(DEPTH)))
            .unwrap();
        assert!(sorter
            .set_correction(Some(SramCorrection::zeros(DEPTH - 1)))
            .is_err());
        let generator = TrainGenerator::new(1, vec![0, 1]);
        sorter.start_with_source(source(&generator, &[])).unwrap();
        assert!(matches!(
            sorter.set_correction(None),
            Err(SorterError::AlreadyRunning)
        ));
        sorter.stop().unwrap();
    }
}
