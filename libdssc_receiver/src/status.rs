use std::sync::atomic::{AtomicU64, Ordering};

/// Event counters shared between the Receiver, the sort stage and the consumer API.
///
/// Framing and transport problems never surface as errors; they are counted here.
#[derive(Debug, Default)]
pub struct Counters {
    pub received_trains: AtomicU64,
    /// Trains dropped because of a sequence break, a truncation or a timeout
    pub discarded_trains: AtomicU64,
    /// Datagrams missing from sequence gaps
    pub lost_packets: AtomicU64,
    /// Datagrams longer than the wire format allows, dropped unread
    pub oversized_datagrams: AtomicU64,
    pub timeouts: AtomicU64,
    pub below_watermark: AtomicU64,
    pub sorted_trains: AtomicU64,
    /// Trains removed from the pools because they fell below the watermark
    pub dismissed_trains: AtomicU64,
    pub test_pattern_mismatches: AtomicU64,
    pub out_of_range_samples: AtomicU64,
    pub dummy_errors: AtomicU64,
    pub dummy_words: AtomicU64,
    pub files_read: AtomicU64,
    pub files_rejected: AtomicU64,
    pub last_train_id: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn reset(&self) {
        for counter in [
            &self.received_trains,
            &self.discarded_trains,
            &self.lost_packets,
            &self.oversized_datagrams,
            &self.timeouts,
            &self.below_watermark,
            &self.sorted_trains,
            &self.dismissed_trains,
            &self.test_pattern_mismatches,
            &self.out_of_range_samples,
            &self.dummy_errors,
            &self.dummy_words,
            &self.files_read,
            &self.files_rejected,
            &self.last_train_id,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Lost trains per 100000 trains seen
    pub fn lost_fraction(&self) -> u64 {
        let lost = self.discarded_trains.load(Ordering::Relaxed);
        let total = lost + self.received_trains.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        100_000 * lost / total
    }
}

/// Snapshot of the Sorter state, suitable for display
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SorterStatus {
    pub running: bool,
    pub watermark: u64,
    pub unsorted_fill: usize,
    pub unsorted_capacity: usize,
    pub sorted_fill: usize,
    pub sorted_capacity: usize,
    pub received_trains: u64,
    pub discarded_trains: u64,
    pub lost_packets: u64,
    pub oversized_datagrams: u64,
    pub timeouts: u64,
    pub below_watermark: u64,
    pub sorted_trains: u64,
    pub dismissed_trains: u64,
    /// Ready trains reclaimed by the sorted pool before a consumer took them
    pub dropped_trains: u64,
    pub test_pattern_mismatches: u64,
    pub out_of_range_samples: u64,
    pub dummy_errors: u64,
    pub dummy_words: u64,
    pub files_read: u64,
    pub files_rejected: u64,
    pub last_train_id: u64,
    /// Discarded trains per 100000 trains
    pub lost_fraction: u64,
}

impl SorterStatus {
    pub fn from_counters(counters: &Counters) -> Self {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Self {
            received_trains: load(&counters.received_trains),
            discarded_trains: load(&counters.discarded_trains),
            lost_packets: load(&counters.lost_packets),
            oversized_datagrams: load(&counters.oversized_datagrams),
            timeouts: load(&counters.timeouts),
            below_watermark: load(&counters.below_watermark),
            sorted_trains: load(&counters.sorted_trains),
            dismissed_trains: load(&counters.dismissed_trains),
            test_pattern_mismatches: load(&counters.test_pattern_mismatches),
            out_of_range_samples: load(&counters.out_of_range_samples),
            dummy_errors: load(&counters.dummy_errors),
            dummy_words: load(&counters.dummy_words),
            files_read: load(&counters.files_read),
            files_rejected: load(&counters.files_rejected),
            last_train_id: load(&counters.last_train_id),
            lost_fraction: counters.lost_fraction(),
            ..Default::default()
        }
    }

    /// One line summary for the log and the CLI
    pub fn summary(&self) -> String {
        format!(
            "train {} | recv {} lost {} ({:.3}%) packets {} | sorted {} dropped {} | fill {}/{} {}/{}",
            self.last_train_id,
            self.received_trains,
            self.discarded_trains,
            self.lost_fraction as f64 / 1000.0,
            self.lost_packets,
            self.sorted_trains,
            self.dropped_trains,
            self.unsorted_fill,
            self.unsorted_capacity,
            self.sorted_fill,
            self.sorted_capacity,
        )
    }
}
