use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::blocking_queue::{BlockingQueue, Pop, QueueState};
use super::error::PoolError;
use super::train_buffer::TrainBuffer;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusive ownership of one pooled TrainBuffer.
///
/// Handles cannot be cloned; whoever holds the handle is the only one able to touch the
/// buffer. A handle goes back to its pool through [BufferPool::publish] or
/// [BufferPool::release]. Dropping a handle instead removes its buffer from the pool
/// for good.
#[derive(Debug)]
pub struct TrainHandle {
    buffer: Box<TrainBuffer>,
    pool_id: u64,
    slot: usize,
    generation: u64,
}

impl TrainHandle {
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for TrainHandle {
    type Target = TrainBuffer;
    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for TrainHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Ready,
    CheckedOut,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    generation: u64,
}

/// What [BufferPool::take_free] does when no free buffer is left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPolicy {
    /// Wait for a consumer to release a buffer
    Block,
    /// Reclaim the oldest ready buffer, dropping its train
    DropOldest,
}

/// Snapshot of how the buffers of a pool are distributed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAudit {
    pub capacity: usize,
    pub free: usize,
    pub ready: usize,
    pub checked_out: usize,
    pub free_queued: usize,
    pub ready_queued: usize,
}

impl PoolAudit {
    /// Every buffer is in exactly one set and the queues agree with the slot table. Only
    /// exact while no pool operation is in flight.
    pub fn is_consistent(&self) -> bool {
        self.free + self.ready + self.checked_out == self.capacity
            && self.free == self.free_queued
            && self.ready == self.ready_queued
    }
}

/// BufferPool hands a fixed set of TrainBuffers between a producer and a consumer.
///
/// The producer takes a free buffer, fills it and publishes it to the ready queue. The
/// consumer takes ready buffers in FIFO order and releases them back to the free queue.
/// All buffers are allocated at construction; nothing is allocated afterwards.
#[derive(Debug)]
pub struct BufferPool {
    id: u64,
    name: String,
    policy: PoolPolicy,
    free: BlockingQueue<TrainHandle>,
    ready: BlockingQueue<TrainHandle>,
    slots: Mutex<Vec<Slot>>,
    dropped: AtomicU64,
}

impl BufferPool {
    /// Allocate `capacity` buffers of the given depth
    pub fn new(
        name: &str,
        capacity: usize,
        depth: usize,
        policy: PoolPolicy,
    ) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let free = BlockingQueue::with_capacity(capacity);
        let ready = BlockingQueue::with_capacity(capacity);
        let mut buffer_bytes = 0;
        for slot in 0..capacity {
            let buffer = Box::new(TrainBuffer::new(depth));
            buffer_bytes = buffer.capacity_bytes();
            free.push(TrainHandle {
                buffer,
                pool_id: id,
                slot,
                generation: 0,
            });
        }
        log::info!(
            "Allocated {name} pool with {capacity} buffers ({} total) using policy {policy:?}",
            human_bytes::human_bytes((buffer_bytes * capacity) as f64)
        );
        Ok(Self {
            id,
            name: name.to_string(),
            policy,
            free,
            ready,
            slots: Mutex::new(vec![
                Slot {
                    state: SlotState::Free,
                    generation: 0,
                };
                capacity
            ]),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn policy(&self) -> PoolPolicy {
        self.policy
    }

    /// Number of ready buffers reclaimed under [PoolPolicy::DropOldest]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Check that a handle returning to this pool is the one we handed out
    fn check_handle(&self, slots: &[Slot], handle: &TrainHandle) -> Result<(), PoolError> {
        if handle.pool_id != self.id {
            return Err(PoolError::ForeignHandle {
                slot: handle.slot,
                handle_pool: handle.pool_id,
                pool: self.id,
            });
        }
        let slot = &slots[handle.slot];
        if slot.generation != handle.generation || slot.state != SlotState::CheckedOut {
            return Err(PoolError::StaleHandle {
                slot: handle.slot,
                handle: handle.generation,
                current: slot.generation,
            });
        }
        Ok(())
    }

    fn check_out(&self, handle: TrainHandle) -> TrainHandle {
        self.slots.lock()[handle.slot].state = SlotState::CheckedOut;
        handle
    }

    /// Take a buffer to fill. Returns None once the pool was shut down.
    ///
    /// Under [PoolPolicy::Block] this waits until a buffer is released. Under
    /// [PoolPolicy::DropOldest] the oldest ready buffer is reclaimed instead; only when
    /// every buffer is checked out does it wait.
    pub fn take_free(&self) -> Option<TrainHandle> {
        if self.policy == PoolPolicy::DropOldest {
            if self.free.state() == QueueState::Exited {
                return None;
            }
            if let Some(handle) = self.free.try_pop() {
                return Some(self.check_out(handle));
            }
            if let Some(mut handle) = self.ready.try_pop() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "{} pool dropped unconsumed train {}",
                    self.name,
                    handle.train_id()
                );
                handle.invalidate();
                return Some(self.check_out(handle));
            }
        }
        self.free.pop().map(|handle| self.check_out(handle))
    }

    /// Take a free buffer without waiting and without reclaiming ready buffers
    pub fn try_take_free(&self) -> Option<TrainHandle> {
        self.free.try_pop().map(|handle| self.check_out(handle))
    }

    /// Hand a filled buffer to the consumer side
    pub fn publish(&self, handle: TrainHandle) -> Result<(), PoolError> {
        let mut slots = self.slots.lock();
        self.check_handle(&slots, &handle)?;
        slots[handle.slot].state = SlotState::Ready;
        self.ready.push(handle);
        Ok(())
    }

    /// Next ready buffer in FIFO order. None once the pool was shut down.
    pub fn take_ready(&self) -> Option<TrainHandle> {
        self.ready.pop().map(|handle| self.check_out(handle))
    }

    pub fn take_ready_timeout(&self, timeout: Duration) -> Pop<TrainHandle> {
        match self.ready.pop_timeout(timeout) {
            Pop::Item(handle) => Pop::Item(self.check_out(handle)),
            Pop::Timeout => Pop::Timeout,
            Pop::Closed => Pop::Closed,
        }
    }

    /// Return a buffer to the free queue. The buffer is invalidated.
    pub fn release(&self, mut handle: TrainHandle) -> Result<(), PoolError> {
        let mut slots = self.slots.lock();
        self.check_handle(&slots, &handle)?;
        let slot = &mut slots[handle.slot];
        slot.generation += 1;
        slot.state = SlotState::Free;
        handle.generation = slot.generation;
        handle.invalidate();
        self.free.push(handle);
        Ok(())
    }

    /// Release every ready buffer whose train id is below `train_id`. Returns the number
    /// of released buffers.
    pub fn dismiss_below(&self, train_id: u64) -> usize {
        let mut count = 0;
        while let Some(handle) = self.ready.try_pop_if(|h| h.train_id() < train_id) {
            let handle = self.check_out(handle);
            if self.release(handle).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Wake every waiter on both queues with the end of the pool
    pub fn exit(&self) {
        self.free.exit();
        self.ready.exit();
    }

    /// Let consumers drain the ready queue, then end the pool
    pub fn finish(&self) {
        self.free.finish();
        self.ready.finish();
    }

    /// Move every ready buffer back to the free queue and re-arm both queues. Handles
    /// checked out at this point stay valid and return through [BufferPool::release].
    pub fn reset(&self) {
        let mut ready = Vec::new();
        self.ready.drain_into(&mut ready);
        for handle in ready {
            let handle = self.check_out(handle);
            // handles drained from our own ready queue always pass the check
            let _ = self.release(handle);
        }
        self.free.reset();
        self.ready.reset();
    }

    pub fn audit(&self) -> PoolAudit {
        let slots = self.slots.lock();
        let count = |state| slots.iter().filter(|s| s.state == state).count();
        PoolAudit {
            capacity: slots.len(),
            free: count(SlotState::Free),
            ready: count(SlotState::Ready),
            checked_out: count(SlotState::CheckedOut),
            free_queued: self.free.len(),
            ready_queued: self.ready.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;
    use std::thread;

    const DEPTH: usize = 1;

    fn pool(capacity: usize, policy: PoolPolicy) -> BufferPool {
        BufferPool::new("test", capacity, DEPTH, policy).unwrap()
    }

    fn fill(handle: &mut TrainHandle, train_id: u64) {
        let generator = crate::generator::TrainGenerator::new(1, vec![0]);
        let len = generator.write_train(train_id, handle.as_bytes_mut());
        handle.parse(len, &[0]).unwrap();
    }

    #[test]
    fn test_zero_capacity() {
        assert_eq!(
            BufferPool::new("empty", 0, DEPTH, PoolPolicy::Block).unwrap_err(),
            PoolError::ZeroCapacity
        );
    }

    #[test]
    fn test_fifo_and_release() {
        let pool = pool(3, PoolPolicy::Block);
        for id in [4, 5, 6] {
            let mut handle = pool.take_free().unwrap();
            fill(&mut handle, id);
            pool.publish(handle).unwrap();
        }
        assert!(pool.try_take_free().is_none());
        let first = pool.take_ready().unwrap();
        assert_eq!(first.train_id(), 4);
        pool.release(first).unwrap();
        assert_eq!(pool.free_len(), 1);
        let next = pool.take_ready().unwrap();
        assert_eq!(next.train_id(), 5);
        pool.release(next).unwrap();
        assert!(pool.audit().is_consistent());
    }

    #[test]
    fn test_released_buffers_are_invalid() {
        let pool = pool(1, PoolPolicy::Block);
        let mut handle = pool.take_free().unwrap();
        fill(&mut handle, 9);
        assert!(handle.is_valid());
        let generation = handle.generation();
        pool.release(handle).unwrap();
        let handle = pool.take_free().unwrap();
        assert!(!handle.is_valid());
        assert_eq!(handle.generation(), generation + 1);
    }

    #[test]
    fn test_take_free_blocks_until_release() {
        let pool = Arc::new(pool(3, PoolPolicy::Block));
        let held: Vec<_> = (0..3).map(|_| pool.take_free().unwrap()).collect();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.take_free().map(|h| h.slot()))
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());
        let mut held = held.into_iter();
        let released = held.next().unwrap();
        let slot = released.slot();
        pool.release(released).unwrap();
        assert_eq!(waiter.join().unwrap(), Some(slot));
    }

    #[test]
    fn test_exit_wakes_blocked_take() {
        let pool = Arc::new(pool(1, PoolPolicy::Block));
        let _held = pool.take_free().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || (pool.take_free().is_none(), pool.take_ready().is_none()))
        };
        thread::sleep(Duration::from_millis(50));
        pool.exit();
        assert_eq!(waiter.join().unwrap(), (true, true));
    }

    #[test]
    fn test_drop_oldest_reclaims_ready() {
        let pool = pool(2, PoolPolicy::DropOldest);
        for id in [1, 2] {
            let mut handle = pool.take_free().unwrap();
            fill(&mut handle, id);
            pool.publish(handle).unwrap();
        }
        let reclaimed = pool.take_free().unwrap();
        assert!(!reclaimed.is_valid());
        assert_eq!(pool.dropped(), 1);
        assert_eq!(pool.take_ready().unwrap().train_id(), 2);
        pool.release(reclaimed).unwrap();
    }

    #[test]
    fn test_foreign_and_stale_handles() {
        let first = pool(1, PoolPolicy::Block);
        let second = pool(1, PoolPolicy::Block);
        let handle = first.take_free().unwrap();
        assert!(matches!(
            second.release(handle),
            Err(PoolError::ForeignHandle { .. })
        ));

        let pool = pool(1, PoolPolicy::Block);
        let handle = pool.take_free().unwrap();
        let stale = TrainHandle {
            buffer: Box::new(TrainBuffer::new(DEPTH)),
            pool_id: pool.id(),
            slot: handle.slot(),
            generation: handle.generation() + 5,
        };
        assert!(matches!(
            pool.publish(stale),
            Err(PoolError::StaleHandle { .. })
        ));
        pool.release(handle).unwrap();
    }

    #[test]
    fn test_dismiss_below_and_reset() {
        let pool = pool(4, PoolPolicy::Block);
        for id in [3, 4, 8, 5] {
            let mut handle = pool.take_free().unwrap();
            fill(&mut handle, id);
            pool.publish(handle).unwrap();
        }
        // stops at the first train at or above the bound
        assert_eq!(pool.dismiss_below(6), 2);
        assert_eq!(pool.ready_len(), 2);
        let held = pool.take_ready().unwrap();
        pool.reset();
        let audit = pool.audit();
        assert_eq!((audit.free, audit.ready, audit.checked_out), (3, 0, 1));
        pool.release(held).unwrap();
        assert_eq!(pool.audit().free, 4);
    }

    #[test]
    fn test_randomized_partition() {
        let mut rng = rand::thread_rng();
        let capacity = 5;
        let pool = pool(capacity, PoolPolicy::Block);
        let mut producing: Vec<TrainHandle> = Vec::new();
        let mut consuming: Vec<TrainHandle> = Vec::new();
        for step in 0..2000u64 {
            match rng.gen_range(0..4) {
                0 => {
                    if let Some(handle) = pool.try_take_free() {
                        producing.push(handle);
                    }
                }
                1 => {
                    if let Some(mut handle) = producing.pop() {
                        fill(&mut handle, step);
                        pool.publish(handle).unwrap();
                    }
                }
                2 => {
                    if let Pop::Item(handle) = pool.take_ready_timeout(Duration::ZERO) {
                        consuming.push(handle);
                    }
                }
                _ => {
                    if !consuming.is_empty() {
                        let index = rng.gen_range(0..consuming.len());
                        pool.release(consuming.swap_remove(index)).unwrap();
                    }
                }
            }
            let audit = pool.audit();
            assert!(audit.is_consistent(), "inconsistent at step {step}: {audit:?}");
            assert_eq!(audit.checked_out, producing.len() + consuming.len());
        }
    }
}
