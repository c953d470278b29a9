// GPU synchronisation primitives and the fence pool
//
// Fences never leave the pool: a fence is handed out for one submission,
// recorded on every command list in that submission, and returned to the
// free list once the GPU signals it or the submit fails. Every hand-out
// bumps the fence's epoch. A slot stamped with an older epoch refers to a
// submission that already finished (or never happened), so it is treated
// as complete without touching the fence again.

use ash::vk;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{GpuError, GpuResult};

/// GPU to GPU ordering primitive.
#[derive(Debug)]
pub struct Semaphore {
    pub(crate) handle: vk::Semaphore,
}

impl Semaphore {
    pub(crate) fn new(backend: &dyn Backend) -> GpuResult<Self> {
        Ok(Self {
            handle: backend.create_semaphore()?,
        })
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.handle
    }

    pub(crate) fn destroy(self, backend: &dyn Backend) {
        backend.destroy_semaphore(self.handle);
    }
}

/// GPU to CPU completion primitive. Owned by the `FencePool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fence(pub(crate) vk::Fence);

impl Fence {
    pub fn raw(&self) -> vk::Fence {
        self.0
    }
}

/// Hand-out counters for pool fences, shared with the slots that
/// reference them.
#[derive(Debug, Clone, Default)]
pub(crate) struct FenceEpochs(Arc<Mutex<HashMap<vk::Fence, u64>>>);

impl FenceEpochs {
    fn current(&self, fence: Fence) -> u64 {
        self.0.lock().get(&fence.0).copied().unwrap_or(0)
    }

    fn bump(&self, fence: Fence) -> u64 {
        let mut epochs = self.0.lock();
        let epoch = epochs.entry(fence.0).or_insert(0);
        *epoch += 1;
        *epoch
    }

    fn clear(&self) {
        self.0.lock().clear();
    }
}

/// One submission's claim on a pool fence.
#[derive(Debug, Clone)]
pub(crate) struct FenceTicket {
    fence: Fence,
    epoch: u64,
    epochs: FenceEpochs,
}

impl FenceTicket {
    pub(crate) fn fence(&self) -> Fence {
        self.fence
    }

    /// False once the pool has handed the fence out again.
    fn is_current(&self) -> bool {
        self.epochs.current(self.fence) == self.epoch
    }
}

/// Shared slot holding the fence a command list was last submitted with.
///
/// A primary list and every secondary it executed share the same fence
/// after submission, so the slot is reference counted and updated through
/// `&self`.
#[derive(Debug, Clone, Default)]
pub struct FenceSlot(Arc<Mutex<Option<FenceTicket>>>);

impl FenceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fence of the tracked submission, if it may still be running.
    pub fn get(&self) -> Option<Fence> {
        self.0
            .lock()
            .as_ref()
            .filter(|ticket| ticket.is_current())
            .map(FenceTicket::fence)
    }

    pub(crate) fn set(&self, ticket: &FenceTicket) {
        *self.0.lock() = Some(ticket.clone());
    }

    pub(crate) fn clear(&self) {
        *self.0.lock() = None;
    }

    /// Block until the tracked submission (if any) has finished, then
    /// clear the slot.
    pub(crate) fn wait(&self, backend: &dyn Backend, timeout_ns: u64) -> GpuResult<()> {
        let Some(ticket) = self.0.lock().clone() else {
            return Ok(());
        };
        if ticket.is_current() {
            match backend.wait_for_fence(ticket.fence.0, timeout_ns) {
                Ok(()) => {}
                // Recycled while we waited: our submission is long done
                Err(GpuError::Timeout) if !ticket.is_current() => {}
                Err(err) => return Err(err),
            }
        }
        self.clear();
        Ok(())
    }
}

pub struct FencePool {
    free: VecDeque<Fence>,
    in_use: Vec<Fence>,
    epochs: FenceEpochs,
    growth: u32,
    total: usize,
}

impl FencePool {
    pub fn new(backend: &dyn Backend, initial: u32) -> GpuResult<Self> {
        let growth = initial.max(1);
        let mut pool = Self {
            free: VecDeque::with_capacity(growth as usize),
            in_use: Vec::new(),
            epochs: FenceEpochs::default(),
            growth,
            total: 0,
        };
        pool.grow(backend, growth)?;
        Ok(pool)
    }

    fn grow(&mut self, backend: &dyn Backend, count: u32) -> GpuResult<()> {
        for _ in 0..count {
            // Created signaled so a fence that is never submitted can't
            // deadlock anyone who waits on it.
            self.free.push_back(Fence(backend.create_fence(true)?));
        }
        self.total += count as usize;
        Ok(())
    }

    /// Hand out an unsignaled fence for one submission.
    pub fn acquire(&mut self, backend: &dyn Backend) -> GpuResult<Fence> {
        if self.free.is_empty() {
            log::info!(
                "Fence pool exhausted ({} in use), growing by {}",
                self.in_use.len(),
                self.growth
            );
            self.grow(backend, self.growth)?;
        }

        let fence = self
            .free
            .pop_front()
            .ok_or_else(|| GpuError::invalid_usage("fence pool grew but has no free fence"))?;
        // Older holders of this fence stop waiting on it before the reset
        self.epochs.bump(fence);
        if let Err(err) = backend.reset_fence(fence.0) {
            self.free.push_front(fence);
            return Err(err);
        }
        self.in_use.push(fence);
        Ok(fence)
    }

    /// Claim on an in-use fence for the submission it was acquired for.
    pub(crate) fn ticket(&self, fence: Fence) -> FenceTicket {
        FenceTicket {
            fence,
            epoch: self.epochs.current(fence),
            epochs: self.epochs.clone(),
        }
    }

    /// Return a fence whose submission never reached the queue. It stays
    /// unsignaled, but no slot holds its current epoch.
    pub(crate) fn release_unsubmitted(&mut self, fence: Fence) {
        if let Some(pos) = self.in_use.iter().position(|f| *f == fence) {
            self.in_use.swap_remove(pos);
            self.free.push_back(fence);
        }
    }

    /// Move every signaled in-use fence back to the free list.
    /// Returns the fences that were moved.
    pub fn reclaim(&mut self, backend: &dyn Backend) -> GpuResult<Vec<Fence>> {
        let mut reclaimed = Vec::new();
        let mut still_busy = Vec::with_capacity(self.in_use.len());

        for fence in self.in_use.drain(..) {
            match backend.fence_signaled(fence.0) {
                Ok(true) => reclaimed.push(fence),
                Ok(false) => still_busy.push(fence),
                Err(err) => {
                    log::error!("Failed to query fence status: {}", err);
                    still_busy.push(fence);
                }
            }
        }
        self.in_use = still_busy;
        self.free.extend(reclaimed.iter().copied());

        Ok(reclaimed)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_in_use(&self, fence: Fence) -> bool {
        self.in_use.contains(&fence)
    }

    /// Destroy every fence. The caller must have waited for the device.
    pub fn destroy(&mut self, backend: &dyn Backend) {
        for fence in self.free.drain(..).chain(self.in_use.drain(..)) {
            backend.destroy_fence(fence.0);
        }
        self.epochs.clear();
        self.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, QueueKind, SubmitBatch};
    use ash::vk::Handle;

    fn submit_with(backend: &HeadlessBackend, fence: Fence) {
        backend
            .queue_submit(QueueKind::Graphics, &SubmitBatch::default(), fence.0)
            .unwrap();
    }

    #[test]
    fn acquired_fences_are_unsignaled_and_tracked() {
        let backend = HeadlessBackend::new();
        let mut pool = FencePool::new(&backend, 4).unwrap();

        let fence = pool.acquire(&backend).unwrap();
        assert!(!backend.fence_signaled(fence.0).unwrap());
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.in_use_count(), 1);
        assert!(pool.is_in_use(fence));
    }

    #[test]
    fn reclaim_moves_only_signaled_fences() {
        let backend = HeadlessBackend::new();
        let mut pool = FencePool::new(&backend, 4).unwrap();

        let done = pool.acquire(&backend).unwrap();
        let busy = pool.acquire(&backend).unwrap();
        submit_with(&backend, done);
        submit_with(&backend, busy);
        backend.wait_for_fence(done.0, u64::MAX).unwrap();

        // "busy" was submitted after "done" so waiting on "done" leaves it pending
        let reclaimed = pool.reclaim(&backend).unwrap();
        assert_eq!(reclaimed, vec![done]);
        assert!(pool.is_in_use(busy));
        assert_eq!(pool.free_count() + pool.in_use_count(), pool.total());
    }

    #[test]
    fn reclaim_is_idempotent() {
        let backend = HeadlessBackend::new();
        let mut pool = FencePool::new(&backend, 2).unwrap();
        let fence = pool.acquire(&backend).unwrap();
        submit_with(&backend, fence);
        backend.complete_all();

        assert_eq!(pool.reclaim(&backend).unwrap().len(), 1);
        let free = pool.free_count();
        assert!(pool.reclaim(&backend).unwrap().is_empty());
        assert_eq!(pool.free_count(), free);
    }

    #[test]
    fn exhaustion_grows_pool_instead_of_failing() {
        let backend = HeadlessBackend::new();
        let mut pool = FencePool::new(&backend, 2).unwrap();

        let fences: Vec<_> = (0..5).map(|_| pool.acquire(&backend).unwrap()).collect();
        assert_eq!(pool.in_use_count(), 5);
        assert_eq!(pool.total(), 6);

        let mut unique = fences.clone();
        unique.sort_by_key(|f| f.0.as_raw());
        unique.dedup();
        assert_eq!(unique.len(), fences.len());
    }

    #[test]
    fn unsubmitted_fence_goes_back_to_free_list() {
        let backend = HeadlessBackend::new();
        let mut pool = FencePool::new(&backend, 1).unwrap();
        let fence = pool.acquire(&backend).unwrap();
        pool.release_unsubmitted(fence);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.in_use_count(), 0);
    }

    #[test]
    fn fence_slot_wait_clears_after_signal() {
        let backend = HeadlessBackend::new();
        let mut pool = FencePool::new(&backend, 1).unwrap();
        let fence = pool.acquire(&backend).unwrap();
        submit_with(&backend, fence);

        let slot = FenceSlot::new();
        let shared = slot.clone();
        slot.set(&pool.ticket(fence));
        assert_eq!(shared.get(), Some(fence));

        shared.wait(&backend, u64::MAX).unwrap();
        assert!(slot.get().is_none());
        assert!(backend.fence_signaled(fence.0).unwrap());
    }

    #[test]
    fn failed_submit_does_not_strand_older_slots() {
        let backend = HeadlessBackend::new();
        let mut pool = FencePool::new(&backend, 1).unwrap();

        let fence = pool.acquire(&backend).unwrap();
        let slot = FenceSlot::new();
        slot.set(&pool.ticket(fence));
        submit_with(&backend, fence);
        backend.complete_all();
        pool.reclaim(&backend).unwrap();

        // Handed out again, reset, then the submit never happens
        let again = pool.acquire(&backend).unwrap();
        assert_eq!(again, fence);
        pool.release_unsubmitted(again);
        assert!(!backend.fence_signaled(fence.0).unwrap());

        assert!(slot.get().is_none());
        slot.wait(&backend, 1_000).unwrap();
    }

    #[test]
    fn reused_fence_does_not_block_the_previous_holder() {
        let backend = HeadlessBackend::new();
        let mut pool = FencePool::new(&backend, 1).unwrap();

        let fence = pool.acquire(&backend).unwrap();
        let first = FenceSlot::new();
        first.set(&pool.ticket(fence));
        submit_with(&backend, fence);
        backend.complete_all();
        pool.reclaim(&backend).unwrap();

        let again = pool.acquire(&backend).unwrap();
        let second = FenceSlot::new();
        second.set(&pool.ticket(again));
        submit_with(&backend, again);

        first.wait(&backend, 0).unwrap();
        assert_eq!(backend.in_flight_submissions(), 1);
        assert_eq!(second.get(), Some(fence));
    }
}
