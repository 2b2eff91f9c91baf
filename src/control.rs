use std::{
    ptr::NonNull, sync::atomic::fence, sync::atomic::AtomicBool, sync::atomic::AtomicUsize,
    sync::atomic::Ordering::AcqRel, sync::atomic::Ordering::Acquire,
    sync::atomic::Ordering::Relaxed, sync::atomic::Ordering::Release,
};

use crossbeam::utils::Backoff;

/// A reference counter. Every read-modify-write goes to the same atomic, so all operations on one
/// counter share a single total order.
pub(crate) struct AtomicCounter {
    value: AtomicUsize,
}

impl AtomicCounter {
    pub(crate) const fn new(value: usize) -> Self {
        AtomicCounter {
            value: AtomicUsize::new(value),
        }
    }

    /// Increments on behalf of a handle that already holds a reference, so no synchronization is
    /// needed beyond the atomicity of the add.
    pub(crate) fn increment(&self) {
        self.value.fetch_add(1, Relaxed);
    }

    pub(crate) fn increment_and_fetch(&self, n: usize) -> usize {
        self.value.fetch_add(n, AcqRel) + n
    }

    /// Returns `true` for the caller whose decrement brought the counter to zero. That caller
    /// observes every write made by earlier decrementers.
    pub(crate) fn decrement_and_check_zero(&self) -> bool {
        let previous = self.value.fetch_sub(1, Release);
        debug_assert!(previous > 0);

        if previous == 1 {
            fence(Acquire);
            true
        } else {
            false
        }
    }

    /// Moves the counter from `current` to `new` only if nobody else touched it in between.
    pub(crate) fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize> {
        self.value.compare_exchange(current, new, Acquire, Relaxed)
    }

    pub(crate) fn value(&self) -> usize {
        self.value.load(Acquire)
    }
}

/// A busy-waiting mutual exclusion lock. Not reentrant and not fair.
pub(crate) struct SpinLock {
    locked: AtomicBool,
}

/// Holds a [`SpinLock`] until dropped.
pub(crate) struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl SpinLock {
    pub(crate) const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }

            // wait for a plain load to see the lock free before retrying the exchange, so the
            // cache line is not bounced between waiters.
            while self.locked.load(Relaxed) {
                backoff.snooze();
            }
        }
    }

    pub(crate) fn try_lock(&self) -> Option<SpinGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Acquire, Relaxed)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Release);
    }
}

#[cfg(test)]
thread_local! {
    /// Number of control blocks freed on the current thread.
    pub(crate) static FREED_BLOCKS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// The bookkeeping shared by every [`Strong`][crate::Strong] and [`Weak`][crate::Weak] that refer
/// to the same value.
///
/// `strong` counts the live strong handles. `weak` counts every live handle, strong ones included,
/// so the block outlives the strong handle that destroys the value.
pub(crate) struct ControlBlock {
    strong: AtomicCounter,
    weak: AtomicCounter,
    lock: SpinLock,
}

impl ControlBlock {
    /// Allocates a block for a freshly created strong handle.
    pub(crate) fn allocate() -> NonNull<ControlBlock> {
        NonNull::from(Box::leak(Box::new(ControlBlock {
            strong: AtomicCounter::new(1),
            weak: AtomicCounter::new(1),
            lock: SpinLock::new(),
        })))
    }

    /// Frees a block whose weak count has reached zero.
    ///
    /// # Safety
    ///
    /// `block` must come from [`ControlBlock::allocate`] and no handle may refer to it anymore.
    pub(crate) unsafe fn free(block: NonNull<ControlBlock>) {
        log::trace!("freeing control block {:p}", block);
        drop(Box::from_raw(block.as_ptr()));

        #[cfg(test)]
        FREED_BLOCKS.with(|freed| freed.set(freed.get() + 1));
    }

    pub(crate) fn increment_strong(&self) {
        self.strong.increment();
    }

    pub(crate) fn decrement_strong_and_check_zero(&self) -> bool {
        #[cfg(feature = "serialized-release")]
        let _guard = self.lock.lock();

        self.strong.decrement_and_check_zero()
    }

    /// Takes back the transient strong reference of a promotion that found the value destroyed.
    /// The caller must hold the block's lock, which rules out every other increment from zero.
    pub(crate) fn undo_failed_promotion(&self) {
        let reached_zero = self.strong.decrement_and_check_zero();
        debug_assert!(reached_zero);
    }

    pub(crate) fn increment_weak(&self) {
        self.weak.increment();
    }

    pub(crate) fn decrement_weak_and_check_zero(&self) -> bool {
        self.weak.decrement_and_check_zero()
    }

    pub(crate) fn fetch_add_strong(&self, n: usize) -> usize {
        self.strong.increment_and_fetch(n) - n
    }

    /// Claims the last strong reference, leaving the strong count at zero. Fails if any other
    /// strong reference exists, including a promotion in flight.
    pub(crate) fn claim_unique_strong(&self) -> bool {
        self.strong.compare_exchange(1, 0).is_ok()
    }

    pub(crate) fn strong_count(&self) -> usize {
        self.strong.value()
    }

    pub(crate) fn weak_count(&self) -> usize {
        self.weak.value()
    }

    pub(crate) fn acquire_lock(&self) -> SpinGuard<'_> {
        self.lock.lock()
    }
}
