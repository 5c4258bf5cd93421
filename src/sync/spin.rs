// SPDX-License-Identifier: MPL-2.0

use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use crate::irq::{self, DisabledLocalIrqGuard};

/// A ticket spin lock.
///
/// Tickets make the lock FIFO-fair: contending CPUs acquire in the order
/// they arrived, which bounds every critical section's wait time.
pub struct SpinLock<T: ?Sized> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    val: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    /// Creates a new spin lock.
    pub const fn new(val: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            val: UnsafeCell::new(val),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock with local IRQs disabled.
    ///
    /// This is the only safe way to take a lock that is also taken from
    /// interrupt context on the same CPU.
    pub fn lock_irq_disabled(&self) -> SpinLockGuard<T> {
        let irq_guard = irq::disable_local();
        self.acquire();
        SpinLockGuard {
            lock: self,
            _irq_guard: Some(irq_guard),
            _not_send: PhantomData,
        }
    }

    /// Acquires the lock without touching the local IRQ state.
    ///
    /// Only valid when the caller already runs with IRQs disabled, or when
    /// the lock is never taken from interrupt context.
    pub fn lock(&self) -> SpinLockGuard<T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            _irq_guard: None,
            _not_send: PhantomData,
        }
    }

    fn acquire(&self) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.now_serving.fetch_add(1, Ordering::Release);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.val, f)
    }
}

// SAFETY: only a single lock holder is permitted to access the inner data.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

/// A guard that provides exclusive access to the data protected by a
/// [`SpinLock`].
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    _irq_guard: Option<DisabledLocalIrqGuard>,
    _not_send: PhantomData<*mut ()>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.val.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.val.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
