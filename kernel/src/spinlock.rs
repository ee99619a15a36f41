//! Ticket spinlocks with preempt_count integration.
//!
//! Acquiring a lock disables preemption via the per-CPU preempt count;
//! releasing it decrements the count and, back at depth zero, honors a
//! pending reschedule. The ticket protocol serves contenders strictly in
//! arrival order, so threads cannot starve behind the lock.
//!
//! [`TicketLock::lock_irqsave`] additionally saves the interrupt flag and
//! disables interrupts for the guard's lifetime; it is the variant to use
//! for any lock that an interrupt handler may take.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A fair FIFO spinlock protecting `T`.
pub struct TicketLock<T: ?Sized> {
    /// The next ticket to hand out.
    next: AtomicU32,
    /// The ticket currently being served.
    owner: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for TicketLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for TicketLock<T> {}

impl<T> TicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> TicketLock<T> {
    /// Acquire the lock, spinning in ticket order until it is our turn.
    ///
    /// Preemption is disabled before the ticket is drawn so the holder
    /// cannot be scheduled away mid-critical-section.
    pub fn lock(&self) -> TicketGuard<'_, T> {
        crate::per_cpu::preempt_disable();
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.owner.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
        TicketGuard { lock: self }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<TicketGuard<'_, T>> {
        crate::per_cpu::preempt_disable();
        let owner = self.owner.load(Ordering::Relaxed);
        if self
            .next
            .compare_exchange(owner, owner.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(TicketGuard { lock: self })
        } else {
            crate::per_cpu::preempt_enable();
            None
        }
    }

    /// Acquire the lock with interrupts disabled for the guard's
    /// lifetime. The previous interrupt state is restored on drop, after
    /// the lock is released.
    pub fn lock_irqsave(&self) -> TicketIrqGuard<'_, T> {
        let irq_was_enabled = crate::arch::save_and_disable_interrupts();
        let guard = self.lock();
        TicketIrqGuard {
            guard: core::mem::ManuallyDrop::new(guard),
            irq_was_enabled,
        }
    }

    /// Whether the lock is currently held. Diagnostic only: the answer
    /// is stale the instant it is produced.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != self.next.load(Ordering::Relaxed)
    }

    fn unlock(&self) {
        let t = self.owner.load(Ordering::Relaxed);
        self.owner.store(t.wrapping_add(1), Ordering::Release);
        crate::per_cpu::preempt_enable();
    }
}

/// RAII guard; releases the lock and re-enables preemption on drop.
pub struct TicketGuard<'a, T: ?Sized> {
    lock: &'a TicketLock<T>,
}

impl<T: ?Sized> Deref for TicketGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for TicketGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for TicketGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Guard from [`TicketLock::lock_irqsave`]. Drop order matters: release
/// the lock first, then restore the interrupt flag.
pub struct TicketIrqGuard<'a, T: ?Sized> {
    guard: core::mem::ManuallyDrop<TicketGuard<'a, T>>,
    irq_was_enabled: bool,
}

impl<T: ?Sized> Deref for TicketIrqGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for TicketIrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> Drop for TicketIrqGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { core::mem::ManuallyDrop::drop(&mut self.guard) };
        crate::arch::restore_interrupts(self.irq_was_enabled);
    }
}
