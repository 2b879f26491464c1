//! Sleepable locks
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::proc::{WaitChannel, Waitable};
use crate::spinlock::RawSpinlock;

/// A spinlock paired with a wait channel so that a holder can block until
/// the protected value changes. The tick counter lives behind one of these.
pub struct Sleepablelock<T> {
    lock: RawSpinlock,
    /// WaitChannel saying the value has changed.
    waitchannel: WaitChannel,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes access to the inner data.
unsafe impl<T: Send> Sync for Sleepablelock<T> {}

pub struct SleepablelockGuard<'s, T> {
    lock: &'s Sleepablelock<T>,
    _marker: PhantomData<*const ()>,
}

// Do not implement Send; the lock must be released by the CPU that
// acquired it.
unsafe impl<'s, T: Sync> Sync for SleepablelockGuard<'s, T> {}

impl<T> Sleepablelock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepablelockGuard<'_, T> {
        self.lock.acquire();
        SleepablelockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns a mutable pointer to the inner data. The caller must ensure
    /// that accessing the pointer does not incur a race; unlocked readers
    /// must tolerate torn values.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically release the lock and sleep until `wakeup`; the lock is
    /// held again on return.
    pub fn sleep(&mut self) {
        self.lock.waitchannel.sleep(self);
    }

    /// Wake everyone sleeping on this lock's channel.
    pub fn wakeup(&self) {
        self.lock.waitchannel.wakeup();
    }
}

impl<T> Waitable for SleepablelockGuard<'_, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<T> Drop for SleepablelockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SleepablelockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepablelockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}
