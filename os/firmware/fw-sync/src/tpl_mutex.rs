use crate::tpl::{Tpl, raise_tpl, restore_tpl};
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Mutual exclusion by raising the task priority level.
///
/// On a single processor a held lock can only be observed by code that
/// interrupted the owner, so a second acquisition is always re-entrancy
/// and [`lock`](Self::lock) panics with the lock's name instead of
/// deadlocking.
pub struct TplMutex<T> {
    tpl: Tpl,
    name: &'static str,
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `held`.
unsafe impl<T: Send> Sync for TplMutex<T> {}
unsafe impl<T: Send> Send for TplMutex<T> {}

impl<T> TplMutex<T> {
    /// Creates a lock that raises to `tpl` while held.
    pub const fn new(tpl: Tpl, name: &'static str, value: T) -> Self {
        Self {
            tpl,
            name,
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    #[must_use]
    pub const fn tpl(&self) -> Tpl {
        self.tpl
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Raises the level and takes the lock.
    ///
    /// # Panics
    /// Panics when the lock is already held.
    #[must_use]
    pub fn lock(&self) -> TplMutexGuard<'_, T> {
        match self.try_lock() {
            Some(guard) => guard,
            None => panic!("lock {} re-entered", self.name),
        }
    }

    /// Takes the lock unless it is held. The level is left untouched on
    /// failure.
    #[must_use]
    pub fn try_lock(&self) -> Option<TplMutexGuard<'_, T>> {
        let saved = raise_tpl(self.tpl);
        if self.held.swap(true, Ordering::Acquire) {
            restore_tpl(saved);
            return None;
        }
        Some(TplMutexGuard { lock: self, saved })
    }

    /// Runs `f` with the lock held and releases it afterwards, also on unwind.
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        f(&mut self.lock())
    }

    #[must_use]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T> fmt::Debug for TplMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TplMutex")
            .field("name", &self.name)
            .field("tpl", &self.tpl)
            .field("held", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Access to the value of a held [`TplMutex`]. Dropping it releases the
/// lock and restores the level that was current before.
#[must_use = "the lock is released when the guard drops"]
pub struct TplMutexGuard<'a, T> {
    lock: &'a TplMutex<T>,
    saved: Tpl,
}

impl<T> TplMutexGuard<'_, T> {
    /// The level that is restored on release.
    #[must_use]
    pub const fn saved_tpl(&self) -> Tpl {
        self.saved
    }
}

impl<T> Deref for TplMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for TplMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for TplMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
        restore_tpl(self.saved);
    }
}
