// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Safe abstractions for synchronization primitives.
use core::fmt;
use core::ops::Deref;
use core::ops::DerefMut;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::TryLockError;

/// The single mutual-exclusion primitive of the engine.
///
/// We name it `KMutex` on purpose. All mutation of the NAT cache, the
/// temp buffer, the power-save set and the table binding happens
/// while holding one of these, so there is exactly one mutator at a
/// time. The event worker and the timestamp periodic share the same
/// instance.
///
/// A panic while holding the lock does not render the cache
/// unusable: the next locker observes whatever partial state the
/// panicking thread left, which is the same partial state a failed
/// driver call leaves behind. We therefore ignore poisoning.
pub struct KMutex<T> {
    inner: Mutex<T>,
}

pub struct KMutexGuard<'a, T: 'a> {
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

pub struct LockTaken;

impl<T: Default> Default for KMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for KMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KMutex").finish_non_exhaustive()
    }
}

impl<T> KMutex<T> {
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn new(val: T) -> Self {
        KMutex { inner: Mutex::new(val) }
    }

    /// Acquire the mutex guard to gain access to the underlying
    /// value. If the guard is currently held, then this call will
    /// block. The mutex is released when the guard is dropped.
    pub fn lock(&self) -> KMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }

    /// Try to acquire the guard without blocking.
    pub fn try_lock(&self) -> Result<KMutexGuard<'_, T>, LockTaken> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(KMutexGuard { guard }),
            Err(TryLockError::Poisoned(e)) => {
                Ok(KMutexGuard { guard: e.into_inner() })
            }
            Err(TryLockError::WouldBlock) => Err(LockTaken),
        }
    }
}
