// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Synchronization primitives with acquisition counters.
//!
//! The builder's locking discipline is part of its contract: a zone
//! reload acquires the client-list map mutex exactly twice, a reload
//! against a disabled cache exactly once, and so on. [`TrackedMutex`]
//! and [`TrackedCondvar`] wrap the standard primitives and count
//! acquisitions, releases, and waits so that the discipline is
//! observable. The counters are relaxed atomics; they impose no
//! ordering of their own.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

/// A [`Mutex`] that counts how many times it has been locked and
/// unlocked.
///
/// Like the rest of the crate, lock poisoning is treated as fatal: a
/// panic while holding a lock means shared state may be inconsistent,
/// and the panicking thread is already on its way to taking the
/// process down.
#[derive(Debug, Default)]
pub struct TrackedMutex<T> {
    inner: Mutex<T>,
    locks: AtomicUsize,
    unlocks: AtomicUsize,
}

impl<T> TrackedMutex<T> {
    /// Creates a new `TrackedMutex` holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            locks: AtomicUsize::new(0),
            unlocks: AtomicUsize::new(0),
        }
    }

    /// Acquires the mutex, blocking until it is available.
    pub fn lock(&self) -> TrackedGuard<'_, T> {
        let guard = self.inner.lock().unwrap();
        self.locks.fetch_add(1, Ordering::Relaxed);
        TrackedGuard {
            owner: self,
            guard: Some(guard),
        }
    }

    /// Returns how many times the mutex has been acquired.
    pub fn lock_count(&self) -> usize {
        self.locks.load(Ordering::Relaxed)
    }

    /// Returns how many times the mutex has been released.
    pub fn unlock_count(&self) -> usize {
        self.unlocks.load(Ordering::Relaxed)
    }
}

/// The guard returned by [`TrackedMutex::lock`].
pub struct TrackedGuard<'a, T> {
    owner: &'a TrackedMutex<T>,
    /// Always `Some` except transiently inside [`TrackedCondvar::wait`]
    /// and in `drop`.
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for TrackedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for TrackedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for TrackedGuard<'_, T> {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            self.owner.unlocks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A [`Condvar`] for use with [`TrackedMutex`] that counts waits.
///
/// A wait releases and reacquires the associated mutex, and the
/// mutex's counters reflect that: one wait adds one unlock and one
/// lock.
#[derive(Debug, Default)]
pub struct TrackedCondvar {
    inner: Condvar,
    waits: AtomicUsize,
}

impl TrackedCondvar {
    /// Creates a new `TrackedCondvar`.
    pub fn new() -> Self {
        Self {
            inner: Condvar::new(),
            waits: AtomicUsize::new(0),
        }
    }

    /// Blocks until another thread notifies the condition variable,
    /// releasing the guarded mutex for the duration of the wait.
    pub fn wait<'a, T>(&self, mut guard: TrackedGuard<'a, T>) -> TrackedGuard<'a, T> {
        self.waits.fetch_add(1, Ordering::Relaxed);
        let owner = guard.owner;
        let inner = guard.guard.take().unwrap();
        owner.unlocks.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.wait(inner).unwrap();
        owner.locks.fetch_add(1, Ordering::Relaxed);
        TrackedGuard {
            owner,
            guard: Some(inner),
        }
    }

    /// Wakes up one waiting thread.
    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    /// Wakes up all waiting threads.
    pub fn notify_all(&self) {
        self.inner.notify_all();
    }

    /// Returns how many times a thread has waited on this condition
    /// variable.
    pub fn wait_count(&self) -> usize {
        self.waits.load(Ordering::Relaxed)
    }
}
