// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

/// A reader-writer lock with writer preference: once a writer is waiting,
/// newly arriving readers queue behind it, so a steady stream of readers
/// cannot starve writers.
///
/// Used for composite observable state read off the runtime's executor;
/// critical sections are short and never await.
#[derive(Debug, Default)]
pub struct RwLock<T> {
    state: Mutex<LockState>,
    readers: Condvar,
    writers: Condvar,
    value: UnsafeCell<T>,
}

#[derive(Debug, Default)]
struct LockState {
    active_readers: usize,
    active_writer: bool,
    waiting_writers: usize,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        RwLock {
            state: Mutex::new(LockState::default()),
            readers: Condvar::new(),
            writers: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires shared access. Blocks while a writer is active or waiting.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while state.active_writer || state.waiting_writers > 0 {
            state = self.readers.wait(state).unwrap();
        }
        state.active_readers += 1;
        RwLockReadGuard { lock: self }
    }

    /// Acquires exclusive access. Blocks until all readers have drained.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        state.waiting_writers += 1;
        while state.active_writer || state.active_readers > 0 {
            state = self.writers.wait(state).unwrap();
        }
        state.waiting_writers -= 1;
        state.active_writer = true;
        RwLockWriteGuard { lock: self }
    }
}

pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.active_readers -= 1;
        if state.active_readers == 0 {
            self.lock.writers.notify_one();
        }
    }
}

pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.active_writer = false;
        if state.waiting_writers > 0 {
            self.lock.writers.notify_one();
        } else {
            self.lock.readers.notify_all();
        }
    }
}

/// A re-entrant reader-writer lock. The primitive carries no payload; it
/// serializes critical sections over state that lives elsewhere (typically a
/// concurrent map that is itself safe to mutate, where the lock provides
/// ordering between dispatch and registration).
///
/// Re-entrancy is keyed by thread identity: the holding thread may take the
/// lock again in read mode, including while it holds the write lock. A
/// reader attempting to upgrade to a write lock panics; grant order would be
/// undefined.
#[derive(Debug, Default)]
pub struct RecursiveRwLock {
    state: Mutex<RecursiveState>,
    readers: Condvar,
    writers: Condvar,
}

#[derive(Debug, Default)]
struct RecursiveState {
    // per-thread read re-entry counts
    readers: HashMap<ThreadId, usize>,
    writer: Option<(ThreadId, usize)>,
    waiting_writers: usize,
}

impl RecursiveState {
    fn write_held_by(&self, id: ThreadId) -> bool {
        matches!(self.writer, Some((holder, _)) if holder == id)
    }

    fn write_held_by_other(&self, id: ThreadId) -> bool {
        matches!(self.writer, Some((holder, _)) if holder != id)
    }
}

impl RecursiveRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires shared access. Re-entrant for the holding thread in either
    /// mode.
    pub fn read(&self) -> RecursiveReadGuard<'_> {
        let id = thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.write_held_by(id) || state.readers.contains_key(&id) {
            *state.readers.entry(id).or_insert(0) += 1;
            return RecursiveReadGuard { lock: self };
        }
        while state.write_held_by_other(id) || state.waiting_writers > 0 {
            state = self.readers.wait(state).unwrap();
        }
        *state.readers.entry(id).or_insert(0) += 1;
        RecursiveReadGuard { lock: self }
    }

    /// Acquires exclusive access. Re-entrant for the holding writer.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds a read lock: read locks cannot be
    /// upgraded.
    pub fn write(&self) -> RecursiveWriteGuard<'_> {
        let id = thread::current().id();
        let mut state = self.state.lock().unwrap();
        if let Some((holder, count)) = &mut state.writer {
            if *holder == id {
                *count += 1;
                return RecursiveWriteGuard { lock: self };
            }
        }
        assert!(
            !state.readers.contains_key(&id),
            "a read lock cannot be upgraded to a write lock"
        );
        state.waiting_writers += 1;
        while state.writer.is_some() || !state.readers.is_empty() {
            state = self.writers.wait(state).unwrap();
        }
        state.waiting_writers -= 1;
        state.writer = Some((id, 1));
        RecursiveWriteGuard { lock: self }
    }
}

pub struct RecursiveReadGuard<'a> {
    lock: &'a RecursiveRwLock,
}

impl Drop for RecursiveReadGuard<'_> {
    fn drop(&mut self) {
        let id = thread::current().id();
        let mut state = self.lock.state.lock().unwrap();
        let count = state
            .readers
            .get_mut(&id)
            .expect("read guard dropped on a thread that holds no read lock");
        *count -= 1;
        if *count == 0 {
            state.readers.remove(&id);
        }
        if state.readers.is_empty() && state.writer.is_none() {
            self.lock.writers.notify_one();
        }
    }
}

pub struct RecursiveWriteGuard<'a> {
    lock: &'a RecursiveRwLock,
}

impl Drop for RecursiveWriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        let (_, count) = state
            .writer
            .as_mut()
            .expect("write guard dropped without a writer");
        *count -= 1;
        if *count == 0 {
            state.writer = None;
            if state.waiting_writers > 0 {
                self.lock.writers.notify_one();
            } else {
                self.lock.readers.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn readers_share_writers_exclude() {
        let lock = Arc::new(RwLock::new(0u32));
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1, 0);
        assert_eq!(*r2, 0);
        drop((r1, r2));

        {
            let mut w = lock.write();
            *w = 7;
        }
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn writer_excludes_readers_across_threads() {
        let lock = Arc::new(RwLock::new(0u32));
        let observed = Arc::new(AtomicUsize::new(0));

        let guard = lock.write();
        let reader = {
            let lock = Arc::clone(&lock);
            let observed = Arc::clone(&observed);
            thread::spawn(move || {
                let value = lock.read();
                observed.store(*value as usize, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        // the reader must not have observed anything yet
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        drop(guard);
        reader.join().unwrap();
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let lock = Arc::new(RwLock::new(0u32));
        let reader = lock.read();

        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let mut w = lock.write();
                *w += 1;
            })
        };
        // give the writer time to queue
        thread::sleep(Duration::from_millis(50));

        let late_reader = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || *lock.read())
        };
        drop(reader);
        writer.join().unwrap();
        // the late reader sees the writer's update, not the initial value
        assert_eq!(late_reader.join().unwrap(), 1);
    }

    #[test]
    fn recursive_read_reentry() {
        let lock = RecursiveRwLock::new();
        let outer = lock.read();
        let inner = lock.read();
        drop(inner);
        drop(outer);
        let _w = lock.write();
    }

    #[test]
    fn writer_may_take_read_lock() {
        let lock = RecursiveRwLock::new();
        let write = lock.write();
        let read = lock.read();
        drop(read);
        drop(write);
    }

    #[test]
    fn writer_reentry() {
        let lock = RecursiveRwLock::new();
        let outer = lock.write();
        let inner = lock.write();
        drop(inner);
        drop(outer);
    }

    #[test]
    #[should_panic(expected = "cannot be upgraded")]
    fn read_to_write_upgrade_panics() {
        let lock = RecursiveRwLock::new();
        let _read = lock.read();
        let _write = lock.write();
    }
}
