// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// A counting semaphore for async tasks.
///
/// Waiters queue in FIFO order. Cancellation is handled through drop: a
/// `wait()` future that is dropped removes its queue entry atomically, and a
/// permit that was already handed to a dropped waiter is passed on to the
/// next one.
#[derive(Debug)]
pub struct AsyncSemaphore {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    permits: usize,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

impl AsyncSemaphore {
    pub fn new(permits: usize) -> Self {
        AsyncSemaphore {
            state: Mutex::new(State {
                permits,
                next_waiter_id: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Takes a permit immediately if one is available.
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Waits for a permit. Safe to cancel at any point: dropping the future
    /// either removes the queued waiter or, if the permit was already handed
    /// over, forwards it to the next waiter.
    pub async fn wait(&self) {
        let (id, rx) = {
            let mut state = self.state.lock().unwrap();
            if state.permits > 0 {
                state.permits -= 1;
                return;
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        let mut guard = WaitGuard {
            semaphore: self,
            id,
            armed: true,
        };
        // The sender is never dropped without a signal while queued, so an
        // Err here means the entry was already consumed; either way the
        // guard is disarmed only on successful receipt.
        if rx.await.is_ok() {
            guard.armed = false;
        }
    }

    /// Returns one permit, waking the longest-waiting task if any.
    pub fn signal(&self) {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            match state.waiters.pop_front() {
                Some(waiter) => waiter,
                None => {
                    state.permits += 1;
                    return;
                }
            }
        };
        // If the receiver was dropped in the meantime its guard will see the
        // missing queue entry and forward the permit.
        let _ = waiter.tx.send(());
    }

    /// Wakes every queued waiter at once without touching the permit count.
    /// Used for level-style ready signals where all parked callers should
    /// resume together.
    pub fn signal_all(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.tx.send(());
        }
    }
}

struct WaitGuard<'a> {
    semaphore: &'a AsyncSemaphore,
    id: u64,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.semaphore.state.lock().unwrap();
        if let Some(position) = self.semaphore_position(&state) {
            state.waiters.remove(position);
        } else {
            // the permit was already handed to us; pass it on
            drop(state);
            self.semaphore.signal();
        }
    }
}

impl WaitGuard<'_> {
    fn semaphore_position(&self, state: &State) -> Option<usize> {
        state.waiters.iter().position(|waiter| waiter.id == self.id)
    }
}
