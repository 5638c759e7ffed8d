// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::AsyncSemaphore;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// The continuation of a [`ManagedAsynchronousAccess::perform`] call was
/// abandoned before a result arrived, typically because the access was shut
/// down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCancelled;

impl From<AccessCancelled> for crate::Error {
    fn from(_: AccessCancelled) -> Self {
        crate::Error::Cancelled
    }
}

/// Serialized request/response access to a callback-based resource.
///
/// A caller `perform`s an action that submits a request to the host stack;
/// the delegate event that carries the outcome later `resume`s the stored
/// continuation. The embedded semaphore admits one caller at a time, so
/// there is never more than one outstanding continuation.
#[derive(Debug)]
pub struct ManagedAsynchronousAccess<T, E> {
    access: AsyncSemaphore,
    continuation: Mutex<Option<oneshot::Sender<Result<T, E>>>>,
}

impl<T, E> Default for ManagedAsynchronousAccess<T, E>
where
    E: From<AccessCancelled>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> ManagedAsynchronousAccess<T, E>
where
    E: From<AccessCancelled>,
{
    pub fn new() -> Self {
        ManagedAsynchronousAccess {
            access: AsyncSemaphore::new(1),
            continuation: Mutex::new(None),
        }
    }

    /// Whether a continuation is currently parked.
    pub fn is_pending(&self) -> bool {
        self.continuation.lock().unwrap().is_some()
    }

    /// Waits for exclusive access, runs `action` to submit the request, and
    /// parks until [`resume`](Self::resume) or
    /// [`cancel_all`](Self::cancel_all) completes the exchange. An error from
    /// `action` aborts the exchange and surfaces directly. Cancellation-safe:
    /// dropping the returned future releases the access and discards the
    /// parked continuation.
    pub async fn perform<F>(&self, action: F) -> Result<T, E>
    where
        F: Future<Output = Result<(), E>>,
    {
        self.access.wait().await;
        let guard = AccessGuard { owner: self };

        let (tx, rx) = oneshot::channel();
        *self.continuation.lock().unwrap() = Some(tx);

        if let Err(error) = action.await {
            guard.release_now();
            return Err(error);
        }

        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(AccessCancelled.into()),
        };
        guard.release_now();
        result
    }

    /// Completes the parked continuation, if any. Returns whether one was
    /// present.
    pub fn resume(&self, result: Result<T, E>) -> bool {
        match self.continuation.lock().unwrap().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fails the parked continuation with `error`. Queued callers that have
    /// not yet submitted their action are unaffected.
    pub fn cancel_all(&self, error: E) {
        if let Some(tx) = self.continuation.lock().unwrap().take() {
            let _ = tx.send(Err(error));
        }
    }
}

struct AccessGuard<'a, T, E> {
    owner: &'a ManagedAsynchronousAccess<T, E>,
}

impl<T, E> AccessGuard<'_, T, E> {
    fn release_now(self) {
        // Drop runs the release.
    }
}

impl<T, E> Drop for AccessGuard<'_, T, E> {
    fn drop(&mut self) {
        *self.owner.continuation.lock().unwrap() = None;
        self.owner.access.signal();
    }
}
