// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Synchronization primitives used at the boundary between the runtime and
//! the host stack: a writer-preference reader-writer lock, a re-entrant
//! reader-writer lock, a cancellation-safe async semaphore, and a
//! single-slot continuation wrapper that serializes request/response
//! exchanges with the host.

mod managed;
mod rwlock;
mod semaphore;

pub use managed::{AccessCancelled, ManagedAsynchronousAccess};
pub use rwlock::{RecursiveRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::AsyncSemaphore;
