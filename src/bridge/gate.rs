// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lock/wait/signal gate shared between the host and the worker thread.
//!
//! The worker holds the gate lock while it submits requests and while it
//! dispatches server callbacks, so every completion and every lifecycle
//! change is published under the lock. A host thread that checks its
//! predicate under the same lock and then waits can therefore never miss
//! the wakeup.

use crate::server::{Reply, ServerError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of the worker and its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unstarted,
    Connecting,
    Ready,
    Failed,
    Terminated,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// State guarded by the gate lock. Written only by the worker thread.
#[derive(Debug)]
pub(crate) struct GateState {
    pub lifecycle: LifecycleState,
    /// Why the connection failed, if it did.
    pub failure: Option<String>,
}

pub(crate) struct OperationGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl OperationGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                lifecycle: LifecycleState::Connecting,
                failure: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock()
    }

    /// Wake every waiter. Waiters re-check their predicate.
    pub fn signal(&self) {
        self.cond.notify_all();
    }

    /// Block until `poll` yields a value or `deadline` passes.
    ///
    /// `poll` runs under the gate lock, once before the first wait and after
    /// every wakeup. Returns `None` only on timeout.
    pub fn wait_for<R>(
        &self,
        deadline: Option<Instant>,
        mut poll: impl FnMut(&GateState) -> Option<R>,
    ) -> Option<R> {
        let mut guard = self.state.lock();
        loop {
            if let Some(ready) = poll(&guard) {
                return Some(ready);
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        return poll(&guard);
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }
    }
}

type Slot<T> = Arc<Mutex<Option<Result<T, ServerError>>>>;

/// Waiting side of one in-flight request.
pub(crate) struct PendingOperation<T> {
    slot: Slot<T>,
}

impl<T> PendingOperation<T> {
    pub fn new(gate: &Arc<OperationGate>) -> (Self, Completion<T>) {
        let slot: Slot<T> = Arc::new(Mutex::new(None));
        let completion = Completion {
            slot: Some(Arc::clone(&slot)),
            gate: Arc::clone(gate),
        };
        (Self { slot }, completion)
    }

    /// Take the result if the request has completed.
    pub fn take(&self) -> Option<Result<T, ServerError>> {
        self.slot.lock().take()
    }
}

/// Completing side of one in-flight request.
///
/// Dropping it without calling [`Completion::complete`] completes the request
/// with [`ServerError::Cancelled`], so a server that discards a request can
/// never leave the waiter blocked.
pub(crate) struct Completion<T> {
    slot: Option<Slot<T>>,
    gate: Arc<OperationGate>,
}

impl<T> Completion<T> {
    pub fn complete(mut self, result: Result<T, ServerError>) {
        self.publish(result);
    }

    fn publish(&mut self, result: Result<T, ServerError>) {
        if let Some(slot) = self.slot.take() {
            *slot.lock() = Some(result);
            self.gate.signal();
        }
    }
}

impl<T: 'static> Completion<T> {
    pub fn into_reply(self) -> Reply<T> {
        Box::new(move |result| self.complete(result))
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.publish(Err(ServerError::Cancelled));
    }
}
