// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Scope-guarded callbacks.
//!
//! A [`Scope`] is a lifetime token; callbacks bound to it stop firing the
//! moment it expires. Invocation takes the expiry flag's read lock, expiry
//! takes the write lock, so once [`Scope::expire`] returns no invocation is
//! in flight anywhere and none will start. The owner of the callback target
//! drops its scope first and can then tear the target down safely.

use std::sync::{Arc, RwLock};

use trace_protocol::TraceContextId;

struct ScopeState {
    expired: RwLock<bool>,
}

/// Lifetime token owned by whoever provides a callback. Expires on drop.
pub struct Scope {
    state: Arc<ScopeState>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ScopeState {
                expired: RwLock::new(false),
            }),
        }
    }

    /// Invalidate every callback bound to this scope. Blocks until in-flight
    /// invocations have finished.
    pub fn expire(&self) {
        *self.state.expired.write().unwrap() = true;
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.expire();
    }
}

/// A callable bound to a [`Scope`]. Clones share the scope and the callable.
pub struct ScopedCallback<Arg> {
    state: Arc<ScopeState>,
    callable: Arc<dyn Fn(Arg) + Send + Sync>,
}

impl<Arg> Clone for ScopedCallback<Arg> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            callable: self.callable.clone(),
        }
    }
}

impl<Arg> ScopedCallback<Arg> {
    pub fn new(scope: &Scope, callable: impl Fn(Arg) + Send + Sync + 'static) -> Self {
        Self {
            state: scope.state.clone(),
            callable: Arc::new(callable),
        }
    }

    /// Call the target unless the scope has expired. Returns whether the
    /// call happened.
    pub fn invoke(&self, arg: Arg) -> bool {
        let expired = self.state.expired.read().unwrap();
        if *expired {
            return false;
        }
        (self.callable)(arg);
        true
    }

    pub fn is_expired(&self) -> bool {
        *self.state.expired.read().unwrap()
    }
}

/// Callback invoked once per completed trace job, with the job's context id.
pub type TraceDoneCallback = ScopedCallback<TraceContextId>;
