// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Cooperative stop token threaded through the facade, the background
//! worker, and the daemon communicator. Stop is requested exactly once (by
//! the facade's drop) and observed at natural suspension points.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct StopShared {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

/// The requesting side.
pub struct StopSource {
    shared: Arc<StopShared>,
}

/// The observing side; cheap to clone into every thread that must wind down.
#[derive(Clone)]
pub struct StopToken {
    shared: Arc<StopShared>,
}

impl StopSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(StopShared {
                stopped: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            shared: self.shared.clone(),
        }
    }

    pub fn request_stop(&self) {
        *self.shared.stopped.lock().unwrap() = true;
        self.shared.condvar.notify_all();
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    pub fn stop_requested(&self) -> bool {
        *self.shared.stopped.lock().unwrap()
    }

    /// Sleep until `timeout` elapses or stop is requested, whichever comes
    /// first. Returns true when stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.shared.stopped.lock().unwrap();
        let (guard, _) = self
            .shared
            .condvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap();
        *guard
    }
}
