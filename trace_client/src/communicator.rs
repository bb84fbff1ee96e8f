// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The daemon communicator: synchronous request/response primitives over
//! the service channel plus asynchronous daemon-death detection.
//!
//! # Connection state machine
//!
//! `Closed -> Opening -> Open(pid) -> Closed`, with an asynchronous
//! `Open -> Closed` arc taken when the detector observes the peer die.
//! Every request method requires `Open` and fails with `DaemonNotConnected`
//! otherwise. A send failure or timeout tears the connection down.
//!
//! # Death detection
//!
//! A detector thread blocks receiving pulses. Each successful connect
//! increments a generation counter and hands the detector a duplicate of
//! the connection descriptor; the detector polls it for hangup and
//! synthesises a peer-death pulse carrying the generation. Three outcomes
//! per received pulse:
//!
//! 1. stop code: the thread exits cleanly,
//! 2. peer death whose generation matches the open connection: the
//!    connection is invalidated and the subscribed termination callback
//!    runs (at most once per generation),
//! 3. anything else: ignored.

use log::*;

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use trace_protocol::channel::{
    pulse_channel, Pulse, PulseReceiver, PulseSender, ServiceChannel, PULSE_CODE_PEER_DEATH,
    PULSE_CODE_REARM, PULSE_CODE_STOP_THREAD,
};
use trace_protocol::{
    BindingType, ErrorCode, Request, Response, ShmObjectHandle, TraceClientId, TraceResult,
    APP_ID_WIRE_LEN,
};

/// Invoked once per detected daemon death.
pub type TerminationCallback = Arc<dyn Fn() + Send + Sync>;

/// Where the daemon relationship currently stands. Transitions happen only
/// inside the communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NeverConnected,
    Connected(i32),
    Disconnected,
}

/// The seam between the library and its daemon IPC; implemented by
/// [`DaemonCommunicator`] and by the test doubles in the test suites.
pub trait Communicator: Send + Sync {
    /// Open the service connection and handshake for the daemon's pid.
    fn connect(&self) -> TraceResult<()>;

    /// Drop the connection, if any.
    fn close(&self);

    fn is_connected(&self) -> bool;

    fn daemon_pid(&self) -> Option<i32>;

    /// Register a client under its binding and 8-byte app-id prefix.
    fn register_client(
        &self,
        binding: BindingType,
        app_id: [u8; APP_ID_WIRE_LEN],
    ) -> TraceResult<TraceClientId>;

    fn register_shm_object_fd(&self, fd: BorrowedFd) -> TraceResult<ShmObjectHandle>;

    fn register_shm_object_path(&self, path: &str) -> TraceResult<ShmObjectHandle>;

    fn unregister_shm_object(&self, handle: ShmObjectHandle) -> TraceResult<()>;

    /// Store (replacing any previous) the daemon-termination callback.
    fn subscribe_termination(&self, callback: TerminationCallback);
}

struct Connection {
    channel: Option<ServiceChannel>,
    generation: i32,
    daemon_pid: Option<i32>,
}

/// Update handed to the detector through the mailbox: a new descriptor to
/// monitor, or `None` to stop monitoring.
type MonitorUpdate = Option<(OwnedFd, i32)>;

struct Shared {
    connection: Mutex<Connection>,
    termination: Mutex<Option<TerminationCallback>>,
    mailbox: Mutex<Option<MonitorUpdate>>,
}

impl Shared {
    /// Invalidate the connection for `generation` and fire the termination
    /// callback. No-op for a stale generation.
    fn handle_peer_death(&self, generation: i32) {
        {
            let mut connection = self.connection.lock().unwrap();
            if connection.generation != generation {
                debug!("ignoring peer-death pulse for stale connection {generation}");
                return;
            }
            connection.channel = None;
            connection.daemon_pid = None;
        }
        warn!("trace daemon connection {generation} lost");

        let callback = self.termination.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

pub struct DaemonCommunicator {
    service_path: PathBuf,
    io_timeout: Duration,
    shared: Arc<Shared>,
    pulse_tx: Option<PulseSender>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonCommunicator {
    /// Allocate the pulse channel and start the detector. The communicator
    /// is usable even when arming fails; `connect` then reports
    /// `DaemonTerminationDetectionFailed`.
    pub fn new(service_path: PathBuf, io_timeout: Duration) -> Self {
        let shared = Arc::new(Shared {
            connection: Mutex::new(Connection {
                channel: None,
                generation: 0,
                daemon_pid: None,
            }),
            termination: Mutex::new(None),
            mailbox: Mutex::new(None),
        });

        let (pulse_tx, detector) = match pulse_channel() {
            Ok((tx, rx)) => {
                let thread_shared = shared.clone();
                let handle = std::thread::Builder::new()
                    .name("trace-daemon-detector".into())
                    .spawn(move || detector_loop(rx, thread_shared));
                match handle {
                    Ok(handle) => (Some(tx), Some(handle)),
                    Err(e) => {
                        error!("spawning daemon-death detector failed: {e}");
                        (None, None)
                    }
                }
            }
            Err(e) => {
                error!("allocating detector pulse channel failed: {e}");
                (None, None)
            }
        };

        Self {
            service_path,
            io_timeout,
            shared,
            pulse_tx,
            detector: Mutex::new(detector),
        }
    }

    fn rearm_detector(&self, update: MonitorUpdate) -> TraceResult<()> {
        let pulse_tx = self
            .pulse_tx
            .as_ref()
            .ok_or(ErrorCode::DaemonTerminationDetectionFailed)?;
        *self.shared.mailbox.lock().unwrap() = Some(update);
        pulse_tx
            .send_pulse(Pulse::new(PULSE_CODE_REARM, 0))
            .map_err(|_| ErrorCode::DaemonTerminationDetectionFailed)
    }

    pub fn connection_state(&self) -> ConnectionState {
        let connection = self.shared.connection.lock().unwrap();
        match (&connection.channel, connection.generation) {
            (Some(_), _) => ConnectionState::Connected(connection.daemon_pid.unwrap_or(0)),
            (None, 0) => ConnectionState::NeverConnected,
            (None, _) => ConnectionState::Disconnected,
        }
    }

    /// Issue one request under the connection lock; a failed send tears the
    /// connection down so the worker reconnects.
    fn request(&self, request: Request, shm_fd: Option<BorrowedFd>) -> TraceResult<Response> {
        let mut connection = self.shared.connection.lock().unwrap();
        let channel = connection
            .channel
            .as_mut()
            .ok_or(ErrorCode::DaemonNotConnected)?;

        match channel.send_request(&request, shm_fd) {
            Ok(response) => Ok(response),
            Err(ErrorCode::MessageSendFailed) => {
                debug!("send failed; closing daemon connection");
                connection.channel = None;
                connection.daemon_pid = None;
                Err(ErrorCode::MessageSendFailed)
            }
            // Daemon-originated error codes pass through untouched.
            Err(e) => Err(e),
        }
    }
}

impl Communicator for DaemonCommunicator {
    fn connect(&self) -> TraceResult<()> {
        if self.pulse_tx.is_none() {
            return Err(ErrorCode::DaemonTerminationDetectionFailed);
        }

        let mut connection = self.shared.connection.lock().unwrap();
        if connection.channel.is_some() {
            return Ok(());
        }

        let mut channel = ServiceChannel::open(&self.service_path, self.io_timeout)?;

        let response = channel.send_request(&Request::DaemonProcessId, None)?;
        let daemon_pid = match response {
            Response::DaemonProcessId { daemon_process_id } => daemon_process_id,
            other => {
                debug!("unexpected handshake response: {other:?}");
                return Err(ErrorCode::GenericError);
            }
        };

        let generation = connection.generation + 1;
        let monitor = channel
            .dup_monitor_fd()
            .map_err(|_| ErrorCode::DaemonTerminationDetectionFailed)?;
        self.rearm_detector(Some((monitor, generation)))?;

        connection.generation = generation;
        connection.channel = Some(channel);
        connection.daemon_pid = Some(daemon_pid);
        info!("connected to trace daemon (pid {daemon_pid}, connection {generation})");
        Ok(())
    }

    fn close(&self) {
        let mut connection = self.shared.connection.lock().unwrap();
        connection.channel = None;
        connection.daemon_pid = None;
        drop(connection);
        let _ = self.rearm_detector(None);
    }

    fn is_connected(&self) -> bool {
        self.shared.connection.lock().unwrap().channel.is_some()
    }

    fn daemon_pid(&self) -> Option<i32> {
        self.shared.connection.lock().unwrap().daemon_pid
    }

    fn register_client(
        &self,
        binding: BindingType,
        app_id: [u8; APP_ID_WIRE_LEN],
    ) -> TraceResult<TraceClientId> {
        if binding == BindingType::Undefined {
            return Err(ErrorCode::InvalidBindingType);
        }

        let response = self.request(Request::RegisterClient { binding, app_id }, None)?;
        match response {
            Response::RegisterClient { trace_client_id } if trace_client_id != 0 => {
                Ok(trace_client_id)
            }
            other => {
                debug!("unexpected register-client response: {other:?}");
                Err(ErrorCode::GenericError)
            }
        }
    }

    fn register_shm_object_fd(&self, fd: BorrowedFd) -> TraceResult<ShmObjectHandle> {
        let response = self.request(Request::register_shm_fd(), Some(fd))?;
        map_register_shm_response(response)
    }

    fn register_shm_object_path(&self, path: &str) -> TraceResult<ShmObjectHandle> {
        let request =
            Request::register_shm_path(path).map_err(|_| ErrorCode::InvalidArgument)?;
        let response = self.request(request, None)?;
        map_register_shm_response(response)
    }

    fn unregister_shm_object(&self, handle: ShmObjectHandle) -> TraceResult<()> {
        let response = self.request(Request::UnregisterShm { handle }, None)?;
        match response {
            Response::UnregisterShm {
                is_unregister_successful: true,
            } => Ok(()),
            Response::UnregisterShm {
                is_unregister_successful: false,
            } => Err(ErrorCode::SharedMemoryObjectUnregisterFailed),
            other => {
                debug!("unexpected unregister response: {other:?}");
                Err(ErrorCode::GenericError)
            }
        }
    }

    fn subscribe_termination(&self, callback: TerminationCallback) {
        *self.shared.termination.lock().unwrap() = Some(callback);
    }
}

impl Drop for DaemonCommunicator {
    fn drop(&mut self) {
        if let Some(pulse_tx) = &self.pulse_tx {
            let _ = pulse_tx.send_pulse(Pulse::new(PULSE_CODE_STOP_THREAD, 0));
        }
        if let Some(handle) = self.detector.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn map_register_shm_response(response: Response) -> TraceResult<ShmObjectHandle> {
    match response {
        Response::RegisterShm { shm_object_index } => {
            if shm_object_index < 0 {
                Err(ErrorCode::SharedMemoryObjectHandleCreationFailed)
            } else {
                Ok(shm_object_index)
            }
        }
        other => {
            debug!("unexpected register-shm response: {other:?}");
            Err(ErrorCode::GenericError)
        }
    }
}

fn detector_loop(pulses: PulseReceiver, shared: Arc<Shared>) {
    let mut monitor: MonitorUpdate = None;

    loop {
        let hangup = PollFlags::POLLHUP | PollFlags::POLLERR;
        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(pulses.as_fd(), PollFlags::POLLIN));
        if let Some((fd, _)) = &monitor {
            fds.push(PollFd::new(fd.as_fd(), hangup));
        }

        if let Err(e) = poll(&mut fds, PollTimeout::NONE) {
            if e == nix::errno::Errno::EINTR {
                continue;
            }
            error!("daemon-death detector poll failed: {e}");
            return;
        }

        let pulse_ready = fds[0]
            .revents()
            .is_some_and(|revents| revents.intersects(PollFlags::POLLIN));
        let monitor_dead = fds
            .get(1)
            .and_then(PollFd::revents)
            .is_some_and(|revents| revents.intersects(hangup));
        drop(fds);

        // A monitored hangup becomes the peer-death pulse a kernel with
        // native connection-death notification would have delivered.
        let pulse = if pulse_ready {
            match pulses.receive_pulse() {
                Ok(pulse) => pulse,
                Err(e) => {
                    error!("detector pulse receive failed: {e}");
                    return;
                }
            }
        } else if monitor_dead {
            let (_, generation) = monitor.take().unwrap();
            Pulse::new(PULSE_CODE_PEER_DEATH, generation)
        } else {
            continue;
        };

        match pulse.code {
            PULSE_CODE_STOP_THREAD => {
                trace!("detector stopping");
                return;
            }
            PULSE_CODE_REARM => {
                if let Some(update) = shared.mailbox.lock().unwrap().take() {
                    monitor = update;
                }
            }
            PULSE_CODE_PEER_DEATH => {
                shared.handle_peer_death(pulse.value);
            }
            code => {
                debug!("unexpected pulse code {code} ignored");
            }
        }
    }
}
