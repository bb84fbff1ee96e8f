// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The IPC channel between the library and the trace daemon.
//!
//! The daemon publishes its service as a Unix-domain socket path;
//! [`ServiceChannel::open`] is the "name open" step. Each request is one
//! fixed-size record sent with a scatter-gather `sendmsg` and answered by
//! one fixed-size response record. Registering a shared-memory object by
//! file descriptor attaches the descriptor as `SCM_RIGHTS` ancillary data.
//!
//! Asynchronous notifications (detector shutdown, synthesised peer-death)
//! are [`Pulse`]s: small fixed-size datagrams over a `socketpair`, distinct
//! from the request/response stream.

use log::*;

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr,
};

use crate::error::{ErrorCode, TraceResult};
use crate::wire::{Request, Response, REQUEST_WIRE_LEN, RESPONSE_WIRE_LEN};

/// Pulse code the owner sends to shut the detector thread down.
pub const PULSE_CODE_STOP_THREAD: i8 = 100;

/// Pulse code used to re-arm the detector after the monitored connection
/// changed.
pub const PULSE_CODE_REARM: i8 = 101;

/// Pulse code for "the peer of connection `value` died". Kernel-originated
/// on systems with native connection-death pulses; synthesised by the
/// detector from a hangup on this target. Negative like all
/// system-originated codes.
pub const PULSE_CODE_PEER_DEATH: i8 = -2;

const PULSE_WIRE_LEN: usize = 5;

/// A small fixed-size asynchronous notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub code: i8,
    /// Payload; for peer-death pulses, the connection generation that died.
    pub value: i32,
}

impl Pulse {
    pub fn new(code: i8, value: i32) -> Self {
        Self { code, value }
    }

    fn encode(&self) -> [u8; PULSE_WIRE_LEN] {
        let mut buf = [0u8; PULSE_WIRE_LEN];
        buf[0] = self.code as u8;
        buf[1..5].copy_from_slice(&self.value.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8; PULSE_WIRE_LEN]) -> Self {
        Self {
            code: buf[0] as i8,
            value: i32::from_be_bytes(buf[1..5].try_into().unwrap()),
        }
    }
}

/// Sending half of a pulse channel. Cloneable so both the facade and the
/// communicator can signal the same detector.
pub struct PulseSender {
    fd: OwnedFd,
}

impl PulseSender {
    pub fn send_pulse(&self, pulse: Pulse) -> std::io::Result<()> {
        let buf = pulse.encode();
        nix::unistd::write(&self.fd, &buf)?;
        Ok(())
    }

    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }
}

/// Receiving half of a pulse channel; blocking receive plus a pollable fd.
pub struct PulseReceiver {
    fd: OwnedFd,
}

impl PulseReceiver {
    /// Blocks until the next pulse arrives.
    pub fn receive_pulse(&self) -> std::io::Result<Pulse> {
        let mut buf = [0u8; PULSE_WIRE_LEN];
        let n = nix::unistd::read(&self.fd, &mut buf)?;
        if n < PULSE_WIRE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short pulse",
            ));
        }
        Ok(Pulse::decode(&buf))
    }
}

impl AsFd for PulseReceiver {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Allocate a pulse channel. Datagram socketpair so pulses stay framed.
pub fn pulse_channel() -> std::io::Result<(PulseSender, PulseReceiver)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::empty(),
    )?;
    Ok((PulseSender { fd: a }, PulseReceiver { fd: b }))
}

/// A connected request/response channel to the daemon.
///
/// Not internally synchronised; callers serialise request sequences
/// themselves (the daemon communicator holds it behind a mutex).
pub struct ServiceChannel {
    stream: UnixStream,
}

impl ServiceChannel {
    /// Resolve the daemon's published service name and connect, arming the
    /// per-call send/receive timeout on the connection.
    pub fn open(service_path: &Path, io_timeout: Duration) -> TraceResult<Self> {
        let stream = UnixStream::connect(service_path).map_err(|e| {
            debug!("opening daemon service {service_path:?} failed: {e}");
            ErrorCode::ServerConnectionNameOpenFailed
        })?;

        stream
            .set_read_timeout(Some(io_timeout))
            .and_then(|()| stream.set_write_timeout(Some(io_timeout)))
            .map_err(|e| {
                warn!("arming channel timeout failed: {e}");
                ErrorCode::ServerConnectionNameOpenFailed
            })?;

        Ok(Self { stream })
    }

    /// Issue one request and block (bounded by the channel timeout) for its
    /// response. A daemon-side error response is returned as that error.
    ///
    /// `shm_fd`, when given, is attached to the request as `SCM_RIGHTS`
    /// ancillary data.
    pub fn send_request(
        &mut self,
        request: &Request,
        shm_fd: Option<BorrowedFd>,
    ) -> TraceResult<Response> {
        let buf = request.serialize_alloc();

        let sent = match shm_fd {
            Some(fd) => {
                let fds = [fd.as_raw_fd()];
                let cmsg = [ControlMessage::ScmRights(&fds)];
                let iov = [IoSlice::new(&buf)];
                sendmsg(
                    self.stream.as_raw_fd(),
                    &iov,
                    &cmsg,
                    MsgFlags::empty(),
                    None::<&UnixAddr>,
                )
                .map_err(std::io::Error::from)
            }
            None => self.stream.write_all(&buf).map(|()| buf.len()),
        };
        match sent {
            Ok(n) if n == buf.len() => {}
            Ok(n) => {
                warn!("short request send ({n} of {} bytes)", buf.len());
                return Err(ErrorCode::MessageSendFailed);
            }
            Err(e) => {
                warn!("sending request to daemon failed: {e}");
                return Err(ErrorCode::MessageSendFailed);
            }
        }

        let mut response_buf = [0u8; RESPONSE_WIRE_LEN];
        if let Err(e) = self.stream.read_exact(&mut response_buf) {
            warn!("reading daemon response failed: {e}");
            return Err(ErrorCode::MessageSendFailed);
        }

        let mut response = Response::default();
        let mut rest = &response_buf[..];
        if let Err(e) = response.deserialize(&mut rest) {
            warn!("malformed daemon response: {e}");
            return Err(ErrorCode::GenericError);
        }

        if let Response::Error { code } = response {
            return Err(code);
        }
        Ok(response)
    }

    /// Duplicate the underlying descriptor for out-of-band hangup
    /// monitoring. The duplicate must never be read from; response bytes
    /// belong to [`Self::send_request`].
    pub fn dup_monitor_fd(&self) -> std::io::Result<OwnedFd> {
        Ok(self.stream.try_clone()?.into())
    }
}

/// The daemon's side of one accepted connection. The real daemon lives in
/// another repository; this endpoint exists for the in-process fake daemons
/// the test suites run.
pub struct DaemonEndpoint {
    stream: UnixStream,
}

impl DaemonEndpoint {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Accept one connection from `listener`.
    pub fn accept(listener: &UnixListener) -> std::io::Result<Self> {
        let (stream, _) = listener.accept()?;
        Ok(Self { stream })
    }

    /// The underlying stream, e.g. for a test harness to shut down
    /// mid-conversation to simulate a daemon crash.
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Receive the next request record together with any descriptor passed
    /// alongside it. Returns `Ok(None)` on a clean peer shutdown.
    pub fn recv_request(&mut self) -> std::io::Result<Option<(Request, Option<OwnedFd>)>> {
        let mut buf = [0u8; REQUEST_WIRE_LEN];
        let mut cmsg_buf = cmsg_space!([RawFd; 1]);
        let mut received = 0usize;
        let mut fd = None;

        // A stream socket may deliver the record in pieces; the descriptor
        // arrives with whichever piece carries it.
        while received < REQUEST_WIRE_LEN {
            let mut iov = [IoSliceMut::new(&mut buf[received..])];
            let msg = recvmsg::<UnixAddr>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )
            .map_err(std::io::Error::from)?;

            if msg.bytes == 0 {
                if received == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "request truncated by peer shutdown",
                ));
            }

            for cmsg in msg.cmsgs().map_err(std::io::Error::from)? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for raw in fds {
                        // SAFETY: the kernel just installed this descriptor
                        // into our table for us to own.
                        fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                }
            }

            received += msg.bytes;
        }

        let mut request = Request::default();
        let mut rest = &buf[..];
        request.deserialize(&mut rest).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;

        Ok(Some((request, fd)))
    }

    pub fn send_response(&mut self, response: &Response) -> std::io::Result<()> {
        self.stream.write_all(&response.serialize_alloc())
    }
}

/// Build a connected [`ServiceChannel`]/[`DaemonEndpoint`] pair over
/// `socketpair(2)`, so tests can run an in-process daemon without
/// publishing a filesystem socket. The library side carries the same
/// send/receive timeout a real connection would.
pub fn loopback_channel(
    io_timeout: Duration,
) -> std::io::Result<(ServiceChannel, DaemonEndpoint)> {
    let (library_fd, daemon_fd) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;

    let stream = UnixStream::from(library_fd);
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;

    Ok((
        ServiceChannel { stream },
        DaemonEndpoint::new(UnixStream::from(daemon_fd)),
    ))
}
