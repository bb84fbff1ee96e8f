// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bounded registries of logical trace clients and their registered
//! shared-memory objects.
//!
//! Application calls must never block on daemon I/O, so every registration
//! is recorded locally first. Entries move through
//! `Pending -> InFlight -> Registered`: `Pending` entries wait for the
//! background worker (or the next application call while connected),
//! `InFlight` marks an IPC in progress so a concurrent duplicate is rejected
//! instead of triggering a second request, and `Registered` entries carry
//! the daemon-assigned id or handle.
//!
//! Locks are never held across IPC; callers take an entry into `InFlight`,
//! drop the lock, talk to the daemon, and then complete or requeue.

use std::os::fd::OwnedFd;
use std::sync::RwLock;

use trace_protocol::{
    BindingType, ErrorCode, ShmObjectHandle, TraceClientId, TraceResult, APP_ID_WIRE_LEN,
};

/// Capacity of the client table.
pub const CLIENT_CAPACITY: usize = 32;

/// Capacity of the shared-memory object table.
pub const SHM_CAPACITY: usize = 128;

/// Local placeholder handles start here so they can never collide with the
/// small non-negative indices the daemon assigns.
const LOCAL_HANDLE_BASE: ShmObjectHandle = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    InFlight,
    Registered,
}

#[derive(Clone)]
struct ClientEntry {
    binding: BindingType,
    app_id_prefix: [u8; APP_ID_WIRE_LEN],
    remote_id: TraceClientId,
    state: EntryState,
}

/// What makes a shared-memory registration unique per client: the
/// application's descriptor number or the object path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShmKey {
    Fd(std::os::fd::RawFd),
    Path(String),
}

/// What the worker replays a cached registration from. Descriptor sources
/// hold a duplicate so the registration survives the application closing
/// its own descriptor.
pub enum ShmSource {
    Fd(OwnedFd),
    Path(String),
}

impl ShmSource {
    pub fn try_clone(&self) -> TraceResult<ShmSource> {
        Ok(match self {
            ShmSource::Fd(fd) => {
                ShmSource::Fd(fd.try_clone().map_err(|_| ErrorCode::BadFileDescriptor)?)
            }
            ShmSource::Path(path) => ShmSource::Path(path.clone()),
        })
    }
}

struct ShmEntry {
    client: TraceClientId,
    key: ShmKey,
    source: ShmSource,
    local_handle: ShmObjectHandle,
    remote_handle: Option<ShmObjectHandle>,
    state: EntryState,
}

/// A pending client registration handed to the worker for replay.
pub struct PendingClient {
    pub local_id: TraceClientId,
    pub binding: BindingType,
    pub app_id_prefix: [u8; APP_ID_WIRE_LEN],
}

/// A pending shared-memory registration handed to the worker for replay.
pub struct PendingShm {
    pub local_handle: ShmObjectHandle,
    pub client: TraceClientId,
    pub source: ShmSource,
}

pub struct Registry {
    clients: RwLock<Vec<Option<ClientEntry>>>,
    shm: RwLock<ShmTable>,
}

struct ShmTable {
    entries: Vec<ShmEntry>,
    next_local_handle: ShmObjectHandle,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(vec![None; CLIENT_CAPACITY]),
            shm: RwLock::new(ShmTable {
                entries: Vec::new(),
                next_local_handle: LOCAL_HANDLE_BASE,
            }),
        }
    }

    // ----- client table -----

    /// Record a client registration. Idempotent: a second call with the same
    /// `(binding, app-id prefix)` returns the existing local id.
    ///
    /// Returns the local id and whether the entry is new. The slot index
    /// plus one is the local id, so `0` stays "unassigned".
    pub fn register_client(
        &self,
        binding: BindingType,
        app_id_prefix: [u8; APP_ID_WIRE_LEN],
    ) -> TraceResult<(TraceClientId, bool)> {
        let mut clients = self.clients.write().unwrap();

        for (index, slot) in clients.iter().enumerate() {
            if let Some(entry) = slot {
                if entry.binding == binding && entry.app_id_prefix == app_id_prefix {
                    return Ok(((index + 1) as TraceClientId, false));
                }
            }
        }

        let free = clients
            .iter()
            .position(Option::is_none)
            .ok_or(ErrorCode::GenericError)?;
        clients[free] = Some(ClientEntry {
            binding,
            app_id_prefix,
            remote_id: 0,
            state: EntryState::Pending,
        });
        Ok(((free + 1) as TraceClientId, true))
    }

    pub fn client_exists(&self, local_id: TraceClientId) -> bool {
        self.with_client(local_id, |_| ()).is_ok()
    }

    /// The daemon-assigned id for a local client, `0` while unresolved.
    pub fn remote_id(&self, local_id: TraceClientId) -> TraceResult<TraceClientId> {
        self.with_client(local_id, |entry| entry.remote_id)
    }

    pub fn client_state(&self, local_id: TraceClientId) -> TraceResult<EntryState> {
        self.with_client(local_id, |entry| entry.state)
    }

    fn with_client<T>(
        &self,
        local_id: TraceClientId,
        read: impl FnOnce(&ClientEntry) -> T,
    ) -> TraceResult<T> {
        let clients = self.clients.read().unwrap();
        client_slot(&clients, local_id)
            .map(read)
            .ok_or(ErrorCode::ClientNotFound)
    }

    /// Claim a client entry for a synchronous registration attempt. Fails if
    /// the entry is already being handled.
    pub fn begin_client_registration(&self, local_id: TraceClientId) -> TraceResult<()> {
        let mut clients = self.clients.write().unwrap();
        let entry = client_slot_mut(&mut clients, local_id).ok_or(ErrorCode::ClientNotFound)?;
        match entry.state {
            EntryState::Pending => {
                entry.state = EntryState::InFlight;
                Ok(())
            }
            _ => Err(ErrorCode::GenericError),
        }
    }

    /// Store the daemon-assigned id. The surface-visible local id never
    /// changes; a different remote id after a daemon restart only updates
    /// this mapping.
    pub fn complete_client(&self, local_id: TraceClientId, remote_id: TraceClientId) {
        let mut clients = self.clients.write().unwrap();
        if let Some(entry) = client_slot_mut(&mut clients, local_id) {
            entry.remote_id = remote_id;
            entry.state = EntryState::Registered;
        }
    }

    /// Put an in-flight entry back to pending after a failed attempt.
    pub fn requeue_client(&self, local_id: TraceClientId) {
        let mut clients = self.clients.write().unwrap();
        if let Some(entry) = client_slot_mut(&mut clients, local_id) {
            if entry.state == EntryState::InFlight {
                entry.state = EntryState::Pending;
            }
        }
    }

    pub fn remove_client(&self, local_id: TraceClientId) {
        let mut clients = self.clients.write().unwrap();
        if let Some(slot) = clients.get_mut(local_id as usize - 1) {
            *slot = None;
        }
    }

    /// Snapshot the pending client registrations, promoting each to
    /// in-flight so no one else dispatches them concurrently.
    pub fn take_pending_clients(&self) -> Vec<PendingClient> {
        let mut clients = self.clients.write().unwrap();
        let mut pending = Vec::new();
        for (index, slot) in clients.iter_mut().enumerate() {
            if let Some(entry) = slot {
                if entry.state == EntryState::Pending {
                    entry.state = EntryState::InFlight;
                    pending.push(PendingClient {
                        local_id: (index + 1) as TraceClientId,
                        binding: entry.binding,
                        app_id_prefix: entry.app_id_prefix,
                    });
                }
            }
        }
        pending
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .read()
            .unwrap()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    // ----- shared-memory table -----

    /// Record a shared-memory registration for `client`. The returned local
    /// handle is what the application holds until (and after) the daemon
    /// assigns its own.
    ///
    /// `in_flight` marks the entry as being dispatched right now by the
    /// caller; otherwise it waits for the worker.
    pub fn insert_shm(
        &self,
        client: TraceClientId,
        key: ShmKey,
        source: ShmSource,
        in_flight: bool,
    ) -> TraceResult<ShmObjectHandle> {
        if !self.client_exists(client) {
            return Err(ErrorCode::ClientNotFound);
        }

        let mut table = self.shm.write().unwrap();
        if table
            .entries
            .iter()
            .any(|entry| entry.client == client && entry.key == key)
        {
            return Err(ErrorCode::SharedMemoryObjectAlreadyRegistered);
        }
        if table.entries.len() >= SHM_CAPACITY {
            return Err(ErrorCode::NoMoreSpaceForNewShmObject);
        }

        let local_handle = table.next_local_handle;
        table.next_local_handle += 1;
        table.entries.push(ShmEntry {
            client,
            key,
            source,
            local_handle,
            remote_handle: None,
            state: if in_flight {
                EntryState::InFlight
            } else {
                EntryState::Pending
            },
        });
        Ok(local_handle)
    }

    pub fn complete_shm(&self, local_handle: ShmObjectHandle, remote_handle: ShmObjectHandle) {
        let mut table = self.shm.write().unwrap();
        if let Some(entry) = table
            .entries
            .iter_mut()
            .find(|entry| entry.local_handle == local_handle)
        {
            entry.remote_handle = Some(remote_handle);
            entry.state = EntryState::Registered;
        }
    }

    pub fn requeue_shm(&self, local_handle: ShmObjectHandle) {
        let mut table = self.shm.write().unwrap();
        if let Some(entry) = table
            .entries
            .iter_mut()
            .find(|entry| entry.local_handle == local_handle)
        {
            if entry.state == EntryState::InFlight {
                entry.state = EntryState::Pending;
            }
        }
    }

    pub fn remove_shm(&self, local_handle: ShmObjectHandle) {
        let mut table = self.shm.write().unwrap();
        table.entries.retain(|entry| entry.local_handle != local_handle);
    }

    /// Look an entry up by the handle the application holds, which is the
    /// local placeholder or the daemon-assigned one.
    pub fn find_shm(
        &self,
        client: TraceClientId,
        handle: ShmObjectHandle,
    ) -> Option<(ShmObjectHandle, Option<ShmObjectHandle>, EntryState)> {
        let table = self.shm.read().unwrap();
        table
            .entries
            .iter()
            .find(|entry| {
                entry.client == client
                    && (entry.local_handle == handle || entry.remote_handle == Some(handle))
            })
            .map(|entry| (entry.local_handle, entry.remote_handle, entry.state))
    }

    /// Snapshot pending shared-memory registrations, promoting each to
    /// in-flight. Descriptor sources are duplicated so the replay happens
    /// without the lock; entries whose descriptor cannot be duplicated any
    /// more are dropped from the table.
    pub fn take_pending_shm(&self) -> Vec<PendingShm> {
        let mut table = self.shm.write().unwrap();
        let mut pending = Vec::new();
        let mut dead = Vec::new();
        for entry in table.entries.iter_mut() {
            if entry.state != EntryState::Pending {
                continue;
            }
            match entry.source.try_clone() {
                Ok(source) => {
                    entry.state = EntryState::InFlight;
                    pending.push(PendingShm {
                        local_handle: entry.local_handle,
                        client: entry.client,
                        source,
                    });
                }
                Err(_) => dead.push(entry.local_handle),
            }
        }
        table
            .entries
            .retain(|entry| !dead.contains(&entry.local_handle));
        pending
    }

    /// After a daemon death every registered entry must be replayed; the
    /// surface-visible ids and handles stay valid while the remote side is
    /// re-established underneath.
    pub fn mark_all_pending(&self) {
        let mut clients = self.clients.write().unwrap();
        for slot in clients.iter_mut() {
            if let Some(entry) = slot {
                if entry.state == EntryState::Registered {
                    entry.state = EntryState::Pending;
                }
            }
        }
        drop(clients);

        let mut table = self.shm.write().unwrap();
        for entry in table.entries.iter_mut() {
            if entry.state == EntryState::Registered {
                entry.state = EntryState::Pending;
            }
        }
    }

    /// Remove every shared-memory entry of `client`, returning the remote
    /// handles the daemon still knows about so the caller can unregister
    /// them best-effort.
    pub fn take_shm_for_client(&self, client: TraceClientId) -> Vec<ShmObjectHandle> {
        let mut table = self.shm.write().unwrap();
        let mut remote_handles = Vec::new();
        table.entries.retain(|entry| {
            if entry.client != client {
                return true;
            }
            if entry.state == EntryState::Registered {
                if let Some(remote) = entry.remote_handle {
                    remote_handles.push(remote);
                }
            }
            false
        });
        remote_handles
    }

    pub fn shm_count(&self) -> usize {
        self.shm.read().unwrap().entries.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn client_index(local_id: TraceClientId) -> Option<usize> {
    (local_id != 0).then(|| local_id as usize - 1)
}

fn client_slot(clients: &[Option<ClientEntry>], local_id: TraceClientId) -> Option<&ClientEntry> {
    client_index(local_id).and_then(|index| clients.get(index)).and_then(Option::as_ref)
}

fn client_slot_mut(
    clients: &mut [Option<ClientEntry>],
    local_id: TraceClientId,
) -> Option<&mut ClientEntry> {
    client_index(local_id)
        .and_then(|index| clients.get_mut(index))
        .and_then(Option::as_mut)
}
