// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Handle virtualization
//!
//! The TPM holds only a few objects and sessions at a time. The resource
//! manager gives every client its own view: objects get virtual handles,
//! entries are context-saved when their slot is needed and loaded back on
//! the next reference. All dispatch is serialized under one lock.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::command::{build_command, error_response, parse_response, TpmCommand, TpmResponse, HEADER_SIZE};
use crate::constants::*;
use crate::device::Transport;
use crate::error::{Error, Result, SlotClass};
use crate::marshal::Unmarshal;
use crate::types::TpmsContext;

/// First virtual handle handed out for objects
pub const VIRTUAL_OBJECT_BASE: u32 = 0x80C0_0000;

/// Slot limits enforced locally, whatever the TPM reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    pub object_slots: usize,
    pub session_slots: usize,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        // PC client minimum
        Self {
            object_slots: 3,
            session_slots: 3,
        }
    }
}

impl ResourceManagerConfig {
    fn limit(&self, class: SlotClass) -> usize {
        match class {
            SlotClass::Object => self.object_slots,
            SlotClass::Session => self.session_slots,
        }
    }
}

pub type ClientId = u32;

#[derive(Debug)]
struct SlotContext {
    client: ClientId,
    virtual_handle: u32,
    class: SlotClass,
    /// Handle inside the TPM while loaded
    real_handle: Option<u32>,
    /// Marshaled TPMS_CONTEXT while saved
    saved: Option<Vec<u8>>,
    last_use: u64,
}

fn class_of(handle: u32) -> Option<SlotClass> {
    match TpmHt::of(handle)? {
        TpmHt::Transient => Some(SlotClass::Object),
        TpmHt::HmacSession | TpmHt::PolicySession => Some(SlotClass::Session),
        _ => None,
    }
}

/// Class of the entity a successful command leaves loaded, if any.
fn allocated_class(cc: TpmCc, parameters: &[u8]) -> Result<Option<SlotClass>> {
    Ok(match cc {
        TpmCc::StartAuthSession => Some(SlotClass::Session),
        TpmCc::CreatePrimary
        | TpmCc::CreateLoaded
        | TpmCc::Load
        | TpmCc::LoadExternal
        | TpmCc::HmacStart
        | TpmCc::HashSequenceStart => Some(SlotClass::Object),
        TpmCc::ContextLoad => {
            let context = TpmsContext::from_bytes(parameters)?;
            Some(class_of(context.saved_handle).ok_or(Error::InvalidValue {
                kind: "saved context handle",
                value: context.saved_handle,
            })?)
        }
        _ => None,
    })
}

/// Position of the input handle a successful command frees.
fn freed_handle(cc: TpmCc) -> Option<usize> {
    match cc {
        TpmCc::FlushContext | TpmCc::SequenceComplete => Some(0),
        TpmCc::EventSequenceComplete => Some(1),
        _ => None,
    }
}

fn memory_class(response: &[u8]) -> Option<SlotClass> {
    let code = response.get(6..HEADER_SIZE)?;
    let code = u32::from_be_bytes([code[0], code[1], code[2], code[3]]);
    match TpmRc::from_u32(code) {
        TpmRc::ObjectMemory | TpmRc::Memory => Some(SlotClass::Object),
        TpmRc::SessionMemory => Some(SlotClass::Session),
        _ => None,
    }
}

struct RmState<T> {
    transport: T,
    config: ResourceManagerConfig,
    slots: Vec<SlotContext>,
    clock: u64,
    next_virtual: u32,
    next_client: ClientId,
}

impl<T: Transport> RmState<T> {
    fn find(&self, client: ClientId, handle: u32, class: SlotClass) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.client == client && s.virtual_handle == handle && s.class == class)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn loaded(&self, class: SlotClass) -> usize {
        self.slots
            .iter()
            .filter(|s| s.class == class && s.real_handle.is_some())
            .count()
    }

    /// Send a command of our own, with no authorization area.
    fn raw(&mut self, cc: TpmCc, handles: &[u32], params: &[u8]) -> Result<TpmResponse> {
        let command = build_command(cc, handles, &[], params)?;
        let bytes = self.transport.transmit(&command)?;
        let response = parse_response(&bytes, cc.info().out_handles)?;
        response.ensure_success(cc)?;
        Ok(response)
    }

    /// Save the least recently used loaded entry of `class` not in `exclude`.
    fn evict_lru(&mut self, class: SlotClass, exclude: &[usize]) -> Result<()> {
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(i, s)| s.class == class && s.real_handle.is_some() && !exclude.contains(i))
            .min_by_key(|(_, s)| s.last_use)
            .map(|(i, _)| i)
            .ok_or(Error::ResourceExhausted(class))?;
        self.evict(victim)
    }

    fn evict(&mut self, idx: usize) -> Result<()> {
        let slot = &self.slots[idx];
        let (class, virtual_handle) = (slot.class, slot.virtual_handle);
        let real = slot
            .real_handle
            .ok_or_else(|| Error::logic(format!("{virtual_handle:#010x} is not loaded")))?;

        let saved = self.raw(TpmCc::ContextSave, &[real], &[])?.parameters;
        // Sessions leave their slot on save; objects stay until flushed
        if class == SlotClass::Object {
            self.raw(TpmCc::FlushContext, &[real], &[])?;
        }
        debug!("evicted {class} {virtual_handle:#010x} (real {real:#010x})");

        let slot = &mut self.slots[idx];
        slot.saved = Some(saved);
        slot.real_handle = None;
        Ok(())
    }

    /// Evict until one more entry of `class` fits.
    fn make_room(&mut self, class: SlotClass, exclude: &[usize]) -> Result<()> {
        while self.loaded(class) >= self.config.limit(class) {
            self.evict_lru(class, exclude)?;
        }
        Ok(())
    }

    fn load(&mut self, idx: usize, exclude: &[usize]) -> Result<()> {
        let class = self.slots[idx].class;
        self.make_room(class, exclude)?;
        let saved = self.slots[idx]
            .saved
            .clone()
            .ok_or_else(|| Error::logic("entry is neither loaded nor saved"))?;
        let response = loop {
            match self.raw(TpmCc::ContextLoad, &[], &saved) {
                Ok(response) => break response,
                Err(Error::Tpm { kind, .. })
                    if matches!(
                        kind,
                        TpmRc::ObjectMemory | TpmRc::SessionMemory | TpmRc::Memory
                    ) =>
                {
                    self.evict_lru(class, exclude)?;
                }
                Err(e) => return Err(e),
            }
        };
        let slot = &mut self.slots[idx];
        slot.real_handle = Some(response.handles[0]);
        slot.saved = None;
        debug!(
            "loaded {class} {:#010x} as {:#010x}",
            slot.virtual_handle, response.handles[0]
        );
        Ok(())
    }

    fn dispatch(&mut self, client: ClientId, command: &[u8]) -> Result<Vec<u8>> {
        let cmd = TpmCommand::parse(command)?;
        let info = cmd.cc.info();

        // (position in handle area, slot)
        let mut handle_slots = Vec::new();
        let mut referenced = Vec::new();
        for (pos, &handle) in cmd.handles.iter().enumerate() {
            let Some(class) = class_of(handle) else {
                continue;
            };
            match self.find(client, handle, class) {
                Some(idx) => {
                    handle_slots.push((pos, idx));
                    referenced.push(idx);
                }
                None => {
                    warn!("client {client}: unknown handle {handle:#010x}");
                    return Ok(error_response(TpmRc::handle_error(pos)));
                }
            }
        }
        for (pos, auth) in cmd.sessions.iter().enumerate() {
            if auth.session_handle == tpm_rh::PW {
                continue;
            }
            match self.find(client, auth.session_handle, SlotClass::Session) {
                Some(idx) => referenced.push(idx),
                None => {
                    warn!(
                        "client {client}: unknown session {:#010x}",
                        auth.session_handle
                    );
                    return Ok(error_response(TpmRc::session_handle_error(pos)));
                }
            }
        }

        // Bumped before execution, so failed commands count as uses too
        for &idx in &referenced {
            self.slots[idx].last_use = self.tick();
        }

        for &idx in &referenced {
            if self.slots[idx].real_handle.is_none() {
                self.load(idx, &referenced)?;
            }
        }
        let allocates = allocated_class(cmd.cc, &cmd.parameters)?;
        if let Some(class) = allocates {
            self.make_room(class, &referenced)?;
        }

        let mut bytes = command.to_vec();
        for &(pos, idx) in &handle_slots {
            let real = self.slots[idx]
                .real_handle
                .ok_or_else(|| Error::logic("referenced entry not loaded"))?;
            let at = HEADER_SIZE + 4 * pos;
            bytes[at..at + 4].copy_from_slice(&real.to_be_bytes());
        }

        debug!("client {client}: {:?} ({} bytes)", cmd.cc, bytes.len());
        let response = loop {
            let response = self.transport.transmit(&bytes)?;
            match memory_class(&response) {
                Some(class) => {
                    debug!("TPM out of {class} memory, evicting");
                    self.evict_lru(class, &referenced)?;
                }
                None => break response,
            }
        };

        let mut parsed = parse_response(&response, info.out_handles)?;
        if !parsed.is_success() {
            return Ok(response);
        }

        let mut retired: Vec<(u32, SlotClass)> = cmd
            .sessions
            .iter()
            .filter(|a| {
                a.session_handle != tpm_rh::PW && !a.attributes.has(TpmaSa::CONTINUE_SESSION)
            })
            .map(|a| (a.session_handle, SlotClass::Session))
            .collect();
        if let Some(pos) = freed_handle(cmd.cc) {
            if let Some(class) = class_of(cmd.handles[pos]) {
                retired.push((cmd.handles[pos], class));
            }
        }
        // The client holds the blob of a session it saved itself
        if cmd.cc == TpmCc::ContextSave && class_of(cmd.handles[0]) == Some(SlotClass::Session) {
            retired.push((cmd.handles[0], SlotClass::Session));
        }
        self.slots.retain(|s| {
            s.client != client || !retired.contains(&(s.virtual_handle, s.class))
        });

        let Some(class) = allocates else {
            return Ok(response);
        };
        let real = parsed.handles[0];
        let virtual_handle = match class {
            SlotClass::Object => {
                let v = self.next_virtual;
                self.next_virtual += 1;
                v
            }
            SlotClass::Session => real,
        };
        let last_use = self.tick();
        self.slots.push(SlotContext {
            client,
            virtual_handle,
            class,
            real_handle: Some(real),
            saved: None,
            last_use,
        });
        debug!("client {client}: new {class} {virtual_handle:#010x} (real {real:#010x})");
        parsed.handles[0] = virtual_handle;
        parsed.to_bytes()
    }

    fn disconnect(&mut self, client: ClientId) -> Result<()> {
        let mut first_error = None;
        let (owned, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.slots).into_iter().partition(|s| s.client == client);
        self.slots = kept;
        for slot in owned {
            // A saved session still holds its handle inside the TPM
            let handle = match (slot.real_handle, slot.class) {
                (Some(real), _) => real,
                (None, SlotClass::Session) => slot.virtual_handle,
                (None, SlotClass::Object) => continue,
            };
            if let Err(e) = self.raw(TpmCc::FlushContext, &[handle], &[]) {
                warn!("client {client}: failed to flush {handle:#010x}: {e}");
                first_error.get_or_insert(e);
            }
        }
        debug!("client {client} disconnected");
        first_error.map_or(Ok(()), Err)
    }
}

/// Multiplexes one TPM among many clients
pub struct ResourceManager<T: Transport> {
    state: Mutex<RmState<T>>,
}

impl<T: Transport> ResourceManager<T> {
    pub fn new(transport: T, config: ResourceManagerConfig) -> Self {
        Self {
            state: Mutex::new(RmState {
                transport,
                config,
                slots: Vec::new(),
                clock: 0,
                next_virtual: VIRTUAL_OBJECT_BASE,
                next_client: 1,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RmState<T>>> {
        self.state
            .lock()
            .map_err(|_| Error::logic("resource manager lock poisoned"))
    }

    /// Register a new client.
    pub fn connect(&self) -> Result<ClientId> {
        let mut state = self.lock()?;
        let id = state.next_client;
        state.next_client += 1;
        Ok(id)
    }

    /// Run one raw command on behalf of `client` and return the raw response.
    ///
    /// Unknown handles yield a TPM_RC_HANDLE response; running out of
    /// evictable slots is an error.
    pub fn dispatch(&self, client: ClientId, command: &[u8]) -> Result<Vec<u8>> {
        self.lock()?.dispatch(client, command)
    }

    /// Flush everything `client` still owns.
    pub fn disconnect(&self, client: ClientId) -> Result<()> {
        self.lock()?.disconnect(client)
    }

    /// Entries of `class` currently loaded in the TPM
    pub fn loaded(&self, class: SlotClass) -> Result<usize> {
        Ok(self.lock()?.loaded(class))
    }

    /// Connect a client that can be used as a transport.
    pub fn client(self: &Arc<Self>) -> Result<RmClient<T>> {
        Ok(RmClient {
            rm: Arc::clone(self),
            id: self.connect()?,
        })
    }
}

/// A client connection; disconnects on drop
pub struct RmClient<T: Transport> {
    rm: Arc<ResourceManager<T>>,
    id: ClientId,
}

impl<T: Transport> RmClient<T> {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl<T: Transport> Transport for RmClient<T> {
    fn transmit(&mut self, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.rm.dispatch(self.id, command)?)
    }
}

impl<T: Transport> Drop for RmClient<T> {
    fn drop(&mut self) {
        if let Err(e) = self.rm.disconnect(self.id) {
            warn!("client {}: disconnect failed: {e}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::build_response;
    use crate::marshal::Marshal;

    /// Accepts everything; hands out sequential handles.
    #[derive(Default)]
    struct Echo {
        next: u32,
        sent: Vec<TpmCc>,
    }

    impl Transport for Echo {
        fn transmit(&mut self, command: &[u8]) -> anyhow::Result<Vec<u8>> {
            let cmd = TpmCommand::parse(command)?;
            self.sent.push(cmd.cc);
            let handles = match cmd.cc.info().out_handles {
                0 => vec![],
                _ => {
                    self.next += 1;
                    vec![0x8000_0000 + self.next]
                }
            };
            let params = match cmd.cc {
                TpmCc::ContextSave => TpmsContext {
                    sequence: 1,
                    saved_handle: cmd.handles[0],
                    hierarchy: tpm_rh::NULL,
                    context_blob: vec![0xAB; 8],
                }
                .to_bytes(),
                _ => vec![],
            };
            Ok(build_response(0, &handles, &params, &[])?)
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ResourceManagerConfig::default();
        assert_eq!(config.object_slots, 3);
        assert_eq!(config.session_slots, 3);
    }

    #[test]
    fn test_unknown_handle_is_a_handle_error() {
        let rm = ResourceManager::new(Echo::default(), ResourceManagerConfig::default());
        let client = rm.connect().unwrap();
        let cmd = build_command(TpmCc::ReadPublic, &[0x80C0_FFFF], &[], &[]).unwrap();
        let rsp = parse_response(&rm.dispatch(client, &cmd).unwrap(), 0).unwrap();
        assert_eq!(rsp.response_code, TpmRc::handle_error(0));
        assert_eq!(TpmRc::from_u32(rsp.response_code), TpmRc::Handle);
    }

    #[test]
    fn test_handles_are_per_client() {
        let rm = ResourceManager::new(Echo::default(), ResourceManagerConfig::default());
        let a = rm.connect().unwrap();
        let b = rm.connect().unwrap();
        let load = build_command(TpmCc::LoadExternal, &[], &[], &[]).unwrap();
        let rsp = parse_response(&rm.dispatch(a, &load).unwrap(), 1).unwrap();
        assert_eq!(rsp.handles, vec![VIRTUAL_OBJECT_BASE]);

        let read = build_command(TpmCc::ReadPublic, &[VIRTUAL_OBJECT_BASE], &[], &[]).unwrap();
        let rsp = parse_response(&rm.dispatch(b, &read).unwrap(), 0).unwrap();
        assert_eq!(rsp.response_code, TpmRc::handle_error(0));
        let rsp = parse_response(&rm.dispatch(a, &read).unwrap(), 0).unwrap();
        assert!(rsp.is_success());
    }

    #[test]
    fn test_flush_forgets_entry() {
        let rm = ResourceManager::new(Echo::default(), ResourceManagerConfig::default());
        let client = rm.connect().unwrap();
        let load = build_command(TpmCc::LoadExternal, &[], &[], &[]).unwrap();
        rm.dispatch(client, &load).unwrap();
        assert_eq!(rm.loaded(SlotClass::Object).unwrap(), 1);

        let flush = build_command(TpmCc::FlushContext, &[VIRTUAL_OBJECT_BASE], &[], &[]).unwrap();
        rm.dispatch(client, &flush).unwrap();
        assert_eq!(rm.loaded(SlotClass::Object).unwrap(), 0);
        let rsp = parse_response(&rm.dispatch(client, &flush).unwrap(), 0).unwrap();
        assert_eq!(rsp.response_code, TpmRc::handle_error(0));
    }
}
