// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Resource manager against an in-process TPM with a fixed number of slots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tpm2_engine::command::{build_command, build_response, error_response, parse_response, TpmCommand};
use tpm2_engine::resource_manager::VIRTUAL_OBJECT_BASE;
use tpm2_engine::*;

const OBJECT_MEMORY: u32 = 0x902;
const SESSION_MEMORY: u32 = 0x903;

fn is_session(handle: u32) -> bool {
    matches!(
        TpmHt::of(handle),
        Some(TpmHt::HmacSession | TpmHt::PolicySession)
    )
}

fn is_object(handle: u32) -> bool {
    TpmHt::of(handle) == Some(TpmHt::Transient)
}

fn ok(handles: &[u32], params: &[u8]) -> anyhow::Result<Vec<u8>> {
    Ok(build_response(rc::SUCCESS, handles, params, &[])?)
}

/// Each loaded entity carries an identity that survives save/load, so
/// tests can tell which object a (virtual or real) handle refers to.
struct FakeState {
    object_limit: usize,
    session_limit: usize,
    next_object: u32,
    next_session: u32,
    next_id: u32,
    /// real handle -> identity
    loaded: BTreeMap<u32, u32>,
    saved_sessions: BTreeSet<u32>,
    log: Vec<(TpmCc, Vec<u32>)>,
}

impl FakeState {
    fn new(object_limit: usize, session_limit: usize) -> Self {
        Self {
            object_limit,
            session_limit,
            next_object: 0x8000_0000,
            next_session: 0x0300_0000,
            next_id: 1,
            loaded: BTreeMap::new(),
            saved_sessions: BTreeSet::new(),
            log: Vec::new(),
        }
    }

    fn count(&self, pred: fn(u32) -> bool) -> usize {
        self.loaded.keys().filter(|&&h| pred(h)).count()
    }

    fn load_object(&mut self, id: u32) -> Option<u32> {
        if self.count(is_object) >= self.object_limit {
            return None;
        }
        let real = self.next_object;
        self.next_object += 1;
        self.loaded.insert(real, id);
        Some(real)
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn execute(&mut self, cmd: &TpmCommand) -> anyhow::Result<Vec<u8>> {
        match cmd.cc {
            TpmCc::LoadExternal | TpmCc::Load | TpmCc::CreatePrimary => {
                let Some(real) = self.load_object(self.next_id) else {
                    return Ok(error_response(OBJECT_MEMORY));
                };
                let id = self.fresh_id();
                let mut name = vec![0x00, 0x0B];
                name.extend([0u8; 28]);
                name.extend(id.to_be_bytes());
                let mut params = CommandBuffer::new();
                params.put_tpm2b(&name);
                ok(&[real], params.as_bytes())
            }
            TpmCc::StartAuthSession => {
                if self.count(is_session) >= self.session_limit {
                    return Ok(error_response(SESSION_MEMORY));
                }
                let id = self.fresh_id();
                let real = self.next_session;
                self.next_session += 1;
                self.loaded.insert(real, id);
                let mut params = CommandBuffer::new();
                params.put_tpm2b(&[0x5A; 32]);
                ok(&[real], params.as_bytes())
            }
            TpmCc::ContextSave => {
                let handle = cmd.handles[0];
                let Some(&id) = self.loaded.get(&handle) else {
                    return Ok(error_response(TpmRc::handle_error(0)));
                };
                if is_session(handle) {
                    self.loaded.remove(&handle);
                    self.saved_sessions.insert(handle);
                }
                let context = TpmsContext {
                    sequence: id as u64,
                    saved_handle: handle,
                    hierarchy: tpm_rh::NULL,
                    context_blob: id.to_be_bytes().to_vec(),
                };
                ok(&[], &context.to_bytes())
            }
            TpmCc::ContextLoad => {
                let context = TpmsContext::from_bytes(&cmd.parameters)?;
                let id = u32::from_be_bytes(context.context_blob[..4].try_into()?);
                if is_session(context.saved_handle) {
                    if self.count(is_session) >= self.session_limit {
                        return Ok(error_response(SESSION_MEMORY));
                    }
                    self.saved_sessions.remove(&context.saved_handle);
                    self.loaded.insert(context.saved_handle, id);
                    return ok(&[context.saved_handle], &[]);
                }
                match self.load_object(id) {
                    Some(real) => ok(&[real], &[]),
                    None => Ok(error_response(OBJECT_MEMORY)),
                }
            }
            TpmCc::FlushContext => {
                let handle = cmd.handles[0];
                if self.loaded.remove(&handle).is_none() && !self.saved_sessions.remove(&handle) {
                    return Ok(error_response(TpmRc::handle_error(0)));
                }
                ok(&[], &[])
            }
            _ => {
                for (pos, &handle) in cmd.handles.iter().enumerate() {
                    if (is_object(handle) || is_session(handle)) && !self.loaded.contains_key(&handle) {
                        return Ok(error_response(TpmRc::handle_error(pos)));
                    }
                }
                // ReadPublic answers with the object's identity
                let params = match cmd.cc {
                    TpmCc::ReadPublic => self.loaded[&cmd.handles[0]].to_be_bytes().to_vec(),
                    _ => Vec::new(),
                };
                ok(&[], &params)
            }
        }
    }
}

#[derive(Clone)]
struct FakeTpm(Arc<Mutex<FakeState>>);

impl FakeTpm {
    fn new(object_limit: usize, session_limit: usize) -> Self {
        Self(Arc::new(Mutex::new(FakeState::new(object_limit, session_limit))))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }

    fn log_tail(&self, n: usize) -> Vec<(TpmCc, Vec<u32>)> {
        let state = self.state();
        state.log[state.log.len() - n..].to_vec()
    }
}

impl Transport for FakeTpm {
    fn transmit(&mut self, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        let cmd = TpmCommand::parse(command)?;
        let mut state = self.state();
        state.log.push((cmd.cc, cmd.handles.clone()));
        state.execute(&cmd)
    }
}

fn manager(tpm: &FakeTpm, object_slots: usize, session_slots: usize) -> ResourceManager<FakeTpm> {
    ResourceManager::new(
        tpm.clone(),
        ResourceManagerConfig {
            object_slots,
            session_slots,
        },
    )
}

fn load(rm: &ResourceManager<FakeTpm>, client: u32) -> u32 {
    let cmd = build_command(TpmCc::LoadExternal, &[], &[], &[]).unwrap();
    let rsp = parse_response(&rm.dispatch(client, &cmd).unwrap(), 1).unwrap();
    assert!(rsp.is_success());
    rsp.handles[0]
}

fn identity(rm: &ResourceManager<FakeTpm>, client: u32, handle: u32) -> u32 {
    let cmd = build_command(TpmCc::ReadPublic, &[handle], &[], &[]).unwrap();
    let rsp = parse_response(&rm.dispatch(client, &cmd).unwrap(), 0).unwrap();
    assert!(rsp.is_success(), "rc {:#x}", rsp.response_code);
    u32::from_be_bytes(rsp.parameters[..4].try_into().unwrap())
}

fn certify(object: u32, sign_with: u32) -> Vec<u8> {
    let pw = TpmsAuthCommand::password(&[]);
    build_command(TpmCc::Certify, &[object, sign_with], &[pw.clone(), pw], &[]).unwrap()
}

#[test]
fn test_least_recently_used_object_is_evicted() {
    let tpm = FakeTpm::new(3, 3);
    let rm = manager(&tpm, 3, 3);
    let client = rm.connect().unwrap();

    let a = load(&rm, client);
    let b = load(&rm, client);
    let c = load(&rm, client);
    assert_eq!(
        [a, b, c],
        [VIRTUAL_OBJECT_BASE, VIRTUAL_OBJECT_BASE + 1, VIRTUAL_OBJECT_BASE + 2]
    );

    // D is new: A (oldest) goes, B and C stay
    let _d = load(&rm, client);
    assert_eq!(
        tpm.log_tail(3),
        vec![
            (TpmCc::ContextSave, vec![0x8000_0000]),
            (TpmCc::FlushContext, vec![0x8000_0000]),
            (TpmCc::LoadExternal, vec![]),
        ]
    );
    assert_eq!(rm.loaded(SlotClass::Object).unwrap(), 3);

    // Referencing A brings it back by evicting B, now the oldest
    assert_eq!(identity(&rm, client, a), 1);
    assert_eq!(
        tpm.log_tail(4),
        vec![
            (TpmCc::ContextSave, vec![0x8000_0001]),
            (TpmCc::FlushContext, vec![0x8000_0001]),
            (TpmCc::ContextLoad, vec![]),
            (TpmCc::ReadPublic, vec![0x8000_0004]),
        ]
    );
    assert_eq!(identity(&rm, client, b), 2);
    assert_eq!(identity(&rm, client, c), 3);
}

#[test]
fn test_referenced_entries_are_not_evicted() {
    let tpm = FakeTpm::new(2, 3);
    let rm = manager(&tpm, 2, 3);
    let client = rm.connect().unwrap();

    let a = load(&rm, client);
    let b = load(&rm, client);
    let _c = load(&rm, client); // evicts A

    // A and B are both needed: C is the only candidate even though B is older
    let rsp = parse_response(&rm.dispatch(client, &certify(a, b)).unwrap(), 0).unwrap();
    assert!(rsp.is_success());
    assert_eq!(
        tpm.log_tail(4),
        vec![
            (TpmCc::ContextSave, vec![0x8000_0002]),
            (TpmCc::FlushContext, vec![0x8000_0002]),
            (TpmCc::ContextLoad, vec![]),
            (TpmCc::Certify, vec![0x8000_0003, 0x8000_0001]),
        ]
    );
}

#[test]
fn test_too_many_references_for_the_pool() {
    let tpm = FakeTpm::new(3, 3);
    let rm = manager(&tpm, 1, 3);
    let client = rm.connect().unwrap();

    let a = load(&rm, client);
    let b = load(&rm, client);
    let err = rm.dispatch(client, &certify(a, b)).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(SlotClass::Object)));
    assert!(!tpm.state().log.iter().any(|(cc, _)| *cc == TpmCc::Certify));

    // Still usable one object at a time
    assert_eq!(identity(&rm, client, a), 1);
    assert_eq!(identity(&rm, client, b), 2);
}

#[test]
fn test_tpm_memory_pressure_is_retried() {
    // The TPM runs out before the configured limit does
    let tpm = FakeTpm::new(2, 3);
    let rm = manager(&tpm, 3, 3);
    let client = rm.connect().unwrap();

    let a = load(&rm, client);
    let b = load(&rm, client);
    let c = load(&rm, client);
    assert_eq!(
        tpm.log_tail(4),
        vec![
            (TpmCc::LoadExternal, vec![]),
            (TpmCc::ContextSave, vec![0x8000_0000]),
            (TpmCc::FlushContext, vec![0x8000_0000]),
            (TpmCc::LoadExternal, vec![]),
        ]
    );

    // ContextLoad hits the same wall and is retried after evicting B
    assert_eq!(identity(&rm, client, a), 1);
    assert_eq!(tpm.state().loaded.len(), 2);
    assert_eq!(identity(&rm, client, c), 3);
    assert_eq!(identity(&rm, client, b), 2);
}

#[test]
fn test_session_contexts_are_swapped() {
    let tpm = FakeTpm::new(3, 1);
    let rm = manager(&tpm, 3, 1);
    let client = rm.connect().unwrap();

    let start = build_command(
        TpmCc::StartAuthSession,
        &[tpm_rh::NULL, tpm_rh::NULL],
        &[],
        &[],
    )
    .unwrap();
    let first = parse_response(&rm.dispatch(client, &start).unwrap(), 1).unwrap().handles[0];
    let second = parse_response(&rm.dispatch(client, &start).unwrap(), 1).unwrap().handles[0];
    // Session handles are not virtualized
    assert_eq!([first, second], [0x0300_0000, 0x0300_0001]);
    assert!(tpm.state().saved_sessions.contains(&first));

    let restart = build_command(TpmCc::PolicyRestart, &[first], &[], &[]).unwrap();
    let rsp = parse_response(&rm.dispatch(client, &restart).unwrap(), 0).unwrap();
    assert!(rsp.is_success());
    assert!(tpm.state().saved_sessions.contains(&second));
    assert_eq!(rm.loaded(SlotClass::Session).unwrap(), 1);
}

#[test]
fn test_disconnect_flushes_client_entries() {
    let tpm = FakeTpm::new(2, 3);
    let rm = Arc::new(manager(&tpm, 2, 3));

    let other = rm.connect().unwrap();
    let x = load(&rm, other);

    let mut ctx = TpmContext::with_transport(rm.client().unwrap());
    let public = TpmtPublic::rsa_storage_key();
    let y = ctx.load_external(None, &public, tpm_rh::NULL).unwrap();
    let z = ctx.load_external(None, &public, tpm_rh::NULL).unwrap(); // evicts X
    assert_ne!(y.value, z.value);
    let session = ctx.start_policy_session(TpmAlgId::Sha256).unwrap();
    assert_eq!(tpm.state().loaded.len(), 3);

    drop(ctx);
    {
        let state = tpm.state();
        assert!(state.loaded.is_empty());
        assert!(state.saved_sessions.is_empty());
        let flushed: BTreeSet<u32> = state
            .log
            .iter()
            .filter(|(cc, _)| *cc == TpmCc::FlushContext)
            .map(|(_, h)| h[0])
            .collect();
        assert!(flushed.contains(&session));
        assert!(flushed.contains(&0x8000_0001));
        assert!(flushed.contains(&0x8000_0002));
    }

    // The other client's saved object is untouched
    assert_eq!(identity(&rm, other, x), 1);
}
