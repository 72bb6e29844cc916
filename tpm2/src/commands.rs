// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command execution
//!
//! [`TpmContext::execute`] is the single dispatch primitive: it resolves
//! authorizations, encrypts/decrypts the first parameter, frames the
//! command, talks to the transport and checks response HMACs. The typed
//! commands below are thin wrappers over it.

use std::collections::HashMap;

use tracing::debug;

use crate::command::{build_command, parse_response, TpmResponse};
use crate::constants::*;
use crate::crypto;
use crate::device::{TpmDevice, Transport};
use crate::error::{Error, Result};
use crate::handle::TpmHandle;
use crate::marshal::*;
use crate::session::{cp_hash, rp_hash, AuthSession, AuthSpec};
use crate::types::*;

/// Per-request behavior switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Return non-success responses instead of failing with [`Error::Tpm`]
    pub allow_errors: bool,
}

impl RequestOptions {
    pub fn allow_errors() -> Self {
        Self { allow_errors: true }
    }
}

/// Result of TPM2_CreatePrimary
#[derive(Debug, Clone)]
pub struct CreatePrimaryResult {
    /// Loaded object, with its Name and the auth value it was created with
    pub handle: TpmHandle,
    pub public: TpmtPublic,
    pub creation_data: Option<TpmsCreationData>,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: TpmtTkCreation,
}

/// Result of TPM2_PolicySecret / TPM2_PolicySigned
#[derive(Debug, Clone)]
pub struct PolicyTicketResult {
    pub timeout: Vec<u8>,
    pub ticket: TpmtTkAuth,
}

/// Length of the TPM2B at the start of a parameter area
fn first_param_len(params: &[u8]) -> Result<usize> {
    if params.len() < 2 {
        return Err(Error::Truncated {
            wanted: 2,
            remaining: params.len(),
        });
    }
    let len = u16::from_be_bytes([params[0], params[1]]) as usize;
    if len + 2 > params.len() {
        return Err(Error::BadLength {
            declared: len,
            remaining: params.len() - 2,
        });
    }
    Ok(len)
}

/// Pure Rust TPM context
pub struct TpmContext<T: Transport = TpmDevice> {
    transport: T,
    sessions: HashMap<u32, AuthSession>,
}

impl TpmContext<TpmDevice> {
    /// Create a new TPM context with the given device path
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        let device = match tcti_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };
        Ok(Self::with_transport(device))
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.transport.path()
    }
}

impl<T: Transport> TpmContext<T> {
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            sessions: HashMap::new(),
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn session(&self, handle: u32) -> Option<&AuthSession> {
        self.sessions.get(&handle)
    }

    pub fn session_mut(&mut self, handle: u32) -> Option<&mut AuthSession> {
        self.sessions.get_mut(&handle)
    }

    /// Track a session started elsewhere (for example restored from a
    /// saved context).
    pub fn insert_session(&mut self, session: AuthSession) {
        self.sessions.insert(session.handle, session);
    }

    fn known_session(&self, handle: u32) -> Result<&AuthSession> {
        self.sessions
            .get(&handle)
            .ok_or_else(|| Error::logic(format!("unknown session {handle:#010x}")))
    }

    fn known_session_mut(&mut self, handle: u32) -> Result<&mut AuthSession> {
        self.sessions
            .get_mut(&handle)
            .ok_or_else(|| Error::logic(format!("unknown session {handle:#010x}")))
    }

    /// Position and handle of the session carrying `attr`, if any.
    fn session_with(&self, auths: &[AuthSpec], attr: u8) -> Result<Option<(usize, u32)>> {
        let mut found = None;
        for (idx, spec) in auths.iter().enumerate() {
            if let AuthSpec::Session(h) = spec {
                if self.known_session(*h)?.attributes.has(attr) {
                    if found.is_some() {
                        return Err(Error::logic(format!(
                            "more than one session with attribute {attr:#04x}"
                        )));
                    }
                    found = Some((idx, *h));
                }
            }
        }
        Ok(found)
    }

    /// nonceTPM of an encrypt/decrypt session that is not itself the first
    /// session; it enters the first session's HMAC.
    fn other_nonce(&self, found: Option<(usize, u32)>) -> Option<&[u8]> {
        match found {
            Some((idx, h)) if idx != 0 => self.sessions.get(&h).map(|s| s.nonce_tpm()),
            _ => None,
        }
    }

    /// Execute one command.
    ///
    /// `auths[i]` authorizes `handles[i]`; entries past the handle list are
    /// sessions used only for auditing or parameter encryption.
    pub fn execute(
        &mut self,
        cc: TpmCc,
        handles: &[&TpmHandle],
        auths: &[AuthSpec],
        params: &[u8],
        options: RequestOptions,
    ) -> Result<TpmResponse> {
        let info = cc.info();
        if handles.len() != info.in_handles {
            return Err(Error::logic(format!(
                "{cc:?} takes {} handles, got {}",
                info.in_handles,
                handles.len()
            )));
        }
        let mut params = params.to_vec();

        let decrypt_session = self.session_with(auths, TpmaSa::DECRYPT)?;
        let encrypt_session = self.session_with(auths, TpmaSa::ENCRYPT)?;
        if let Some((idx, h)) = decrypt_session {
            if !info.sized_command_param {
                return Err(Error::logic(format!(
                    "{cc:?} has no parameter eligible for encryption"
                )));
            }
            let len = first_param_len(&params)?;
            self.known_session(h)?
                .encrypt_first_param(handles.get(idx).copied(), &mut params[2..2 + len])?;
        }
        if encrypt_session.is_some() && !info.sized_response_param {
            return Err(Error::logic(format!(
                "{cc:?} has no response parameter eligible for encryption"
            )));
        }

        let names = if auths.iter().any(|a| matches!(a, AuthSpec::Session(_))) {
            handles.iter().map(|h| h.name()).collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        let mut auth_area = Vec::with_capacity(auths.len());
        for (i, spec) in auths.iter().enumerate() {
            let entity = handles.get(i).copied();
            let auth = match spec {
                AuthSpec::Password(value) => TpmsAuthCommand::password(value),
                AuthSpec::HandleAuth => {
                    TpmsAuthCommand::password(entity.map(|e| e.auth()).unwrap_or_default())
                }
                AuthSpec::Session(h) => {
                    let session = self.known_session(*h)?;
                    let cp = cp_hash(session.hash_alg, cc, &names, &params)?;
                    let (decrypt_nonce, encrypt_nonce) = if i == 0 {
                        (
                            self.other_nonce(decrypt_session),
                            self.other_nonce(encrypt_session),
                        )
                    } else {
                        (None, None)
                    };
                    session.compute_command_auth(&cp, entity, decrypt_nonce, encrypt_nonce)?
                }
            };
            auth_area.push(auth);
        }

        let handle_values: Vec<u32> = handles.iter().map(|h| h.value).collect();
        let command = build_command(cc, &handle_values, &auth_area, &params)?;
        debug!("{cc:?}: sending {} bytes", command.len());
        let bytes = self.transport.transmit(&command)?;
        let mut response = parse_response(&bytes, info.out_handles)?;

        if !response.is_success() {
            debug!("{cc:?}: response code {:#010x}", response.response_code);
            if options.allow_errors {
                return Ok(response);
            }
            response.ensure_success(cc)?;
        }

        if response.sessions.len() != auths.len() {
            return Err(Error::InvalidValue {
                kind: "response session count",
                value: response.sessions.len() as u32,
            });
        }
        for (i, (spec, rsp_auth)) in auths.iter().zip(&response.sessions).enumerate() {
            if let AuthSpec::Session(h) = spec {
                let entity = handles.get(i).copied();
                let code = response.response_code;
                let session = self.known_session_mut(*h)?;
                let rp = rp_hash(session.hash_alg, code, cc, &response.parameters)?;
                session.consume_response_auth(&rp, entity, rsp_auth)?;
            }
        }

        if let Some((idx, h)) = encrypt_session {
            let len = first_param_len(&response.parameters)?;
            self.known_session(h)?.decrypt_first_param(
                handles.get(idx).copied(),
                &mut response.parameters[2..2 + len],
            )?;
        }

        for spec in auths {
            if let AuthSpec::Session(h) = spec {
                let session = self.known_session_mut(*h)?;
                session.refresh_caller_nonce();
                if !session.attributes.has(TpmaSa::CONTINUE_SESSION) {
                    debug!("session {h:#010x} retired");
                    self.sessions.remove(h);
                }
            }
        }
        Ok(response)
    }

    fn run(
        &mut self,
        cc: TpmCc,
        handles: &[&TpmHandle],
        auths: &[AuthSpec],
        params: &[u8],
    ) -> Result<TpmResponse> {
        self.execute(cc, handles, auths, params, RequestOptions::default())
    }

    /// Send pre-framed bytes without any session processing.
    pub fn transmit_raw(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        Ok(self.transport.transmit(command)?)
    }

    // ==================== Startup / Random ====================

    pub fn startup(&mut self, startup_type: TpmSu) -> Result<()> {
        self.run(TpmCc::Startup, &[], &[], &(startup_type as u16).to_be_bytes())?;
        Ok(())
    }

    /// Generate random bytes using the TPM's hardware RNG
    pub fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(num_bytes);

        // TPM may return fewer bytes than requested, so loop
        while result.len() < num_bytes {
            let request_size = (num_bytes - result.len()).min(48) as u16;
            let response = self.run(TpmCc::GetRandom, &[], &[], &request_size.to_be_bytes())?;
            let mut buf = response.params_buffer();
            let random_bytes = buf.get_tpm2b()?;
            buf.ensure_consumed("GetRandom response")?;
            if random_bytes.is_empty() {
                return Err(Error::logic("GetRandom returned no bytes"));
            }
            result.extend_from_slice(&random_bytes);
        }

        result.truncate(num_bytes);
        Ok(result)
    }

    // ==================== Sessions ====================

    /// Start an authorization session.
    ///
    /// With `salt_key` the session is salted: a random salt is protected to
    /// the key's public area. With `bind` the session is bound to that
    /// entity and its auth value enters the session key.
    pub fn start_auth_session(
        &mut self,
        salt_key: Option<(&TpmHandle, &TpmtPublic)>,
        bind: Option<&TpmHandle>,
        session_type: TpmSe,
        symmetric: TpmtSymDef,
        hash_alg: TpmAlgId,
    ) -> Result<u32> {
        let nonce_caller = crypto::random_bytes(hash_alg.digest_size().max(16));
        let (salt, encrypted_salt) = match salt_key {
            Some((_, public)) => crypto::protect_seed(public, "SECRET")?,
            None => (Vec::new(), Vec::new()),
        };
        let null = TpmHandle::null();
        let tpm_key = salt_key.map(|(h, _)| h).unwrap_or(&null);
        let bind_handle = bind.unwrap_or(&null);

        let mut params = CommandBuffer::new();
        params.put_tpm2b(&nonce_caller);
        params.put_tpm2b(&encrypted_salt);
        params.put_u8(session_type as u8);
        symmetric.marshal(&mut params);
        params.put_u16(hash_alg.to_u16());

        let response = self.run(
            TpmCc::StartAuthSession,
            &[tpm_key, bind_handle],
            &[],
            &params.finish()?,
        )?;
        let handle = response.handles[0];
        let mut buf = response.params_buffer();
        let nonce_tpm = buf.get_tpm2b()?;
        buf.ensure_consumed("StartAuthSession response")?;

        let mut session = AuthSession::new(
            handle,
            session_type,
            hash_alg,
            symmetric,
            nonce_caller,
            nonce_tpm,
        );
        if let Some(b) = bind {
            session = session.with_bind(b.value);
        }
        session.derive_session_key(&salt, bind.map(|b| b.auth()))?;
        debug!("started {session_type:?} session {handle:#010x}");
        self.sessions.insert(handle, session);
        Ok(handle)
    }

    /// Start an unsalted, unbound policy session
    pub fn start_policy_session(&mut self, hash_alg: TpmAlgId) -> Result<u32> {
        self.start_auth_session(None, None, TpmSe::Policy, TpmtSymDef::aes_128_cfb(), hash_alg)
    }

    /// Start a trial policy session (for computing policy digest)
    pub fn start_trial_session(&mut self, hash_alg: TpmAlgId) -> Result<u32> {
        self.start_auth_session(None, None, TpmSe::Trial, TpmtSymDef::aes_128_cfb(), hash_alg)
    }

    /// Flush (close) a loaded object or session
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        self.run(TpmCc::FlushContext, &[&TpmHandle::new(handle)], &[], &[])?;
        self.sessions.remove(&handle);
        Ok(())
    }

    pub fn context_save(&mut self, handle: u32) -> Result<TpmsContext> {
        let response = self.run(TpmCc::ContextSave, &[&TpmHandle::new(handle)], &[], &[])?;
        Ok(TpmsContext::from_bytes(&response.parameters)?)
    }

    pub fn context_load(&mut self, context: &TpmsContext) -> Result<u32> {
        let response = self.run(TpmCc::ContextLoad, &[], &[], &context.try_to_bytes()?)?;
        Ok(response.handles[0])
    }

    // ==================== Object Operations ====================

    /// Create a primary key in the specified hierarchy
    pub fn create_primary(
        &mut self,
        hierarchy: &TpmHandle,
        auth: AuthSpec,
        sensitive: &TpmsSensitiveCreate,
        template: &TpmtPublic,
        outside_info: &[u8],
        creation_pcr: &TpmlPcrSelection,
    ) -> Result<CreatePrimaryResult> {
        let mut params = CommandBuffer::new();
        params.put_sized(SizeWidth::U16, Some(sensitive));
        params.put_sized(SizeWidth::U16, Some(template));
        params.put_tpm2b(outside_info);
        creation_pcr.marshal(&mut params);

        let response = self.run(TpmCc::CreatePrimary, &[hierarchy], &[auth], &params.finish()?)?;
        let mut buf = response.params_buffer();
        let public = buf
            .get_sized::<TpmtPublic>(SizeWidth::U16)?
            .ok_or(Error::InvalidValue {
                kind: "CreatePrimary outPublic size",
                value: 0,
            })?;
        let creation_data = buf.get_sized::<TpmsCreationData>(SizeWidth::U16)?;
        let creation_hash = buf.get_tpm2b()?;
        let creation_ticket = TpmtTicket::unmarshal(&mut buf)?;
        let name = buf.get_tpm2b()?;
        buf.ensure_consumed("CreatePrimary response")?;

        let handle = TpmHandle::new(response.handles[0])
            .with_name(name)
            .with_auth(sensitive.user_auth.buffer.clone());
        debug!("created primary {:#010x}", handle.value);
        Ok(CreatePrimaryResult {
            handle,
            public,
            creation_data,
            creation_hash,
            creation_ticket,
        })
    }

    /// Load an object under `parent`
    pub fn load(
        &mut self,
        parent: &TpmHandle,
        auth: AuthSpec,
        private: &Tpm2bPrivate,
        public: &TpmtPublic,
    ) -> Result<TpmHandle> {
        let mut params = CommandBuffer::new();
        private.marshal(&mut params);
        params.put_sized(SizeWidth::U16, Some(public));

        let response = self.run(TpmCc::Load, &[parent], &[auth], &params.finish()?)?;
        let mut buf = response.params_buffer();
        let name = buf.get_tpm2b()?;
        buf.ensure_consumed("Load response")?;
        Ok(TpmHandle::new(response.handles[0]).with_name(name))
    }

    /// Load an external object; without `sensitive` only the public part
    /// is loaded.
    pub fn load_external(
        &mut self,
        sensitive: Option<&TpmtSensitive>,
        public: &TpmtPublic,
        hierarchy: u32,
    ) -> Result<TpmHandle> {
        let mut params = CommandBuffer::new();
        params.put_sized(SizeWidth::U16, sensitive);
        params.put_sized(SizeWidth::U16, Some(public));
        params.put_u32(hierarchy);

        let response = self.run(TpmCc::LoadExternal, &[], &[], &params.finish()?)?;
        let mut buf = response.params_buffer();
        let name = buf.get_tpm2b()?;
        buf.ensure_consumed("LoadExternal response")?;
        let mut handle = TpmHandle::new(response.handles[0]).with_name(name);
        if let Some(s) = sensitive {
            handle.set_auth(s.auth_value.clone());
        }
        Ok(handle)
    }

    /// Read the public area and name of a loaded object
    pub fn read_public(&mut self, object: u32) -> Result<(TpmtPublic, Vec<u8>)> {
        let response = self.run(TpmCc::ReadPublic, &[&TpmHandle::new(object)], &[], &[])?;
        let mut buf = response.params_buffer();
        let public = buf
            .get_sized::<TpmtPublic>(SizeWidth::U16)?
            .ok_or(Error::InvalidValue {
                kind: "ReadPublic outPublic size",
                value: 0,
            })?;
        let name = buf.get_tpm2b()?;
        let _qualified_name = buf.get_tpm2b()?;
        buf.ensure_consumed("ReadPublic response")?;
        Ok((public, name))
    }

    /// Fill in the cached name of `handle` from the TPM
    pub fn refresh_name(&mut self, handle: &mut TpmHandle) -> Result<()> {
        let name = match handle.kind() {
            Some(TpmHt::NvIndex) => self.nv_read_public(handle.value)?.1,
            _ => self.read_public(handle.value)?.1,
        };
        handle.set_name(name);
        Ok(())
    }

    /// Read NV public area and name
    pub fn nv_read_public(&mut self, index: u32) -> Result<(TpmsNvPublic, Vec<u8>)> {
        let response = self.run(TpmCc::NvReadPublic, &[&TpmHandle::new(index)], &[], &[])?;
        let mut buf = response.params_buffer();
        let nv_public = buf
            .get_sized::<TpmsNvPublic>(SizeWidth::U16)?
            .ok_or(Error::InvalidValue {
                kind: "NV_ReadPublic nvPublic size",
                value: 0,
            })?;
        let name = buf.get_tpm2b()?;
        buf.ensure_consumed("NV_ReadPublic response")?;
        Ok((nv_public, name))
    }

    /// Import a duplicated object under `parent`
    pub fn import(
        &mut self,
        parent: &TpmHandle,
        auth: AuthSpec,
        encryption_key: &[u8],
        public: &TpmtPublic,
        duplicate: &Tpm2bPrivate,
        in_sym_seed: &[u8],
        symmetric: TpmtSymDef,
    ) -> Result<Tpm2bPrivate> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(encryption_key);
        params.put_sized(SizeWidth::U16, Some(public));
        duplicate.marshal(&mut params);
        params.put_tpm2b(in_sym_seed);
        symmetric.marshal(&mut params);

        let response = self.run(TpmCc::Import, &[parent], &[auth], &params.finish()?)?;
        Ok(Tpm2bPrivate::from_bytes(&response.parameters)?)
    }

    /// Verify a signature; returns the verification ticket
    pub fn verify_signature(
        &mut self,
        key: &TpmHandle,
        digest: &[u8],
        signature: &TpmtSignature,
    ) -> Result<TpmtTkVerified> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(digest);
        signature.marshal(&mut params);
        let response = self.run(TpmCc::VerifySignature, &[key], &[], &params.finish()?)?;
        Ok(TpmtTicket::from_bytes(&response.parameters)?)
    }

    // ==================== PCR Operations ====================

    /// Read PCR values for the given selection
    pub fn pcr_read(&mut self, pcr_selection: &TpmlPcrSelection) -> Result<Vec<(u32, Vec<u8>)>> {
        let response = self.run(TpmCc::PcrRead, &[], &[], &pcr_selection.try_to_bytes()?)?;

        let mut buf = response.params_buffer();
        let _update_counter = buf.get_u32()?;
        let pcr_selection_out = TpmlPcrSelection::unmarshal(&mut buf)?;
        let digest_list = TpmlDigest::unmarshal(&mut buf)?;
        buf.ensure_consumed("PCR_Read response")?;

        let indices = pcr_selection_out
            .pcr_selections
            .iter()
            .flat_map(|sel| sel.pcrs());
        Ok(indices
            .zip(digest_list.digests)
            .map(|(idx, d)| (idx, d.buffer))
            .collect())
    }

    /// Extend a PCR
    pub fn pcr_extend(&mut self, pcr: u32, auth: AuthSpec, digests: &TpmlDigestValues) -> Result<()> {
        self.run(
            TpmCc::PcrExtend,
            &[&TpmHandle::new(pcr)],
            &[auth],
            &digests.try_to_bytes()?,
        )?;
        debug!("extended PCR {}", pcr);
        Ok(())
    }

    // ==================== Policy Commands ====================

    fn policy(&mut self, cc: TpmCc, session: u32, params: &[u8]) -> Result<TpmResponse> {
        self.run(cc, &[&TpmHandle::new(session)], &[], params)
    }

    pub fn policy_command_code(&mut self, session: u32, code: TpmCc) -> Result<()> {
        self.policy(TpmCc::PolicyCommandCode, session, &code.to_u32().to_be_bytes())?;
        Ok(())
    }

    pub fn policy_locality(&mut self, session: u32, locality: u8) -> Result<()> {
        self.policy(TpmCc::PolicyLocality, session, &[locality])?;
        Ok(())
    }

    /// Apply PCR policy to this session
    pub fn policy_pcr(
        &mut self,
        session: u32,
        pcr_digest: &[u8],
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(pcr_digest);
        pcr_selection.marshal(&mut params);
        self.policy(TpmCc::PolicyPcr, session, &params.finish()?)?;
        Ok(())
    }

    pub fn policy_auth_value(&mut self, session: u32) -> Result<()> {
        self.policy(TpmCc::PolicyAuthValue, session, &[])?;
        self.known_session_mut(session)?.set_needs_hmac();
        Ok(())
    }

    pub fn policy_password(&mut self, session: u32) -> Result<()> {
        self.policy(TpmCc::PolicyPassword, session, &[])?;
        self.known_session_mut(session)?.set_needs_password();
        Ok(())
    }

    pub fn policy_cp_hash(&mut self, session: u32, cp_hash_a: &[u8]) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(cp_hash_a);
        self.policy(TpmCc::PolicyCpHash, session, &params.finish()?)?;
        Ok(())
    }

    pub fn policy_name_hash(&mut self, session: u32, name_hash: &[u8]) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(name_hash);
        self.policy(TpmCc::PolicyNameHash, session, &params.finish()?)?;
        Ok(())
    }

    pub fn policy_counter_timer(
        &mut self,
        session: u32,
        operand_b: &[u8],
        offset: u16,
        operation: TpmEo,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(operand_b);
        params.put_u16(offset);
        params.put_u16(operation.to_u16());
        self.policy(TpmCc::PolicyCounterTimer, session, &params.finish()?)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn policy_nv(
        &mut self,
        auth_handle: &TpmHandle,
        auth: AuthSpec,
        nv_index: &TpmHandle,
        session: u32,
        operand_b: &[u8],
        offset: u16,
        operation: TpmEo,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(operand_b);
        params.put_u16(offset);
        params.put_u16(operation.to_u16());
        self.run(
            TpmCc::PolicyNv,
            &[auth_handle, nv_index, &TpmHandle::new(session)],
            &[auth],
            &params.finish()?,
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn policy_secret(
        &mut self,
        auth_handle: &TpmHandle,
        auth: AuthSpec,
        session: u32,
        nonce_tpm: &[u8],
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
    ) -> Result<PolicyTicketResult> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(nonce_tpm);
        params.put_tpm2b(cp_hash_a);
        params.put_tpm2b(policy_ref);
        params.put_u32(expiration as u32);
        let response = self.run(
            TpmCc::PolicySecret,
            &[auth_handle, &TpmHandle::new(session)],
            &[auth],
            &params.finish()?,
        )?;
        parse_policy_ticket(&response)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn policy_signed(
        &mut self,
        auth_object: &TpmHandle,
        session: u32,
        nonce_tpm: &[u8],
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        signature: &TpmtSignature,
    ) -> Result<PolicyTicketResult> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(nonce_tpm);
        params.put_tpm2b(cp_hash_a);
        params.put_tpm2b(policy_ref);
        params.put_u32(expiration as u32);
        signature.marshal(&mut params);
        let response = self.run(
            TpmCc::PolicySigned,
            &[auth_object, &TpmHandle::new(session)],
            &[],
            &params.finish()?,
        )?;
        parse_policy_ticket(&response)
    }

    pub fn policy_ticket(
        &mut self,
        session: u32,
        timeout: &[u8],
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        auth_name: &[u8],
        ticket: &TpmtTkAuth,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(timeout);
        params.put_tpm2b(cp_hash_a);
        params.put_tpm2b(policy_ref);
        params.put_tpm2b(auth_name);
        ticket.marshal(&mut params);
        self.policy(TpmCc::PolicyTicket, session, &params.finish()?)?;
        Ok(())
    }

    pub fn policy_or(&mut self, session: u32, digests: &TpmlDigest) -> Result<()> {
        self.policy(TpmCc::PolicyOr, session, &digests.try_to_bytes()?)?;
        Ok(())
    }

    pub fn policy_authorize(
        &mut self,
        session: u32,
        approved_policy: &[u8],
        policy_ref: &[u8],
        key_sign: &[u8],
        check_ticket: &TpmtTkVerified,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(approved_policy);
        params.put_tpm2b(policy_ref);
        params.put_tpm2b(key_sign);
        check_ticket.marshal(&mut params);
        self.policy(TpmCc::PolicyAuthorize, session, &params.finish()?)?;
        Ok(())
    }

    pub fn policy_authorize_nv(
        &mut self,
        auth_handle: &TpmHandle,
        auth: AuthSpec,
        nv_index: &TpmHandle,
        session: u32,
    ) -> Result<()> {
        self.run(
            TpmCc::PolicyAuthorizeNv,
            &[auth_handle, nv_index, &TpmHandle::new(session)],
            &[auth],
            &[],
        )?;
        Ok(())
    }

    pub fn policy_duplication_select(
        &mut self,
        session: u32,
        object_name: &[u8],
        new_parent_name: &[u8],
        include_object: bool,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(object_name);
        params.put_tpm2b(new_parent_name);
        params.put_u8(include_object as u8);
        self.policy(TpmCc::PolicyDuplicationSelect, session, &params.finish()?)?;
        Ok(())
    }

    pub fn policy_physical_presence(&mut self, session: u32) -> Result<()> {
        self.policy(TpmCc::PolicyPhysicalPresence, session, &[])?;
        Ok(())
    }

    pub fn policy_nv_written(&mut self, session: u32, written_set: bool) -> Result<()> {
        self.policy(TpmCc::PolicyNvWritten, session, &[written_set as u8])?;
        Ok(())
    }

    pub fn policy_template(&mut self, session: u32, template_hash: &[u8]) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(template_hash);
        self.policy(TpmCc::PolicyTemplate, session, &params.finish()?)?;
        Ok(())
    }

    /// Get the current policy digest
    pub fn policy_get_digest(&mut self, session: u32) -> Result<Vec<u8>> {
        let response = self.policy(TpmCc::PolicyGetDigest, session, &[])?;
        Ok(Tpm2bDigest::from_bytes(&response.parameters)?.buffer)
    }

    pub fn policy_restart(&mut self, session: u32) -> Result<()> {
        self.policy(TpmCc::PolicyRestart, session, &[])?;
        self.known_session_mut(session)?.reset_policy_flags();
        Ok(())
    }
}

fn parse_policy_ticket(response: &TpmResponse) -> Result<PolicyTicketResult> {
    let mut buf = response.params_buffer();
    let timeout = buf.get_tpm2b()?;
    let ticket = TpmtTicket::unmarshal(&mut buf)?;
    buf.ensure_consumed("policy ticket response")?;
    Ok(PolicyTicketResult { timeout, ticket })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{build_response, TpmCommand};
    use crate::types::TpmsAuthResponse;
    use std::collections::VecDeque;

    /// Replays canned responses and records every command sent.
    #[derive(Default)]
    struct Replay {
        responses: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl Transport for Replay {
        fn transmit(&mut self, command: &[u8]) -> anyhow::Result<Vec<u8>> {
            self.sent.push(command.to_vec());
            self.responses
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no canned response"))
        }
    }

    fn ctx_with(responses: Vec<Vec<u8>>) -> TpmContext<Replay> {
        TpmContext::with_transport(Replay {
            responses: responses.into(),
            sent: Vec::new(),
        })
    }

    #[test]
    fn test_get_random() {
        let rsp = build_response(0, &[], &[0, 4, 1, 2, 3, 4], &[]).unwrap();
        let mut ctx = ctx_with(vec![rsp]);
        assert_eq!(ctx.get_random(4).unwrap(), vec![1, 2, 3, 4]);
        let sent = TpmCommand::parse(&ctx.transport_mut().sent[0]).unwrap();
        assert_eq!(sent.cc, TpmCc::GetRandom);
        assert_eq!(sent.parameters, vec![0, 4]);
    }

    #[test]
    fn test_error_code_surfaces_or_is_returned() {
        let rsp = crate::command::error_response(0x0000_0101);
        let mut ctx = ctx_with(vec![rsp.clone(), rsp]);
        let err = ctx.get_random(4).unwrap_err();
        assert_eq!(err.response_code(), Some(0x101));

        let response = ctx
            .execute(TpmCc::GetRandom, &[], &[], &[0, 4], RequestOptions::allow_errors())
            .unwrap();
        assert_eq!(response.response_code, 0x101);
    }

    #[test]
    fn test_handle_count_is_checked() {
        let mut ctx = ctx_with(vec![]);
        assert!(matches!(
            ctx.execute(TpmCc::Unseal, &[], &[], &[], RequestOptions::default()),
            Err(Error::Logic(_))
        ));
    }

    #[test]
    fn test_hmac_session_round_trip() {
        let nonce_tpm = vec![0x55; 32];
        let start_rsp = build_response(0, &[0x0200_0000], &Tpm2bDigest::new(nonce_tpm.clone()).to_bytes(), &[]).unwrap();
        let mut ctx = ctx_with(vec![start_rsp]);
        let h = ctx
            .start_auth_session(None, None, TpmSe::Hmac, TpmtSymDef::aes_128_cfb(), TpmAlgId::Sha256)
            .unwrap();
        assert_eq!(h, 0x0200_0000);
        assert_eq!(ctx.session(h).unwrap().nonce_tpm(), &nonce_tpm[..]);

        // Build the TPM's reply to an Unseal authorized by the session.
        let entity = TpmHandle::new(0x8000_0001)
            .with_name(vec![0, 0x0B, 9, 9])
            .with_auth(b"pw".to_vec());
        let session = ctx.session(h).unwrap().clone();
        let out_params = Tpm2bSensitiveData::new(b"data".to_vec()).to_bytes();
        let new_nonce = vec![0x66; 32];
        let rp = rp_hash(TpmAlgId::Sha256, 0, TpmCc::Unseal, &out_params).unwrap();
        let attrs = TpmaSa::new().with_continue_session();
        let hmac = crypto::hmac(
            TpmAlgId::Sha256,
            b"pw",
            &[&rp, &new_nonce, session.nonce_caller(), &[attrs.0]],
        )
        .unwrap();
        let rsp = build_response(
            0,
            &[],
            &out_params,
            &[TpmsAuthResponse {
                nonce: new_nonce.clone(),
                attributes: attrs,
                hmac,
            }],
        )
        .unwrap();
        ctx.transport_mut().responses.push_back(rsp);

        let response = ctx
            .execute(TpmCc::Unseal, &[&entity], &[AuthSpec::Session(h)], &[], RequestOptions::default())
            .unwrap();
        assert_eq!(response.parameters, out_params);

        let sent = TpmCommand::parse(&ctx.transport_mut().sent[1]).unwrap();
        let cp = cp_hash(TpmAlgId::Sha256, TpmCc::Unseal, &[vec![0, 0x0B, 9, 9]], &[]).unwrap();
        let expected = session.compute_command_auth(&cp, Some(&entity), None, None).unwrap();
        assert_eq!(sent.sessions, vec![expected]);

        let updated = ctx.session(h).unwrap();
        assert_eq!(updated.nonce_tpm(), &new_nonce[..]);
        assert_ne!(updated.nonce_caller(), session.nonce_caller());
    }

    #[test]
    fn test_session_without_continue_is_retired() {
        let start_rsp = build_response(0, &[0x0300_0000], &Tpm2bDigest::new(vec![1; 32]).to_bytes(), &[]).unwrap();
        let mut ctx = ctx_with(vec![start_rsp]);
        let h = ctx.start_policy_session(TpmAlgId::Sha256).unwrap();
        ctx.session_mut(h).unwrap().attributes = TpmaSa::new();

        let rsp = build_response(
            0,
            &[],
            &[],
            &[TpmsAuthResponse {
                nonce: vec![2; 32],
                attributes: TpmaSa::new(),
                hmac: Vec::new(),
            }],
        )
        .unwrap();
        ctx.transport_mut().responses.push_back(rsp);
        let obj = TpmHandle::new(0x8000_0000).with_name(vec![0, 0x0B]);
        ctx.execute(TpmCc::Unseal, &[&obj], &[AuthSpec::Session(h)], &[], RequestOptions::default())
            .unwrap();
        assert!(ctx.session(h).is_none());
    }
}
