// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 authorization sessions
//!
//! Host-side state of HMAC and policy sessions: nonces, the session key,
//! command/response HMACs and parameter encryption. Nothing here talks to
//! the TPM; `TpmContext` drives the round trips.

use tracing::{debug, warn};

use crate::constants::*;
use crate::crypto;
use crate::error::{Error, Result};
use crate::handle::TpmHandle;
use crate::types::{TpmsAuthCommand, TpmsAuthResponse, TpmtSymDef};

/// How one authorized handle of a command is authorized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSpec {
    /// Password session with the given value
    Password(Vec<u8>),
    /// Password session with the handle's own auth value
    HandleAuth,
    /// A started HMAC or policy session, by handle
    Session(u32),
}

impl AuthSpec {
    /// Password session with an empty password
    pub fn null() -> Self {
        AuthSpec::Password(Vec::new())
    }
}

fn trim_trailing_zeros(v: &[u8]) -> &[u8] {
    let end = v.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &v[..end]
}

/// cpHash = H(commandCode || names || parameters)
pub fn cp_hash(alg: TpmAlgId, cc: TpmCc, names: &[Vec<u8>], parameters: &[u8]) -> Result<Vec<u8>> {
    let cc_bytes = cc.to_u32().to_be_bytes();
    let mut parts: Vec<&[u8]> = vec![&cc_bytes];
    parts.extend(names.iter().map(Vec::as_slice));
    parts.push(parameters);
    crypto::hash(alg, &parts)
}

/// rpHash = H(responseCode || commandCode || parameters)
pub fn rp_hash(alg: TpmAlgId, response_code: u32, cc: TpmCc, parameters: &[u8]) -> Result<Vec<u8>> {
    crypto::hash(
        alg,
        &[
            &response_code.to_be_bytes(),
            &cc.to_u32().to_be_bytes(),
            parameters,
        ],
    )
}

/// Authorization session state
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub handle: u32,
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
    pub symmetric: TpmtSymDef,
    pub attributes: TpmaSa,
    nonce_caller: Vec<u8>,
    nonce_tpm: Vec<u8>,
    session_key: Option<Vec<u8>>,
    bind: Option<u32>,
    needs_hmac: bool,
    needs_password: bool,
}

impl AuthSession {
    /// Session state after a successful StartAuthSession.
    pub fn new(
        handle: u32,
        session_type: TpmSe,
        hash_alg: TpmAlgId,
        symmetric: TpmtSymDef,
        nonce_caller: Vec<u8>,
        nonce_tpm: Vec<u8>,
    ) -> Self {
        Self {
            handle,
            session_type,
            hash_alg,
            symmetric,
            attributes: TpmaSa::new().with_continue_session(),
            nonce_caller,
            nonce_tpm,
            session_key: None,
            bind: None,
            needs_hmac: false,
            needs_password: false,
        }
    }

    /// Record the entity the session was bound to at start.
    pub fn with_bind(mut self, bind: u32) -> Self {
        self.bind = Some(bind);
        self
    }

    pub fn with_attributes(mut self, attributes: TpmaSa) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn is_policy(&self) -> bool {
        matches!(self.session_type, TpmSe::Policy | TpmSe::Trial)
    }

    pub fn nonce_caller(&self) -> &[u8] {
        &self.nonce_caller
    }

    pub fn nonce_tpm(&self) -> &[u8] {
        &self.nonce_tpm
    }

    pub fn session_key(&self) -> &[u8] {
        self.session_key.as_deref().unwrap_or_default()
    }

    /// Derive the session key. Only allowed once per session.
    ///
    /// Without salt and bind entity the key is empty; otherwise it is
    /// `KDFa(hash, bindAuth || salt, "ATH", nonceTPM, nonceCaller, digest bits)`.
    pub fn derive_session_key(&mut self, salt: &[u8], bind_auth: Option<&[u8]>) -> Result<()> {
        if self.session_key.is_some() {
            return Err(Error::logic(format!(
                "session key for {:#010x} already derived",
                self.handle
            )));
        }
        let key = match (salt.is_empty(), bind_auth) {
            (true, None) => Vec::new(),
            (_, bind_auth) => {
                let mut secret = trim_trailing_zeros(bind_auth.unwrap_or_default()).to_vec();
                secret.extend_from_slice(salt);
                crypto::kdfa(
                    self.hash_alg,
                    &secret,
                    b"ATH",
                    &self.nonce_tpm,
                    &self.nonce_caller,
                    (self.hash_alg.digest_size() * 8) as u32,
                )?
            }
        };
        debug!(
            "session {:#010x}: derived {}-byte session key",
            self.handle,
            key.len()
        );
        self.session_key = Some(key);
        Ok(())
    }

    /// Fold the entity's auth value into the HMAC key (PolicyAuthValue).
    pub fn set_needs_hmac(&mut self) {
        self.needs_hmac = true;
    }

    /// Send the entity's auth value in the clear (PolicyPassword).
    pub fn set_needs_password(&mut self) {
        self.needs_password = true;
    }

    pub fn needs_hmac(&self) -> bool {
        self.needs_hmac
    }

    pub fn needs_password(&self) -> bool {
        self.needs_password
    }

    /// Policy flags reset with the policy digest (PolicyRestart).
    pub fn reset_policy_flags(&mut self) {
        self.needs_hmac = false;
        self.needs_password = false;
    }

    fn is_bound_to(&self, entity: &TpmHandle) -> bool {
        self.bind == Some(entity.value)
    }

    /// Auth value of `entity` that goes into the HMAC key.
    fn effective_auth<'a>(&self, entity: Option<&'a TpmHandle>) -> &'a [u8] {
        let Some(entity) = entity else {
            return &[];
        };
        let include = if self.is_policy() {
            self.needs_hmac
        } else {
            !self.is_bound_to(entity)
        };
        if include {
            trim_trailing_zeros(entity.auth())
        } else {
            &[]
        }
    }

    /// sessionKey || effective auth value
    pub fn hmac_key(&self, entity: Option<&TpmHandle>) -> Vec<u8> {
        let mut key = self.session_key().to_vec();
        key.extend_from_slice(self.effective_auth(entity));
        key
    }

    /// Command authorization for this session.
    ///
    /// `decrypt_nonce`/`encrypt_nonce` are the TPM nonces of other sessions
    /// carrying the decrypt/encrypt attribute; they are only passed for the
    /// first authorization session.
    pub fn compute_command_auth(
        &self,
        cp_hash: &[u8],
        entity: Option<&TpmHandle>,
        decrypt_nonce: Option<&[u8]>,
        encrypt_nonce: Option<&[u8]>,
    ) -> Result<TpmsAuthCommand> {
        let hmac = if self.is_policy() && self.needs_password {
            entity.map(|e| e.auth().to_vec()).unwrap_or_default()
        } else if self.is_policy() && !self.needs_hmac && self.session_key().is_empty() {
            Vec::new()
        } else {
            crypto::hmac(
                self.hash_alg,
                &self.hmac_key(entity),
                &[
                    cp_hash,
                    &self.nonce_caller,
                    &self.nonce_tpm,
                    decrypt_nonce.unwrap_or_default(),
                    encrypt_nonce.unwrap_or_default(),
                    &[self.attributes.0],
                ],
            )?
        };
        Ok(TpmsAuthCommand {
            session_handle: self.handle,
            nonce: self.nonce_caller.clone(),
            attributes: self.attributes,
            hmac,
        })
    }

    /// Expected response HMAC for `response` (with its new TPM nonce).
    fn expected_response_hmac(
        &self,
        rp_hash: &[u8],
        entity: Option<&TpmHandle>,
        response: &TpmsAuthResponse,
    ) -> Result<Vec<u8>> {
        if self.is_policy() && (self.needs_password || (!self.needs_hmac && self.session_key().is_empty())) {
            return Ok(Vec::new());
        }
        crypto::hmac(
            self.hash_alg,
            &self.hmac_key(entity),
            &[
                rp_hash,
                &response.nonce,
                &self.nonce_caller,
                &[response.attributes.0],
            ],
        )
    }

    /// Check the response HMAC without changing session state.
    pub fn verify_response_auth(
        &self,
        rp_hash: &[u8],
        entity: Option<&TpmHandle>,
        response: &TpmsAuthResponse,
    ) -> Result<bool> {
        let expected = self.expected_response_hmac(rp_hash, entity, response)?;
        Ok(crypto::ct_eq(&expected, &response.hmac))
    }

    /// Verify the response HMAC and take the TPM's new nonce.
    pub fn consume_response_auth(
        &mut self,
        rp_hash: &[u8],
        entity: Option<&TpmHandle>,
        response: &TpmsAuthResponse,
    ) -> Result<()> {
        if !self.verify_response_auth(rp_hash, entity, response)? {
            warn!("response HMAC mismatch for session {:#010x}", self.handle);
            return Err(Error::ResponseHmac {
                session: self.handle,
            });
        }
        self.nonce_tpm = response.nonce.clone();
        Ok(())
    }

    /// Replace the caller nonce with fresh random bytes of the same length.
    pub fn refresh_caller_nonce(&mut self) {
        self.nonce_caller = crypto::random_bytes(self.nonce_caller.len());
    }

    fn apply_cipher(
        &self,
        entity: Option<&TpmHandle>,
        nonce_newer: &[u8],
        nonce_older: &[u8],
        data: &mut [u8],
        encrypt: bool,
    ) -> Result<()> {
        let key = self.hmac_key(entity);
        match self.symmetric {
            TpmtSymDef::Null => Err(Error::NoSymmetric(self.handle)),
            // The mask comes from the session's auth hash, not the one in the definition
            TpmtSymDef::Xor { .. } => {
                crypto::xor_obfuscate(self.hash_alg, &key, nonce_newer, nonce_older, data)
            }
            TpmtSymDef::Cipher {
                algorithm: TpmAlgId::Aes,
                key_bits,
                mode: TpmAlgId::Cfb,
            } => {
                let key_bytes = key_bits as usize / 8;
                let material = crypto::kdfa(
                    self.hash_alg,
                    &key,
                    b"CFB",
                    nonce_newer,
                    nonce_older,
                    key_bits as u32 + 128,
                )?;
                let (sym_key, iv) = material.split_at(key_bytes);
                if encrypt {
                    crypto::cfb_encrypt(sym_key, iv, data)
                } else {
                    crypto::cfb_decrypt(sym_key, iv, data)
                }
            }
            other => Err(Error::UnsupportedAlgorithm(
                crate::marshal::Selector::selector(&other),
            )),
        }
    }

    /// Encrypt the contents of the first command parameter (caller to TPM).
    pub fn encrypt_first_param(&self, entity: Option<&TpmHandle>, data: &mut [u8]) -> Result<()> {
        self.apply_cipher(entity, &self.nonce_caller, &self.nonce_tpm, data, true)
    }

    /// Decrypt the contents of the first response parameter (TPM to caller).
    ///
    /// Must run after [`Self::consume_response_auth`] so that the TPM's new
    /// nonce is the newer one.
    pub fn decrypt_first_param(&self, entity: Option<&TpmHandle>, data: &mut [u8]) -> Result<()> {
        self.apply_cipher(entity, &self.nonce_tpm, &self.nonce_caller, data, false)
    }
}
