// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Private-area wrapping and duplication blobs
//!
//! Two byte formats:
//!
//! * private blob: `TPM2B(outerHMAC) || TPM2B(iv) || CFB(TPM2B(sensitive))`
//!   with a caller-chosen key and IV
//! * duplication blob (TPM2_Duplicate / TPM2_Import):
//!   `TPM2B(outerHMAC) || CFB(inner)` where `inner` is either
//!   `TPM2B(sensitive)` or the inner-wrapped
//!   `CFB(TPM2B(H(sensitive2b || name)) || TPM2B(sensitive))`
//!
//! Integrity is always checked before anything decrypted is parsed.

use tracing::warn;

use crate::constants::TpmAlgId;
use crate::crypto::{self, ParentSecret};
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::types::{Tpm2bPrivate, TpmtPublic, TpmtSensitive, TpmtSymDef, TpmuPublicParms};

const AES_BLOCK: usize = 16;

/// Caller-chosen symmetric key and IV for [`wrap_private`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    /// AES-128/192/256 key
    pub key: Vec<u8>,
    /// 16-byte CFB IV
    pub iv: Vec<u8>,
}

impl SymmetricKey {
    pub fn random(key_bits: u16) -> Self {
        Self {
            key: crypto::random_bytes(key_bits as usize / 8),
            iv: crypto::random_bytes(AES_BLOCK),
        }
    }
}

fn integrity_key(name_alg: TpmAlgId, seed: &[u8]) -> Result<Vec<u8>> {
    crypto::kdfa(
        name_alg,
        seed,
        b"INTEGRITY",
        &[],
        &[],
        (name_alg.digest_size() * 8) as u32,
    )
}

fn sensitive_2b(sensitive: &TpmtSensitive) -> Result<Vec<u8>> {
    let mut buf = CommandBuffer::new();
    buf.put_sized(SizeWidth::U16, Some(sensitive));
    buf.finish()
}

/// Parse `TPM2B(TPMT_SENSITIVE)` filling all of `data`.
fn parse_sensitive_2b(data: &[u8]) -> Result<TpmtSensitive> {
    let mut buf = ResponseBuffer::new(data);
    let sensitive = buf
        .get_sized::<TpmtSensitive>(SizeWidth::U16)?
        .ok_or(Error::InvalidValue {
            kind: "sensitive area size",
            value: 0,
        })?;
    buf.ensure_consumed("sensitive area")?;
    Ok(sensitive)
}

/// Split `TPM2B(outerHMAC) || rest`. A corrupt size prefix is reported as
/// an integrity failure like any other modification of the blob.
fn split_outer(blob: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = ResponseBuffer::new(blob);
    let hmac = buf
        .get_tpm2b()
        .map_err(|_| Error::Integrity("outer HMAC"))?;
    Ok((hmac, buf.get_remaining()))
}

fn check(expected: &[u8], actual: &[u8], what: &'static str) -> Result<()> {
    if crypto::ct_eq(expected, actual) {
        Ok(())
    } else {
        warn!("{what} mismatch");
        Err(Error::Integrity(what))
    }
}

/// Wrap a sensitive area under a caller-chosen key.
///
/// The outer HMAC is keyed with `KDFa(name_alg, seed, "INTEGRITY")` and
/// covers `TPM2B(iv) || encSensitive || name`.
pub fn wrap_private(
    sensitive: &TpmtSensitive,
    symmetric: &SymmetricKey,
    name_alg: TpmAlgId,
    seed: &[u8],
    name: &[u8],
) -> Result<Tpm2bPrivate> {
    let mut enc = sensitive_2b(sensitive)?;
    crypto::cfb_encrypt(&symmetric.key, &symmetric.iv, &mut enc)?;

    let mut protected = CommandBuffer::new();
    protected.put_tpm2b(&symmetric.iv);
    protected.put_bytes(&enc);
    let protected = protected.finish()?;

    let hmac = crypto::hmac(name_alg, &integrity_key(name_alg, seed)?, &[&protected, name])?;
    let mut blob = CommandBuffer::new();
    blob.put_tpm2b(&hmac);
    blob.put_bytes(&protected);
    Ok(Tpm2bPrivate::new(blob.finish()?))
}

/// Inverse of [`wrap_private`]; the IV comes from the blob.
pub fn unwrap_private(
    private: &Tpm2bPrivate,
    key: &[u8],
    name_alg: TpmAlgId,
    seed: &[u8],
    name: &[u8],
) -> Result<TpmtSensitive> {
    let (hmac, protected) = split_outer(&private.buffer)?;
    let expected = crypto::hmac(name_alg, &integrity_key(name_alg, seed)?, &[&protected, name])?;
    check(&expected, &hmac, "outer HMAC")?;

    let mut buf = ResponseBuffer::new(&protected);
    let iv = buf.get_tpm2b()?;
    let mut enc = buf.get_remaining();
    crypto::cfb_decrypt(key, &iv, &mut enc)?;
    parse_sensitive_2b(&enc)
}

/// Output of [`create_duplicate`], ready for TPM2_Import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateBlob {
    /// Inner wrapper key; empty without an inner wrapper
    pub encryption_key: Vec<u8>,
    pub duplicate: Tpm2bPrivate,
    /// Seed protected to the new parent
    pub in_sym_seed: Vec<u8>,
    /// Inner symmetric definition to pass to TPM2_Import
    pub symmetric: TpmtSymDef,
}

/// AES key size of a storage parent's symmetric definition.
fn storage_key_bits(parent: &TpmtPublic) -> Result<u16> {
    let symmetric = match &parent.parameters {
        TpmuPublicParms::Rsa(p) => p.symmetric,
        TpmuPublicParms::Ecc(p) => p.symmetric,
        _ => return Err(Error::UnsupportedAlgorithm(parent.type_alg())),
    };
    match symmetric {
        TpmtSymDef::Cipher {
            algorithm: TpmAlgId::Aes,
            key_bits,
            mode: TpmAlgId::Cfb,
        } => Ok(key_bits),
        other => Err(Error::UnsupportedAlgorithm(other.selector())),
    }
}

fn storage_key(parent: &TpmtPublic, seed: &[u8], name: &[u8]) -> Result<Vec<u8>> {
    let bits = storage_key_bits(parent)?;
    crypto::kdfa(parent.name_alg, seed, b"STORAGE", name, &[], bits as u32)
}

/// `TPM2B(outerHMAC) || CFB(data)` with STORAGE/INTEGRITY keys from `seed`.
fn outer_wrap(parent: &TpmtPublic, seed: &[u8], name: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = data.to_vec();
    crypto::cfb_encrypt(&storage_key(parent, seed, name)?, &[0u8; AES_BLOCK], &mut enc)?;
    let hmac = crypto::hmac(
        parent.name_alg,
        &integrity_key(parent.name_alg, seed)?,
        &[&enc, name],
    )?;
    let mut blob = CommandBuffer::new();
    blob.put_tpm2b(&hmac);
    blob.put_bytes(&enc);
    blob.finish()
}

fn outer_unwrap(parent: &TpmtPublic, seed: &[u8], name: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    let (hmac, mut enc) = split_outer(blob)?;
    let expected = crypto::hmac(
        parent.name_alg,
        &integrity_key(parent.name_alg, seed)?,
        &[&enc, name],
    )?;
    check(&expected, &hmac, "outer HMAC")?;
    crypto::cfb_decrypt(&storage_key(parent, seed, name)?, &[0u8; AES_BLOCK], &mut enc)?;
    Ok(enc)
}

/// Build a duplication blob of `sensitive` (the private part of
/// `object`) for import under `new_parent`.
///
/// With `inner`, the sensitive area is first wrapped under a fresh
/// AES-CFB key of that definition.
pub fn create_duplicate(
    sensitive: &TpmtSensitive,
    object: &TpmtPublic,
    new_parent: &TpmtPublic,
    inner: Option<TpmtSymDef>,
) -> Result<DuplicateBlob> {
    let name = object.name()?;
    let sens2b = sensitive_2b(sensitive)?;

    let (payload, encryption_key, symmetric) = match inner {
        None | Some(TpmtSymDef::Null) => (sens2b, Vec::new(), TpmtSymDef::Null),
        Some(
            def @ TpmtSymDef::Cipher {
                algorithm: TpmAlgId::Aes,
                key_bits,
                mode: TpmAlgId::Cfb,
            },
        ) => {
            let key = crypto::random_bytes(key_bits as usize / 8);
            let integrity = crypto::hash(object.name_alg, &[&sens2b, &name])?;
            let mut inner_blob = CommandBuffer::new();
            inner_blob.put_tpm2b(&integrity);
            inner_blob.put_bytes(&sens2b);
            let mut inner_blob = inner_blob.finish()?;
            crypto::cfb_encrypt(&key, &[0u8; AES_BLOCK], &mut inner_blob)?;
            (inner_blob, key, def)
        }
        Some(other) => return Err(Error::UnsupportedAlgorithm(other.selector())),
    };

    let (seed, in_sym_seed) = crypto::protect_seed(new_parent, "DUPLICATE")?;
    let duplicate = outer_wrap(new_parent, &seed, &name, &payload)?;
    Ok(DuplicateBlob {
        encryption_key,
        duplicate: Tpm2bPrivate::new(duplicate),
        in_sym_seed,
        symmetric,
    })
}

/// Recover the sensitive area from a duplication blob, as TPM2_Import does.
pub fn import_duplicate(
    blob: &DuplicateBlob,
    object: &TpmtPublic,
    new_parent: &TpmtPublic,
    parent_secret: ParentSecret<'_>,
) -> Result<TpmtSensitive> {
    let name = object.name()?;
    let seed = crypto::recover_seed(new_parent, parent_secret, "DUPLICATE", &blob.in_sym_seed)?;
    let mut payload = outer_unwrap(new_parent, &seed, &name, &blob.duplicate.buffer)?;

    if blob.symmetric.is_null() {
        return parse_sensitive_2b(&payload);
    }
    crypto::cfb_decrypt(&blob.encryption_key, &[0u8; AES_BLOCK], &mut payload)?;
    // A wrong inner key yields noise, so a malformed digest is an integrity failure
    let mut buf = ResponseBuffer::new(&payload);
    let integrity = buf
        .get_tpm2b()
        .map_err(|_| Error::Integrity("inner integrity"))?;
    let sens2b = buf.get_remaining();
    let expected = crypto::hash(object.name_alg, &[&sens2b, &name])?;
    check(&expected, &integrity, "inner integrity")?;
    parse_sensitive_2b(&sens2b)
}
