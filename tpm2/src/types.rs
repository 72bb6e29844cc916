// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types
//!
//! Unions never store their selector separately: the enclosing structure
//! asks the union for its [`Selector`] when marshalling and hands the
//! unmarshalled selector to [`UnmarshalUnion`] when parsing.

use crate::constants::*;
use crate::crypto;
use crate::error::{Error, Result};
use crate::marshal::*;

pub(crate) fn get_alg(buf: &mut ResponseBuffer, kind: &'static str) -> Result<TpmAlgId> {
    let raw = buf.get_u16()?;
    TpmAlgId::from_u16(raw).ok_or(Error::InvalidValue {
        kind,
        value: raw as u32,
    })
}

fn get_hash_alg(buf: &mut ResponseBuffer) -> Result<TpmAlgId> {
    let alg = get_alg(buf, "hash algorithm")?;
    if !alg.is_hash() && alg != TpmAlgId::Null {
        return Err(Error::InvalidValue {
            kind: "hash algorithm",
            value: alg.to_u16() as u32,
        });
    }
    Ok(alg)
}

macro_rules! tpm2b {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub buffer: Vec<u8>,
        }

        impl $name {
            pub fn new(data: impl Into<Vec<u8>>) -> Self {
                Self { buffer: data.into() }
            }

            pub fn empty() -> Self {
                Self::default()
            }

            pub fn is_empty(&self) -> bool {
                self.buffer.is_empty()
            }
        }

        impl Marshal for $name {
            fn marshal(&self, buf: &mut CommandBuffer) {
                buf.put_tpm2b(&self.buffer);
            }
        }

        impl Unmarshal for $name {
            fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                Ok(Self {
                    buffer: buf.get_tpm2b()?,
                })
            }
        }
    };
}

tpm2b!(
    /// TPM2B_DIGEST - Variable length digest
    Tpm2bDigest
);
tpm2b!(
    /// TPM2B_DATA - Variable length data
    Tpm2bData
);
tpm2b!(
    /// TPM2B_AUTH - Authorization value
    Tpm2bAuth
);
tpm2b!(
    /// TPM2B_SENSITIVE_DATA - Sensitive data for sealing
    Tpm2bSensitiveData
);
tpm2b!(
    /// TPM2B_MAX_NV_BUFFER - NV buffer
    Tpm2bMaxNvBuffer
);
tpm2b!(
    /// TPM2B_PRIVATE - Wrapped private area
    Tpm2bPrivate
);
tpm2b!(
    /// TPM2B_ENCRYPTED_SECRET - Seed protected to a key
    Tpm2bEncryptedSecret
);
tpm2b!(
    /// TPM2B_PUBLIC_KEY_RSA - RSA modulus
    Tpm2bPublicKeyRsa
);
tpm2b!(
    /// TPM2B_ECC_PARAMETER - ECC coordinate or scalar
    Tpm2bEccParameter
);
tpm2b!(
    /// TPM2B_TIMEOUT - Policy ticket timeout
    Tpm2bTimeout
);
tpm2b!(
    /// TPM2B_NAME - Entity name
    Tpm2bName
);

/// TPM2B_NONCE - Nonce value
pub type Tpm2bNonce = Tpm2bDigest;

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // At least 3 bytes (PCR 0-23)
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];
        for &pcr in pcrs {
            pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }
        Self { hash, pcr_select }
    }

    /// Selected PCR indices in ascending order
    pub fn pcrs(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (byte_idx, byte) in self.pcr_select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    out.push(byte_idx as u32 * 8 + bit);
                }
            }
        }
        out
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_width(SizeWidth::U8, self.pcr_select.len());
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = get_hash_alg(buf)?;
        let size = buf.get_length(SizeWidth::U8)?;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_array(&self.pcr_selections, SizeWidth::U32);
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            pcr_selections: buf.get_array(SizeWidth::U32)?,
        })
    }
}

/// TPML_DIGEST - List of digests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_array(&self.digests, SizeWidth::U32);
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            digests: buf.get_array(SizeWidth::U32)?,
        })
    }
}

/// TPMT_HA - Hash value with algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtHa {
    pub hash_alg: TpmAlgId,
    pub digest: Vec<u8>,
}

impl Marshal for TpmtHa {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_bytes(&self.digest);
    }
}

impl Unmarshal for TpmtHa {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg = get_hash_alg(buf)?;
        let digest = buf.get_bytes(hash_alg.digest_size())?;
        Ok(Self { hash_alg, digest })
    }
}

/// TPML_DIGEST_VALUES - List of digest values for PCR extend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlDigestValues {
    pub digests: Vec<TpmtHa>,
}

impl Marshal for TpmlDigestValues {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_array(&self.digests, SizeWidth::U32);
    }
}

impl Unmarshal for TpmlDigestValues {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            digests: buf.get_array(SizeWidth::U32)?,
        })
    }
}

/// TPMT_SYM_DEF / TPMT_SYM_DEF_OBJECT - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmtSymDef {
    Null,
    /// XOR obfuscation; the key-bits member carries a hash algorithm and
    /// there is no mode.
    Xor {
        hash_alg: TpmAlgId,
    },
    Cipher {
        algorithm: TpmAlgId,
        key_bits: u16,
        mode: TpmAlgId,
    },
}

impl TpmtSymDef {
    pub fn aes_128_cfb() -> Self {
        TpmtSymDef::Cipher {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TpmtSymDef::Null)
    }
}

impl Selector for TpmtSymDef {
    fn selector(&self) -> u16 {
        match self {
            TpmtSymDef::Null => TpmAlgId::Null.to_u16(),
            TpmtSymDef::Xor { .. } => TpmAlgId::Xor.to_u16(),
            TpmtSymDef::Cipher { algorithm, .. } => algorithm.to_u16(),
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.selector());
        match self {
            TpmtSymDef::Null => {}
            TpmtSymDef::Xor { hash_alg } => buf.put_u16(hash_alg.to_u16()),
            TpmtSymDef::Cipher { key_bits, mode, .. } => {
                buf.put_u16(*key_bits);
                buf.put_u16(mode.to_u16());
            }
        }
    }
}

impl UnmarshalUnion for TpmtSymDef {
    fn unmarshal_union(selector: u16, buf: &mut ResponseBuffer) -> Result<Self> {
        match TpmAlgId::from_u16(selector) {
            Some(TpmAlgId::Null) => Ok(TpmtSymDef::Null),
            Some(TpmAlgId::Xor) => Ok(TpmtSymDef::Xor {
                hash_alg: get_hash_alg(buf)?,
            }),
            Some(algorithm @ TpmAlgId::Aes) => {
                let key_bits = buf.get_u16()?;
                let mode = get_alg(buf, "symmetric mode")?;
                Ok(TpmtSymDef::Cipher {
                    algorithm,
                    key_bits,
                    mode,
                })
            }
            _ => Err(Error::UnknownSelector {
                union: "TPMU_SYM_KEY_BITS",
                selector: selector as u32,
            }),
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let selector = buf.get_u16()?;
        Self::unmarshal_union(selector, buf)
    }
}

/// Scheme union shared by TPMT_RSA_SCHEME, TPMT_ECC_SCHEME,
/// TPMT_KEYEDHASH_SCHEME, TPMT_SIG_SCHEME and TPMT_KDF_SCHEME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmtScheme {
    Null,
    /// Schemes whose details are a single hash algorithm
    Hash {
        scheme: TpmAlgId,
        hash_alg: TpmAlgId,
    },
    EcDaa {
        hash_alg: TpmAlgId,
        count: u16,
    },
    Xor {
        hash_alg: TpmAlgId,
        kdf: TpmAlgId,
    },
    /// RSAES-PKCS1-v1_5 has empty details
    RsaEs,
}

impl TpmtScheme {
    pub fn hash(scheme: TpmAlgId, hash_alg: TpmAlgId) -> Self {
        TpmtScheme::Hash { scheme, hash_alg }
    }
}

impl Selector for TpmtScheme {
    fn selector(&self) -> u16 {
        match self {
            TpmtScheme::Null => TpmAlgId::Null.to_u16(),
            TpmtScheme::Hash { scheme, .. } => scheme.to_u16(),
            TpmtScheme::EcDaa { .. } => TpmAlgId::EcDaa.to_u16(),
            TpmtScheme::Xor { .. } => TpmAlgId::Xor.to_u16(),
            TpmtScheme::RsaEs => TpmAlgId::RsaEs.to_u16(),
        }
    }
}

impl Marshal for TpmtScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.selector());
        match self {
            TpmtScheme::Null | TpmtScheme::RsaEs => {}
            TpmtScheme::Hash { hash_alg, .. } => buf.put_u16(hash_alg.to_u16()),
            TpmtScheme::EcDaa { hash_alg, count } => {
                buf.put_u16(hash_alg.to_u16());
                buf.put_u16(*count);
            }
            TpmtScheme::Xor { hash_alg, kdf } => {
                buf.put_u16(hash_alg.to_u16());
                buf.put_u16(kdf.to_u16());
            }
        }
    }
}

impl UnmarshalUnion for TpmtScheme {
    fn unmarshal_union(selector: u16, buf: &mut ResponseBuffer) -> Result<Self> {
        use TpmAlgId::*;
        match TpmAlgId::from_u16(selector) {
            Some(Null) => Ok(TpmtScheme::Null),
            Some(RsaEs) => Ok(TpmtScheme::RsaEs),
            Some(EcDaa) => Ok(TpmtScheme::EcDaa {
                hash_alg: get_hash_alg(buf)?,
                count: buf.get_u16()?,
            }),
            Some(Xor) => Ok(TpmtScheme::Xor {
                hash_alg: get_hash_alg(buf)?,
                kdf: get_alg(buf, "kdf")?,
            }),
            Some(
                scheme @ (RsaSsa | RsaPss | Oaep | EcDsa | Ecdh | Sm2 | EcSchnorr | EcMqv
                | Hmac | Mgf1 | Kdf1Sp800_56a | Kdf2 | Kdf1Sp800_108),
            ) => Ok(TpmtScheme::Hash {
                scheme,
                hash_alg: get_hash_alg(buf)?,
            }),
            _ => Err(crate::error::Error::UnknownSelector {
                union: "TPMU_ASYM_SCHEME",
                selector: selector as u32,
            }),
        }
    }
}

impl Unmarshal for TpmtScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let selector = buf.get_u16()?;
        Self::unmarshal_union(selector, buf)
    }
}

/// TPMS_RSA_PARMS - RSA key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDef,
    pub scheme: TpmtScheme,
    pub key_bits: u16,
    pub exponent: u32,
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

impl Unmarshal for TpmsRsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            symmetric: TpmtSymDef::unmarshal(buf)?,
            scheme: TpmtScheme::unmarshal(buf)?,
            key_bits: buf.get_u16()?,
            exponent: buf.get_u32()?,
        })
    }
}

/// TPMS_ECC_PARMS - ECC key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsEccParms {
    pub symmetric: TpmtSymDef,
    pub scheme: TpmtScheme,
    pub curve_id: TpmEccCurve,
    pub kdf: TpmtScheme,
}

impl Marshal for TpmsEccParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.curve_id.to_u16());
        self.kdf.marshal(buf);
    }
}

impl Unmarshal for TpmsEccParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = TpmtSymDef::unmarshal(buf)?;
        let scheme = TpmtScheme::unmarshal(buf)?;
        let raw_curve = buf.get_u16()?;
        let curve_id = TpmEccCurve::from_u16(raw_curve).ok_or(Error::InvalidValue {
            kind: "ecc curve",
            value: raw_curve as u32,
        })?;
        let kdf = TpmtScheme::unmarshal(buf)?;
        Ok(Self {
            symmetric,
            scheme,
            curve_id,
            kdf,
        })
    }
}

/// TPMU_PUBLIC_PARMS - Public parameters union, selected by the object type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmuPublicParms {
    Rsa(TpmsRsaParms),
    Ecc(TpmsEccParms),
    KeyedHash(TpmtScheme),
    SymCipher(TpmtSymDef),
}

impl Selector for TpmuPublicParms {
    fn selector(&self) -> u16 {
        match self {
            TpmuPublicParms::Rsa(_) => TpmAlgId::Rsa.to_u16(),
            TpmuPublicParms::Ecc(_) => TpmAlgId::Ecc.to_u16(),
            TpmuPublicParms::KeyedHash(_) => TpmAlgId::KeyedHash.to_u16(),
            TpmuPublicParms::SymCipher(_) => TpmAlgId::SymCipher.to_u16(),
        }
    }
}

impl Marshal for TpmuPublicParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmuPublicParms::Rsa(p) => p.marshal(buf),
            TpmuPublicParms::Ecc(p) => p.marshal(buf),
            TpmuPublicParms::KeyedHash(s) => s.marshal(buf),
            TpmuPublicParms::SymCipher(s) => s.marshal(buf),
        }
    }
}

impl UnmarshalUnion for TpmuPublicParms {
    fn unmarshal_union(selector: u16, buf: &mut ResponseBuffer) -> Result<Self> {
        match TpmAlgId::from_u16(selector) {
            Some(TpmAlgId::Rsa) => Ok(TpmuPublicParms::Rsa(TpmsRsaParms::unmarshal(buf)?)),
            Some(TpmAlgId::Ecc) => Ok(TpmuPublicParms::Ecc(TpmsEccParms::unmarshal(buf)?)),
            Some(TpmAlgId::KeyedHash) => {
                Ok(TpmuPublicParms::KeyedHash(TpmtScheme::unmarshal(buf)?))
            }
            Some(TpmAlgId::SymCipher) => {
                Ok(TpmuPublicParms::SymCipher(TpmtSymDef::unmarshal(buf)?))
            }
            _ => Err(Error::UnknownSelector {
                union: "TPMU_PUBLIC_PARMS",
                selector: selector as u32,
            }),
        }
    }
}

/// TPMS_ECC_POINT - ECC point
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsEccPoint {
    pub x: Vec<u8>,
    pub y: Vec<u8>,
}

impl Marshal for TpmsEccPoint {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.x);
        buf.put_tpm2b(&self.y);
    }
}

impl Unmarshal for TpmsEccPoint {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            x: buf.get_tpm2b()?,
            y: buf.get_tpm2b()?,
        })
    }
}

/// TPMU_PUBLIC_ID - Unique identifier union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmuPublicId {
    Rsa(Vec<u8>),
    Ecc(TpmsEccPoint),
    KeyedHash(Vec<u8>),
    SymCipher(Vec<u8>),
}

impl Selector for TpmuPublicId {
    fn selector(&self) -> u16 {
        match self {
            TpmuPublicId::Rsa(_) => TpmAlgId::Rsa.to_u16(),
            TpmuPublicId::Ecc(_) => TpmAlgId::Ecc.to_u16(),
            TpmuPublicId::KeyedHash(_) => TpmAlgId::KeyedHash.to_u16(),
            TpmuPublicId::SymCipher(_) => TpmAlgId::SymCipher.to_u16(),
        }
    }
}

impl Marshal for TpmuPublicId {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmuPublicId::Rsa(n) => buf.put_tpm2b(n),
            TpmuPublicId::Ecc(p) => p.marshal(buf),
            TpmuPublicId::KeyedHash(d) | TpmuPublicId::SymCipher(d) => buf.put_tpm2b(d),
        }
    }
}

impl UnmarshalUnion for TpmuPublicId {
    fn unmarshal_union(selector: u16, buf: &mut ResponseBuffer) -> Result<Self> {
        match TpmAlgId::from_u16(selector) {
            Some(TpmAlgId::Rsa) => Ok(TpmuPublicId::Rsa(buf.get_tpm2b()?)),
            Some(TpmAlgId::Ecc) => Ok(TpmuPublicId::Ecc(TpmsEccPoint::unmarshal(buf)?)),
            Some(TpmAlgId::KeyedHash) => Ok(TpmuPublicId::KeyedHash(buf.get_tpm2b()?)),
            Some(TpmAlgId::SymCipher) => Ok(TpmuPublicId::SymCipher(buf.get_tpm2b()?)),
            _ => Err(Error::UnknownSelector {
                union: "TPMU_PUBLIC_ID",
                selector: selector as u32,
            }),
        }
    }
}

/// TPMT_PUBLIC - Public area
///
/// The object type is not stored: it is the selector of `parameters`, and
/// `unique` is parsed under the same selector, so the two must agree.
/// Marshaling a mismatched pair records an error in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmuPublicParms,
    pub unique: TpmuPublicId,
}

impl TpmtPublic {
    pub fn type_alg(&self) -> u16 {
        self.parameters.selector()
    }

    /// Create an RSA storage key template (SRK)
    pub fn rsa_storage_key() -> Self {
        Self {
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new().with(
                TpmaObject::FIXED_TPM
                    | TpmaObject::FIXED_PARENT
                    | TpmaObject::SENSITIVE_DATA_ORIGIN
                    | TpmaObject::USER_WITH_AUTH
                    | TpmaObject::RESTRICTED
                    | TpmaObject::DECRYPT,
            ),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmuPublicParms::Rsa(TpmsRsaParms {
                symmetric: TpmtSymDef::aes_128_cfb(),
                scheme: TpmtScheme::Null,
                key_bits: 2048,
                exponent: 0,
            }),
            unique: TpmuPublicId::Rsa(Vec::new()),
        }
    }

    /// Create an ECC P-256 storage key template
    pub fn ecc_storage_key() -> Self {
        Self {
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new().with(
                TpmaObject::FIXED_TPM
                    | TpmaObject::FIXED_PARENT
                    | TpmaObject::SENSITIVE_DATA_ORIGIN
                    | TpmaObject::USER_WITH_AUTH
                    | TpmaObject::RESTRICTED
                    | TpmaObject::DECRYPT,
            ),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmuPublicParms::Ecc(TpmsEccParms {
                symmetric: TpmtSymDef::aes_128_cfb(),
                scheme: TpmtScheme::Null,
                curve_id: TpmEccCurve::NistP256,
                kdf: TpmtScheme::Null,
            }),
            unique: TpmuPublicId::Ecc(TpmsEccPoint::default()),
        }
    }

    /// Create a sealed data object template
    pub fn sealed_object(policy_digest: Tpm2bDigest) -> Self {
        // Without a policy the object is usable with its auth value
        let mode = if policy_digest.is_empty() {
            TpmaObject::USER_WITH_AUTH
        } else {
            TpmaObject::ADMIN_WITH_POLICY
        };
        Self {
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with(TpmaObject::FIXED_TPM | TpmaObject::FIXED_PARENT | mode),
            auth_policy: policy_digest,
            parameters: TpmuPublicParms::KeyedHash(TpmtScheme::Null),
            unique: TpmuPublicId::KeyedHash(Vec::new()),
        }
    }

    /// Check that `unique` is of the object type `parameters` selects.
    pub fn validate(&self) -> Result<()> {
        let unique = self.unique.selector();
        if unique != self.type_alg() {
            return Err(Error::InvalidValue {
                kind: "TPMU_PUBLIC_ID selector",
                value: unique as u32,
            });
        }
        Ok(())
    }

    /// Object name: nameAlg || H_nameAlg(TPMT_PUBLIC)
    pub fn name(&self) -> Result<Vec<u8>> {
        let mut name = self.name_alg.to_u16().to_be_bytes().to_vec();
        name.extend(crypto::hash(self.name_alg, &[&self.try_to_bytes()?])?);
        Ok(name)
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        if let Err(err) = self.validate() {
            buf.fail(err);
        }
        buf.put_u16(self.type_alg());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        self.unique.marshal(buf);
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = buf.get_u16()?;
        let name_alg = get_hash_alg(buf)?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let parameters = TpmuPublicParms::unmarshal_union(type_alg, buf)?;
        let unique = TpmuPublicId::unmarshal_union(type_alg, buf)?;
        Ok(Self {
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPMU_SENSITIVE_COMPOSITE - Private key material, selected by object type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmuSensitiveComposite {
    Rsa(Vec<u8>),
    Ecc(Vec<u8>),
    Bits(Vec<u8>),
    Sym(Vec<u8>),
}

impl Selector for TpmuSensitiveComposite {
    fn selector(&self) -> u16 {
        match self {
            TpmuSensitiveComposite::Rsa(_) => TpmAlgId::Rsa.to_u16(),
            TpmuSensitiveComposite::Ecc(_) => TpmAlgId::Ecc.to_u16(),
            TpmuSensitiveComposite::Bits(_) => TpmAlgId::KeyedHash.to_u16(),
            TpmuSensitiveComposite::Sym(_) => TpmAlgId::SymCipher.to_u16(),
        }
    }
}

/// TPMT_SENSITIVE - Private area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtSensitive {
    pub auth_value: Vec<u8>,
    pub seed_value: Vec<u8>,
    pub sensitive: TpmuSensitiveComposite,
}

impl Marshal for TpmtSensitive {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.sensitive.selector());
        buf.put_tpm2b(&self.auth_value);
        buf.put_tpm2b(&self.seed_value);
        match &self.sensitive {
            TpmuSensitiveComposite::Rsa(v)
            | TpmuSensitiveComposite::Ecc(v)
            | TpmuSensitiveComposite::Bits(v)
            | TpmuSensitiveComposite::Sym(v) => buf.put_tpm2b(v),
        }
    }
}

impl Unmarshal for TpmtSensitive {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let selector = buf.get_u16()?;
        let auth_value = buf.get_tpm2b()?;
        let seed_value = buf.get_tpm2b()?;
        let sensitive = match TpmAlgId::from_u16(selector) {
            Some(TpmAlgId::Rsa) => TpmuSensitiveComposite::Rsa(buf.get_tpm2b()?),
            Some(TpmAlgId::Ecc) => TpmuSensitiveComposite::Ecc(buf.get_tpm2b()?),
            Some(TpmAlgId::KeyedHash) => TpmuSensitiveComposite::Bits(buf.get_tpm2b()?),
            Some(TpmAlgId::SymCipher) => TpmuSensitiveComposite::Sym(buf.get_tpm2b()?),
            _ => {
                return Err(Error::UnknownSelector {
                    union: "TPMU_SENSITIVE_COMPOSITE",
                    selector: selector as u32,
                })
            }
        };
        Ok(Self {
            auth_value,
            seed_value,
            sensitive,
        })
    }
}

/// TPMS_SENSITIVE_CREATE - Sensitive data for object creation
///
/// Always sent as a TPM2B_SENSITIVE_CREATE via [`CommandBuffer::put_sized`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsSensitiveCreate {
    pub user_auth: Tpm2bAuth,
    pub data: Tpm2bSensitiveData,
}

impl TpmsSensitiveCreate {
    pub fn with_auth(auth: impl Into<Vec<u8>>) -> Self {
        Self {
            user_auth: Tpm2bAuth::new(auth),
            data: Tpm2bSensitiveData::empty(),
        }
    }

    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            user_auth: Tpm2bAuth::empty(),
            data: Tpm2bSensitiveData::new(data),
        }
    }
}

impl Marshal for TpmsSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.user_auth.marshal(buf);
        self.data.marshal(buf);
    }
}

impl Unmarshal for TpmsSensitiveCreate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            user_auth: Tpm2bAuth::unmarshal(buf)?,
            data: Tpm2bSensitiveData::unmarshal(buf)?,
        })
    }
}

/// TPMS_CREATION_DATA - Creation data (returned as TPM2B_CREATION_DATA)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsCreationData {
    pub pcr_select: TpmlPcrSelection,
    pub pcr_digest: Tpm2bDigest,
    pub locality: u8,
    pub parent_name_alg: u16,
    pub parent_name: Tpm2bName,
    pub parent_qualified_name: Tpm2bName,
    pub outside_info: Tpm2bData,
}

impl Marshal for TpmsCreationData {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.pcr_select.marshal(buf);
        self.pcr_digest.marshal(buf);
        buf.put_u8(self.locality);
        buf.put_u16(self.parent_name_alg);
        self.parent_name.marshal(buf);
        self.parent_qualified_name.marshal(buf);
        self.outside_info.marshal(buf);
    }
}

impl Unmarshal for TpmsCreationData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            pcr_select: TpmlPcrSelection::unmarshal(buf)?,
            pcr_digest: Tpm2bDigest::unmarshal(buf)?,
            locality: buf.get_u8()?,
            parent_name_alg: buf.get_u16()?,
            parent_name: Tpm2bName::unmarshal(buf)?,
            parent_qualified_name: Tpm2bName::unmarshal(buf)?,
            outside_info: Tpm2bData::unmarshal(buf)?,
        })
    }
}

/// TPMT_TK_* - Ticket produced by the TPM; `tag` names the ticket kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTicket {
    pub tag: TpmSt,
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

pub type TpmtTkCreation = TpmtTicket;
pub type TpmtTkVerified = TpmtTicket;
pub type TpmtTkAuth = TpmtTicket;
pub type TpmtTkHashcheck = TpmtTicket;

impl TpmtTicket {
    /// NULL ticket accepted where a ticket is optional
    pub fn null(tag: TpmSt) -> Self {
        Self {
            tag,
            hierarchy: tpm_rh::NULL,
            digest: Tpm2bDigest::empty(),
        }
    }
}

impl Marshal for TpmtTicket {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag.to_u16());
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

impl Unmarshal for TpmtTicket {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(raw).ok_or(Error::InvalidValue {
            kind: "ticket tag",
            value: raw as u32,
        })?;
        Ok(Self {
            tag,
            hierarchy: buf.get_u32()?,
            digest: Tpm2bDigest::unmarshal(buf)?,
        })
    }
}

/// TPMS_CONTEXT - Saved object or session context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsContext {
    pub sequence: u64,
    pub saved_handle: u32,
    pub hierarchy: u32,
    pub context_blob: Vec<u8>,
}

impl Marshal for TpmsContext {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u64(self.sequence);
        buf.put_u32(self.saved_handle);
        buf.put_u32(self.hierarchy);
        buf.put_tpm2b(&self.context_blob);
    }
}

impl Unmarshal for TpmsContext {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            sequence: buf.get_u64()?,
            saved_handle: buf.get_u32()?,
            hierarchy: buf.get_u32()?,
            context_blob: buf.get_tpm2b()?,
        })
    }
}

/// TPMS_AUTH_COMMAND - One session in the command authorization area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAuthCommand {
    pub session_handle: u32,
    pub nonce: Vec<u8>,
    pub attributes: TpmaSa,
    pub hmac: Vec<u8>,
}

impl TpmsAuthCommand {
    /// Password authorization (TPM_RS_PW) carrying `auth` in the clear
    pub fn password(auth: &[u8]) -> Self {
        Self {
            session_handle: tpm_rh::PW,
            nonce: Vec::new(),
            attributes: TpmaSa::new(),
            hmac: auth.to_vec(),
        }
    }
}

impl Marshal for TpmsAuthCommand {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.session_handle);
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes.0);
        buf.put_tpm2b(&self.hmac);
    }
}

impl Unmarshal for TpmsAuthCommand {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            session_handle: buf.get_u32()?,
            nonce: buf.get_tpm2b()?,
            attributes: TpmaSa(buf.get_u8()?),
            hmac: buf.get_tpm2b()?,
        })
    }
}

/// TPMS_AUTH_RESPONSE - One session in the response authorization area
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsAuthResponse {
    pub nonce: Vec<u8>,
    pub attributes: TpmaSa,
    pub hmac: Vec<u8>,
}

impl Marshal for TpmsAuthResponse {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes.0);
        buf.put_tpm2b(&self.hmac);
    }
}

impl Unmarshal for TpmsAuthResponse {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nonce: buf.get_tpm2b()?,
            attributes: TpmaSa(buf.get_u8()?),
            hmac: buf.get_tpm2b()?,
        })
    }
}

/// TPMT_SIGNATURE - Signature, selected by signature algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtSignature {
    Null,
    Rsa {
        scheme: TpmAlgId,
        hash_alg: TpmAlgId,
        sig: Vec<u8>,
    },
    Ecc {
        scheme: TpmAlgId,
        hash_alg: TpmAlgId,
        r: Vec<u8>,
        s: Vec<u8>,
    },
    Hmac(TpmtHa),
}

impl Selector for TpmtSignature {
    fn selector(&self) -> u16 {
        match self {
            TpmtSignature::Null => TpmAlgId::Null.to_u16(),
            TpmtSignature::Rsa { scheme, .. } | TpmtSignature::Ecc { scheme, .. } => {
                scheme.to_u16()
            }
            TpmtSignature::Hmac(_) => TpmAlgId::Hmac.to_u16(),
        }
    }
}

impl Marshal for TpmtSignature {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.selector());
        match self {
            TpmtSignature::Null => {}
            TpmtSignature::Rsa { hash_alg, sig, .. } => {
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(sig);
            }
            TpmtSignature::Ecc { hash_alg, r, s, .. } => {
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(r);
                buf.put_tpm2b(s);
            }
            TpmtSignature::Hmac(ha) => ha.marshal(buf),
        }
    }
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        use TpmAlgId::*;
        let selector = buf.get_u16()?;
        match TpmAlgId::from_u16(selector) {
            Some(Null) => Ok(TpmtSignature::Null),
            Some(scheme @ (RsaSsa | RsaPss)) => Ok(TpmtSignature::Rsa {
                scheme,
                hash_alg: get_hash_alg(buf)?,
                sig: buf.get_tpm2b()?,
            }),
            Some(scheme @ (EcDsa | EcDaa | Sm2 | EcSchnorr)) => Ok(TpmtSignature::Ecc {
                scheme,
                hash_alg: get_hash_alg(buf)?,
                r: buf.get_tpm2b()?,
                s: buf.get_tpm2b()?,
            }),
            Some(Hmac) => Ok(TpmtSignature::Hmac(TpmtHa::unmarshal(buf)?)),
            _ => Err(crate::error::Error::UnknownSelector {
                union: "TPMU_SIGNATURE",
                selector: selector as u32,
            }),
        }
    }
}

/// TPMS_NV_PUBLIC - NV index public area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsNvPublic {
    pub nv_index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: TpmaNv,
    pub auth_policy: Tpm2bDigest,
    pub data_size: u16,
}

impl TpmsNvPublic {
    pub fn new(nv_index: u32, data_size: u16, attributes: TpmaNv) -> Self {
        Self {
            nv_index,
            name_alg: TpmAlgId::Sha256,
            attributes,
            auth_policy: Tpm2bDigest::empty(),
            data_size,
        }
    }

    /// NV index name: nameAlg || H_nameAlg(TPMS_NV_PUBLIC)
    pub fn name(&self) -> Result<Vec<u8>> {
        let mut name = self.name_alg.to_u16().to_be_bytes().to_vec();
        name.extend(crypto::hash(self.name_alg, &[&self.try_to_bytes()?])?);
        Ok(name)
    }
}

impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.attributes.0);
        self.auth_policy.marshal(buf);
        buf.put_u16(self.data_size);
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nv_index: buf.get_u32()?,
            name_alg: get_hash_alg(buf)?,
            attributes: TpmaNv(buf.get_u32()?),
            auth_policy: Tpm2bDigest::unmarshal(buf)?,
            data_size: buf.get_u16()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Marshal + Unmarshal + PartialEq + std::fmt::Debug>(v: &T) {
        let bytes = v.to_bytes();
        assert_eq!(&T::from_bytes(&bytes).unwrap(), v);
    }

    #[test]
    fn test_public_area_round_trip() {
        round_trip(&TpmtPublic::rsa_storage_key());
        round_trip(&TpmtPublic::ecc_storage_key());
        round_trip(&TpmtPublic::sealed_object(Tpm2bDigest::new(vec![7u8; 32])));
    }

    #[test]
    fn test_public_area_layout() {
        let bytes = TpmtPublic::rsa_storage_key().to_bytes();
        // type RSA, nameAlg SHA256, attributes 0x00030072
        assert_eq!(&bytes[..8], &[0x00, 0x01, 0x00, 0x0B, 0x00, 0x03, 0x00, 0x72]);
        // empty policy, then AES-128-CFB, NULL scheme, 2048 bits, exponent 0, empty unique
        assert_eq!(
            &bytes[8..],
            &[
                0x00, 0x00, 0x00, 0x06, 0x00, 0x80, 0x00, 0x43, 0x00, 0x10, 0x08, 0x00, 0, 0, 0,
                0, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_unknown_public_type_is_selector_error() {
        let mut bytes = TpmtPublic::sealed_object(Tpm2bDigest::empty()).to_bytes();
        bytes[0] = 0x00;
        bytes[1] = 0x42;
        assert!(matches!(
            TpmtPublic::from_bytes(&bytes),
            Err(Error::UnknownSelector {
                union: "TPMU_PUBLIC_PARMS",
                selector: 0x42
            })
        ));
    }

    #[test]
    fn test_mismatched_unique_is_rejected() {
        let mut public = TpmtPublic::rsa_storage_key();
        public.unique = TpmuPublicId::Ecc(TpmsEccPoint::default());
        let expected = TpmAlgId::Ecc.to_u16() as u32;
        assert!(matches!(
            public.validate(),
            Err(Error::InvalidValue {
                kind: "TPMU_PUBLIC_ID selector",
                value
            }) if value == expected
        ));
        assert!(matches!(public.try_to_bytes(), Err(Error::InvalidValue { .. })));
        assert!(matches!(public.name(), Err(Error::InvalidValue { .. })));

        let mut buf = CommandBuffer::new();
        buf.put_sized(SizeWidth::U16, Some(&public));
        assert!(buf.finish().is_err());

        TpmtPublic::ecc_storage_key().validate().unwrap();
        TpmtPublic::sealed_object(Tpm2bDigest::empty()).validate().unwrap();
    }

    #[test]
    fn test_sym_def_variants() {
        round_trip(&TpmtSymDef::Null);
        round_trip(&TpmtSymDef::aes_128_cfb());
        let xor = TpmtSymDef::Xor {
            hash_alg: TpmAlgId::Sha256,
        };
        assert_eq!(xor.to_bytes(), vec![0x00, 0x0A, 0x00, 0x0B]);
        round_trip(&xor);
    }

    #[test]
    fn test_sensitive_round_trip_sized() {
        let sens = TpmtSensitive {
            auth_value: b"pw".to_vec(),
            seed_value: vec![1; 32],
            sensitive: TpmuSensitiveComposite::Bits(b"secret".to_vec()),
        };
        let mut buf = CommandBuffer::new();
        buf.put_sized(SizeWidth::U16, Some(&sens));
        let bytes = buf.into_vec();
        assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]) as usize, bytes.len() - 2);
        let mut rb = ResponseBuffer::new(&bytes);
        assert_eq!(rb.get_sized::<TpmtSensitive>(SizeWidth::U16).unwrap(), Some(sens));
    }

    #[test]
    fn test_signature_round_trip() {
        round_trip(&TpmtSignature::Ecc {
            scheme: TpmAlgId::EcDsa,
            hash_alg: TpmAlgId::Sha256,
            r: vec![1; 32],
            s: vec![2; 32],
        });
        round_trip(&TpmtSignature::Hmac(TpmtHa {
            hash_alg: TpmAlgId::Sha1,
            digest: vec![3; 20],
        }));
    }

    #[test]
    fn test_pcr_selection_bitmap() {
        let sel = TpmsPcrSelection::new(TpmAlgId::Sha256, &[0, 7, 16]);
        assert_eq!(sel.pcr_select, vec![0x81, 0x00, 0x01]);
        assert_eq!(sel.pcrs(), vec![0, 7, 16]);
        round_trip(&TpmlPcrSelection::single(TpmAlgId::Sha1, &[23]));
    }

    #[test]
    fn test_nv_public_name() {
        let nv = TpmsNvPublic::new(0x01500000, 32, TpmaNv::new().with(TpmaNv::AUTH_WRITE));
        let name = nv.name().unwrap();
        assert_eq!(name.len(), 34);
        assert_eq!(&name[..2], &[0x00, 0x0B]);
        round_trip(&nv);
    }
}
