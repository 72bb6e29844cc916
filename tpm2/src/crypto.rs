// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Host-side crypto used by sessions, policies and key wrapping
//!
//! Thin wrappers over RustCrypto crates, keyed by TPM algorithm ids.

use aes::{Aes128, Aes192, Aes256};
use cfb_mode::{Decryptor, Encryptor};
use cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::{rngs::OsRng, thread_rng, RngCore};
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::constants::{TpmAlgId, TpmEccCurve};
use crate::error::{Error, Result};
use crate::marshal::{Marshal, Unmarshal};
use crate::types::{TpmsEccPoint, TpmtPublic, TpmuPublicId, TpmuPublicParms};

/// Dispatch `$body` with `$D` bound to the digest type for `$alg`.
macro_rules! with_digest {
    ($alg:expr, $D:ident => $body:expr) => {
        match $alg {
            TpmAlgId::Sha1 => {
                type $D = Sha1;
                $body
            }
            TpmAlgId::Sha256 => {
                type $D = Sha256;
                $body
            }
            TpmAlgId::Sha384 => {
                type $D = Sha384;
                $body
            }
            TpmAlgId::Sha512 => {
                type $D = Sha512;
                $body
            }
            other => return Err(Error::UnsupportedAlgorithm(other.to_u16())),
        }
    };
}

/// H(parts[0] || parts[1] || ...)
pub fn hash(alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>> {
    Ok(with_digest!(alg, D => {
        let mut h = D::new();
        for part in parts {
            h.update(part);
        }
        h.finalize().to_vec()
    }))
}

/// HMAC(key, parts[0] || parts[1] || ...)
pub fn hmac(alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    Ok(with_digest!(alg, D => {
        let mut mac = <Hmac<D> as Mac>::new_from_slice(key).map_err(Error::crypto)?;
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().to_vec()
    }))
}

/// Labels are used with their terminating NUL; append one if missing.
fn terminated(label: &[u8]) -> Vec<u8> {
    let mut l = label.to_vec();
    if l.last() != Some(&0) {
        l.push(0);
    }
    l
}

fn truncate_bits(mut out: Vec<u8>, bits: u32) -> Vec<u8> {
    out.truncate((bits as usize).div_ceil(8));
    if bits % 8 != 0 {
        out[0] &= (1u8 << (bits % 8)) - 1;
    }
    out
}

/// SP800-108 counter-mode KDF with HMAC (TPM 2.0 Part 1, 11.4.10.2)
pub fn kdfa(
    alg: TpmAlgId,
    key: &[u8],
    label: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>> {
    let label = terminated(label);
    let needed = (bits as usize).div_ceil(8);
    let mut out = Vec::with_capacity(needed + alg.digest_size());
    let mut counter: u32 = 1;
    while out.len() < needed {
        out.extend(hmac(
            alg,
            key,
            &[
                &counter.to_be_bytes(),
                &label,
                context_u,
                context_v,
                &bits.to_be_bytes(),
            ],
        )?);
        counter += 1;
    }
    Ok(truncate_bits(out, bits))
}

/// SP800-56A concatenation KDF (TPM 2.0 Part 1, 11.4.10.3)
pub fn kdfe(
    alg: TpmAlgId,
    z: &[u8],
    label: &[u8],
    party_u: &[u8],
    party_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>> {
    let label = terminated(label);
    let needed = (bits as usize).div_ceil(8);
    let mut out = Vec::with_capacity(needed + alg.digest_size());
    let mut counter: u32 = 1;
    while out.len() < needed {
        out.extend(hash(
            alg,
            &[&counter.to_be_bytes(), z, &label, party_u, party_v],
        )?);
        counter += 1;
    }
    Ok(truncate_bits(out, bits))
}

pub fn cfb_encrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    match key.len() {
        16 => Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(Error::crypto)?
            .encrypt(data),
        24 => Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(Error::crypto)?
            .encrypt(data),
        32 => Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(Error::crypto)?
            .encrypt(data),
        n => return Err(Error::Crypto(format!("invalid AES key length {n}"))),
    }
    Ok(())
}

pub fn cfb_decrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    match key.len() {
        16 => Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(Error::crypto)?
            .decrypt(data),
        24 => Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(Error::crypto)?
            .decrypt(data),
        32 => Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(Error::crypto)?
            .decrypt(data),
        n => return Err(Error::Crypto(format!("invalid AES key length {n}"))),
    }
    Ok(())
}

/// XOR obfuscation (TPM 2.0 Part 1, 21.2); the operation is its own inverse.
pub fn xor_obfuscate(
    alg: TpmAlgId,
    key: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    data: &mut [u8],
) -> Result<()> {
    let mask = kdfa(
        alg,
        key,
        b"XOR",
        nonce_newer,
        nonce_older,
        (data.len() * 8) as u32,
    )?;
    for (b, m) in data.iter_mut().zip(mask) {
        *b ^= m;
    }
    Ok(())
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    thread_rng().fill_bytes(&mut out);
    out
}

/// Constant-time byte comparison
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn oaep(alg: TpmAlgId, label: &str) -> Result<Oaep> {
    let label = format!("{label}\0");
    Ok(match alg {
        TpmAlgId::Sha1 => Oaep::new_with_label::<Sha1, _>(label),
        TpmAlgId::Sha256 => Oaep::new_with_label::<Sha256, _>(label),
        TpmAlgId::Sha384 => Oaep::new_with_label::<Sha384, _>(label),
        TpmAlgId::Sha512 => Oaep::new_with_label::<Sha512, _>(label),
        other => return Err(Error::UnsupportedAlgorithm(other.to_u16())),
    })
}

fn pad_left(v: &[u8], len: usize) -> Result<Vec<u8>> {
    if v.len() > len {
        return Err(Error::Crypto(format!("coordinate longer than {len} bytes")));
    }
    let mut out = vec![0u8; len - v.len()];
    out.extend_from_slice(v);
    Ok(out)
}

fn p256_public(point: &TpmsEccPoint) -> Result<p256::PublicKey> {
    let mut sec1 = vec![0x04];
    sec1.extend(pad_left(&point.x, 32)?);
    sec1.extend(pad_left(&point.y, 32)?);
    p256::PublicKey::from_sec1_bytes(&sec1).map_err(Error::crypto)
}

/// Generate a seed and protect it to `parent` (TPM 2.0 Part 1, Annex B/C).
///
/// Returns `(seed, encrypted_secret)`; `label` is used without its NUL
/// ("DUPLICATE", "SECRET", "IDENTITY").
pub fn protect_seed(parent: &TpmtPublic, label: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let name_alg = parent.name_alg;
    match (&parent.parameters, &parent.unique) {
        (TpmuPublicParms::Rsa(parms), TpmuPublicId::Rsa(modulus)) => {
            let exponent = if parms.exponent == 0 {
                65537
            } else {
                parms.exponent
            };
            let key = RsaPublicKey::new(
                BigUint::from_bytes_be(modulus),
                BigUint::from(exponent),
            )
            .map_err(Error::crypto)?;
            let seed = random_bytes(name_alg.digest_size());
            let secret = key
                .encrypt(&mut thread_rng(), oaep(name_alg, label)?, &seed)
                .map_err(Error::crypto)?;
            Ok((seed, secret))
        }
        (TpmuPublicParms::Ecc(parms), TpmuPublicId::Ecc(point)) => {
            if parms.curve_id != TpmEccCurve::NistP256 {
                return Err(Error::UnsupportedAlgorithm(parms.curve_id.to_u16()));
            }
            let parent_key = p256_public(point)?;
            let ephemeral = p256::ecdh::EphemeralSecret::random(&mut OsRng);
            let encoded = ephemeral.public_key().to_encoded_point(false);
            let q = TpmsEccPoint {
                x: encoded.as_bytes()[1..33].to_vec(),
                y: encoded.as_bytes()[33..65].to_vec(),
            };
            let shared = ephemeral.diffie_hellman(&parent_key);
            let seed = kdfe(
                name_alg,
                shared.raw_secret_bytes(),
                label.as_bytes(),
                &q.x,
                &pad_left(&point.x, 32)?,
                (name_alg.digest_size() * 8) as u32,
            )?;
            Ok((seed, q.to_bytes()))
        }
        _ => Err(Error::UnsupportedAlgorithm(parent.type_alg())),
    }
}

/// Private half of a parent key, for recovering protected seeds.
pub enum ParentSecret<'a> {
    Rsa(&'a RsaPrivateKey),
    Ecc(&'a p256::SecretKey),
}

/// Recover a seed produced by [`protect_seed`] with the parent's private key.
pub fn recover_seed(
    parent: &TpmtPublic,
    secret_key: ParentSecret<'_>,
    label: &str,
    encrypted: &[u8],
) -> Result<Vec<u8>> {
    let name_alg = parent.name_alg;
    match (secret_key, &parent.unique) {
        (ParentSecret::Rsa(key), TpmuPublicId::Rsa(_)) => key
            .decrypt(oaep(name_alg, label)?, encrypted)
            .map_err(Error::crypto),
        (ParentSecret::Ecc(key), TpmuPublicId::Ecc(point)) => {
            let q = TpmsEccPoint::from_bytes(encrypted)?;
            let ephemeral = p256_public(&q)?;
            let shared =
                p256::ecdh::diffie_hellman(key.to_nonzero_scalar(), ephemeral.as_affine());
            kdfe(
                name_alg,
                shared.raw_secret_bytes(),
                label.as_bytes(),
                &pad_left(&q.x, 32)?,
                &pad_left(&point.x, 32)?,
                (name_alg.digest_size() * 8) as u32,
            )
        }
        _ => Err(Error::UnsupportedAlgorithm(parent.type_alg())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_known_vector() {
        assert_eq!(
            hex::encode(hash(TpmAlgId::Sha256, &[b"a", b"bc"]).unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(matches!(
            hash(TpmAlgId::Aes, &[b"abc"]),
            Err(Error::UnsupportedAlgorithm(0x0006))
        ));
    }

    #[test]
    fn test_hmac_rfc4231_case2() {
        let mac = hmac(TpmAlgId::Sha256, b"Jefe", &[b"what do ya want ", b"for nothing?"]).unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_kdfa_single_block_matches_hmac() {
        let key = [0x11u8; 32];
        let out = kdfa(TpmAlgId::Sha256, &key, b"ATH", b"u", b"v", 256).unwrap();
        let expected = hmac(
            TpmAlgId::Sha256,
            &key,
            &[&1u32.to_be_bytes(), b"ATH\0", b"u", b"v", &256u32.to_be_bytes()],
        )
        .unwrap();
        assert_eq!(out, expected);
        // an explicit terminator is not doubled
        assert_eq!(kdfa(TpmAlgId::Sha256, &key, b"ATH\0", b"u", b"v", 256).unwrap(), out);
    }

    #[test]
    fn test_kdfa_multi_block_and_odd_bits() {
        let out = kdfa(TpmAlgId::Sha1, b"k", b"CFB", b"", b"", 256).unwrap();
        assert_eq!(out.len(), 32);
        let odd = kdfa(TpmAlgId::Sha256, b"k", b"L", b"", b"", 12).unwrap();
        assert_eq!(odd.len(), 2);
        assert_eq!(odd[0] & 0xF0, 0);
    }

    #[test]
    fn test_cfb_round_trip() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let mut data = b"parameter to hide".to_vec();
        cfb_encrypt(&key, &iv, &mut data).unwrap();
        assert_ne!(&data[..], b"parameter to hide");
        cfb_decrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(&data[..], b"parameter to hide");
        assert!(cfb_encrypt(&[0u8; 5], &iv, &mut data).is_err());
    }

    #[test]
    fn test_xor_is_involution() {
        let mut data = vec![1, 2, 3, 4, 5];
        xor_obfuscate(TpmAlgId::Sha256, b"key", b"new", b"old", &mut data).unwrap();
        assert_ne!(data, vec![1, 2, 3, 4, 5]);
        xor_obfuscate(TpmAlgId::Sha256, b"key", b"new", b"old", &mut data).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_ecc_seed_protection() {
        let secret = p256::SecretKey::random(&mut OsRng);
        let encoded = secret.public_key().to_encoded_point(false);
        let mut parent = TpmtPublic::ecc_storage_key();
        parent.unique = TpmuPublicId::Ecc(TpmsEccPoint {
            x: encoded.as_bytes()[1..33].to_vec(),
            y: encoded.as_bytes()[33..65].to_vec(),
        });
        let (seed, encrypted) = protect_seed(&parent, "DUPLICATE").unwrap();
        assert_eq!(seed.len(), 32);
        let recovered =
            recover_seed(&parent, ParentSecret::Ecc(&secret), "DUPLICATE", &encrypted).unwrap();
        assert_eq!(recovered, seed);
        let other =
            recover_seed(&parent, ParentSecret::Ecc(&secret), "SECRET", &encrypted).unwrap();
        assert_ne!(other, seed);
    }
}
