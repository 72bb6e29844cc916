// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Crate error type

use thiserror::Error;

use crate::constants::{TpmCc, TpmRc};

pub type Result<T> = std::result::Result<T, Error>;

/// Slot class managed by the resource manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotClass {
    Object,
    Session,
}

impl std::fmt::Display for SlotClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotClass::Object => f.write_str("object"),
            SlotClass::Session => f.write_str("session"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer underflow reading {wanted} bytes (remaining: {remaining})")]
    Truncated { wanted: usize, remaining: usize },
    #[error("declared length {declared} exceeds remaining buffer ({remaining} bytes)")]
    BadLength { declared: usize, remaining: usize },
    #[error("unknown selector {selector:#06x} for {union}")]
    UnknownSelector { union: &'static str, selector: u32 },
    #[error("invalid {kind} value {value:#x}")]
    InvalidValue { kind: &'static str, value: u32 },
    #[error("{count} trailing bytes after {what}")]
    TrailingBytes { what: &'static str, count: usize },
    #[error("logic error: {0}")]
    Logic(String),
    #[error("{cc:?} failed with response code {rc:#010x} ({kind:?})")]
    Tpm { cc: TpmCc, rc: u32, kind: TpmRc },
    #[error("response HMAC mismatch for session {session:#010x}")]
    ResponseHmac { session: u32 },
    #[error("handle {0:#010x} has no name, required for HMAC authorization")]
    MissingName(u32),
    #[error("session {0:#010x} has no symmetric algorithm for parameter encryption")]
    NoSymmetric(u32),
    #[error("unknown policy branch {0:?}")]
    UnknownBranch(String),
    #[error("integrity check failed: {0}")]
    Integrity(&'static str),
    #[error("no evictable {0} slot")]
    ResourceExhausted(SlotClass),
    #[error("unsupported algorithm {0:#06x}")]
    UnsupportedAlgorithm(u16),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl Error {
    /// TPM response code carried by this error, if the TPM produced one.
    pub fn response_code(&self) -> Option<u32> {
        match self {
            Error::Tpm { rc, .. } => Some(*rc),
            _ => None,
        }
    }

    pub(crate) fn logic(msg: impl Into<String>) -> Self {
        Error::Logic(msg.into())
    }

    pub(crate) fn crypto(err: impl std::fmt::Display) -> Self {
        Error::Crypto(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_only_for_tpm_errors() {
        let err = Error::Tpm {
            cc: TpmCc::Load,
            rc: 0x98E,
            kind: TpmRc::from_u32(0x98E),
        };
        assert_eq!(err.response_code(), Some(0x98E));
        assert!(err.to_string().contains("Load"));
        assert_eq!(Error::logic("x").response_code(), None);
        assert_eq!(
            Error::ResourceExhausted(SlotClass::Session).to_string(),
            "no evictable session slot"
        );
    }
}
