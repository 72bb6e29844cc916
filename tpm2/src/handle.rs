// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Handles with their cached Name and Auth value

use crate::constants::{tpm_rh, TpmHt};
use crate::error::{Error, Result};

/// A TPM handle plus the Name and Auth value the caller knows for it.
///
/// The handle class is fixed by the top byte of `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmHandle {
    pub value: u32,
    name: Option<Vec<u8>>,
    auth: Option<Vec<u8>>,
}

impl TpmHandle {
    pub fn new(value: u32) -> Self {
        Self {
            value,
            name: None,
            auth: None,
        }
    }

    pub fn owner() -> Self {
        Self::new(tpm_rh::OWNER)
    }

    pub fn endorsement() -> Self {
        Self::new(tpm_rh::ENDORSEMENT)
    }

    pub fn platform() -> Self {
        Self::new(tpm_rh::PLATFORM)
    }

    pub fn null() -> Self {
        Self::new(tpm_rh::NULL)
    }

    pub fn kind(&self) -> Option<TpmHt> {
        TpmHt::of(self.value)
    }

    pub fn with_auth(mut self, auth: impl Into<Vec<u8>>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<Vec<u8>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn set_auth(&mut self, auth: impl Into<Vec<u8>>) {
        self.auth = Some(auth.into());
    }

    pub fn set_name(&mut self, name: impl Into<Vec<u8>>) {
        self.name = Some(name.into());
    }

    /// Forget Name and Auth once the entity is gone.
    pub fn clear(&mut self) {
        self.name = None;
        self.auth = None;
    }

    /// Auth value, or the empty string when none was set.
    pub fn auth(&self) -> &[u8] {
        self.auth.as_deref().unwrap_or_default()
    }

    /// Name used in cpHash/rpHash and HMAC computations.
    ///
    /// PCRs, permanent handles and sessions are named by their handle value.
    /// Objects and NV indices need a cached name.
    pub fn name(&self) -> Result<Vec<u8>> {
        match self.kind() {
            Some(TpmHt::Transient | TpmHt::Persistent | TpmHt::NvIndex) => {
                self.name.clone().ok_or(Error::MissingName(self.value))
            }
            _ => Ok(self.value.to_be_bytes().to_vec()),
        }
    }

    pub fn cached_name(&self) -> Option<&[u8]> {
        self.name.as_deref()
    }
}

impl From<u32> for TpmHandle {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}
