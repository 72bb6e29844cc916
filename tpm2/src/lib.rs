// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 command/response engine
//!
//! This crate speaks the TPM 2.0 wire protocol directly, without C library
//! dependencies, and layers the client-side machinery on top of it.
//!
//! ## Components
//!
//! - **Wire codec** ([`marshal`], [`types`]): big-endian marshaling with
//!   selector-driven unions, TPM2B blobs and back-patched size fields
//! - **Framing** ([`command`]): command headers, handle/auth/parameter areas
//!   and response parsing
//! - **Authorization sessions** ([`session`]): password, HMAC and policy
//!   sessions, cpHash/rpHash, nonce rolling and parameter encryption
//! - **Policy evaluation** ([`policy`]): offline policy digests and replay of
//!   a chosen branch against a live policy session
//! - **Resource manager** ([`resource_manager`]): virtual handles for many
//!   clients over a TPM with a few object and session slots
//! - **Key wrapping** ([`wrap`]): private blobs and duplication/import blobs
//!
//! ## Example
//!
//! ```no_run
//! use tpm2_engine::{TpmAlgId, TpmContext};
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let random_bytes = ctx.get_random(32)?;
//! let session = ctx.start_policy_session(TpmAlgId::Sha256)?;
//! ctx.flush_context(session)?;
//! # Ok::<(), tpm2_engine::Error>(())
//! ```

pub mod command;
pub mod commands;
pub mod constants;
pub mod crypto;
pub mod device;
pub mod error;
pub mod handle;
pub mod marshal;
pub mod policy;
pub mod resource_manager;
pub mod session;
pub mod types;
pub mod wrap;

pub use commands::{RequestOptions, TpmContext};
pub use constants::*;
pub use error::{Error, Result, SlotClass};
pub use handle::TpmHandle;
pub use types::*;

pub use command::{TpmCommand, TpmResponse};
pub use device::{TcpSimulator, TpmDevice, Transport};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use policy::{PolicyAssertion, PolicyCallbacks, PolicyEvaluator, PolicyTree};
pub use resource_manager::{ResourceManager, ResourceManagerConfig, RmClient};
pub use session::{AuthSession, AuthSpec};
