// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command/response framing
//!
//! A command is `tag || size || cc || handles || [authSize || sessions] ||
//! parameters`; a response is `tag || size || rc || handles ||
//! [paramSize] || parameters || [sessions]`. Nothing here knows what the
//! parameters mean.

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::types::{TpmsAuthCommand, TpmsAuthResponse};

/// Command/response header size: tag (2) + size (4) + code (4)
pub const HEADER_SIZE: usize = 10;

/// A framed TPM command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmCommand {
    pub cc: TpmCc,
    pub handles: Vec<u32>,
    pub sessions: Vec<TpmsAuthCommand>,
    pub parameters: Vec<u8>,
}

impl TpmCommand {
    pub fn new(cc: TpmCc) -> Self {
        Self {
            cc,
            handles: Vec::new(),
            sessions: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Add a handle to the command
    pub fn add_handle(&mut self, handle: u32) {
        self.handles.push(handle);
    }

    pub fn add_session(&mut self, session: TpmsAuthCommand) {
        self.sessions.push(session);
    }

    /// Add password authorization session (null auth)
    pub fn add_null_auth_area(&mut self) {
        self.sessions.push(TpmsAuthCommand::password(&[]));
    }

    /// Add a marshallable parameter
    pub fn add<T: Marshal>(&mut self, value: &T) -> Result<()> {
        self.parameters.extend(value.try_to_bytes()?);
        Ok(())
    }

    pub fn add_u8(&mut self, v: u8) {
        self.parameters.push(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.parameters.extend_from_slice(&v.to_be_bytes());
    }

    pub fn add_u32(&mut self, v: u32) {
        self.parameters.extend_from_slice(&v.to_be_bytes());
    }

    pub fn add_tpm2b(&mut self, data: &[u8]) -> Result<()> {
        let len = u16::try_from(data.len()).map_err(|_| Error::InvalidValue {
            kind: "TPM2B length",
            value: u32::try_from(data.len()).unwrap_or(u32::MAX),
        })?;
        self.add_u16(len);
        self.parameters.extend_from_slice(data);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        build_command(self.cc, &self.handles, &self.sessions, &self.parameters)
    }

    /// Parse a raw command; the handle count comes from the command code.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(bytes);
        let tag = buf.get_u16()?;
        let size = buf.get_u32()? as usize;
        check_size(size, bytes.len(), "command")?;
        let raw_cc = buf.get_u32()?;
        let cc = TpmCc::from_u32(raw_cc).ok_or(Error::InvalidValue {
            kind: "command code",
            value: raw_cc,
        })?;

        let handles = (0..cc.info().in_handles)
            .map(|_| buf.get_u32())
            .collect::<Result<Vec<_>>>()?;

        let sessions = match TpmSt::from_u16(tag) {
            Some(TpmSt::Sessions) => {
                let auth_size = buf.get_length(SizeWidth::U32)?;
                let area = buf.get_bytes(auth_size)?;
                let mut area = ResponseBuffer::new(&area);
                let mut sessions = Vec::new();
                while area.remaining() > 0 {
                    sessions.push(TpmsAuthCommand::unmarshal(&mut area)?);
                }
                sessions
            }
            Some(TpmSt::NoSessions) => Vec::new(),
            _ => {
                return Err(Error::InvalidValue {
                    kind: "command tag",
                    value: tag as u32,
                })
            }
        };

        Ok(Self {
            cc,
            handles,
            sessions,
            parameters: buf.get_remaining(),
        })
    }
}

fn check_size(declared: usize, actual: usize, what: &'static str) -> Result<()> {
    if declared > actual {
        return Err(Error::BadLength {
            declared,
            remaining: actual,
        });
    }
    if declared < actual {
        return Err(Error::TrailingBytes {
            what,
            count: actual - declared,
        });
    }
    if declared < HEADER_SIZE {
        return Err(Error::Truncated {
            wanted: HEADER_SIZE,
            remaining: declared,
        });
    }
    Ok(())
}

/// Frame a command. The tag reflects whether an authorization area is
/// present; the total size is a frame-size placeholder closed last.
pub fn build_command(
    cc: TpmCc,
    handles: &[u32],
    sessions: &[TpmsAuthCommand],
    parameters: &[u8],
) -> Result<Vec<u8>> {
    let mut buf = CommandBuffer::with_capacity(HEADER_SIZE + parameters.len() + 64);
    let tag = if sessions.is_empty() {
        TpmSt::NoSessions
    } else {
        TpmSt::Sessions
    };
    buf.put_u16(tag.to_u16());
    let total = buf.push_size(SizeWidth::U32);
    buf.put_u32(cc.to_u32());
    for &handle in handles {
        buf.put_u32(handle);
    }
    if !sessions.is_empty() {
        let auth_size = buf.push_size(SizeWidth::U32);
        for session in sessions {
            session.marshal(&mut buf);
        }
        buf.pop_size(auth_size)?;
    }
    buf.put_bytes(parameters);
    buf.pop_frame_size(total)?;
    buf.finish()
}

/// A parsed TPM response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub handles: Vec<u32>,
    /// Parameters only; output handles are excluded (they are not covered
    /// by rpHash)
    pub parameters: Vec<u8>,
    pub sessions: Vec<TpmsAuthResponse>,
}

impl TpmResponse {
    /// Check if the response indicates success
    pub fn is_success(&self) -> bool {
        self.response_code == rc::SUCCESS
    }

    /// Ensure the response is successful
    pub fn ensure_success(&self, cc: TpmCc) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::Tpm {
                cc,
                rc: self.response_code,
                kind: TpmRc::from_u32(self.response_code),
            })
        }
    }

    /// Get a response buffer for parsing the parameters
    pub fn params_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.parameters)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        build_response(self.response_code, &self.handles, &self.parameters, &self.sessions)
    }
}

/// Parse a response to a command producing `out_handles` handles.
///
/// Non-success codes parse without error: the handle, parameter and session
/// areas are empty and any bytes after the header are kept as parameters.
pub fn parse_response(bytes: &[u8], out_handles: usize) -> Result<TpmResponse> {
    let mut buf = ResponseBuffer::new(bytes);
    let raw_tag = buf.get_u16()?;
    let tag = TpmSt::from_u16(raw_tag).ok_or(Error::InvalidValue {
        kind: "response tag",
        value: raw_tag as u32,
    })?;
    let size = buf.get_u32()? as usize;
    check_size(size, bytes.len(), "response")?;
    let response_code = buf.get_u32()?;

    if response_code != rc::SUCCESS {
        return Ok(TpmResponse {
            tag,
            response_code,
            handles: Vec::new(),
            parameters: buf.get_remaining(),
            sessions: Vec::new(),
        });
    }

    let handles = (0..out_handles)
        .map(|_| buf.get_u32())
        .collect::<Result<Vec<_>>>()?;

    let (parameters, sessions) = match tag {
        TpmSt::Sessions => {
            let param_size = buf.get_length(SizeWidth::U32)?;
            let parameters = buf.get_bytes(param_size)?;
            let mut sessions = Vec::new();
            while buf.remaining() > 0 {
                sessions.push(TpmsAuthResponse::unmarshal(&mut buf)?);
            }
            (parameters, sessions)
        }
        TpmSt::NoSessions => (buf.get_remaining(), Vec::new()),
        other => {
            return Err(Error::InvalidValue {
                kind: "response tag",
                value: other.to_u16() as u32,
            })
        }
    };

    Ok(TpmResponse {
        tag,
        response_code,
        handles,
        parameters,
        sessions,
    })
}

/// Frame a response. Used by the resource manager for responses it
/// synthesizes and by in-process TPM fakes.
pub fn build_response(
    response_code: u32,
    handles: &[u32],
    parameters: &[u8],
    sessions: &[TpmsAuthResponse],
) -> Result<Vec<u8>> {
    let mut buf = CommandBuffer::new();
    let tag = if sessions.is_empty() {
        TpmSt::NoSessions
    } else {
        TpmSt::Sessions
    };
    buf.put_u16(tag.to_u16());
    let total = buf.push_size(SizeWidth::U32);
    buf.put_u32(response_code);
    if response_code == rc::SUCCESS {
        for &handle in handles {
            buf.put_u32(handle);
        }
        if sessions.is_empty() {
            buf.put_bytes(parameters);
        } else {
            let param_size = buf.push_size(SizeWidth::U32);
            buf.put_bytes(parameters);
            buf.pop_size(param_size)?;
            for session in sessions {
                session.marshal(&mut buf);
            }
        }
    }
    buf.pop_frame_size(total)?;
    buf.finish()
}

/// Minimal 10-byte error response
pub fn error_response(response_code: u32) -> Vec<u8> {
    let mut buf = CommandBuffer::with_capacity(HEADER_SIZE);
    buf.put_u16(TpmSt::NoSessions.to_u16());
    buf.put_u32(HEADER_SIZE as u32);
    buf.put_u32(response_code);
    buf.into_vec()
}
