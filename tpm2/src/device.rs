// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM transports
//!
//! Byte-level links to a TPM: the kernel character device and the
//! Microsoft reference simulator's TCP protocol. Every transport moves
//! complete command and response buffers; framing lives in `command`.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use tracing::debug;

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Sends one command and returns the complete response.
pub trait Transport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        (**self).transmit(command)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        (**self).transmit(command)
    }
}

/// TPM device handle
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a TPM device
    pub fn open(path: &str) -> Result<Self> {
        // Strip "device:" prefix if present
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .with_context(|| format!("failed to open TPM device: {}", device_path))?;

        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Detect and open the default TPM device
    pub fn detect() -> Result<Self> {
        if Path::new("/dev/tpmrm0").exists() {
            Self::open("/dev/tpmrm0")
        } else if Path::new("/dev/tpm0").exists() {
            Self::open("/dev/tpm0")
        } else {
            bail!("TPM device not found")
        }
    }

    /// Get the device path
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for TpmDevice {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .context("failed to write TPM command")?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self
            .file
            .read(&mut response)
            .context("failed to read TPM response")?;

        response.truncate(n);
        Ok(response)
    }
}

/// Simulator command-channel and platform-channel codes
mod sim {
    pub const POWER_ON: u32 = 1;
    pub const POWER_OFF: u32 = 2;
    pub const PHYS_PRES_ON: u32 = 3;
    pub const PHYS_PRES_OFF: u32 = 4;
    pub const SEND_COMMAND: u32 = 8;
    pub const NV_ON: u32 = 11;
    pub const NV_OFF: u32 = 12;
    pub const SESSION_END: u32 = 20;
    pub const STOP: u32 = 21;
}

/// Microsoft TPM 2.0 simulator over TCP
///
/// The command channel listens on `port`, the platform channel on
/// `port + 1` (2321/2322 by default).
pub struct TcpSimulator {
    command: TcpStream,
    platform: TcpStream,
    locality: u8,
}

impl TcpSimulator {
    pub const DEFAULT_PORT: u16 = 2321;

    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let command = TcpStream::connect((host, port))
            .with_context(|| format!("failed to connect to simulator at {host}:{port}"))?;
        let platform = TcpStream::connect((host, port + 1)).with_context(|| {
            format!("failed to connect to simulator platform port {host}:{}", port + 1)
        })?;
        Ok(Self {
            command,
            platform,
            locality: 0,
        })
    }

    /// Locality asserted for subsequent commands
    pub fn set_locality(&mut self, locality: u8) {
        self.locality = locality;
    }

    fn platform_command(&mut self, code: u32) -> Result<()> {
        debug!("simulator platform command {code}");
        self.platform
            .write_all(&code.to_be_bytes())
            .context("failed to write platform command")?;
        let ack = read_u32(&mut self.platform).context("failed to read platform ack")?;
        if ack != 0 {
            bail!("simulator platform command {code} failed: {ack}");
        }
        Ok(())
    }

    pub fn power_on(&mut self) -> Result<()> {
        self.platform_command(sim::POWER_ON)
    }

    pub fn power_off(&mut self) -> Result<()> {
        self.platform_command(sim::POWER_OFF)
    }

    pub fn nv_on(&mut self) -> Result<()> {
        self.platform_command(sim::NV_ON)
    }

    pub fn nv_off(&mut self) -> Result<()> {
        self.platform_command(sim::NV_OFF)
    }

    pub fn physical_presence_on(&mut self) -> Result<()> {
        self.platform_command(sim::PHYS_PRES_ON)
    }

    pub fn physical_presence_off(&mut self) -> Result<()> {
        self.platform_command(sim::PHYS_PRES_OFF)
    }

    /// Power-cycle: off, on, NV on. The caller still has to send Startup.
    pub fn reset(&mut self) -> Result<()> {
        self.power_off()?;
        self.power_on()?;
        self.nv_on()
    }

    /// End the session on both channels. With `stop`, the simulator process
    /// also exits.
    pub fn close(mut self, stop: bool) -> Result<()> {
        let code = if stop { sim::STOP } else { sim::SESSION_END };
        self.command
            .write_all(&code.to_be_bytes())
            .context("failed to end command session")?;
        self.platform
            .write_all(&code.to_be_bytes())
            .context("failed to end platform session")?;
        Ok(())
    }
}

fn read_u32(stream: &mut TcpStream) -> Result<u32> {
    let mut b = [0u8; 4];
    stream.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

impl Transport for TcpSimulator {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(command.len() + 9);
        frame.extend_from_slice(&sim::SEND_COMMAND.to_be_bytes());
        frame.push(self.locality);
        frame.extend_from_slice(&(command.len() as u32).to_be_bytes());
        frame.extend_from_slice(command);
        self.command
            .write_all(&frame)
            .context("failed to write TPM command to simulator")?;

        let len = read_u32(&mut self.command).context("failed to read response size")? as usize;
        if len > TPM_MAX_COMMAND_SIZE {
            bail!("simulator response too large: {len} bytes");
        }
        let mut response = vec![0u8; len];
        self.command
            .read_exact(&mut response)
            .context("failed to read TPM response from simulator")?;
        let ack = read_u32(&mut self.command).context("failed to read simulator ack")?;
        if ack != 0 {
            bail!("simulator reported failure {ack}");
        }
        Ok(response)
    }
}
