// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Goldfish pipe: a virtual MMIO device carrying many byte channels between guest clients and
//! host services.
//!
//! The guest opens a channel with a 64-bit id of its choosing and writes
//! `"pipe:<service>[:<args>]\0"` into it. Until that string is complete the channel is served by a
//! [`PipeConnector`]; afterwards every transfer goes to the [`PipeInstance`] created by the named
//! [`PipeService`]. Host services signal readiness through their [`HwPipeHandle`], which queues
//! the channel for the guest and raises the device interrupt.

mod client;
mod connector;
mod device;
mod mapper;
mod registry;
mod save_restore;
pub mod services;
mod signal;

use enumn::N;
use remain::sorted;
use snapshot::SnapshotReader;
use snapshot::SnapshotWriter;
use thiserror::Error;

pub use self::client::Pipe;
pub use self::connector::ConnectorProgress;
pub use self::connector::PipeConnector;
pub use self::connector::CONNECTOR_BUFFER_SIZE;
pub use self::device::PipeDevice;
pub use self::device::PIPE_DEVICE_VERSION;
pub use self::device::PIPE_MMIO_SIZE;
pub use self::mapper::AddressMode;
pub use self::mapper::GuestBufferMapper;
pub use self::mapper::MapError;
pub use self::mapper::PageTranslator;
pub use self::mapper::GUEST_PAGE_SIZE;
pub use self::registry::PipeServiceEntry;
pub use self::registry::PipeServiceRegistry;
pub use self::registry::RegistryError;
pub use self::registry::MAX_PIPE_SERVICES;
pub use self::registry::MAX_SERVICE_NAME_LEN;
pub use self::save_restore::PipeSnapshotError;
pub use self::save_restore::SnapshotFormat;
pub use self::signal::HwPipeHandle;

/// The guest should report EOF / an error on the channel.
pub const PIPE_WAKE_CLOSED: u32 = 1 << 0;
/// Data can be read from the channel.
pub const PIPE_WAKE_READ: u32 = 1 << 1;
/// Data can be written to the channel.
pub const PIPE_WAKE_WRITE: u32 = 1 << 2;

pub const PIPE_POLL_IN: u32 = 1 << 0;
pub const PIPE_POLL_OUT: u32 = 1 << 1;
pub const PIPE_POLL_HUP: u32 = 1 << 2;

// Register offsets.
pub const PIPE_REG_COMMAND: u64 = 0x00;
pub const PIPE_REG_STATUS: u64 = 0x04;
pub const PIPE_REG_CHANNEL: u64 = 0x08;
pub const PIPE_REG_SIZE: u64 = 0x0c;
pub const PIPE_REG_ADDRESS: u64 = 0x10;
pub const PIPE_REG_WAKES: u64 = 0x14;
pub const PIPE_REG_PARAMS_ADDR_LOW: u64 = 0x18;
pub const PIPE_REG_PARAMS_ADDR_HIGH: u64 = 0x1c;
pub const PIPE_REG_ACCESS_PARAMS: u64 = 0x20;
pub const PIPE_REG_VERSION: u64 = 0x24;
pub const PIPE_REG_CHANNEL_HIGH: u64 = 0x30;
pub const PIPE_REG_ADDRESS_HIGH: u64 = 0x34;

/// Commands written to `PIPE_REG_COMMAND`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum PipeCommand {
    Open = 1,
    Close = 2,
    Poll = 3,
    WriteBuffer = 4,
    WakeOnWrite = 5,
    ReadBuffer = 6,
    WakeOnRead = 7,
}

/// Errors reported to the guest through `PIPE_REG_STATUS`.
#[sorted]
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipeError {
    /// The operation would block; retry after a wake.
    #[error("operation would block")]
    Again,
    /// Malformed request, unknown channel or service, or unmappable buffer.
    #[error("invalid request")]
    Inval,
    /// Transport failure, including any use of a closed pipe.
    #[error("i/o error")]
    Io,
    /// The message does not fit the service's buffering.
    #[error("out of memory")]
    NoMem,
}

impl PipeError {
    /// The value the guest reads from the status register.
    pub fn status(self) -> i32 {
        match self {
            PipeError::Inval => -1,
            PipeError::Again => -2,
            PipeError::NoMem => -3,
            PipeError::Io => -4,
        }
    }
}

pub type PipeResult<T> = std::result::Result<T, PipeError>;

/// Converts a transfer result to the status register value.
pub(crate) fn transfer_status(result: PipeResult<usize>) -> i32 {
    match result {
        Ok(count) => i32::try_from(count).unwrap_or(i32::MAX),
        Err(e) => e.status(),
    }
}

/// The host side of one connected channel.
///
/// Callbacks run synchronously on the device's dispatch path and must not block; an operation
/// that cannot make progress returns [`PipeError::Again`] and later signals the guest with
/// [`HwPipeHandle::wake`].
#[allow(unused_variables)]
pub trait PipeInstance: Send {
    /// Consumes guest-written bytes, returning how many were accepted.
    fn send_buffers(&mut self, buffers: &[&[u8]]) -> PipeResult<usize>;
    /// Fills guest buffers, returning how many bytes were produced.
    fn recv_buffers(&mut self, buffers: &mut [&mut [u8]]) -> PipeResult<usize>;
    /// Returns a mask of `PIPE_POLL_*` bits.
    fn poll(&self) -> u32;
    /// The guest wants to be woken for the `PIPE_WAKE_*` conditions in `flags`.
    fn wake_on(&mut self, flags: u32) {}
    /// The channel is going away; release host resources.
    fn close(&mut self) {}
    /// Writes the state `PipeService::load` needs to recreate this instance.
    fn save(&self, state: &mut SnapshotWriter) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A named host service guest clients can connect to.
#[allow(unused_variables)]
pub trait PipeService: Send + Sync {
    /// Creates the host side of a new connection. `None` refuses the connection.
    fn init(&self, hwpipe: HwPipeHandle, args: Option<&str>) -> Option<Box<dyn PipeInstance>>;

    /// Recreates a connection from the state its instance saved.
    ///
    /// Services that do not support snapshots keep the default, which makes restored channels
    /// come back closed.
    fn load(
        &self,
        hwpipe: HwPipeHandle,
        args: Option<&str>,
        state: &mut SnapshotReader,
    ) -> anyhow::Result<Box<dyn PipeInstance>> {
        Err(anyhow::anyhow!("service does not support snapshots"))
    }
}

/// Total length of a scatter list.
pub(crate) fn buffers_len(buffers: &[&[u8]]) -> usize {
    buffers.iter().map(|b| b.len()).sum()
}
