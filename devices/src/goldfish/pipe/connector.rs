// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serves a freshly opened channel until the guest has named the service it wants.

use base::debug;
use base::warn;

use super::HwPipeHandle;
use super::PipeError;
use super::PipeInstance;
use super::PipeResult;
use super::PipeServiceRegistry;
use super::PIPE_POLL_OUT;

/// Capacity of the connection string buffer, terminator included.
pub const CONNECTOR_BUFFER_SIZE: usize = 128;

const CONNECTION_PREFIX: &[u8] = b"pipe:";

/// Outcome of a successful connector write.
pub enum ConnectorProgress {
    /// The connection string is still incomplete; `consumed` bytes were buffered.
    Pending { consumed: usize },
    /// The named service accepted the connection.
    Resolved {
        consumed: usize,
        service: String,
        args: Option<String>,
        instance: Box<dyn PipeInstance>,
    },
}

/// Accumulates `"pipe:<service>[:<args>]\0"` from guest writes.
///
/// Bytes beyond `CONNECTOR_BUFFER_SIZE` are not copied and no error is raised for them; the write
/// simply reports fewer consumed bytes. A full buffer that never received a terminator can only
/// fail to resolve.
pub struct PipeConnector {
    buffer: [u8; CONNECTOR_BUFFER_SIZE],
    buffpos: usize,
}

impl Default for PipeConnector {
    fn default() -> Self {
        PipeConnector::new()
    }
}

impl PipeConnector {
    pub fn new() -> PipeConnector {
        PipeConnector {
            buffer: [0; CONNECTOR_BUFFER_SIZE],
            buffpos: 0,
        }
    }

    /// Recreates a connector holding previously accumulated bytes, as written by `contents`.
    pub fn with_contents(bytes: &[u8]) -> PipeConnector {
        let mut connector = PipeConnector::new();
        let len = bytes.len().min(CONNECTOR_BUFFER_SIZE);
        connector.buffer[..len].copy_from_slice(&bytes[..len]);
        connector.buffpos = len;
        connector
    }

    /// The bytes accumulated so far.
    pub fn contents(&self) -> &[u8] {
        &self.buffer[..self.buffpos]
    }

    /// Appends guest bytes and, once a terminator is present, resolves the service.
    ///
    /// Any failure to resolve is reported as `PipeError::Inval`; the channel is unusable after
    /// that.
    pub fn send_buffers(
        &mut self,
        registry: &PipeServiceRegistry,
        hwpipe: &HwPipeHandle,
        buffers: &[&[u8]],
    ) -> PipeResult<ConnectorProgress> {
        let was_full = self.buffpos == CONNECTOR_BUFFER_SIZE;
        let mut consumed = 0;
        for buffer in buffers {
            let avail = (CONNECTOR_BUFFER_SIZE - self.buffpos).min(buffer.len());
            self.buffer[self.buffpos..self.buffpos + avail].copy_from_slice(&buffer[..avail]);
            self.buffpos += avail;
            consumed += avail;
        }

        let end = match self.contents().iter().position(|&b| b == 0) {
            Some(end) => end,
            None if was_full => {
                warn!("goldfish pipe: connection string exceeds {CONNECTOR_BUFFER_SIZE} bytes");
                return Err(PipeError::Inval);
            }
            None => return Ok(ConnectorProgress::Pending { consumed }),
        };

        let (name, args) = parse_connection_string(&self.buffer[..end])?;
        let Some(entry) = registry.find(name) else {
            warn!("goldfish pipe: unknown service '{}'", name);
            return Err(PipeError::Inval);
        };
        let Some(instance) = entry.service().init(hwpipe.clone(), args) else {
            warn!("goldfish pipe: service '{}' refused the connection", name);
            return Err(PipeError::Inval);
        };
        debug!("goldfish pipe: connected to service '{}'", name);
        Ok(ConnectorProgress::Resolved {
            consumed,
            service: name.to_owned(),
            args: args.map(str::to_owned),
            instance,
        })
    }

    /// A connector can always take more bytes and never has any to give.
    pub fn poll(&self) -> u32 {
        PIPE_POLL_OUT
    }
}

/// Splits `pipe:<name>[:<args>]` into the service name and the non-empty argument string.
fn parse_connection_string(bytes: &[u8]) -> PipeResult<(&str, Option<&str>)> {
    let Some(rest) = bytes.strip_prefix(CONNECTION_PREFIX) else {
        warn!("goldfish pipe: connection string lacks the 'pipe:' prefix");
        return Err(PipeError::Inval);
    };
    let rest = std::str::from_utf8(rest).map_err(|_| PipeError::Inval)?;
    Ok(match rest.split_once(':') {
        Some((name, args)) if !args.is_empty() => (name, Some(args)),
        Some((name, _)) => (name, None),
        None => (rest, None),
    })
}
