// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::warn;

use super::QemudError;
use super::Result;

/// Largest message a 4-hex-digit length header can describe.
pub const MAX_FRAMED_MESSAGE: usize = 0xffff;

const FRAME_HEADER_LEN: usize = 4;

/// Carries a client's messages towards the guest.
pub trait QemudTransport: Send + Sync {
    fn send(&self, msg: &[u8]);
    /// Disconnects the client from the host side.
    fn close(&self);
}

/// Cloneable handle a client uses to talk to the guest.
#[derive(Clone)]
pub struct QemudClientSink {
    transport: Arc<dyn QemudTransport>,
    framing: Arc<AtomicBool>,
}

impl QemudClientSink {
    pub fn new(transport: Arc<dyn QemudTransport>) -> QemudClientSink {
        QemudClientSink {
            transport,
            framing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sends one message, adding a length header when framing is on.
    pub fn send(&self, msg: &[u8]) {
        if !self.framing() {
            self.transport.send(msg);
            return;
        }
        match MessageFramer::frame(msg) {
            Ok(framed) => self.transport.send(&framed),
            Err(e) => warn!("qemud: dropping outgoing message: {}", e),
        }
    }

    /// Switches framing mode for both directions.
    pub fn set_framing(&self, enabled: bool) {
        self.framing.store(enabled, Ordering::Release);
    }

    pub fn framing(&self) -> bool {
        self.framing.load(Ordering::Acquire)
    }

    /// Closes the connection from the host side.
    pub fn close(&self) {
        self.transport.close();
    }
}

impl fmt::Debug for QemudClientSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QemudClientSink")
            .field("framing", &self.framing())
            .finish_non_exhaustive()
    }
}

/// Reassembles messages carrying a 4-hex-digit length header from an arbitrary byte stream.
#[derive(Debug, Default)]
pub struct MessageFramer {
    header: Vec<u8>,
    payload: Vec<u8>,
    expected: Option<usize>,
}

impl MessageFramer {
    pub fn new() -> MessageFramer {
        Default::default()
    }

    /// Prefixes `msg` with its length.
    pub fn frame(msg: &[u8]) -> Result<Vec<u8>> {
        if msg.len() > MAX_FRAMED_MESSAGE {
            return Err(QemudError::MessageTooLong(msg.len()));
        }
        let mut out = format!("{:04x}", msg.len()).into_bytes();
        out.extend_from_slice(msg);
        Ok(out)
    }

    /// Consumes `data` and appends every message it completes to `messages`.
    ///
    /// A malformed header discards the rest of `data` and all buffered state. Messages completed
    /// before it are still appended.
    pub fn push(&mut self, mut data: &[u8], messages: &mut Vec<Vec<u8>>) -> Result<()> {
        while !data.is_empty() {
            let Some(expected) = self.expected else {
                let n = (FRAME_HEADER_LEN - self.header.len()).min(data.len());
                self.header.extend_from_slice(&data[..n]);
                data = &data[n..];
                if self.header.len() == FRAME_HEADER_LEN {
                    let header = std::mem::take(&mut self.header);
                    let len = parse_hex(&header).ok_or(QemudError::BadHeader(header))?;
                    if len == 0 {
                        messages.push(Vec::new());
                    } else {
                        self.expected = Some(len);
                    }
                }
                continue;
            };
            let n = (expected - self.payload.len()).min(data.len());
            self.payload.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.payload.len() == expected {
                self.expected = None;
                messages.push(std::mem::take(&mut self.payload));
            }
        }
        Ok(())
    }

    /// Bytes of the current partial frame, header included.
    pub fn pending(&self) -> Vec<u8> {
        match self.expected {
            Some(len) => {
                let mut out = format!("{:04x}", len).into_bytes();
                out.extend_from_slice(&self.payload);
                out
            }
            None => self.header.clone(),
        }
    }
}

/// Longest hex field any qemud header or control message carries.
const MAX_HEX_DIGITS: usize = 4;

/// Parses up to four ASCII hex digits, upper or lower case.
pub(super) fn parse_hex(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || digits.len() > MAX_HEX_DIGITS {
        return None;
    }
    digits.iter().try_fold(0usize, |acc, &d| {
        let v = (d as char).to_digit(16)?;
        Some(acc * 16 + v as usize)
    })
}
