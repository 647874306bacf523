// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Framing of the qemud serial line.
//!
//! Every frame starts with six ASCII hex digits: four for the payload length and two for the
//! channel.

use base::warn;

use super::client::parse_hex;

/// Length of a serial frame header.
pub const SERIAL_HEADER_LEN: usize = 6;
/// Largest payload the host puts in one frame.
pub const MAX_SERIAL_PAYLOAD: usize = 4000;

/// One frame received from the guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialFrame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

/// Encodes `msg` for `channel`, splitting it into as many frames as needed.
///
/// An empty message still produces one (empty) frame.
pub fn encode_frames(channel: u8, msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len() + SERIAL_HEADER_LEN);
    let mut push_frame = |chunk: &[u8]| {
        out.extend_from_slice(format!("{:04x}{:02x}", chunk.len(), channel).as_bytes());
        out.extend_from_slice(chunk);
    };
    if msg.is_empty() {
        push_frame(msg);
    }
    for chunk in msg.chunks(MAX_SERIAL_PAYLOAD) {
        push_frame(chunk);
    }
    out
}

enum ParseState {
    Header,
    Payload { channel: u8, len: usize },
}

/// Incremental parser for bytes arriving from the guest's serial line.
pub struct SerialParser {
    state: ParseState,
    buf: Vec<u8>,
}

impl Default for SerialParser {
    fn default() -> Self {
        SerialParser::new()
    }
}

impl SerialParser {
    pub fn new() -> SerialParser {
        SerialParser {
            state: ParseState::Header,
            buf: Vec::new(),
        }
    }

    /// Consumes `data` and returns the frames it completes.
    ///
    /// A header that is not valid hex is dropped with a warning and parsing resumes right after
    /// it.
    pub fn push(&mut self, mut data: &[u8]) -> Vec<SerialFrame> {
        let mut frames = Vec::new();
        while !data.is_empty() {
            let want = match self.state {
                ParseState::Header => SERIAL_HEADER_LEN,
                ParseState::Payload { len, .. } => len,
            };
            let n = (want - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.buf.len() < want {
                break;
            }

            match self.state {
                ParseState::Header => {
                    let header = std::mem::take(&mut self.buf);
                    match (parse_hex(&header[..4]), parse_hex(&header[4..])) {
                        (Some(0), Some(channel)) => frames.push(SerialFrame {
                            channel: channel as u8,
                            payload: Vec::new(),
                        }),
                        (Some(len), Some(channel)) => {
                            self.state = ParseState::Payload {
                                channel: channel as u8,
                                len,
                            }
                        }
                        _ => warn!(
                            "qemud: dropping frame with bad header {:?}",
                            String::from_utf8_lossy(&header)
                        ),
                    }
                }
                ParseState::Payload { channel, .. } => {
                    frames.push(SerialFrame {
                        channel,
                        payload: std::mem::take(&mut self.buf),
                    });
                    self.state = ParseState::Header;
                }
            }
        }
        frames
    }
}
