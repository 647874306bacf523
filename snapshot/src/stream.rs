// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Big-endian binary snapshot streams.
//!
//! Variable sized fields are written as a `u32` length followed by the bytes ("buffers"). Strings
//! are buffers holding UTF-8.

use remain::sorted;
use thiserror::Error as ThisError;

#[sorted]
#[derive(ThisError, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid boolean byte {0:#x}")]
    InvalidBool(u8),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} unexpected trailing bytes")]
    TrailingData(usize),
    #[error("stream truncated: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Accumulates a snapshot stream in memory.
#[derive(Default, Debug)]
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new() -> SnapshotWriter {
        SnapshotWriter { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, val: u8) {
        self.buf.push(val);
    }

    pub fn put_bool(&mut self, val: bool) {
        self.put_u8(val as u8);
    }

    pub fn put_be32(&mut self, val: u32) {
        self.buf.extend_from_slice(&val.to_be_bytes());
    }

    pub fn put_i32(&mut self, val: i32) {
        self.buf.extend_from_slice(&val.to_be_bytes());
    }

    pub fn put_be64(&mut self, val: u64) {
        self.buf.extend_from_slice(&val.to_be_bytes());
    }

    /// Writes `data` prefixed with its length.
    pub fn put_buffer(&mut self, data: &[u8]) {
        self.put_be32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn put_string(&mut self, s: &str) {
        self.put_buffer(s.as_bytes());
    }

    /// Writes whatever `f` produces as one length-prefixed buffer, so a reader that does not
    /// understand the contents can skip over them.
    pub fn put_section<F, E>(&mut self, f: F) -> std::result::Result<(), E>
    where
        F: FnOnce(&mut SnapshotWriter) -> std::result::Result<(), E>,
    {
        let mut nested = SnapshotWriter::new();
        f(&mut nested)?;
        self.put_buffer(&nested.buf);
        Ok(())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Parses a snapshot stream produced by [`SnapshotWriter`].
#[derive(Debug, Clone)]
pub struct SnapshotReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(data: &'a [u8]) -> SnapshotReader<'a> {
        SnapshotReader { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(Error::UnexpectedEof {
                needed: len,
                remaining,
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(Error::InvalidBool(b)),
        }
    }

    pub fn get_be32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_be64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn get_buffer(&mut self) -> Result<&'a [u8]> {
        let len = self.get_be32()? as usize;
        self.take(len)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_buffer()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)
    }

    /// Returns a reader over the next length-prefixed section, advancing past it.
    pub fn get_section(&mut self) -> Result<SnapshotReader<'a>> {
        Ok(SnapshotReader::new(self.get_buffer()?))
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fails if any bytes are left unread.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(Error::TrailingData(n)),
        }
    }
}
