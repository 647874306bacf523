// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;

use anyhow::bail;
use snapshot::SnapshotReader;
use snapshot::SnapshotWriter;

use crate::goldfish::pipe::buffers_len;
use crate::goldfish::pipe::HwPipeHandle;
use crate::goldfish::pipe::PipeError;
use crate::goldfish::pipe::PipeInstance;
use crate::goldfish::pipe::PipeResult;
use crate::goldfish::pipe::PipeService;
use crate::goldfish::pipe::PIPE_POLL_IN;
use crate::goldfish::pipe::PIPE_POLL_OUT;
use crate::goldfish::pipe::PIPE_WAKE_READ;
use crate::goldfish::pipe::PIPE_WAKE_WRITE;

/// Most bytes a pingpong pipe holds before writes stall.
pub const PINGPONG_MAX_SIZE: usize = 1 << 20;

/// Echoes every byte written back to the reader.
pub struct PingPongService;

struct PingPongPipe {
    hwpipe: HwPipeHandle,
    data: VecDeque<u8>,
    /// Wake conditions the guest is waiting for.
    flags: u32,
}

impl PingPongPipe {
    fn new(hwpipe: HwPipeHandle) -> PingPongPipe {
        PingPongPipe {
            hwpipe,
            data: VecDeque::new(),
            flags: 0,
        }
    }

    fn space(&self) -> usize {
        PINGPONG_MAX_SIZE - self.data.len()
    }
}

impl PipeInstance for PingPongPipe {
    fn send_buffers(&mut self, buffers: &[&[u8]]) -> PipeResult<usize> {
        let total = buffers_len(buffers);
        if total == 0 {
            return Ok(0);
        }
        if total > PINGPONG_MAX_SIZE {
            return Err(PipeError::NoMem);
        }
        if self.space() == 0 {
            return Err(PipeError::Again);
        }

        let mut count = 0;
        for buf in buffers {
            let n = buf.len().min(self.space());
            self.data.extend(&buf[..n]);
            count += n;
        }
        self.flags &= !PIPE_WAKE_READ;
        self.hwpipe.wake(PIPE_WAKE_READ);
        Ok(count)
    }

    fn recv_buffers(&mut self, buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        if self.data.is_empty() {
            return Err(PipeError::Again);
        }
        let was_full = self.space() == 0;
        let mut count = 0;
        for buf in buffers.iter_mut() {
            let n = buf.len().min(self.data.len());
            for (dst, src) in buf.iter_mut().zip(self.data.drain(..n)) {
                *dst = src;
            }
            count += n;
        }
        if count > 0 && (was_full || self.flags & PIPE_WAKE_WRITE != 0) {
            self.flags &= !PIPE_WAKE_WRITE;
            self.hwpipe.wake(PIPE_WAKE_WRITE);
        }
        Ok(count)
    }

    fn poll(&self) -> u32 {
        let mut mask = 0;
        if !self.data.is_empty() {
            mask |= PIPE_POLL_IN;
        }
        if self.space() > 0 {
            mask |= PIPE_POLL_OUT;
        }
        mask
    }

    fn wake_on(&mut self, flags: u32) {
        self.flags |= flags;
        let mut ready = 0;
        if self.flags & PIPE_WAKE_READ != 0 && !self.data.is_empty() {
            ready |= PIPE_WAKE_READ;
        }
        if self.flags & PIPE_WAKE_WRITE != 0 && self.space() > 0 {
            ready |= PIPE_WAKE_WRITE;
        }
        if ready != 0 {
            self.flags &= !ready;
            self.hwpipe.wake(ready);
        }
    }

    fn save(&self, state: &mut SnapshotWriter) -> anyhow::Result<()> {
        let (front, back) = self.data.as_slices();
        state.put_buffer(&[front, back].concat());
        state.put_be32(self.flags);
        Ok(())
    }
}

impl PipeService for PingPongService {
    fn init(&self, hwpipe: HwPipeHandle, _args: Option<&str>) -> Option<Box<dyn PipeInstance>> {
        Some(Box::new(PingPongPipe::new(hwpipe)))
    }

    fn load(
        &self,
        hwpipe: HwPipeHandle,
        _args: Option<&str>,
        state: &mut SnapshotReader,
    ) -> anyhow::Result<Box<dyn PipeInstance>> {
        let data = state.get_buffer()?;
        if data.len() > PINGPONG_MAX_SIZE {
            bail!("pingpong buffer of {} bytes is too large", data.len());
        }
        let flags = state.get_be32()?;
        let mut pipe = PingPongPipe::new(hwpipe);
        pipe.data.extend(data);
        pipe.flags = flags;
        Ok(Box::new(pipe))
    }
}
