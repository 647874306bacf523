// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use snapshot::SnapshotReader;

use crate::goldfish::pipe::buffers_len;
use crate::goldfish::pipe::HwPipeHandle;
use crate::goldfish::pipe::PipeInstance;
use crate::goldfish::pipe::PipeResult;
use crate::goldfish::pipe::PipeService;
use crate::goldfish::pipe::PIPE_POLL_IN;
use crate::goldfish::pipe::PIPE_POLL_OUT;

/// Discards writes and reads back zeroes. Always ready in both directions.
pub struct ZeroService;

struct ZeroPipe {
    hwpipe: HwPipeHandle,
}

impl PipeInstance for ZeroPipe {
    fn send_buffers(&mut self, buffers: &[&[u8]]) -> PipeResult<usize> {
        Ok(buffers_len(buffers))
    }

    fn recv_buffers(&mut self, buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        let mut total = 0;
        for buf in buffers.iter_mut() {
            buf.fill(0);
            total += buf.len();
        }
        Ok(total)
    }

    fn poll(&self) -> u32 {
        PIPE_POLL_IN | PIPE_POLL_OUT
    }

    fn wake_on(&mut self, flags: u32) {
        self.hwpipe.wake(flags);
    }
}

impl PipeService for ZeroService {
    fn init(&self, hwpipe: HwPipeHandle, _args: Option<&str>) -> Option<Box<dyn PipeInstance>> {
        Some(Box::new(ZeroPipe { hwpipe }))
    }

    fn load(
        &self,
        hwpipe: HwPipeHandle,
        _args: Option<&str>,
        _state: &mut SnapshotReader,
    ) -> anyhow::Result<Box<dyn PipeInstance>> {
        Ok(Box::new(ZeroPipe { hwpipe }))
    }
}
