// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reaching qemud services over a goldfish pipe.
//!
//! The pipe is opened as `pipe:qemud:<service>[:<params>]`. Both directions carry messages
//! prefixed with a 4-hex-digit length.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use base::debug;
use base::warn;
use snapshot::SnapshotReader;
use snapshot::SnapshotWriter;
use sync::Mutex;

use super::split_service_params;
use super::MessageFramer;
use super::QemudClientSink;
use super::QemudConnection;
use super::QemudServiceRegistry;
use super::QemudTransport;
use crate::goldfish::pipe::HwPipeHandle;
use crate::goldfish::pipe::PipeError;
use crate::goldfish::pipe::PipeInstance;
use crate::goldfish::pipe::PipeResult;
use crate::goldfish::pipe::PipeService;
use crate::goldfish::pipe::PIPE_POLL_IN;
use crate::goldfish::pipe::PIPE_POLL_OUT;
use crate::goldfish::pipe::PIPE_WAKE_READ;
use crate::goldfish::pipe::PIPE_WAKE_WRITE;

/// Exposes a [`QemudServiceRegistry`] as a pipe service.
pub struct QemudPipeService {
    registry: Arc<QemudServiceRegistry>,
}

impl QemudPipeService {
    pub fn new(registry: Arc<QemudServiceRegistry>) -> QemudPipeService {
        QemudPipeService { registry }
    }
}

/// Framed bytes waiting for the guest to read them.
type Outbox = Arc<Mutex<VecDeque<u8>>>;

struct PipeTransport {
    hwpipe: HwPipeHandle,
    outbox: Outbox,
}

impl QemudTransport for PipeTransport {
    fn send(&self, msg: &[u8]) {
        let framed = match MessageFramer::frame(msg) {
            Ok(framed) => framed,
            Err(e) => {
                warn!("qemud pipe: dropping outgoing message: {}", e);
                return;
            }
        };
        self.outbox.lock().extend(framed);
        self.hwpipe.wake(PIPE_WAKE_READ);
    }

    fn close(&self) {
        self.hwpipe.close();
    }
}

struct QemudPipe {
    hwpipe: HwPipeHandle,
    outbox: Outbox,
    inbound: MessageFramer,
    conn: Option<QemudConnection>,
}

impl QemudPipe {
    fn sink(hwpipe: &HwPipeHandle, outbox: &Outbox) -> QemudClientSink {
        QemudClientSink::new(Arc::new(PipeTransport {
            hwpipe: hwpipe.clone(),
            outbox: outbox.clone(),
        }))
    }
}

impl PipeInstance for QemudPipe {
    fn send_buffers(&mut self, buffers: &[&[u8]]) -> PipeResult<usize> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(PipeError::Io);
        };
        let mut count = 0;
        for buf in buffers {
            let mut messages = Vec::new();
            let framed = self.inbound.push(buf, &mut messages);
            for msg in messages {
                if let Err(e) = conn.deliver(&msg) {
                    warn!("qemud pipe: {}: {}", conn.service(), e);
                    return Err(PipeError::Io);
                }
            }
            if let Err(e) = framed {
                warn!("qemud pipe: {}: {}", conn.service(), e);
                return Err(PipeError::Io);
            }
            count += buf.len();
        }
        Ok(count)
    }

    fn recv_buffers(&mut self, buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        let mut outbox = self.outbox.lock();
        if outbox.is_empty() {
            return Err(PipeError::Again);
        }
        let mut count = 0;
        for buf in buffers.iter_mut() {
            let n = buf.len().min(outbox.len());
            for (dst, src) in buf.iter_mut().zip(outbox.drain(..n)) {
                *dst = src;
            }
            count += n;
        }
        Ok(count)
    }

    fn poll(&self) -> u32 {
        if self.outbox.lock().is_empty() {
            PIPE_POLL_OUT
        } else {
            PIPE_POLL_IN | PIPE_POLL_OUT
        }
    }

    fn wake_on(&mut self, flags: u32) {
        let mut ready = flags & PIPE_WAKE_WRITE;
        if flags & PIPE_WAKE_READ != 0 && !self.outbox.lock().is_empty() {
            ready |= PIPE_WAKE_READ;
        }
        if ready != 0 {
            self.hwpipe.wake(ready);
        }
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("qemud pipe: guest closed {}", conn.service());
            conn.close();
        }
    }

    fn save(&self, state: &mut SnapshotWriter) -> anyhow::Result<()> {
        let Some(conn) = self.conn.as_ref() else {
            bail!("qemud pipe has no client");
        };
        state.put_string(conn.service());
        state.put_bool(conn.params().is_some());
        if let Some(params) = conn.params() {
            state.put_string(params);
        }
        state.put_bool(conn.sink().framing());
        let outbox = self.outbox.lock();
        let (front, back) = outbox.as_slices();
        state.put_buffer(&[front, back].concat());
        drop(outbox);
        state.put_buffer(&self.inbound.pending());
        state.put_section(|section| conn.save(section))
    }
}

impl PipeService for QemudPipeService {
    fn init(&self, hwpipe: HwPipeHandle, args: Option<&str>) -> Option<Box<dyn PipeInstance>> {
        let Some(args) = args else {
            warn!("qemud pipe: no service name given");
            return None;
        };
        let (name, params) = split_service_params(args);
        let outbox = Outbox::default();
        let sink = QemudPipe::sink(&hwpipe, &outbox);
        let conn = match self.registry.connect(name, params, sink) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("qemud pipe: {}", e);
                return None;
            }
        };
        debug!("qemud pipe: connected to {}", name);
        Some(Box::new(QemudPipe {
            hwpipe,
            outbox,
            inbound: MessageFramer::new(),
            conn: Some(conn),
        }))
    }

    fn load(
        &self,
        hwpipe: HwPipeHandle,
        _args: Option<&str>,
        state: &mut SnapshotReader,
    ) -> anyhow::Result<Box<dyn PipeInstance>> {
        let name = state.get_string()?;
        let params = if state.get_bool()? {
            Some(state.get_string()?)
        } else {
            None
        };
        let framing = state.get_bool()?;
        let outbox = Outbox::new(Mutex::new(state.get_buffer()?.iter().copied().collect()));
        let mut inbound = MessageFramer::new();
        let mut complete = Vec::new();
        inbound.push(state.get_buffer()?, &mut complete)?;
        if !complete.is_empty() {
            bail!("saved partial message for {} is not partial", name);
        }

        let sink = QemudPipe::sink(&hwpipe, &outbox);
        sink.set_framing(framing);
        let mut section = state.get_section()?;
        let conn = self
            .registry
            .load(&name, params.as_deref(), sink, &mut section)
            .with_context(|| format!("failed to restore qemud client of {}", name))?;
        section.finish()?;
        Ok(Box::new(QemudPipe {
            hwpipe,
            outbox,
            inbound,
            conn: Some(conn),
        }))
    }
}

#[cfg(test)]
mod tests {
    use vm_memory::GuestAddress;
    use vm_memory::GuestMemory;

    use super::*;
    use crate::goldfish::pipe::GuestBufferMapper;
    use crate::goldfish::pipe::PipeCommand;
    use crate::goldfish::pipe::PipeDevice;
    use crate::goldfish::pipe::PipeServiceRegistry;
    use crate::goldfish::pipe::PIPE_REG_ADDRESS;
    use crate::goldfish::pipe::PIPE_REG_ADDRESS_HIGH;
    use crate::goldfish::pipe::PIPE_REG_CHANNEL;
    use crate::goldfish::pipe::PIPE_REG_CHANNEL_HIGH;
    use crate::goldfish::pipe::PIPE_REG_COMMAND;
    use crate::goldfish::pipe::PIPE_REG_SIZE;
    use crate::goldfish::pipe::PIPE_REG_STATUS;
    use crate::goldfish::pipe::PIPE_REG_VERSION;
    use crate::goldfish::pipe::PIPE_REG_WAKES;
    use crate::goldfish::pipe::PIPE_WAKE_CLOSED;
    use crate::goldfish::qemud::testing::ClientLog;
    use crate::goldfish::qemud::testing::EchoService;
    use crate::IrqLevelState;

    const BUF: u64 = 0x2000;

    fn device() -> (PipeDevice, ClientLog, Arc<QemudServiceRegistry>) {
        let echo = EchoService::default();
        let log = echo.log.clone();
        let mut qemud = QemudServiceRegistry::new();
        qemud.register("echo", 1, Arc::new(echo)).unwrap();
        let qemud = Arc::new(qemud);

        let mut registry = PipeServiceRegistry::new();
        registry
            .register("qemud", Arc::new(QemudPipeService::new(qemud.clone())))
            .unwrap();
        let mem = GuestMemory::new(&[(GuestAddress(0), 0x10000)]).unwrap();
        let mut dev = PipeDevice::new(
            Arc::new(registry),
            GuestBufferMapper::new(mem),
            Box::new(IrqLevelState::new()),
            true,
        );
        dev.read_register(PIPE_REG_VERSION);
        (dev, log, qemud)
    }

    fn command(dev: &mut PipeDevice, cmd: PipeCommand, channel: u64) -> i32 {
        dev.write_register(PIPE_REG_CHANNEL, channel as u32);
        dev.write_register(PIPE_REG_CHANNEL_HIGH, (channel >> 32) as u32);
        dev.write_register(PIPE_REG_COMMAND, cmd as u32);
        dev.read_register(PIPE_REG_STATUS) as i32
    }

    fn write(dev: &mut PipeDevice, channel: u64, data: &[u8]) -> i32 {
        dev.memory()
            .write_all_at_addr(data, GuestAddress(BUF))
            .unwrap();
        dev.write_register(PIPE_REG_ADDRESS, BUF as u32);
        dev.write_register(PIPE_REG_ADDRESS_HIGH, 0);
        dev.write_register(PIPE_REG_SIZE, data.len() as u32);
        command(dev, PipeCommand::WriteBuffer, channel)
    }

    fn read(dev: &mut PipeDevice, channel: u64, len: usize) -> (i32, Vec<u8>) {
        dev.write_register(PIPE_REG_ADDRESS, BUF as u32);
        dev.write_register(PIPE_REG_ADDRESS_HIGH, 0);
        dev.write_register(PIPE_REG_SIZE, len as u32);
        let status = command(dev, PipeCommand::ReadBuffer, channel);
        let mut out = vec![0u8; status.max(0) as usize];
        dev.memory()
            .read_exact_at_addr(&mut out, GuestAddress(BUF))
            .unwrap();
        (status, out)
    }

    fn open(dev: &mut PipeDevice, channel: u64, conn: &str) -> i32 {
        assert_eq!(command(dev, PipeCommand::Open, channel), 0);
        let conn = format!("pipe:{}\0", conn);
        write(dev, channel, conn.as_bytes())
    }

    #[test]
    fn exchange_framed_messages() {
        let (mut dev, log, qemud) = device();
        assert_eq!(open(&mut dev, 1, "qemud:echo"), 16);
        assert_eq!(qemud.active_clients("echo"), 1);
        assert_eq!(read(&mut dev, 1, 16).0, PipeError::Again.status());

        assert_eq!(write(&mut dev, 1, b"0002hi00"), 8);
        assert_eq!(*log.received.lock(), vec![b"hi".to_vec()]);
        assert_eq!(dev.read_register(PIPE_REG_CHANNEL), 1);
        assert_eq!(dev.read_register(PIPE_REG_WAKES), PIPE_WAKE_READ);

        assert_eq!(write(&mut dev, 1, b"01x"), 3);
        let (status, data) = read(&mut dev, 1, 64);
        assert_eq!(status, 21);
        assert_eq!(data, b"0007echo:hi0006echo:x");

        assert_eq!(command(&mut dev, PipeCommand::Close, 1), 0);
        assert_eq!(*log.closed.lock(), 1);
        assert_eq!(qemud.active_clients("echo"), 0);
    }

    #[test]
    fn refused_connections() {
        let (mut dev, _, _) = device();
        assert_eq!(open(&mut dev, 1, "qemud"), PipeError::Inval.status());
        assert_eq!(open(&mut dev, 2, "qemud:gps"), PipeError::Inval.status());
        assert_eq!(open(&mut dev, 3, "qemud:echo:refuse"), PipeError::Inval.status());
        assert_eq!(open(&mut dev, 4, "qemud:echo"), 16);
        assert_eq!(open(&mut dev, 5, "qemud:echo"), PipeError::Inval.status());
        assert_eq!(dev.pipe_count(), 1);
    }

    #[test]
    fn bad_frame_header_fails_transfer() {
        let (mut dev, log, _) = device();
        open(&mut dev, 1, "qemud:echo");
        assert_eq!(write(&mut dev, 1, b"xyz!"), PipeError::Io.status());
        assert!(log.received.lock().is_empty());

        // Messages completed before a bad header still reach the client.
        assert_eq!(write(&mut dev, 1, b"0002hixyz!"), PipeError::Io.status());
        assert_eq!(*log.received.lock(), vec![b"hi".to_vec()]);
    }

    #[test]
    fn host_close_reaches_guest() {
        let (mut dev, log, _) = device();
        open(&mut dev, 7, "qemud:echo");
        log.sinks.lock()[0].close();
        assert_eq!(dev.read_register(PIPE_REG_CHANNEL), 7);
        assert_eq!(dev.read_register(PIPE_REG_WAKES) & PIPE_WAKE_CLOSED, PIPE_WAKE_CLOSED);
        assert_eq!(write(&mut dev, 7, b"0001a"), PipeError::Io.status());
    }

    #[test]
    fn snapshot_keeps_client_and_pending_bytes() {
        let (mut dev, log, qemud) = device();
        open(&mut dev, 3, "qemud:echo:framed");
        assert_eq!(write(&mut dev, 3, b"00060002ok"), 10);
        assert_eq!(write(&mut dev, 3, b"0004"), 4);
        let saved = dev.save().unwrap();

        let (status, data) = read(&mut dev, 3, 64);
        assert_eq!(status, 15);
        assert_eq!(data, b"000b0007echo:ok");

        dev.load(&saved).unwrap();
        assert_eq!(qemud.active_clients("echo"), 1);
        assert_eq!(log.sinks.lock().len(), 2);
        let (status, data) = read(&mut dev, 3, 64);
        assert_eq!(status, 15);
        assert_eq!(data, b"000b0007echo:ok");

        assert_eq!(write(&mut dev, 3, b"0000"), 4);
        assert_eq!(*log.received.lock(), vec![b"ok".to_vec(), Vec::new()]);
    }
}
