// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The goldfish pipe MMIO register file and command dispatch.

use std::collections::BTreeMap;
use std::mem::offset_of;
use std::sync::Arc;

use anyhow::Context;
use base::debug;
use base::warn;
use serde::Deserialize;
use serde::Serialize;
use snapshot::AnySnapshot;
use sync::Mutex;
use vm_memory::Access;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use super::signal::SignalTable;
use super::transfer_status;
use super::AddressMode;
use super::GuestBufferMapper;
use super::HwPipeHandle;
use super::Pipe;
use super::PipeCommand;
use super::PipeError;
use super::PipeServiceRegistry;
use super::PIPE_REG_ACCESS_PARAMS;
use super::PIPE_REG_ADDRESS;
use super::PIPE_REG_ADDRESS_HIGH;
use super::PIPE_REG_CHANNEL;
use super::PIPE_REG_CHANNEL_HIGH;
use super::PIPE_REG_COMMAND;
use super::PIPE_REG_PARAMS_ADDR_HIGH;
use super::PIPE_REG_PARAMS_ADDR_LOW;
use super::PIPE_REG_SIZE;
use super::PIPE_REG_STATUS;
use super::PIPE_REG_VERSION;
use super::PIPE_REG_WAKES;
use super::PIPE_WAKE_READ;
use super::PIPE_WAKE_WRITE;
use crate::BusAccessInfo;
use crate::BusDevice;
use crate::IrqLine;
use crate::Suspendable;

/// Value of the version register.
pub const PIPE_DEVICE_VERSION: u32 = 1;
/// The register file occupies one page.
pub const PIPE_MMIO_SIZE: u64 = 0x1000;

/// Batch parameter block used by 32-bit guests.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub(super) struct AccessParams32 {
    pub channel: u32,
    pub size: u32,
    pub address: u32,
    pub cmd: u32,
    pub result: u32,
    pub flags: u32,
}

/// Batch parameter block used by 64-bit guests.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub(super) struct AccessParams64 {
    pub channel: u64,
    pub size: u32,
    pub _pad0: u32,
    pub address: u64,
    pub cmd: u32,
    pub result: u32,
    pub flags: u32,
    pub _pad1: u32,
}

/// Shadow copies of the guest-visible registers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(super) struct Registers {
    pub address: u64,
    pub size: u32,
    pub status: i32,
    pub channel: u64,
    pub wakes: u32,
    pub params_addr: u64,
}

/// Device-side record of one open channel.
pub(super) struct HwPipe {
    pub channel: u64,
    pub generation: u64,
    /// Wake conditions the guest asked for and has not been told about yet.
    pub wanted: u32,
    pub pipe: Pipe,
}

/// Goldfish pipe device.
///
/// Open channels live in an arena indexed by slot. Wake state is kept in a [`SignalTable`] shared
/// with every [`HwPipeHandle`] handed to services.
pub struct PipeDevice {
    pub(super) registry: Arc<PipeServiceRegistry>,
    mapper: GuestBufferMapper,
    pub(super) signals: Arc<Mutex<SignalTable>>,
    pub(super) pipes: Vec<Option<HwPipe>>,
    free_slots: Vec<usize>,
    pub(super) channels: BTreeMap<u64, usize>,
    pub(super) regs: Registers,
    pub(super) mode: AddressMode,
    guest_64bit: bool,
}

impl PipeDevice {
    /// Creates a device serving the services in `registry`.
    ///
    /// `guest_64bit` selects the layout of the batch parameter block.
    pub fn new(
        registry: Arc<PipeServiceRegistry>,
        mapper: GuestBufferMapper,
        irq: Box<dyn IrqLine>,
        guest_64bit: bool,
    ) -> PipeDevice {
        PipeDevice {
            registry,
            mapper,
            signals: Arc::new(Mutex::new(SignalTable::new(irq))),
            pipes: Vec::new(),
            free_slots: Vec::new(),
            channels: BTreeMap::new(),
            regs: Registers::default(),
            mode: AddressMode::Virtual,
            guest_64bit,
        }
    }

    pub fn address_mode(&self) -> AddressMode {
        self.mode
    }

    pub fn memory(&self) -> &GuestMemory {
        self.mapper.memory()
    }

    pub fn registry(&self) -> &Arc<PipeServiceRegistry> {
        &self.registry
    }

    /// Number of open channels.
    pub fn pipe_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_open(&self, channel: u64) -> bool {
        self.channels.contains_key(&channel)
    }

    /// Whether `channel` is waiting in the signaled queue.
    pub fn is_signaled(&self, channel: u64) -> bool {
        match self.channels.get(&channel) {
            Some(&index) => self.signals.lock().is_queued(index),
            None => false,
        }
    }

    pub fn irq_asserted(&self) -> bool {
        self.signals.lock().irq_asserted()
    }

    /// Name of the service `channel` is connected to.
    pub fn service_name(&self, channel: u64) -> Option<&str> {
        self.hwpipe(channel)?.pipe.service_name()
    }

    fn hwpipe(&self, channel: u64) -> Option<&HwPipe> {
        let index = *self.channels.get(&channel)?;
        self.pipes.get(index)?.as_ref()
    }

    /// Places a new pipe for `channel` in a free slot and returns the slot.
    pub(super) fn attach_pipe(
        &mut self,
        channel: u64,
        wanted: u32,
        make_pipe: impl FnOnce(HwPipeHandle) -> Pipe,
    ) -> usize {
        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                self.pipes.push(None);
                self.pipes.len() - 1
            }
        };
        let generation = self.signals.lock().attach(index);
        let handle = HwPipeHandle::new(index, generation, self.signals.clone());
        self.pipes[index] = Some(HwPipe {
            channel,
            generation,
            wanted,
            pipe: make_pipe(handle),
        });
        self.channels.insert(channel, index);
        index
    }

    /// Forgets the pipe in `index` without running its close callback.
    fn detach_pipe(&mut self, index: usize) -> Option<HwPipe> {
        let hwpipe = self.pipes.get_mut(index)?.take()?;
        self.channels.remove(&hwpipe.channel);
        self.signals.lock().detach(index);
        self.free_slots.push(index);
        Some(hwpipe)
    }

    /// Closes every pipe and empties the signaled queue.
    pub(super) fn reset_pipes(&mut self) {
        self.signals.lock().clear();
        self.channels.clear();
        self.free_slots.clear();
        let pipes = std::mem::take(&mut self.pipes);
        if !pipes.is_empty() {
            debug!("goldfish pipe: closing {} pipes", pipes.iter().flatten().count());
        }
        for hwpipe in pipes.into_iter().flatten() {
            hwpipe.pipe.close();
        }
    }

    /// Runs one guest command and returns the status value for it.
    pub fn execute(&mut self, command: u32, channel: u64, address: u64, size: u32) -> i32 {
        let Some(command) = PipeCommand::n(command) else {
            warn!("goldfish pipe: unknown command {}", command);
            return PipeError::Inval.status();
        };

        if command == PipeCommand::Open {
            return self.open(channel);
        }

        let Some(&index) = self.channels.get(&channel) else {
            warn!(
                "goldfish pipe: {:?} on unknown channel {:#x}",
                command, channel
            );
            return PipeError::Inval.status();
        };

        if command == PipeCommand::Close {
            if let Some(hwpipe) = self.detach_pipe(index) {
                debug!("goldfish pipe: close channel {:#x}", channel);
                hwpipe.pipe.close();
            }
            return 0;
        }

        if self.signals.lock().is_closed(index) {
            return PipeError::Io.status();
        }

        match command {
            PipeCommand::Poll => match &self.pipes[index] {
                Some(hwpipe) => hwpipe.pipe.poll() as i32,
                None => PipeError::Inval.status(),
            },
            PipeCommand::WriteBuffer | PipeCommand::ReadBuffer => {
                self.transfer(index, command, address, size)
            }
            PipeCommand::WakeOnRead => self.wake_on(index, PIPE_WAKE_READ),
            PipeCommand::WakeOnWrite => self.wake_on(index, PIPE_WAKE_WRITE),
            PipeCommand::Open | PipeCommand::Close => unreachable!(),
        }
    }

    fn open(&mut self, channel: u64) -> i32 {
        if self.channels.contains_key(&channel) {
            warn!("goldfish pipe: channel {:#x} is already open", channel);
            return PipeError::Inval.status();
        }
        debug!("goldfish pipe: open channel {:#x}", channel);
        self.attach_pipe(channel, 0, Pipe::new);
        0
    }

    fn transfer(&mut self, index: usize, command: PipeCommand, address: u64, size: u32) -> i32 {
        let Some(hwpipe) = self.pipes[index].as_mut() else {
            return PipeError::Inval.status();
        };
        let access = match command {
            PipeCommand::ReadBuffer => Access::Write,
            _ => Access::Read,
        };
        let mut mapping = match self.mapper.map(self.mode, address, size.into(), access) {
            Ok(mapping) => mapping,
            Err(e) => {
                warn!(
                    "goldfish pipe: cannot map {:#x}+{:#x} for channel {:#x}: {}",
                    address, size, hwpipe.channel, e
                );
                return PipeError::Inval.status();
            }
        };

        let was_connecting = hwpipe.pipe.is_connecting();
        let result = match command {
            PipeCommand::ReadBuffer => match mapping.as_mut_slice() {
                Ok(buf) => hwpipe.pipe.recv_buffers(&mut [buf]),
                Err(_) => Err(PipeError::Inval),
            },
            _ => hwpipe
                .pipe
                .send_buffers(&self.registry, &[mapping.as_slice()]),
        };
        drop(mapping);

        if was_connecting && hwpipe.pipe.is_connecting() && result.is_err() {
            // A failed connection leaves nothing for the guest to talk to.
            let channel = hwpipe.channel;
            self.detach_pipe(index);
            warn!("goldfish pipe: dropped channel {:#x} after failed connection", channel);
        }
        transfer_status(result)
    }

    fn wake_on(&mut self, index: usize, flag: u32) -> i32 {
        if let Some(hwpipe) = self.pipes[index].as_mut() {
            if hwpipe.wanted & flag == 0 {
                hwpipe.wanted |= flag;
                hwpipe.pipe.wake_on(hwpipe.wanted);
            }
        }
        0
    }

    /// Pops the next signaled pipe, latching its channel and wakes.
    fn read_channel(&mut self) -> u32 {
        let popped = self.signals.lock().pop();
        let Some((index, wakes)) = popped else {
            return 0;
        };
        let Some(hwpipe) = self.pipes.get_mut(index).and_then(Option::as_mut) else {
            return 0;
        };
        hwpipe.wanted &= !wakes;
        self.regs.channel = hwpipe.channel;
        self.regs.wakes = wakes;
        hwpipe.channel as u32
    }

    /// Executes the batch parameter block the guest placed at `params_addr`.
    ///
    /// Only buffer transfers are honored; other commands leave the block untouched. The transfer
    /// does not go through the register file: CHANNEL, SIZE, ADDRESS and STATUS keep their values
    /// and the status is reported only in the block's `result` field.
    fn access_params(&mut self) {
        let mem = self.mapper.memory().clone();
        let addr = GuestAddress(self.regs.params_addr);
        let (command, channel, address, size, result_addr) = if self.guest_64bit {
            match mem.read_obj_from_addr::<AccessParams64>(addr) {
                Ok(p) => (
                    p.cmd,
                    p.channel,
                    p.address,
                    p.size,
                    addr.unchecked_add(offset_of!(AccessParams64, result) as u64),
                ),
                Err(e) => {
                    warn!("goldfish pipe: cannot read access params at {}: {}", addr, e);
                    return;
                }
            }
        } else {
            match mem.read_obj_from_addr::<AccessParams32>(addr) {
                Ok(p) => (
                    p.cmd,
                    p.channel.into(),
                    p.address.into(),
                    p.size,
                    addr.unchecked_add(offset_of!(AccessParams32, result) as u64),
                ),
                Err(e) => {
                    warn!("goldfish pipe: cannot read access params at {}: {}", addr, e);
                    return;
                }
            }
        };

        if command != PipeCommand::ReadBuffer as u32 && command != PipeCommand::WriteBuffer as u32
        {
            return;
        }
        let status = self.execute(command, channel, address, size);
        if let Err(e) = mem.write_obj_at_addr(status, result_addr) {
            warn!("goldfish pipe: cannot write access params result: {}", e);
        }
    }

    pub fn write_register(&mut self, offset: u64, value: u32) {
        match offset {
            PIPE_REG_COMMAND => {
                self.regs.status =
                    self.execute(value, self.regs.channel, self.regs.address, self.regs.size);
            }
            PIPE_REG_SIZE => self.regs.size = value,
            PIPE_REG_ADDRESS => set_low(&mut self.regs.address, value),
            PIPE_REG_ADDRESS_HIGH => set_high(&mut self.regs.address, value),
            PIPE_REG_CHANNEL => set_low(&mut self.regs.channel, value),
            PIPE_REG_CHANNEL_HIGH => set_high(&mut self.regs.channel, value),
            PIPE_REG_PARAMS_ADDR_LOW => set_low(&mut self.regs.params_addr, value),
            PIPE_REG_PARAMS_ADDR_HIGH => set_high(&mut self.regs.params_addr, value),
            PIPE_REG_ACCESS_PARAMS => self.access_params(),
            o => warn!("goldfish pipe: write of {:#x} to bad offset {:#x}", value, o),
        }
    }

    pub fn read_register(&mut self, offset: u64) -> u32 {
        match offset {
            PIPE_REG_STATUS => self.regs.status as u32,
            PIPE_REG_CHANNEL => self.read_channel(),
            PIPE_REG_CHANNEL_HIGH => (self.regs.channel >> 32) as u32,
            PIPE_REG_SIZE => self.regs.size,
            PIPE_REG_ADDRESS => self.regs.address as u32,
            PIPE_REG_ADDRESS_HIGH => (self.regs.address >> 32) as u32,
            PIPE_REG_WAKES => self.regs.wakes,
            PIPE_REG_PARAMS_ADDR_LOW => self.regs.params_addr as u32,
            PIPE_REG_PARAMS_ADDR_HIGH => (self.regs.params_addr >> 32) as u32,
            PIPE_REG_VERSION => {
                // Only guests that understand physical addressing probe the version.
                debug!("goldfish pipe: guest probed version, switching to physical addresses");
                self.mode = AddressMode::Physical;
                self.reset_pipes();
                PIPE_DEVICE_VERSION
            }
            o => {
                warn!("goldfish pipe: read from bad offset {:#x}", o);
                0
            }
        }
    }
}

fn set_low(reg: &mut u64, value: u32) {
    *reg = (*reg & !0xffff_ffff) | u64::from(value);
}

fn set_high(reg: &mut u64, value: u32) {
    *reg = (*reg & 0xffff_ffff) | (u64::from(value) << 32);
}

impl Drop for PipeDevice {
    fn drop(&mut self) {
        self.reset_pipes();
    }
}

impl BusDevice for PipeDevice {
    fn debug_label(&self) -> String {
        "goldfish pipe".to_owned()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        let data_array = match <&mut [u8; 4]>::try_from(&mut *data) {
            Ok(array) => array,
            _ => {
                warn!("goldfish pipe: bad read size {}", data.len());
                return;
            }
        };
        *data_array = self.read_register(info.offset).to_le_bytes();
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        let data_array = match <&[u8; 4]>::try_from(data) {
            Ok(array) => array,
            _ => {
                warn!("goldfish pipe: bad write size {}", data.len());
                return;
            }
        };
        self.write_register(info.offset, u32::from_le_bytes(*data_array));
    }

    fn reset(&mut self) {
        self.reset_pipes();
        self.regs = Registers::default();
    }
}

#[derive(Serialize, Deserialize)]
struct PipeDeviceSnapshot {
    state: Vec<u8>,
}

impl Suspendable for PipeDevice {
    fn sleep(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn wake(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn snapshot(&mut self) -> anyhow::Result<AnySnapshot> {
        let state = self.save().context("failed to save goldfish pipe")?;
        AnySnapshot::to_any(PipeDeviceSnapshot { state })
    }

    fn restore(&mut self, data: AnySnapshot) -> anyhow::Result<()> {
        let snapshot: PipeDeviceSnapshot = AnySnapshot::from_any(data)?;
        self.load(&snapshot.state)
            .context("failed to restore goldfish pipe")
    }
}
