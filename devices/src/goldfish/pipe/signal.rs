// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wake bookkeeping shared between the pipe device and host services.
//!
//! Services hold [`HwPipeHandle`]s and may signal from any context, including from inside a
//! transfer callback the device is currently running. The pending wake masks, closed flags and
//! the queue of signaled pipes therefore live behind their own lock rather than inside the device.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use sync::Mutex;

use super::PIPE_WAKE_CLOSED;
use crate::IrqLine;

#[derive(Default)]
struct SignalSlot {
    generation: u64,
    live: bool,
    wakes: u32,
    closed: bool,
    queued: bool,
}

/// Pending wakes for every arena slot plus the FIFO of slots the guest has yet to drain.
///
/// A slot is queued at most once; repeated signals only accumulate wake bits. The interrupt line
/// is asserted exactly while the queue is non-empty.
pub(super) struct SignalTable {
    slots: Vec<SignalSlot>,
    queue: VecDeque<usize>,
    irq: Box<dyn IrqLine>,
    irq_asserted: bool,
}

impl SignalTable {
    pub fn new(irq: Box<dyn IrqLine>) -> SignalTable {
        SignalTable {
            slots: Vec::new(),
            queue: VecDeque::new(),
            irq,
            irq_asserted: false,
        }
    }

    fn update_irq(&mut self) {
        let level = !self.queue.is_empty();
        if level != self.irq_asserted {
            self.irq_asserted = level;
            self.irq.set_level(level);
        }
    }

    fn slot_mut(&mut self, index: usize, generation: u64) -> Option<&mut SignalSlot> {
        self.slots
            .get_mut(index)
            .filter(|slot| slot.live && slot.generation == generation)
    }

    /// Starts tracking a new pipe in `index`, returning the generation its handles carry.
    pub fn attach(&mut self, index: usize) -> u64 {
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, Default::default);
        }
        let slot = &mut self.slots[index];
        slot.generation += 1;
        slot.live = true;
        slot.wakes = 0;
        slot.closed = false;
        slot.queued = false;
        slot.generation
    }

    /// Stops tracking the pipe in `index` and drops it from the queue.
    pub fn detach(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.live = false;
            slot.wakes = 0;
            if slot.queued {
                slot.queued = false;
                self.queue.retain(|&queued| queued != index);
            }
        }
        self.update_irq();
    }

    /// Forgets every pipe. Generations survive so old handles stay inert.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.live = false;
            slot.wakes = 0;
            slot.closed = false;
            slot.queued = false;
        }
        self.queue.clear();
        self.update_irq();
    }

    pub fn signal(&mut self, index: usize, generation: u64, flags: u32) {
        let Some(slot) = self.slot_mut(index, generation) else {
            return;
        };
        slot.wakes |= flags;
        if !slot.queued {
            slot.queued = true;
            self.queue.push_back(index);
        }
        self.update_irq();
    }

    pub fn close(&mut self, index: usize, generation: u64) {
        let Some(slot) = self.slot_mut(index, generation) else {
            return;
        };
        if slot.closed {
            return;
        }
        slot.closed = true;
        self.signal(index, generation, PIPE_WAKE_CLOSED);
    }

    /// Reinstates saved wake state. Pipes with pending wakes go to the back of the queue.
    pub fn restore(&mut self, index: usize, generation: u64, wakes: u32, closed: bool) {
        let Some(slot) = self.slot_mut(index, generation) else {
            return;
        };
        slot.closed = closed;
        if wakes != 0 {
            self.signal(index, generation, wakes);
        }
    }

    /// Removes the head of the queue, returning its slot and the wakes it accumulated.
    pub fn pop(&mut self) -> Option<(usize, u32)> {
        let index = self.queue.pop_front()?;
        let slot = &mut self.slots[index];
        slot.queued = false;
        let wakes = std::mem::take(&mut slot.wakes);
        self.update_irq();
        Some((index, wakes))
    }

    pub fn is_closed(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|slot| slot.closed)
    }

    pub fn wakes(&self, index: usize) -> u32 {
        self.slots.get(index).map_or(0, |slot| slot.wakes)
    }

    pub fn is_queued(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|slot| slot.queued)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq_asserted
    }
}

/// A service's reference to the device side of its channel.
///
/// The handle stays valid after the channel is closed by the guest; signaling through it is then
/// a no-op.
#[derive(Clone)]
pub struct HwPipeHandle {
    index: usize,
    generation: u64,
    signals: Arc<Mutex<SignalTable>>,
}

impl HwPipeHandle {
    pub(super) fn new(index: usize, generation: u64, signals: Arc<Mutex<SignalTable>>) -> Self {
        HwPipeHandle {
            index,
            generation,
            signals,
        }
    }

    /// Tells the guest the `PIPE_WAKE_*` conditions in `flags` are now met.
    pub fn wake(&self, flags: u32) {
        self.signals
            .lock()
            .signal(self.index, self.generation, flags);
    }

    /// Closes the channel from the host side. The guest sees `PIPE_WAKE_CLOSED` and every later
    /// command except CLOSE fails with an I/O error.
    pub fn close(&self) {
        self.signals.lock().close(self.index, self.generation);
    }

    pub fn is_closed(&self) -> bool {
        let signals = self.signals.lock();
        signals.slots.get(self.index).map_or(true, |slot| {
            slot.generation != self.generation || !slot.live || slot.closed
        })
    }
}

impl fmt::Debug for HwPipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HwPipeHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}
