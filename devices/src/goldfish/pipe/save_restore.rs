// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Binary save/restore of the pipe device.
//!
//! Two stream layouts exist. `Legacy` streams interleave device fields with each pipe's state and
//! carry no wake interest or service arguments. `Current` streams keep every per-pipe field in the
//! generic pipe record. Saving always produces `Current`; loading accepts both.

use std::collections::BTreeSet;

use base::debug;
use base::warn;
use enumn::N;
use remain::sorted;
use snapshot::SnapshotReader;
use snapshot::SnapshotWriter;
use thiserror::Error;

use super::client::STATE_CONNECTOR;
use super::client::STATE_DEAD;
use super::client::STATE_SERVICE;
use super::device::Registers;
use super::AddressMode;
use super::Pipe;
use super::PipeDevice;
use super::PIPE_WAKE_CLOSED;

/// Version tag at the start of a pipe snapshot stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum SnapshotFormat {
    Legacy = 1,
    Current = 2,
}

#[sorted]
#[derive(Error, Debug)]
pub enum PipeSnapshotError {
    #[error("channel {0:#x} appears more than once")]
    DuplicateChannel(u64),
    #[error("failed to save '{service}' pipe on channel {channel:#x}: {error:#}")]
    ServiceSave {
        service: String,
        channel: u64,
        error: anyhow::Error,
    },
    #[error("malformed pipe snapshot: {0}")]
    Stream(#[from] snapshot::Error),
    #[error("unknown pipe state tag {0}")]
    UnknownPipeState(u8),
    #[error("unsupported pipe snapshot version {0}")]
    UnknownVersion(u32),
}

pub type Result<T> = std::result::Result<T, PipeSnapshotError>;

enum SavedState<'a> {
    Connector(&'a [u8]),
    Service {
        name: String,
        args: Option<String>,
        payload: &'a [u8],
    },
    Dead,
}

struct SavedPipe<'a> {
    channel: u64,
    wakes: u32,
    wanted: u32,
    closed: bool,
    state: SavedState<'a>,
}

/// A fully parsed stream, so nothing is torn down until the whole input is known to be good.
struct SavedDevice<'a> {
    regs: Registers,
    mode: AddressMode,
    pipes: Vec<SavedPipe<'a>>,
}

fn mode_from_flag(physical: bool) -> AddressMode {
    if physical {
        AddressMode::Physical
    } else {
        AddressMode::Virtual
    }
}

fn check_unique(seen: &mut BTreeSet<u64>, channel: u64) -> Result<()> {
    if !seen.insert(channel) {
        return Err(PipeSnapshotError::DuplicateChannel(channel));
    }
    Ok(())
}

fn parse_legacy<'a>(r: &mut SnapshotReader<'a>) -> Result<SavedDevice<'a>> {
    let regs = Registers {
        address: r.get_be64()?,
        size: r.get_be32()?,
        status: r.get_i32()?,
        channel: r.get_be64()?,
        wakes: r.get_be32()?,
        params_addr: 0,
    };
    let mode = mode_from_flag(r.get_bool()?);

    let count = r.get_be32()?;
    let mut seen = BTreeSet::new();
    let mut pipes = Vec::new();
    for _ in 0..count {
        let channel = r.get_be64()?;
        check_unique(&mut seen, channel)?;
        let wakes = r.get_u8()?.into();
        let closed = r.get_bool()?;
        let state = if r.get_bool()? {
            SavedState::Service {
                name: r.get_string()?,
                args: None,
                payload: r.get_buffer()?,
            }
        } else {
            SavedState::Connector(r.get_buffer()?)
        };
        pipes.push(SavedPipe {
            channel,
            wakes,
            wanted: 0,
            closed,
            state,
        });
    }
    Ok(SavedDevice { regs, mode, pipes })
}

fn parse_current<'a>(r: &mut SnapshotReader<'a>) -> Result<SavedDevice<'a>> {
    let regs = Registers {
        address: r.get_be64()?,
        size: r.get_be32()?,
        status: r.get_i32()?,
        channel: r.get_be64()?,
        wakes: r.get_be32()?,
        params_addr: r.get_be64()?,
    };
    let mode = mode_from_flag(r.get_bool()?);

    let count = r.get_be32()?;
    let mut seen = BTreeSet::new();
    let mut pipes = Vec::new();
    for _ in 0..count {
        let channel = r.get_be64()?;
        check_unique(&mut seen, channel)?;
        let wakes = r.get_be32()?;
        let wanted = r.get_be32()?;
        let closed = r.get_bool()?;
        let state = match r.get_u8()? {
            STATE_CONNECTOR => SavedState::Connector(r.get_buffer()?),
            STATE_SERVICE => {
                let name = r.get_string()?;
                let args = if r.get_bool()? {
                    Some(r.get_string()?)
                } else {
                    None
                };
                SavedState::Service {
                    name,
                    args,
                    payload: r.get_buffer()?,
                }
            }
            STATE_DEAD => SavedState::Dead,
            tag => return Err(PipeSnapshotError::UnknownPipeState(tag)),
        };
        pipes.push(SavedPipe {
            channel,
            wakes,
            wanted,
            closed,
            state,
        });
    }
    Ok(SavedDevice { regs, mode, pipes })
}

impl PipeDevice {
    /// Serializes the registers and every open pipe.
    pub fn save(&self) -> Result<Vec<u8>> {
        let mut out = SnapshotWriter::new();
        out.put_be32(SnapshotFormat::Current as u32);
        out.put_be64(self.regs.address);
        out.put_be32(self.regs.size);
        out.put_i32(self.regs.status);
        out.put_be64(self.regs.channel);
        out.put_be32(self.regs.wakes);
        out.put_be64(self.regs.params_addr);
        out.put_bool(self.mode == AddressMode::Physical);

        let open: Vec<_> = self
            .pipes
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|hwpipe| (index, hwpipe)))
            .collect();
        // Read wake state up front; instance save callbacks may use their handles.
        let wake_state: Vec<_> = {
            let signals = self.signals.lock();
            open.iter()
                .map(|(index, _)| (signals.wakes(*index), signals.is_closed(*index)))
                .collect()
        };

        out.put_be32(open.len() as u32);
        for ((_, hwpipe), (wakes, closed)) in open.iter().zip(wake_state) {
            out.put_be64(hwpipe.channel);
            out.put_be32(wakes);
            out.put_be32(hwpipe.wanted);
            out.put_bool(closed);
            hwpipe
                .pipe
                .save(&mut out)
                .map_err(|error| PipeSnapshotError::ServiceSave {
                    service: hwpipe.pipe.service_name().unwrap_or_default().to_owned(),
                    channel: hwpipe.channel,
                    error,
                })?;
        }
        Ok(out.into_inner())
    }

    /// Replaces the device state with a saved stream.
    ///
    /// The stream is parsed completely before any open pipe is closed. Pipes whose service is
    /// missing or cannot restore them come back closed, with `PIPE_WAKE_CLOSED` queued for the
    /// guest.
    pub fn load(&mut self, data: &[u8]) -> Result<()> {
        let mut r = SnapshotReader::new(data);
        let version = r.get_be32()?;
        let format =
            SnapshotFormat::n(version).ok_or(PipeSnapshotError::UnknownVersion(version))?;
        let saved = match format {
            SnapshotFormat::Legacy => parse_legacy(&mut r)?,
            SnapshotFormat::Current => parse_current(&mut r)?,
        };
        r.finish()?;

        self.reset_pipes();
        self.regs = saved.regs;
        self.mode = saved.mode;
        debug!(
            "goldfish pipe: restoring {} pipes from {:?} snapshot",
            saved.pipes.len(),
            format
        );

        let registry = self.registry.clone();
        for saved_pipe in saved.pipes {
            let SavedPipe {
                channel,
                mut wakes,
                wanted,
                mut closed,
                state,
            } = saved_pipe;
            let index = self.attach_pipe(channel, wanted, |handle| match state {
                SavedState::Connector(contents) => Pipe::with_connector_contents(handle, contents),
                SavedState::Service {
                    name,
                    args,
                    payload,
                } => Pipe::with_service_state(&registry, handle, name, args, payload),
                SavedState::Dead => Pipe::dead(handle),
            });

            let Some(hwpipe) = self.pipes[index].as_ref() else {
                continue;
            };
            if hwpipe.pipe.is_dead() {
                warn!("goldfish pipe: channel {:#x} restored closed", channel);
                wakes |= PIPE_WAKE_CLOSED;
                closed = true;
            }
            let generation = hwpipe.generation;
            self.signals
                .lock()
                .restore(index, generation, wakes, closed);
        }
        Ok(())
    }
}
