// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use base::debug;
use base::warn;
use snapshot::SnapshotReader;
use snapshot::SnapshotWriter;

use super::ConnectorProgress;
use super::HwPipeHandle;
use super::PipeConnector;
use super::PipeError;
use super::PipeInstance;
use super::PipeResult;
use super::PipeServiceRegistry;
use super::PIPE_POLL_HUP;

// State tags in the current snapshot format.
pub(super) const STATE_CONNECTOR: u8 = 0;
pub(super) const STATE_SERVICE: u8 = 1;
pub(super) const STATE_DEAD: u8 = 2;

enum PipeState {
    Connecting(PipeConnector),
    Connected {
        service: String,
        args: Option<String>,
        instance: Box<dyn PipeInstance>,
    },
    /// Restored from a snapshot its service could not take back.
    Dead,
}

/// The host side of one guest channel.
///
/// Starts out talking to a [`PipeConnector`] and is handed to the service instance once the
/// connection string resolves.
pub struct Pipe {
    hwpipe: HwPipeHandle,
    state: PipeState,
}

impl Pipe {
    pub fn new(hwpipe: HwPipeHandle) -> Pipe {
        Pipe {
            hwpipe,
            state: PipeState::Connecting(PipeConnector::new()),
        }
    }

    pub(super) fn dead(hwpipe: HwPipeHandle) -> Pipe {
        Pipe {
            hwpipe,
            state: PipeState::Dead,
        }
    }

    /// Recreates a pipe still waiting for its connection string.
    pub(super) fn with_connector_contents(hwpipe: HwPipeHandle, contents: &[u8]) -> Pipe {
        Pipe {
            hwpipe,
            state: PipeState::Connecting(PipeConnector::with_contents(contents)),
        }
    }

    /// Recreates a connected pipe from the payload its instance saved.
    ///
    /// Failure to find the service or to load the payload yields a dead pipe; the caller decides
    /// how to tell the guest.
    pub(super) fn with_service_state(
        registry: &PipeServiceRegistry,
        hwpipe: HwPipeHandle,
        service: String,
        args: Option<String>,
        payload: &[u8],
    ) -> Pipe {
        let Some(entry) = registry.find(&service) else {
            warn!("goldfish pipe: cannot restore unknown service '{}'", service);
            return Pipe::dead(hwpipe);
        };
        let mut reader = SnapshotReader::new(payload);
        match entry
            .service()
            .load(hwpipe.clone(), args.as_deref(), &mut reader)
        {
            Ok(instance) => Pipe {
                hwpipe,
                state: PipeState::Connected {
                    service,
                    args,
                    instance,
                },
            },
            Err(e) => {
                warn!("goldfish pipe: failed to restore '{}' pipe: {:#}", service, e);
                Pipe::dead(hwpipe)
            }
        }
    }

    pub fn hwpipe(&self) -> &HwPipeHandle {
        &self.hwpipe
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.state, PipeState::Connecting(_))
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state, PipeState::Dead)
    }

    /// Name of the service this pipe is connected to, if any.
    pub fn service_name(&self) -> Option<&str> {
        match &self.state {
            PipeState::Connected { service, .. } => Some(service),
            _ => None,
        }
    }

    pub fn args(&self) -> Option<&str> {
        match &self.state {
            PipeState::Connected { args, .. } => args.as_deref(),
            _ => None,
        }
    }

    /// Hands guest-written bytes to the connector or the connected instance.
    pub fn send_buffers(
        &mut self,
        registry: &PipeServiceRegistry,
        buffers: &[&[u8]],
    ) -> PipeResult<usize> {
        match &mut self.state {
            PipeState::Connecting(connector) => {
                match connector.send_buffers(registry, &self.hwpipe, buffers)? {
                    ConnectorProgress::Pending { consumed } => Ok(consumed),
                    ConnectorProgress::Resolved {
                        consumed,
                        service,
                        args,
                        instance,
                    } => {
                        debug!("goldfish pipe: {:?} now served by '{}'", self.hwpipe, service);
                        self.state = PipeState::Connected {
                            service,
                            args,
                            instance,
                        };
                        Ok(consumed)
                    }
                }
            }
            PipeState::Connected { instance, .. } => instance.send_buffers(buffers),
            PipeState::Dead => Err(PipeError::Io),
        }
    }

    pub fn recv_buffers(&mut self, buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        match &mut self.state {
            PipeState::Connected { instance, .. } => instance.recv_buffers(buffers),
            PipeState::Connecting(_) | PipeState::Dead => Err(PipeError::Io),
        }
    }

    pub fn poll(&self) -> u32 {
        match &self.state {
            PipeState::Connecting(connector) => connector.poll(),
            PipeState::Connected { instance, .. } => instance.poll(),
            PipeState::Dead => PIPE_POLL_HUP,
        }
    }

    pub fn wake_on(&mut self, flags: u32) {
        if let PipeState::Connected { instance, .. } = &mut self.state {
            instance.wake_on(flags);
        }
    }

    /// Tears down the host side. Only connected pipes have anything to release.
    pub fn close(mut self) {
        if let PipeState::Connected { instance, .. } = &mut self.state {
            instance.close();
        }
    }

    /// Writes the state tag and its payload: connector bytes, or the service identity followed by
    /// the instance's own state as a nested section.
    pub(super) fn save(&self, out: &mut SnapshotWriter) -> anyhow::Result<()> {
        match &self.state {
            PipeState::Connecting(connector) => {
                out.put_u8(STATE_CONNECTOR);
                out.put_buffer(connector.contents());
            }
            PipeState::Connected {
                service,
                args,
                instance,
            } => {
                out.put_u8(STATE_SERVICE);
                out.put_string(service);
                out.put_bool(args.is_some());
                if let Some(args) = args {
                    out.put_string(args);
                }
                out.put_section(|section| instance.save(section))?;
            }
            PipeState::Dead => out.put_u8(STATE_DEAD),
        }
        Ok(())
    }
}
