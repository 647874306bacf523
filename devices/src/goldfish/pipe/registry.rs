// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::sync::Arc;

use base::debug;
use remain::sorted;
use thiserror::Error;

use super::PipeService;

/// Maximum number of services one registry accepts.
pub const MAX_PIPE_SERVICES: usize = 16;
/// Maximum length of a service name in bytes.
pub const MAX_SERVICE_NAME_LEN: usize = 255;

/// Registration failures. These are configuration mistakes and abort VM construction.
#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("pipe service name is {len} bytes long, the maximum is {MAX_SERVICE_NAME_LEN}")]
    NameTooLong { len: usize },
    #[error("cannot register pipe service {0}: all {MAX_PIPE_SERVICES} slots are taken")]
    TooManyServices(String),
}

pub struct PipeServiceEntry {
    name: String,
    service: Arc<dyn PipeService>,
}

impl PipeServiceEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &Arc<dyn PipeService> {
        &self.service
    }
}

impl fmt::Debug for PipeServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PipeServiceEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Table of the services guest clients may connect to.
///
/// Populated while the VM is being built and shared read-only with the pipe device afterwards.
#[derive(Default, Debug)]
pub struct PipeServiceRegistry {
    services: Vec<PipeServiceEntry>,
}

impl PipeServiceRegistry {
    pub fn new() -> PipeServiceRegistry {
        Default::default()
    }

    /// Adds `service` under `name`.
    ///
    /// Names are not checked for duplicates; lookups return the earliest registration.
    pub fn register(
        &mut self,
        name: &str,
        service: Arc<dyn PipeService>,
    ) -> Result<(), RegistryError> {
        if name.len() > MAX_SERVICE_NAME_LEN {
            return Err(RegistryError::NameTooLong { len: name.len() });
        }
        if self.services.len() >= MAX_PIPE_SERVICES {
            return Err(RegistryError::TooManyServices(name.to_owned()));
        }
        debug!("goldfish pipe: registered service {}", name);
        self.services.push(PipeServiceEntry {
            name: name.to_owned(),
            service,
        });
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&PipeServiceEntry> {
        self.services.iter().find(|entry| entry.name == name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|entry| entry.name.as_str())
    }
}
