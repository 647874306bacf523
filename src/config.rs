// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;

use base::syslog::LogConfig;
use devices::goldfish::pipe::SnapshotFormat;
use devices::goldfish::pipe::PIPE_MMIO_SIZE;
use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("pipe mmio base {0:#x} is not page aligned")]
    MisalignedMmioBase(u64),
    #[error("failed to open config file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("unknown pipe snapshot version {0}")]
    UnknownSnapshotVersion(u32),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub const DEFAULT_PIPE_MMIO_BASE: u64 = 0xff01_0000;

/// Goldfish pipe device settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipeConfig {
    /// Guest physical address of the register page.
    pub mmio_base: u64,
    /// Selects the 64-bit layout of the batch parameter block.
    pub guest_64bit: bool,
    /// Registers the `zero` and `pingpong` services.
    pub enable_debug_services: bool,
    /// Snapshot stream version the embedder expects. Saves always use the current version; older
    /// versions are accepted on load.
    pub snapshot_version: u32,
}

impl Default for PipeConfig {
    fn default() -> Self {
        PipeConfig {
            mmio_base: DEFAULT_PIPE_MMIO_BASE,
            guest_64bit: true,
            enable_debug_services: false,
            snapshot_version: SnapshotFormat::Current as u32,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QemudConfig {
    /// Exposes qemud services as the `qemud` pipe service and over the serial multiplexer.
    pub enabled: bool,
}

impl Default for QemudConfig {
    fn default() -> Self {
        QemudConfig { enabled: true }
    }
}

/// Top level configuration, usually read from a JSON file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GoldfishConfig {
    pub pipe: PipeConfig,
    pub qemud: QemudConfig,
    pub log: LogConfig,
}

impl GoldfishConfig {
    /// Reads and validates the JSON configuration at `path`.
    pub fn from_file(path: &Path) -> Result<GoldfishConfig> {
        let file = File::open(path).map_err(|source| ConfigError::Open {
            path: path.to_owned(),
            source,
        })?;
        let cfg: GoldfishConfig =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipe.mmio_base % PIPE_MMIO_SIZE != 0 {
            return Err(ConfigError::MisalignedMmioBase(self.pipe.mmio_base));
        }
        if SnapshotFormat::n(self.pipe.snapshot_version).is_none() {
            return Err(ConfigError::UnknownSnapshotVersion(
                self.pipe.snapshot_version,
            ));
        }
        Ok(())
    }
}
