// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Facilities for routing log messages to stderr.
//!
//! Every function exported by this module is thread-safe. Messages are dropped until `init()` or
//! `init_with()` returns `Ok`.
//!
//! # Examples
//!
//! ```
//! use base::syslog;
//! use base::warn;
//!
//! if let Err(e) = syslog::init() {
//!     println!("failed to initialize syslog: {}", e);
//!     return;
//! }
//! warn!("this is your {} warning", "final");
//! ```

use std::fmt;
use std::fmt::Display;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error as ThisError;

/// The priority (i.e. severity) of a log message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Priority::*;

        let string = match self {
            Error => "ERROR",
            Warning => "WARNING",
            Info => "INFO",
            Debug => "DEBUG",
            Trace => "TRACE",
        };

        write!(f, "{}", string)
    }
}

impl From<Priority> for log::LevelFilter {
    fn from(pri: Priority) -> Self {
        match pri {
            Priority::Error => log::LevelFilter::Error,
            Priority::Warning => log::LevelFilter::Warn,
            Priority::Info => log::LevelFilter::Info,
            Priority::Debug => log::LevelFilter::Debug,
            Priority::Trace => log::LevelFilter::Trace,
        }
    }
}

impl TryFrom<&str> for Priority {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Error> {
        match value.to_lowercase().as_str() {
            "error" => Ok(Priority::Error),
            "warn" | "warning" => Ok(Priority::Warning),
            "info" => Ok(Priority::Info),
            "debug" => Ok(Priority::Debug),
            "trace" => Ok(Priority::Trace),
            _ => Err(Error::InvalidLevel(value.to_owned())),
        }
    }
}

/// Errors returned by `syslog::init()`.
#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// The requested level is not a known priority name.
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    /// Another logger was installed outside of this module.
    #[error("failed to install logger: {0}")]
    SetLogger(log::SetLoggerError),
}

/// Log settings, usually deserialized from the `log` section of the configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Default level for every module.
    pub level: Priority,
    /// Extra per-module directives in `env_logger` syntax, e.g. `devices::goldfish=trace`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: Priority::Info,
            filter: None,
        }
    }
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs the logger with the default configuration.
pub fn init() -> Result<(), Error> {
    init_with(LogConfig::default())
}

/// Installs the logger described by `cfg`.
///
/// `RUST_LOG` directives are applied on top of `cfg`. Only the first successful call has an
/// effect; later calls return `Ok` without reconfiguring anything.
pub fn init_with(cfg: LogConfig) -> Result<(), Error> {
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(cfg.level.into())
        .target(env_logger::Target::Stderr);
    if let Some(filter) = &cfg.filter {
        builder.parse_filters(filter);
    }
    if let Ok(directives) = std::env::var("RUST_LOG") {
        builder.parse_filters(&directives);
    }

    match builder.try_init() {
        Ok(()) => {
            INSTALLED.store(true, Ordering::Release);
            Ok(())
        }
        // Lost a race with a concurrent `init_with`.
        Err(_) if INSTALLED.load(Ordering::Acquire) => Ok(()),
        Err(e) => Err(Error::SetLogger(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_from_str() {
        assert_eq!(Priority::try_from("WARN").unwrap(), Priority::Warning);
        assert_eq!(Priority::try_from("trace").unwrap(), Priority::Trace);
        assert!(Priority::try_from("loud").is_err());
    }

    #[test]
    fn log_config_defaults() {
        let cfg: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, LogConfig::default());

        let cfg: LogConfig = serde_json::from_str(r#"{"level": "debug"}"#).unwrap();
        assert_eq!(cfg.level, Priority::Debug);
        assert_eq!(log::LevelFilter::from(cfg.level), log::LevelFilter::Debug);
    }
}
