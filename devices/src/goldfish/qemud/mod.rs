// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! qemud: the channel multiplexer that predates goldfish pipes.
//!
//! A daemon in the guest talks to the host over one serial line, carrying many logical channels.
//! Channel 0 is the control channel the daemon uses to connect clients to named host services.
//! The same services can also be reached over a goldfish pipe named `qemud:<service>`.

mod client;
mod multiplexer;
mod pipe;
mod serial;

use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::debug;
use remain::sorted;
use snapshot::SnapshotReader;
use snapshot::SnapshotWriter;
use thiserror::Error;

pub use self::client::MessageFramer;
pub use self::client::QemudClientSink;
pub use self::client::QemudTransport;
pub use self::client::MAX_FRAMED_MESSAGE;
pub use self::multiplexer::QemudMultiplexer;
pub use self::pipe::QemudPipeService;
pub use self::serial::SerialFrame;
pub use self::serial::SerialParser;
pub use self::serial::MAX_SERIAL_PAYLOAD;
pub use self::serial::SERIAL_HEADER_LEN;

/// Channel reserved for connection control messages.
pub const CONTROL_CHANNEL: u8 = 0;

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QemudError {
    #[error("invalid frame header {0:?}")]
    BadHeader(Vec<u8>),
    #[error("message of {0} bytes is too large to frame")]
    MessageTooLong(usize),
    #[error("qemud service {0} refused the connection")]
    Refused(String),
    #[error("qemud service {0} has no free client slots")]
    ServiceBusy(String),
    #[error("qemud service {0} is already registered")]
    ServiceExists(String),
    #[error("unknown qemud service {0}")]
    UnknownService(String),
}

pub type Result<T> = std::result::Result<T, QemudError>;

/// Host side of one qemud client connection.
#[allow(unused_variables)]
pub trait QemudClient: Send {
    /// Handles one message from the guest.
    fn recv(&mut self, msg: &[u8]);
    /// The guest side went away.
    fn close(&mut self) {}
    /// Writes what `QemudService::load` needs to recreate this client.
    fn save(&self, state: &mut SnapshotWriter) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A named host service qemud clients connect to.
#[allow(unused_variables)]
pub trait QemudService: Send + Sync {
    /// Creates a client. Messages for the guest go through `sink`.
    fn connect(&self, params: Option<&str>, sink: QemudClientSink)
        -> Option<Box<dyn QemudClient>>;

    /// Recreates a client from saved state.
    fn load(
        &self,
        params: Option<&str>,
        sink: QemudClientSink,
        state: &mut SnapshotReader,
    ) -> anyhow::Result<Box<dyn QemudClient>> {
        Err(anyhow::anyhow!("qemud service does not support snapshots"))
    }
}

struct QemudServiceEntry {
    name: String,
    max_clients: usize,
    active: Arc<AtomicUsize>,
    service: Arc<dyn QemudService>,
}

/// Reserves one of a service's client slots until dropped.
struct ClientSlot {
    active: Arc<AtomicUsize>,
}

impl ClientSlot {
    fn acquire(entry: &QemudServiceEntry) -> Option<ClientSlot> {
        let max = entry.max_clients;
        entry
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .ok()?;
        Some(ClientSlot {
            active: entry.active.clone(),
        })
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The qemud services available to the guest.
#[derive(Default)]
pub struct QemudServiceRegistry {
    services: Vec<QemudServiceEntry>,
}

impl QemudServiceRegistry {
    pub fn new() -> QemudServiceRegistry {
        Default::default()
    }

    /// Adds `service`. A `max_clients` of zero means no limit.
    pub fn register(
        &mut self,
        name: &str,
        max_clients: usize,
        service: Arc<dyn QemudService>,
    ) -> Result<()> {
        if self.find(name).is_some() {
            return Err(QemudError::ServiceExists(name.to_owned()));
        }
        debug!("qemud: registered service {} (max clients {})", name, max_clients);
        self.services.push(QemudServiceEntry {
            name: name.to_owned(),
            max_clients,
            active: Arc::new(AtomicUsize::new(0)),
            service,
        });
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&QemudServiceEntry> {
        self.services.iter().find(|entry| entry.name == name)
    }

    /// Number of clients currently connected to `name`.
    pub fn active_clients(&self, name: &str) -> usize {
        self.find(name)
            .map_or(0, |entry| entry.active.load(Ordering::Acquire))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|entry| entry.name.as_str())
    }

    /// Connects a new client of `name`.
    pub fn connect(
        &self,
        name: &str,
        params: Option<&str>,
        sink: QemudClientSink,
    ) -> Result<QemudConnection> {
        let entry = self
            .find(name)
            .ok_or_else(|| QemudError::UnknownService(name.to_owned()))?;
        let slot =
            ClientSlot::acquire(entry).ok_or_else(|| QemudError::ServiceBusy(name.to_owned()))?;
        let client = entry
            .service
            .connect(params, sink.clone())
            .ok_or_else(|| QemudError::Refused(name.to_owned()))?;
        Ok(QemudConnection::new(name, params, sink, client, slot))
    }

    /// Recreates a client of `name` from saved state.
    pub fn load(
        &self,
        name: &str,
        params: Option<&str>,
        sink: QemudClientSink,
        state: &mut SnapshotReader,
    ) -> anyhow::Result<QemudConnection> {
        let entry = self
            .find(name)
            .ok_or_else(|| QemudError::UnknownService(name.to_owned()))?;
        let slot =
            ClientSlot::acquire(entry).ok_or_else(|| QemudError::ServiceBusy(name.to_owned()))?;
        let client = entry.service.load(params, sink.clone(), state)?;
        Ok(QemudConnection::new(name, params, sink, client, slot))
    }
}

impl fmt::Debug for QemudServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// A connected client together with the transport state around it.
///
/// When the client has switched on framing, incoming bytes are reassembled into whole messages
/// before the client sees them.
pub struct QemudConnection {
    service: String,
    params: Option<String>,
    sink: QemudClientSink,
    client: Box<dyn QemudClient>,
    framer: MessageFramer,
    _slot: ClientSlot,
}

impl QemudConnection {
    fn new(
        service: &str,
        params: Option<&str>,
        sink: QemudClientSink,
        client: Box<dyn QemudClient>,
        slot: ClientSlot,
    ) -> QemudConnection {
        QemudConnection {
            service: service.to_owned(),
            params: params.map(str::to_owned),
            sink,
            client,
            framer: MessageFramer::new(),
            _slot: slot,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn params(&self) -> Option<&str> {
        self.params.as_deref()
    }

    pub fn sink(&self) -> &QemudClientSink {
        &self.sink
    }

    /// Delivers one transport message to the client.
    pub fn deliver(&mut self, msg: &[u8]) -> Result<()> {
        if !self.sink.framing() {
            self.client.recv(msg);
            return Ok(());
        }
        let mut messages = Vec::new();
        let framed = self.framer.push(msg, &mut messages);
        for msg in messages {
            self.client.recv(&msg);
        }
        framed
    }

    /// Tells the client its guest side is gone. The service slot is released on drop.
    pub fn close(mut self) {
        self.client.close();
    }

    pub fn save(&self, state: &mut SnapshotWriter) -> anyhow::Result<()> {
        self.client.save(state)
    }
}

/// Splits `service[:params]`, treating empty params as absent.
fn split_service_params(s: &str) -> (&str, Option<&str>) {
    match s.split_once(':') {
        Some((name, params)) if !params.is_empty() => (name, Some(params)),
        Some((name, _)) => (name, None),
        None => (s, None),
    }
}


#[cfg(test)]
mod tests {
    use sync::Mutex;

    use super::testing::EchoService;
    use super::*;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl QemudTransport for Recorder {
        fn send(&self, msg: &[u8]) {
            self.sent.lock().push(msg.to_vec());
        }

        fn close(&self) {}
    }

    #[test]
    fn split_params() {
        assert_eq!(split_service_params("gsm"), ("gsm", None));
        assert_eq!(split_service_params("gsm:"), ("gsm", None));
        assert_eq!(split_service_params("sensors:a:b"), ("sensors", Some("a:b")));
    }

    #[test]
    fn registry_enforces_limits() {
        let mut registry = QemudServiceRegistry::new();
        registry
            .register("echo", 1, Arc::new(EchoService::default()))
            .unwrap();
        assert_eq!(
            registry.register("echo", 0, Arc::new(EchoService::default())),
            Err(QemudError::ServiceExists("echo".to_owned()))
        );

        let transport = Arc::new(Recorder::default());
        let sink = QemudClientSink::new(transport.clone());
        let first = registry.connect("echo", None, sink.clone()).unwrap();
        assert_eq!(registry.active_clients("echo"), 1);
        assert_eq!(
            registry.connect("echo", None, sink.clone()).err(),
            Some(QemudError::ServiceBusy("echo".to_owned()))
        );
        first.close();
        assert_eq!(registry.active_clients("echo"), 0);

        assert_eq!(
            registry.connect("echo", Some("refuse"), sink.clone()).err(),
            Some(QemudError::Refused("echo".to_owned()))
        );
        assert_eq!(registry.active_clients("echo"), 0);
        assert_eq!(
            registry.connect("gps", None, sink).err(),
            Some(QemudError::UnknownService("gps".to_owned()))
        );
    }

    #[test]
    fn framed_delivery() {
        let service = Arc::new(EchoService::default());
        let log = service.log.clone();
        let mut registry = QemudServiceRegistry::new();
        registry.register("echo", 0, service).unwrap();

        let transport = Arc::new(Recorder::default());
        let mut conn = registry
            .connect("echo", Some("framed"), QemudClientSink::new(transport.clone()))
            .unwrap();
        assert_eq!(conn.params(), Some("framed"));
        conn.deliver(b"0003ab").unwrap();
        conn.deliver(b"c0001z").unwrap();
        assert_eq!(
            *log.received.lock(),
            vec![b"abc".to_vec(), b"z".to_vec()]
        );
        assert_eq!(
            *transport.sent.lock(),
            vec![b"0008echo:abc".to_vec(), b"0006echo:z".to_vec()]
        );
        assert_eq!(conn.deliver(b"zz00"), Err(QemudError::BadHeader(b"zz00".to_vec())));
        assert_eq!(
            conn.deliver(b"0001yzz00"),
            Err(QemudError::BadHeader(b"zz00".to_vec()))
        );
        assert_eq!(log.received.lock().last(), Some(&b"y".to_vec()));
    }
}
