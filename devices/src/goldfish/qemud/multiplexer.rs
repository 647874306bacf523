// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::debug;
use base::warn;
use sync::Mutex;

use super::client::parse_hex;
use super::serial::encode_frames;
use super::split_service_params;
use super::QemudClientSink;
use super::QemudConnection;
use super::QemudError;
use super::QemudServiceRegistry;
use super::QemudTransport;
use super::SerialParser;
use super::CONTROL_CHANNEL;

/// Bytes queued for the guest and channels closed by their host side.
#[derive(Default)]
struct SerialLine {
    output: Vec<u8>,
    host_closed: Vec<u8>,
}

/// Routes one client's messages onto the serial line.
///
/// Becomes inert once the multiplexer drops the client, so a stale sink cannot write into a
/// channel id that has since been reused.
struct ChannelTransport {
    channel: u8,
    live: AtomicBool,
    line: Arc<Mutex<SerialLine>>,
}

impl QemudTransport for ChannelTransport {
    fn send(&self, msg: &[u8]) {
        if self.live.load(Ordering::Acquire) {
            self.line
                .lock()
                .output
                .extend_from_slice(&encode_frames(self.channel, msg));
        }
    }

    fn close(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            self.line.lock().host_closed.push(self.channel);
        }
    }
}

struct MuxClient {
    transport: Arc<ChannelTransport>,
    conn: QemudConnection,
}

/// The host end of the qemud serial line.
pub struct QemudMultiplexer {
    registry: Arc<QemudServiceRegistry>,
    line: Arc<Mutex<SerialLine>>,
    parser: SerialParser,
    clients: BTreeMap<u8, MuxClient>,
}

fn connect_failure_reason(e: &QemudError) -> &'static str {
    match e {
        QemudError::UnknownService(_) => "unknown service",
        QemudError::ServiceBusy(_) => "service busy",
        QemudError::Refused(_) => "connection refused",
        _ => "internal error",
    }
}

impl QemudMultiplexer {
    pub fn new(registry: Arc<QemudServiceRegistry>) -> QemudMultiplexer {
        QemudMultiplexer {
            registry,
            line: Arc::new(Mutex::new(SerialLine::default())),
            parser: SerialParser::new(),
            clients: BTreeMap::new(),
        }
    }

    pub fn has_client(&self, channel: u8) -> bool {
        self.clients.contains_key(&channel)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Feeds bytes the guest wrote to the serial line.
    pub fn receive(&mut self, data: &[u8]) {
        for frame in self.parser.push(data) {
            if frame.channel == CONTROL_CHANNEL {
                self.handle_control(&frame.payload);
                continue;
            }
            let Some(client) = self.clients.get_mut(&frame.channel) else {
                warn!("qemud: message for unknown channel {:02x}", frame.channel);
                continue;
            };
            if let Err(e) = client.conn.deliver(&frame.payload) {
                warn!("qemud: channel {:02x}: {}", frame.channel, e);
            }
        }
        self.reap_host_closed();
    }

    /// Takes the bytes waiting to be sent to the guest.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.reap_host_closed();
        std::mem::take(&mut self.line.lock().output)
    }

    fn send_control(&self, msg: &str) {
        self.line
            .lock()
            .output
            .extend_from_slice(&encode_frames(CONTROL_CHANNEL, msg.as_bytes()));
    }

    fn handle_control(&mut self, msg: &[u8]) {
        let Ok(msg) = std::str::from_utf8(msg) else {
            warn!("qemud: control message is not text");
            return;
        };
        if let Some(rest) = msg.strip_prefix("connect:") {
            self.connect(rest);
        } else if let Some(id) = msg.strip_prefix("disconnect:") {
            self.disconnect(id);
        } else {
            warn!("qemud: unknown control message {:?}", msg);
        }
    }

    fn connect(&mut self, request: &str) {
        let Some((service, id)) = request.rsplit_once(':') else {
            warn!("qemud: malformed connect request {:?}", request);
            return;
        };
        let parsed = if id.len() == 2 {
            parse_hex(id.as_bytes())
        } else {
            None
        };
        let channel = match parsed {
            Some(channel) if channel != CONTROL_CHANNEL as usize => channel as u8,
            _ => {
                self.send_control(&format!("ko:connect:{}:bad channel number", id));
                return;
            }
        };
        if self.clients.contains_key(&channel) {
            self.send_control(&format!("ko:connect:{}:duplicate channel number", id));
            return;
        }

        let (name, params) = split_service_params(service);
        let transport = Arc::new(ChannelTransport {
            channel,
            live: AtomicBool::new(true),
            line: self.line.clone(),
        });
        let sink = QemudClientSink::new(transport.clone());
        match self.registry.connect(name, params, sink) {
            Ok(conn) => {
                debug!("qemud: channel {:02x} connected to {}", channel, name);
                self.clients.insert(channel, MuxClient { transport, conn });
                self.send_control(&format!("ok:connect:{}", id));
            }
            Err(e) => {
                warn!("qemud: cannot connect channel {:02x}: {}", channel, e);
                transport.live.store(false, Ordering::Release);
                self.send_control(&format!(
                    "ko:connect:{}:{}",
                    id,
                    connect_failure_reason(&e)
                ));
            }
        }
    }

    fn disconnect(&mut self, id: &str) {
        let Some(channel) = parse_hex(id.as_bytes()).filter(|&c| c <= u8::MAX as usize) else {
            warn!("qemud: malformed disconnect {:?}", id);
            return;
        };
        match self.clients.remove(&(channel as u8)) {
            Some(client) => {
                debug!("qemud: guest closed channel {:02x}", channel);
                client.transport.live.store(false, Ordering::Release);
                client.conn.close();
            }
            None => warn!("qemud: disconnect of unknown channel {:02x}", channel),
        }
    }

    /// Drops clients whose host side closed and tells the guest about them.
    fn reap_host_closed(&mut self) {
        let closed = std::mem::take(&mut self.line.lock().host_closed);
        for channel in closed {
            if let Some(client) = self.clients.remove(&channel) {
                debug!("qemud: host closed channel {:02x}", channel);
                client.conn.close();
                self.send_control(&format!("disconnect:{:02x}", channel));
            }
        }
    }
}

impl Drop for QemudMultiplexer {
    fn drop(&mut self) {
        for (_, client) in std::mem::take(&mut self.clients) {
            client.transport.live.store(false, Ordering::Release);
            client.conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goldfish::qemud::serial::SerialFrame;
    use crate::goldfish::qemud::testing::ClientLog;
    use crate::goldfish::qemud::testing::EchoService;

    fn mux(max_clients: usize) -> (QemudMultiplexer, ClientLog) {
        let service = EchoService::default();
        let log = service.log.clone();
        let mut registry = QemudServiceRegistry::new();
        registry
            .register("echo", max_clients, Arc::new(service))
            .unwrap();
        (QemudMultiplexer::new(Arc::new(registry)), log)
    }

    fn output_frames(mux: &mut QemudMultiplexer) -> Vec<SerialFrame> {
        SerialParser::new().push(&mux.take_output())
    }

    fn frame(channel: u8, payload: &[u8]) -> SerialFrame {
        SerialFrame {
            channel,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn connect_send_disconnect() {
        let (mut mux, log) = mux(0);
        mux.receive(&encode_frames(0, b"connect:echo:0a"));
        assert!(mux.has_client(0x0a));
        assert_eq!(output_frames(&mut mux), vec![frame(0, b"ok:connect:0a")]);

        mux.receive(&encode_frames(0x0a, b"hello"));
        assert_eq!(output_frames(&mut mux), vec![frame(0x0a, b"echo:hello")]);
        assert_eq!(*log.received.lock(), vec![b"hello".to_vec()]);

        mux.receive(&encode_frames(0, b"disconnect:0a"));
        assert!(!mux.has_client(0x0a));
        assert_eq!(*log.closed.lock(), 1);
        mux.receive(&encode_frames(0x0a, b"late"));
        assert!(output_frames(&mut mux).is_empty());
    }

    #[test]
    fn connect_failures() {
        let (mut mux, _) = mux(1);
        mux.receive(&encode_frames(0, b"connect:gps:05"));
        mux.receive(&encode_frames(0, b"connect:echo:zz"));
        mux.receive(&encode_frames(0, b"connect:echo:00"));
        mux.receive(&encode_frames(0, b"connect:echo:refuse:07"));
        mux.receive(&encode_frames(0, b"connect:echo:06"));
        mux.receive(&encode_frames(0, b"connect:echo:06"));
        mux.receive(&encode_frames(0, b"connect:echo:08"));
        assert_eq!(
            output_frames(&mut mux),
            vec![
                frame(0, b"ko:connect:05:unknown service"),
                frame(0, b"ko:connect:zz:bad channel number"),
                frame(0, b"ko:connect:00:bad channel number"),
                frame(0, b"ko:connect:07:connection refused"),
                frame(0, b"ok:connect:06"),
                frame(0, b"ko:connect:06:duplicate channel number"),
                frame(0, b"ko:connect:08:service busy"),
            ]
        );
        assert_eq!(mux.client_count(), 1);
    }

    #[test]
    fn overlong_channel_ids_are_rejected() {
        let (mut mux, _) = mux(0);
        mux.receive(&encode_frames(0, b"connect:echo:03"));
        mux.receive(&encode_frames(0, b"connect:echo:fffffffffffffffffffff"));
        mux.receive(&encode_frames(0, b"connect:echo:003"));
        mux.receive(&encode_frames(0, b"disconnect:fffffffffffffffffffff"));
        mux.receive(&encode_frames(0, b"disconnect:fffffffffffffffffff03"));
        assert_eq!(
            output_frames(&mut mux),
            vec![
                frame(0, b"ok:connect:03"),
                frame(0, b"ko:connect:fffffffffffffffffffff:bad channel number"),
                frame(0, b"ko:connect:003:bad channel number"),
            ]
        );
        assert!(mux.has_client(3));
    }

    #[test]
    fn host_close_notifies_guest() {
        let (mut mux, log) = mux(0);
        mux.receive(&encode_frames(0, b"connect:echo:03"));
        mux.take_output();

        let sink = log.sinks.lock()[0].clone();
        sink.close();
        sink.close();
        assert_eq!(
            output_frames(&mut mux),
            vec![frame(0, b"disconnect:03")]
        );
        assert!(!mux.has_client(3));
        sink.send(b"ignored");
        assert!(mux.take_output().is_empty());
    }

    #[test]
    fn framed_client_over_serial() {
        let (mut mux, log) = mux(0);
        mux.receive(&encode_frames(0, b"connect:echo:framed:04"));
        mux.take_output();

        mux.receive(&encode_frames(4, b"0002h"));
        mux.receive(&encode_frames(4, b"i"));
        assert_eq!(*log.received.lock(), vec![b"hi".to_vec()]);
        assert_eq!(output_frames(&mut mux), vec![frame(4, b"0007echo:hi")]);
    }

    #[test]
    fn drop_closes_clients() {
        let (mut mux, log) = mux(0);
        mux.receive(&encode_frames(0, b"connect:echo:01"));
        mux.receive(&encode_frames(0, b"connect:echo:02"));
        drop(mux);
        assert_eq!(*log.closed.lock(), 2);
    }
}
