// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;
use std::sync::Arc;

use devices::goldfish::pipe::HwPipeHandle;
use devices::goldfish::pipe::PipeCommand;
use devices::goldfish::pipe::PipeError;
use devices::goldfish::pipe::PipeInstance;
use devices::goldfish::pipe::PipeResult;
use devices::goldfish::pipe::PipeService;
use devices::goldfish::pipe::PIPE_POLL_OUT;
use devices::goldfish::pipe::PIPE_REG_ADDRESS;
use devices::goldfish::pipe::PIPE_REG_ADDRESS_HIGH;
use devices::goldfish::pipe::PIPE_REG_CHANNEL;
use devices::goldfish::pipe::PIPE_REG_CHANNEL_HIGH;
use devices::goldfish::pipe::PIPE_REG_COMMAND;
use devices::goldfish::pipe::PIPE_REG_SIZE;
use devices::goldfish::pipe::PIPE_REG_STATUS;
use devices::goldfish::pipe::PIPE_REG_VERSION;
use devices::goldfish::qemud::QemudClient;
use devices::goldfish::qemud::QemudClientSink;
use devices::goldfish::qemud::QemudService;
use devices::Bus;
use devices::IrqLevelState;
use goldfish::build_platform;
use goldfish::config::ConfigError;
use goldfish::config::DEFAULT_PIPE_MMIO_BASE;
use goldfish::GoldfishConfig;
use goldfish::HostServices;
use tempfile::NamedTempFile;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;

const BUF: u64 = 0x1000;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn memory() -> GuestMemory {
    GuestMemory::new(&[(GuestAddress(0), 0x10000)]).unwrap()
}

/// Guest-side register access through the bus.
struct Guest<'a> {
    bus: &'a Bus,
    base: u64,
}

impl Guest<'_> {
    fn write_reg(&self, offset: u64, value: u32) {
        assert!(self.bus.write(self.base + offset, &value.to_le_bytes()));
    }

    fn read_reg(&self, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        assert!(self.bus.read(self.base + offset, &mut data));
        u32::from_le_bytes(data)
    }

    fn command(&self, cmd: PipeCommand, channel: u64, size: usize) -> i32 {
        self.write_reg(PIPE_REG_CHANNEL, channel as u32);
        self.write_reg(PIPE_REG_CHANNEL_HIGH, (channel >> 32) as u32);
        self.write_reg(PIPE_REG_ADDRESS, BUF as u32);
        self.write_reg(PIPE_REG_ADDRESS_HIGH, 0);
        self.write_reg(PIPE_REG_SIZE, size as u32);
        self.write_reg(PIPE_REG_COMMAND, cmd as u32);
        self.read_reg(PIPE_REG_STATUS) as i32
    }
}

struct Greeter;

struct GreeterClient {
    sink: QemudClientSink,
}

impl QemudClient for GreeterClient {
    fn recv(&mut self, msg: &[u8]) {
        let mut reply = b"hello ".to_vec();
        reply.extend_from_slice(msg);
        self.sink.send(&reply);
    }
}

impl QemudService for Greeter {
    fn connect(
        &self,
        _params: Option<&str>,
        sink: QemudClientSink,
    ) -> Option<Box<dyn QemudClient>> {
        Some(Box::new(GreeterClient { sink }))
    }
}

struct Blackhole;

struct BlackholePipe;

impl PipeInstance for BlackholePipe {
    fn send_buffers(&mut self, buffers: &[&[u8]]) -> PipeResult<usize> {
        Ok(buffers.iter().map(|b| b.len()).sum())
    }

    fn recv_buffers(&mut self, _buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        Err(PipeError::Again)
    }

    fn poll(&self) -> u32 {
        PIPE_POLL_OUT
    }
}

impl PipeService for Blackhole {
    fn init(&self, _hwpipe: HwPipeHandle, _args: Option<&str>) -> Option<Box<dyn PipeInstance>> {
        Some(Box::new(BlackholePipe))
    }
}

#[test]
fn load_config_file() {
    let file = config_file(
        r#"{
            "pipe": { "mmio_base": 4278321152, "enable_debug_services": true },
            "qemud": { "enabled": false },
            "log": { "level": "debug" }
        }"#,
    );
    let cfg = GoldfishConfig::from_file(file.path()).unwrap();
    assert_eq!(cfg.pipe.mmio_base, 0xff02_0000);
    assert!(cfg.pipe.enable_debug_services);
    assert!(cfg.pipe.guest_64bit);
    assert!(!cfg.qemud.enabled);
}

#[test]
fn config_file_errors() {
    let missing = tempfile::tempdir().unwrap().path().join("missing.json");
    assert!(matches!(
        GoldfishConfig::from_file(&missing),
        Err(ConfigError::Open { .. })
    ));

    let file = config_file(r#"{ "pipe": { "mmio_bse": 0 } }"#);
    assert!(matches!(
        GoldfishConfig::from_file(file.path()),
        Err(ConfigError::Parse { .. })
    ));

    let file = config_file(r#"{ "pipe": { "mmio_base": 4096, "snapshot_version": 7 } }"#);
    assert!(matches!(
        GoldfishConfig::from_file(file.path()),
        Err(ConfigError::UnknownSnapshotVersion(7))
    ));
}

#[test]
fn qemud_service_over_pipe() {
    let cfg = GoldfishConfig::default();
    let mut services = HostServices::new();
    services.add_qemud_service("greeter", 0, Arc::new(Greeter));
    let platform = build_platform(&cfg, memory(), Box::new(IrqLevelState::new()), services).unwrap();
    assert!(platform.qemud.is_some());

    let guest = Guest {
        bus: &platform.bus,
        base: DEFAULT_PIPE_MMIO_BASE,
    };
    guest.read_reg(PIPE_REG_VERSION);
    let mem = platform.pipe.lock().memory().clone();

    assert_eq!(guest.command(PipeCommand::Open, 1, 0), 0);
    mem.write_all_at_addr(b"pipe:qemud:greeter\0", GuestAddress(BUF))
        .unwrap();
    assert_eq!(guest.command(PipeCommand::WriteBuffer, 1, 19), 19);

    mem.write_all_at_addr(b"0003bob", GuestAddress(BUF)).unwrap();
    assert_eq!(guest.command(PipeCommand::WriteBuffer, 1, 7), 7);
    assert_eq!(guest.command(PipeCommand::ReadBuffer, 1, 64), 13);
    let mut reply = [0u8; 13];
    mem.read_exact_at_addr(&mut reply, GuestAddress(BUF)).unwrap();
    assert_eq!(&reply, b"0009hello bob");

    // Debug services are off by default.
    assert_eq!(guest.command(PipeCommand::Open, 2, 0), 0);
    mem.write_all_at_addr(b"pipe:zero\0", GuestAddress(BUF)).unwrap();
    assert_eq!(
        guest.command(PipeCommand::WriteBuffer, 2, 10),
        PipeError::Inval.status()
    );
}

#[test]
fn embedder_pipe_services() {
    let mut cfg = GoldfishConfig::default();
    cfg.qemud.enabled = false;
    let mut services = HostServices::new();
    services.add_pipe_service("blackhole", Arc::new(Blackhole));
    let platform = build_platform(&cfg, memory(), Box::new(IrqLevelState::new()), services).unwrap();
    assert!(platform.qemud.is_none());

    let pipe = platform.pipe.lock();
    assert_eq!(pipe.registry().names().collect::<Vec<_>>(), vec!["blackhole"]);
}

#[test]
fn registration_failures_abort_the_build() {
    let mut services = HostServices::new();
    services.add_qemud_service("greeter", 0, Arc::new(Greeter));
    services.add_qemud_service("greeter", 0, Arc::new(Greeter));
    assert!(build_platform(
        &GoldfishConfig::default(),
        memory(),
        Box::new(IrqLevelState::new()),
        services,
    )
    .is_err());

    let mut services = HostServices::new();
    for i in 0..16 {
        services.add_pipe_service(&format!("svc{}", i), Arc::new(Blackhole));
    }
    // Together with "qemud" this is one more than the registry holds.
    assert!(build_platform(
        &GoldfishConfig::default(),
        memory(),
        Box::new(IrqLevelState::new()),
        services,
    )
    .is_err());
}
