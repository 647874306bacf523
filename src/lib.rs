// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Assembles the goldfish pipe device, its host services and the qemud multiplexer into a bus
//! ready to be attached to a VM.

pub mod config;

use std::sync::Arc;

use anyhow::Context;
use base::debug;
use base::info;
use devices::goldfish::pipe::services::register_debug_services;
use devices::goldfish::pipe::GuestBufferMapper;
use devices::goldfish::pipe::PipeDevice;
use devices::goldfish::pipe::PipeService;
use devices::goldfish::pipe::PipeServiceRegistry;
use devices::goldfish::pipe::PIPE_MMIO_SIZE;
use devices::goldfish::qemud::QemudMultiplexer;
use devices::goldfish::qemud::QemudPipeService;
use devices::goldfish::qemud::QemudService;
use devices::goldfish::qemud::QemudServiceRegistry;
use devices::Bus;
use devices::IrqLine;
use sync::Mutex;
use vm_memory::GuestMemory;

pub use crate::config::GoldfishConfig;

/// Name of the pipe service bridging to qemud services.
pub const QEMUD_PIPE_SERVICE: &str = "qemud";

/// Host services an embedder provides on top of the built-in ones.
#[derive(Default)]
pub struct HostServices {
    pipe: Vec<(String, Arc<dyn PipeService>)>,
    qemud: Vec<(String, usize, Arc<dyn QemudService>)>,
}

impl HostServices {
    pub fn new() -> HostServices {
        Default::default()
    }

    pub fn add_pipe_service(&mut self, name: &str, service: Arc<dyn PipeService>) -> &mut Self {
        self.pipe.push((name.to_owned(), service));
        self
    }

    /// Adds a qemud service accepting at most `max_clients` clients, or any number if zero.
    pub fn add_qemud_service(
        &mut self,
        name: &str,
        max_clients: usize,
        service: Arc<dyn QemudService>,
    ) -> &mut Self {
        self.qemud.push((name.to_owned(), max_clients, service));
        self
    }
}

/// Everything the VM needs to talk to goldfish host services.
pub struct GoldfishPlatform {
    pub bus: Bus,
    pub pipe: Arc<Mutex<PipeDevice>>,
    /// Host end of the qemud serial line, when qemud is enabled.
    pub qemud: Option<QemudMultiplexer>,
}

/// Installs the logger described by the `log` section of `cfg`.
pub fn init_logging(cfg: &GoldfishConfig) -> anyhow::Result<()> {
    base::syslog::init_with(cfg.log.clone()).context("failed to initialize logging")
}

/// Registers every service and places the pipe device on a new bus.
///
/// Registration errors are configuration mistakes and fail the whole build.
pub fn build_platform(
    cfg: &GoldfishConfig,
    mem: GuestMemory,
    irq: Box<dyn IrqLine>,
    services: HostServices,
) -> anyhow::Result<GoldfishPlatform> {
    cfg.validate().context("invalid goldfish configuration")?;

    let mut qemud_registry = QemudServiceRegistry::new();
    for (name, max_clients, service) in services.qemud {
        qemud_registry
            .register(&name, max_clients, service)
            .with_context(|| format!("failed to register qemud service {}", name))?;
    }
    let qemud_registry = Arc::new(qemud_registry);

    let mut registry = PipeServiceRegistry::new();
    if cfg.pipe.enable_debug_services {
        register_debug_services(&mut registry).context("failed to register debug services")?;
    }
    if cfg.qemud.enabled {
        registry
            .register(
                QEMUD_PIPE_SERVICE,
                Arc::new(QemudPipeService::new(qemud_registry.clone())),
            )
            .context("failed to register the qemud pipe service")?;
    }
    for (name, service) in services.pipe {
        registry
            .register(&name, service)
            .with_context(|| format!("failed to register pipe service {}", name))?;
    }
    debug!(
        "goldfish: pipe services {:?}, qemud services {:?}",
        registry.names().collect::<Vec<_>>(),
        qemud_registry
    );

    let device = PipeDevice::new(
        Arc::new(registry),
        GuestBufferMapper::new(mem),
        irq,
        cfg.pipe.guest_64bit,
    );
    let pipe = Arc::new(Mutex::new(device));
    let bus = Bus::new();
    bus.insert(pipe.clone(), cfg.pipe.mmio_base, PIPE_MMIO_SIZE)
        .context("failed to place the goldfish pipe on the bus")?;
    info!(
        "goldfish: pipe device at {:#x}+{:#x}",
        cfg.pipe.mmio_base, PIPE_MMIO_SIZE
    );

    let qemud = cfg
        .qemud
        .enabled
        .then(|| QemudMultiplexer::new(qemud_registry));
    Ok(GoldfishPlatform { bus, pipe, qemud })
}
