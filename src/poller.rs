//! Discovery and background polling of the probe table.
//!
//! Discovery runs once while the table is empty: every enumerated port
//! gets the broadcast values query, a decodable reply keeps the port open
//! and installs the probe, anything else closes the port again. Known
//! probes are then re-polled on a fixed period; cycles run to completion
//! before the next tick fires, so they never overlap. Failures are
//! localized to the offending port and logged; the loop itself never
//! aborts.

use crate::client::ProbeClient;
use crate::config::Settings;
use crate::device::{PollUpdate, Probe};
use crate::error::TransportError;
use crate::protocol::{codec, Command, BROADCAST_ADDRESS, DEVICE_TYPE_PROBE};
use crate::registry::DeviceRegistry;
use crate::transport::{self, PortHandle, TransportRegistry};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Enumerates candidate ports and opens them. The seam that lets tests run
/// the full discovery path against scripted ports.
#[async_trait]
pub trait PortScanner: Send + Sync {
    fn scan(&self) -> Vec<String>;

    async fn open(
        &self,
        transport: &TransportRegistry,
        name: &str,
    ) -> Result<PortHandle, TransportError>;
}

/// Scanner over the host's real serial ports.
pub struct SystemPortScanner {
    baud_rate: u32,
}

impl SystemPortScanner {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

#[async_trait]
impl PortScanner for SystemPortScanner {
    fn scan(&self) -> Vec<String> {
        transport::available_port_names()
    }

    async fn open(
        &self,
        transport: &TransportRegistry,
        name: &str,
    ) -> Result<PortHandle, TransportError> {
        transport.open_or_reuse(name, self.baud_rate).await
    }
}

/// Updates emitted by the poller for the presentation layer to render.
#[derive(Debug, Clone)]
pub enum PollEvent {
    ProbeDiscovered(Probe),
    ProbeUpdated { port: String, update: PollUpdate },
    ProbeSkipped { port: String, reason: String },
    CycleComplete { updated: usize },
}

/// Owns the discover/poll cycle over one transport and device registry.
pub struct Poller {
    transport: Arc<TransportRegistry>,
    registry: Arc<DeviceRegistry>,
    client: ProbeClient,
    scanner: Box<dyn PortScanner>,
    settings: Settings,
    events: Option<mpsc::UnboundedSender<PollEvent>>,
}

impl Poller {
    pub fn new(
        transport: Arc<TransportRegistry>,
        registry: Arc<DeviceRegistry>,
        scanner: Box<dyn PortScanner>,
        settings: Settings,
    ) -> Self {
        let client = ProbeClient::new(transport.clone(), settings.serial.clone());
        Self {
            transport,
            registry,
            client,
            scanner,
            settings,
            events: None,
        }
    }

    /// Subscribe to poll events. Call before spawning the loop.
    pub fn event_stream(&mut self) -> mpsc::UnboundedReceiver<PollEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    fn emit(&self, event: PollEvent) {
        if let Some(tx) = &self.events {
            // The receiver side going away only means nobody is rendering.
            let _ = tx.send(event);
        }
    }

    /// Probe every enumerated port and install responders in the registry.
    ///
    /// Idempotent: ports already tracked as open are skipped, so a second
    /// pass with no new hardware changes nothing.
    pub async fn discover(&self) -> Vec<Probe> {
        let mut found = Vec::new();

        for name in self.scanner.scan() {
            if self.transport.is_open(&name).await {
                debug!("discovery: '{name}' already tracked, skipping");
                continue;
            }

            let handle = match self.scanner.open(&self.transport, &name).await {
                Ok(handle) => handle,
                Err(e) => {
                    debug!("discovery: cannot open '{name}': {e}");
                    continue;
                }
            };

            let cmd = Command::read_values(
                DEVICE_TYPE_PROBE,
                BROADCAST_ADDRESS,
                self.settings.serial.discovery_timeout(),
            );

            let reply = match handle.exchange(&cmd).await {
                Ok(reply) => reply,
                Err(e) => {
                    debug!("discovery: no device on '{name}': {e}");
                    self.transport.close(&name).await;
                    continue;
                }
            };

            match codec::decode_probe_identity_frame(&reply) {
                Ok(snapshot) => {
                    info!(
                        "discovered probe '{}' (address {}) on '{name}'",
                        snapshot.device_name, snapshot.address
                    );
                    self.registry.upsert_snapshot(&name, snapshot).await;
                    self.backfill_constants(&name).await;
                    if let Some(probe) = self.registry.probe(&name).await {
                        self.emit(PollEvent::ProbeDiscovered(probe.clone()));
                        found.push(probe);
                    }
                }
                Err(e) => {
                    warn!("discovery: undecodable reply on '{name}': {e}");
                    self.transport.close(&name).await;
                }
            }
        }

        found
    }

    /// One-time read of the probe's five stored constants after discovery.
    /// A failed read is logged and left for the next rediscovery; it does
    /// not remove the probe.
    async fn backfill_constants(&self, port: &str) {
        let Some(probe) = self.registry.probe(port).await else {
            return;
        };
        if probe.constants.is_some() {
            return;
        }
        match self.client.read_constants(&probe).await {
            Ok(constants) => {
                debug!(
                    "[{port}] constants: A={} B={} C={} offset={} factor={}",
                    constants.pt100_a,
                    constants.pt100_b,
                    constants.pt100_c,
                    constants.adc_offset,
                    constants.conversion_factor
                );
                self.registry.set_constants(port, constants).await;
            }
            Err(e) => warn!("[{port}] constant backfill failed: {e}"),
        }
    }

    /// Re-poll every known probe once. A probe whose port is missing or
    /// whose exchange fails is skipped, not fatal to the batch.
    pub async fn poll(&self) -> usize {
        let mut updated = 0;

        for probe in self.registry.snapshot().await {
            match self.client.read_raw(&probe).await {
                Ok(update) => {
                    self.registry.apply_poll(&probe.port, update).await;
                    self.emit(PollEvent::ProbeUpdated {
                        port: probe.port.clone(),
                        update,
                    });
                    updated += 1;
                }
                Err(e) => {
                    warn!("poll: skipping '{}': {e}", probe.port);
                    self.emit(PollEvent::ProbeSkipped {
                        port: probe.port.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.emit(PollEvent::CycleComplete { updated });
        updated
    }

    /// Run discovery-then-poll on the configured period until the shutdown
    /// sender fires. Each cycle runs to completion before the next tick is
    /// considered, so cycles never overlap even when one overruns the
    /// period.
    pub fn spawn(self) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = self.settings.polling.period();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("poller shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        if self.registry.is_empty().await {
                            self.discover().await;
                        }
                        self.poll().await;
                    }
                }
            }
        });

        (handle, shutdown_tx)
    }
}
