//! Typed request helpers over the codec and transport layers.
//!
//! Everything that actually talks to a probe goes through [`ProbeClient`]:
//! discovery and the poller refresh the registry with it, the sequencer
//! samples through it, and the solver's results are written back with it.

use crate::config::SerialSettings;
use crate::device::{CalConstants, PollUpdate, Probe, ProbeSnapshot};
use crate::error::{CalError, TransportError};
use crate::protocol::command::{CONSTANT_BANK, CONSTANT_LEN};
use crate::protocol::{codec, registers, Command};
use crate::transport::{PortHandle, TransportRegistry};
use log::{debug, warn};
use std::sync::Arc;

/// Outcome of one register write. Failures are per-register; one failed
/// register never blocks the others.
#[derive(Debug)]
pub struct RegisterWrite {
    pub register: u16,
    pub value: f64,
    pub result: Result<(), CalError>,
}

/// Client for one transport registry. Cheap to clone.
#[derive(Clone)]
pub struct ProbeClient {
    transport: Arc<TransportRegistry>,
    serial: SerialSettings,
}

impl ProbeClient {
    pub fn new(transport: Arc<TransportRegistry>, serial: SerialSettings) -> Self {
        Self { transport, serial }
    }

    async fn handle_for(&self, probe: &Probe) -> Result<PortHandle, TransportError> {
        self.transport
            .handle(&probe.port)
            .await
            .ok_or_else(|| TransportError::PortUnavailable(probe.port.clone()))
    }

    /// Read the probe's current values (temperature, humidity, identity).
    pub async fn read_values(&self, probe: &Probe) -> Result<ProbeSnapshot, CalError> {
        let handle = self.handle_for(probe).await?;
        let cmd = Command::read_values(
            probe.snapshot.device_type,
            &probe.snapshot.address,
            self.serial.poll_timeout(),
        );
        let reply = handle.exchange(&cmd).await?;
        Ok(codec::decode_probe_identity_frame(&reply)?)
    }

    /// Read the probe's raw counts and correction chain.
    pub async fn read_raw(&self, probe: &Probe) -> Result<PollUpdate, CalError> {
        let handle = self.handle_for(probe).await?;
        let cmd = Command::self_test(
            probe.snapshot.device_type,
            &probe.snapshot.address,
            self.serial.poll_timeout(),
        );
        let reply = handle.exchange(&cmd).await?;
        Ok(codec::decode_poll_frame(&reply)?)
    }

    /// Read the five stored calibration constants from register memory.
    pub async fn read_constants(&self, probe: &Probe) -> Result<CalConstants, CalError> {
        Ok(CalConstants {
            pt100_a: self.read_register(probe, registers::PT100_A).await?,
            pt100_b: self.read_register(probe, registers::PT100_B).await?,
            pt100_c: self.read_register(probe, registers::PT100_C).await?,
            adc_offset: self.read_register(probe, registers::ADC_OFFSET).await?,
            conversion_factor: self.read_register(probe, registers::ADC_FACTOR).await?,
        })
    }

    async fn read_register(&self, probe: &Probe, register: u16) -> Result<f64, CalError> {
        let handle = self.handle_for(probe).await?;
        let cmd = Command::register_read(
            probe.snapshot.device_type,
            &probe.snapshot.address,
            CONSTANT_BANK,
            register,
            CONSTANT_LEN,
            self.serial.register_timeout(),
        );
        let reply = handle.exchange(&cmd).await?;
        let value = codec::decode_float_from_decimal_bytes(&reply)?;
        debug!("[{}] register {register} = {value}", probe.port);
        Ok(value)
    }

    /// Write new constants, one register per value, attempting every
    /// register even after a failure.
    pub async fn write_coefficients(
        &self,
        probe: &Probe,
        values: &[(u16, f64)],
    ) -> Vec<RegisterWrite> {
        let mut outcomes = Vec::with_capacity(values.len());
        for &(register, value) in values {
            let result = self.write_register(probe, register, value).await;
            if let Err(e) = &result {
                warn!(
                    "[{}] write of register {register} failed: {e}",
                    probe.port
                );
            }
            outcomes.push(RegisterWrite {
                register,
                value,
                result,
            });
        }
        outcomes
    }

    async fn write_register(
        &self,
        probe: &Probe,
        register: u16,
        value: f64,
    ) -> Result<(), CalError> {
        let handle = self.handle_for(probe).await?;
        let cmd = Command::register_write(
            probe.snapshot.device_type,
            &probe.snapshot.address,
            CONSTANT_BANK,
            register,
            value,
            self.serial.register_timeout(),
        );
        handle.exchange(&cmd).await?;
        Ok(())
    }

    /// Persist a humidity test point on the probe against the reference
    /// instrument's current reading.
    pub async fn save_test_point(
        &self,
        probe: &Probe,
        reference_humidity: f64,
    ) -> Result<(), CalError> {
        let handle = self.handle_for(probe).await?;
        let cmd = Command::save_test_point(
            probe.snapshot.device_type,
            &probe.snapshot.address,
            reference_humidity,
            self.serial.register_timeout(),
        );
        handle.exchange(&cmd).await?;
        Ok(())
    }
}
