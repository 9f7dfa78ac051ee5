//! The calibration run state machine.
//!
//! One run walks an ordered step list over a fixed probe set and one
//! reference instrument:
//!
//! `AwaitManualSetpoint -> Soaking -> Sampling -> Evaluating -> (next |
//! Complete)`
//!
//! The operator drives the run through a command channel: `Proceed`
//! confirms the chamber is at the step's setpoint, `SkipSoak` cuts the
//! soak short (and nothing else), `Abort` cancels the whole run while
//! keeping the samples collected so far. Results stream out as
//! [`RunEvent`] values; the core renders nothing itself.
//!
//! During sampling each probe is measured by its own task; the tasks are
//! joined before the step advances. A probe that fails to answer produces
//! a FAIL row and the run continues with the others.

use crate::client::ProbeClient;
use crate::config::Settings;
use crate::device::{normalize_to_celsius, Mirror, Probe};
use crate::error::{CalError, ValidationError};
use crate::registry::DeviceRegistry;
use crate::sequence::step::{CalibrationStep, StepKind, Tolerance};
use crate::solver::FitPoint;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Setpoint handling mode. Only manual operation is implemented; an
/// automatic chamber interface is a hard precondition failure, never a
/// silent skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Manual,
    Automatic,
}

/// Operator commands accepted while a run is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    /// Chamber is at the setpoint; leave `AwaitManualSetpoint`.
    Proceed,
    /// Cut the current soak short. Ignored outside `Soaking`.
    SkipSoak,
    /// Cancel the run, keeping partially collected samples.
    Abort,
}

/// Handle the operator side holds to steer a run.
#[derive(Clone)]
pub struct RunControl(mpsc::UnboundedSender<RunCommand>);

impl RunControl {
    pub fn proceed(&self) {
        let _ = self.0.send(RunCommand::Proceed);
    }

    pub fn skip_soak(&self) {
        let _ = self.0.send(RunCommand::SkipSoak);
    }

    pub fn abort(&self) {
        let _ = self.0.send(RunCommand::Abort);
    }
}

/// Per-channel outcome of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
    /// Channel not scored for this step; never fails.
    NoEval,
}

/// One measurement instant for one probe within one step. Immutable once
/// recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub probe_port: String,
    pub probe_serial: String,
    pub step_index: usize,
    pub sample_index: u32,
    pub timestamp: DateTime<Utc>,
    pub reference_temperature: f64,
    /// Probe temperature normalized to Celsius.
    pub probe_temperature: f64,
    pub reference_humidity: f64,
    pub probe_humidity: f64,
    /// `reference - probe`.
    pub temperature_error: f64,
    pub humidity_error: f64,
    pub resistance: f64,
    pub adc_count: f64,
    pub temperature_verdict: Verdict,
    pub humidity_verdict: Verdict,
    /// True when the measurement itself failed; numeric fields are NaN.
    pub measurement_failed: bool,
}

/// Worst-case and average statistics for one channel over a step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    /// Error of the sample with the largest magnitude, reported signed.
    pub worst_error: f64,
    /// Arithmetic mean over valid (non-NaN) samples.
    pub average_error: f64,
    pub verdict: Verdict,
}

/// Aggregate for one probe over one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub probe_port: String,
    pub step_index: usize,
    pub kind: StepKind,
    pub temperature: ChannelSummary,
    pub humidity: ChannelSummary,
    pub valid_samples: usize,
}

/// Progress and results streamed to the presentation layer.
#[derive(Debug, Clone)]
pub enum RunEvent {
    StepStarted {
        step_index: usize,
        kind: StepKind,
    },
    SoakStarted {
        step_index: usize,
        total: Duration,
    },
    SoakTick {
        step_index: usize,
        remaining: Duration,
    },
    SoakSkipped {
        step_index: usize,
    },
    SampleRecorded(SampleRecord),
    StepEvaluated(StepSummary),
    TestPointSaved {
        probe_port: String,
        step_index: usize,
    },
    TestPointFailed {
        probe_port: String,
        step_index: usize,
        reason: String,
    },
    Aborted,
    Complete,
}

/// Everything a completed (or aborted) run produced.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub aborted: bool,
    pub samples: Vec<SampleRecord>,
    pub summaries: Vec<StepSummary>,
    /// Per-step averaged fit points per probe port, solver-ready.
    pub fit_points: HashMap<String, Vec<FitPoint>>,
}

/// Evaluate one channel reading against the step's tolerance band around
/// the reference.
pub fn evaluate_channel(
    scored: bool,
    tolerance: Option<Tolerance>,
    reference: f64,
    reading: f64,
) -> Verdict {
    match (scored, tolerance) {
        (true, Some(tolerance)) => {
            let (low, high) = tolerance.bounds(reference);
            if reading >= low && reading <= high {
                Verdict::Pass
            } else {
                Verdict::Fail
            }
        }
        _ => Verdict::NoEval,
    }
}

/// Worst-case (max |error|, signed) and mean over non-NaN errors.
fn summarize_errors(errors: &[f64]) -> (f64, f64) {
    let valid: Vec<f64> = errors.iter().copied().filter(|e| !e.is_nan()).collect();
    if valid.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let worst = valid
        .iter()
        .copied()
        .fold(0.0f64, |acc, e| if e.abs() > acc.abs() { e } else { acc });
    let average = valid.iter().sum::<f64>() / valid.len() as f64;
    (worst, average)
}

/// A single calibration run. Consumed by [`CalibrationRun::run`].
pub struct CalibrationRun {
    registry: Arc<DeviceRegistry>,
    client: ProbeClient,
    settings: Settings,
    steps: Vec<CalibrationStep>,
    probe_ports: Vec<String>,
    mode: RunMode,
    events: mpsc::UnboundedSender<RunEvent>,
    control: mpsc::UnboundedReceiver<RunCommand>,
    outcome: RunOutcome,
}

impl CalibrationRun {
    /// Build a run over an explicit probe selection. Returns the run, the
    /// operator control handle, and the event stream.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        client: ProbeClient,
        settings: Settings,
        steps: Vec<CalibrationStep>,
        probe_ports: Vec<String>,
        mode: RunMode,
    ) -> (Self, RunControl, mpsc::UnboundedReceiver<RunEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                client,
                settings,
                steps,
                probe_ports,
                mode,
                events: event_tx,
                control: control_rx,
                outcome: RunOutcome::default(),
            },
            RunControl(control_tx),
            event_rx,
        )
    }

    fn emit(&self, event: RunEvent) {
        // A closed receiver only means nobody is watching.
        let _ = self.events.send(event);
    }

    /// Global preconditions checked before any step starts.
    async fn check_preconditions(&self) -> Result<(), ValidationError> {
        if self.mode == RunMode::Automatic {
            return Err(ValidationError::AutoModeUnsupported);
        }
        if self.probe_ports.is_empty() {
            return Err(ValidationError::NoProbesSelected);
        }
        if self.registry.mirror().await.is_none() {
            return Err(ValidationError::NoMirrorSelected);
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate(index)?;
        }
        Ok(())
    }

    /// Execute the full sequence. Returns the accumulated outcome; a
    /// precondition failure stops the run before the first step, nothing
    /// else halts it entirely.
    pub async fn run(mut self) -> Result<RunOutcome, CalError> {
        self.check_preconditions().await?;
        info!(
            "calibration run: {} step(s), {} probe(s)",
            self.steps.len(),
            self.probe_ports.len()
        );

        let steps = std::mem::take(&mut self.steps);
        for (step_index, step) in steps.iter().enumerate() {
            self.emit(RunEvent::StepStarted {
                step_index,
                kind: step.kind,
            });

            if !self.await_setpoint().await {
                return Ok(self.abort());
            }

            if !self.soak(step_index, step.soak).await {
                return Ok(self.abort());
            }

            if !self.sample_step(step_index, step).await {
                return Ok(self.abort());
            }

            self.evaluate_step(step_index, step);

            if step.kind == StepKind::AsFound {
                self.save_test_points(step_index).await;
            }
        }

        self.emit(RunEvent::Complete);
        Ok(self.outcome)
    }

    fn abort(mut self) -> RunOutcome {
        warn!("calibration run aborted by operator");
        self.outcome.aborted = true;
        self.emit(RunEvent::Aborted);
        self.outcome
    }

    /// `AwaitManualSetpoint`: block until the operator confirms the
    /// chamber. Returns false on abort or a dropped control handle.
    async fn await_setpoint(&mut self) -> bool {
        loop {
            match self.control.recv().await {
                Some(RunCommand::Proceed) => return true,
                Some(RunCommand::Abort) | None => return false,
                Some(RunCommand::SkipSoak) => {}
            }
        }
    }

    /// `Soaking`: cancellable timed wait with a visible countdown.
    /// Returns false on abort.
    async fn soak(&mut self, step_index: usize, total: Duration) -> bool {
        self.emit(RunEvent::SoakStarted { step_index, total });
        let tick = self.settings.sampling.soak_tick();
        let mut remaining = total;

        while !remaining.is_zero() {
            let this_tick = tick.min(remaining);
            tokio::select! {
                command = self.control.recv() => match command {
                    Some(RunCommand::SkipSoak) => {
                        info!("soak skipped at {remaining:?} remaining");
                        self.emit(RunEvent::SoakSkipped { step_index });
                        return true;
                    }
                    Some(RunCommand::Abort) | None => return false,
                    Some(RunCommand::Proceed) => {}
                },
                _ = tokio::time::sleep(this_tick) => {
                    remaining = remaining.saturating_sub(this_tick);
                    self.emit(RunEvent::SoakTick { step_index, remaining });
                }
            }
        }
        true
    }

    /// `Sampling`: N timed samples, each measuring every probe in its own
    /// task. The inter-sample delay is fixed; only a run abort interrupts
    /// it. Returns false on abort.
    async fn sample_step(&mut self, step_index: usize, step: &CalibrationStep) -> bool {
        let count = self.settings.sampling.samples_per_step;

        for sample_index in 0..count {
            // Reference snapshot refreshed per sample instant.
            let Some(mirror) = self.registry.mirror().await else {
                warn!("reference instrument snapshot vanished mid-run");
                return true;
            };

            let mut tasks = Vec::with_capacity(self.probe_ports.len());
            for port in &self.probe_ports {
                let client = self.client.clone();
                let registry = self.registry.clone();
                let mirror = mirror.clone();
                let step = step.clone();
                let port = port.clone();
                tasks.push(tokio::spawn(async move {
                    measure_probe(client, registry, port, mirror, step, step_index, sample_index)
                        .await
                }));
            }

            for (port, joined) in self.probe_ports.clone().iter().zip(join_all(tasks).await) {
                let record = match joined {
                    Ok(record) => record,
                    // A panicking measurement task still yields a FAIL row.
                    Err(e) => {
                        warn!("[{port}] measurement task panicked: {e}");
                        fail_record(port, "", step_index, sample_index)
                    }
                };
                self.emit(RunEvent::SampleRecorded(record.clone()));
                self.outcome.samples.push(record);
            }

            let last = sample_index + 1 == count;
            if !last && !self.wait_between_samples().await {
                return false;
            }
        }
        true
    }

    /// Fixed inter-sample delay. Only `Abort` interrupts it; `SkipSoak`
    /// and `Proceed` are ignored here. Returns false on abort.
    async fn wait_between_samples(&mut self) -> bool {
        let spacing = self.settings.sampling.sample_spacing();
        let deadline = tokio::time::Instant::now() + spacing;
        loop {
            tokio::select! {
                command = self.control.recv() => match command {
                    Some(RunCommand::Abort) => return false,
                    Some(_) => {}
                    None => return false,
                },
                _ = tokio::time::sleep_until(deadline) => return true,
            }
        }
    }

    /// `Evaluating`: aggregate the step's samples per probe and fold the
    /// averages into the solver input.
    fn evaluate_step(&mut self, step_index: usize, step: &CalibrationStep) {
        for port in self.probe_ports.clone() {
            let records: Vec<&SampleRecord> = self
                .outcome
                .samples
                .iter()
                .filter(|r| r.step_index == step_index && r.probe_port == port)
                .collect();
            if records.is_empty() {
                continue;
            }

            let temp_errors: Vec<f64> = records.iter().map(|r| r.temperature_error).collect();
            let hum_errors: Vec<f64> = records.iter().map(|r| r.humidity_error).collect();
            let (temp_worst, temp_avg) = summarize_errors(&temp_errors);
            let (hum_worst, hum_avg) = summarize_errors(&hum_errors);

            let summary = StepSummary {
                probe_port: port.clone(),
                step_index,
                kind: step.kind,
                temperature: ChannelSummary {
                    worst_error: temp_worst,
                    average_error: temp_avg,
                    verdict: channel_verdict(
                        step.evaluate_temperature,
                        records.iter().map(|r| r.temperature_verdict),
                    ),
                },
                humidity: ChannelSummary {
                    worst_error: hum_worst,
                    average_error: hum_avg,
                    verdict: channel_verdict(
                        step.evaluate_humidity,
                        records.iter().map(|r| r.humidity_verdict),
                    ),
                },
                valid_samples: records.iter().filter(|r| !r.measurement_failed).count(),
            };
            self.emit(RunEvent::StepEvaluated(summary.clone()));
            self.outcome.summaries.push(summary);

            if let Some(point) = step_fit_point(&records) {
                self.outcome.fit_points.entry(port).or_default().push(point);
            }
        }
    }

    /// As-found persistence: store a humidity test point on every probe
    /// before advancing. Failures are logged per probe and do not stop
    /// the run.
    async fn save_test_points(&mut self, step_index: usize) {
        let Some(mirror) = self.registry.mirror().await else {
            return;
        };
        for port in self.probe_ports.clone() {
            let Some(probe) = self.registry.probe(&port).await else {
                continue;
            };
            match self.client.save_test_point(&probe, mirror.humidity).await {
                Ok(()) => {
                    self.emit(RunEvent::TestPointSaved {
                        probe_port: port.clone(),
                        step_index,
                    });
                }
                Err(e) => {
                    warn!("[{port}] saving test point failed: {e}");
                    self.emit(RunEvent::TestPointFailed {
                        probe_port: port.clone(),
                        step_index,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Summary verdict for one channel: unscored channels never fail.
fn channel_verdict(scored: bool, verdicts: impl Iterator<Item = Verdict>) -> Verdict {
    if !scored {
        return Verdict::NoEval;
    }
    let mut result = Verdict::Pass;
    for v in verdicts {
        if v == Verdict::Fail {
            return Verdict::Fail;
        }
        if v == Verdict::NoEval {
            result = Verdict::NoEval;
        }
    }
    result
}

/// Per-step average triple for the solver, or None when no sample of the
/// step produced usable raw data.
fn step_fit_point(records: &[&SampleRecord]) -> Option<FitPoint> {
    let usable: Vec<&&SampleRecord> = records
        .iter()
        .filter(|r| {
            !r.measurement_failed
                && r.reference_temperature.is_finite()
                && r.resistance.is_finite()
                && r.adc_count.is_finite()
        })
        .collect();
    if usable.is_empty() {
        return None;
    }
    let n = usable.len() as f64;
    Some(FitPoint {
        reference_temperature: usable.iter().map(|r| r.reference_temperature).sum::<f64>() / n,
        resistance: usable.iter().map(|r| r.resistance).sum::<f64>() / n,
        scaled_count: usable.iter().map(|r| r.adc_count).sum::<f64>() / n / 1000.0,
    })
}

/// Measure one probe once. Never fails: measurement errors come back as a
/// FAIL row so the rest of the batch is unaffected.
async fn measure_probe(
    client: ProbeClient,
    registry: Arc<DeviceRegistry>,
    port: String,
    mirror: Mirror,
    step: CalibrationStep,
    step_index: usize,
    sample_index: u32,
) -> SampleRecord {
    let Some(probe) = registry.probe(&port).await else {
        warn!("[{port}] no probe mapping for this port");
        return fail_record(&port, "", step_index, sample_index);
    };

    match read_one_sample(&client, &probe).await {
        Ok((probe_temperature, probe_humidity, resistance, adc_count)) => {
            let temperature_error = mirror.temperature - probe_temperature;
            let humidity_error = mirror.humidity - probe_humidity;
            SampleRecord {
                probe_port: port,
                probe_serial: probe.snapshot.serial_number.clone(),
                step_index,
                sample_index,
                timestamp: Utc::now(),
                reference_temperature: mirror.temperature,
                probe_temperature,
                reference_humidity: mirror.humidity,
                probe_humidity,
                temperature_error,
                humidity_error,
                resistance,
                adc_count,
                temperature_verdict: evaluate_channel(
                    step.evaluate_temperature,
                    step.temperature_tolerance,
                    mirror.temperature,
                    probe_temperature,
                ),
                humidity_verdict: evaluate_channel(
                    step.evaluate_humidity,
                    step.humidity_tolerance,
                    mirror.humidity,
                    probe_humidity,
                ),
                measurement_failed: false,
            }
        }
        Err(e) => {
            warn!("[{port}] sample {sample_index} failed: {e}");
            fail_record(&port, &probe.snapshot.serial_number, step_index, sample_index)
        }
    }
}

/// One probe read: live values plus raw counts.
async fn read_one_sample(
    client: &ProbeClient,
    probe: &Probe,
) -> Result<(f64, f64, f64, f64), CalError> {
    let snapshot = client.read_values(probe).await?;
    let raw = client.read_raw(probe).await?;
    let temperature =
        normalize_to_celsius(snapshot.temperature.value, &snapshot.temperature.unit);
    Ok((
        temperature,
        snapshot.humidity.value,
        raw.resistance,
        raw.temperature_count,
    ))
}

/// FAIL row recorded when a probe cannot be measured.
pub(crate) fn fail_record(
    port: &str,
    serial: &str,
    step_index: usize,
    sample_index: u32,
) -> SampleRecord {
    SampleRecord {
        probe_port: port.to_string(),
        probe_serial: serial.to_string(),
        step_index,
        sample_index,
        timestamp: Utc::now(),
        reference_temperature: f64::NAN,
        probe_temperature: f64::NAN,
        reference_humidity: f64::NAN,
        probe_humidity: f64::NAN,
        temperature_error: f64::NAN,
        humidity_error: f64::NAN,
        resistance: f64::NAN,
        adc_count: f64::NAN,
        temperature_verdict: Verdict::Fail,
        humidity_verdict: Verdict::Fail,
        measurement_failed: true,
    }
}
