//! Full-stack calibration runs over scripted serial ports: discovery,
//! sampling, evaluation, aggregation, test-point persistence, abort, and
//! the solver hand-off.

use async_trait::async_trait;
use hygrocal::client::ProbeClient;
use hygrocal::config::{
    PollingSettings, SamplingSettings, SerialSettings, Settings, SolverSettings,
};
use hygrocal::device::Mirror;
use hygrocal::error::{CalError, SolverError, TransportError, ValidationError};
use hygrocal::poller::{Poller, PortScanner};
use hygrocal::registry::DeviceRegistry;
use hygrocal::sequence::{
    CalibrationRun, CalibrationStep, RunControl, RunEvent, RunMode, StepKind, Tolerance, Verdict,
};
use hygrocal::solver::fit_coefficients;
use hygrocal::transport::mock::MockScript;
use hygrocal::transport::{PortHandle, TransportRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const IDENTITY_C: &str = "{F05rdd 001};45.20;%rh;000;=;21.30;°C;000;=;Dp;9.80;°C;000;=;HC2-S;V1.9;0012345678;bench-3;000;A}";
const IDENTITY_F: &str = "{F07rdd 001};45.20;%rh;000;=;70.34;°F;000;=;Dp;9.80;°C;000;=;HC2-S;V1.9;0012345679;bench-4;000;A}";
const POLL_C: &str = "{F05STS 01234};0.1;0.2;0.3;0.4;45.2;3592215;108.855;21.55;B}";
const CONSTANT: &str = "{064;160;000;000}";

fn fast_settings() -> Settings {
    Settings {
        serial: SerialSettings {
            baud_rate: 19200,
            read_slice_ms: 1,
            discovery_timeout_ms: 40,
            poll_timeout_ms: 40,
            register_timeout_ms: 40,
        },
        polling: PollingSettings { period_secs: 1 },
        sampling: SamplingSettings {
            samples_per_step: 5,
            sample_spacing_ms: 2,
            soak_tick_ms: 10,
        },
        solver: SolverSettings::default(),
    }
}

struct ScriptScanner {
    scripts: HashMap<String, MockScript>,
}

#[async_trait]
impl PortScanner for ScriptScanner {
    fn scan(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.keys().cloned().collect();
        names.sort();
        names
    }

    async fn open(
        &self,
        transport: &TransportRegistry,
        name: &str,
    ) -> Result<PortHandle, TransportError> {
        let script = self
            .scripts
            .get(name)
            .ok_or_else(|| TransportError::PortUnavailable(name.to_string()))?;
        Ok(transport.install(name, Box::new(script.port())).await)
    }
}

struct Bench {
    transport: Arc<TransportRegistry>,
    registry: Arc<DeviceRegistry>,
    client: ProbeClient,
    settings: Settings,
}

async fn bench(scripts: HashMap<String, MockScript>) -> Bench {
    let settings = fast_settings();
    let transport = Arc::new(TransportRegistry::new(settings.serial.read_slice()));
    let registry = Arc::new(DeviceRegistry::new());
    let poller = Poller::new(
        transport.clone(),
        registry.clone(),
        Box::new(ScriptScanner { scripts }),
        settings.clone(),
    );
    poller.discover().await;
    let client = ProbeClient::new(transport.clone(), settings.serial.clone());
    Bench {
        transport,
        registry,
        client,
        settings,
    }
}

fn mirror(temperature: f64) -> Mirror {
    Mirror {
        id: "mbw-373".to_string(),
        temperature,
        humidity: 45.00,
        dew_point: 9.5,
        stable: true,
    }
}

fn step(kind: StepKind, soak: Duration) -> CalibrationStep {
    CalibrationStep {
        kind,
        temperature_setpoint: 23.0,
        humidity_setpoint: 45.0,
        soak,
        evaluate_temperature: false,
        evaluate_humidity: false,
        temperature_tolerance: None,
        humidity_tolerance: None,
    }
}

fn scored_step(kind: StepKind) -> CalibrationStep {
    let mut s = step(kind, Duration::from_millis(20));
    s.evaluate_temperature = true;
    s.evaluate_humidity = true;
    s.temperature_tolerance = Some(Tolerance::symmetric(0.20));
    s.humidity_tolerance = Some(Tolerance::symmetric(0.50));
    s
}

fn celsius_script() -> MockScript {
    let script = MockScript::new();
    script.on("RDD", IDENTITY_C);
    script.on("STS", POLL_C);
    script.on("ERD", CONSTANT);
    script.on("HCA", "{ok}");
    script
}

fn fahrenheit_script() -> MockScript {
    let script = MockScript::new();
    script.on("RDD", IDENTITY_F);
    script.on("STS", POLL_C);
    script.on("ERD", CONSTANT);
    script.on("HCA", "{ok}");
    script
}

/// Drives a run from its event stream: sets the mirror and proceeds at
/// each step start, optionally skipping soaks, and collects every event.
fn spawn_driver(
    registry: Arc<DeviceRegistry>,
    control: RunControl,
    mut events: tokio::sync::mpsc::UnboundedReceiver<RunEvent>,
    step_temperatures: Vec<f64>,
    skip_soak: bool,
) -> (tokio::task::JoinHandle<()>, Arc<Mutex<Vec<RunEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_task = seen.clone();
    let handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                RunEvent::StepStarted { step_index, .. } => {
                    let temperature = step_temperatures
                        .get(*step_index)
                        .copied()
                        .unwrap_or(21.40);
                    registry.set_mirror(mirror(temperature)).await;
                    control.proceed();
                }
                RunEvent::SoakStarted { .. } if skip_soak => control.skip_soak(),
                _ => {}
            }
            if let Ok(mut seen) = seen_task.lock() {
                seen.push(event);
            }
        }
    });
    (handle, seen)
}

#[tokio::test]
async fn full_run_scores_and_persists_test_points() {
    let com3 = celsius_script();
    let com4 = fahrenheit_script();
    let mut scripts = HashMap::new();
    scripts.insert("COM3".to_string(), com3.clone());
    scripts.insert("COM4".to_string(), com4.clone());
    let bench = bench(scripts).await;

    assert_eq!(bench.registry.snapshot().await.len(), 2);
    bench.registry.set_mirror(mirror(21.40)).await;

    let (run, control, events) = CalibrationRun::new(
        bench.registry.clone(),
        bench.client.clone(),
        bench.settings.clone(),
        vec![scored_step(StepKind::AsFound)],
        vec!["COM3".to_string(), "COM4".to_string()],
        RunMode::Manual,
    );
    let (driver, _seen) = spawn_driver(
        bench.registry.clone(),
        control,
        events,
        vec![21.40],
        false,
    );

    let outcome = run.run().await.unwrap();
    driver.abort();

    // 1 step x 5 samples x 2 probes.
    assert_eq!(outcome.samples.len(), 10);
    for sample in &outcome.samples {
        assert!(!sample.measurement_failed);
        // Probe reads 21.30 C (the Fahrenheit probe reports 70.34 F).
        assert!((sample.probe_temperature - 21.30).abs() < 0.01);
        assert!((sample.temperature_error - 0.10).abs() < 0.01);
        assert!((sample.humidity_error + 0.20).abs() < 1e-9);
        assert_eq!(sample.temperature_verdict, Verdict::Pass);
        assert_eq!(sample.humidity_verdict, Verdict::Pass);
        assert_eq!(sample.resistance, 108.855);
    }

    assert_eq!(outcome.summaries.len(), 2);
    for summary in &outcome.summaries {
        assert_eq!(summary.valid_samples, 5);
        assert_eq!(summary.temperature.verdict, Verdict::Pass);
        assert_eq!(summary.humidity.verdict, Verdict::Pass);
        assert!((summary.temperature.average_error - 0.10).abs() < 0.01);
    }

    // As-found persists one test point per probe with the reference
    // humidity.
    for script in [&com3, &com4] {
        let hca: Vec<String> = script
            .writes()
            .into_iter()
            .filter(|w| w.contains("HCA"))
            .collect();
        assert_eq!(hca.len(), 1);
        assert!(hca[0].contains("HCA 0;1;0;45.00;"));
    }

    // One fit point per probe for the single step.
    assert_eq!(outcome.fit_points["COM3"].len(), 1);
    assert_eq!(outcome.fit_points["COM4"].len(), 1);
    let point = outcome.fit_points["COM3"][0];
    assert!((point.reference_temperature - 21.40).abs() < 1e-9);
    assert!((point.resistance - 108.855).abs() < 1e-9);
    assert!((point.scaled_count - 3592.215).abs() < 1e-9);
}

#[tokio::test]
async fn three_step_run_feeds_the_solver() {
    // R = 100 * (1 + 0.00385*T); counts = 33000 * R.
    let frames = [
        (5.0, "{F05STS 01234};0.1;0.2;0.3;0.4;45.2;3363525;101.925;5.02;B}"),
        (23.0, "{F05STS 01234};0.1;0.2;0.3;0.4;45.2;3592215;108.855;23.01;B}"),
        (45.0, "{F05STS 01234};0.1;0.2;0.3;0.4;45.2;3871725;117.325;44.98;B}"),
    ];

    let com3 = celsius_script();
    let mut scripts = HashMap::new();
    scripts.insert("COM3".to_string(), com3.clone());
    let bench = bench(scripts).await;
    bench.registry.set_mirror(mirror(frames[0].0)).await;

    let steps: Vec<CalibrationStep> = (0..3)
        .map(|_| step(StepKind::Final, Duration::from_millis(10)))
        .collect();
    let (run, control, mut events) = CalibrationRun::new(
        bench.registry.clone(),
        bench.client.clone(),
        bench.settings.clone(),
        steps,
        vec!["COM3".to_string()],
        RunMode::Manual,
    );

    // Per-step driver: point the mirror at the step temperature and swap
    // the scripted raw frame before confirming the setpoint.
    let registry = bench.registry.clone();
    let driver = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let RunEvent::StepStarted { step_index, .. } = event {
                let (temperature, frame) = frames[step_index];
                registry.set_mirror(mirror(temperature)).await;
                com3.on("STS", frame);
                control.proceed();
            }
        }
    });

    let outcome = run.run().await.unwrap();
    driver.abort();

    let points = &outcome.fit_points["COM3"];
    assert_eq!(points.len(), 3);

    let fit = fit_coefficients(points, 33.0, &SolverSettings::default()).unwrap();
    assert!((fit.r0 - 100.0).abs() < 1e-6, "r0 = {}", fit.r0);
    assert!((fit.a - 0.00385).abs() < 1e-8, "a = {}", fit.a);
    assert!(fit.b.abs() < 1e-9, "b = {}", fit.b);
    assert!((fit.projected_count - 3300.0).abs() < 1e-5);
    assert!(fit.adc_offset.abs() < 1e-7, "offset = {}", fit.adc_offset);
    assert!(fit.r_squared > 0.999999);

    // Same three points collapsed to one temperature cannot be fitted.
    let degenerate = vec![points[0]; 3];
    assert_eq!(
        fit_coefficients(&degenerate, 33.0, &SolverSettings::default()),
        Err(SolverError::SingularFit)
    );
}

#[tokio::test]
async fn run_preconditions() {
    let mut scripts = HashMap::new();
    scripts.insert("COM3".to_string(), celsius_script());
    let bench = bench(scripts).await;

    // No reference instrument selected.
    let (run, _control, _events) = CalibrationRun::new(
        bench.registry.clone(),
        bench.client.clone(),
        bench.settings.clone(),
        vec![step(StepKind::Final, Duration::ZERO)],
        vec!["COM3".to_string()],
        RunMode::Manual,
    );
    assert!(matches!(
        run.run().await,
        Err(CalError::Validation(ValidationError::NoMirrorSelected))
    ));

    bench.registry.set_mirror(mirror(21.40)).await;

    // No probes selected.
    let (run, _control, _events) = CalibrationRun::new(
        bench.registry.clone(),
        bench.client.clone(),
        bench.settings.clone(),
        vec![step(StepKind::Final, Duration::ZERO)],
        Vec::new(),
        RunMode::Manual,
    );
    assert!(matches!(
        run.run().await,
        Err(CalError::Validation(ValidationError::NoProbesSelected))
    ));

    // Automatic mode is a hard stop, not a silent skip.
    let (run, _control, _events) = CalibrationRun::new(
        bench.registry.clone(),
        bench.client.clone(),
        bench.settings.clone(),
        vec![step(StepKind::Final, Duration::ZERO)],
        vec!["COM3".to_string()],
        RunMode::Automatic,
    );
    assert!(matches!(
        run.run().await,
        Err(CalError::Validation(ValidationError::AutoModeUnsupported))
    ));

    // A scored channel without a tolerance is rejected before the run.
    let mut bad = step(StepKind::Final, Duration::ZERO);
    bad.evaluate_temperature = true;
    let (run, _control, _events) = CalibrationRun::new(
        bench.registry.clone(),
        bench.client.clone(),
        bench.settings.clone(),
        vec![bad],
        vec!["COM3".to_string()],
        RunMode::Manual,
    );
    assert!(matches!(
        run.run().await,
        Err(CalError::Validation(ValidationError::MissingTolerance {
            step: 0,
            channel: "temperature"
        }))
    ));
}

#[tokio::test]
async fn abort_keeps_partial_samples() {
    let mut scripts = HashMap::new();
    scripts.insert("COM3".to_string(), celsius_script());
    let bench = bench(scripts).await;
    bench.registry.set_mirror(mirror(21.40)).await;

    let steps = vec![
        step(StepKind::Final, Duration::from_millis(10)),
        step(StepKind::Final, Duration::from_millis(10)),
    ];
    let (run, control, mut events) = CalibrationRun::new(
        bench.registry.clone(),
        bench.client.clone(),
        bench.settings.clone(),
        steps,
        vec!["COM3".to_string()],
        RunMode::Manual,
    );

    let driver = tokio::spawn(async move {
        let mut aborted = false;
        while let Some(event) = events.recv().await {
            if let RunEvent::StepStarted { step_index, .. } = event {
                if step_index == 0 {
                    control.proceed();
                } else if !aborted {
                    aborted = true;
                    control.abort();
                }
            }
        }
    });

    let outcome = run.run().await.unwrap();
    driver.abort();

    assert!(outcome.aborted);
    // Step 0 completed before the abort; its samples stay.
    assert_eq!(outcome.samples.len(), 5);
    assert_eq!(outcome.summaries.len(), 1);
    assert_eq!(outcome.fit_points["COM3"].len(), 1);
}

#[tokio::test]
async fn failing_probe_yields_fail_rows_not_a_halt() {
    // Answers discovery but never the raw query.
    let deaf = MockScript::new();
    deaf.on("RDD", IDENTITY_C);
    deaf.on("ERD", CONSTANT);

    let mut scripts = HashMap::new();
    scripts.insert("COM3".to_string(), celsius_script());
    scripts.insert("COM5".to_string(), deaf);
    let bench = bench(scripts).await;
    bench.registry.set_mirror(mirror(21.40)).await;

    let (run, control, events) = CalibrationRun::new(
        bench.registry.clone(),
        bench.client.clone(),
        bench.settings.clone(),
        vec![scored_step(StepKind::AsLeft)],
        vec!["COM3".to_string(), "COM5".to_string()],
        RunMode::Manual,
    );
    let (driver, _seen) = spawn_driver(
        bench.registry.clone(),
        control,
        events,
        vec![21.40],
        false,
    );

    let outcome = run.run().await.unwrap();
    driver.abort();

    assert!(!outcome.aborted);
    assert_eq!(outcome.samples.len(), 10);

    let healthy: Vec<_> = outcome
        .samples
        .iter()
        .filter(|s| s.probe_port == "COM3")
        .collect();
    assert!(healthy.iter().all(|s| !s.measurement_failed));

    let failed: Vec<_> = outcome
        .samples
        .iter()
        .filter(|s| s.probe_port == "COM5")
        .collect();
    assert_eq!(failed.len(), 5);
    assert!(failed.iter().all(|s| s.measurement_failed));
    assert!(failed.iter().all(|s| s.temperature_verdict == Verdict::Fail));

    let com5_summary = outcome
        .summaries
        .iter()
        .find(|s| s.probe_port == "COM5")
        .unwrap();
    assert_eq!(com5_summary.valid_samples, 0);
    assert_eq!(com5_summary.temperature.verdict, Verdict::Fail);
    assert!(!outcome.fit_points.contains_key("COM5"));
}

#[tokio::test]
async fn soak_skip_cuts_the_wait_short() {
    let mut scripts = HashMap::new();
    scripts.insert("COM3".to_string(), celsius_script());
    let bench = bench(scripts).await;
    bench.registry.set_mirror(mirror(21.40)).await;

    // A soak far longer than the test timeout; only the skip finishes it.
    let (run, control, events) = CalibrationRun::new(
        bench.registry.clone(),
        bench.client.clone(),
        bench.settings.clone(),
        vec![step(StepKind::Final, Duration::from_secs(600))],
        vec!["COM3".to_string()],
        RunMode::Manual,
    );
    let (driver, seen) = spawn_driver(
        bench.registry.clone(),
        control,
        events,
        vec![21.40],
        true,
    );

    let outcome = tokio::time::timeout(Duration::from_secs(10), run.run())
        .await
        .unwrap()
        .unwrap();
    // The run dropped its event sender, so the driver drains the channel
    // (including the final Complete) and exits on its own.
    driver.await.unwrap();

    assert_eq!(outcome.samples.len(), 5);
    let seen = seen.lock().unwrap();
    assert!(seen
        .iter()
        .any(|e| matches!(e, RunEvent::SoakSkipped { step_index: 0 })));
    assert!(seen.iter().any(|e| matches!(e, RunEvent::Complete)));
}

#[tokio::test]
async fn shutdown_closes_every_port() {
    let mut scripts = HashMap::new();
    scripts.insert("COM3".to_string(), celsius_script());
    scripts.insert("COM4".to_string(), fahrenheit_script());
    let bench = bench(scripts).await;

    assert_eq!(bench.transport.open_ports().await.len(), 2);
    bench.transport.close_all().await;
    assert!(bench.transport.open_ports().await.is_empty());
}
