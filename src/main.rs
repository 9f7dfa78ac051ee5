//! Operator CLI: discover probes, watch live polls, dump stored constants.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hygrocal::client::ProbeClient;
use hygrocal::config::Settings;
use hygrocal::poller::{PollEvent, Poller, SystemPortScanner};
use hygrocal::registry::DeviceRegistry;
use hygrocal::transport::TransportRegistry;
use log::info;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "hygrocal", about = "Rotronic probe calibration bench driver")]
struct Cli {
    /// Path to a TOML settings file.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Enumerate serial ports and list responding probes.
    Discover,
    /// Discover, then print poll updates until interrupted.
    Watch,
    /// Print the stored calibration constants of the probe on one port.
    Constants { port: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref()).context("loading settings")?;

    let transport = Arc::new(TransportRegistry::new(settings.serial.read_slice()));
    let registry = Arc::new(DeviceRegistry::new());
    let scanner = Box::new(SystemPortScanner::new(settings.serial.baud_rate));
    let mut poller = Poller::new(
        transport.clone(),
        registry.clone(),
        scanner,
        settings.clone(),
    );

    let result = match cli.command {
        CliCommand::Discover => {
            let found = poller.discover().await;
            for probe in &found {
                println!(
                    "{}  addr {}  {}  s/n {}  '{}'",
                    probe.port,
                    probe.snapshot.address,
                    probe.snapshot.model,
                    probe.snapshot.serial_number,
                    probe.snapshot.device_name
                );
            }
            info!("{} probe(s) found", found.len());
            Ok(())
        }
        CliCommand::Watch => watch(poller).await,
        CliCommand::Constants { port } => {
            poller.discover().await;
            let probe = registry
                .probe(&port)
                .await
                .with_context(|| format!("no probe on port '{port}'"))?;
            let client = ProbeClient::new(transport.clone(), settings.serial.clone());
            let constants = client.read_constants(&probe).await?;
            println!("PT100 A            {:.9}", constants.pt100_a);
            println!("PT100 B            {:.9}", constants.pt100_b);
            println!("PT100 C            {:.9}", constants.pt100_c);
            println!("ADC offset         {:.6}", constants.adc_offset);
            println!("conversion factor  {:.6}", constants.conversion_factor);
            Ok(())
        }
    };

    transport.close_all().await;
    result
}

async fn watch(mut poller: Poller) -> Result<()> {
    let mut events = poller.event_stream();
    let (task, shutdown) = poller.spawn();

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PollEvent::ProbeDiscovered(probe) => {
                    println!("+ {} ({})", probe.port, probe.snapshot.device_name);
                }
                PollEvent::ProbeUpdated { port, update } => {
                    println!(
                        "{port}: {:.2} °C  {:.2} %rh  R={:.3}",
                        update.corrected_temperature,
                        update.corrected_humidity,
                        update.resistance
                    );
                }
                PollEvent::ProbeSkipped { port, reason } => {
                    println!("{port}: skipped ({reason})");
                }
                PollEvent::CycleComplete { .. } => {}
            }
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    let _ = shutdown.send(());
    let _ = task.await;
    printer.abort();
    Ok(())
}
