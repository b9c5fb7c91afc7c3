//! CLI entry point for scpi_daq
//!
//! Provides:
//! - one-shot instrument commands (`ping`, `fetch`, `run`, `halt`, `clear`)
//! - catalog sync against the configured instruments
//! - a polling session for one experiment
//! - a simulated instrument for bench work without hardware
//!
//! # Usage
//!
//! ```bash
//! scpi_daq simulate --bind 127.0.0.1:45454
//! scpi_daq ping 127.0.0.1:45454
//! INSTRUMENTS="Bench=127.0.0.1:45454" scpi_daq poll --experiment 1 --duration 10s
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scpi_daq::config::DaqConfig;
use scpi_daq::data::{MemorySink, SampleSink};
use scpi_daq::hardware::SimulatedInstrument;
use scpi_daq::instrument::{InstrumentAddress, InstrumentCatalog, InstrumentId};
use scpi_daq::tracing_init::{self, OutputFormat, TracingConfig};
use scpi_daq::{ExperimentController, ExperimentId, PollRunner, ScpiClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "storage_csv")]
use scpi_daq::data::CsvSink;

#[derive(Parser)]
#[command(name = "scpi_daq")]
#[command(about = "Polls SCPI instruments over TCP and records samples", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = scpi_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    /// Disable ANSI colors in log output
    #[arg(long, global = true)]
    no_color: bool,

    /// Override transport.timeout (e.g. "1500ms")
    #[arg(long, global = true, value_parser = parse_duration)]
    timeout: Option<Duration>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify an instrument (*IDN?)
    Ping {
        #[arg(value_parser = parse_address)]
        address: InstrumentAddress,
    },

    /// Read one sample (FETCH:ALL_S?)
    Fetch {
        #[arg(value_parser = parse_address)]
        address: InstrumentAddress,
    },

    /// Start measuring (FUNC:RUN)
    Run {
        #[arg(value_parser = parse_address)]
        address: InstrumentAddress,
    },

    /// Stop measuring (FUNC:STOP)
    Halt {
        #[arg(value_parser = parse_address)]
        address: InstrumentAddress,
    },

    /// Clear the error state (HAND:ERROR)
    Clear {
        #[arg(value_parser = parse_address)]
        address: InstrumentAddress,
    },

    /// Register and identify every configured instrument
    Sync,

    /// Poll configured instruments for one experiment
    Poll {
        /// Experiment id samples are recorded under
        #[arg(long)]
        experiment: u64,

        /// Instrument ids to bind (default: every active instrument)
        #[arg(long, value_delimiter = ',')]
        instruments: Vec<u64>,

        /// Override polling.interval
        #[arg(long, value_parser = parse_duration)]
        interval: Option<Duration>,

        /// Stop after this long (default: until Ctrl-C)
        #[arg(long, value_parser = parse_duration)]
        duration: Option<Duration>,
    },

    /// Serve a simulated instrument
    Simulate {
        #[arg(long, default_value = "127.0.0.1:45454")]
        bind: String,

        #[arg(long, default_value = "TH2690")]
        model: String,
    },
}

fn parse_address(s: &str) -> Result<InstrumentAddress, String> {
    s.parse().map_err(|e: scpi_daq::DaqError| e.to_string())
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DaqConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(timeout) = cli.timeout {
        config.transport.timeout = timeout;
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let tracing_config = TracingConfig::from_daq_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format)
        .with_ansi(!cli.no_color);
    tracing_init::init(tracing_config).map_err(anyhow::Error::msg)?;

    let client = ScpiClient::tcp(config.transport.timeout);

    match cli.command {
        Commands::Ping { address } => {
            let idn = client.identify(&address).await?;
            println!("model:    {}", idn.model);
            println!("firmware: {}", idn.firmware);
            println!("serial:   {}", idn.serial);
            Ok(())
        }
        Commands::Fetch { address } => {
            let sample = client.fetch_all(&address).await?;
            println!("{}", serde_json::to_string_pretty(&sample)?);
            Ok(())
        }
        Commands::Run { address } => Ok(client.run(&address).await?),
        Commands::Halt { address } => Ok(client.stop(&address).await?),
        Commands::Clear { address } => Ok(client.clear_error(&address).await?),
        Commands::Sync => sync(&config, &client).await,
        Commands::Poll {
            experiment,
            instruments,
            interval,
            duration,
        } => {
            let interval = interval.unwrap_or(config.polling.interval);
            poll(
                &config,
                client,
                ExperimentId(experiment),
                instruments.into_iter().map(InstrumentId).collect(),
                interval,
                duration,
            )
            .await
        }
        Commands::Simulate { bind, model } => simulate(&bind, &model).await,
    }
}

async fn sync(config: &DaqConfig, client: &ScpiClient) -> Result<()> {
    let catalog = InstrumentCatalog::new();
    catalog.sync(&config.instrument_specs(), client).await;

    for record in catalog.list().await {
        println!(
            "{:>3}  {:<20} {:<22} {}",
            record.id,
            record.name,
            record.address,
            record.serial.as_deref().unwrap_or("unreachable")
        );
    }
    Ok(())
}

fn open_sink(config: &DaqConfig) -> Result<Arc<dyn SampleSink>> {
    match &config.storage.csv_path {
        #[cfg(feature = "storage_csv")]
        Some(path) => Ok(Arc::new(CsvSink::open(path)?)),
        #[cfg(not(feature = "storage_csv"))]
        Some(_) => anyhow::bail!("storage.csv_path is set but CSV support is not compiled in"),
        None => Ok(Arc::new(MemorySink::new())),
    }
}

async fn poll(
    config: &DaqConfig,
    client: ScpiClient,
    experiment_id: ExperimentId,
    instrument_ids: Vec<InstrumentId>,
    interval: Duration,
    duration: Option<Duration>,
) -> Result<()> {
    let catalog = Arc::new(InstrumentCatalog::new());
    catalog.sync(&config.instrument_specs(), &client).await;

    let instrument_ids = if instrument_ids.is_empty() {
        catalog.active_ids().await
    } else {
        instrument_ids
    };
    if instrument_ids.is_empty() {
        anyhow::bail!("no instruments configured (set [[instruments]] or INSTRUMENTS)");
    }

    let runner = Arc::new(PollRunner::new(client.clone(), open_sink(config)?));
    let controller = ExperimentController::new(catalog, client, runner, interval)
        .with_stop_timeout(config.polling.shutdown_timeout);

    controller.begin(experiment_id, &instrument_ids).await?;

    let elapsed = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = elapsed => {}
        signal = tokio::signal::ctrl_c() => signal?,
    }

    let status = controller.status(experiment_id).await;
    controller.end(experiment_id, &instrument_ids).await;

    let stats = status.stats.unwrap_or_default();
    println!(
        "experiment {}: {} samples, {} failures over {} ticks",
        experiment_id, stats.samples, stats.failures, stats.ticks
    );
    Ok(())
}

async fn simulate(bind: &str, model: &str) -> Result<()> {
    let instrument = SimulatedInstrument::spawn(bind, model)
        .await
        .with_context(|| format!("binding {bind}"))?;
    println!("Simulated {} listening on {}", model, instrument.address());

    tokio::signal::ctrl_c().await?;
    instrument.shutdown().await;
    Ok(())
}
