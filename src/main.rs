//! Command-line front end over simulated hardware.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;

use daq_orchestrator::config::Settings;
use daq_orchestrator::core::{DeviceRequest, DeviceType};
use daq_orchestrator::device::simulated::SimulatedConnector;
use daq_orchestrator::device::{LifecycleController, RunnableDevice};
use daq_orchestrator::events::BroadcastPublisher;
use daq_orchestrator::queue::{
    ChannelTaskSource, DeviceRunProcessor, ProcessorFactory, QueueBean, QueueConsumer,
    QueueProcessor, SimulatedProcessor,
};
use daq_orchestrator::logging;
use daq_orchestrator::registry::{simulated_behaviours, DeviceRegistry, ScannableRegistry};
use daq_orchestrator::router::RequestRouter;

/// Route device requests and run queued tasks against simulated devices
#[derive(Parser)]
#[command(name = "daq-orchestrator", version, about)]
struct Cli {
    /// Settings file (TOML); `DAQ_` environment variables override it
    #[arg(short, long, env = "DAQ_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process one device request read as JSON from a file or stdin
    Request {
        /// Request file; `-` reads stdin
        #[arg(default_value = "-")]
        file: String,
    },
    /// List the configured devices
    Devices {
        /// Scannables instead of runnable devices
        #[arg(long)]
        scannables: bool,
    },
    /// Run one queued task and print every status bean
    Queue {
        /// Task name
        #[arg(short, long, default_value = "task")]
        name: String,
        /// Run this configured device; otherwise simulate the work
        #[arg(short, long)]
        device: Option<String>,
        /// JSON payload with optional `model` and `position`
        #[arg(short, long)]
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    logging::init(&settings.application)?;
    tracing::info!(app = %settings.application.name, "Starting");

    let connector = Arc::new(
        simulated_behaviours(&settings)
            .into_iter()
            .fold(SimulatedConnector::default(), |connector, (name, behaviour)| {
                connector.with_device(name, behaviour)
            }),
    );

    match cli.command {
        Command::Request { file } => {
            let scannables = Arc::new(ScannableRegistry::from_settings(&settings)?);
            let devices = Arc::new(DeviceRegistry::from_settings(&settings, connector).await?);
            let router = RequestRouter::new(scannables, devices.clone());

            let request: DeviceRequest = serde_json::from_str(&read_input(&file).await?)
                .context("parsing device request")?;
            let outcome = router.process(request).await;
            if let Ok(response) = &outcome {
                println!("{}", serde_json::to_string_pretty(response)?);
                // A RUN request returns once the device is running
                devices.wait_for_runs(settings.queue.poll_interval()).await;
                for device in devices.devices_by_level() {
                    tracing::info!(device = %device.name(), state = ?device.state(), "Final device state");
                }
            }
            devices.dispose_all().await?;
            outcome?;
        }
        Command::Devices { scannables } => {
            let request = if scannables {
                DeviceRequest::new(DeviceType::Scannable)
            } else {
                DeviceRequest::new(DeviceType::Runnable)
            };
            let router = RequestRouter::new(
                Arc::new(ScannableRegistry::from_settings(&settings)?),
                Arc::new(DeviceRegistry::from_settings(&settings, connector).await?),
            );
            let response = router.process(request).await?;
            println!("{}", serde_json::to_string_pretty(&response.device_information)?);
        }
        Command::Queue {
            name,
            device,
            payload,
        } => {
            let payload = match payload {
                Some(text) => serde_json::from_str(&text).context("parsing payload")?,
                None => serde_json::Value::Null,
            };
            run_queue(&settings, connector, QueueBean::new(name, payload), device).await?;
        }
    }
    Ok(())
}

async fn run_queue(
    settings: &Settings,
    connector: Arc<SimulatedConnector>,
    bean: QueueBean,
    device: Option<String>,
) -> anyhow::Result<()> {
    let publisher = Arc::new(BroadcastPublisher::<QueueBean>::new(
        "queue.status",
        settings.queue.status_channel_capacity,
    ));
    let mut statuses = publisher.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(bean) = statuses.recv().await {
            if let Ok(line) = serde_json::to_string(&bean) {
                println!("{}", line);
            }
            if bean.status.is_final() {
                break;
            }
        }
    });

    let factory: ProcessorFactory = match device {
        Some(device) => {
            let controller =
                LifecycleController::connect(device.clone(), connector.as_ref(), settings.lifecycle.clone())
                    .await?;
            let model = settings
                .devices
                .iter()
                .find(|definition| definition.name == device)
                .and_then(|definition| definition.model.clone());
            if let Some(model) = model {
                controller.configure(model).await?;
            }
            let poll = settings.queue.poll_interval();
            Box::new(move |bean: &QueueBean| {
                Ok(Arc::new(DeviceRunProcessor::new(bean.clone(), controller.clone(), poll))
                    as Arc<dyn QueueProcessor>)
            })
        }
        None => {
            let steps = settings.queue.simulated_steps;
            let delay = settings.queue.poll_interval();
            Box::new(move |bean: &QueueBean| {
                Ok(Arc::new(SimulatedProcessor::new(bean.clone(), steps, delay))
                    as Arc<dyn QueueProcessor>)
            })
        }
    };

    let (tx, source) = ChannelTaskSource::channel(1);
    tx.send(bean).await.context("submitting task")?;
    drop(tx);

    let consumer = Arc::new(QueueConsumer::new(Arc::new(source), factory, publisher));
    let watcher = Arc::clone(&consumer);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, terminating tasks");
            watcher.terminate_all();
        }
    });

    let report = consumer.run().await?;
    interrupt.abort();
    printer.await?;
    tracing::info!(?report, "Queue finished");
    Ok(())
}

async fn read_input(file: &str) -> anyhow::Result<String> {
    if file == "-" {
        let mut text = String::new();
        tokio::io::stdin().read_to_string(&mut text).await?;
        Ok(text)
    } else {
        tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("reading {}", file))
    }
}
