use anyhow::{bail, Context};
use axum::{routing::get, Router};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use fleet_monitor::config::{MonitorConfig, MonitorSettings};
use fleet_monitor::ingest::IngestService;
use fleet_monitor::report::{report_file_name, write_distance_report};
use fleet_monitor::rollup::RollupPolicy;
use fleet_monitor::scheduler::{Monitor, MonitorScheduler, SchedulerOptions};
use fleet_monitor::sink::LogNotifier;
use fleet_monitor::source::{ApiSource, RelaySource, SampleSource};
use fleet_monitor::store::{JsonFileStore, StateStore};
use fleet_monitor::{batching, metrics, mqtt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fleet-monitor", version, about = "Vehicle fleet speed and stagnation monitor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the push ingestion server
    Serve(ServeArgs),
    /// Poll a telemetry source and raise alerts for the configured vehicles
    Watch(WatchArgs),
    /// Export a stored day of distance history as CSV
    Export(ExportArgs),
}

#[derive(Debug, clap::Args)]
struct ServeArgs {
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:3000")]
    http_addr: String,

    #[arg(long, env = "SPEED_LIMIT", default_value_t = 80.0)]
    speed_limit: f64,

    #[arg(long, env = "STAGNATION_MINUTES", default_value_t = 30)]
    stagnation_minutes: u32,

    /// Also ingest telemetry published to this MQTT broker
    #[arg(long, env = "MQTT_BROKER")]
    mqtt_broker: Option<String>,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "BATCH_SIZE", default_value_t = 200)]
    batch_size: usize,

    #[arg(long, env = "BATCH_TIMEOUT_MS", default_value_t = 50)]
    batch_timeout_ms: u64,

    #[arg(long, env = "CHANNEL_CAPACITY", default_value_t = 10_000)]
    channel_capacity: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceKind {
    Relay,
    Api,
}

#[derive(Debug, clap::Args)]
struct WatchArgs {
    #[command(flatten)]
    settings: MonitorSettings,

    /// Defaults to the API source when an API base URL is set
    #[arg(long, value_enum)]
    source: Option<SourceKind>,

    #[arg(long, env = "STATE_FILE", default_value = "fleet-monitor-state.json")]
    state_file: PathBuf,

    #[arg(long, default_value_t = 30)]
    initial_delay_secs: u64,

    #[arg(long, default_value_t = 60)]
    period_secs: u64,

    #[arg(long, value_enum, default_value_t = RollupPolicy::LastMinute)]
    rollup: RollupPolicy,
}

#[derive(Debug, clap::Args)]
struct ExportArgs {
    #[arg(long, env = "STATE_FILE", default_value = "fleet-monitor-state.json")]
    state_file: PathBuf,

    /// Day to export (YYYY-MM-DD); the most recent stored day by default
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Output file; stdout when set to "-"
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Watch(args) => watch(args).await,
        Command::Export(args) => export(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    info!("Starting fleet ingestion server");
    info!("HTTP server: {}", args.http_addr);

    metrics::init_metrics();

    let service = Arc::new(IngestService::new(
        MonitorConfig::all_vehicles(args.speed_limit, args.stagnation_minutes),
        Arc::new(LogNotifier),
    ));

    let mqtt_handle = match args.mqtt_broker {
        Some(broker) => {
            info!("MQTT broker: {}:{}", broker, args.mqtt_port);
            info!("Channel capacity: {}", args.channel_capacity);
            let (tx, rx) = mpsc::channel(args.channel_capacity);

            let batcher_service = service.clone();
            tokio::spawn(async move {
                batching::run_batcher(rx, batcher_service, args.batch_size, args.batch_timeout_ms)
                    .await;
            });

            let client_id = format!("fleet-monitor-{}", uuid::Uuid::new_v4());
            let port = args.mqtt_port;
            Some(tokio::spawn(async move {
                if let Err(e) = mqtt::run_mqtt(broker, port, client_id, tx).await {
                    error!("MQTT task failed: {}", e);
                }
            }))
        }
        None => None,
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(fleet_monitor::rest::create_router(service));

    let listener = tokio::net::TcpListener::bind(&args.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.http_addr))?;
    info!("HTTP server listening on {}", args.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    let mqtt_done = async {
        match mqtt_handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = mqtt_done => {
            error!("MQTT task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    Ok(())
}

async fn watch(args: WatchArgs) -> anyhow::Result<()> {
    let config = args.settings.validate()?;

    let kind = args.source.unwrap_or(if config.credentials.is_some() {
        SourceKind::Api
    } else {
        SourceKind::Relay
    });
    let source: Arc<dyn SampleSource> = match kind {
        SourceKind::Relay => {
            if config.webhook_url.is_empty() {
                bail!("The relay source needs a webhook URL");
            }
            Arc::new(RelaySource::new()?)
        }
        SourceKind::Api => {
            if config.credentials.is_none() {
                bail!("The API source needs an API base URL and session token");
            }
            Arc::new(ApiSource::new()?)
        }
    };
    info!(
        source = source.name(),
        vehicles = ?config.monitored_vehicles,
        speed_limit = config.speed_limit,
        stagnation_minutes = config.stagnation_minutes,
        "Starting fleet monitor"
    );

    metrics::init_metrics();
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&args.state_file));
    let monitor = Monitor::open(
        config.clone(),
        source,
        store,
        Arc::new(LogNotifier),
        args.rollup,
    )
    .await
    .context("Failed to load local state")?;

    let monitor = Arc::new(monitor);
    let scheduler = MonitorScheduler::new(
        monitor.clone(),
        SchedulerOptions {
            initial_delay: Duration::from_secs(args.initial_delay_secs),
            period: Duration::from_secs(args.period_secs),
        },
    );
    scheduler.start(config);

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    scheduler.stop();

    let state = monitor.local_state().await;
    info!(
        vehicles = state.vehicles.len(),
        alerts = state.alerts.len(),
        days = state.distance_history.len(),
        "Monitor stopped, state saved to {}",
        args.state_file.display()
    );
    Ok(())
}

async fn export(args: ExportArgs) -> anyhow::Result<()> {
    let state = JsonFileStore::new(&args.state_file).load().await?;

    let day = match args.date {
        Some(date) => state.distance_history.iter().find(|d| d.date == date),
        None => state.distance_history.last(),
    }
    .context("No distance data stored for that day")?;

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(report_file_name(day.date)));
    if output.as_os_str() == "-" {
        write_distance_report(std::io::stdout().lock(), day)?;
    } else {
        let file = std::fs::File::create(&output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        write_distance_report(file, day)?;
        info!("Exported {} vehicles to {}", day.vehicles.len(), output.display());
    }
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
