use std::{
    env, future,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use confluence::{
    config::{self, Config},
    counter,
    emitter::{EmitterFactory, Envelope, Request},
    manager::SourceManager,
    source::Provider,
};
use confluence_aggregator::Aggregator;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    runtime::Builder,
    signal,
    time::{self, Duration, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load confluence config: {0}")]
    Config(#[from] config::Error),
    #[error("Failed to build source provider: {0}")]
    Source(#[from] confluence::source::Error),
    #[error("Parsing Prometheus address failed: {0}")]
    PrometheusAddr(#[from] std::net::AddrParseError),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Confluence task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

const DEFAULT_CONFIG_PATH: &str = "/etc/confluence/confluence.yaml";

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run confluence with specified configuration
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,
    /// address to bind the prometheus exporter to
    #[clap(long)]
    prometheus_addr: Option<String>,
    /// the time, in seconds, to run before shutting down; runs until ctrl-c
    /// when absent
    #[clap(long)]
    experiment_duration_seconds: Option<u64>,
    /// name of the consuming shard, passed to every producer
    #[clap(long, default_value = "confluence")]
    shard_id: String,
    /// the period, in seconds, on which running totals are logged
    #[clap(long, default_value_t = 10)]
    report_interval_seconds: u64,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,
}

fn load_config(config_path: &Path) -> Result<Config, Error> {
    let res = if let Ok(contents) = env::var("CONFLUENCE_CONFIG") {
        debug!("Using config from env var 'CONFLUENCE_CONFIG'");
        config::parse(&contents)
    } else {
        debug!("Attempting to open configuration file at: {config_path:?}");
        config::load(config_path)
    };
    res.map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

async fn inner_main(config: Config, cmd: RunCommand) -> Result<(), Error> {
    if let Some(addr) = cmd.prometheus_addr {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
    }

    let shutdown = CancellationToken::new();
    let aggregator: Aggregator<Request, Envelope> = Aggregator::new(config.aggregator);

    let manager = SourceManager::new(
        Provider::new(&config.source)?,
        EmitterFactory::new(config.emitter),
        aggregator.clone(),
        config.update_interval(),
    );
    let manager = tokio::spawn(manager.run(shutdown.clone()));

    let mut session = aggregator.consume(
        &shutdown,
        Request {
            shard_id: cmd.shard_id,
        },
        config.consume_options(),
    );
    let report_interval = Duration::from_secs(cmd.report_interval_seconds.max(1));
    let counter =
        tokio::spawn(async move { counter::count(&mut session, Some(report_interval)).await });

    let experiment_duration = cmd.experiment_duration_seconds;
    let experiment = async move {
        match experiment_duration {
            Some(seconds) => sleep(Duration::from_secs(seconds)).await,
            None => future::pending::<()>().await,
        }
    };
    tokio::pin!(experiment);

    let mut interval = time::interval(Duration::from_millis(400));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                gauge!("confluence.running").set(1.0);
            },
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break;
            },
            () = &mut experiment => {
                info!("experiment duration elapsed");
                break;
            },
        }
    }

    shutdown.cancel();
    manager.await?;
    let counts = counter.await?;
    info!(
        total = counts.total(),
        sources = counts.by_source().len(),
        out_of_order = counts.out_of_order(),
        "final counts"
    );
    for (source_id, total) in counts.by_source() {
        debug!(source_id = %source_id, total, "per source total");
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting confluence {version}.");

    let cmd = match Cli::parse().command {
        Commands::Run(cmd) => cmd,
        Commands::ConfigCheck(cmd) => match load_config(&cmd.config_path) {
            Ok(_) => {
                info!("Configuration file is valid");
                std::process::exit(0)
            }
            Err(_) => std::process::exit(1),
        },
    };

    let config = load_config(&cmd.config_path)?;
    let max_shutdown_delay = Duration::from_secs(cmd.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, cmd));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
