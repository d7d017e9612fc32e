#[macro_use]
extern crate tracing;

use std::{path::PathBuf, sync::Arc};

use structopt::StructOpt;
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;

use ledhub::{
    animation::DummySinkFactory,
    connection::ConnectionRegistry,
    driver::Driver,
    models::{DriverConfig, PortalConfig},
    portal::PortalService,
};

#[derive(Debug, StructOpt)]
struct Opts {
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u32,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Render frames for a portal on the local buses
    Driver {
        #[structopt(short, long = "config")]
        config_path: Option<PathBuf>,
        #[structopt(long)]
        dump_config: bool,
    },
    /// Connect the configured devices and show their scenes
    Portal {
        #[structopt(short, long = "config")]
        config_path: PathBuf,
    },
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(error) = signal::ctrl_c().await {
            error!(error = %error, "failed to listen for Ctrl+C");
            return;
        }

        info!("shutting down");
        token.cancel();
    });
}

async fn run_driver(config_path: Option<PathBuf>, dump_config: bool) -> color_eyre::eyre::Result<()> {
    let config = match config_path.as_deref() {
        Some(path) => DriverConfig::load_file(path).await?,
        None => DriverConfig::default(),
    };

    if dump_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let sinks = Arc::new(DummySinkFactory::new(config.buses.clone(), config.sink));
    let driver = Driver::open(config, sinks).await?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    driver.run(cancel).await?;
    Ok(())
}

async fn run_portal(config_path: PathBuf) -> color_eyre::eyre::Result<()> {
    let config = PortalConfig::load_file(&config_path).await?;
    let portal = Arc::new(PortalService::new(
        &config,
        Arc::new(ConnectionRegistry::new()),
    )?);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let devices: Vec<_> = portal
        .device_ids()
        .map(|id| {
            let portal = portal.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { portal.maintain_device(id, cancel).await })
        })
        .collect();

    info!(devices = devices.len(), "portal started");

    for device in devices {
        if let Err(error) = device.await {
            error!(error = %error, "device task failed");
        }
    }

    portal.shutdown().await;
    Ok(())
}

async fn run(opts: Opts) -> color_eyre::eyre::Result<()> {
    match opts.command {
        Command::Driver {
            config_path,
            dump_config,
        } => run_driver(config_path, dump_config).await,
        Command::Portal { config_path } => run_portal(config_path).await,
    }
}

fn install_tracing(opts: &Opts) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let fmt_layer = fmt::layer();

    let filter_layer = EnvFilter::try_from_env("LEDHUB_LOG").unwrap_or_else(|_| {
        EnvFilter::new(match opts.verbose {
            0 => "ledhub=warn,ledhubd=warn",
            1 => "ledhub=info,ledhubd=info",
            2 => "ledhub=debug,ledhubd=debug",
            _ => "ledhub=trace,ledhubd=trace",
        })
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .try_init()
}

#[paw::main]
fn main(opts: Opts) -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    install_tracing(&opts)?;

    let thd_count = match num_cpus::get() {
        1 => 2,
        other => other.min(4),
    };

    let rt = Builder::new_multi_thread()
        .worker_threads(thd_count)
        .enable_all()
        .build()?;
    rt.block_on(run(opts))
}
