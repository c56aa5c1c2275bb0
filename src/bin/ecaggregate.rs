use argh::FromArgs;
use ecaggregate::{Config, Server, Updater};
use eyre::Context;
use std::{path::PathBuf, sync::Arc};
use tokio::signal;

#[derive(FromArgs)]
/// Aggregates ElastiCache auto-discovery endpoints
struct Args {
    /// the location of the configuration file
    #[argh(option)]
    conf: PathBuf,

    /// also write log messages to the given file
    #[argh(option)]
    log_file: Option<PathBuf>,

    /// enable debug logging
    #[argh(switch, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args: Args = argh::from_env();

    if let Err(err) = set_up_logger(&args) {
        eprintln!(
            "{:?}",
            eyre::Error::new(err).wrap_err("failed to set up logger")
        );
    }

    let config = Config::load(&args.conf).context("failed to load configuration")?;
    let topology = config.build().context("invalid configuration")?;
    log::info!(
        "Loaded {} clusters and {} mappings.",
        topology.clusters.len(),
        topology.mappings.len()
    );

    let updater = Arc::new(Updater::new(topology.clusters, topology.update_interval));
    let _refresh_task = updater.run();
    log::info!("Updater running.");

    let mut servers = Vec::with_capacity(topology.mappings.len());
    for mapping in topology.mappings {
        let name = mapping.name().to_owned();
        let server = Arc::new(Server::new(mapping, updater.clone()));
        let handle = server
            .listen()
            .await
            .with_context(|| format!("failed to start listener for '{}'", name))?;
        log::info!("Listener '{}' running.", name);
        servers.push(handle);
    }

    let signal = wait_for_signal().await?;
    log::info!("Got signal '{}'. Exiting.", signal);

    Ok(())
}

/// Waits for SIGINT or SIGTERM and returns the name of the received signal.
async fn wait_for_signal() -> eyre::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("failed to listen for SIGINT")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        Ok("Ctrl+C")
    }
}

fn set_up_logger(args: &Args) -> Result<(), fern::InitError> {
    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.6f]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());
    if let Some(path) = &args.log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    Ok(())
}
