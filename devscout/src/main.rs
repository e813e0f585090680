use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use devscout::api::{ApiServer, AppState};
use devscout::config::AppConfig;
use devscout::controller::Controller;
use devscout::{logging, migration, shutdown, store};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller and the control API (default)
    Serve {
        /// Put every stored device back into the first queue before starting
        #[arg(long)]
        requeue: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let requeue = match cli.command {
        Some(Command::Serve { requeue }) => requeue,
        None => false,
    };

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let _log_guard = logging::init_logging(&config.logging).context("Failed to initialize logging")?;
    let cancel = CancellationToken::new();
    logging::start_retention_cleanup(config.logging.dir.clone(), cancel.clone());

    info!(version = env!("CARGO_PKG_VERSION"), "devscout starting");

    let store = store::open_store(&config.store)
        .await
        .context("Failed to open device store")?;
    let controller = Arc::new(Controller::new(&config, store.clone())?);

    if requeue {
        let count =
            migration::requeue_known_devices(store.as_ref(), controller.input_queue(), None)
                .await
                .context("Failed to requeue known devices")?;
        info!(count, "Seeded first queue from the store");
    }

    let state = AppState::new()
        .with_controller(controller.clone())
        .with_shutdown(cancel.child_token());
    let api_shutdown = state.shutdown.clone();
    let server = ApiServer::with_state(config.api.clone(), state);
    let api_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "API server failed");
        }
    });

    tokio::spawn(shutdown::watch_signals(
        controller.clone(),
        api_shutdown.clone(),
    ));

    controller.start_autostart_feeders().await;
    controller.clone().run().await;

    api_shutdown.cancel();
    cancel.cancel();
    if let Err(e) = api_task.await {
        error!(error = %e, "API task panicked");
    }

    info!("devscout stopped");
    Ok(())
}
