use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dlqueue::config::AppConfig;
use dlqueue::context::AppContext;
use dlqueue::control::{
    AppControlHandler, ControlRequest, ControlResult, ControlServer, send_request,
};
use dlqueue::logging::init_logging;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, args_conflicts_with_subcommands = true)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "DLQUEUE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory for the queue and logs
    #[arg(long, env = "DLQUEUE_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    /// URLs to queue
    urls: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the queue, adding the given URLs (the default)
    Run {
        /// URLs to queue
        urls: Vec<String>,

        /// Queue URLs even if they were just added
        #[arg(long)]
        force: bool,

        /// Exit once every entry has finished
        #[arg(long)]
        exit_when_done: bool,
    },
    /// Send a control command to the running instance
    Send {
        /// `command` or `command=params`, e.g. `shutdown` or `enqueue=<url>`
        command: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let mut config =
        AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = Some(data_dir.clone());
    }

    match args.command {
        Some(Commands::Send { command }) => send(&config, &command).await,
        Some(Commands::Config) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Some(Commands::Run {
            urls,
            force,
            exit_when_done,
        }) => run(config, args.verbose, urls, force, exit_when_done).await,
        None => run(config, args.verbose, args.urls, false, false).await,
    }
}

async fn send(config: &AppConfig, command: &str) -> anyhow::Result<()> {
    let request = ControlRequest::parse(command).context("Empty command")?;
    let response = send_request(config.control.port, &request, config.control.timeout()).await;
    match &response.message {
        Some(message) => println!("{:?}: {}", response.result, message),
        None => println!("{:?}", response.result),
    }
    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Hand the URLs to a running instance. Returns `false` if none is running.
async fn forward_to_running_instance(config: &AppConfig, urls: &[String]) -> bool {
    if !config.control.enabled {
        return false;
    }
    let port = config.control.port;
    let timeout = config.control.timeout();

    let probe = send_request(port, &ControlRequest::new("wake-up"), timeout).await;
    match probe.result {
        ControlResult::Success => {}
        ControlResult::NotRunning => return false,
        other => {
            eprintln!("Control port {port} is busy but did not answer ({other:?}), starting anyway");
            return false;
        }
    }

    for url in urls {
        let response = send_request(
            port,
            &ControlRequest::with_params("enqueue", url.as_str()),
            timeout,
        )
        .await;
        println!(
            "{}: {}",
            url,
            response.message.as_deref().unwrap_or("no answer")
        );
    }
    println!("Handed over to the running instance");
    true
}

async fn run(
    config: AppConfig,
    verbose: bool,
    urls: Vec<String>,
    force: bool,
    exit_when_done: bool,
) -> anyhow::Result<()> {
    if forward_to_running_instance(&config, &urls).await {
        return Ok(());
    }

    let (logging, _guard) = init_logging(&config.logging, &config.log_dir(), verbose)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting dlqueue");

    let context = AppContext::initialize(config).await?;
    let shutdown = context.cancellation_token();
    logging.start_retention_cleanup(shutdown.clone());
    context.start().await?;

    let control_cancel = CancellationToken::new();
    let control_task = if context.config.control.enabled {
        match ControlServer::bind(&context.config.control).await {
            Ok(server) => {
                let handler = AppControlHandler::new(
                    context.download_manager.clone(),
                    shutdown.clone(),
                )
                .with_logging(Arc::clone(&logging));
                let cancel = control_cancel.clone();
                Some(tokio::spawn(server.serve(Arc::new(handler), cancel)))
            }
            Err(e) => {
                warn!(error = %e, "Control channel unavailable");
                None
            }
        }
    } else {
        None
    };

    if !urls.is_empty() {
        let accepted = context.download_manager.enqueue_all(&urls, force).await;
        let count = accepted.iter().filter(|ok| **ok).count();
        info!(accepted = count, total = urls.len(), "Queued URLs from the command line");
    }

    wait_for_exit(&context, &shutdown, exit_when_done).await;

    control_cancel.cancel();
    context.shutdown().await;
    if let Some(task) = control_task
        && let Err(e) = task.await
    {
        error!(error = %e, "Control channel task failed");
    }
    info!("dlqueue stopped");
    Ok(())
}

async fn wait_for_exit(context: &AppContext, shutdown: &CancellationToken, exit_when_done: bool) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Interrupt received"),
                    Err(e) => error!(error = %e, "Failed to listen for interrupt"),
                }
                return;
            }
            _ = ticker.tick(), if exit_when_done => {
                if context.download_manager.is_idle() {
                    info!("All downloads finished");
                    return;
                }
            }
        }
    }
}
