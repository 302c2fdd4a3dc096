pub mod cli;
pub mod config;
pub mod locator;
pub mod logging;
pub mod model;
pub mod model_gateway;
pub mod repl;
pub mod summarize;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io;
use tracing::{debug, info, warn};

use cli::{Action, Cli};
use config::Config;
use locator::ExecutableLocator;
use repl::run_repl;
use summarize::summarize_files;
use supervisor::{ProcessSupervisor, RunMode, ServerStatus, StopOutcome};
use transport::ChatTransport;

pub async fn run() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let cfg = load_config(&cli);
    logging::init(cfg.debug);
    info!(
        host = %cfg.host,
        port = cfg.port,
        model = %cfg.model,
        state_dir = %cfg.state_dir.display(),
        debug = cfg.debug,
        "loaded runtime configuration"
    );

    match cli.action() {
        Action::Status => check_status(&cfg).await,
        Action::Stop => stop_service(&cfg).await,
        Action::Service => start_service(&cfg, &cli).await,
        Action::Chat => chat(&cfg, &cli).await,
    }
}

fn load_config(cli: &Cli) -> Config {
    let mut cfg = Config::from_env();
    cfg.debug |= cli.debug;
    if let Some(prompt) = &cli.prompt {
        cfg.system_prompt = prompt.clone();
    }
    cfg
}

fn locate_executable(cli: &Cli) -> Result<std::path::PathBuf> {
    let locator = ExecutableLocator::from_env()?;
    let executable = locator.locate(cli.llamafile.as_deref())?;
    debug!(executable = %executable.display(), "resolved llamafile executable");
    Ok(executable)
}

async fn check_status(cfg: &Config) -> Result<()> {
    let status = ProcessSupervisor::attach(cfg).status().await;
    println!("{}", status.as_str());
    Ok(())
}

async fn stop_service(cfg: &Config) -> Result<()> {
    let supervisor = ProcessSupervisor::attach(cfg);
    let outcome = supervisor
        .stop()
        .await
        .context("Failed to stop llamafile service")?;

    match outcome {
        StopOutcome::Stopped {
            pid: Some(pid),
            forced,
        } => {
            if forced {
                println!("Killed llamafile service (PID {pid}) after it ignored SIGTERM");
            } else {
                println!("Stopped llamafile service (PID {pid})");
            }
        }
        StopOutcome::AlreadyExited { pid: Some(pid) } => {
            println!("llamafile service (PID {pid}) was not running; removed stale PID file");
        }
        _ => println!("No running llamafile service found"),
    }
    Ok(())
}

async fn start_service(cfg: &Config, cli: &Cli) -> Result<()> {
    let probe = ProcessSupervisor::attach(cfg);
    if probe.status().await == ServerStatus::Running {
        println!("llamafile service already running at {}", cfg.address());
        return Ok(());
    }

    let executable = locate_executable(cli)?;
    let supervisor = ProcessSupervisor::new(cfg, executable);
    supervisor
        .start(RunMode::Daemon)
        .await
        .context("Failed to start llamafile service")?;
    println!("Llamafile running as a service");
    Ok(())
}

async fn chat(cfg: &Config, cli: &Cli) -> Result<()> {
    let attached = ProcessSupervisor::attach(cfg);
    let supervisor = if attached.status().await == ServerStatus::Running {
        println!("Using running llamafile service");
        attached
    } else {
        let executable = locate_executable(cli)?;
        let supervisor = ProcessSupervisor::new(cfg, executable);
        if let Err(err) = supervisor.start(RunMode::Foreground).await {
            shutdown(&supervisor).await;
            return Err(err).context("Failed to start llamafile");
        }
        supervisor
    };

    let result = converse(cfg, cli, &supervisor).await;
    shutdown(&supervisor).await;
    result
}

async fn converse(cfg: &Config, cli: &Cli, supervisor: &ProcessSupervisor) -> Result<()> {
    let transport = ChatTransport::new(cfg, Some(supervisor.api_key()))
        .context("Failed to initialize HTTP client")?;

    if cli.files.is_empty() {
        return run_repl(&transport, &cfg.system_prompt).await;
    }

    let report = summarize_files(&transport, &cfg.system_prompt, &cli.files, &mut io::stdout())
        .await?;
    if report.summarized == 0 {
        bail!("no files could be summarized");
    }
    Ok(())
}

/// Stops the server only if this run launched it.
async fn shutdown(supervisor: &ProcessSupervisor) {
    if !supervisor.owns_process() {
        return;
    }
    match supervisor.stop().await {
        Ok(outcome) => debug!(?outcome, "llamafile stopped"),
        Err(err) => {
            warn!(error = %err, "failed to stop llamafile");
            eprintln!("Error stopping llamafile: {err}");
        }
    }
}
