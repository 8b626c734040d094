use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use rqd::config::RqdConfig;
use rqd::error::Result;
use rqd::frame::sampler;
use rqd::machine::{ExitAction, Machine};
use rqd::report::Reporter;
use rqd::{control, shutdown};

#[derive(Parser, Debug)]
#[command(name = "rqd", version, about = "Render host agent")]
struct Cli {
    /// INI configuration file. Compiled-in defaults apply without one.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Force the idle detector off for this run.
    #[arg(long)]
    no_nimby: bool,

    /// Override the control endpoint port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Scheduler base URL, overriding the configured endpoint.
    #[arg(long, value_name = "URL")]
    cuebot: Option<String>,

    /// Report under this hostname instead of the probed one.
    #[arg(long)]
    hostname: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RqdConfig::load(path)?,
        None => RqdConfig::default(),
    };
    if cli.no_nimby {
        config.nimby = false;
    }
    if let Some(port) = cli.port {
        config.rqd_port = port;
    }
    if let Some(cuebot) = &cli.cuebot {
        config.cuebot_endpoint = cuebot.clone();
    }
    if let Some(hostname) = &cli.hostname {
        config.override_hostname = Some(hostname.clone());
    }

    init_tracing(&config);

    let config = Arc::new(config);
    tracing::info!(
        port = config.rqd_port,
        scheduler = %config.cuebot_endpoint,
        nimby = config.nimby,
        "Agent starting"
    );

    let token = shutdown::install();
    let (reporter, handle, rx) = Reporter::new(&config);
    let machine = Machine::new(config.clone(), handle, token.clone());

    // Pick up frames a previous incarnation left running, then take the
    // first sample so the boot report carries real numbers.
    machine.adopt_snapshot();
    machine.probe.sample().await;
    reporter.send_boot(&machine.boot_report()).await?;

    tokio::spawn(reporter.run(rx, token.clone()));
    tokio::spawn(sampler::run(
        machine.cache.clone(),
        Duration::from_secs(config.rss_update_interval_secs),
        token.clone(),
    ));

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.rqd_port)).await?;
    tokio::spawn(control::serve(listener, machine.clone(), token.clone()));

    let action = machine.run().await;
    token.cancel();

    match action {
        None | Some(ExitAction::Shutdown) => {
            tracing::info!("Agent stopped");
            Ok(())
        }
        Some(ExitAction::Restart) => restart_in_place(&cli),
        Some(ExitAction::Reboot) => reboot_host(),
    }
}

/// Console layer always; file layer only when a log path is configured
/// and opens. A file that cannot be opened is not fatal.
fn init_tracing(config: &RqdConfig) {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.console_log_level.clone()));
    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(console_filter));

    match config.file_log_path.as_deref().and_then(open_log_file) {
        Some(file) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(EnvFilter::new(config.file_log_level.clone())),
            )
            .init(),
        None => registry.init(),
    }
}

fn open_log_file(path: &Path) -> Option<std::fs::File> {
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => Some(f),
        Err(e) => {
            eprintln!("rqd: cannot open log file {}: {}", path.display(), e);
            None
        }
    }
}

/// Replace this process with a fresh copy of the same binary and flags.
fn restart_in_place(cli: &Cli) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::fs::read_link("/proc/self/exe")?;
    tracing::info!(exe = %exe.display(), "Restarting in place");
    let mut cmd = std::process::Command::new(exe);
    if let Some(config) = &cli.config {
        cmd.arg("--config").arg(config);
    }
    if cli.no_nimby {
        cmd.arg("--no-nimby");
    }
    if let Some(port) = cli.port {
        cmd.arg("--port").arg(port.to_string());
    }
    if let Some(cuebot) = &cli.cuebot {
        cmd.arg("--cuebot").arg(cuebot);
    }
    if let Some(hostname) = &cli.hostname {
        cmd.arg("--hostname").arg(hostname);
    }
    // exec only returns on failure.
    Err(cmd.exec().into())
}

fn reboot_host() -> Result<()> {
    tracing::info!("Rebooting host");
    let status = std::process::Command::new("/sbin/shutdown")
        .args(["-r", "now"])
        .status()?;
    if !status.success() {
        tracing::error!(?status, "Reboot command failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unopenable_log_file_is_skipped() {
        assert!(open_log_file(Path::new("/nonexistent-dir/rqd.log")).is_none());
    }

    #[test]
    fn log_file_opens_for_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rqd.log");
        assert!(open_log_file(&path).is_some());
        assert!(path.exists());
    }
}
