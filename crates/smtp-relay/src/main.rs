use anyhow::Context;
use clap::Parser;
use smtp_relay::config::RelayConfig;
use smtp_relay::diagnostic_logging::{DiagnosticFormat, LoggingConfig, DEFAULT_FILTER, FILTER_ENV_VAR};
use smtp_relay::listener::Relay;
use std::path::PathBuf;
use std::sync::Arc;

/// Content filtering SMTP relay
#[derive(Debug, Parser)]
#[command(about = "content filtering smtp relay")]
struct Opt {
    /// Configuration file to load
    #[arg(long, default_value = "/etc/smtp-relay.toml")]
    config: PathBuf,

    /// Directory where diagnostic log files will be placed.
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    let _log_guard = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        filter_env_var: FILTER_ENV_VAR,
        default_filter: DEFAULT_FILTER,
        diag_format: opts.diag_format,
    }
    .init()
    .context("initializing logging")?;

    let config = RelayConfig::load(&opts.config)?;
    if opts.validate {
        println!(
            "{}: OK. {} listener(s), {} upstream(s), scanner {}",
            opts.config.display(),
            config.listen.len(),
            config.upstream.servers.len(),
            if config.rspamd.is_some() {
                "enabled"
            } else {
                "disabled"
            }
        );
        return Ok(());
    }

    let relay = Arc::new(Relay::from_config(&config)?);
    for endpoint in &config.listen {
        relay.start_listener(*endpoint).await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    Ok(())
}
