//! tgserver - reference server hosting the tgctl control-plane endpoint.
//!
//! Boots against one configuration file, serves administrative sessions and
//! stops when a shutdown request appears in its status block or on Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tgctl_core::{
    exit_code, platform, AcceptAll, AdminService, Authenticator, CancellationToken,
    InstanceConfig, ServerInstance, TgError, TokenAuthenticator,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "tgserver")]
#[command(about = "Reference database server for tgctl")]
struct Args {
    /// Configuration file
    #[arg(long)]
    conf: PathBuf,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = match e.downcast_ref::<TgError>() {
                Some(e) if e.is_config_error() => exit_code::CONFIG_ERROR,
                _ => exit_code::FAILURE,
            };
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = InstanceConfig::load(&args.conf)?;
    info!(
        "Starting tgserver {} on {} (pid {}, database {})",
        env!("CARGO_PKG_VERSION"),
        platform::current_platform(),
        platform::current_pid(),
        config.database_name()
    );

    let authentication = &config.document().authentication;
    let authenticator: Arc<dyn Authenticator> = if authentication.enabled {
        Arc::new(TokenAuthenticator::new(authentication.tokens.iter().cloned()))
    } else {
        Arc::new(AcceptAll)
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("installing signal handler")?;
    }

    let instance = ServerInstance::boot(&config, authenticator, Arc::new(AdminService::new()))
        .context("boot failed")?;
    let request = instance.run(&cancel)?;
    info!("tgserver exited after {} shutdown", request);
    Ok(())
}
