//! tgctl - command-line supervisor for a tgctl-managed database server.
//!
//! Lifecycle commands (`start`, `shutdown`, `kill`, `status`) work on the
//! lock file and status block only. Administrative commands open a session
//! to the running server.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tgctl_core::supervisor::{AdminClient, BackupReport};
use tgctl_core::transport::{RestoreSource, SessionShutdownKind};
use tgctl_core::{
    exit_code, platform, ConnectOptions, CredentialSource, InstanceConfig, JsonLinesMonitor,
    LaunchConfig, Monitor, NullMonitor, Outcome, OutcomeKind, ServerLauncher, ShutdownRequest,
    Supervisor, SupervisorConfig, SupervisorOptions, TgError,
};
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tgctl")]
#[command(about = "Control a tgctl-managed database server")]
struct Args {
    /// Configuration file (defaults to $TGCTL_CONF, then the user config dir)
    #[arg(long, global = true)]
    conf: Option<PathBuf>,

    /// Append line-delimited JSON progress records to this file
    #[arg(long, global = true)]
    monitor: Option<PathBuf>,

    /// Overall timeout in seconds (0 = unbounded)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Credential presented by administrative commands
    #[arg(long, global = true, value_enum, default_value_t = AuthMode::None)]
    auth: AuthMode,

    /// Token for `--auth token`
    #[arg(long, global = true)]
    auth_token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum AuthMode {
    None,
    Token,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the server and wait until it is ready
    Start {
        /// Kill any existing server first
        #[arg(long)]
        force: bool,
        /// Server executable (defaults to $TGSERVER, then a sibling tgserver)
        #[arg(long)]
        server: Option<PathBuf>,
        /// Send the server's stdout and stderr to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Ask the server to stop and wait until it has
    Shutdown {
        /// Close sessions without waiting for in-flight requests
        #[arg(long)]
        forceful: bool,
    },
    /// Kill the server process and remove its resources
    Kill,
    /// Report the server status
    Status,
    #[command(subcommand)]
    Backup(BackupCommand),
    #[command(subcommand)]
    Restore(RestoreCommand),
    #[command(subcommand)]
    Session(SessionCommand),
    #[command(subcommand)]
    Dbstats(DbstatsCommand),
    #[command(subcommand)]
    Request(RequestCommand),
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Pin a backup and list the files it covers
    Create {
        dir: PathBuf,
        #[arg(long)]
        label: Option<String>,
    },
    /// Estimate the size of a backup
    Estimate,
}

#[derive(Subcommand, Debug)]
enum RestoreCommand {
    /// Restore from a backup directory
    Backup {
        dir: PathBuf,
        /// Keep the backup directory after restoring
        #[arg(long)]
        keep_backup: bool,
    },
    /// Restore a tagged snapshot
    Tag { name: String },
}

#[derive(ClapArgs, Debug)]
struct SessionTarget {
    /// Session id (optionally prefixed with ':') or label
    session: String,
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    List,
    Show(SessionTarget),
    Shutdown {
        #[command(flatten)]
        target: SessionTarget,
        #[arg(long)]
        forceful: bool,
    },
    /// Set a session variable; omit the value to unset it
    Set {
        #[command(flatten)]
        target: SessionTarget,
        name: String,
        value: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum DbstatsCommand {
    List,
    Show,
}

#[derive(Subcommand, Debug)]
enum RequestCommand {
    List {
        #[arg(long)]
        session: Option<String>,
    },
    Payload {
        session: String,
        request: u64,
    },
    ExtractSql {
        session: String,
        request: u64,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tgctl: {:#}", e);
            classify(&e)
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Exit status for an error that escaped a command.
fn classify(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<TgError>() {
        Some(e) if e.is_config_error() => exit_code::CONFIG_ERROR,
        Some(TgError::Timeout(_)) => exit_code::TIMED_OUT,
        _ => exit_code::FAILURE,
    }
}

fn run(args: Args) -> Result<i32> {
    let config_path = match args.conf.clone().or_else(platform::default_config_path) {
        Some(path) => path,
        None => {
            return Err(TgError::Config {
                message: "no configuration file given and no default location".into(),
            }
            .into())
        }
    };
    let config = InstanceConfig::load(&config_path)?;
    debug!("Using configuration {}", config.config_path().display());

    let mut monitor: Box<dyn Monitor> = match &args.monitor {
        Some(path) => Box::new(JsonLinesMonitor::create(path)?),
        None => Box::new(NullMonitor),
    };

    let timeout = |default: Duration| match args.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => Some(default),
    };

    match &args.command {
        Command::Start {
            force,
            server,
            log_file,
        } => {
            let binary = ServerLauncher::locate(server.as_deref())?;
            let mut launch = LaunchConfig::new(binary, config.config_path());
            if let Some(log_file) = log_file {
                launch = launch.with_log_file(log_file);
            }
            let options = SupervisorOptions::default()
                .with_timeout(timeout(SupervisorConfig::DEFAULT_START_TIMEOUT));
            let outcome =
                Supervisor::new(&config, options).start(&launch, *force, monitor.as_mut());
            Ok(report(&outcome))
        }
        Command::Shutdown { forceful } => {
            let kind = if *forceful {
                ShutdownRequest::Forceful
            } else {
                ShutdownRequest::Graceful
            };
            let options = SupervisorOptions::default()
                .with_timeout(timeout(SupervisorConfig::DEFAULT_SHUTDOWN_TIMEOUT));
            let outcome = Supervisor::new(&config, options).shutdown(kind, monitor.as_mut());
            Ok(report(&outcome))
        }
        Command::Kill => {
            let options =
                SupervisorOptions::default().with_timeout(timeout(SupervisorConfig::KILL_TIMEOUT));
            let outcome = Supervisor::new(&config, options).kill(monitor.as_mut());
            Ok(report(&outcome))
        }
        Command::Status => {
            let supervisor = Supervisor::new(&config, SupervisorOptions::default());
            let (status, _) = supervisor.status(monitor.as_mut());
            println!("{}", status);
            Ok(exit_code::SUCCESS)
        }
        command => {
            let options = connect_options(&args)?
                .with_timeout(timeout(tgctl_core::TransportConfig::CONNECT_TIMEOUT));
            admin(&config, options, command, monitor.as_mut())
        }
    }
}

fn connect_options(args: &Args) -> Result<ConnectOptions> {
    let credential = match args.auth {
        AuthMode::None => CredentialSource::None,
        AuthMode::Token => match &args.auth_token {
            Some(token) => CredentialSource::Token(token.clone()),
            None => {
                return Err(TgError::Validation {
                    field: "auth-token".into(),
                    message: "--auth token requires --auth-token".into(),
                }
                .into())
            }
        },
    };
    Ok(ConnectOptions::new("tgctl").with_credential(credential))
}

fn report(outcome: &Outcome) -> i32 {
    match outcome.kind {
        OutcomeKind::Success | OutcomeKind::NotRunning => println!("{}", outcome.reason),
        _ => eprintln!("tgctl: {}", outcome),
    }
    outcome.exit_code()
}

/// Run one administrative command over a fresh session.
fn admin(
    config: &InstanceConfig,
    options: ConnectOptions,
    command: &Command,
    monitor: &mut dyn Monitor,
) -> Result<i32> {
    let operation = admin_operation(command);
    monitor.start(operation);

    let result = AdminClient::connect(config, options)
        .and_then(|client| {
            let value = admin_call(&client, command)?;
            client.disconnect()?;
            Ok(value)
        })
        .with_context(|| format!("{} failed", operation));

    match result {
        Ok(value) => {
            monitor.status(value.clone());
            monitor.finish(&Outcome::success(operation));
            match value {
                serde_json::Value::String(text) => println!("{}", text),
                serde_json::Value::Null => {}
                other => println!("{}", serde_json::to_string_pretty(&other)?),
            }
            Ok(exit_code::SUCCESS)
        }
        Err(e) => {
            let outcome = match e.downcast_ref::<TgError>() {
                Some(TgError::Timeout(_)) => {
                    Outcome::new(OutcomeKind::TimedOut, format!("{:#}", e))
                }
                _ => Outcome::failed(format!("{:#}", e)),
            };
            monitor.finish(&outcome);
            Err(e)
        }
    }
}

fn admin_operation(command: &Command) -> &'static str {
    match command {
        Command::Backup(BackupCommand::Create { .. }) => "backup create",
        Command::Backup(BackupCommand::Estimate) => "backup estimate",
        Command::Restore(RestoreCommand::Backup { .. }) => "restore backup",
        Command::Restore(RestoreCommand::Tag { .. }) => "restore tag",
        Command::Session(SessionCommand::List) => "session list",
        Command::Session(SessionCommand::Show(_)) => "session show",
        Command::Session(SessionCommand::Shutdown { .. }) => "session shutdown",
        Command::Session(SessionCommand::Set { .. }) => "session set",
        Command::Dbstats(DbstatsCommand::List) => "dbstats list",
        Command::Dbstats(DbstatsCommand::Show) => "dbstats show",
        Command::Request(RequestCommand::List { .. }) => "request list",
        Command::Request(RequestCommand::Payload { .. }) => "request payload",
        Command::Request(RequestCommand::ExtractSql { .. }) => "request extract-sql",
        Command::Start { .. } => "start",
        Command::Shutdown { .. } => "shutdown",
        Command::Kill => "kill",
        Command::Status => "status",
    }
}

fn to_json<T: Serialize>(value: &T) -> tgctl_core::Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn admin_call(client: &AdminClient, command: &Command) -> tgctl_core::Result<serde_json::Value> {
    match command {
        Command::Backup(BackupCommand::Create { dir, label }) => {
            let report: BackupReport = client.backup_create(dir, label.clone())?;
            to_json(&report)
        }
        Command::Backup(BackupCommand::Estimate) => to_json(&client.backup_estimate()?),
        Command::Restore(RestoreCommand::Backup { dir, keep_backup }) => {
            client.restore(RestoreSource::Backup {
                directory: dir.clone(),
                keep_backup: *keep_backup,
            })?;
            Ok(serde_json::Value::String("restore accepted".into()))
        }
        Command::Restore(RestoreCommand::Tag { name }) => {
            client.restore(RestoreSource::Tag { name: name.clone() })?;
            Ok(serde_json::Value::String("restore accepted".into()))
        }
        Command::Session(SessionCommand::List) => to_json(&client.session_list()?),
        Command::Session(SessionCommand::Show(target)) => {
            to_json(&client.session_show(&target.session)?)
        }
        Command::Session(SessionCommand::Shutdown { target, forceful }) => {
            let kind = if *forceful {
                SessionShutdownKind::Forceful
            } else {
                SessionShutdownKind::Graceful
            };
            client.session_shutdown(&target.session, kind)?;
            Ok(serde_json::Value::Null)
        }
        Command::Session(SessionCommand::Set {
            target,
            name,
            value,
        }) => {
            client.session_set(&target.session, name, value.clone())?;
            Ok(serde_json::Value::Null)
        }
        Command::Dbstats(DbstatsCommand::List) => to_json(&client.dbstats_list()?),
        Command::Dbstats(DbstatsCommand::Show) => to_json(&client.dbstats_show()?),
        Command::Request(RequestCommand::List { session }) => {
            to_json(&client.request_list(session.clone())?)
        }
        Command::Request(RequestCommand::Payload { session, request }) => Ok(
            serde_json::Value::String(client.request_payload(session, *request)?),
        ),
        Command::Request(RequestCommand::ExtractSql { session, request }) => Ok(
            serde_json::Value::String(client.request_extract_sql(session, *request)?),
        ),
        Command::Start { .. } | Command::Shutdown { .. } | Command::Kill | Command::Status => Err(
            TgError::Other("lifecycle commands do not run over a session".into()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_parse_lifecycle_commands() {
        let args =
            Args::try_parse_from(["tgctl", "--conf", "a.json", "start", "--force"]).unwrap();
        assert!(matches!(args.command, Command::Start { force: true, .. }));
        assert_eq!(args.conf, Some(PathBuf::from("a.json")));

        let args =
            Args::try_parse_from(["tgctl", "shutdown", "--forceful", "--timeout", "0"]).unwrap();
        assert!(matches!(args.command, Command::Shutdown { forceful: true }));
        assert_eq!(args.timeout, Some(0));
    }

    #[test]
    fn test_parse_admin_commands() {
        let args =
            Args::try_parse_from(["tgctl", "session", "set", ":3", "timeout", "30"]).unwrap();
        match args.command {
            Command::Session(SessionCommand::Set {
                target,
                name,
                value,
            }) => {
                assert_eq!(target.session, ":3");
                assert_eq!(name, "timeout");
                assert_eq!(value.as_deref(), Some("30"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let args =
            Args::try_parse_from(["tgctl", "request", "extract-sql", "batch", "12"]).unwrap();
        assert_eq!(admin_operation(&args.command), "request extract-sql");

        let args = Args::try_parse_from(["tgctl", "--auth", "token", "dbstats", "show"]).unwrap();
        assert_eq!(args.auth, AuthMode::Token);
        assert!(connect_options(&args).is_err());
    }

    #[test]
    fn test_classify_config_errors() {
        let err: anyhow::Error = TgError::Config {
            message: "missing".into(),
        }
        .into();
        assert_eq!(classify(&err), exit_code::CONFIG_ERROR);
        let err: anyhow::Error = TgError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(classify(&err), exit_code::TIMED_OUT);
        assert_eq!(classify(&anyhow!("other")), exit_code::FAILURE);
    }
}
