//! tgctl Core - control plane for a standalone database server.
//!
//! This crate supervises exactly one server process per configuration file
//! and carries administrative traffic to it. It has two halves:
//!
//! - a cross-process liveness protocol: an advisory [`LockFile`] naming the
//!   owner PID plus a shared-memory [`StatusBlock`] publishing the server's
//!   lifecycle and a one-shot shutdown request;
//! - a shared-memory transport: an admission queue, per-session request and
//!   response rings with a K-slot correlation table, W-wire resultset
//!   streaming and session keep-alive.
//!
//! # Example
//!
//! ```rust,ignore
//! use tgctl_core::{InstanceConfig, NullMonitor, Supervisor, SupervisorOptions};
//!
//! fn main() -> tgctl_core::Result<()> {
//!     let config = InstanceConfig::load("/etc/tgctl/tgctl.json")?;
//!     let supervisor = Supervisor::new(&config, SupervisorOptions::default());
//!
//!     let (status, _) = supervisor.status(&mut NullMonitor);
//!     println!("server is {}", status);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod lock;
pub mod platform;
pub mod process;
pub mod server;
pub mod shm;
pub mod status;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{
    ConfigDocument, InstanceConfig, ServerConfig, ShmConfig, SupervisorConfig, TransportConfig,
};
pub use error::{Result, TgError};
pub use lock::{AdvisoryLock, LockFile, LockState, PidRecord};
pub use process::{LaunchConfig, LaunchedServer, ServerLauncher};
pub use server::{AdminService, ServerInstance};
pub use status::{LifecycleState, ShutdownRequest, StatusBlock, StatusProbe, StatusSnapshot};
pub use supervisor::{
    exit_code, AdminClient, JsonLinesMonitor, Monitor, NullMonitor, Outcome, OutcomeKind,
    ProbeReport, ServerStatus, Supervisor, SupervisorOptions,
};
pub use transport::{
    AcceptAll, Authenticator, ConnectOptions, CredentialSource, Dispatch, EndpointServer,
    Session, TokenAuthenticator,
};
