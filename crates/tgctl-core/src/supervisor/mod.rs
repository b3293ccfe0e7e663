//! Supervisor: lifecycle control of one configuration's server and the
//! administrative commands issued to it.
//!
//! Lifecycle operations ([`Supervisor`]) only ever touch the lock file and
//! the status block; they never need a session. Administrative operations
//! ([`AdminClient`]) run over a client session. Both report a single
//! [`Outcome`] to the caller and progress events to a [`Monitor`].

mod admin;
mod control;
mod monitor;
mod outcome;
mod probe;

pub use admin::{extract_sql, AdminClient, BackupEstimate, BackupReport};
pub use control::{Supervisor, SupervisorOptions};
pub use monitor::{JsonLinesMonitor, Monitor, NullMonitor, MONITOR_FORMAT};
pub use outcome::{exit_code, Outcome, OutcomeKind};
pub use probe::{ProbeReport, SegmentView, ServerStatus};
