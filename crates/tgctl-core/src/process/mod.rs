//! Server process launching.
//!
//! The supervisor spawns the server detached (new session, stdio to an
//! optional log file) and then watches it only through the lock file and the
//! status block, plus the child handle to notice an early exit.

mod launcher;

pub use launcher::{LaunchConfig, LaunchedServer, ServerLauncher};
