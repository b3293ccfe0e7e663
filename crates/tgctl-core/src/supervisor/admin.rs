//! Administrative commands carried over a client session.

use crate::config::InstanceConfig;
use crate::error::{Result, TgError};
use crate::transport::{
    ConnectOptions, DiagnosticCode, MetricsItem, Request, RequestInfo, Response, RestoreSource,
    Session, SessionInfo, SessionShutdownKind,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Files a backup covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub backup_id: u64,
    pub destination: PathBuf,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackupEstimate {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Client for the datastore, session, metrics and request services.
#[derive(Debug)]
pub struct AdminClient {
    session: Session,
}

impl AdminClient {
    pub fn connect(config: &InstanceConfig, options: ConnectOptions) -> Result<Self> {
        Ok(Self {
            session: Session::connect(config, options)?,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Begin and immediately end a backup, reporting the file list the
    /// server pinned for it.
    pub fn backup_create(&self, destination: &Path, label: Option<String>) -> Result<BackupReport> {
        let (backup_id, files) = match self.session.call(Request::BackupBegin { label })? {
            Response::BackupBegun { backup_id, files } => (backup_id, files),
            other => return Err(unexpected(&other)),
        };
        expect(
            self.session.call(Request::BackupEnd { backup_id })?,
            |r| matches!(r, Response::BackupEnded),
        )?;
        info!("Backup {} covers {} files", backup_id, files.len());
        Ok(BackupReport {
            backup_id,
            destination: destination.to_path_buf(),
            files,
        })
    }

    pub fn backup_estimate(&self) -> Result<BackupEstimate> {
        match self.session.call(Request::BackupEstimate)? {
            Response::BackupEstimate {
                file_count,
                total_bytes,
            } => Ok(BackupEstimate {
                file_count,
                total_bytes,
            }),
            other => Err(unexpected(&other)),
        }
    }

    pub fn restore(&self, source: RestoreSource) -> Result<()> {
        expect(self.session.call(Request::Restore { source })?, |r| {
            matches!(r, Response::Restored)
        })
    }

    pub fn session_list(&self) -> Result<Vec<SessionInfo>> {
        match self.session.call(Request::SessionList)? {
            Response::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(&other)),
        }
    }

    pub fn session_show(&self, specifier: &str) -> Result<SessionInfo> {
        let request = Request::SessionGet {
            specifier: specifier.to_string(),
        };
        match self.session.call(request)? {
            Response::Session { session } => Ok(session),
            other => Err(unexpected(&other)),
        }
    }

    pub fn session_shutdown(&self, specifier: &str, kind: SessionShutdownKind) -> Result<()> {
        let request = Request::SessionShutdown {
            specifier: specifier.to_string(),
            kind,
        };
        expect(self.session.call(request)?, |r| {
            matches!(r, Response::SessionShutdownRequested)
        })
    }

    /// Set a session variable; `None` unsets it.
    pub fn session_set(&self, specifier: &str, name: &str, value: Option<String>) -> Result<()> {
        let request = Request::SessionSetVariable {
            specifier: specifier.to_string(),
            name: name.to_string(),
            value,
        };
        expect(self.session.call(request)?, |r| {
            matches!(r, Response::VariableSet)
        })
    }

    pub fn dbstats_list(&self) -> Result<Vec<MetricsItem>> {
        self.stats(Request::StatsList)
    }

    pub fn dbstats_show(&self) -> Result<Vec<MetricsItem>> {
        self.stats(Request::StatsShow)
    }

    fn stats(&self, request: Request) -> Result<Vec<MetricsItem>> {
        match self.session.call(request)? {
            Response::Stats { items } => Ok(items),
            other => Err(unexpected(&other)),
        }
    }

    pub fn request_list(&self, session: Option<String>) -> Result<Vec<RequestInfo>> {
        match self.session.call(Request::RequestList { session })? {
            Response::Requests { requests } => Ok(requests),
            other => Err(unexpected(&other)),
        }
    }

    pub fn request_payload(&self, session: &str, request_id: u64) -> Result<String> {
        let request = Request::RequestPayload {
            session: session.to_string(),
            request_id,
        };
        match self.session.call(request)? {
            Response::RequestPayload { payload } => Ok(payload),
            other => Err(unexpected(&other)),
        }
    }

    pub fn request_extract_sql(&self, session: &str, request_id: u64) -> Result<String> {
        extract_sql(&self.request_payload(session, request_id)?)
    }

    pub fn disconnect(self) -> Result<()> {
        self.session.disconnect()
    }
}

/// Pull the statement text out of a request payload document.
pub fn extract_sql(payload: &str) -> Result<String> {
    let document: serde_json::Value = serde_json::from_str(payload)?;
    find_sql(&document).map(str::to_string).ok_or_else(|| {
        TgError::transport(DiagnosticCode::NotFound, "request payload carries no SQL text")
    })
}

fn find_sql(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::Object(map) => map
            .get("sql")
            .and_then(|v| v.as_str())
            .or_else(|| map.values().find_map(find_sql)),
        serde_json::Value::Array(items) => items.iter().find_map(find_sql),
        _ => None,
    }
}

fn expect(response: Response, accept: impl FnOnce(&Response) -> bool) -> Result<()> {
    if accept(&response) {
        Ok(())
    } else {
        Err(unexpected(&response))
    }
}

fn unexpected(response: &Response) -> TgError {
    TgError::MalformedFrame {
        message: format!("unexpected response {:?}", response),
    }
}
