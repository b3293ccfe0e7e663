//! Reference administrative service hosted by `tgserver`.
//!
//! Answers the datastore, session, metrics and request-inspection services
//! plus a small `Query` surface that streams rows through a resultset. Data
//! files are whatever lives under the configured data location; backups pin
//! a file list but copy nothing.

use crate::config::{InstanceConfig, ServerConfig};
use crate::error::{Result, TgError};
use crate::platform;
use crate::transport::{
    DiagnosticCode, Dispatch, MetricsItem, Request, RequestContext, Response, RestoreSource,
    SessionRecord,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const METRICS: &[(&str, &str)] = &[
    ("server.pid", "process id of the server"),
    ("server.uptime_secs", "seconds since the server started"),
    ("session.count", "sessions currently admitted"),
    ("session.max", "configured admission capacity"),
    ("process.memory_bytes", "resident memory of the server process"),
    ("process.cpu_usage", "CPU usage of the server process in percent"),
    ("system.memory_total_bytes", "total memory of the host"),
    ("data.file_count", "files under the data location"),
    ("data.total_bytes", "bytes under the data location"),
];

struct ProcessStats {
    system: System,
    refreshed: Option<Instant>,
}

/// Administrative [`Dispatch`] implementation.
pub struct AdminService {
    started_at: DateTime<Utc>,
    next_backup_id: AtomicU64,
    backups: Mutex<BTreeMap<u64, Option<String>>>,
    stats: Mutex<ProcessStats>,
}

impl Default for AdminService {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminService {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            next_backup_id: AtomicU64::new(1),
            backups: Mutex::new(BTreeMap::new()),
            stats: Mutex::new(ProcessStats {
                system: System::new(),
                refreshed: None,
            }),
        }
    }

    fn backups(&self) -> Result<MutexGuard<'_, BTreeMap<u64, Option<String>>>> {
        self.backups
            .lock()
            .map_err(|_| TgError::Other("backup table lock poisoned".into()))
    }

    fn backup_begin(&self, config: &InstanceConfig, label: Option<String>) -> Result<Response> {
        let files = data_files(config)?
            .into_iter()
            .map(|(path, _)| path)
            .collect::<Vec<_>>();
        let backup_id = self.next_backup_id.fetch_add(1, Ordering::Relaxed);
        info!(
            "Backup {} begun ({} files, label {:?})",
            backup_id,
            files.len(),
            label
        );
        self.backups()?.insert(backup_id, label);
        Ok(Response::BackupBegun { backup_id, files })
    }

    fn backup_end(&self, backup_id: u64) -> Result<Response> {
        match self.backups()?.remove(&backup_id) {
            Some(_) => {
                info!("Backup {} ended", backup_id);
                Ok(Response::BackupEnded)
            }
            None => Err(TgError::transport(
                DiagnosticCode::NotFound,
                format!("no active backup {}", backup_id),
            )),
        }
    }

    fn restore(&self, source: RestoreSource) -> Result<Response> {
        match &source {
            RestoreSource::Backup { directory, .. } if !directory.is_dir() => {
                return Err(TgError::transport(
                    DiagnosticCode::NotFound,
                    format!("backup directory {} does not exist", directory.display()),
                ));
            }
            RestoreSource::Tag { name } if name.trim().is_empty() => {
                return Err(TgError::transport(
                    DiagnosticCode::InvalidRequest,
                    "tag name is empty",
                ));
            }
            _ => {}
        }
        info!("Restore accepted from {:?}", source);
        Ok(Response::Restored)
    }

    fn metrics(&self, ctx: &RequestContext<'_>, with_values: bool) -> Result<Vec<MetricsItem>> {
        let values = if with_values {
            self.metric_values(ctx)?
        } else {
            BTreeMap::new()
        };
        Ok(METRICS
            .iter()
            .map(|(key, description)| MetricsItem {
                key: key.to_string(),
                description: description.to_string(),
                value: values.get(*key).cloned(),
            })
            .collect())
    }

    fn metric_values(&self, ctx: &RequestContext<'_>) -> Result<BTreeMap<&'static str, Value>> {
        let pid = platform::current_pid();
        let mut values = BTreeMap::new();
        values.insert("server.pid", json!(pid));
        values.insert(
            "server.uptime_secs",
            json!((Utc::now() - self.started_at).num_seconds().max(0)),
        );
        values.insert("session.count", json!(ctx.registry().len()));
        values.insert(
            "session.max",
            json!(ctx.config().document().session.max_sessions),
        );

        {
            let mut stats = self
                .stats
                .lock()
                .map_err(|_| TgError::Other("process statistics lock poisoned".into()))?;
            let stale = stats
                .refreshed
                .map(|t| t.elapsed() >= ServerConfig::STATS_CACHE_TTL)
                .unwrap_or(true);
            let sysinfo_pid = Pid::from_u32(pid);
            if stale {
                stats.system.refresh_memory();
                stats.system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[sysinfo_pid]),
                    true,
                    ProcessRefreshKind::new().with_cpu().with_memory(),
                );
                stats.refreshed = Some(Instant::now());
            }
            if let Some(process) = stats.system.process(sysinfo_pid) {
                values.insert("process.memory_bytes", json!(process.memory()));
                values.insert("process.cpu_usage", json!(process.cpu_usage()));
            }
            values.insert(
                "system.memory_total_bytes",
                json!(stats.system.total_memory()),
            );
        }

        if ctx.config().data_location().is_some() {
            match data_files(ctx.config()) {
                Ok(files) => {
                    values.insert("data.file_count", json!(files.len()));
                    values.insert(
                        "data.total_bytes",
                        json!(files.iter().map(|(_, len)| len).sum::<u64>()),
                    );
                }
                Err(e) => warn!("Cannot measure data location: {}", e),
            }
        }
        Ok(values)
    }

    fn requests(&self, ctx: &RequestContext<'_>, session: Option<String>) -> Result<Response> {
        let records: Vec<Arc<SessionRecord>> = match session {
            Some(specifier) => vec![ctx.registry().find(&specifier)?],
            None => ctx.registry().all(),
        };
        let mut requests = Vec::new();
        for record in records {
            requests.extend(record.request_infos()?);
        }
        Ok(Response::Requests { requests })
    }

    /// Open a resultset and stream one JSON document per row from a writer
    /// thread. The writer is claimed before answering, so the client never
    /// sees end-of-resultset ahead of the rows.
    fn query(&self, ctx: &RequestContext<'_>, sql: &str) -> Result<Response> {
        let rows = match table_name(sql).as_deref() {
            Some("metrics") => self
                .metrics(ctx, true)?
                .into_iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<Vec<_>, _>>()?,
            Some("sessions") => ctx
                .registry()
                .infos()?
                .into_iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<Vec<_>, _>>()?,
            Some("requests") => match self.requests(ctx, None)? {
                Response::Requests { requests } => requests
                    .into_iter()
                    .map(serde_json::to_value)
                    .collect::<std::result::Result<Vec<_>, _>>()?,
                _ => Vec::new(),
            },
            _ => {
                return Err(TgError::transport(
                    DiagnosticCode::InvalidRequest,
                    format!("unsupported statement: {}", sql),
                ))
            }
        };

        let mut handle = ctx.open_resultset()?;
        let mut writer = handle.acquire_writer()?;
        let index = handle.index();
        debug!("Streaming {} rows on resultset {}", rows.len(), index);
        std::thread::Builder::new()
            .name(format!("tgctl-resultset-{}", index))
            .spawn(move || {
                let streamed = rows.iter().try_for_each(|row| {
                    let mut line = serde_json::to_vec(row)?;
                    line.push(b'\n');
                    writer.write(&line)
                });
                let released = streamed.and_then(|()| writer.release());
                if let Err(e) = released.and_then(|()| handle.close()) {
                    warn!("Resultset {} stream failed: {}", index, e);
                }
            })?;
        Ok(Response::ResultsetOpened { index })
    }
}

/// Table addressed by `<table>` or `select * from <table>`.
fn table_name(sql: &str) -> Option<String> {
    let normalized = sql.trim().trim_end_matches(';').to_ascii_lowercase();
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    match tokens.as_slice() {
        [table] => Some(table.to_string()),
        ["select", "*", "from", table] => Some(table.to_string()),
        _ => None,
    }
}

/// Files under the data location, relative to it, with their sizes.
fn data_files(config: &InstanceConfig) -> Result<Vec<(PathBuf, u64)>> {
    let root = config.data_location().ok_or_else(|| {
        TgError::transport(DiagnosticCode::NotFound, "no data location is configured")
    })?;
    if !root.is_dir() {
        return Err(TgError::transport(
            DiagnosticCode::NotFound,
            format!("data location {} does not exist", root.display()),
        ));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let relative = entry
            .path()
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| entry.path().to_path_buf());
        files.push((relative, len));
    }
    Ok(files)
}

impl Dispatch for AdminService {
    fn dispatch(&self, ctx: &RequestContext<'_>, request: Request) -> Result<Response> {
        match request {
            Request::BackupBegin { label } => self.backup_begin(ctx.config(), label),
            Request::BackupEnd { backup_id } => self.backup_end(backup_id),
            Request::BackupEstimate => {
                let files = data_files(ctx.config())?;
                Ok(Response::BackupEstimate {
                    file_count: files.len() as u64,
                    total_bytes: files.iter().map(|(_, len)| len).sum(),
                })
            }
            Request::Restore { source } => self.restore(source),
            Request::SessionList => Ok(Response::Sessions {
                sessions: ctx.registry().infos()?,
            }),
            Request::SessionGet { specifier } => Ok(Response::Session {
                session: ctx.registry().find(&specifier)?.info()?,
            }),
            Request::SessionShutdown { specifier, kind } => {
                let record = ctx.registry().find(&specifier)?;
                record.request_shutdown(kind)?;
                info!(
                    "Session {} asked to shut down ({:?})",
                    record.session_id(),
                    kind
                );
                Ok(Response::SessionShutdownRequested)
            }
            Request::SessionSetVariable {
                specifier,
                name,
                value,
            } => {
                ctx.registry().find(&specifier)?.set_variable(&name, value)?;
                Ok(Response::VariableSet)
            }
            Request::StatsList => Ok(Response::Stats {
                items: self.metrics(ctx, false)?,
            }),
            Request::StatsShow => Ok(Response::Stats {
                items: self.metrics(ctx, true)?,
            }),
            Request::RequestList { session } => self.requests(ctx, session),
            Request::RequestPayload {
                session,
                request_id,
            } => {
                let record = ctx.registry().find(&session)?;
                match record.request_payload(request_id)? {
                    Some(payload) => Ok(Response::RequestPayload { payload }),
                    None => Err(TgError::transport(
                        DiagnosticCode::NotFound,
                        format!(
                            "no request {} in flight on session {}",
                            request_id,
                            record.session_id()
                        ),
                    )),
                }
            }
            Request::Query { sql } => self.query(ctx, &sql),
            other => Err(TgError::transport(
                DiagnosticCode::InvalidRequest,
                format!("{} is not an administrative request", other.name()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use tempfile::TempDir;

    #[test]
    fn test_table_name() {
        assert_eq!(table_name("metrics").as_deref(), Some("metrics"));
        assert_eq!(
            table_name("  SELECT * FROM Sessions; ").as_deref(),
            Some("sessions")
        );
        assert_eq!(table_name("select a from b"), None);
        assert_eq!(table_name(""), None);
    }

    #[test]
    fn test_data_files_are_relative_and_sorted() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(data.join("wal")).unwrap();
        std::fs::write(data.join("b.db"), vec![0u8; 10]).unwrap();
        std::fs::write(data.join("a.db"), vec![0u8; 4]).unwrap();
        std::fs::write(data.join("wal").join("0001.log"), vec![0u8; 3]).unwrap();

        let path = dir.path().join("tg.json");
        std::fs::write(&path, "").unwrap();
        let config = InstanceConfig::from_document(
            &path,
            ConfigDocument {
                data_location: Some(data),
                ..Default::default()
            },
        )
        .unwrap();

        let files = data_files(&config).unwrap();
        let names: Vec<_> = files.iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.db"),
                PathBuf::from("b.db"),
                PathBuf::from("wal/0001.log")
            ]
        );
        assert_eq!(files.iter().map(|(_, len)| len).sum::<u64>(), 17);
    }

    #[test]
    fn test_data_files_require_location() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tg.json");
        std::fs::write(&path, "").unwrap();
        let config = InstanceConfig::from_document(&path, ConfigDocument::default()).unwrap();
        let err = data_files(&config).unwrap_err();
        assert_eq!(err.to_diagnostic_code(), DiagnosticCode::NotFound);
    }

    #[test]
    fn test_backup_ids_are_tracked() {
        let service = AdminService::new();
        assert!(service.backup_end(7).is_err());
        service.backups().unwrap().insert(7, None);
        assert_eq!(service.backup_end(7).unwrap(), Response::BackupEnded);
        assert!(service.backup_end(7).is_err());
    }

    #[test]
    fn test_restore_validates_source() {
        let dir = TempDir::new().unwrap();
        let service = AdminService::new();
        assert!(service
            .restore(RestoreSource::Backup {
                directory: dir.path().join("missing"),
                keep_backup: false,
            })
            .is_err());
        assert!(service
            .restore(RestoreSource::Tag {
                name: "  ".into()
            })
            .is_err());
        assert_eq!(
            service
                .restore(RestoreSource::Backup {
                    directory: dir.path().to_path_buf(),
                    keep_backup: true,
                })
                .unwrap(),
            Response::Restored
        );
    }
}
