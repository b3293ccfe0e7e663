//! Server-side bookkeeping of admitted sessions and their in-flight requests.

use super::protocol::{
    ClientInfo, DiagnosticCode, RequestInfo, ServiceId, SessionInfo, SessionShutdownKind,
};
use super::wire::{now_ms, SessionWire};
use crate::error::{Result, TgError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

fn poisoned() -> TgError {
    TgError::Other("session registry lock poisoned".into())
}

#[derive(Debug, Clone, Default)]
struct Details {
    label: Option<String>,
    application: String,
    user: Option<String>,
    connection_information: String,
    variables: BTreeMap<String, String>,
    shutdown: Option<SessionShutdownKind>,
}

#[derive(Debug, Clone)]
struct InFlight {
    service: ServiceId,
    kind: String,
    payload: String,
    started_at: DateTime<Utc>,
}

/// One admitted session.
#[derive(Debug)]
pub struct SessionRecord {
    session_id: u64,
    admission_slot: u32,
    started_at: DateTime<Utc>,
    wire: Arc<SessionWire>,
    details: Mutex<Details>,
    requests: Mutex<BTreeMap<u64, InFlight>>,
    next_request_id: AtomicU64,
}

impl SessionRecord {
    pub fn new(session_id: u64, admission_slot: u32, wire: Arc<SessionWire>) -> Self {
        Self {
            session_id,
            admission_slot,
            started_at: Utc::now(),
            wire,
            details: Mutex::new(Details::default()),
            requests: Mutex::new(BTreeMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    fn details(&self) -> Result<MutexGuard<'_, Details>> {
        self.details.lock().map_err(|_| poisoned())
    }

    fn requests(&self) -> Result<MutexGuard<'_, BTreeMap<u64, InFlight>>> {
        self.requests.lock().map_err(|_| poisoned())
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn admission_slot(&self) -> u32 {
        self.admission_slot
    }

    pub fn wire(&self) -> &Arc<SessionWire> {
        &self.wire
    }

    pub fn label(&self) -> Option<String> {
        self.details().ok().and_then(|d| d.label.clone())
    }

    /// Record the handshake metadata.
    pub fn identify(&self, client: &ClientInfo, user: Option<String>) -> Result<()> {
        let mut details = self.details()?;
        details.label = client.label.clone();
        details.application = client.application_name.clone();
        details.user = user.or_else(|| client.user_name.clone());
        details.connection_information = client.connection_information.clone();
        Ok(())
    }

    pub fn set_variable(&self, name: &str, value: Option<String>) -> Result<()> {
        let mut details = self.details()?;
        match value {
            Some(value) => {
                details.variables.insert(name.to_string(), value);
            }
            None => {
                details.variables.remove(name);
            }
        }
        Ok(())
    }

    /// Ask the session to end. A forceful request overrides a graceful one.
    pub fn request_shutdown(&self, kind: SessionShutdownKind) -> Result<()> {
        let mut details = self.details()?;
        if details.shutdown != Some(SessionShutdownKind::Forceful) {
            details.shutdown = Some(kind);
        }
        Ok(())
    }

    pub fn shutdown_requested(&self) -> Option<SessionShutdownKind> {
        self.details().ok().and_then(|d| d.shutdown)
    }

    pub fn info(&self) -> Result<SessionInfo> {
        let details = self.details()?.clone();
        Ok(SessionInfo {
            session_id: self.session_id,
            label: details.label,
            application: details.application,
            user: details.user,
            connection_information: details.connection_information,
            started_at: self.started_at,
            expires_in_ms: self.wire.remaining(now_ms()).as_millis() as u64,
            variables: details.variables,
            shutdown: details.shutdown,
        })
    }

    /// Register a request; returns its id.
    pub fn begin_request(&self, service: ServiceId, kind: &str, payload: String) -> Result<u64> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.requests()?.insert(
            id,
            InFlight {
                service,
                kind: kind.to_string(),
                payload,
                started_at: Utc::now(),
            },
        );
        Ok(id)
    }

    pub fn end_request(&self, request_id: u64) {
        if let Ok(mut requests) = self.requests() {
            requests.remove(&request_id);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.requests().map(|r| r.len()).unwrap_or(0)
    }

    pub fn request_infos(&self) -> Result<Vec<RequestInfo>> {
        Ok(self
            .requests()?
            .iter()
            .map(|(id, request)| RequestInfo {
                session_id: self.session_id,
                request_id: *id,
                service: request.service,
                kind: request.kind.clone(),
                started_at: request.started_at,
            })
            .collect())
    }

    pub fn request_payload(&self, request_id: u64) -> Result<Option<String>> {
        Ok(self
            .requests()?
            .get(&request_id)
            .map(|request| request.payload.clone()))
    }
}

/// All sessions of one endpoint.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<u64, Arc<SessionRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: Arc<SessionRecord>) -> Result<()> {
        self.sessions
            .write()
            .map_err(|_| poisoned())?
            .insert(record.session_id(), record);
        Ok(())
    }

    pub fn remove(&self, session_id: u64) -> Option<Arc<SessionRecord>> {
        self.sessions.write().ok()?.remove(&session_id)
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<SessionRecord>> {
        self.sessions.read().ok()?.get(&session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<SessionRecord>> {
        self.sessions
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolve a session by numeric id (optionally prefixed with `:`) or by
    /// label. A label shared by several sessions is ambiguous.
    pub fn find(&self, specifier: &str) -> Result<Arc<SessionRecord>> {
        let numeric = specifier.strip_prefix(':').unwrap_or(specifier);
        if let Ok(id) = numeric.parse::<u64>() {
            if let Some(record) = self.get(id) {
                return Ok(record);
            }
        }

        let mut matches: Vec<_> = self
            .all()
            .into_iter()
            .filter(|r| r.label().as_deref() == Some(specifier))
            .collect();
        match matches.len() {
            0 => Err(not_found(specifier)),
            1 => matches.pop().ok_or_else(|| not_found(specifier)),
            n => Err(TgError::transport(
                DiagnosticCode::InvalidRequest,
                format!("label {} matches {} sessions", specifier, n),
            )),
        }
    }

    pub fn infos(&self) -> Result<Vec<SessionInfo>> {
        self.all().iter().map(|r| r.info()).collect()
    }
}

fn not_found(specifier: &str) -> TgError {
    TgError::transport(
        DiagnosticCode::NotFound,
        format!("no session matches {}", specifier),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wire::WireGeometry;
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(dir: &TempDir, id: u64, label: &str) -> Arc<SessionRecord> {
        let geometry = WireGeometry {
            slot_count: 2,
            frame_count: 4,
            frame_payload: 64,
        };
        let wire = SessionWire::create(
            dir.path().join(format!("db-{}", id)),
            id,
            geometry,
            Duration::from_secs(60),
        )
        .unwrap();
        let record = Arc::new(SessionRecord::new(id, 0, Arc::new(wire)));
        let client = ClientInfo {
            label: Some(label.to_string()),
            application_name: "test".into(),
            ..Default::default()
        };
        record.identify(&client, None).unwrap();
        record
    }

    #[test]
    fn test_find_by_id_and_label() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        registry.insert(record(&dir, 1, "batch")).unwrap();
        registry.insert(record(&dir, 2, "shared")).unwrap();
        registry.insert(record(&dir, 3, "shared")).unwrap();

        assert_eq!(registry.find("1").unwrap().session_id(), 1);
        assert_eq!(registry.find(":2").unwrap().session_id(), 2);
        assert_eq!(registry.find("batch").unwrap().session_id(), 1);
        assert!(registry.find("shared").is_err());
        assert!(registry.find("missing").is_err());
    }

    #[test]
    fn test_requests_are_tracked() {
        let dir = TempDir::new().unwrap();
        let record = record(&dir, 1, "a");
        let id = record
            .begin_request(ServiceId::Sql, "query", "{\"sql\":\"select 1\"}".into())
            .unwrap();
        assert_eq!(record.in_flight(), 1);
        assert_eq!(record.request_infos().unwrap()[0].kind, "query");
        assert!(record.request_payload(id).unwrap().unwrap().contains("select 1"));

        record.end_request(id);
        assert_eq!(record.in_flight(), 0);
        assert!(record.request_payload(id).unwrap().is_none());
    }

    #[test]
    fn test_forceful_shutdown_sticks() {
        let dir = TempDir::new().unwrap();
        let record = record(&dir, 1, "a");
        record.request_shutdown(SessionShutdownKind::Forceful).unwrap();
        record.request_shutdown(SessionShutdownKind::Graceful).unwrap();
        assert_eq!(record.shutdown_requested(), Some(SessionShutdownKind::Forceful));
    }

    #[test]
    fn test_variables_set_and_unset() {
        let dir = TempDir::new().unwrap();
        let record = record(&dir, 1, "a");
        record.set_variable("timeout", Some("30".into())).unwrap();
        assert_eq!(record.info().unwrap().variables.get("timeout").unwrap(), "30");
        record.set_variable("timeout", None).unwrap();
        assert!(record.info().unwrap().variables.is_empty());
    }
}
