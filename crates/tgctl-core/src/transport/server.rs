//! Endpoint server: admits sessions and serves their requests.
//!
//! A listener thread takes connection requests from the admission queue,
//! creates a session wire for each and hands it to a session thread. The
//! session thread reads requests, answers endpoint-level requests itself and
//! runs everything else through the [`Dispatch`] implementation on one
//! thread per request (at most K per session, bounded by the client's slot
//! table). Sessions end on disconnect, expiration, a session shutdown
//! request, peer death or endpoint shutdown; teardown frees every resource
//! the session held.

use super::admission::{AdmissionQueue, PendingConnection};
use super::handshake::Authenticator;
use super::protocol::{
    self, DiagnosticCode, Envelope, FrameKind, Request, Response, ServiceId, SessionShutdownKind,
};
use super::registry::{SessionRecord, SessionRegistry};
use super::resultset::{ResultsetHandle, ResultsetSet};
use super::ring::Message;
use super::wire::{now_ms, PeerWatch, SessionWire, WireState};
use crate::cancel::CancellationToken;
use crate::config::{InstanceConfig, TransportConfig};
use crate::error::{Result, TgError};
use crate::shm::{Liveness, ProcessLiveness, WaitPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Handles every request that is not part of the endpoint protocol itself.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, ctx: &RequestContext<'_>, request: Request) -> Result<Response>;
}

/// What a dispatched request can see of its session.
pub struct RequestContext<'a> {
    session: &'a SessionContext,
    request_id: u64,
}

impl RequestContext<'_> {
    pub fn session(&self) -> &Arc<SessionRecord> {
        &self.session.record
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.session.endpoint.registry
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.session.endpoint.config
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Open a resultset on this session, creating the session's resultset
    /// segment on first use. The caller announces the returned index in its
    /// response and streams from another thread.
    pub fn open_resultset(&self) -> Result<ResultsetHandle> {
        self.session.resultsets()?.open_resultset()
    }
}

struct EndpointShared {
    config: InstanceConfig,
    admission: AdmissionQueue,
    registry: Arc<SessionRegistry>,
    authenticator: Arc<dyn Authenticator>,
    dispatch: Arc<dyn Dispatch>,
    cancel: CancellationToken,
    sessions: Mutex<Vec<JoinHandle<()>>>,
}

/// Endpoint server entry point.
pub struct EndpointServer;

impl EndpointServer {
    /// Create the admission queue and start listening.
    pub fn start(
        config: &InstanceConfig,
        authenticator: Arc<dyn Authenticator>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<EndpointHandle> {
        let admission = AdmissionQueue::create(
            config.admission_segment_path(),
            config.document().session.max_sessions,
        )?;

        let shared = Arc::new(EndpointShared {
            config: config.clone(),
            admission,
            registry: Arc::new(SessionRegistry::new()),
            authenticator,
            dispatch,
            cancel: CancellationToken::new(),
            sessions: Mutex::new(Vec::new()),
        });

        let listener = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("tgctl-listener".into())
                .spawn(move || Self::listen_loop(shared))?
        };

        info!(
            "Endpoint listening on {}",
            config.admission_segment_path().display()
        );
        Ok(EndpointHandle {
            shared,
            listener: Some(listener),
        })
    }

    fn listen_loop(shared: Arc<EndpointShared>) {
        loop {
            let pending = match shared.admission.listen(&shared.cancel) {
                Ok(Some(pending)) => pending,
                Ok(None) => break,
                Err(e) => {
                    error!("Admission listener failed: {}", e);
                    break;
                }
            };
            if let Err(e) = Self::admit(&shared, pending) {
                warn!("Failed to admit connection in slot {}: {}", pending.slot, e);
            }
        }
        debug!("Admission listener stopped");
    }

    fn admit(shared: &Arc<EndpointShared>, pending: PendingConnection) -> Result<()> {
        let session_id = shared.admission.next_session_id()?;
        let path = shared.config.session_segment_path(session_id);

        let wire = match SessionWire::create(
            &path,
            session_id,
            shared.config.wire_geometry(),
            shared.config.expiration(),
        ) {
            Ok(wire) => Arc::new(wire),
            Err(e) => {
                shared.admission.reject(&pending)?;
                return Err(e);
            }
        };

        if !shared.admission.accept(&pending, session_id)? {
            SessionWire::remove(&path)?;
            return Ok(());
        }

        let record = Arc::new(SessionRecord::new(session_id, pending.slot, wire));
        shared.registry.insert(record.clone())?;
        let ctx = Arc::new(SessionContext {
            endpoint: shared.clone(),
            record,
            resultsets: Mutex::new(None),
            authenticated: AtomicBool::new(false),
        });

        let spawned = {
            let ctx = ctx.clone();
            std::thread::Builder::new()
                .name(format!("tgctl-session-{}", session_id))
                .spawn(move || ctx.serve())
        };
        match spawned {
            Ok(handle) => {
                let mut sessions = shared
                    .sessions
                    .lock()
                    .map_err(|_| TgError::Other("session list lock poisoned".into()))?;
                sessions.retain(|h| !h.is_finished());
                sessions.push(handle);
                info!(
                    "Admitted session {} for pid {} (slot {})",
                    session_id, pending.client_pid, pending.slot
                );
                Ok(())
            }
            Err(e) => {
                ctx.teardown(WireState::ServerClosed, Vec::new());
                Err(e.into())
            }
        }
    }
}

/// Handle to a running endpoint. Dropping it shuts the endpoint down
/// forcefully.
pub struct EndpointHandle {
    shared: Arc<EndpointShared>,
    listener: Option<JoinHandle<()>>,
}

impl EndpointHandle {
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.shared.registry.clone()
    }

    pub fn session_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Stop the endpoint. With `grace`, admissions stop first and every
    /// session is asked to finish its in-flight requests; sessions still
    /// alive when `grace` elapses are closed.
    pub fn shutdown(&mut self, grace: Option<Duration>) {
        if self.listener.is_none() {
            return;
        }
        if let Err(e) = self.shared.admission.terminate() {
            warn!("Failed to terminate admission queue: {}", e);
        }

        if let Some(grace) = grace {
            for record in self.shared.registry.all() {
                let _ = record.request_shutdown(SessionShutdownKind::Graceful);
            }
            let deadline = Instant::now() + grace;
            while !self.shared.registry.is_empty() && Instant::now() < deadline {
                std::thread::sleep(TransportConfig::WAIT_QUANTUM);
            }
            if !self.shared.registry.is_empty() {
                warn!(
                    "{} sessions still open after {:?}; closing them",
                    self.shared.registry.len(),
                    grace
                );
            }
        }

        self.shared.cancel.cancel();
        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                error!("Admission listener panicked");
            }
        }
        let sessions = self
            .shared
            .sessions
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default();
        for session in sessions {
            if session.join().is_err() {
                error!("Session thread panicked");
            }
        }

        if let Err(e) = AdmissionQueue::remove(self.shared.config.admission_segment_path()) {
            warn!("Failed to remove admission queue: {}", e);
        }
        info!("Endpoint stopped");
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        self.shutdown(None);
    }
}

/// State shared by a session thread and its request threads.
struct SessionContext {
    endpoint: Arc<EndpointShared>,
    record: Arc<SessionRecord>,
    resultsets: Mutex<Option<Arc<ResultsetSet>>>,
    authenticated: AtomicBool,
}

enum Flow {
    Continue,
    Disconnect,
}

impl SessionContext {
    fn session_id(&self) -> u64 {
        self.record.session_id()
    }

    fn wire(&self) -> &SessionWire {
        self.record.wire()
    }

    fn resultsets(&self) -> Result<Arc<ResultsetSet>> {
        let mut guard = self
            .resultsets
            .lock()
            .map_err(|_| TgError::Other("resultset lock poisoned".into()))?;
        if let Some(set) = guard.as_ref() {
            return Ok(set.clone());
        }
        let liveness: Arc<dyn Liveness> = Arc::new(ProcessLiveness {
            pid: self.wire().client_pid(),
        });
        let set = ResultsetSet::create(
            self.endpoint.config.resultset_segment_path(self.session_id()),
            self.endpoint.config.resultset_geometry(),
            self.session_id(),
            liveness,
        )?;
        *guard = Some(set.clone());
        Ok(set)
    }

    fn serve(self: Arc<Self>) {
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let wire = self.record.wire().clone();

        let reason = loop {
            workers.retain(|h| !h.is_finished());

            if self.endpoint.cancel.is_cancelled() {
                break WireState::ServerClosed;
            }
            match self.record.shutdown_requested() {
                Some(SessionShutdownKind::Forceful) => break WireState::ServerClosed,
                Some(SessionShutdownKind::Graceful) if self.record.in_flight() == 0 => {
                    break WireState::ServerClosed
                }
                _ => {}
            }
            if wire.is_expired(now_ms()) {
                info!("Session {} expired", self.session_id());
                break WireState::Expired;
            }

            let liveness = PeerWatch::client(&wire);
            let policy = WaitPolicy::new(TransportConfig::WAIT_QUANTUM, &liveness)
                .with_timeout(Some(TransportConfig::WAIT_QUANTUM));
            match wire.requests().read_message(&policy) {
                Ok(None) => {}
                Ok(Some(message)) => match self.handle(message, &mut workers) {
                    Flow::Continue => {}
                    Flow::Disconnect => break WireState::ClientClosed,
                },
                Err(e) => {
                    debug!("Session {} reader stopped: {}", self.session_id(), e);
                    break WireState::ClientClosed;
                }
            }
        };

        self.teardown(reason, workers);
    }

    fn handle(self: &Arc<Self>, message: Message, workers: &mut Vec<JoinHandle<()>>) -> Flow {
        let slot = message.slot;
        if message.kind != FrameKind::Request {
            warn!(
                "Ignoring {:?} frame on request ring of session {}",
                message.kind,
                self.session_id()
            );
            return Flow::Continue;
        }

        let envelope = match protocol::decode::<Request>(&message.payload)
            .and_then(|envelope| envelope.validate().map(|()| envelope))
        {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reply(slot, ServiceId::Endpoint, Response::error(&e));
                return Flow::Continue;
            }
        };
        let service = envelope.service;
        if envelope.session_id != self.session_id() {
            let e = TgError::transport(
                DiagnosticCode::InvalidRequest,
                format!("request for session {}", envelope.session_id),
            );
            self.reply(slot, service, Response::error(&e));
            return Flow::Continue;
        }

        let request = envelope.body;
        if self.record.shutdown_requested().is_some() && request != Request::Disconnect {
            let e = TgError::SessionClosed {
                session_id: self.session_id(),
            };
            self.reply(slot, service, Response::error(&e));
            return Flow::Continue;
        }

        match request {
            Request::EncryptionKey => {
                let key = self.endpoint.authenticator.encryption_key();
                self.reply(slot, service, Response::EncryptionKey { key });
            }
            Request::Handshake { client, credential } => {
                let response = match self.endpoint.authenticator.authenticate(&client, &credential) {
                    Ok(user) => match self.record.identify(&client, user) {
                        Ok(()) => {
                            self.authenticated.store(true, Ordering::Release);
                            let _ = self.wire().extend_expiration(now_ms());
                            info!(
                                "Session {} authenticated ({})",
                                self.session_id(),
                                client.application_name
                            );
                            Response::Handshake {
                                session_id: self.session_id(),
                                expiration_ms: self.wire().expiration_window().as_millis() as u64,
                            }
                        }
                        Err(e) => Response::error(&e),
                    },
                    Err(e) => {
                        warn!("Session {} failed authentication: {}", self.session_id(), e);
                        Response::error(&e)
                    }
                };
                self.reply(slot, service, response);
            }
            _ if !self.authenticated.load(Ordering::Acquire) => {
                let e = TgError::transport(
                    DiagnosticCode::PermissionDenied,
                    "handshake required before any request",
                );
                self.reply(slot, service, Response::error(&e));
            }
            Request::ExtendExpiration => {
                let response = match self.wire().extend_expiration(now_ms()) {
                    Ok(_) => Response::ExpirationExtended {
                        expiration_ms: self.wire().expiration_window().as_millis() as u64,
                    },
                    Err(e) => Response::error(&e),
                };
                self.reply(slot, service, response);
            }
            Request::Disconnect => {
                self.reply(slot, service, Response::Disconnected);
                return Flow::Disconnect;
            }
            request => self.spawn_request(slot, service, request, workers),
        }
        Flow::Continue
    }

    fn spawn_request(
        self: &Arc<Self>,
        slot: u16,
        service: ServiceId,
        request: Request,
        workers: &mut Vec<JoinHandle<()>>,
    ) {
        let payload = request_payload(self.session_id(), &request);
        let request_id = match self.record.begin_request(service, request.name(), payload) {
            Ok(id) => id,
            Err(e) => {
                self.reply(slot, service, Response::error(&e));
                return;
            }
        };
        debug!(
            "Session {} request {} ({}) on slot {}",
            self.session_id(),
            request_id,
            request.name(),
            slot
        );

        let ctx = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("tgctl-request-{}-{}", self.session_id(), request_id))
            .spawn(move || {
                let response = {
                    let request_ctx = RequestContext {
                        session: &ctx,
                        request_id,
                    };
                    ctx.endpoint
                        .dispatch
                        .dispatch(&request_ctx, request)
                        .unwrap_or_else(|e| Response::error(&e))
                };
                ctx.reply(slot, service, response);
                ctx.record.end_request(request_id);
            });

        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                self.record.end_request(request_id);
                self.reply(slot, service, Response::error(&TgError::from(e)));
            }
        }
    }

    fn reply(&self, slot: u16, service: ServiceId, body: Response) {
        let envelope = Envelope::response(self.session_id(), service, body);
        let written = protocol::encode(&envelope).and_then(|bytes| {
            let liveness = PeerWatch::client(self.wire());
            let policy = WaitPolicy::new(TransportConfig::WAIT_QUANTUM, &liveness);
            self.wire()
                .responses()
                .write_message(slot, FrameKind::Response, &bytes, &policy)
        });
        if let Err(e) = written {
            debug!(
                "Dropped response on slot {} of session {}: {}",
                slot,
                self.session_id(),
                e
            );
        }
    }

    /// Release everything the session holds. Outstanding requests are
    /// cancelled by closing the wire underneath them.
    fn teardown(&self, reason: WireState, workers: Vec<JoinHandle<()>>) {
        let session_id = self.session_id();
        if let Err(e) = self.wire().close(reason) {
            warn!("Failed to close session {}: {}", session_id, e);
        }

        if let Some(set) = self.resultsets.lock().ok().and_then(|mut s| s.take()) {
            let _ = set.shutdown();
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("Request thread of session {} panicked", session_id);
            }
        }

        let config = &self.endpoint.config;
        for removed in [
            ResultsetSet::remove(config.resultset_segment_path(session_id)),
            SessionWire::remove(config.session_segment_path(session_id)),
        ] {
            if let Err(e) = removed {
                warn!("Failed to remove segment of session {}: {}", session_id, e);
            }
        }
        if let Err(e) = self
            .endpoint
            .admission
            .release(self.record.admission_slot(), session_id)
        {
            warn!("Failed to release admission slot: {}", e);
        }
        self.endpoint.registry.remove(session_id);
        info!("Session {} ended ({:?})", session_id, reason);
    }
}

/// JSON form of a request as recorded in the session's request table. An
/// unserializable request is recorded with an empty payload.
fn request_payload(session_id: u64, request: &Request) -> String {
    match serde_json::to_string(request) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(
                "Cannot record payload of {} on session {}: {}",
                request.name(),
                session_id,
                e
            );
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_payload_records_request_json() {
        let payload = request_payload(
            7,
            &Request::Query {
                sql: "select 1".into(),
            },
        );
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "query");
        assert_eq!(value["sql"], "select 1");
    }

    #[test]
    fn test_request_payload_of_unit_request() {
        let payload = request_payload(7, &Request::ExtendExpiration);
        assert_eq!(payload, r#"{"type":"extend_expiration"}"#);
    }
}
