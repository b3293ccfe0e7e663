//! Client session over the shared-memory transport.
//!
//! A [`Session`] enters through the admission queue, maps its session wire,
//! performs the handshake and then exchanges slot-tagged request/response
//! messages through [`Session::call`].
//!
//! # Thread Safety
//!
//! `Session` is `Sync`: several threads may call concurrently. Each call
//! holds one of the K correlation slots from send until its response has been
//! consumed. Only one thread reads the response ring at a time; responses
//! for other slots are parked in per-slot mailboxes and the waiting threads
//! woken.

use super::admission::AdmissionQueue;
use super::handshake::CredentialSource;
use super::keepalive::{self, KeepAlive};
use super::protocol::{
    self, ClientInfo, DiagnosticCode, Envelope, FrameKind, Request, Response,
};
use super::resultset::{ResultsetReader, ResultsetSet};
use super::slots::SlotTable;
use super::wire::{PeerWatch, SessionWire, WireState};
use crate::config::{InstanceConfig, TransportConfig};
use crate::error::{Result, TgError};
use crate::platform;
use crate::shm::{Liveness, WaitPolicy};
use crate::status::StatusBlock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client: ClientInfo,
    pub credential: CredentialSource,
    /// Admission timeout; `None` waits as long as the server is alive.
    pub timeout: Option<Duration>,
    pub keep_alive: bool,
}

impl ConnectOptions {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            client: ClientInfo {
                label: None,
                application_name: application_name.into(),
                user_name: std::env::var("USER").ok(),
                connection_information: format!("pid:{}", platform::current_pid()),
            },
            credential: CredentialSource::None,
            timeout: Some(TransportConfig::CONNECT_TIMEOUT),
            keep_alive: true,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.client.label = Some(label.into());
        self
    }

    pub fn with_credential(mut self, credential: CredentialSource) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = false;
        self
    }
}

#[derive(Debug, Default)]
struct DemuxState {
    reading: bool,
    mailboxes: HashMap<u16, Vec<u8>>,
}

/// Response demultiplexer shared by all callers of one session.
#[derive(Debug, Default)]
struct Demux {
    state: Mutex<DemuxState>,
    arrived: Condvar,
}

impl Demux {
    fn lock(&self) -> Result<MutexGuard<'_, DemuxState>> {
        self.state
            .lock()
            .map_err(|_| TgError::Other("response demultiplexer lock poisoned".into()))
    }

    /// Wait for the response addressed to `slot`.
    fn receive(&self, wire: &SessionWire, slot: u16, liveness: &dyn Liveness) -> Result<Vec<u8>> {
        let mut state = self.lock()?;
        loop {
            if let Some(payload) = state.mailboxes.remove(&slot) {
                return Ok(payload);
            }

            if state.reading {
                liveness.ensure_alive()?;
                state = self
                    .arrived
                    .wait_timeout(state, TransportConfig::WAIT_QUANTUM)
                    .map_err(|_| TgError::Other("response demultiplexer lock poisoned".into()))?
                    .0;
                continue;
            }

            // Become the reader. The read is bounded so parked callers get
            // their turn to check the mailbox.
            state.reading = true;
            drop(state);
            let policy = WaitPolicy::new(TransportConfig::WAIT_QUANTUM, liveness)
                .with_timeout(Some(TransportConfig::WAIT_QUANTUM));
            let read = wire.responses().read_message(&policy);
            state = self.lock()?;
            state.reading = false;
            self.arrived.notify_all();

            match read? {
                Some(message) if message.kind != FrameKind::Response => {
                    return Err(TgError::MalformedFrame {
                        message: format!("unexpected {:?} frame on response ring", message.kind),
                    });
                }
                Some(message) if message.slot == slot => return Ok(message.payload),
                Some(message) => {
                    state.mailboxes.insert(message.slot, message.payload);
                }
                None => {}
            }
        }
    }
}

/// Shared state of one client session.
#[derive(Debug)]
struct SessionCore {
    session_id: u64,
    status: Arc<StatusBlock>,
    wire: SessionWire,
    slots: SlotTable,
    demux: Demux,
    resultset_path: PathBuf,
    resultsets: Mutex<Option<Arc<ResultsetSet>>>,
}

impl SessionCore {
    fn call(&self, request: Request) -> Result<Response> {
        let liveness = PeerWatch::server(&self.wire, Some(&self.status));
        let name = request.name();
        let envelope = Envelope::request(self.session_id, request);
        let bytes = protocol::encode(&envelope)?;

        let slot = self.slots.acquire(&liveness)?;
        let policy = WaitPolicy::new(TransportConfig::WAIT_QUANTUM, &liveness);
        self.wire
            .requests()
            .write_message(slot.index(), FrameKind::Request, &bytes, &policy)?;
        let payload = self.demux.receive(&self.wire, slot.index(), &liveness)?;
        drop(slot);

        let response: Envelope<Response> = protocol::decode(&payload)?;
        if response.session_id != self.session_id {
            return Err(TgError::MalformedFrame {
                message: format!(
                    "response for session {} on session {}",
                    response.session_id, self.session_id
                ),
            });
        }
        debug!("{} completed on session {}", name, self.session_id);
        response.body.into_result()
    }

    fn resultsets(&self) -> Result<Arc<ResultsetSet>> {
        let mut guard = self
            .resultsets
            .lock()
            .map_err(|_| TgError::Other("resultset lock poisoned".into()))?;
        if let Some(set) = guard.as_ref() {
            return Ok(set.clone());
        }
        let liveness: Arc<dyn Liveness> = self.status.clone();
        let set = ResultsetSet::open(&self.resultset_path, self.session_id, liveness)?;
        *guard = Some(set.clone());
        Ok(set)
    }
}

/// An established client session.
#[derive(Debug)]
pub struct Session {
    core: Arc<SessionCore>,
    keep_alive: Option<KeepAlive>,
    closed: bool,
}

impl Session {
    /// Connect to the server running for `config`.
    pub fn connect(config: &InstanceConfig, options: ConnectOptions) -> Result<Self> {
        let status = match StatusBlock::attach(config.status_segment_path()) {
            Ok(status) => Arc::new(status),
            Err(e) => {
                return Err(TgError::transport(
                    DiagnosticCode::ServiceUnavailable,
                    format!("server is not running: {}", e),
                ))
            }
        };
        status.ensure_alive()?;

        let admission = AdmissionQueue::open(config.admission_segment_path())?;
        let admitted = admission.connect(status.as_ref(), options.timeout)?;

        let wire = SessionWire::open(
            config.session_segment_path(admitted.session_id),
            admitted.session_id,
        )?;
        wire.register_client()?;

        let slot_count = u16::try_from(wire.geometry().slot_count).unwrap_or(u16::MAX);
        let core = Arc::new(SessionCore {
            session_id: admitted.session_id,
            status,
            slots: SlotTable::new(slot_count),
            wire,
            demux: Demux::default(),
            resultset_path: config.resultset_segment_path(admitted.session_id),
            resultsets: Mutex::new(None),
        });

        let mut session = Self {
            core,
            keep_alive: None,
            closed: false,
        };
        // On failure the drop path closes the wire so the server reclaims it.
        session.handshake(&options)?;

        if options.keep_alive {
            let core = session.core.clone();
            let interval = keepalive::interval_for(session.core.wire.expiration_window());
            session.keep_alive = Some(KeepAlive::spawn(interval, move || {
                core.call(Request::ExtendExpiration).map(|_| ())
            })?);
        }

        info!(
            "Session {} established ({} slots)",
            session.session_id(),
            slot_count
        );
        Ok(session)
    }

    fn handshake(&self, options: &ConnectOptions) -> Result<()> {
        let key = if options.credential.needs_encryption_key() {
            match self.core.call(Request::EncryptionKey).map_err(into_handshake)? {
                Response::EncryptionKey { key } => key,
                other => return Err(unexpected(&other)),
            }
        } else {
            None
        };
        let credential = options.credential.resolve(key.as_deref())?;

        let request = Request::Handshake {
            client: options.client.clone(),
            credential,
        };
        match self.core.call(request).map_err(into_handshake)? {
            Response::Handshake { session_id, .. } if session_id == self.core.session_id => Ok(()),
            Response::Handshake { session_id, .. } => Err(TgError::Handshake {
                code: DiagnosticCode::InvalidRequest,
                message: format!(
                    "handshake answered for session {} on session {}",
                    session_id, self.core.session_id
                ),
            }),
            other => Err(unexpected(&other)),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.core.session_id
    }

    pub fn expiration_window(&self) -> Duration {
        self.core.wire.expiration_window()
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.core.slots.in_flight()
    }

    /// Send one request and wait for its response. Error responses become
    /// `TgError::Transport` carrying the server's diagnostic code.
    pub fn call(&self, request: Request) -> Result<Response> {
        if self.closed {
            return Err(TgError::SessionClosed {
                session_id: self.core.session_id,
            });
        }
        self.core.call(request)
    }

    /// Extend the server-side expiration once, outside the keep-alive thread.
    pub fn extend_expiration(&self) -> Result<Duration> {
        match self.call(Request::ExtendExpiration)? {
            Response::ExpirationExtended { expiration_ms } => {
                Ok(Duration::from_millis(expiration_ms))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Consumer for a resultset the server announced.
    pub fn open_resultset(&self, index: u32) -> Result<ResultsetReader> {
        self.core.resultsets()?.reader(index)
    }

    /// Run a statement and return the resultset carrying its output.
    pub fn query(&self, sql: impl Into<String>) -> Result<ResultsetReader> {
        match self.call(Request::Query { sql: sql.into() })? {
            Response::ResultsetOpened { index } => self.open_resultset(index),
            other => Err(unexpected(&other)),
        }
    }

    /// Say goodbye and close the wire.
    pub fn disconnect(mut self) -> Result<()> {
        self.close(true)
    }

    fn close(&mut self, polite: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(mut keep_alive) = self.keep_alive.take() {
            keep_alive.stop();
        }
        if polite {
            if let Err(e) = self.core.call(Request::Disconnect) {
                debug!("Disconnect on session {} failed: {}", self.core.session_id, e);
            }
        }
        self.closed = true;
        self.core.wire.close(WireState::ClientClosed)?;
        info!("Session {} closed", self.core.session_id);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close(false) {
            warn!("Failed to close session {}: {}", self.core.session_id, e);
        }
    }
}

fn into_handshake(err: TgError) -> TgError {
    match err {
        TgError::Transport { code, message } => TgError::Handshake { code, message },
        other => other,
    }
}

fn unexpected(response: &Response) -> TgError {
    TgError::MalformedFrame {
        message: format!("unexpected response {:?}", response),
    }
}
