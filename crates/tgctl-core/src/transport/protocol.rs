//! Message types carried over session wires.
//!
//! Every message body is one variant of a closed union ([`Request`] or
//! [`Response`]) wrapped in a versioned [`Envelope`] and encoded as JSON:
//!
//! ```text
//! {"service": "...", "version": {"major": 1, "minor": 0}, "session_id": N, "body": {...}}
//! ```
//!
//! The encoded envelope is what the frame ring fragments and reassembles.

use crate::config::TransportConfig;
use crate::error::{Result, TgError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Diagnostic codes returned in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    Unknown,
    AuthenticationError,
    PermissionDenied,
    InvalidRequest,
    UnsupportedVersion,
    NotFound,
    SessionClosed,
    ServiceUnavailable,
    Timeout,
    IoError,
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagnosticCode::Unknown => "unknown",
            DiagnosticCode::AuthenticationError => "authentication_error",
            DiagnosticCode::PermissionDenied => "permission_denied",
            DiagnosticCode::InvalidRequest => "invalid_request",
            DiagnosticCode::UnsupportedVersion => "unsupported_version",
            DiagnosticCode::NotFound => "not_found",
            DiagnosticCode::SessionClosed => "session_closed",
            DiagnosticCode::ServiceUnavailable => "service_unavailable",
            DiagnosticCode::Timeout => "timeout",
            DiagnosticCode::IoError => "io_error",
        };
        f.write_str(s)
    }
}

/// Service a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    Endpoint,
    Datastore,
    Session,
    Metrics,
    RequestInspection,
    Sql,
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceId::Endpoint => "endpoint",
            ServiceId::Datastore => "datastore",
            ServiceId::Session => "session",
            ServiceId::Metrics => "metrics",
            ServiceId::RequestInspection => "request",
            ServiceId::Sql => "sql",
        };
        f.write_str(s)
    }
}

/// Message version; the major number must match the receiver's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageVersion {
    pub major: u16,
    pub minor: u16,
}

impl MessageVersion {
    pub const CURRENT: MessageVersion = MessageVersion { major: 1, minor: 0 };

    pub fn is_compatible(&self, other: &MessageVersion) -> bool {
        self.major == other.major
    }
}

/// Kind byte stored in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 1,
    Response = 2,
}

impl FrameKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(FrameKind::Request),
            2 => Some(FrameKind::Response),
            _ => None,
        }
    }
}

/// Client metadata exchanged during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub label: Option<String>,
    pub application_name: String,
    pub user_name: Option<String>,
    pub connection_information: String,
}

/// Credential presented in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    None,
    Token { token: String },
    EncryptedPassword { user: String, encrypted_password: String },
}

/// Kind of a per-session shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionShutdownKind {
    Graceful,
    Forceful,
}

/// Where a restore reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum RestoreSource {
    Backup { directory: PathBuf, keep_backup: bool },
    Tag { name: String },
}

/// Every request a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    EncryptionKey,
    Handshake {
        client: ClientInfo,
        credential: Credential,
    },
    ExtendExpiration,
    Disconnect,
    BackupBegin {
        label: Option<String>,
    },
    BackupEnd {
        backup_id: u64,
    },
    BackupEstimate,
    Restore {
        source: RestoreSource,
    },
    SessionList,
    SessionGet {
        specifier: String,
    },
    SessionShutdown {
        specifier: String,
        kind: SessionShutdownKind,
    },
    SessionSetVariable {
        specifier: String,
        name: String,
        value: Option<String>,
    },
    StatsList,
    StatsShow,
    RequestList {
        session: Option<String>,
    },
    RequestPayload {
        session: String,
        request_id: u64,
    },
    Query {
        sql: String,
    },
}

impl Request {
    pub fn service(&self) -> ServiceId {
        match self {
            Request::EncryptionKey
            | Request::Handshake { .. }
            | Request::ExtendExpiration
            | Request::Disconnect => ServiceId::Endpoint,
            Request::BackupBegin { .. }
            | Request::BackupEnd { .. }
            | Request::BackupEstimate
            | Request::Restore { .. } => ServiceId::Datastore,
            Request::SessionList
            | Request::SessionGet { .. }
            | Request::SessionShutdown { .. }
            | Request::SessionSetVariable { .. } => ServiceId::Session,
            Request::StatsList | Request::StatsShow => ServiceId::Metrics,
            Request::RequestList { .. } | Request::RequestPayload { .. } => {
                ServiceId::RequestInspection
            }
            Request::Query { .. } => ServiceId::Sql,
        }
    }

    pub fn version(&self) -> MessageVersion {
        MessageVersion::CURRENT
    }

    /// Short name used in logs and in-flight request listings.
    pub fn name(&self) -> &'static str {
        match self {
            Request::EncryptionKey => "encryption_key",
            Request::Handshake { .. } => "handshake",
            Request::ExtendExpiration => "extend_expiration",
            Request::Disconnect => "disconnect",
            Request::BackupBegin { .. } => "backup_begin",
            Request::BackupEnd { .. } => "backup_end",
            Request::BackupEstimate => "backup_estimate",
            Request::Restore { .. } => "restore",
            Request::SessionList => "session_list",
            Request::SessionGet { .. } => "session_get",
            Request::SessionShutdown { .. } => "session_shutdown",
            Request::SessionSetVariable { .. } => "session_set_variable",
            Request::StatsList => "stats_list",
            Request::StatsShow => "stats_show",
            Request::RequestList { .. } => "request_list",
            Request::RequestPayload { .. } => "request_payload",
            Request::Query { .. } => "query",
        }
    }
}

/// Session as reported by the session service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub label: Option<String>,
    pub application: String,
    pub user: Option<String>,
    pub connection_information: String,
    pub started_at: DateTime<Utc>,
    pub expires_in_ms: u64,
    pub variables: BTreeMap<String, String>,
    pub shutdown: Option<SessionShutdownKind>,
}

/// In-flight request as reported by the request service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub session_id: u64,
    pub request_id: u64,
    pub service: ServiceId,
    pub kind: String,
    pub started_at: DateTime<Utc>,
}

/// One metrics item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsItem {
    pub key: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Every response a server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    EncryptionKey {
        key: Option<String>,
    },
    Handshake {
        session_id: u64,
        expiration_ms: u64,
    },
    ExpirationExtended {
        expiration_ms: u64,
    },
    Disconnected,
    BackupBegun {
        backup_id: u64,
        files: Vec<PathBuf>,
    },
    BackupEnded,
    BackupEstimate {
        file_count: u64,
        total_bytes: u64,
    },
    Restored,
    Sessions {
        sessions: Vec<SessionInfo>,
    },
    Session {
        session: SessionInfo,
    },
    SessionShutdownRequested,
    VariableSet,
    Stats {
        items: Vec<MetricsItem>,
    },
    Requests {
        requests: Vec<RequestInfo>,
    },
    RequestPayload {
        payload: String,
    },
    ResultsetOpened {
        index: u32,
    },
    Error {
        code: DiagnosticCode,
        message: String,
    },
}

impl Response {
    pub fn error(err: &TgError) -> Self {
        Response::Error {
            code: err.to_diagnostic_code(),
            message: err.to_string(),
        }
    }

    /// Turn an error response into a transport error.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error { code, message } => Err(TgError::Transport { code, message }),
            other => Ok(other),
        }
    }
}

/// Versioned envelope around a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<B> {
    pub service: ServiceId,
    pub version: MessageVersion,
    pub session_id: u64,
    pub body: B,
}

impl Envelope<Request> {
    pub fn request(session_id: u64, body: Request) -> Self {
        Self {
            service: body.service(),
            version: body.version(),
            session_id,
            body,
        }
    }

    /// Reject envelopes whose header disagrees with the body.
    pub fn validate(&self) -> Result<()> {
        if self.service != self.body.service() {
            return Err(TgError::transport(
                DiagnosticCode::InvalidRequest,
                format!(
                    "{} request addressed to service {}",
                    self.body.name(),
                    self.service
                ),
            ));
        }
        if !self.version.is_compatible(&MessageVersion::CURRENT) {
            return Err(TgError::transport(
                DiagnosticCode::UnsupportedVersion,
                format!(
                    "message version {}.{} is not supported",
                    self.version.major, self.version.minor
                ),
            ));
        }
        Ok(())
    }
}

impl Envelope<Response> {
    pub fn response(session_id: u64, service: ServiceId, body: Response) -> Self {
        Self {
            service,
            version: MessageVersion::CURRENT,
            session_id,
            body,
        }
    }
}

/// Encode an envelope for the wire.
pub fn encode<B: Serialize>(envelope: &Envelope<B>) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(envelope)?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Decode an envelope received from the wire.
pub fn decode<B: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<Envelope<B>> {
    check_size(bytes.len())?;
    serde_json::from_slice(bytes).map_err(|e| TgError::MalformedFrame {
        message: format!("undecodable envelope: {}", e),
    })
}

fn check_size(len: usize) -> Result<()> {
    if len > TransportConfig::MAX_MESSAGE_SIZE {
        return Err(TgError::Validation {
            field: "message".to_string(),
            message: format!(
                "message size {} exceeds maximum {}",
                len,
                TransportConfig::MAX_MESSAGE_SIZE
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_roundtrip() {
        let request = Request::SessionSetVariable {
            specifier: "batch".into(),
            name: "timeout".into(),
            value: Some("30".into()),
        };
        let bytes = encode(&Envelope::request(9, request.clone())).unwrap();
        let decoded: Envelope<Request> = decode(&bytes).unwrap();

        assert_eq!(decoded.session_id, 9);
        assert_eq!(decoded.service, ServiceId::Session);
        assert_eq!(decoded.body, request);
        decoded.validate().unwrap();
    }

    #[test]
    fn test_request_tagging() {
        let json = serde_json::to_value(Request::Query {
            sql: "select 1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "query");
        assert_eq!(json["sql"], "select 1");
    }

    #[test]
    fn test_mismatched_service_is_rejected() {
        let mut envelope = Envelope::request(1, Request::StatsShow);
        envelope.service = ServiceId::Datastore;
        let err = envelope.validate().unwrap_err();
        assert_eq!(err.to_diagnostic_code(), DiagnosticCode::InvalidRequest);
    }

    #[test]
    fn test_incompatible_version_is_rejected() {
        let mut envelope = Envelope::request(1, Request::StatsShow);
        envelope.version = MessageVersion { major: 2, minor: 0 };
        let err = envelope.validate().unwrap_err();
        assert_eq!(err.to_diagnostic_code(), DiagnosticCode::UnsupportedVersion);
    }

    #[test]
    fn test_error_response_into_result() {
        let response = Response::Error {
            code: DiagnosticCode::NotFound,
            message: "no such session".into(),
        };
        let err = response.into_result().unwrap_err();
        assert_eq!(err.to_diagnostic_code(), DiagnosticCode::NotFound);
        assert!(Response::Restored.into_result().is_ok());
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = decode::<Request>(b"not json").unwrap_err();
        assert!(matches!(err, TgError::MalformedFrame { .. }));
    }
}
