//! Shared-memory IPC transport.
//!
//! - `admission`: connection admission queue with a bounded slot pool
//! - `wire`, `ring`, `slots`: per-session request/response rings and the
//!   client's K-slot correlation table
//! - `resultset`: W writer wires for streaming results
//! - `keepalive`: client-side expiration renewal
//! - `protocol`, `handshake`: message union, envelope and credentials
//! - `client`, `server`, `registry`: the two ends of a session

pub mod admission;
pub mod client;
pub mod handshake;
pub mod keepalive;
pub mod protocol;
pub mod registry;
pub mod resultset;
pub mod ring;
pub mod server;
pub mod slots;
pub mod wire;

pub use admission::{Admission, AdmissionQueue, PendingConnection};
pub use client::{ConnectOptions, Session};
pub use handshake::{
    AcceptAll, Authenticator, CredentialSource, PasswordEncryptor, TokenAuthenticator,
};
pub use keepalive::KeepAlive;
pub use protocol::{
    ClientInfo, Credential, DiagnosticCode, Envelope, MessageVersion, MetricsItem, Request,
    RequestInfo, Response, RestoreSource, ServiceId, SessionInfo, SessionShutdownKind,
};
pub use registry::{SessionRecord, SessionRegistry};
pub use resultset::{
    ChunkRef, Fetch, ResultsetGeometry, ResultsetHandle, ResultsetReader, ResultsetSet,
    ResultsetWriter,
};
pub use server::{Dispatch, EndpointHandle, EndpointServer, RequestContext};
pub use slots::{SlotGuard, SlotTable};
pub use wire::{SessionWire, WireGeometry, WireState};
