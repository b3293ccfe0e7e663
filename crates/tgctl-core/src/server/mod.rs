//! Server-side lifecycle and the reference administrative service.

mod admin_service;
mod instance;

pub use admin_service::AdminService;
pub use instance::ServerInstance;
