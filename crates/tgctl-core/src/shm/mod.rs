//! Shared-memory primitives: mapped segments and cross-process notification.

pub mod notify;
pub mod segment;

pub use notify::{
    notify_all, wait_for_change, wait_until, AlwaysAlive, Liveness, ProcessLiveness, WaitPolicy,
};
pub use segment::{align_up, SharedLayout, SharedSegment};

/// Magic values identifying each segment kind ("TGST", "TGAD", "TGWR", "TGRS").
pub mod magic {
    pub const STATUS: u32 = 0x5447_5354;
    pub const ADMISSION: u32 = 0x5447_4144;
    pub const WIRE: u32 = 0x5447_5752;
    pub const RESULTSET: u32 = 0x5447_5253;
}

/// Layout version shared by every segment kind.
pub const LAYOUT_VERSION: u32 = 1;
