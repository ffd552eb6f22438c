//! Device relay — owns authenticated device sockets and publishes
//! device-origin events.
//!
//! Devices hold one persistent outbound WebSocket each. The relay
//! authenticates them against the credential store, keeps at most one
//! connection per device id, decodes their frames (MessagePack, possibly
//! several messages per frame, or legacy JSON), and publishes every decoded
//! message on a broadcast channel. The client proxy and the HTTP
//! request/response helper are the subscribers.

pub mod codec;
pub mod device;
pub mod request;

pub use device::DeviceRelay;

/// Close code for an admin-forced disconnect.
pub const CLOSE_ADMIN: u16 = 4000;
/// Close code for missing or malformed connect parameters.
pub const CLOSE_BAD_REQUEST: u16 = 4001;
/// Close code sent to a device connection replaced by a newer one.
pub const CLOSE_REPLACED: u16 = 4002;
/// Close code for a client presenting an invalid or expired token.
pub const CLOSE_BAD_TOKEN: u16 = 4002;
/// Close code for failed key verification or device ownership.
pub const CLOSE_AUTH: u16 = 4003;
