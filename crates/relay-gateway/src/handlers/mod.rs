//! Capability handlers registered on the message router.

mod auth;
mod heartbeat;
mod items;
mod subscribe;

pub use auth::AuthHandler;
pub use heartbeat::HeartbeatHandler;
pub use items::ItemsHandler;
pub use subscribe::SubscribeHandler;
