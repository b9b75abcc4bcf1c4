//! # mirrun
//!
//! The realm runtime: realm messaging, the tunnel handshake that turns two
//! isolated realms into one connected emitter, and the connection layer that
//! exchanges API trees over it.

pub mod connect;
pub mod local;
pub mod path;
pub mod realm;
pub mod tunnel;

pub use realm::Origin;
pub use realm::Realm;
pub use realm::RealmMsg;

pub use local::LocalRealm;

pub use tunnel::PROTOCOL_VERSION;
pub use tunnel::Tunnel;
pub use tunnel::TunnelConfig;

pub use connect::Connection;
pub use connect::SharedContext;
pub use connect::connect_to_child;
pub use connect::connect_to_parent;

pub use path::RemotePath;

#[cfg(test)]
mod tests;
