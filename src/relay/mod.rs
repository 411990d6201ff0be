//! Data-plane relays for the `CONNECT` and `UDP ASSOCIATE` commands.

pub mod tcp;
pub mod udp;

pub use tcp::relay_tcp;
pub use udp::relay_udp;
