pub mod handler;
pub mod listener;

pub use handler::{handle_client, ServerContext};
pub use listener::SocksServer;
