//! Wire codec for RFC 1928 (SOCKS5) and RFC 1929 (username/password auth).
//!
//! Every decode primitive here performs an *exact* read: it loops until the
//! requested byte count has arrived or the stream hits EOF, in which case it
//! returns an `Io` error with `ErrorKind::UnexpectedEof`. The codec does no
//! I/O beyond the reader/writer it is handed and never touches global state.

pub mod parser;
pub mod types;

pub use parser::*;
pub use types::*;
