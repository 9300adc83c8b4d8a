//! UDP relay that fronts the protected game server.

mod server;
mod session;

pub use server::{is_connectionless, RelayServer, CONNECTIONLESS_HEADER};
