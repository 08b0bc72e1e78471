mod connection;
mod server;

pub use connection::{Connection, ConnectionState, SESSION_CONFLICT_REASON};
pub use server::WebSocketServer;
