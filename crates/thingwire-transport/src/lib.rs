//! WebSocket transport for thingwire: connect, authenticate, stay connected.

pub mod config;
pub mod connection;
mod handshake;
pub mod policy;
pub mod sink;
pub mod state;

pub use config::{Credentials, TransportConfig};
pub use connection::{Connection, ErrorHandler, TransportEvent};
pub use policy::{ExponentialBackoff, Immediate, ReconnectPolicy};
pub use sink::{send_envelope, FrameSink, SendError};
pub use state::ConnectionState;
