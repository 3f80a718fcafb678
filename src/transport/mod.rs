pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientEvent, UnixSocketClient};
pub use protocol::{BridgeFrame, Decision, GatewayFrame, IncomingMessage, Outgoing, ReplyTo};
pub use server::{ClientId, ServerEvent, UnixSocketServer};
