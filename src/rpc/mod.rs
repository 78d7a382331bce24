//! Replication RPC stack.
//!
//! Layered bottom-up: [`frame`] moves length-prefixed typed frames over
//! a byte channel, [`message`] composes frames into header and data
//! messages, [`server`] dispatches incoming requests to registered
//! endpoints, and [`client`] is the symmetric calling side. Exactly one
//! request is in flight at a time per channel.

pub mod client;
pub mod error;
pub mod frame;
pub mod message;
pub mod server;

/// Built-in endpoint name that ends a session. Handled by the server
/// itself: the reply is acknowledged before the channel closes.
pub const ENDPOINT_CLOSE: &str = "CloseRequest";

pub use client::RpcClient;
pub use error::RpcError;
pub use frame::{FrameReader, FrameWriter, MAX_HEADER_LENGTH, MAX_PAYLOAD_LENGTH};
pub use message::{ByteStream, DataType, Header, MessageLayer, Status};
pub use server::{Endpoint, HandlerError, OctetStream, RpcServer};

// vim: ts=4
