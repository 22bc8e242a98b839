//! framecast: a WebSocket fan-out server
//!
//! Accepts any number of WebSocket clients and:
//! - Broadcasts encoded camera frames to every connected client
//! - Echoes each client's JSON messages back to that client only
//! - Answers malformed input with an error envelope, keeping the client
//!
//! The core is the [`registry::ClientRegistry`] and the
//! [`dispatcher::Dispatcher`] reading it; everything else drives them.

pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod frames;
pub mod handler;
pub mod lifecycle;
pub mod registry;
pub mod server;

pub use config::Config;
pub use dispatcher::{BroadcastReport, Dispatcher};
pub use envelope::Envelope;
pub use registry::{ClientHandle, ClientId, ClientRegistry};
pub use server::{Server, ServerError};
