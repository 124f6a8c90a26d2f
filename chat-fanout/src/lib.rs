//! Line-oriented TCP fan-out server.
//!
//! Every client that connects gets a numbered session; every line a client
//! sends is queued for delivery to all connected clients, the sender
//! included. Each module focuses on one responsibility:
//!
//! - [`session`] owns a single connection: its read loop, its outbound
//!   queue and the single write in flight that drains it.
//! - [`server`] binds the listener, runs the accept loop on a dedicated
//!   worker thread and implements broadcast and targeted sends over the
//!   client set.
//! - [`hooks`] is the extension surface the server calls on connect,
//!   disconnect and message events.
//! - [`config`] and [`cli`] describe where to listen and how the binary is
//!   invoked; [`client`] is a small stdin/stdout line client.
//! - [`error`] lists the ways starting a server can fail.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use error::ServerError;
pub use hooks::{DefaultHooks, ServerHooks};
pub use server::Server;
pub use session::Session;
