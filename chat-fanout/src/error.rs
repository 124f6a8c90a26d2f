use std::{io, net::SocketAddr};

use thiserror::Error;

/// Failures that prevent [`Server::start`](crate::server::Server::start) from
/// bringing the server up. Transport errors on individual sessions never
/// surface here; they only close the affected session.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to build worker runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    WorkerThread(#[source] io::Error),

    #[error("server is already running")]
    AlreadyRunning,
}
