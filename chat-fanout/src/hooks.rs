use std::sync::Arc;

use crate::session::Session;

/// Extension points the server calls while managing its clients.
///
/// Every method has a default, so an implementation only overrides what it
/// cares about. Hooks run on whichever thread drives the operation (normally
/// the worker) and are never called while the client set is locked, so they
/// may freely call back into the server.
pub trait ServerHooks: Send + Sync + 'static {
    /// Decides whether a freshly accepted connection is registered. Returning
    /// `false` drops the session unstarted, which closes the socket.
    fn on_client_connect(&self, _session: &Arc<Session>) -> bool {
        true
    }

    /// Called when a send finds the session closed, after it has been removed
    /// from the client set.
    fn on_client_disconnect(&self, _session: &Arc<Session>) {}

    /// Called once per connected session a broadcast was queued on.
    fn on_client_message(&self, _session: &Arc<Session>, _message: &str) {}
}

/// Accepts everyone and ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ServerHooks for DefaultHooks {}
