use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
        mpsc,
    },
    thread,
};

use tokio::{
    net::{TcpListener, TcpStream},
    runtime::{self, Handle},
    select,
    sync::oneshot,
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    error::ServerError,
    hooks::{DefaultHooks, ServerHooks},
    session::{Session, lock},
};

/// The id counter starts here, so the first client is welcomed as 1001.
pub const FIRST_ID_BASE: u32 = 1000;

pub fn welcome_message(id: u32) -> String {
    format!("[SERVER] Welcome to server, you id {id}")
}

/// Accepts clients on a dedicated worker thread and relays every line a
/// client sends to all connected clients.
pub struct Server {
    config: ServerConfig,
    state: Arc<ServerState>,
    worker: Option<Worker>,
}

struct Worker {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_hooks(config, DefaultHooks)
    }

    pub fn with_hooks<H: ServerHooks>(config: ServerConfig, hooks: H) -> Self {
        Self {
            config,
            state: Arc::new(ServerState::new(Box::new(hooks))),
            worker: None,
        }
    }

    /// Binds the listener and starts accepting on the worker thread. Returns
    /// the bound address without waiting for any client.
    ///
    /// On failure the reason is also kept for [`Server::last_error`].
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.worker.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        match self.launch() {
            Ok(worker) => {
                let addr = worker.addr;
                self.worker = Some(worker);
                Ok(addr)
            }
            Err(err) => {
                warn!(error = %err, "server failed to start");
                self.state.set_error(err.to_string());
                Err(err)
            }
        }
    }

    /// Halts the worker runtime and waits for its thread. Registered sessions
    /// are closed first; anything still queued on them is dropped. Calling
    /// this on a stopped server does nothing.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let _ = worker.shutdown.send(());
        if worker.thread.join().is_err() {
            warn!("server worker panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.as_ref().map(|worker| worker.addr)
    }

    /// Queues `message` on every connected client, sender included. Clients
    /// found closed are handed to `on_client_disconnect` and dropped from the
    /// client set once the sweep is done.
    pub fn broadcast(&self, message: &str) {
        self.state.broadcast(message);
    }

    /// Queues `message` on one client, or removes it right away if it has
    /// already disconnected.
    pub fn send_to(&self, message: &str, session: &Arc<Session>) {
        self.state.send_to(message, session);
    }

    /// Point-in-time copy of the registered sessions.
    pub fn clients(&self) -> Vec<Arc<Session>> {
        self.state.clients()
    }

    /// The most recent setup or accept failure, empty if there was none.
    pub fn last_error(&self) -> String {
        self.state.last_error()
    }

    fn launch(&self) -> Result<Worker, ServerError> {
        let addr = self.config.socket_addr();
        let listener = bind(addr)?;
        let local = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let (ready, ready_rx) = mpsc::sync_channel(1);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let state = Arc::clone(&self.state);
        let thread = thread::Builder::new()
            .name("chat-fanout-worker".into())
            .spawn(move || run_worker(listener, state, shutdown_rx, ready))
            .map_err(ServerError::WorkerThread)?;

        // The runtime is built on the worker itself so that a failed start
        // never drops a runtime on the caller's thread.
        let started = ready_rx.recv().unwrap_or_else(|_| {
            Err(ServerError::Runtime(io::Error::other("worker exited during startup")))
        });
        if let Err(err) = started {
            let _ = thread.join();
            return Err(err);
        }

        debug!(%local, "server worker started");
        Ok(Worker {
            addr: local,
            shutdown,
            thread,
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(addr: SocketAddr) -> Result<std::net::TcpListener, ServerError> {
    let bind_error = |source: io::Error| ServerError::Bind { addr, source };

    let listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;
    Ok(listener)
}

fn run_worker(
    listener: std::net::TcpListener,
    state: Arc<ServerState>,
    shutdown: oneshot::Receiver<()>,
    ready: mpsc::SyncSender<Result<(), ServerError>>,
) {
    let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready.send(Err(ServerError::Runtime(err)));
            return;
        }
    };

    runtime.block_on(async {
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                let _ = ready.send(Err(ServerError::Runtime(err)));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        select! {
            _ = shutdown => {}
            _ = accept_loop(&listener, &state) => {}
        }

        info!("server shutting down");
        state.close_all().await;
    });

    // Dropping the runtime abandons whatever reads and writes are still in flight.
    drop(runtime);
}

async fn accept_loop(listener: &TcpListener, state: &Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => state.admit(stream, peer),
            Err(err) => {
                warn!(error = ?err, "failed to accept connection");
                state.set_error(err.to_string());
            }
        }
    }
}

struct ServerState {
    clients: Mutex<Vec<Arc<Session>>>,
    hooks: Box<dyn ServerHooks>,
    next_id: AtomicU32,
    last_error: Mutex<String>,
}

impl ServerState {
    fn new(hooks: Box<dyn ServerHooks>) -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            hooks,
            next_id: AtomicU32::new(FIRST_ID_BASE),
            last_error: Mutex::new(String::new()),
        }
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let session = Session::new(stream, Handle::current());

        if !self.hooks.on_client_connect(&session) {
            info!(%peer, "connection rejected");
            return;
        }

        self.register(session);
    }

    fn register(self: &Arc<Self>, session: Arc<Session>) {
        let id = self.next_id();
        session.set_id(id);
        lock(&self.clients).push(Arc::clone(&session));
        info!(id, peer = ?session.peer_addr(), "client registered");

        session.enqueue(welcome_message(id));

        let state = Arc::downgrade(self);
        session.start(
            Box::new(move |message: String| {
                if let Some(state) = state.upgrade() {
                    state.broadcast(&message);
                }
            }),
            Some(Box::new(move |err: io::Error| {
                debug!(id, error = ?err, "client connection closed");
            })),
        );
    }

    fn broadcast(&self, message: &str) {
        let mut departed = Vec::new();

        for session in self.clients() {
            if session.try_enqueue(message.to_owned()) {
                self.hooks.on_client_message(&session, message);
            } else {
                departed.push(session);
            }
        }

        if departed.is_empty() {
            return;
        }

        let removed = self.remove_all(&departed);
        debug!(count = removed.len(), "swept disconnected clients");
        for session in &removed {
            self.hooks.on_client_disconnect(session);
        }
    }

    fn send_to(&self, message: &str, session: &Arc<Session>) {
        if session.try_enqueue(message.to_owned()) {
            return;
        }

        if !self.remove_all(std::slice::from_ref(session)).is_empty() {
            debug!(id = session.id(), "removed disconnected client");
            self.hooks.on_client_disconnect(session);
        }
    }

    /// Removes the given sessions from the client set and returns the ones
    /// that were still registered, so each departure is reported once.
    fn remove_all(&self, sessions: &[Arc<Session>]) -> Vec<Arc<Session>> {
        let mut clients = lock(&self.clients);
        let mut removed = Vec::new();

        clients.retain(|client| {
            let gone = sessions.iter().any(|session| Arc::ptr_eq(client, session));
            if gone {
                removed.push(Arc::clone(client));
            }
            !gone
        });

        removed
    }

    fn clients(&self) -> Vec<Arc<Session>> {
        lock(&self.clients).clone()
    }

    async fn close_all(&self) {
        for session in self.clients() {
            session.close().await;
        }
    }

    fn set_error(&self, error: String) {
        *lock(&self.last_error) = error;
    }

    fn last_error(&self) -> String {
        lock(&self.last_error).clone()
    }
}
