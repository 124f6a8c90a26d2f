//! One accepted client connection.
//!
//! A [`Session`] runs two independent loops on the server's worker runtime:
//!
//! - a read loop that splits the inbound byte stream on `\n` and hands every
//!   complete line to the message handler registered in [`Session::start`];
//! - a write loop that drains the outbound queue one message at a time, so at
//!   most one write is ever in flight and delivery follows enqueue order.
//!
//! Every spawned loop owns an `Arc<Session>`, which keeps the session alive
//! while an operation is outstanding even after the server has dropped it.
//! Any I/O error is terminal: the socket is closed and nothing is retried.

use std::{
    collections::VecDeque,
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    select,
    sync::{Mutex as AsyncMutex, watch},
};
use tracing::{debug, warn};

/// Terminates every line on the wire, in both directions.
pub const DELIMITER: u8 = b'\n';

pub type MessageHandler = Box<dyn FnMut(String) + Send + 'static>;
pub type ErrorHandler = Box<dyn FnOnce(io::Error) + Send + 'static>;

pub struct Session {
    id: AtomicU32,
    peer: Option<SocketAddr>,
    runtime: Handle,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    outgoing: Mutex<VecDeque<String>>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Wraps an accepted stream. All socket work is spawned onto `runtime`,
    /// whatever thread later calls into the session.
    pub fn new(stream: TcpStream, runtime: Handle) -> Arc<Self> {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);

        Arc::new(Self {
            id: AtomicU32::new(0),
            peer,
            runtime,
            reader: Mutex::new(Some(reader)),
            writer: AsyncMutex::new(Some(writer)),
            outgoing: Mutex::new(VecDeque::new()),
            closed,
        })
    }

    /// Arms the read loop. Only the first call has any effect.
    ///
    /// `on_message` runs on the worker for every received line, with the
    /// delimiter removed. `on_error` runs once when the read loop ends because
    /// of a transport error or end of stream, after the socket is closed.
    pub fn start(self: &Arc<Self>, on_message: MessageHandler, on_error: Option<ErrorHandler>) {
        let Some(reader) = lock(&self.reader).take() else {
            warn!(id = self.id(), "session already started or closed");
            return;
        };

        let session = Arc::clone(self);
        self.runtime.spawn(session.read_loop(reader, on_message, on_error));
    }

    /// Queues `message` for delivery. The write loop is only kicked off when
    /// the queue was empty; otherwise the write in flight picks it up.
    ///
    /// The queue is unbounded: a peer that stops reading grows it without limit.
    /// Once the session is closed the message is dropped instead.
    pub fn enqueue(self: &Arc<Self>, message: impl Into<String>) {
        if !self.try_enqueue(message.into()) {
            debug!(id = self.id(), "dropping message for closed session");
        }
    }

    /// Queues `message` unless the session is closed, and reports which
    /// happened. The check and the push share the queue lock with `close`, so
    /// a `true` here means the session was still open when the message landed.
    pub(crate) fn try_enqueue(self: &Arc<Self>, message: String) -> bool {
        let idle = {
            let mut outgoing = lock(&self.outgoing);
            if !self.is_connected() {
                return false;
            }
            let idle = outgoing.is_empty();
            outgoing.push_back(message);
            idle
        };

        if idle {
            let session = Arc::clone(self);
            self.runtime.spawn(session.write_loop());
        }
        true
    }

    pub fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Requests that the connection be closed. The close itself happens on the
    /// worker, so `is_connected` may stay true for a moment after this returns.
    pub fn disconnect(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }

        let session = Arc::clone(self);
        self.runtime.spawn(async move { session.close().await });
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Messages not yet fully written, head first.
    pub fn pending(&self) -> Vec<String> {
        lock(&self.outgoing).iter().cloned().collect()
    }

    pub(crate) async fn close(&self) {
        let was_open = {
            let _outgoing = lock(&self.outgoing);
            !self.closed.send_replace(true)
        };
        if was_open {
            debug!(id = self.id(), peer = ?self.peer, "closing session");
        }

        drop(lock(&self.reader).take());

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!(id = self.id(), error = ?err, "socket shutdown failed");
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        reader: OwnedReadHalf,
        mut on_message: MessageHandler,
        on_error: Option<ErrorHandler>,
    ) {
        let mut reader = BufReader::new(reader);
        let mut closed = self.closed.subscribe();
        let mut line = Vec::new();

        let cause = loop {
            line.clear();
            let read = select! {
                read = reader.read_until(DELIMITER, &mut line) => read,
                _ = closed_signal(&mut closed) => return,
            };

            match read {
                Ok(_) if line.last() == Some(&DELIMITER) => on_message(decode_line(&line)),
                // EOF, possibly in the middle of an unterminated line.
                Ok(_) => break io::Error::from(io::ErrorKind::UnexpectedEof),
                Err(err) => break err,
            }
        };

        debug!(id = self.id(), error = ?cause, "read loop stopped");
        drop(reader);
        self.close().await;

        if let Some(on_error) = on_error {
            on_error(cause);
        }
    }

    async fn write_loop(self: Arc<Self>) {
        let mut closed = self.closed.subscribe();
        let mut writer = self.writer.lock().await;

        loop {
            if !self.is_connected() {
                return;
            }
            let Some(stream) = writer.as_mut() else {
                return;
            };
            let Some(frame) = self.head_frame() else {
                return;
            };

            let written = select! {
                written = stream.write_all(&frame) => written,
                _ = closed_signal(&mut closed) => return,
            };

            if let Err(err) = written {
                debug!(id = self.id(), error = ?err, "write failed; abandoning queue");
                *writer = None;
                drop(writer);
                self.close().await;
                return;
            }

            if !self.pop_head() {
                return;
            }
        }
    }

    fn head_frame(&self) -> Option<Vec<u8>> {
        lock(&self.outgoing).front().map(|message| {
            let mut frame = Vec::with_capacity(message.len() + 1);
            frame.extend_from_slice(message.as_bytes());
            frame.push(DELIMITER);
            frame
        })
    }

    /// Drops the message that was just written and reports whether more are
    /// waiting. Both happen under one lock so a concurrent `enqueue` either
    /// sees a non-empty queue or starts a fresh write loop.
    fn pop_head(&self) -> bool {
        let mut outgoing = lock(&self.outgoing);
        outgoing.pop_front();
        !outgoing.is_empty()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

fn decode_line(frame: &[u8]) -> String {
    let line = frame.strip_suffix(&[DELIMITER]).unwrap_or(frame);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use tokio::{
        net::TcpListener,
        sync::{mpsc, oneshot},
        time::{sleep, timeout},
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    async fn socket_pair() -> Result<(TcpStream, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        Ok((accepted?.0, client?))
    }

    async fn read_line(reader: &mut BufReader<TcpStream>) -> Result<Option<String>> {
        let mut line = String::new();
        let bytes = timeout(WAIT, reader.read_line(&mut line)).await??;
        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches('\n').to_string()))
    }

    async fn wait_until_closed(session: &Session) {
        timeout(WAIT, async {
            while session.is_connected() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session should close");
    }

    fn channel_handler() -> (MessageHandler, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Box::new(move |line| {
            let _ = tx.send(line);
        });
        (handler, rx)
    }

    #[test]
    fn decode_strips_delimiter_and_carriage_return() {
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"\n"), "");
        assert_eq!(decode_line(b"a\rb\n"), "a\rb");
    }

    #[tokio::test]
    async fn enqueued_messages_arrive_in_order() -> Result<()> {
        let (server_side, client) = socket_pair().await?;
        let session = Session::new(server_side, Handle::current());
        let mut client = BufReader::new(client);

        let expected: Vec<String> = (0..50).map(|i| format!("message {i}")).collect();
        for message in &expected {
            session.enqueue(message.clone());
        }

        for message in &expected {
            assert_eq!(read_line(&mut client).await?.as_deref(), Some(message.as_str()));
        }
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_from_another_thread_is_delivered() -> Result<()> {
        let (server_side, client) = socket_pair().await?;
        let session = Session::new(server_side, Handle::current());
        let mut client = BufReader::new(client);

        let remote = Arc::clone(&session);
        std::thread::spawn(move || {
            remote.enqueue("first");
            remote.enqueue("second");
        })
        .join()
        .expect("enqueue thread");

        assert_eq!(read_line(&mut client).await?.as_deref(), Some("first"));
        assert_eq!(read_line(&mut client).await?.as_deref(), Some("second"));
        Ok(())
    }

    #[tokio::test]
    async fn read_loop_delivers_complete_lines() -> Result<()> {
        let (server_side, mut client) = socket_pair().await?;
        let session = Session::new(server_side, Handle::current());
        let (on_message, mut lines) = channel_handler();
        session.start(on_message, None);

        client.write_all(b"hello\r\nwor").await?;
        client.write_all(b"ld\n\n").await?;

        assert_eq!(timeout(WAIT, lines.recv()).await?.as_deref(), Some("hello"));
        assert_eq!(timeout(WAIT, lines.recv()).await?.as_deref(), Some("world"));
        assert_eq!(timeout(WAIT, lines.recv()).await?.as_deref(), Some(""));
        Ok(())
    }

    #[tokio::test]
    async fn peer_close_ends_session_and_reports_error() -> Result<()> {
        let (server_side, mut client) = socket_pair().await?;
        let session = Session::new(server_side, Handle::current());
        let (on_message, mut lines) = channel_handler();
        let (error_tx, error_rx) = oneshot::channel();
        session.start(
            on_message,
            Some(Box::new(move |err| {
                let _ = error_tx.send(err.kind());
            })),
        );

        client.write_all(b"unterminated").await?;
        drop(client);

        let kind = timeout(WAIT, error_rx).await??;
        assert_eq!(kind, io::ErrorKind::UnexpectedEof);
        assert!(!session.is_connected());
        // The partial line is discarded, never delivered.
        assert!(lines.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_from_another_thread_closes_socket() -> Result<()> {
        let (server_side, client) = socket_pair().await?;
        let session = Session::new(server_side, Handle::current());
        let (on_message, _lines) = channel_handler();
        session.start(on_message, None);
        let mut client = BufReader::new(client);

        let remote = Arc::clone(&session);
        std::thread::spawn(move || remote.disconnect())
            .join()
            .expect("disconnect thread");

        assert_eq!(read_line(&mut client).await?, None);
        wait_until_closed(&session).await;

        // Disconnecting twice is harmless.
        session.disconnect();
        Ok(())
    }

    #[tokio::test]
    async fn closed_session_never_writes() -> Result<()> {
        let (server_side, client) = socket_pair().await?;
        let session = Session::new(server_side, Handle::current());
        let mut client = BufReader::new(client);

        session.disconnect();
        wait_until_closed(&session).await;
        session.enqueue("too late");

        assert_eq!(read_line(&mut client).await?, None);
        assert!(session.pending().is_empty());
        assert!(!session.try_enqueue("still too late".into()));
        Ok(())
    }

    #[tokio::test]
    async fn write_failure_closes_session_and_abandons_queue() -> Result<()> {
        let (server_side, client) = socket_pair().await?;
        let session = Session::new(server_side, Handle::current());

        // Zero linger makes the drop send a reset instead of a FIN.
        client.set_linger(Some(Duration::ZERO))?;
        drop(client);
        sleep(Duration::from_millis(50)).await;

        let chunk = "x".repeat(64 * 1024);
        for _ in 0..64 {
            session.enqueue(chunk.clone());
        }

        // No read loop is running, so only the failed write can close it.
        wait_until_closed(&session).await;
        let abandoned = session.pending();
        assert!(!abandoned.is_empty());
        assert!(abandoned.iter().all(|message| *message == chunk));

        session.enqueue("after the reset");
        assert_eq!(session.pending().len(), abandoned.len());
        Ok(())
    }

    #[tokio::test]
    async fn second_start_is_ignored() -> Result<()> {
        let (server_side, mut client) = socket_pair().await?;
        let session = Session::new(server_side, Handle::current());
        let (first, mut first_lines) = channel_handler();
        let (second, mut second_lines) = channel_handler();
        session.start(first, None);
        session.start(second, None);

        client.write_all(b"once\n").await?;

        assert_eq!(timeout(WAIT, first_lines.recv()).await?.as_deref(), Some("once"));
        assert!(second_lines.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn id_is_assigned_once_registered() -> Result<()> {
        let (server_side, _client) = socket_pair().await?;
        let session = Session::new(server_side, Handle::current());
        assert_eq!(session.id(), 0);
        session.set_id(1001);
        assert_eq!(session.id(), 1001);
        assert!(session.peer_addr().is_some());
        Ok(())
    }
}
