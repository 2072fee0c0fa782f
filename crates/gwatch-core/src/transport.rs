//! TCP transport for [`ConnectionInstance`].
//!
//! The connecting side opens with a handshake frame carrying its role URI
//! (`/capsule/main`, `/gtrace/main`, `/profiler/main`). After that, each
//! connection runs three tasks:
//!
//! - a reader that reassembles frames into messages,
//! - a writer that drains the outbound queue whenever the connection asks
//!   for a writable notification,
//! - a dispatcher that hands complete messages to [`ConnectionEvents`]
//!   one at a time. The next message of a connection is only dispatched
//!   after the previous handler returned.

use crate::config::Config;
use crate::connection::{ConnectionInstance, Role, TransportHandle};
use crate::{Error, Result};
use gwatch_codec::CodecError;
use gwatch_codec::frame::{FrameKind, read_frame, write_frame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc, watch};

/// Callbacks for one side of the transport. Handlers run on the blocking
/// pool, so they may take locks and touch SQLite.
pub trait ConnectionEvents: Send + Sync + 'static {
    fn on_connect(&self, conn: &Arc<ConnectionInstance>);

    fn on_message(&self, conn: &Arc<ConnectionInstance>, message: Vec<u8>);

    fn on_disconnect(&self, conn: &Arc<ConnectionInstance>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub chunk_size: usize,
    pub max_message_size: usize,
    /// Complete messages buffered per connection before the reader waits.
    pub queue_depth: usize,
    pub handshake_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            chunk_size: gwatch_codec::frame::CHUNK_SIZE,
            max_message_size: gwatch_codec::frame::MAX_MESSAGE_SIZE,
            queue_depth: 1024,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.transport.chunk_size,
            max_message_size: config.transport.max_message_size,
            queue_depth: config.scheduler.handler_queue_depth,
            handshake_timeout: Duration::from_millis(config.capsule.connect_timeout_ms),
        }
    }
}

struct NotifyHandle(Arc<Notify>);

impl TransportHandle for NotifyHandle {
    fn request_writable(&self) {
        self.0.notify_one();
    }
}

/// Accept connections until `shutdown` flips to true.
pub async fn serve<E: ConnectionEvents>(
    listener: TcpListener,
    events: Arc<E>,
    options: TransportOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "listening");
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let events = Arc::clone(&events);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let accepted =
                                accept_connection(stream, peer, events, options, shutdown).await;
                            if let Err(err) = accepted {
                                tracing::warn!(%peer, error = %err, "connection ended with error");
                            }
                        });
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!(addr = %local, "listener stopped");
    Ok(())
}

async fn accept_connection<E: ConnectionEvents>(
    stream: TcpStream,
    peer: SocketAddr,
    events: Arc<E>,
    options: TransportOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let frame = tokio::time::timeout(
        options.handshake_timeout,
        read_frame(&mut reader, options.max_message_size),
    )
    .await
    .map_err(|_| Error::not_ready(format!("no handshake from {peer}")))??;
    if frame.kind != FrameKind::Handshake {
        return Err(Error::invalid_input(format!("{peer} sent data before its handshake")));
    }
    let uri = String::from_utf8_lossy(&frame.data).into_owned();
    let role = Role::from_uri(&uri)
        .ok_or_else(|| Error::invalid_input(format!("unknown connection uri {uri:?}")))?;

    let conn = Arc::new(ConnectionInstance::new(
        role,
        Some(peer.ip()),
        options.chunk_size,
        options.max_message_size,
    ));
    tracing::debug!(conn_id = conn.id(), %role, %peer, "connection accepted");
    drive(conn, reader, writer, events, options, shutdown).await
}

/// Dial `addr`, announce `role`, and service the connection until it closes
/// or `shutdown` flips.
pub async fn connect<E: ConnectionEvents>(
    addr: String,
    role: Role,
    events: Arc<E>,
    options: TransportOptions,
    connect_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr.as_str()))
        .await
        .map_err(|_| Error::not_ready(format!("timed out connecting to {addr}")))??;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr().ok().map(|addr| addr.ip());
    let (reader, mut writer) = stream.into_split();
    write_frame(&mut writer, FrameKind::Handshake, role.uri().as_bytes()).await?;

    let conn = Arc::new(ConnectionInstance::new(
        role,
        peer,
        options.chunk_size,
        options.max_message_size,
    ));
    tracing::info!(conn_id = conn.id(), %role, %addr, "connected");
    drive(conn, reader, writer, events, options, shutdown).await
}

async fn drive<E, R, W>(
    conn: Arc<ConnectionInstance>,
    reader: R,
    writer: W,
    events: Arc<E>,
    options: TransportOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    E: ConnectionEvents,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let notify = Arc::new(Notify::new());
    conn.attach(Arc::new(NotifyHandle(Arc::clone(&notify))));
    events.on_connect(&conn);

    let (tx, rx) = mpsc::channel(options.queue_depth.max(1));
    let dispatcher = tokio::spawn(dispatch(Arc::clone(&conn), Arc::clone(&events), rx));
    let writer_task = tokio::spawn(write_loop(Arc::clone(&conn), writer, notify));

    let result = read_loop(&conn, reader, tx, options.max_message_size, shutdown).await;

    writer_task.abort();
    conn.close();
    if let Err(err) = dispatcher.await {
        tracing::warn!(conn_id = conn.id(), error = %err, "dispatcher task failed");
    }
    events.on_disconnect(&conn);
    tracing::debug!(conn_id = conn.id(), role = %conn.role(), "connection closed");
    result
}

async fn read_loop<R: AsyncRead + Unpin>(
    conn: &Arc<ConnectionInstance>,
    mut reader: R,
    tx: mpsc::Sender<Vec<u8>>,
    max_frame: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_frame) => frame,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                continue;
            }
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(CodecError::Io(err)) if is_disconnect(&err) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if frame.kind == FrameKind::Handshake {
            tracing::debug!(conn_id = conn.id(), "ignoring repeated handshake");
            continue;
        }
        match conn.on_frame(&frame) {
            Ok(Some(message)) => {
                if tx.send(message).await.is_err() {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(conn_id = conn.id(), error = %err, "inbound message dropped");
            }
        }
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
    )
}

async fn write_loop<W: AsyncWrite + Unpin>(
    conn: Arc<ConnectionInstance>,
    mut writer: W,
    notify: Arc<Notify>,
) {
    loop {
        notify.notified().await;
        while let Some(chunk) = conn.next_chunk() {
            if let Err(err) = write_frame(&mut writer, chunk.kind, &chunk.data).await {
                tracing::warn!(conn_id = conn.id(), error = %err, "write failed");
                return;
            }
            conn.commit_chunk(chunk.data.len());
        }
    }
}

async fn dispatch<E: ConnectionEvents>(
    conn: Arc<ConnectionInstance>,
    events: Arc<E>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(message) = rx.recv().await {
        let conn = Arc::clone(&conn);
        let events = Arc::clone(&events);
        let handled = tokio::task::spawn_blocking(move || events.on_message(&conn, message)).await;
        if let Err(err) = handled {
            tracing::error!(error = %err, "message handler panicked");
        }
    }
}
