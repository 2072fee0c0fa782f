//! Connection instance: ordered chunked sends and inbound reassembly over
//! an abstract streaming transport.

use crate::report::ReportSink;
use crate::{Error, Result};
use gwatch_codec::frame::{Frame, FrameKind};
use gwatch_codec::{CapsuleEnvelope, ChannelPayload, Envelope};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Process-unique connection id.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Channel spoken on a connection, fixed by the handshake URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Capsule,
    Gtrace,
    Profiler,
}

impl Role {
    #[must_use]
    pub fn uri(self) -> &'static str {
        match self {
            Self::Capsule => "/capsule/main",
            Self::Gtrace => "/gtrace/main",
            Self::Profiler => "/profiler/main",
        }
    }

    #[must_use]
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "/capsule/main" => Some(Self::Capsule),
            "/gtrace/main" => Some(Self::Gtrace),
            "/profiler/main" => Some(Self::Profiler),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capsule => "capsule",
            Self::Gtrace => "gtrace",
            Self::Profiler => "profiler",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook into the transport driving a connection.
pub trait TransportHandle: Send + Sync {
    /// Ask the transport to call [`ConnectionInstance::send_chunk`] (or the
    /// `next_chunk`/`commit_chunk` pair) when the socket is writable.
    fn request_writable(&self);
}

struct Outgoing {
    bytes: Vec<u8>,
    offset: usize,
}

/// One chunk ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: FrameKind,
    pub data: Vec<u8>,
}

pub struct ConnectionInstance {
    id: ConnId,
    role: Role,
    peer_ip: Option<IpAddr>,
    chunk_size: usize,
    max_message_size: usize,
    outbound: Mutex<VecDeque<Outgoing>>,
    drained: Condvar,
    inbound: Mutex<Vec<u8>>,
    handle: RwLock<Option<Arc<dyn TransportHandle>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInstance")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_ip", &self.peer_ip)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl ConnectionInstance {
    pub fn new(
        role: Role,
        peer_ip: Option<IpAddr>,
        chunk_size: usize,
        max_message_size: usize,
    ) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            role,
            peer_ip,
            chunk_size: chunk_size.max(1),
            max_message_size,
            outbound: Mutex::new(VecDeque::new()),
            drained: Condvar::new(),
            inbound: Mutex::new(Vec::new()),
            handle: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_ip
    }

    /// Bind the transport. Until then `send` returns `NotReady`.
    pub fn attach(&self, handle: Arc<dyn TransportHandle>) {
        self.closed.store(false, Ordering::Release);
        *self.handle.write() = Some(handle);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Queue a message and request a writable notification. Never blocks.
    pub fn send(&self, message: impl Into<Vec<u8>>) -> Result<()> {
        let handle = self
            .handle
            .read()
            .clone()
            .ok_or_else(|| {
                Error::not_ready(format!("{} connection {} not established", self.role, self.id))
            })?;
        self.outbound.lock().push_back(Outgoing {
            bytes: message.into(),
            offset: 0,
        });
        handle.request_writable();
        Ok(())
    }

    pub fn send_envelope<P: ChannelPayload>(&self, envelope: &Envelope<P>) -> Result<()> {
        self.send(envelope.encode()?)
    }

    /// The chunk at the head of the outbound queue, without consuming it.
    #[must_use]
    pub fn next_chunk(&self) -> Option<Chunk> {
        let outbound = self.outbound.lock();
        let head = outbound.front()?;
        let total = head.bytes.len();
        let size = self.chunk_size.min(total - head.offset);
        Some(Chunk {
            kind: FrameKind::for_chunk(head.offset, size, total),
            data: head.bytes[head.offset..head.offset + size].to_vec(),
        })
    }

    /// Mark the head chunk of `len` bytes as written. The message leaves the
    /// queue with its last chunk. Returns whether more data is pending.
    pub fn commit_chunk(&self, len: usize) -> bool {
        let mut outbound = self.outbound.lock();
        if let Some(head) = outbound.front_mut() {
            head.offset += len;
            if head.offset >= head.bytes.len() {
                outbound.pop_front();
            }
        }
        let more = !outbound.is_empty();
        if !more {
            self.drained.notify_all();
        }
        more
    }

    /// Write one chunk through `write`. On error the chunk stays queued.
    /// Re-requests a writable notification while data is pending.
    pub fn send_chunk<F>(&self, write: F) -> Result<bool>
    where
        F: FnOnce(FrameKind, &[u8]) -> Result<()>,
    {
        let Some(chunk) = self.next_chunk() else {
            return Ok(false);
        };
        write(chunk.kind, &chunk.data)?;
        let more = self.commit_chunk(chunk.data.len());
        if more {
            if let Some(handle) = self.handle.read().as_ref() {
                handle.request_writable();
            }
        }
        Ok(more)
    }

    /// Messages not yet fully written.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Block until the outbound queue drains, `stop` is set, or the
    /// connection closes. Returns whether everything was flushed.
    pub fn sync_send(&self, stop: &AtomicBool, poll: Duration) -> bool {
        let mut outbound = self.outbound.lock();
        while !outbound.is_empty() {
            if stop.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
                return false;
            }
            self.drained.wait_for(&mut outbound, poll);
        }
        true
    }

    /// Append a received fragment to the reassembly buffer.
    pub fn recv_fragment(&self, bytes: &[u8]) -> Result<()> {
        let mut inbound = self.inbound.lock();
        if inbound.len().saturating_add(bytes.len()) > self.max_message_size {
            return Err(Error::BufferFull {
                max_bytes: self.max_message_size,
            });
        }
        inbound.extend_from_slice(bytes);
        Ok(())
    }

    /// Take the reassembled message, leaving the buffer empty.
    pub fn export_message(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inbound.lock())
    }

    pub fn reset(&self) {
        self.inbound.lock().clear();
    }

    #[must_use]
    pub fn inbound_len(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Feed one data frame. Returns the whole message once its final
    /// fragment arrives. An oversized message is discarded.
    pub fn on_frame(&self, frame: &Frame) -> Result<Option<Vec<u8>>> {
        if frame.kind.is_first() {
            self.reset();
        }
        if let Err(err) = self.recv_fragment(&frame.data) {
            self.reset();
            return Err(err);
        }
        if frame.kind.is_final() {
            return Ok(Some(self.export_message()));
        }
        Ok(None)
    }

    /// Detach from the transport and drop queued sends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        *self.handle.write() = None;
        let mut outbound = self.outbound.lock();
        outbound.clear();
        self.drained.notify_all();
        drop(outbound);
        self.reset();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ReportSink for ConnectionInstance {
    fn report(&self, envelope: &CapsuleEnvelope) -> Result<()> {
        self.send_envelope(envelope)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use gwatch_codec::frame::CHUNK_SIZE;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHandle {
        requests: AtomicUsize,
    }

    impl TransportHandle for CountingHandle {
        fn request_writable(&self) {
            self.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn connected(chunk_size: usize) -> (ConnectionInstance, Arc<CountingHandle>) {
        let conn = ConnectionInstance::new(Role::Capsule, None, chunk_size, 1 << 20);
        let handle = Arc::new(CountingHandle::default());
        conn.attach(Arc::clone(&handle) as Arc<dyn TransportHandle>);
        (conn, handle)
    }

    fn drain(conn: &ConnectionInstance) -> Vec<(FrameKind, Vec<u8>)> {
        let mut frames = Vec::new();
        loop {
            let more = conn
                .send_chunk(|kind, data| {
                    frames.push((kind, data.to_vec()));
                    Ok(())
                })
                .unwrap();
            if !more {
                break;
            }
        }
        frames
    }

    #[test]
    fn send_before_attach_is_not_ready() {
        let conn = ConnectionInstance::new(Role::Gtrace, None, CHUNK_SIZE, 1024);
        assert!(conn.send("x").unwrap_err().is_retryable());
    }

    #[test]
    fn roles_round_trip_through_uri() {
        for role in [Role::Capsule, Role::Gtrace, Role::Profiler] {
            assert_eq!(Role::from_uri(role.uri()), Some(role));
        }
        assert_eq!(Role::from_uri("/other"), None);
    }

    #[test]
    fn chunk_flags_follow_position() {
        let (conn, handle) = connected(4);
        conn.send("abcdefghij").unwrap();
        conn.send("xy").unwrap();
        let frames = drain(&conn);
        let kinds: Vec<_> = frames.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(
            kinds,
            [FrameKind::FirstMore, FrameKind::Middle, FrameKind::Last, FrameKind::FirstOnly]
        );
        assert_eq!(frames[3].1, b"xy");
        assert_eq!(conn.pending(), 0);
        assert!(handle.requests.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn failed_write_keeps_chunk_queued() {
        let (conn, _) = connected(4);
        conn.send("abcdef").unwrap();
        assert!(conn.send_chunk(|_, _| Err(Error::failed("socket"))).is_err());
        assert_eq!(conn.next_chunk().unwrap().data, b"abcd");
    }

    #[test]
    fn five_fragment_reassembly() {
        let conn = ConnectionInstance::new(Role::Capsule, None, CHUNK_SIZE, 8 * CHUNK_SIZE);
        let message: Vec<u8> = (0..5 * CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        let kinds = [
            FrameKind::FirstMore,
            FrameKind::Middle,
            FrameKind::Middle,
            FrameKind::Middle,
            FrameKind::Last,
        ];
        let mut result = None;
        for (i, kind) in kinds.into_iter().enumerate() {
            let frame = Frame::new(kind, message[i * CHUNK_SIZE..(i + 1) * CHUNK_SIZE].to_vec());
            result = conn.on_frame(&frame).unwrap();
            assert_eq!(result.is_some(), i == 4);
        }
        assert_eq!(result.unwrap(), message);
        assert_eq!(conn.inbound_len(), 0);
    }

    #[test]
    fn oversized_message_is_buffer_full() {
        let conn = ConnectionInstance::new(Role::Capsule, None, 4, 6);
        conn.recv_fragment(b"abcd").unwrap();
        let err = conn.recv_fragment(b"efg").unwrap_err();
        assert!(matches!(err, Error::BufferFull { max_bytes: 6 }));
        assert!(conn.on_frame(&Frame::new(FrameKind::FirstOnly, vec![0; 7])).is_err());
        assert_eq!(conn.inbound_len(), 0);
    }

    #[test]
    fn sync_send_returns_when_drained() {
        let (conn, _) = connected(2);
        let conn = Arc::new(conn);
        conn.send("abcdef").unwrap();
        let writer = {
            let conn = Arc::clone(&conn);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                drain(&conn).len()
            })
        };
        let stop = AtomicBool::new(false);
        assert!(conn.sync_send(&stop, Duration::from_millis(5)));
        assert_eq!(writer.join().unwrap(), 3);
    }

    #[test]
    fn sync_send_honours_stop_and_close() {
        let (conn, _) = connected(2);
        conn.send("abcdef").unwrap();
        let stop = AtomicBool::new(true);
        assert!(!conn.sync_send(&stop, Duration::from_millis(1)));
        conn.close();
        assert_eq!(conn.pending(), 0);
        assert!(!conn.is_ready());
    }

    proptest! {
        #[test]
        fn chunks_concatenate_to_message(
            message in proptest::collection::vec(any::<u8>(), 0..2000),
            chunk_size in 1usize..300,
        ) {
            let (conn, _) = connected(chunk_size);
            conn.send(message.clone()).unwrap();
            let frames = drain(&conn);
            let joined: Vec<u8> = frames.iter().flat_map(|(_, data)| data.clone()).collect();
            prop_assert_eq!(&joined, &message);
            prop_assert!(frames[0].0.is_first());
            prop_assert!(frames.last().unwrap().0.is_final());

            let receiver = ConnectionInstance::new(Role::Capsule, None, chunk_size, 1 << 20);
            let mut out = None;
            for (kind, data) in frames {
                out = receiver.on_frame(&Frame::new(kind, data)).unwrap();
            }
            prop_assert_eq!(out, Some(message));
        }
    }
}
