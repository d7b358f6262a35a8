//! The multiplexer itself: demultiplexes inbound frames onto per-stream
//! queues, serializes outbound frames onto the single underlying writer, and
//! owns stream-id allocation.
//!
//! Lock order, always: a stream's own mutex before the fabric's write lock.
//! The reader loop never holds the write lock while holding a stream lock —
//! it looks a stream up, drops the table lock, then operates on the `Arc`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::FabricConfig;
use crate::error::{code, FabricError, Result};
use crate::frame::{read_frame, write_frame, Frame};
use crate::stream::{DialOutcome, Stream, StreamShared, StreamState};

/// Decides whether to accept a peer-initiated stream. Receives the dialed
/// `network`/`address` tag the peer sent in its SYN and a `Stream` handle
/// already wired to this fabric (but not yet visible to any other lookup)
/// so the callback can start relaying immediately on acceptance. Returning
/// `Err(code)` rejects with that RESULT error code and the stream is
/// discarded without ever being registered.
pub type Acceptor = dyn Fn(&str, &str, Stream) -> std::result::Result<(), u32> + Send + Sync;

struct StreamTable {
    streams: HashMap<u16, Arc<StreamShared>>,
    next_id: u16,
}

pub(crate) struct FabricInner {
    writer: Mutex<Box<dyn Write + Send>>,
    table: Mutex<StreamTable>,
    on_accept: Box<Acceptor>,
    pub(crate) config: FabricConfig,
    closed: AtomicBool,
}

impl FabricInner {
    pub(crate) fn emit(&self, frame: &Frame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::FabricClosed);
        }
        let mut w = self.writer.lock();
        write_frame(&mut *w, frame)
    }

    pub(crate) fn write_chunk_bounds(&self) -> (usize, usize) {
        (self.config.min_write_chunk, self.config.max_write_chunk)
    }

    pub(crate) fn unregister(&self, id: u16) {
        self.table.lock().streams.remove(&id);
    }

    fn lookup(&self, id: u16) -> Option<Arc<StreamShared>> {
        self.table.lock().streams.get(&id).cloned()
    }

    /// Find a free id and register a freshly built stream under it, atomically.
    fn allocate(
        self: &Arc<Self>,
        state: StreamState,
    ) -> Result<(u16, Arc<StreamShared>)> {
        let mut table = self.table.lock();
        let start = table.next_id;
        let mut candidate = start;
        loop {
            if !table.streams.contains_key(&candidate) {
                let shared = StreamShared::new(candidate, Arc::downgrade(self), state, self.config.window_size);
                table.streams.insert(candidate, shared.clone());
                table.next_id = candidate.wrapping_add(1);
                return Ok((candidate, shared));
            }
            candidate = candidate.wrapping_add(1);
            if candidate == start {
                return Err(FabricError::IdExhausted);
            }
        }
    }

    /// Reserve `id` for an inbound SYN if it's free. Returns `None` if the
    /// id is already registered (a protocol error on the peer's part).
    fn reserve(self: &Arc<Self>, id: u16) -> Option<Arc<StreamShared>> {
        let mut table = self.table.lock();
        if table.streams.contains_key(&id) {
            return None;
        }
        let shared = StreamShared::new(id, Arc::downgrade(self), StreamState::SynRecv, self.config.window_size);
        table.streams.insert(id, shared.clone());
        Some(shared)
    }

    fn reset_stream(self: &Arc<Self>, id: u16, send_wire_rst: bool) {
        let shared = self.table.lock().streams.remove(&id);
        if let Some(shared) = shared {
            let mut guard = shared.inner.lock();
            guard.state = StreamState::Unknown;
            drop(guard);
            shared.recv_queue.close();
            shared.send_condvar.notify_all();
            shared.syn_condvar.notify_all();
        }
        if send_wire_rst {
            let _ = self.emit(&Frame::Rst { stream_id: id });
        }
    }

    fn on_peer_fin(self: &Arc<Self>, shared: &Arc<StreamShared>, id: u16) {
        let mut guard = shared.inner.lock();
        match guard.state {
            StreamState::Est => {
                guard.state = StreamState::FinRecv;
                drop(guard);
                shared.recv_queue.close();
            }
            StreamState::FinSent => {
                guard.state = StreamState::Unknown;
                drop(guard);
                shared.recv_queue.close();
                shared.send_condvar.notify_all();
                self.unregister(id);
            }
            _ => {}
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Syn {
                stream_id,
                network,
                address,
            } => {
                let Some(shared) = self.reserve(stream_id) else {
                    warn!(stream_id, "SYN for already-registered stream id; resetting");
                    self.reset_stream(stream_id, true);
                    return;
                };
                let stream = Stream::new(shared.clone());
                match (self.on_accept)(&network, &address, stream) {
                    Ok(()) => {
                        shared.inner.lock().state = StreamState::Est;
                        if let Err(e) = self.emit(&Frame::Result {
                            stream_id,
                            error_code: code::ERR_NONE,
                        }) {
                            error!(?e, stream_id, "failed to emit accept RESULT");
                        }
                    }
                    Err(err_code) => {
                        self.unregister(stream_id);
                        shared.inner.lock().state = StreamState::Unknown;
                        shared.recv_queue.close();
                        if let Err(e) = self.emit(&Frame::Result {
                            stream_id,
                            error_code: err_code,
                        }) {
                            error!(?e, stream_id, "failed to emit reject RESULT");
                        }
                    }
                }
            }
            Frame::Result {
                stream_id,
                error_code,
            } => {
                let Some(shared) = self.lookup(stream_id) else {
                    debug!(stream_id, "RESULT for unknown stream id; dropping");
                    return;
                };
                let mut guard = shared.inner.lock();
                if guard.state != StreamState::SynSent {
                    drop(guard);
                    warn!(stream_id, "RESULT for stream not awaiting dial; resetting");
                    self.reset_stream(stream_id, true);
                    return;
                }
                if error_code == code::ERR_NONE {
                    guard.state = StreamState::Est;
                    guard.dial_outcome = Some(DialOutcome::Accepted);
                } else {
                    guard.state = StreamState::Unknown;
                    guard.dial_outcome = Some(DialOutcome::Rejected(error_code));
                }
                drop(guard);
                shared.syn_condvar.notify_all();
                if error_code != code::ERR_NONE {
                    shared.recv_queue.close();
                    self.unregister(stream_id);
                }
            }
            Frame::Data { stream_id, payload } => {
                let Some(shared) = self.lookup(stream_id) else {
                    debug!(stream_id, "DATA for unknown stream id; dropping");
                    return;
                };
                let deliverable = matches!(
                    shared.inner.lock().state,
                    StreamState::Est | StreamState::FinSent
                );
                if deliverable {
                    let _ = shared.recv_queue.push(payload);
                }
            }
            Frame::Wnd { stream_id, credit } => {
                let Some(shared) = self.lookup(stream_id) else {
                    debug!(stream_id, "WND for unknown stream id; dropping");
                    return;
                };
                let mut guard = shared.inner.lock();
                guard.send_window = guard.send_window.saturating_add(credit as i32);
                drop(guard);
                shared.send_condvar.notify_all();
            }
            Frame::Fin { stream_id } => {
                let Some(shared) = self.lookup(stream_id) else {
                    debug!(stream_id, "FIN for unknown stream id; dropping");
                    return;
                };
                self.on_peer_fin(&shared, stream_id);
            }
            Frame::Rst { stream_id } => {
                self.reset_stream(stream_id, false);
            }
        }
    }

    fn teardown(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let streams: Vec<Arc<StreamShared>> = self.table.lock().streams.drain().map(|(_, v)| v).collect();
        for shared in streams {
            shared.inner.lock().state = StreamState::Unknown;
            shared.recv_queue.close();
            shared.send_condvar.notify_all();
            shared.syn_condvar.notify_all();
        }
    }
}

/// One multiplexed fabric over a reliable, ordered, bidirectional byte
/// channel. `Clone`-able: the clone running `run()` and the clones issuing
/// `dial`/`close` from other threads all share the same underlying state.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
    reader: Arc<Mutex<Option<Box<dyn Read + Send>>>>,
}

impl Fabric {
    pub fn new<R, W, A>(reader: R, writer: W, on_accept: A) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        A: Fn(&str, &str, Stream) -> std::result::Result<(), u32> + Send + Sync + 'static,
    {
        Self::with_config(reader, writer, on_accept, FabricConfig::default())
    }

    pub fn with_config<R, W, A>(reader: R, writer: W, on_accept: A, config: FabricConfig) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        A: Fn(&str, &str, Stream) -> std::result::Result<(), u32> + Send + Sync + 'static,
    {
        let inner = Arc::new(FabricInner {
            writer: Mutex::new(Box::new(writer)),
            table: Mutex::new(StreamTable {
                streams: HashMap::new(),
                next_id: 1,
            }),
            on_accept: Box::new(on_accept),
            config,
            closed: AtomicBool::new(false),
        });
        Self {
            inner,
            reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
        }
    }

    /// Runs the reader loop on the calling thread until the underlying
    /// reader errors, returns EOF, or the fabric is closed. Typically
    /// spawned onto a dedicated thread by the caller. May only be called
    /// once per `Fabric` (the reader is taken on first call).
    pub fn run(&self) -> Result<()> {
        let mut reader = self
            .reader
            .lock()
            .take()
            .ok_or(FabricError::FabricClosed)?;
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            let frame = match read_frame(&mut reader, self.inner.config.max_frame_payload) {
                Ok(f) => f,
                Err(FabricError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.inner.teardown();
                    return Ok(());
                }
                Err(e) => {
                    error!(?e, "fabric codec error; tearing down");
                    self.inner.teardown();
                    return Err(e);
                }
            };
            self.inner.dispatch(frame);
        }
    }

    /// Opens a new stream to `network`/`address` on the peer, blocking
    /// until the peer's RESULT arrives or the dial timeout elapses.
    pub fn dial(&self, network: &str, address: &str) -> Result<Stream> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(FabricError::FabricClosed);
        }
        let (id, shared) = self.inner.allocate(StreamState::SynSent)?;

        if let Err(e) = self.inner.emit(&Frame::Syn {
            stream_id: id,
            network: network.to_string(),
            address: address.to_string(),
        }) {
            self.inner.unregister(id);
            return Err(e);
        }

        let stream = Stream::new(shared);
        match stream.wait_for_dial(self.inner.config.dial_timeout) {
            Some(DialOutcome::Accepted) => Ok(stream),
            Some(DialOutcome::Rejected(code)) => Err(FabricError::DialRefused {
                network: network.to_string(),
                address: address.to_string(),
                code,
            }),
            None => {
                // Never resolved in time; final this stream ourselves,
                // guarded by the same mutex the reader loop would use, so
                // a RESULT racing the deadline can't be lost or double-handled.
                let mut guard = stream.shared.inner.lock();
                if guard.state == StreamState::SynSent {
                    guard.state = StreamState::Unknown;
                    drop(guard);
                    stream.shared.recv_queue.close();
                    self.inner.unregister(id);
                } else {
                    drop(guard);
                }
                Err(FabricError::DialTimeout {
                    network: network.to_string(),
                    address: address.to_string(),
                })
            }
        }
    }

    /// Tears down every live stream and marks the fabric closed. Further
    /// `dial`s and stream I/O fail with `FabricClosed`/`BrokenPipe`.
    pub fn close(&self) -> Result<()> {
        self.inner.teardown();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn noop_acceptor() -> impl Fn(&str, &str, Stream) -> std::result::Result<(), u32> + Send + Sync {
        |_net, _addr, _stream| Ok(())
    }

    fn fabric_with_reader(frames: Vec<u8>) -> Fabric {
        Fabric::new(Cursor::new(frames), Vec::new(), noop_acceptor())
    }

    #[test]
    fn id_allocator_skips_taken_ids_and_wraps() {
        let fabric = fabric_with_reader(Vec::new());
        let (first, _) = fabric.inner.allocate(StreamState::Est).unwrap();
        let (second, _) = fabric.inner.allocate(StreamState::Est).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn id_allocator_exhaustion() {
        let fabric = fabric_with_reader(Vec::new());
        // Pre-fill the entire 16-bit id space via the crate-internal allocator.
        for _ in 0..=u16::MAX {
            fabric.inner.allocate(StreamState::Est).unwrap();
        }
        let err = fabric.inner.allocate(StreamState::Est).unwrap_err();
        assert!(matches!(err, FabricError::IdExhausted));
    }

    #[test]
    fn dial_times_out_when_peer_never_replies() {
        let mut config = FabricConfig::default();
        config.dial_timeout = std::time::Duration::from_millis(20);
        let fabric = Fabric::with_config(Cursor::new(Vec::new()), Vec::new(), noop_acceptor(), config);
        let err = fabric.dial("tcp", "127.0.0.1:1").unwrap_err();
        assert!(matches!(err, FabricError::DialTimeout { .. }));
    }

    #[test]
    fn close_is_idempotent_and_marks_closed() {
        let fabric = fabric_with_reader(Vec::new());
        fabric.close().unwrap();
        fabric.close().unwrap();
        assert!(fabric.is_closed());
    }
}
