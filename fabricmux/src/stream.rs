//! A single logical stream multiplexed over a fabric.
//!
//! State machine:
//!
//! ```text
//! UNKNOWN --dial-->      SYN_SENT --RESULT(ok)--> EST
//! UNKNOWN --peer SYN-->  SYN_RECV --accept-->      EST
//! EST     --local close--> FIN_SENT --peer FIN--> UNKNOWN (final)
//! EST     --peer FIN-->    FIN_RECV --local close--> UNKNOWN (final)
//! any     --RST (either direction)-->              UNKNOWN (final)
//! ```
//!
//! `send_window` and `state` share one mutex so that a RESULT/WND/FIN/RST
//! delivered by the fabric's reader loop and a blocked `write`/`dial` on the
//! application side can never observe a torn update.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::addr::StreamAddr;
use crate::error::{FabricError, Result};
use crate::fabric::FabricInner;
use crate::frame::Frame;
use crate::queue::ByteQueue;

/// Stream state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No live registration: never opened, or fully torn down.
    Unknown,
    /// Local dial sent, awaiting the peer's RESULT.
    SynSent,
    /// Peer's SYN accepted locally, awaiting our RESULT to go out.
    SynRecv,
    /// Fully open for bidirectional I/O.
    Est,
    /// Local write-half closed (FIN sent); peer may still send.
    FinSent,
    /// Peer write-half closed (FIN received); local side may still send.
    FinRecv,
}

pub(crate) enum DialOutcome {
    Accepted,
    Rejected(u32),
}

pub(crate) struct StreamInner {
    pub(crate) state: StreamState,
    pub(crate) send_window: i32,
    pub(crate) dial_outcome: Option<DialOutcome>,
}

pub(crate) struct StreamShared {
    pub(crate) id: u16,
    pub(crate) inner: Mutex<StreamInner>,
    pub(crate) send_condvar: Condvar,
    pub(crate) syn_condvar: Condvar,
    pub(crate) recv_queue: ByteQueue,
    read_carry: Mutex<Option<Bytes>>,
    pub(crate) fabric: Weak<FabricInner>,
}

impl StreamShared {
    pub(crate) fn new(id: u16, fabric: Weak<FabricInner>, state: StreamState, window: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(StreamInner {
                state,
                send_window: window as i32,
                dial_outcome: None,
            }),
            send_condvar: Condvar::new(),
            syn_condvar: Condvar::new(),
            recv_queue: ByteQueue::new(),
            read_carry: Mutex::new(None),
            fabric,
        })
    }
}

/// A multiplexed byte stream. Cheaply `Clone`-able; all clones share the
/// same underlying state and may be used from different threads (e.g. one
/// pumping reads, one pumping writes).
#[derive(Clone)]
pub struct Stream {
    pub(crate) shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u16 {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        self.shared.inner.lock().state
    }

    pub fn local_addr(&self) -> StreamAddr {
        let endpoint = self
            .shared
            .fabric
            .upgrade()
            .map(|f| f.config.local_endpoint.clone())
            .unwrap_or_else(|| "closed".into());
        StreamAddr {
            endpoint,
            stream_id: self.shared.id,
        }
    }

    pub fn remote_addr(&self) -> StreamAddr {
        let endpoint = self
            .shared
            .fabric
            .upgrade()
            .map(|f| f.config.remote_endpoint.clone())
            .unwrap_or_else(|| "closed".into());
        StreamAddr {
            endpoint,
            stream_id: self.shared.id,
        }
    }

    /// Wait (with `timeout`) for a `dial` to resolve. Only ever called by
    /// `Fabric::dial` on a stream it just created in `SYN_SENT`.
    pub(crate) fn wait_for_dial(&self, timeout: Duration) -> Option<DialOutcome> {
        let mut guard = self.shared.inner.lock();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = guard.dial_outcome.take() {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline - now;
            let wait_result = self.shared.syn_condvar.wait_for(&mut guard, remaining);
            if wait_result.timed_out() && guard.dial_outcome.is_none() {
                return None;
            }
        }
    }

    /// Reads at least one byte if the stream is alive, blocking only until
    /// the first byte of this call arrives. Once data is flowing, tops up
    /// `buf` with whatever else is already queued without waiting further.
    /// Returns `Ok(0)` once the receive side has been closed and drained
    /// (the stream's own end-of-stream signal).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut total = 0;

        {
            let mut carry = self.read_carry_lock();
            if let Some(chunk) = carry.take() {
                total += Self::fill_from(&mut buf[total..], chunk, &mut carry);
            }
        }

        if total == 0 {
            match self.shared.recv_queue.pop(true) {
                Ok(Some(chunk)) => {
                    let mut carry = self.read_carry_lock();
                    total += Self::fill_from(&mut buf[total..], chunk, &mut carry);
                }
                Ok(None) => unreachable!("blocking pop never returns None"),
                Err(FabricError::QueueClosed) => return Ok(0),
                Err(e) => return Err(e),
            }
        }

        while total < buf.len() {
            match self.shared.recv_queue.pop(false) {
                Ok(Some(chunk)) => {
                    let mut carry = self.read_carry_lock();
                    total += Self::fill_from(&mut buf[total..], chunk, &mut carry);
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if total > 0 {
            self.credit_peer(total as u32);
        }
        Ok(total)
    }

    fn read_carry_lock(&self) -> parking_lot::MutexGuard<'_, Option<Bytes>> {
        self.shared.read_carry.lock()
    }

    fn fill_from(dst: &mut [u8], chunk: Bytes, carry: &mut Option<Bytes>) -> usize {
        let n = dst.len().min(chunk.len());
        dst[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            *carry = Some(chunk.slice(n..));
        }
        n
    }

    fn credit_peer(&self, n: u32) {
        if let Some(fabric) = self.shared.fabric.upgrade() {
            let _ = fabric.emit(&Frame::Wnd {
                stream_id: self.shared.id,
                credit: n,
            });
        }
    }

    /// Writes `buf` in randomly sized chunks (per the fabric's configured
    /// bounds), blocking on the send window whenever the peer hasn't
    /// credited enough room for the next chunk.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let fabric = self
            .shared
            .fabric
            .upgrade()
            .ok_or(FabricError::FabricClosed)?;
        let (min_chunk, max_chunk) = fabric.write_chunk_bounds();

        let mut written = 0;
        while written < buf.len() {
            let remaining = buf.len() - written;
            let chunk_size = if remaining <= min_chunk || min_chunk + 1 >= max_chunk {
                remaining.min(max_chunk)
            } else {
                rand::thread_rng()
                    .gen_range(min_chunk..max_chunk)
                    .min(remaining)
            };

            {
                let mut guard = self.shared.inner.lock();
                self.ensure_writable(&guard)?;
                while guard.send_window < chunk_size as i32 {
                    self.shared.send_condvar.wait(&mut guard);
                    self.ensure_writable(&guard)?;
                }
                guard.send_window -= chunk_size as i32;
            }

            let chunk = Bytes::copy_from_slice(&buf[written..written + chunk_size]);
            fabric.emit(&Frame::Data {
                stream_id: self.shared.id,
                payload: chunk,
            })?;
            written += chunk_size;
        }
        Ok(written)
    }

    fn ensure_writable(&self, guard: &parking_lot::MutexGuard<'_, StreamInner>) -> Result<()> {
        match guard.state {
            StreamState::Est | StreamState::FinRecv => Ok(()),
            _ => Err(FabricError::BrokenPipe(self.shared.id)),
        }
    }

    /// Half-close (or, on a stream never established, abandon). Idempotent:
    /// calling this again after the first successful close is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.shared.inner.lock();
        match guard.state {
            StreamState::Est => {
                guard.state = StreamState::FinSent;
                drop(guard);
                self.emit(Frame::Fin {
                    stream_id: self.shared.id,
                })
            }
            StreamState::FinRecv => {
                guard.state = StreamState::Unknown;
                drop(guard);
                self.shared.recv_queue.close();
                self.shared.send_condvar.notify_all();
                let result = self.emit(Frame::Fin {
                    stream_id: self.shared.id,
                });
                self.finalize();
                result
            }
            StreamState::SynSent | StreamState::SynRecv => {
                guard.state = StreamState::Unknown;
                drop(guard);
                self.shared.recv_queue.close();
                self.finalize();
                Ok(())
            }
            StreamState::Unknown | StreamState::FinSent => Ok(()),
        }
    }

    /// Hard reset: tear the stream down immediately in both directions and
    /// tell the peer with an RST frame. Idempotent. Unlike `close`, this
    /// abandons any data the peer has already sent but the local side
    /// hasn't yet read.
    pub fn reset(&self) -> Result<()> {
        {
            let mut guard = self.shared.inner.lock();
            if guard.state == StreamState::Unknown {
                return Ok(());
            }
            guard.state = StreamState::Unknown;
        }
        self.shared.recv_queue.close();
        self.shared.send_condvar.notify_all();
        let result = self.emit(Frame::Rst {
            stream_id: self.shared.id,
        });
        self.finalize();
        result
    }

    fn emit(&self, frame: Frame) -> Result<()> {
        match self.shared.fabric.upgrade() {
            Some(fabric) => fabric.emit(&frame),
            None => Ok(()),
        }
    }

    fn finalize(&self) {
        if let Some(fabric) = self.shared.fabric.upgrade() {
            fabric.unregister(self.shared.id);
        }
    }
}

impl std::io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Stream::read(self, buf).map_err(FabricError::into_io_error)
    }
}

impl std::io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Stream::write(self, buf).map_err(FabricError::into_io_error)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_stream(state: StreamState) -> Stream {
        let shared = StreamShared::new(1, Weak::new(), state, 1024);
        Stream::new(shared)
    }

    #[test]
    fn read_on_closed_queue_is_eof() {
        let s = detached_stream(StreamState::Est);
        s.shared.recv_queue.close();
        let mut buf = [0u8; 16];
        assert_eq!(s.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn read_fills_from_carry_before_blocking() {
        let s = detached_stream(StreamState::Est);
        s.shared.recv_queue.push(Bytes::from_static(b"hello")).unwrap();
        let mut small = [0u8; 2];
        assert_eq!(s.read(&mut small).unwrap(), 2);
        assert_eq!(&small, b"he");

        let mut rest = [0u8; 16];
        let n = s.read(&mut rest).unwrap();
        assert_eq!(&rest[..n], b"llo");
    }

    #[test]
    fn write_without_fabric_is_broken_pipe() {
        let s = detached_stream(StreamState::Est);
        let err = s.write(b"x").unwrap_err();
        assert!(matches!(err, FabricError::FabricClosed));
    }

    #[test]
    fn close_on_unknown_is_noop() {
        let s = detached_stream(StreamState::Unknown);
        s.close().unwrap();
        assert_eq!(s.state(), StreamState::Unknown);
    }

    #[test]
    fn close_on_est_sends_fin_and_moves_to_fin_sent() {
        let s = detached_stream(StreamState::Est);
        // No live fabric to emit to; close still transitions state locally.
        s.close().unwrap();
        assert_eq!(s.state(), StreamState::FinSent);
    }

    #[test]
    fn reset_is_idempotent() {
        let s = detached_stream(StreamState::Est);
        s.reset().unwrap();
        assert_eq!(s.state(), StreamState::Unknown);
        s.reset().unwrap();
        assert_eq!(s.state(), StreamState::Unknown);
    }
}
