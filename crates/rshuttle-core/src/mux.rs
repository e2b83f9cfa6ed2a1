//! The relay multiplexer.
//!
//! `Mux` owns the single duplex byte stream to the relay and demultiplexes
//! inbound frames to per-channel callbacks. Callbacks are modeled as the
//! receiving half of an unbounded channel rather than a boxed closure, so
//! dispatch is a plain map lookup plus a send — no dynamic dispatch, no
//! captured state to reason about (see `spec.md` §9, "tagged handler").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelTable, CONTROL_CHANNEL};
use crate::error::{Error, Result};
use crate::wire::{Command, Frame, FrameHeader, HEADER_LEN};

/// Anything the Mux can treat as the relay's byte stream: a process's piped
/// stdio, a `TcpStream`, or (in tests) an in-memory `tokio::io::duplex` half.
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

/// A message delivered to a registered channel: the command tag and its
/// payload bytes, exactly as they arrived on the wire.
pub type ChannelMessage = (Command, Vec<u8>);

const READ_CHUNK: usize = 64 * 1024;

/// Soft high-water mark on the outbound buffer. Above this, [`Mux::is_full`]
/// reports `true` and the session manager starts latency control.
const DEFAULT_HIGH_WATER: usize = 256 * 1024;
/// Low-water mark; the buffer must drain below this before `is_full` clears.
const DEFAULT_LOW_WATER: usize = 64 * 1024;

/// A lightweight, cheaply-cloned handle used by proxies and listeners to
/// talk to the [`Mux`] without holding a reference to it. All sends are
/// non-blocking: frames are queued and drained the next time [`Mux::tick`]
/// runs.
#[derive(Clone)]
pub struct MuxHandle {
    outbound_tx: mpsc::UnboundedSender<Frame>,
    full: Arc<AtomicBool>,
}

impl MuxHandle {
    /// Queue `payload` for `channel` under `cmd`. Never blocks; silently
    /// dropped if the Mux has already shut down (its receiver is gone).
    pub fn send(&self, channel: u16, cmd: Command, payload: impl Into<Vec<u8>>) {
        let frame = Frame::new(cmd, channel, payload);
        if self.outbound_tx.send(frame).is_err() {
            trace!(channel, "mux handle: stream already gone, dropping frame");
        }
    }

    /// Whether the mux's outbound buffer is over its high-water mark. A
    /// [`Proxy`](crate::proxy::Proxy) consults this on the side feeding a
    /// [`MuxWrapper`](crate::wrapper::MuxWrapper) and pauses reading from
    /// the paired accept socket until it clears — the "cease reading from
    /// accept sockets whose MuxWrapper egress cannot drain" half of latency
    /// control (`spec.md` §4.1/§5).
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Relaxed)
    }
}

/// Owns the relay stream; demultiplexes inbound frames, multiplexes outbound
/// ones, and tracks backpressure against the outbound buffer.
pub struct Mux {
    stream: Box<dyn RelayStream>,
    channels: ChannelTable,
    sinks: HashMap<u16, mpsc::UnboundedSender<ChannelMessage>>,
    read_buf: BytesMut,
    scratch: Vec<u8>,
    outbound: BytesMut,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    high_water: usize,
    low_water: usize,
    full: Arc<AtomicBool>,
}

impl Mux {
    /// Wrap `stream` as the relay connection. Returns the `Mux` plus a
    /// cloneable [`MuxHandle`] for callers that only need to send.
    pub fn new(stream: impl RelayStream + 'static) -> (Self, MuxHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let full = Arc::new(AtomicBool::new(false));
        let handle = MuxHandle {
            outbound_tx: outbound_tx.clone(),
            full: full.clone(),
        };
        let mux = Self {
            stream: Box::new(stream),
            channels: ChannelTable::new(),
            sinks: HashMap::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            scratch: vec![0u8; READ_CHUNK],
            outbound: BytesMut::new(),
            outbound_rx,
            outbound_tx,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            full,
        };
        (mux, handle)
    }

    /// A handle usable from any task that needs to send frames.
    pub fn handle(&self) -> MuxHandle {
        MuxHandle {
            outbound_tx: self.outbound_tx.clone(),
            full: self.full.clone(),
        }
    }

    /// Allocate the next free channel ID, or `None` if the table is
    /// saturated. The caller is expected to drop the new flow with a
    /// warning in that case.
    pub fn next_channel(&mut self) -> Option<u16> {
        self.channels.allocate()
    }

    /// Register a receiver of `ChannelMessage`s for `channel`. Replaces any
    /// prior registration for that channel.
    pub fn register(&mut self, channel: u16, sink: mpsc::UnboundedSender<ChannelMessage>) {
        self.sinks.insert(channel, sink);
    }

    /// Drop the registration for `channel` and, unless it's the control
    /// channel, free the ID back to the table.
    pub fn unregister(&mut self, channel: u16) {
        self.sinks.remove(&channel);
        if channel != CONTROL_CHANNEL {
            self.channels.free(channel);
        }
    }

    pub fn send(&self, channel: u16, cmd: Command, payload: impl Into<Vec<u8>>) {
        let _ = self.outbound_tx.send(Frame::new(cmd, channel, payload));
    }

    /// Number of channels currently registered (excludes channel 0).
    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }

    /// Outbound buffer is over the high-water mark (or was, and hasn't yet
    /// drained below the low-water mark — hysteresis avoids flapping).
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Relaxed)
    }

    fn update_fullness(&mut self) {
        let was_full = self.full.load(Ordering::Relaxed);
        if !was_full && self.outbound.len() > self.high_water {
            self.full.store(true, Ordering::Relaxed);
            warn!(
                buffered = self.outbound.len(),
                "mux outbound buffer over high-water mark, latency control engaged"
            );
        } else if was_full && self.outbound.len() < self.low_water {
            self.full.store(false, Ordering::Relaxed);
            debug!("mux outbound buffer drained below low-water mark");
        }
    }

    /// Drive one round of I/O: drain newly queued outbound frames, then race
    /// a read against a write (whichever the stream is ready for first).
    /// Returns `Err` only on a fatal condition — relay stream closed, or a
    /// bad magic byte on an established stream.
    pub async fn tick(&mut self) -> Result<()> {
        while let Ok(frame) = self.outbound_rx.try_recv() {
            self.outbound.extend_from_slice(&frame.encode());
        }
        self.update_fullness();

        let want_write = !self.outbound.is_empty();
        tokio::select! {
            biased;
            result = self.stream.read(&mut self.scratch) => {
                let n = result?;
                if n == 0 {
                    return Err(Error::FatalRuntime("relay stream closed".into()));
                }
                self.read_buf.extend_from_slice(&self.scratch[..n]);
                self.dispatch_complete_frames()?;
            }
            result = self.stream.write(&self.outbound), if want_write => {
                let n = result?;
                self.outbound.advance(n);
                self.update_fullness();
            }
        }
        Ok(())
    }

    fn dispatch_complete_frames(&mut self) -> Result<()> {
        loop {
            if self.read_buf.len() < HEADER_LEN {
                return Ok(());
            }
            let (channel, cmd, total_len) = {
                let hdr = FrameHeader::parse(&self.read_buf[..HEADER_LEN])?;
                (hdr.channel(), hdr.command(), HEADER_LEN + hdr.length() as usize)
            };
            if self.read_buf.len() < total_len {
                return Ok(());
            }
            let payload = self.read_buf[HEADER_LEN..total_len].to_vec();
            self.read_buf.advance(total_len);

            let Some(cmd) = cmd else {
                warn!(channel, "dropping frame with unrecognized command code");
                continue;
            };

            match self.sinks.get(&channel) {
                Some(sink) => {
                    if sink.send((cmd, payload)).is_err() {
                        trace!(channel, "channel sink gone, dropping frame");
                    }
                }
                None => {
                    debug!(channel, ?cmd, "frame for unknown channel, dropping");
                }
            }
        }
    }
}
