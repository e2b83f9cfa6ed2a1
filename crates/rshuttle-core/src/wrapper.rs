//! Flow endpoints: a direct socket on one side, a mux channel on the other.
//!
//! [`Proxy`] (see `proxy.rs`) pumps bytes between two [`FlowEnd`]s without
//! caring which concrete kind either one is — an accepted TCP connection
//! proxies to a mux channel exactly the same way a mux channel would proxy
//! to another mux channel. Modeled as an enum rather than a trait object:
//! there are exactly two kinds of endpoint and `match` is cheaper and
//! clearer than `dyn` here.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::mux::{ChannelMessage, MuxHandle};
use crate::wire::Command;

/// Half-close state shared by both endpoint kinds.
#[derive(Debug, Default, Clone, Copy)]
struct HalfClose {
    shut_read: bool,
    shut_write: bool,
}

impl HalfClose {
    fn closed(&self) -> bool {
        self.shut_read && self.shut_write
    }
}

/// A direct, unmultiplexed socket (the accepted client connection).
pub struct SockWrapper {
    stream: TcpStream,
    half: HalfClose,
}

impl SockWrapper {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            half: HalfClose::default(),
        }
    }
}

/// The other end of a flow: one mux channel, backed by a queue of inbound
/// `ChannelMessage`s and a handle for sending outbound ones.
pub struct MuxWrapper {
    channel: u16,
    mux: MuxHandle,
    inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    pending: Vec<u8>,
    half: HalfClose,
    /// Bytes buffered in `pending` above which we ask the peer to pause by
    /// sending `TCP_STOP_SENDING`. Cleared (so we can signal again) once
    /// `pending` drains back under half this value.
    backpressure_high: usize,
    signaled_stop: bool,
}

const DEFAULT_BACKPRESSURE_HIGH: usize = 128 * 1024;

impl MuxWrapper {
    pub fn new(channel: u16, mux: MuxHandle, inbound: mpsc::UnboundedReceiver<ChannelMessage>) -> Self {
        Self {
            channel,
            mux,
            inbound,
            pending: Vec::new(),
            half: HalfClose::default(),
            backpressure_high: DEFAULT_BACKPRESSURE_HIGH,
            signaled_stop: false,
        }
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    fn maybe_signal_backpressure(&mut self) {
        if !self.signaled_stop && self.pending.len() > self.backpressure_high {
            self.signaled_stop = true;
            self.mux.send(self.channel, Command::TcpStopSending, Vec::new());
        } else if self.signaled_stop && self.pending.len() < self.backpressure_high / 2 {
            self.signaled_stop = false;
        }
    }
}

/// One side of a bidirectional pump. `read`/`write` follow the `0 = EOF`
/// convention used by `AsyncRead`/`AsyncWrite`; callers drive half-closes
/// explicitly through `shutdown_read`/`shutdown_write` once each direction
/// of the flow is done.
pub enum FlowEnd {
    Sock(SockWrapper),
    Mux(MuxWrapper),
}

impl FlowEnd {
    /// Read up to `buf.len()` bytes. Returns `Ok(0)` on a clean EOF, and
    /// `Ok(0)` immediately (without touching the underlying transport) if
    /// this end's read side is already shut.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FlowEnd::Sock(s) => {
                if s.half.shut_read {
                    return Ok(0);
                }
                s.stream.read(buf).await
            }
            FlowEnd::Mux(m) => {
                if m.half.shut_read {
                    return Ok(0);
                }
                loop {
                    if !m.pending.is_empty() {
                        let n = buf.len().min(m.pending.len());
                        buf[..n].copy_from_slice(&m.pending[..n]);
                        m.pending.drain(..n);
                        m.maybe_signal_backpressure();
                        return Ok(n);
                    }
                    match m.inbound.recv().await {
                        None => return Ok(0),
                        Some((Command::TcpData, payload)) => {
                            m.pending.extend_from_slice(&payload);
                        }
                        Some((Command::TcpEof, _)) => return Ok(0),
                        Some((Command::TcpStopSending, _)) => {
                            // Peer asked us to pause sending; handled by the
                            // proxy pump checking `peer_requested_pause`.
                            continue;
                        }
                        Some((_, _)) => continue,
                    }
                }
            }
        }
    }

    /// Write the full contents of `buf`.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            FlowEnd::Sock(s) => {
                if s.half.shut_write {
                    return Ok(());
                }
                s.stream.write_all(buf).await
            }
            FlowEnd::Mux(m) => {
                if m.half.shut_write {
                    return Ok(());
                }
                m.mux.send(m.channel, Command::TcpData, buf.to_vec());
                Ok(())
            }
        }
    }

    /// Signal that no more data will be read from this end's source: stop
    /// pulling bytes into the flow, and tell the peer this direction is
    /// done so it can stop expecting data.
    pub async fn shutdown_read(&mut self) {
        match self {
            FlowEnd::Sock(s) => s.half.shut_read = true,
            FlowEnd::Mux(m) => m.half.shut_read = true,
        }
    }

    /// Signal that no more data will be written to this end's destination.
    pub async fn shutdown_write(&mut self) {
        match self {
            FlowEnd::Sock(s) => {
                s.half.shut_write = true;
                let _ = s.stream.shutdown().await;
            }
            FlowEnd::Mux(m) => {
                m.half.shut_write = true;
                m.mux.send(m.channel, Command::TcpEof, Vec::new());
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            FlowEnd::Sock(s) => s.half.closed(),
            FlowEnd::Mux(m) => m.half.closed(),
        }
    }

    /// Whether this end's egress is currently backed up — true only for a
    /// [`MuxWrapper`] whose mux outbound buffer is over its high-water mark.
    /// [`Proxy`](crate::proxy::Proxy) checks this on the *sink* side before
    /// reading more from the matching source, implementing the "cease
    /// reading from accept sockets whose MuxWrapper egress cannot drain"
    /// half of latency control.
    pub fn is_congested(&self) -> bool {
        match self {
            FlowEnd::Sock(_) => false,
            FlowEnd::Mux(m) => m.mux.is_full(),
        }
    }
}
