use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::{MediaSource, ReadOutcome, is_timeout};
use crate::error::{ParseErrorKind, Result, RetrieverError};
use crate::protocol::{RtspRequest, RtspResponse};

/// Consecutive read timeouts tolerated in the middle of a message before
/// the connection is considered stalled.
const MAX_STALLED_READS: u32 = 20;

/// Upper bound for a response head; anything larger is not RTSP.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Interleaved frames buffered while waiting for a response.
const MAX_PENDING_FRAMES: usize = 512;

/// Frame an RTP/RTCP packet for interleaved transport (RFC 2326 §10.12):
/// `'$'`, channel, 16-bit big-endian length, data.
pub fn interleaved_frame(channel: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 4);
    frame.push(b'$');
    frame.push(channel);
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(data);
    frame
}

enum Incoming {
    Response(RtspResponse),
    Frame { channel: u8, data: Vec<u8> },
    Timeout,
    Closed,
}

/// The RTSP control connection of one session.
///
/// Carries requests and responses, and with interleaved transport the media
/// as well. Every read is bounded by the socket read timeout so the owner
/// can check for cancellation between reads.
pub struct ControlConnection {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    peer: String,
    next_cseq: u32,
    pending: VecDeque<(u8, Vec<u8>)>,
}

impl fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlConnection")
            .field("peer", &self.peer)
            .field("next_cseq", &self.next_cseq)
            .field("pending_frames", &self.pending.len())
            .finish()
    }
}

impl ControlConnection {
    /// Open the control connection, bounded by `connect_timeout`.
    ///
    /// Attempts last at most `read_timeout` each and are repeated until the
    /// deadline, so a raised `cancel` is noticed within one read interval.
    /// A timeout maps to [`RetrieverError::NegotiationTimeout`]; any other
    /// failure (refused, unreachable, unresolvable) to
    /// [`RetrieverError::Connection`].
    pub fn connect(
        addr: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<Self> {
        let connection_error = |source| RetrieverError::Connection {
            addr: addr.to_string(),
            source,
        };
        let candidates: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(connection_error)?
            .collect();

        let deadline = Instant::now() + connect_timeout;
        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing");
        for candidate in candidates {
            loop {
                if cancel.load(Ordering::SeqCst) {
                    return Err(RetrieverError::Cancelled);
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match TcpStream::connect_timeout(&candidate, remaining.min(read_timeout)) {
                    Ok(stream) => {
                        tracing::debug!(peer = %candidate, "control connection established");
                        return Self::from_stream(stream, addr, read_timeout);
                    }
                    Err(e) if is_timeout(&e) => last_error = e,
                    Err(e) => {
                        tracing::debug!(peer = %candidate, error = %e, "connect attempt failed");
                        last_error = e;
                        break;
                    }
                }
            }
        }

        if is_timeout(&last_error) {
            Err(RetrieverError::NegotiationTimeout {
                step: "connect".to_string(),
                after: connect_timeout,
            })
        } else {
            Err(connection_error(last_error))
        }
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, peer: &str, read_timeout: Duration) -> Result<Self> {
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: stream,
            reader,
            peer: peer.to_string(),
            next_cseq: 1,
            pending: VecDeque::new(),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Close both directions; unblocks a concurrent reader.
    pub fn shutdown(&self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }

    /// Write a request without waiting for the response. Returns its CSeq.
    pub fn send(&mut self, request: &RtspRequest) -> Result<u32> {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        self.writer
            .write_all(request.serialize(cseq).as_bytes())
            .map_err(|e| self.connection_error(e))?;
        tracing::debug!(
            peer = %self.peer,
            method = %request.method,
            uri = %request.uri,
            cseq,
            "request"
        );
        Ok(cseq)
    }

    /// Send a request and wait for its response.
    ///
    /// Interleaved frames arriving meanwhile are queued for [`MediaSource::read`].
    /// Fails with [`RetrieverError::NegotiationTimeout`] once `timeout` has
    /// elapsed and with [`RetrieverError::Cancelled`] when `cancel` is raised.
    pub fn request(
        &mut self,
        request: &RtspRequest,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<RtspResponse> {
        let cseq = self.send(request)?;
        let deadline = Instant::now() + timeout;

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(RetrieverError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(RetrieverError::NegotiationTimeout {
                    step: request.method.clone(),
                    after: timeout,
                });
            }

            match self.read_incoming()? {
                Incoming::Response(response) => match response.cseq() {
                    Some(got) if got != cseq => {
                        tracing::debug!(expected = cseq, got, "ignoring stale response");
                    }
                    _ => {
                        tracing::debug!(
                            peer = %self.peer,
                            method = %request.method,
                            status = response.status_code,
                            "response"
                        );
                        return Ok(response);
                    }
                },
                Incoming::Frame { channel, data } => self.queue_frame(channel, data),
                Incoming::Timeout => {}
                Incoming::Closed => {
                    return Err(self.connection_error(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by server",
                    )));
                }
            }
        }
    }

    fn queue_frame(&mut self, channel: u8, data: Vec<u8>) {
        if self.pending.len() >= MAX_PENDING_FRAMES {
            self.pending.pop_front();
            tracing::warn!(channel, "interleaved backlog full, oldest frame dropped");
        }
        self.pending.push_back((channel, data));
    }

    fn connection_error(&self, source: io::Error) -> RetrieverError {
        RetrieverError::Connection {
            addr: self.peer.clone(),
            source,
        }
    }

    /// Read one message. Waits at most one read timeout for the first byte;
    /// once a message has started it is read to the end.
    fn read_incoming(&mut self) -> Result<Incoming> {
        let peeked = self.reader.fill_buf().map(|buf| buf.first().copied());
        let first = match peeked {
            Ok(None) => return Ok(Incoming::Closed),
            Ok(Some(byte)) => byte,
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {
                return Ok(Incoming::Timeout);
            }
            Err(e) => return Err(self.connection_error(e)),
        };

        if first == b'$' {
            let mut header = [0u8; 4];
            self.read_exact_patiently(&mut header)?;
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut data = vec![0u8; len];
            self.read_exact_patiently(&mut data)?;
            return Ok(Incoming::Frame {
                channel: header[1],
                data,
            });
        }

        let mut head = Vec::new();
        let mut stalls = 0;
        loop {
            match self.reader.read_until(b'\n', &mut head) {
                Ok(0) => return Ok(Incoming::Closed),
                Ok(_) => {
                    stalls = 0;
                    if head.iter().all(u8::is_ascii_whitespace) {
                        // Stray line breaks between messages.
                        return Ok(Incoming::Timeout);
                    }
                    if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
                        break;
                    }
                }
                Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {
                    stalls += 1;
                    if stalls >= MAX_STALLED_READS {
                        return Err(self.connection_error(e));
                    }
                }
                Err(e) => return Err(self.connection_error(e)),
            }
            if head.len() > MAX_HEAD_LEN {
                return Err(RetrieverError::Parse {
                    kind: ParseErrorKind::InvalidHeader,
                });
            }
        }

        let mut response = RtspResponse::parse_head(&String::from_utf8_lossy(&head))?;
        let len = response.content_length()?;
        let mut body = vec![0u8; len];
        self.read_exact_patiently(&mut body)?;
        response.body = body;
        Ok(Incoming::Response(response))
    }

    fn read_exact_patiently(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        let mut stalls = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(self.connection_error(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-message",
                    )));
                }
                Ok(n) => {
                    filled += n;
                    stalls = 0;
                }
                Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {
                    stalls += 1;
                    if stalls >= MAX_STALLED_READS {
                        return Err(self.connection_error(e));
                    }
                }
                Err(e) => return Err(self.connection_error(e)),
            }
        }
        Ok(())
    }
}

impl MediaSource for ControlConnection {
    fn read(&mut self) -> Result<ReadOutcome> {
        if let Some((channel, data)) = self.pending.pop_front() {
            return Ok(ReadOutcome::Packet { channel, data });
        }
        match self.read_incoming()? {
            Incoming::Frame { channel, data } => Ok(ReadOutcome::Packet { channel, data }),
            Incoming::Timeout => Ok(ReadOutcome::Timeout),
            Incoming::Closed => Ok(ReadOutcome::Closed),
            Incoming::Response(response) => {
                // Keep-alive answers arrive here during playback.
                tracing::trace!(
                    status = response.status_code,
                    cseq = ?response.cseq(),
                    "response during playback"
                );
                if !response.is_success() {
                    tracing::warn!(
                        status = response.status_code,
                        reason = %response.status_text,
                        "request rejected during playback"
                    );
                }
                Ok(ReadOutcome::Timeout)
            }
        }
    }
}
