//! RTSP client session: negotiation, playback and teardown (RFC 2326 §A.1).
//!
//! One worker thread owns the control connection for the lifetime of a
//! session and drives it through the [`SessionState`] machine:
//!
//! ```text
//! connect ──▶ DESCRIBE ──▶ SETUP (per requested stream) ──▶ PLAY ──▶ read loop ──▶ TEARDOWN
//!   Describing              Setup                            Playing               TearingDown ──▶ Closed | Failed
//! ```
//!
//! - A `401` is answered once per request with credentials from the URL
//!   (Digest preferred over Basic).
//! - A stream the server does not offer or rejects is reported as a
//!   non-fatal [`ErrorCode::TransportSetup`](crate::ErrorCode::TransportSetup)
//!   event; the session fails only when no stream could be set up.
//! - During playback a `GET_PARAMETER` keep-alive is sent every half session
//!   timeout, and the session fails with
//!   [`RetrieverError::StreamTimeout`] when no media arrives for the
//!   configured idle period.
//! - With UDP transport each stream gets its own reader thread; the worker
//!   keeps servicing the control connection.

pub mod state;
pub mod transport;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::dispatch::{ErrorEvent, Event, Mailbox, SessionStart};
use crate::error::{ParseErrorKind, Result, RetrieverError};
use crate::media::{self, MediaKind, StreamDemuxer, StreamDescriptor};
use crate::protocol::response::DEFAULT_SESSION_TIMEOUT;
use crate::protocol::sdp::resolve_control;
use crate::protocol::{
    Authenticator, Challenge, MediaDescription, Method, RtspRequest, RtspResponse,
    SessionDescription, SessionHeader,
};
use crate::retriever::{RetrieverConfig, TransportMode};
use crate::transport::{ControlConnection, MediaSource, ReadOutcome, UdpMediaSource};
use crate::url::RtspUrl;

pub use state::{SessionState, SharedState};
pub use transport::{TransportHeader, TransportSpec};

/// How long TEARDOWN waits for its answer.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the facade, the session worker and UDP readers.
pub(crate) struct SessionContext {
    state: SharedState,
    cancel: AtomicBool,
    mailbox: Arc<Mailbox>,
    error_count: Arc<AtomicU64>,
    last_media: Mutex<Instant>,
}

impl SessionContext {
    pub(crate) fn new(
        state: SharedState,
        mailbox: Arc<Mailbox>,
        error_count: Arc<AtomicU64>,
    ) -> Self {
        Self {
            state,
            cancel: AtomicBool::new(false),
            mailbox,
            error_count,
            last_media: Mutex::new(Instant::now()),
        }
    }

    /// Ask the worker to wind down at its next read boundary.
    pub(crate) fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn transition(&self, next: SessionState) {
        self.state.transition(next);
    }

    fn touch(&self) {
        *self.last_media.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_media.lock().elapsed()
    }

    fn report(&self, error: &RetrieverError, media: Option<MediaKind>, fatal: bool) {
        let event = ErrorEvent::new(error, media, fatal, &self.error_count);
        self.mailbox.push_event(Event::Error(event));
    }
}

/// A stream that passed SETUP.
struct Stream {
    demuxer: StreamDemuxer,
    rtp_channel: u8,
    rtcp_channel: u8,
    udp: Option<UdpMediaSource>,
}

impl Stream {
    /// Route one packet. Returns `false` when `channel` belongs to another
    /// stream.
    fn handle(&mut self, channel: u8, data: &[u8], ctx: &SessionContext) -> bool {
        if channel == self.rtp_channel {
            ctx.touch();
            if let Some(unit) = self.demuxer.push_rtp(data)
                && ctx.mailbox.push_unit(unit)
            {
                self.demuxer.diagnostics_mut().record_superseded();
            }
            true
        } else if channel == self.rtcp_channel {
            self.demuxer.push_rtcp(data);
            true
        } else {
            false
        }
    }
}

/// Session worker entry point.
///
/// Sends the negotiation outcome through `outcome` exactly once: `Ok` when
/// playback starts, the error otherwise. Fatal errors are also reported as
/// events. The mailbox is closed on return.
pub(crate) fn run(
    config: RetrieverConfig,
    url: RtspUrl,
    ctx: Arc<SessionContext>,
    outcome: SyncSender<Result<()>>,
) {
    let mut outcome = Some(outcome);
    ctx.transition(SessionState::Describing);

    let result = match Session::connect(&config, &url, ctx.clone()) {
        Ok(mut session) => {
            let result = match session.negotiate() {
                Ok(()) => {
                    ctx.transition(SessionState::Playing);
                    if let Some(tx) = outcome.take() {
                        let _ = tx.send(Ok(()));
                    }
                    session.play()
                }
                Err(e) => Err(e),
            };
            ctx.transition(SessionState::TearingDown);
            session.teardown();
            result
        }
        Err(e) => {
            ctx.transition(SessionState::TearingDown);
            Err(e)
        }
    };

    let result = match result {
        Err(_) if ctx.is_cancelled() => Err(RetrieverError::Cancelled),
        other => other,
    };

    match result {
        Ok(()) => {
            ctx.transition(SessionState::Closed);
            tracing::info!("session closed");
            if let Some(tx) = outcome.take() {
                let _ = tx.send(Ok(()));
            }
        }
        Err(RetrieverError::Cancelled) => {
            ctx.transition(SessionState::Closed);
            tracing::info!("session cancelled");
            if let Some(tx) = outcome.take() {
                let _ = tx.send(Err(RetrieverError::Cancelled));
            }
        }
        Err(error) => {
            ctx.transition(SessionState::Failed);
            tracing::error!(error = %error, "session failed");
            let media = match &error {
                RetrieverError::TransportSetup { media, .. } => Some(*media),
                _ => None,
            };
            ctx.report(&error, media, true);
            if let Some(tx) = outcome.take() {
                let _ = tx.send(Err(error));
            }
        }
    }

    ctx.mailbox.close();
}

struct Session<'a> {
    config: &'a RetrieverConfig,
    url: &'a RtspUrl,
    ctx: Arc<SessionContext>,
    conn: ControlConnection,
    auth: Option<Authenticator>,
    session: Option<SessionHeader>,
    /// Aggregate control URL for PLAY, keep-alive and TEARDOWN.
    aggregate_url: String,
    streams: Vec<Stream>,
}

impl<'a> Session<'a> {
    fn connect(
        config: &'a RetrieverConfig,
        url: &'a RtspUrl,
        ctx: Arc<SessionContext>,
    ) -> Result<Self> {
        let addr = url.socket_addr();
        tracing::info!(addr = %addr, "connecting");
        let conn = ControlConnection::connect(
            &addr,
            config.negotiation_timeout,
            config.read_timeout,
            &ctx.cancel,
        )?;
        Ok(Self {
            config,
            url,
            ctx,
            conn,
            auth: None,
            session: None,
            aggregate_url: url.request_uri(),
            streams: Vec::new(),
        })
    }

    fn negotiate(&mut self) -> Result<()> {
        let sdp = self.describe()?;

        self.ctx.transition(SessionState::Setup);
        let kinds = self.config.media.kinds();
        for (index, kind) in kinds.iter().copied().enumerate() {
            let Some(media) = sdp.first(kind) else {
                let error = RetrieverError::TransportSetup {
                    media: kind,
                    reason: "not offered by the server".to_string(),
                };
                tracing::warn!(error = %error, "stream unavailable");
                self.ctx.report(&error, Some(kind), false);
                continue;
            };

            match self.setup_stream(index, kind, media) {
                Ok(stream) => {
                    let start = SessionStart {
                        session_id: self.session.as_ref().map(|s| s.id.clone()).unwrap_or_default(),
                        stream: stream.demuxer.descriptor().clone(),
                        media: media.clone(),
                    };
                    self.ctx.mailbox.push_event(Event::SessionStart(start));
                    self.streams.push(stream);
                }
                Err(
                    e @ (RetrieverError::Cancelled
                    | RetrieverError::Connection { .. }
                    | RetrieverError::NegotiationTimeout { .. }),
                ) => return Err(e),
                Err(e) => {
                    let error = match e {
                        e @ RetrieverError::TransportSetup { .. } => e,
                        other => RetrieverError::TransportSetup {
                            media: kind,
                            reason: other.to_string(),
                        },
                    };
                    tracing::warn!(error = %error, "stream setup failed");
                    self.ctx.report(&error, Some(kind), false);
                }
            }
        }

        if self.streams.is_empty() {
            return Err(RetrieverError::TransportSetup {
                media: kinds.first().copied().unwrap_or(MediaKind::Video),
                reason: "no requested stream could be set up".to_string(),
            });
        }

        let request =
            RtspRequest::new(Method::Play, &self.aggregate_url).add_header("Range", "npt=0.000-");
        let _response = expect_success(Method::Play, self.exchange(request)?)?;
        self.ctx.touch();
        tracing::info!(
            streams = self.streams.len(),
            session_id = self.session.as_ref().map(|s| s.id.as_str()).unwrap_or_default(),
            "playing"
        );
        Ok(())
    }

    fn describe(&mut self) -> Result<SessionDescription> {
        let uri = self.url.request_uri();
        let request =
            RtspRequest::new(Method::Describe, &uri).add_header("Accept", "application/sdp");
        let response = expect_success(Method::Describe, self.exchange(request)?)?;

        let base = response
            .get_header("Content-Base")
            .or_else(|| response.get_header("Content-Location"))
            .map(str::to_string)
            .unwrap_or(uri);
        let sdp = SessionDescription::parse(&String::from_utf8_lossy(&response.body))?;
        self.aggregate_url = resolve_control(&base, sdp.control.as_deref());
        tracing::debug!(base = %base, media = sdp.media.len(), "session described");
        Ok(sdp)
    }

    fn setup_stream(
        &mut self,
        index: usize,
        kind: MediaKind,
        media: &MediaDescription,
    ) -> Result<Stream> {
        let control = resolve_control(&self.aggregate_url, media.control.as_deref());

        let (spec, mut udp) = match self.config.transport {
            TransportMode::Interleaved => (TransportSpec::interleaved_for(index), None),
            TransportMode::Udp => {
                let source = UdpMediaSource::bind_pair(self.config.read_timeout)?;
                let (rtp, rtcp) = source.ports()?;
                let spec = TransportSpec::Udp {
                    client_rtp_port: rtp,
                    client_rtcp_port: rtcp,
                };
                (spec, Some(source))
            }
        };

        let request = RtspRequest::new(Method::Setup, &control)
            .add_header("Transport", &spec.request_header());
        let response = expect_success(Method::Setup, self.exchange(request)?)?;

        if self.session.is_none() {
            let header = response.session().ok_or(RetrieverError::Parse {
                kind: ParseErrorKind::MissingHeader("Session"),
            })?;
            tracing::debug!(
                session_id = %header.id,
                timeout = ?header.timeout,
                "session established"
            );
            self.session = Some(header);
        }

        let granted = response
            .get_header("Transport")
            .map(TransportHeader::parse)
            .unwrap_or_default();
        let (rtp_channel, rtcp_channel) = match spec {
            TransportSpec::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => granted.interleaved.unwrap_or((rtp_channel, rtcp_channel)),
            TransportSpec::Udp { .. } => {
                // Label datagrams like interleaved frames so routing is shared.
                let rtp_channel = (index * 2) as u8;
                if let Some(source) = udp.as_mut() {
                    source.set_channels(rtp_channel, rtp_channel + 1);
                }
                (rtp_channel, rtp_channel + 1)
            }
        };

        let descriptor = StreamDescriptor {
            media_kind: kind,
            transport_id: index,
            clock_rate: media.clock_rate,
            payload_type: media.payload_type,
            encoding: media.encoding.clone(),
            control,
            geometry: media.geometry,
        };
        tracing::info!(
            media = %kind,
            encoding = %descriptor.encoding,
            payload_type = descriptor.payload_type,
            transport = %spec.request_header(),
            server_port = ?granted.server_port,
            "stream set up"
        );

        let depayloader = media::depayloader_for(&media.encoding, media.fmtp.as_deref());
        Ok(Stream {
            demuxer: StreamDemuxer::new(descriptor, depayloader, self.config.extension_layout),
            rtp_channel,
            rtcp_channel,
            udp,
        })
    }

    /// Run until cancelled or the session breaks. `Ok` means a requested stop.
    fn play(&mut self) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        let mut interleaved = Vec::new();

        let mut spawn_error = None;
        for mut stream in self.streams.drain(..) {
            let Some(source) = stream.udp.take() else {
                interleaved.push(stream);
                continue;
            };
            let ctx = self.ctx.clone();
            let running = running.clone();
            let name = format!("retriever-udp-{}", stream.demuxer.media_kind());
            match thread::Builder::new()
                .name(name)
                .spawn(move || read_udp(source, stream, ctx, running))
            {
                Ok(handle) => readers.push(handle),
                Err(e) => {
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let result = match spawn_error {
            Some(e) => Err(e.into()),
            None => self.read_loop(&mut interleaved),
        };

        running.store(false, Ordering::SeqCst);
        for reader in readers {
            if reader.join().is_err() {
                tracing::error!("UDP reader thread panicked");
            }
        }
        result
    }

    fn read_loop(&mut self, streams: &mut [Stream]) -> Result<()> {
        let session_timeout = self
            .session
            .as_ref()
            .map_or(DEFAULT_SESSION_TIMEOUT, |s| s.timeout);
        let keepalive_every = session_timeout / 2;
        let mut next_keepalive = Instant::now() + keepalive_every;

        loop {
            if self.ctx.is_cancelled() {
                return Ok(());
            }
            if self.ctx.idle_for() >= self.config.stream_timeout {
                return Err(RetrieverError::StreamTimeout(self.config.stream_timeout));
            }
            if Instant::now() >= next_keepalive {
                let request =
                    self.decorate(RtspRequest::new(Method::GetParameter, &self.aggregate_url));
                self.conn.send(&request)?;
                next_keepalive = Instant::now() + keepalive_every;
            }

            match self.conn.read()? {
                ReadOutcome::Packet { channel, data } => {
                    if !streams.iter_mut().any(|s| s.handle(channel, &data, &self.ctx)) {
                        tracing::trace!(channel, len = data.len(), "packet on unknown channel");
                    }
                }
                ReadOutcome::Timeout => {}
                ReadOutcome::Closed => {
                    return Err(RetrieverError::Connection {
                        addr: self.conn.peer().to_string(),
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed by server",
                        ),
                    });
                }
            }
        }
    }

    /// Best-effort TEARDOWN, then close the control connection.
    fn teardown(&mut self) {
        if self.session.is_some() {
            let request = self.decorate(RtspRequest::new(Method::Teardown, &self.aggregate_url));
            let never = AtomicBool::new(false);
            match self.conn.request(&request, TEARDOWN_TIMEOUT, &never) {
                Ok(response) => {
                    tracing::debug!(status = response.status_code, "teardown acknowledged")
                }
                Err(e) => tracing::debug!(error = %e, "teardown not acknowledged"),
            }
        }
        self.conn.shutdown();
    }

    /// Send a request and wait for its response, answering one `401` with
    /// credentials from the URL.
    fn exchange(&mut self, request: RtspRequest) -> Result<RtspResponse> {
        let timeout = self.config.negotiation_timeout;
        let first = self.decorate(request.clone());
        let response = self.conn.request(&first, timeout, &self.ctx.cancel)?;
        if response.status_code != 401 {
            return Ok(response);
        }

        let Some(username) = self.url.username() else {
            tracing::warn!(
                method = %request.method,
                "server requires authentication, no credentials in URL"
            );
            return Ok(response);
        };
        let Some(challenge) = Challenge::select(response.get_headers("WWW-Authenticate")) else {
            tracing::warn!(method = %request.method, "no supported authentication challenge");
            return Ok(response);
        };
        tracing::debug!(method = %request.method, challenge = ?challenge, "authenticating");
        self.auth = Some(Authenticator::new(
            username,
            self.url.password().unwrap_or_default(),
            challenge,
        ));

        let retry = self.decorate(request);
        self.conn.request(&retry, timeout, &self.ctx.cancel)
    }

    fn decorate(&mut self, request: RtspRequest) -> RtspRequest {
        let mut request = request.add_header("User-Agent", &self.config.user_agent);
        if let Some(session) = &self.session {
            request = request.add_header("Session", &session.id);
        }
        if let Some(auth) = self.auth.as_mut() {
            let value = auth.authorization(&request.method, &request.uri);
            request = request.add_header("Authorization", &value);
        }
        request
    }
}

fn expect_success(method: Method, response: RtspResponse) -> Result<RtspResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(RetrieverError::Protocol {
            method: method.as_str().to_string(),
            status: response.status_code,
            reason: response.status_text,
        })
    }
}

fn read_udp(
    mut source: UdpMediaSource,
    mut stream: Stream,
    ctx: Arc<SessionContext>,
    running: Arc<AtomicBool>,
) {
    let kind = stream.demuxer.media_kind();
    tracing::debug!(media = %kind, "UDP reader started");
    while running.load(Ordering::SeqCst) && !ctx.is_cancelled() {
        match source.read() {
            Ok(ReadOutcome::Packet { channel, data }) => {
                stream.handle(channel, &data, &ctx);
            }
            Ok(ReadOutcome::Timeout) => {}
            Ok(ReadOutcome::Closed) => break,
            Err(e) => {
                tracing::warn!(media = %kind, error = %e, "UDP reader stopped");
                ctx.report(&e, Some(kind), false);
                break;
            }
        }
    }
    tracing::debug!(
        media = %kind,
        diagnostics = ?stream.demuxer.diagnostics().snapshot(),
        "UDP reader finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Delivery;
    use crate::media::{ExtensionLayout, RawDepayloader, rtp::RtpHeader};

    fn context() -> SessionContext {
        SessionContext::new(
            SharedState::new(),
            Arc::new(Mailbox::new(1)),
            Arc::new(AtomicU64::new(0)),
        )
    }

    fn stream(kind: MediaKind, rtp_channel: u8) -> Stream {
        let descriptor = StreamDescriptor {
            media_kind: kind,
            transport_id: 0,
            clock_rate: 90_000,
            payload_type: 98,
            encoding: "vnd.onvif.metadata".to_string(),
            control: "rtsp://cam/stream=1".to_string(),
            geometry: None,
        };
        Stream {
            demuxer: StreamDemuxer::new(
                descriptor,
                Box::new(RawDepayloader),
                ExtensionLayout::ONVIF_REPLAY,
            ),
            rtp_channel,
            rtcp_channel: rtp_channel + 1,
            udp: None,
        }
    }

    #[test]
    fn stream_routes_by_channel_and_counts_superseded_units() {
        let ctx = context();
        let mut s = stream(MediaKind::Application, 2);
        let mut header = RtpHeader::new(98, 0x1234);

        assert!(!s.handle(0, &header.packet(true, None, b"x"), &ctx));
        assert!(s.handle(2, &header.packet(true, None, b"<a/>"), &ctx));
        assert!(s.handle(2, &header.packet(true, None, b"<b/>"), &ctx));
        assert!(s.handle(3, &[0x80, 200, 0, 1, 0, 0, 0, 0], &ctx));

        let snapshot = s.demuxer.diagnostics().snapshot();
        assert_eq!(snapshot.superseded_units, 1);
        assert_eq!(snapshot.rtcp_packets, 1);

        ctx.mailbox.close();
        match ctx.mailbox.next() {
            Some(Delivery::Unit(unit)) => assert_eq!(unit.payload, b"<b/>"),
            other => panic!("expected unit, got {other:?}"),
        }
    }

    #[test]
    fn report_counts_errors() {
        let ctx = context();
        ctx.report(&RetrieverError::StreamTimeout(Duration::from_secs(1)), None, true);
        ctx.report(&RetrieverError::Cancelled, Some(MediaKind::Video), false);
        ctx.mailbox.close();
        let mut counts = Vec::new();
        while let Some(Delivery::Event(Event::Error(e))) = ctx.mailbox.next() {
            counts.push((e.error_count, e.fatal));
        }
        assert_eq!(counts, vec![(1, true), (2, false)]);
    }

    #[test]
    fn protocol_errors_carry_status() {
        let response = RtspResponse::new(454, "Session Not Found");
        let err = expect_success(Method::Play, response).unwrap_err();
        assert!(matches!(
            err,
            RetrieverError::Protocol { status: 454, ref method, .. } if method == "PLAY"
        ));
    }
}
