/// Transport requested for one stream in SETUP (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Client → Server (interleaved, default):
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
///
/// Client → Server (UDP):
///   Transport: RTP/AVP;unicast;client_port=50000-50001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=50000-50001;server_port=5000-5001;ssrc=1A2B3C4D
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSpec {
    /// RTP and RTCP framed on the control connection with `$` headers.
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
    /// RTP and RTCP on a local UDP port pair.
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
}

impl TransportSpec {
    /// Interleaved channels for the stream at `index`: `2i` and `2i+1`.
    pub fn interleaved_for(index: usize) -> Self {
        let rtp_channel = (index * 2) as u8;
        TransportSpec::Interleaved {
            rtp_channel,
            rtcp_channel: rtp_channel + 1,
        }
    }

    /// Value of the `Transport` request header.
    pub fn request_header(&self) -> String {
        match self {
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel}"),
            Self::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => format!("RTP/AVP;unicast;client_port={client_rtp_port}-{client_rtcp_port}"),
        }
    }
}

/// Parsed `Transport` header of a SETUP response.
///
/// Servers may adjust what the client asked for (e.g. pick other
/// interleaved channels); the negotiator trusts the response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHeader {
    pub interleaved: Option<(u8, u8)>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub ssrc: Option<u32>,
}

impl TransportHeader {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// ## Examples
    ///
    /// ```
    /// use retriever::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3;ssrc=0A0B0C0D");
    /// assert_eq!(th.interleaved, Some((2, 3)));
    /// assert_eq!(th.ssrc, Some(0x0A0B0C0D));
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001");
    /// assert_eq!(th.server_port, Some((5000, 5001)));
    /// ```
    pub fn parse(header: &str) -> Self {
        let mut parsed = TransportHeader::default();
        for part in header.split(';') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key.trim() {
                "interleaved" => parsed.interleaved = parse_channels(value),
                "client_port" => parsed.client_port = parse_pair(value),
                "server_port" => parsed.server_port = parse_pair(value),
                "ssrc" => parsed.ssrc = u32::from_str_radix(value.trim(), 16).ok(),
                _ => {}
            }
        }
        parsed
    }
}

/// Parse `A-B`, or a single `A` meaning `A-(A+1)`.
fn parse_pair(value: &str) -> Option<(u16, u16)> {
    let value = value.trim();
    match value.split_once('-') {
        Some((first, second)) => Some((first.trim().parse().ok()?, second.trim().parse().ok()?)),
        None => {
            let first: u16 = value.parse().ok()?;
            Some((first, first.checked_add(1)?))
        }
    }
}

fn parse_channels(value: &str) -> Option<(u8, u8)> {
    let (rtp, rtcp) = parse_pair(value)?;
    Some((u8::try_from(rtp).ok()?, u8::try_from(rtcp).ok()?))
}
