//! SDP (Session Description Protocol) parsing (RFC 4566 / RFC 8866).
//!
//! Reads the body of a DESCRIBE response. A typical Axis description:
//!
//! ```text
//! v=0
//! o=- 1234 1 IN IP4 192.168.0.90
//! s=Session streamed with GStreamer
//! a=control:*
//! m=video 0 RTP/AVP 96                           ← media description
//! a=rtpmap:96 H264/90000                         ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAKeKQ...,aM48gA==
//! a=framesize:96 1920-1080                       ← frame geometry
//! a=control:rtsp://192.168.0.90/axis-media/media.amp/stream=0?camera=1
//! m=application 0 RTP/AVP 98
//! a=rtpmap:98 vnd.onvif.metadata/90000
//! a=control:rtsp://192.168.0.90/axis-media/media.amp/stream=1?camera=1
//! ```
//!
//! Only the fields the negotiator needs are kept; everything else is skipped.

use crate::error::{ParseErrorKind, Result, RetrieverError};
use crate::media::{FrameGeometry, MediaKind};

/// Clock rate assumed for dynamic payload types without `a=rtpmap`.
const DEFAULT_CLOCK_RATE: u32 = 90_000;

/// A parsed session description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    /// Session-level `a=control`, if any.
    pub control: Option<String>,
    pub media: Vec<MediaDescription>,
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// Media field of the `m=` line (`video`, `audio`, `application`).
    pub media: String,
    pub protocol: String,
    /// First payload format listed on the `m=` line.
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap` (e.g. `H264`).
    pub encoding: String,
    pub clock_rate: u32,
    /// Parameter list of the matching `a=fmtp` line.
    pub fmtp: Option<String>,
    /// Media-level `a=control`.
    pub control: Option<String>,
    /// From `a=framesize` or `a=x-dimensions`.
    pub geometry: Option<FrameGeometry>,
}

impl MediaDescription {
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_sdp(&self.media)
    }
}

impl SessionDescription {
    /// Parse an SDP body.
    ///
    /// ```
    /// use retriever::protocol::sdp::SessionDescription;
    /// use retriever::MediaKind;
    ///
    /// let sdp = SessionDescription::parse(
    ///     "v=0\r\nm=application 0 RTP/AVP 98\r\na=rtpmap:98 vnd.onvif.metadata/90000\r\na=control:trackID=2\r\n",
    /// )
    /// .unwrap();
    /// let app = sdp.first(MediaKind::Application).unwrap();
    /// assert_eq!(app.payload_type, 98);
    /// assert_eq!(app.encoding, "vnd.onvif.metadata");
    /// ```
    ///
    /// Fails with [`ParseErrorKind::InvalidSdp`] when there is no usable
    /// `m=` line.
    pub fn parse(body: &str) -> Result<Self> {
        let mut sdp = SessionDescription::default();

        for line in body.lines() {
            let line = line.trim();
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };
            match kind {
                "m" => sdp.media.push(parse_media_line(value)?),
                "a" => {
                    let (name, attr) = value.split_once(':').unwrap_or((value, ""));
                    match sdp.media.last_mut() {
                        Some(media) => apply_attribute(media, name, attr),
                        None if name == "control" => sdp.control = Some(attr.trim().to_string()),
                        None => {}
                    }
                }
                _ => {}
            }
        }

        if sdp.media.is_empty() {
            return Err(invalid_sdp());
        }
        tracing::trace!(media_count = sdp.media.len(), "SDP parsed");
        Ok(sdp)
    }

    /// The first media description of the given kind.
    pub fn first(&self, kind: MediaKind) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.kind() == Some(kind))
    }
}

fn invalid_sdp() -> RetrieverError {
    RetrieverError::Parse {
        kind: ParseErrorKind::InvalidSdp,
    }
}

fn parse_media_line(value: &str) -> Result<MediaDescription> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(invalid_sdp());
    }
    let payload_type: u8 = parts[3].parse().map_err(|_| invalid_sdp())?;

    Ok(MediaDescription {
        media: parts[0].to_string(),
        protocol: parts[2].to_string(),
        payload_type,
        encoding: String::new(),
        clock_rate: DEFAULT_CLOCK_RATE,
        fmtp: None,
        control: None,
        geometry: None,
    })
}

/// Strip `<payload type> ` from an attribute value, if it names this media's format.
fn for_payload<'a>(media: &MediaDescription, attr: &'a str) -> Option<&'a str> {
    let (pt, rest) = attr.trim().split_once(char::is_whitespace)?;
    (pt.parse::<u8>().ok()? == media.payload_type).then_some(rest.trim())
}

fn apply_attribute(media: &mut MediaDescription, name: &str, attr: &str) {
    match name {
        "control" => media.control = Some(attr.trim().to_string()),
        "rtpmap" => {
            let Some(map) = for_payload(media, attr) else {
                return;
            };
            let mut parts = map.split('/');
            media.encoding = parts.next().unwrap_or_default().to_string();
            if let Some(rate) = parts.next().and_then(|r| r.parse().ok()) {
                media.clock_rate = rate;
            }
        }
        "fmtp" => {
            if let Some(params) = for_payload(media, attr) {
                media.fmtp = Some(params.to_string());
            }
        }
        // a=framesize:96 1920-1080
        "framesize" => {
            if let Some(size) = for_payload(media, attr) {
                media.geometry = parse_geometry(size, '-');
            }
        }
        // a=x-dimensions:1920,1080
        "x-dimensions" => {
            if media.geometry.is_none() {
                media.geometry = parse_geometry(attr.trim(), ',');
            }
        }
        _ => {}
    }
}

fn parse_geometry(value: &str, separator: char) -> Option<FrameGeometry> {
    let (width, height) = value.split_once(separator)?;
    Some(FrameGeometry {
        width: width.trim().parse().ok()?,
        height: height.trim().parse().ok()?,
    })
}

/// Resolve an `a=control` value against the aggregate base URL
/// (RFC 2326 §C.1.1). `*` or a missing control means the base itself.
///
/// ```
/// use retriever::protocol::sdp::resolve_control;
///
/// let base = "rtsp://cam/axis-media/media.amp/";
/// assert_eq!(resolve_control(base, Some("trackID=1")), "rtsp://cam/axis-media/media.amp/trackID=1");
/// assert_eq!(resolve_control(base, Some("rtsp://cam/other")), "rtsp://cam/other");
/// assert_eq!(resolve_control(base, Some("*")), base);
/// ```
pub fn resolve_control(base: &str, control: Option<&str>) -> String {
    match control.map(str::trim) {
        None | Some("") | Some("*") => base.to_string(),
        Some(absolute) if absolute.contains("://") => absolute.to_string(),
        Some(relative) => {
            if base.ends_with('/') {
                format!("{base}{relative}")
            } else {
                format!("{base}/{relative}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AXIS_SDP: &str = "v=0\r\n\
        o=- 18446744073709551615 1 IN IP4 192.168.0.90\r\n\
        s=Session streamed with GStreamer\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        a=range:npt=now-\r\n\
        m=video 0 RTP/AVP 96\r\n\
        c=IN IP4 0.0.0.0\r\n\
        b=AS:50000\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1;profile-level-id=4d0029;sprop-parameter-sets=Z00AKZpkA8ARPyzUBAQFAAADA+gAAOpgBA==,aO48gA==\r\n\
        a=framesize:96 1920-1080\r\n\
        a=control:rtsp://192.168.0.90/axis-media/media.amp/stream=0?camera=1\r\n\
        m=application 0 RTP/AVP 98\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=rtpmap:98 vnd.onvif.metadata/90000\r\n\
        a=control:rtsp://192.168.0.90/axis-media/media.amp/stream=1?camera=1\r\n";

    #[test]
    fn parses_axis_description() {
        let sdp = SessionDescription::parse(AXIS_SDP).unwrap();
        assert_eq!(sdp.control.as_deref(), Some("*"));
        assert_eq!(sdp.media.len(), 2);

        let video = sdp.first(MediaKind::Video).unwrap();
        assert_eq!(video.payload_type, 96);
        assert_eq!(video.encoding, "H264");
        assert_eq!(video.clock_rate, 90_000);
        assert_eq!(video.geometry, Some(FrameGeometry { width: 1920, height: 1080 }));
        assert!(video.fmtp.as_deref().unwrap().contains("sprop-parameter-sets="));
        assert_eq!(
            video.control.as_deref(),
            Some("rtsp://192.168.0.90/axis-media/media.amp/stream=0?camera=1")
        );

        let app = sdp.first(MediaKind::Application).unwrap();
        assert_eq!(app.payload_type, 98);
        assert_eq!(app.encoding, "vnd.onvif.metadata");
        assert!(app.geometry.is_none());
    }

    #[test]
    fn missing_kind_is_none() {
        let sdp = SessionDescription::parse("v=0\r\nm=video 0 RTP/AVP 96\r\n").unwrap();
        assert!(sdp.first(MediaKind::Application).is_none());
        assert_eq!(sdp.first(MediaKind::Video).unwrap().clock_rate, DEFAULT_CLOCK_RATE);
    }

    #[test]
    fn attributes_for_other_payload_types_are_ignored() {
        let sdp = SessionDescription::parse(
            "m=video 0 RTP/AVP 96\r\na=rtpmap:97 JPEG/90000\r\na=x-dimensions:640,480\r\n",
        )
        .unwrap();
        let video = &sdp.media[0];
        assert_eq!(video.encoding, "");
        assert_eq!(video.geometry, Some(FrameGeometry { width: 640, height: 480 }));
    }

    #[test]
    fn rejects_description_without_media() {
        assert!(SessionDescription::parse("v=0\r\ns=-\r\n").is_err());
        assert!(SessionDescription::parse("m=video 0 RTP/AVP\r\n").is_err());
        assert!(SessionDescription::parse("m=video 0 RTP/AVP abc\r\n").is_err());
    }

    #[test]
    fn resolve_relative_without_slash() {
        assert_eq!(
            resolve_control("rtsp://cam/media.amp", Some("trackID=2")),
            "rtsp://cam/media.amp/trackID=2"
        );
        assert_eq!(resolve_control("rtsp://cam/media.amp", None), "rtsp://cam/media.amp");
    }
}
