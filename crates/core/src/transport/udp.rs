use std::io;
use std::net::UdpSocket;
use std::time::Duration;

use super::{MediaSource, ReadOutcome, is_timeout};
use crate::error::Result;

/// Largest datagram accepted; RTP over UDP never exceeds this.
const MAX_DATAGRAM: usize = 65_536;

/// Ephemeral binds tried before giving up on finding an even/odd port pair.
const BIND_ATTEMPTS: usize = 32;

/// UDP transport for inbound RTP/RTCP of one stream.
///
/// Binds an even RTP port and the following odd RTCP port (RFC 3550 §11),
/// announced to the server as `client_port=<rtp>-<rtcp>` in SETUP.
///
/// Packets are labelled with the stream's channel pair so the session can
/// route them exactly like interleaved frames.
pub struct UdpMediaSource {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    rtp_channel: u8,
    rtcp_channel: u8,
    buf: Vec<u8>,
}

impl UdpMediaSource {
    /// Bind a fresh even/odd port pair on all interfaces.
    pub fn bind_pair(read_timeout: Duration) -> Result<Self> {
        for _ in 0..BIND_ATTEMPTS {
            let rtp = UdpSocket::bind("0.0.0.0:0")?;
            let port = rtp.local_addr()?.port();
            if port % 2 != 0 || port == u16::MAX {
                continue;
            }
            let rtcp = match UdpSocket::bind(("0.0.0.0", port + 1)) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::trace!(port = port + 1, error = %e, "RTCP port taken, retrying");
                    continue;
                }
            };

            rtp.set_read_timeout(Some(read_timeout))?;
            rtcp.set_nonblocking(true)?;
            tracing::debug!(rtp_port = port, rtcp_port = port + 1, "UDP port pair bound");
            return Ok(Self {
                rtp,
                rtcp,
                rtp_channel: 0,
                rtcp_channel: 1,
                buf: vec![0u8; MAX_DATAGRAM],
            });
        }

        Err(io::Error::new(io::ErrorKind::AddrInUse, "no free even/odd UDP port pair").into())
    }

    /// Local (RTP, RTCP) ports.
    pub fn ports(&self) -> Result<(u16, u16)> {
        Ok((self.rtp.local_addr()?.port(), self.rtcp.local_addr()?.port()))
    }

    /// Label packets with the stream's channel pair.
    pub fn set_channels(&mut self, rtp_channel: u8, rtcp_channel: u8) {
        self.rtp_channel = rtp_channel;
        self.rtcp_channel = rtcp_channel;
    }
}

impl MediaSource for UdpMediaSource {
    fn read(&mut self) -> Result<ReadOutcome> {
        match self.rtcp.recv(&mut self.buf) {
            Ok(n) => {
                return Ok(ReadOutcome::Packet {
                    channel: self.rtcp_channel,
                    data: self.buf[..n].to_vec(),
                });
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => return Err(e.into()),
        }

        match self.rtp.recv(&mut self.buf) {
            Ok(n) => Ok(ReadOutcome::Packet {
                channel: self.rtp_channel,
                data: self.buf[..n].to_vec(),
            }),
            Err(e) if is_timeout(&e) => Ok(ReadOutcome::Timeout),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_even_odd_pair() {
        let source = UdpMediaSource::bind_pair(Duration::from_millis(50)).unwrap();
        let (rtp, rtcp) = source.ports().unwrap();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
    }

    #[test]
    fn receives_and_labels_packets() {
        let mut source = UdpMediaSource::bind_pair(Duration::from_millis(100)).unwrap();
        source.set_channels(2, 3);
        let (rtp, rtcp) = source.ports().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0x80, 0x60, 0, 1], ("127.0.0.1", rtp)).unwrap();
        assert_eq!(
            source.read().unwrap(),
            ReadOutcome::Packet {
                channel: 2,
                data: vec![0x80, 0x60, 0, 1]
            }
        );

        sender.send_to(&[0x80, 201, 0, 1], ("127.0.0.1", rtcp)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            source.read().unwrap(),
            ReadOutcome::Packet {
                channel: 3,
                data: vec![0x80, 201, 0, 1]
            }
        );
    }

    #[test]
    fn idle_read_times_out() {
        let mut source = UdpMediaSource::bind_pair(Duration::from_millis(20)).unwrap();
        assert_eq!(source.read().unwrap(), ReadOutcome::Timeout);
    }
}
