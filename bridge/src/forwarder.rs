//! Emits each chunk as exactly one UDP datagram: `header || payload`.

use core::fmt;
use core::net::SocketAddrV4;

use crate::chunk::{DATAGRAM_MAX, HEADER_LEN, PAYLOAD_MAX};

/// Unconnected datagram socket; the destination is given on every send.
#[allow(async_fn_in_trait)]
pub trait DatagramSink {
    type Error: fmt::Debug;

    async fn send_to(&mut self, datagram: &[u8], destination: SocketAddrV4)
    -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardError<E> {
    /// The payload exceeds the datagram buffer; nothing was sent.
    PayloadTooLarge(usize),
    Send(E),
}

impl<E: fmt::Debug> fmt::Display for ForwardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::PayloadTooLarge(len) => {
                write!(f, "payload of {} bytes exceeds {}", len, PAYLOAD_MAX)
            }
            ForwardError::Send(e) => write!(f, "sendto failed: {:?}", e),
        }
    }
}

/// Diagnostic counters. Never influence forwarding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub sent: u32,
    pub dropped: u32,
    pub clamped: u32,
}

pub struct UdpForwarder<S: DatagramSink> {
    sink: S,
    destination: SocketAddrV4,
    datagram: [u8; DATAGRAM_MAX],
    stats: ForwarderStats,
}

impl<S: DatagramSink> UdpForwarder<S> {
    pub fn new(sink: S, destination: SocketAddrV4) -> Self {
        Self {
            sink,
            destination,
            datagram: [0; DATAGRAM_MAX],
            stats: ForwarderStats::default(),
        }
    }

    pub fn destination(&self) -> SocketAddrV4 {
        self.destination
    }

    pub fn stats(&self) -> ForwarderStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn sink(&self) -> &S {
        &self.sink
    }

    pub fn note_clamped(&mut self) {
        self.stats.clamped = self.stats.clamped.wrapping_add(1);
    }

    /// Sends one datagram of `HEADER_LEN + payload.len()` bytes. Best effort: a send
    /// error is counted and returned, never retried.
    pub async fn forward(
        &mut self,
        header: &[u8; HEADER_LEN],
        payload: &[u8],
    ) -> Result<usize, ForwardError<S::Error>> {
        if payload.len() > PAYLOAD_MAX {
            self.stats.dropped = self.stats.dropped.wrapping_add(1);
            return Err(ForwardError::PayloadTooLarge(payload.len()));
        }
        let len = HEADER_LEN + payload.len();
        self.datagram[..HEADER_LEN].copy_from_slice(header);
        self.datagram[HEADER_LEN..len].copy_from_slice(payload);

        match self
            .sink
            .send_to(&self.datagram[..len], self.destination)
            .await
        {
            Ok(()) => {
                self.stats.sent = self.stats.sent.wrapping_add(1);
                Ok(len)
            }
            Err(e) => {
                self.stats.dropped = self.stats.dropped.wrapping_add(1);
                Err(ForwardError::Send(e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::DatagramSink;
    use core::net::SocketAddrV4;
    use std::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NoRoute;

    /// Captures every datagram; optionally fails selected sends.
    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Vec<(Vec<u8>, SocketAddrV4)>,
        pub fail_next: usize,
    }

    impl DatagramSink for RecordingSink {
        type Error = NoRoute;

        async fn send_to(
            &mut self,
            datagram: &[u8],
            destination: SocketAddrV4,
        ) -> Result<(), Self::Error> {
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return Err(NoRoute);
            }
            self.sent.push((datagram.to_vec(), destination));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{NoRoute, RecordingSink};
    use super::*;
    use core::net::Ipv4Addr;
    use embassy_futures::block_on;

    const HOST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 168, 4, 2), 5006);

    #[test]
    fn test_datagram_is_header_then_payload() {
        let mut forwarder = UdpForwarder::new(RecordingSink::default(), HOST);
        let header = [0x01, 0, 0, 0, 0, 0, 0, 0, 0x04, 0];
        let len = block_on(forwarder.forward(&header, &[0xDE, 0xAD, 0xBE, 0xEF])).unwrap();

        assert_eq!(len, 14);
        let (datagram, destination) = &forwarder.sink.sent[0];
        assert_eq!(
            datagram.as_slice(),
            &[0x01, 0, 0, 0, 0, 0, 0, 0, 0x04, 0, 0xDE, 0xAD, 0xBE, 0xEF]
        );
        assert_eq!(*destination, HOST);
    }

    #[test]
    fn test_empty_payload_sends_header_only() {
        let mut forwarder = UdpForwarder::new(RecordingSink::default(), HOST);
        let header = [0x02, 0, 0, 0, 0x01, 0, 0, 0, 0, 0];
        let len = block_on(forwarder.forward(&header, &[])).unwrap();
        assert_eq!(len, HEADER_LEN);
        assert_eq!(forwarder.sink.sent[0].0.as_slice(), &header);
    }

    #[test]
    fn test_full_payload_fits() {
        let mut forwarder = UdpForwarder::new(RecordingSink::default(), HOST);
        let payload = [0xAA; PAYLOAD_MAX];
        let len = block_on(forwarder.forward(&[0; HEADER_LEN], &payload)).unwrap();
        assert_eq!(len, DATAGRAM_MAX);
    }

    #[test]
    fn test_send_error_is_counted_not_retried() {
        let sink = RecordingSink {
            fail_next: 1,
            ..RecordingSink::default()
        };
        let mut forwarder = UdpForwarder::new(sink, HOST);
        let header = [0; HEADER_LEN];

        assert_eq!(
            block_on(forwarder.forward(&header, &[1])),
            Err(ForwardError::Send(NoRoute))
        );
        assert!(forwarder.sink.sent.is_empty(), "failed datagram must not be resent");

        block_on(forwarder.forward(&header, &[2])).unwrap();
        assert_eq!(forwarder.sink.sent.len(), 1);
        assert_eq!(
            forwarder.stats(),
            ForwarderStats {
                sent: 1,
                dropped: 1,
                clamped: 0
            }
        );
    }

    #[test]
    fn test_oversized_payload_is_refused() {
        let mut forwarder = UdpForwarder::new(RecordingSink::default(), HOST);
        let payload = [0u8; PAYLOAD_MAX + 1];
        assert_eq!(
            block_on(forwarder.forward(&[0; HEADER_LEN], &payload)),
            Err(ForwardError::PayloadTooLarge(PAYLOAD_MAX + 1))
        );
        assert!(forwarder.sink.sent.is_empty());
    }
}
