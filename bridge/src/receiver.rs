//! Two-phase SPI-slave receive: a 10-byte header, then exactly the payload it declares
//! (clamped to `payload_max`). RDY is asserted before each of the two transactions.

use core::fmt;

use embedded_hal::digital::OutputPin;
use log::warn;

use crate::chunk::{ChunkHeader, HEADER_LEN, PAYLOAD_MAX, declared_payload_len};
use crate::ready::ReadyLine;

/// SPI slave peripheral seen from the bridge.
#[allow(async_fn_in_trait)]
pub trait SlaveLink {
    type Error: fmt::Debug;

    /// Posts a receive of exactly `buf.len()` bytes and waits, without timeout,
    /// until the master has clocked the transaction.
    async fn receive(&mut self, buf: &mut [u8]) -> Result<(), Self::Error>;
}

/// Any of these means the SPI slave is misconfigured; the device restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveError<E> {
    Spi(E),
    ReadyLine,
}

impl<E: fmt::Debug> fmt::Display for ReceiveError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveError::Spi(e) => write!(f, "SPI slave error: {:?}", e),
            ReceiveError::ReadyLine => f.write_str("RDY line could not be driven"),
        }
    }
}

/// One received chunk, borrowed from the receiver's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub header: &'a [u8; HEADER_LEN],
    pub payload: &'a [u8],
}

impl Chunk<'_> {
    pub fn declared_len(&self) -> u16 {
        declared_payload_len(self.header)
    }

    /// True when fewer payload bytes were received than the header declares.
    pub fn is_clamped(&self) -> bool {
        self.declared_len() as usize > self.payload.len()
    }
}

pub struct FramedReceiver<L: SlaveLink, P: OutputPin> {
    link: L,
    ready: ReadyLine<P>,
    payload_max: usize,
    header: [u8; HEADER_LEN],
    payload: [u8; PAYLOAD_MAX],
}

impl<L: SlaveLink, P: OutputPin> FramedReceiver<L, P> {
    /// `payload_max` is capped at the buffer capacity [`PAYLOAD_MAX`].
    pub fn new(link: L, ready: ReadyLine<P>, payload_max: usize) -> Self {
        Self {
            link,
            ready,
            payload_max: payload_max.min(PAYLOAD_MAX),
            header: [0; HEADER_LEN],
            payload: [0; PAYLOAD_MAX],
        }
    }

    /// Receives the next header/payload pair.
    pub async fn receive_chunk(&mut self) -> Result<Chunk<'_>, ReceiveError<L::Error>> {
        self.header.fill(0);
        self.assert_ready()?;
        self.link
            .receive(&mut self.header)
            .await
            .map_err(ReceiveError::Spi)?;

        let header = ChunkHeader::decode(&self.header);
        let len = header.accepted_len(self.payload_max);
        if len < header.payload_len as usize {
            warn!(
                "Frame {} chunk {} declares {} payload bytes, clamping to {}",
                header.frame_id, header.chunk_id, header.payload_len, len
            );
        }

        self.payload[..len].fill(0);
        self.assert_ready()?;
        self.link
            .receive(&mut self.payload[..len])
            .await
            .map_err(ReceiveError::Spi)?;

        Ok(Chunk {
            header: &self.header,
            payload: &self.payload[..len],
        })
    }

    fn assert_ready(&mut self) -> Result<(), ReceiveError<L::Error>> {
        self.ready.assert().map_err(|e| {
            warn!("RDY assert failed: {:?}", e);
            ReceiveError::ReadyLine
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::SlaveLink;
    use std::collections::VecDeque;
    use std::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkClosed;

    /// Replays scripted master transfers; each `receive` consumes one.
    ///
    /// A transfer shorter than the posted buffer leaves the tail zeroed, a longer
    /// one is truncated, as on a real slave.
    #[derive(Default)]
    pub struct ScriptedLink {
        pub transfers: VecDeque<Vec<u8>>,
        pub posted: Vec<usize>,
    }

    impl ScriptedLink {
        pub fn push(&mut self, bytes: &[u8]) {
            self.transfers.push_back(bytes.to_vec());
        }
    }

    impl SlaveLink for ScriptedLink {
        type Error = LinkClosed;

        async fn receive(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
            self.posted.push(buf.len());
            let transfer = self.transfers.pop_front().ok_or(LinkClosed)?;
            let n = transfer.len().min(buf.len());
            buf[..n].copy_from_slice(&transfer[..n]);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{LinkClosed, ScriptedLink};
    use super::*;
    use crate::ready::Polarity;
    use crate::ready::mock::RecordingPin;
    use embassy_futures::block_on;

    fn receiver(link: ScriptedLink, payload_max: usize) -> FramedReceiver<ScriptedLink, RecordingPin> {
        let ready = ReadyLine::new(RecordingPin::default(), Polarity::ActiveHigh).unwrap();
        FramedReceiver::new(link, ready, payload_max)
    }

    fn header(payload_len: u16) -> [u8; HEADER_LEN] {
        let mut raw = [0x11, 0x22, 0x33, 0x44, 0x01, 0x00, 0x02, 0x00, 0, 0];
        raw[8..10].copy_from_slice(&payload_len.to_le_bytes());
        raw
    }

    #[test]
    fn test_nominal_two_phase_receive() {
        let mut link = ScriptedLink::default();
        link.push(&header(4));
        link.push(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut rx = receiver(link, PAYLOAD_MAX);

        let chunk = block_on(rx.receive_chunk()).unwrap();
        assert_eq!(chunk.header, &header(4));
        assert_eq!(chunk.payload, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(!chunk.is_clamped());
        assert_eq!(rx.link.posted, [HEADER_LEN, 4]);
    }

    #[test]
    fn test_rdy_asserted_before_each_transaction() {
        let mut link = ScriptedLink::default();
        link.push(&header(1));
        link.push(&[0x42]);
        let mut rx = receiver(link, PAYLOAD_MAX);
        block_on(rx.receive_chunk()).unwrap();

        let pin = &rx.ready_pin_history();
        // released at construction, then asserted for header and payload
        assert_eq!(pin.as_slice(), &[false, true, true]);
    }

    #[test]
    fn test_zero_length_payload_posts_empty_receive() {
        let mut link = ScriptedLink::default();
        link.push(&header(0));
        link.push(&[]);
        let mut rx = receiver(link, PAYLOAD_MAX);

        let chunk = block_on(rx.receive_chunk()).unwrap();
        assert!(chunk.payload.is_empty());
        assert_eq!(rx.link.posted, [HEADER_LEN, 0]);
    }

    #[test]
    fn test_oversized_declaration_is_clamped() {
        let mut link = ScriptedLink::default();
        link.push(&header(0xFFFF));
        link.push(&[0xAA; PAYLOAD_MAX]);
        let mut rx = receiver(link, PAYLOAD_MAX);

        let chunk = block_on(rx.receive_chunk()).unwrap();
        assert_eq!(chunk.payload.len(), PAYLOAD_MAX);
        assert_eq!(chunk.declared_len(), 0xFFFF);
        assert!(chunk.is_clamped());
        assert_eq!(chunk.header, &header(0xFFFF), "header is forwarded unmodified");
    }

    #[test]
    fn test_runtime_payload_max_lowers_clamp() {
        let mut link = ScriptedLink::default();
        link.push(&header(1400));
        link.push(&[0x55; 1400]);
        let mut rx = receiver(link, 1024);

        let chunk = block_on(rx.receive_chunk()).unwrap();
        assert_eq!(chunk.payload.len(), 1024);
        assert_eq!(rx.link.posted, [HEADER_LEN, 1024]);
    }

    #[test]
    fn test_payload_buffer_is_zeroed_between_chunks() {
        let mut link = ScriptedLink::default();
        link.push(&header(4));
        link.push(&[1, 2, 3, 4]);
        link.push(&header(4));
        // master clocks fewer bytes than declared
        link.push(&[9]);
        let mut rx = receiver(link, PAYLOAD_MAX);

        block_on(rx.receive_chunk()).unwrap();
        let chunk = block_on(rx.receive_chunk()).unwrap();
        assert_eq!(chunk.payload, &[9, 0, 0, 0]);
    }

    #[test]
    fn test_spi_error_is_reported() {
        let mut link = ScriptedLink::default();
        link.push(&header(8));
        let mut rx = receiver(link, PAYLOAD_MAX);
        assert_eq!(
            block_on(rx.receive_chunk()),
            Err(ReceiveError::Spi(LinkClosed))
        );
    }

    impl FramedReceiver<ScriptedLink, RecordingPin> {
        fn ready_pin_history(&self) -> std::vec::Vec<bool> {
            self.ready.pin().history.iter().copied().collect()
        }
    }
}
