use core::convert::Infallible;

use embedded_hal::digital::OutputPin;
use log::{debug, warn};

use crate::forwarder::{DatagramSink, ForwarderStats, UdpForwarder};
use crate::receiver::{FramedReceiver, ReceiveError, SlaveLink};

/// Log a stats summary every this many chunks.
const STATS_INTERVAL: u32 = 256;

/// Runtime state handed to the forwarding task: the SPI receive side and the UDP side.
///
/// Owned exclusively by that task for the lifetime of the process.
pub struct Bridge<L: SlaveLink, P: OutputPin, S: DatagramSink> {
    receiver: FramedReceiver<L, P>,
    forwarder: UdpForwarder<S>,
    chunks: u32,
}

impl<L: SlaveLink, P: OutputPin, S: DatagramSink> Bridge<L, P, S> {
    pub fn new(receiver: FramedReceiver<L, P>, forwarder: UdpForwarder<S>) -> Self {
        Self {
            receiver,
            forwarder,
            chunks: 0,
        }
    }

    pub fn stats(&self) -> ForwarderStats {
        self.forwarder.stats()
    }

    /// Receives one chunk and emits it. Only a receive failure is an error; a failed
    /// send is logged and the chunk is dropped.
    pub async fn pump_once(&mut self) -> Result<(), ReceiveError<L::Error>> {
        let chunk = self.receiver.receive_chunk().await?;
        if chunk.is_clamped() {
            self.forwarder.note_clamped();
        }
        if let Err(e) = self.forwarder.forward(chunk.header, chunk.payload).await {
            warn!(
                "Dropping {}-byte chunk for {}: {}",
                chunk.payload.len(),
                self.forwarder.destination(),
                e
            );
        }

        self.chunks = self.chunks.wrapping_add(1);
        if self.chunks % STATS_INTERVAL == 0 {
            let stats = self.forwarder.stats();
            debug!(
                "Forwarded {} chunks: sent {}, dropped {}, clamped {}",
                self.chunks, stats.sent, stats.dropped, stats.clamped
            );
        }
        Ok(())
    }

    /// The forwarding loop. Returns only on a fatal SPI/RDY failure.
    pub async fn run(&mut self) -> Result<Infallible, ReceiveError<L::Error>> {
        loop {
            self.pump_once().await?;
        }
    }
}
