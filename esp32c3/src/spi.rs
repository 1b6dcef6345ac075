//! SPI2 in slave mode (DMA) plus the RDY output.
//!
//! Every receive is one DMA transaction sized exactly to the requested length, so
//! the master's chip-select framing lines up with the header/payload split.

use core::fmt;

use embassy_futures::yield_now;
use esp_hal::{
    Blocking,
    dma_buffers,
    gpio::{AnyPin, Level, Output, OutputConfig},
    peripherals::{DMA_CH0, SPI2},
    spi::{self, Mode, slave::Spi, slave::dma::SpiDma},
};
use log::info;
use spi_udp_bridge::chunk::PAYLOAD_MAX;
use spi_udp_bridge::config::PinMap;
use spi_udp_bridge::ready::Polarity;
use spi_udp_bridge::receiver::SlaveLink;

#[derive(Debug)]
pub enum LinkError {
    Spi(spi::Error),
    /// More bytes requested than the DMA buffer holds.
    TooLong(usize),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Spi(e) => write!(f, "SPI DMA error: {:?}", e),
            LinkError::TooLong(len) => write!(f, "receive of {} bytes exceeds DMA buffer", len),
        }
    }
}

impl From<spi::Error> for LinkError {
    fn from(e: spi::Error) -> Self {
        LinkError::Spi(e)
    }
}

pub struct SpiSlaveLink {
    spi: SpiDma<'static, Blocking>,
    rx_buffer: &'static mut [u8],
}

impl SlaveLink for SpiSlaveLink {
    type Error = LinkError;

    async fn receive(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        let len = buf.len();
        if len == 0 {
            return Ok(());
        }
        if len > self.rx_buffer.len() {
            return Err(LinkError::TooLong(len));
        }

        let mut window = &mut self.rx_buffer[..len];
        let transfer = self.spi.read(&mut window)?;
        // The slave DMA transfer has no interrupt-driven future; poll and let the
        // network tasks run in between.
        while !transfer.is_done() {
            yield_now().await;
        }
        transfer.wait()?;

        buf.copy_from_slice(&self.rx_buffer[..len]);
        Ok(())
    }
}

/// The five GPIOs of a [`PinMap`], already taken out of the pool.
pub struct SlavePins {
    pub sclk: AnyPin<'static>,
    pub miso: AnyPin<'static>,
    pub mosi: AnyPin<'static>,
    pub cs: AnyPin<'static>,
    pub rdy: AnyPin<'static>,
}

/// Takes SPI2 and the first GDMA channel and routes them to the configured pins.
///
/// Returns the link and the RDY output, which starts at the released level so the
/// master does not clock before a buffer is posted.
pub fn open(
    spi: SPI2<'static>,
    dma: DMA_CH0<'static>,
    gpio: SlavePins,
    pins: &PinMap,
    rdy_polarity: Polarity,
) -> (SpiSlaveLink, Output<'static>) {
    // MISO is never driven, so the TX side only needs its descriptors.
    let (rx_buffer, rx_descriptors, _, tx_descriptors) = dma_buffers!(PAYLOAD_MAX, 0);
    let spi = Spi::new(spi, Mode::_0)
        .with_sck(gpio.sclk)
        .with_mosi(gpio.mosi)
        .with_miso(gpio.miso)
        .with_cs(gpio.cs)
        .with_dma(dma, rx_descriptors, tx_descriptors);
    let released = match rdy_polarity {
        Polarity::ActiveHigh => Level::Low,
        Polarity::ActiveLow => Level::High,
    };
    let rdy = Output::new(gpio.rdy, released, OutputConfig::default());

    info!(
        "SPI slave ready (mode 0, SCLK={} MISO={} MOSI={} CS={} RDY={})",
        pins.sclk, pins.miso, pins.mosi, pins.cs, pins.rdy
    );
    (SpiSlaveLink { spi, rx_buffer }, rdy)
}
