//! ESP32-C3 implementation of the bootstrap's [`Platform`].

use embassy_executor::Spawner;
use esp_hal::gpio::{AnyPin, Output};
use esp_hal::peripherals::{BT, DMA_CH0, FLASH, SPI2, WIFI};
use esp_hal::rng::Rng;
use esp_radio::InitializationError;
use esp_storage::FlashStorage;
use log::info;
use spi_udp_bridge::bootstrap::{NetworkParts, Platform};
use spi_udp_bridge::config::{GPIO_MAX, PinMap};
use spi_udp_bridge::network::NetworkReady;
use spi_udp_bridge::ready::Polarity;
use static_cell::StaticCell;

use crate::ble::BleCommissioning;
use crate::spi::{self, SlavePins, SpiSlaveLink};
use crate::udp::UdpLink;
use crate::wifi::{self, StartError, WifiStation};

/// Start of the `nvs` partition in the default partition table. One sector of it
/// holds the credential record.
pub const CREDENTIAL_SECTOR: u32 = 0x9000;

static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();

/// GPIOs the SPI slave and RDY line may be routed to, indexed by number.
pub struct GpioPool {
    pins: [Option<AnyPin<'static>>; GPIO_MAX as usize + 1],
}

impl GpioPool {
    pub fn new() -> Self {
        Self {
            pins: [const { None }; GPIO_MAX as usize + 1],
        }
    }

    pub fn with(mut self, gpio: u8, pin: impl Into<AnyPin<'static>>) -> Self {
        if let Some(slot) = self.pins.get_mut(gpio as usize) {
            *slot = Some(pin.into());
        }
        self
    }

    fn take(&mut self, gpio: u8) -> Result<AnyPin<'static>, PlatformError> {
        self.pins
            .get_mut(gpio as usize)
            .and_then(Option::take)
            .ok_or(PlatformError::PinUnavailable(gpio))
    }

    fn take_map(&mut self, pins: &PinMap) -> Result<SlavePins, PlatformError> {
        Ok(SlavePins {
            sclk: self.take(pins.sclk)?,
            miso: self.take(pins.miso)?,
            mosi: self.take(pins.mosi)?,
            cs: self.take(pins.cs)?,
            rdy: self.take(pins.rdy)?,
        })
    }
}

impl Default for GpioPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Peripherals the bridge takes over. Everything else stays with `main`.
pub struct BridgePeripherals {
    pub flash: FLASH<'static>,
    pub wifi: WIFI<'static>,
    pub bt: BT<'static>,
    pub spi: SPI2<'static>,
    pub dma: DMA_CH0<'static>,
    pub gpio: GpioPool,
}

#[derive(Debug)]
pub enum PlatformError {
    /// A peripheral was requested twice.
    AlreadyTaken(&'static str),
    /// The GPIO is not in the pool or was handed out already.
    PinUnavailable(u8),
    /// The IP stack is needed before `start_network` ran.
    NetworkNotStarted,
    Radio(InitializationError),
    Wifi(StartError),
    Socket(embassy_net::udp::BindError),
}

pub struct Esp32c3Platform {
    spawner: Spawner,
    flash: Option<FLASH<'static>>,
    wifi: Option<WIFI<'static>>,
    bt: Option<BT<'static>>,
    spi: Option<SPI2<'static>>,
    dma: Option<DMA_CH0<'static>>,
    gpio: GpioPool,
    stack: Option<embassy_net::Stack<'static>>,
}

impl Esp32c3Platform {
    pub fn new(spawner: Spawner, peripherals: BridgePeripherals) -> Self {
        Self {
            spawner,
            flash: Some(peripherals.flash),
            wifi: Some(peripherals.wifi),
            bt: Some(peripherals.bt),
            spi: Some(peripherals.spi),
            dma: Some(peripherals.dma),
            gpio: peripherals.gpio,
            stack: None,
        }
    }
}

fn take<T>(slot: &mut Option<T>, name: &'static str) -> Result<T, PlatformError> {
    slot.take().ok_or(PlatformError::AlreadyTaken(name))
}

impl Platform for Esp32c3Platform {
    type Error = PlatformError;
    type Flash = FlashStorage<'static>;
    type Station = WifiStation;
    type Provisioning = BleCommissioning;
    type Link = SpiSlaveLink;
    type Ready = Output<'static>;
    type Sink = UdpLink;

    fn credential_flash(&mut self) -> Result<(Self::Flash, u32), Self::Error> {
        let flash = take(&mut self.flash, "FLASH")?;
        Ok((FlashStorage::new(flash), CREDENTIAL_SECTOR))
    }

    async fn start_network(
        &mut self,
        ready: &'static NetworkReady,
    ) -> Result<NetworkParts<Self::Station, Self::Provisioning>, Self::Error> {
        let wifi = take(&mut self.wifi, "WIFI")?;
        let bt = take(&mut self.bt, "BT")?;

        let radio = RADIO.init(esp_radio::init().map_err(PlatformError::Radio)?);
        let rng = Rng::new();
        let seed = (rng.random() as u64) << 32 | rng.random() as u64;

        let parts =
            wifi::start(self.spawner, radio, wifi, seed, ready).map_err(PlatformError::Wifi)?;
        info!(
            "Wi-Fi station up, MAC {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            parts.mac[0], parts.mac[1], parts.mac[2], parts.mac[3], parts.mac[4], parts.mac[5]
        );
        self.stack = Some(parts.stack);

        Ok(NetworkParts {
            station: parts.station,
            provisioning: BleCommissioning::new(self.spawner, radio, bt),
            mac: parts.mac,
        })
    }

    async fn open_socket(&mut self) -> Result<Self::Sink, Self::Error> {
        let stack = self.stack.ok_or(PlatformError::NetworkNotStarted)?;
        UdpLink::bind(stack).map_err(PlatformError::Socket)
    }

    fn open_spi_slave(
        &mut self,
        pins: &PinMap,
        rdy_polarity: Polarity,
    ) -> Result<(Self::Link, Self::Ready), Self::Error> {
        let spi = take(&mut self.spi, "SPI2")?;
        let dma = take(&mut self.dma, "DMA_CH0")?;
        let gpio = self.gpio.take_map(pins)?;
        Ok(spi::open(spi, dma, gpio, pins, rdy_polarity))
    }
}
