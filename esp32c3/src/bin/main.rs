//! ESP32-C3 firmware for the SPI-to-UDP chunk bridge
//!
//! The device is an SPI slave that receives `[10-byte header][payload]` chunks from
//! a camera MCU and re-emits each one as a single UDP datagram to a fixed host.
//!
//! Features:
//! - Wi-Fi station with automatic reconnect
//! - BLE commissioning on first boot, credentials persisted in flash
//! - RDY handshake line so the master only clocks when a receive is posted

#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

use embassy_executor::Spawner;
use esp_hal::clock::CpuClock;
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::system::software_reset;
use esp_hal::timer::timg::TimerGroup;
use log::{error, info};
use spi_udp_bridge::bootstrap::Bootstrap;
use spi_udp_bridge::config::BridgeConfig;
use spi_udp_bridge::network::NetworkReady;
use spi_udp_bridge_esp32c3::platform::{BridgePeripherals, Esp32c3Platform, GpioPool};
use {esp_backtrace as _, esp_println as _};

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

static NETWORK_READY: NetworkReady = NetworkReady::new();

#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    esp_println::logger::init_logger_from_env();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // Wi-Fi and BLE both allocate from the heap.
    esp_alloc::heap_allocator!(#[unsafe(link_section = ".dram2_uninit")] size: 66320);
    esp_alloc::heap_allocator!(size: 48 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_interrupt = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_interrupt.software_interrupt0);

    let config = match BridgeConfig::from_build_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid bridge configuration: {}, restarting", e);
            software_reset()
        }
    };
    info!("SPI-UDP bridge starting, target {}", config.destination);

    let platform = Esp32c3Platform::new(
        spawner,
        BridgePeripherals {
            flash: peripherals.FLASH,
            wifi: peripherals.WIFI,
            bt: peripherals.BT,
            spi: peripherals.SPI2,
            dma: peripherals.DMA_CH0,
            // GPIO12..=19 belong to flash and USB serial/JTAG.
            gpio: GpioPool::new()
                .with(0, peripherals.GPIO0)
                .with(1, peripherals.GPIO1)
                .with(2, peripherals.GPIO2)
                .with(3, peripherals.GPIO3)
                .with(4, peripherals.GPIO4)
                .with(5, peripherals.GPIO5)
                .with(6, peripherals.GPIO6)
                .with(7, peripherals.GPIO7)
                .with(8, peripherals.GPIO8)
                .with(9, peripherals.GPIO9)
                .with(10, peripherals.GPIO10)
                .with(11, peripherals.GPIO11)
                .with(20, peripherals.GPIO20)
                .with(21, peripherals.GPIO21),
        },
    );

    let Err(e) = Bootstrap::new(config, &NETWORK_READY).run(platform).await;
    error!("{}, restarting", e);
    software_reset()
}
