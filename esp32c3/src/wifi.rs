//! Wi-Fi station supervision and the embassy-net stack on top of it.
//!
//! Credentials reach the connection task through a signal, so the station can be
//! started before any are known and re-pointed while commissioning is running.

use alloc::string::String;

use embassy_executor::{SpawnError, Spawner};
use embassy_futures::select::{Either, select};
use embassy_net::{Config as NetConfig, Runner, Stack, StackResources};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use esp_hal::peripherals::WIFI;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiDevice, WifiError, WifiEvent};
use log::{info, warn};
use spi_udp_bridge::commission::Station;
use spi_udp_bridge::credentials::Credentials;
use spi_udp_bridge::network::NetworkReady;
use static_cell::StaticCell;

/// Pause before reassociating after a disconnect or failed attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

static CREDENTIALS: Signal<CriticalSectionRawMutex, Credentials> = Signal::new();
static RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();

#[derive(Debug)]
pub enum StartError {
    Driver(WifiError),
    Spawn(SpawnError),
}

/// Handle the bootstrap uses to point the station at a network.
pub struct WifiStation;

impl Station for WifiStation {
    fn join(&mut self, credentials: &Credentials) {
        CREDENTIALS.signal(credentials.clone());
    }
}

pub struct WifiParts {
    pub station: WifiStation,
    pub stack: Stack<'static>,
    pub mac: [u8; 6],
}

/// Creates the station interface and the IP stack and spawns the tasks that
/// keep them running. `ready` is set once DHCP hands out an address.
pub fn start(
    spawner: Spawner,
    radio: &'static esp_radio::Controller<'static>,
    wifi: WIFI<'static>,
    seed: u64,
    ready: &'static NetworkReady,
) -> Result<WifiParts, StartError> {
    let (controller, interfaces) =
        esp_radio::wifi::new(radio, wifi, Default::default()).map_err(StartError::Driver)?;
    let device = interfaces.sta;
    let mac = device.mac_address();

    let (stack, runner) = embassy_net::new(
        device,
        NetConfig::dhcpv4(Default::default()),
        RESOURCES.init(StackResources::new()),
        seed,
    );

    spawner
        .spawn(connection_task(controller))
        .map_err(StartError::Spawn)?;
    spawner.spawn(net_task(runner)).map_err(StartError::Spawn)?;
    spawner
        .spawn(ip_watch_task(stack, ready))
        .map_err(StartError::Spawn)?;

    Ok(WifiParts {
        station: WifiStation,
        stack,
        mac,
    })
}

fn client_config(credentials: &Credentials) -> ModeConfig {
    ModeConfig::Client(
        ClientConfig::default()
            .with_ssid(String::from(credentials.ssid()))
            .with_password(String::from(credentials.passphrase())),
    )
}

/// Associates with the latest credentials and reassociates after every
/// disconnect. New credentials interrupt whatever attempt is in progress.
#[embassy_executor::task]
async fn connection_task(mut controller: WifiController<'static>) {
    let mut credentials = CREDENTIALS.wait().await;
    loop {
        if let Err(e) = controller.set_config(&client_config(&credentials)) {
            warn!("Wi-Fi set_config error: {:?}", e);
        } else if !matches!(controller.is_started(), Ok(true))
            && let Err(e) = controller.start_async().await
        {
            warn!("Wi-Fi start error: {:?}", e);
        } else {
            info!("Connecting to {:?}", credentials.ssid());
            match select(controller.connect_async(), CREDENTIALS.wait()).await {
                Either::First(Ok(())) => {
                    info!("Associated with {:?}", credentials.ssid());
                    match select(
                        controller.wait_for_event(WifiEvent::StaDisconnected),
                        CREDENTIALS.wait(),
                    )
                    .await
                    {
                        Either::First(()) => warn!("Station disconnected, reconnecting"),
                        Either::Second(next) => {
                            info!("New credentials while connected, switching networks");
                            credentials = next;
                            if let Err(e) = controller.disconnect_async().await {
                                warn!("Wi-Fi disconnect error: {:?}", e);
                            }
                            continue;
                        }
                    }
                }
                Either::First(Err(e)) => warn!("Wi-Fi connect error: {:?}", e),
                Either::Second(next) => {
                    info!("New credentials while connecting, switching networks");
                    credentials = next;
                    if let Err(e) = controller.disconnect_async().await {
                        warn!("Wi-Fi disconnect error: {:?}", e);
                    }
                    continue;
                }
            }
        }

        if let Either::Second(next) = select(Timer::after(RECONNECT_DELAY), CREDENTIALS.wait()).await
        {
            credentials = next;
        }
    }
}

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}

/// Sets `ready` on the first DHCP lease and logs every later change.
#[embassy_executor::task]
async fn ip_watch_task(stack: Stack<'static>, ready: &'static NetworkReady) {
    loop {
        stack.wait_config_up().await;
        if let Some(config) = stack.config_v4() {
            info!("Got IP {}", config.address);
        }
        ready.set();
        stack.wait_config_down().await;
        warn!("Lost IPv4 configuration");
    }
}
