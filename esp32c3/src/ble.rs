//! BLE commissioning: a GATT service a companion app writes Wi-Fi credentials to.
//!
//! The service exposes five characteristics:
//! - `pop`: proof of possession, written first unless security is `Sec0`
//! - `ssid` and `passphrase`: raw bytes, any length up to the credential limits
//! - `apply`: any write validates the collected values and hands them over
//! - `status`: readable and notifying, one [`SessionStatus`] byte
//!
//! The GATT server runs in its own task from `start` until `stop`. If the host
//! dies first, `next_credentials` returns an error and the boot aborts.

use bt_hci::controller::ExternalController;
use embassy_executor::{SpawnError, Spawner};
use embassy_futures::select::{Either, Either3, select, select3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use esp_hal::peripherals::BT;
use esp_radio::{Controller, ble::controller::BleConnector};
use log::{error, info, warn};
use spi_udp_bridge::commission::{ProvisioningService, ServiceName};
use spi_udp_bridge::config::SecurityTier;
use spi_udp_bridge::credentials::Credentials;
use spi_udp_bridge::session::{CommissioningSession, SessionError, SessionStatus};
use trouble_host::prelude::*;

const CONNECTIONS_MAX: usize = 1;
const L2CAP_CHANNELS_MAX: usize = 2;
const ADVERTISE_RETRY_DELAY: Duration = Duration::from_secs(1);

pub type BleController = ExternalController<BleConnector<'static>, 20>;

static APPLIED: Channel<CriticalSectionRawMutex, Credentials, 1> = Channel::new();
static STOP: Signal<CriticalSectionRawMutex, ()> = Signal::new();
static FAILED: Signal<CriticalSectionRawMutex, BleError> = Signal::new();

/// 128-bit UUID of the commissioning service, little-endian as advertised.
const SERVICE_UUID: [u8; 16] = [
    0x00, 0x00, 0xa0, 0x5b, 0x8e, 0x1d, 0x4c, 0x2e, 0x9f, 0x7a, 0x3b, 0x6d, 0x01, 0x00, 0xc3, 0x5e,
];

#[gatt_server]
struct Server {
    commissioning: CommissioningGatt,
}

#[gatt_service(uuid = "5ec30001-6d3b-7a9f-2e4c-1d8e5ba00000")]
struct CommissioningGatt {
    #[characteristic(uuid = "5ec30001-6d3b-7a9f-2e4c-1d8e5ba00001", write, value = [0u8; 64])]
    pop: [u8; 64],
    #[characteristic(uuid = "5ec30001-6d3b-7a9f-2e4c-1d8e5ba00002", write, value = [0u8; 32])]
    ssid: [u8; 32],
    #[characteristic(uuid = "5ec30001-6d3b-7a9f-2e4c-1d8e5ba00003", write, value = [0u8; 64])]
    passphrase: [u8; 64],
    #[characteristic(uuid = "5ec30001-6d3b-7a9f-2e4c-1d8e5ba00004", write, value = 0)]
    apply: u8,
    #[characteristic(uuid = "5ec30001-6d3b-7a9f-2e4c-1d8e5ba00005", read, notify, value = 0)]
    status: u8,
}

#[derive(Debug)]
pub enum BleError {
    /// `start` was called a second time; the controller is gone.
    AlreadyStarted,
    ServiceNameTooLong,
    /// The radio refused the BLE transport.
    Connector,
    /// Advertising data did not fit a legacy advertising PDU.
    Advertising,
    GattServer,
    /// The host runner returned while commissioning was still active.
    HostStopped,
    Spawn(SpawnError),
}

/// Legacy advertising payload plus scan response, encoded once at start.
struct AdvertisingData {
    adv: [u8; 31],
    adv_len: usize,
    scan: [u8; 31],
    scan_len: usize,
}

impl AdvertisingData {
    // The service UUID goes in the scan response; with it the name would not fit.
    fn encode(name: &str) -> Result<Self, BleError> {
        let mut adv = [0; 31];
        let mut scan = [0; 31];
        let encoded = AdStructure::encode_slice(
            &[
                AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
                AdStructure::CompleteLocalName(name.as_bytes()),
            ],
            &mut adv[..],
        )
        .and_then(|adv_len| {
            AdStructure::encode_slice(&[AdStructure::ServiceUuids128(&[SERVICE_UUID])], &mut scan[..])
                .map(|scan_len| (adv_len, scan_len))
        });
        match encoded {
            Ok((adv_len, scan_len)) => Ok(Self {
                adv,
                adv_len,
                scan,
                scan_len,
            }),
            Err(e) => {
                error!("Failed to encode advertising data: {:?}", e);
                Err(BleError::Advertising)
            }
        }
    }

    fn advertisement(&self) -> Advertisement<'_> {
        Advertisement::ConnectableScannableUndirected {
            adv_data: &self.adv[..self.adv_len],
            scan_data: &self.scan[..self.scan_len],
        }
    }
}

/// [`ProvisioningService`] backed by the trouble-host peripheral stack.
pub struct BleCommissioning {
    spawner: Spawner,
    radio: &'static Controller<'static>,
    bt: Option<BT<'static>>,
}

impl BleCommissioning {
    pub fn new(spawner: Spawner, radio: &'static Controller<'static>, bt: BT<'static>) -> Self {
        Self {
            spawner,
            radio,
            bt: Some(bt),
        }
    }
}

impl ProvisioningService for BleCommissioning {
    type Error = BleError;

    async fn start(
        &mut self,
        service_name: &str,
        security: SecurityTier,
        pop: &'static str,
    ) -> Result<(), Self::Error> {
        let name = ServiceName::try_from(service_name).map_err(|_| BleError::ServiceNameTooLong)?;
        let advertising = AdvertisingData::encode(&name)?;
        let bt = self.bt.take().ok_or(BleError::AlreadyStarted)?;
        let transport = BleConnector::new(self.radio, bt, Default::default()).map_err(|e| {
            error!("Failed to create BLE connector: {:?}", e);
            BleError::Connector
        })?;
        FAILED.reset();
        self.spawner
            .spawn(commissioning_task(transport, name, advertising, security, pop))
            .map_err(BleError::Spawn)
    }

    /// Fails once the GATT task is gone, so a dead BLE host ends the boot.
    async fn next_credentials(&mut self) -> Result<Credentials, Self::Error> {
        match select(APPLIED.receive(), FAILED.wait()).await {
            Either::First(credentials) => Ok(credentials),
            Either::Second(e) => Err(e),
        }
    }

    fn stop(&mut self) {
        STOP.signal(());
    }
}

#[embassy_executor::task]
async fn commissioning_task(
    transport: BleConnector<'static>,
    name: ServiceName,
    advertising: AdvertisingData,
    security: SecurityTier,
    pop: &'static str,
) {
    let controller: BleController = ExternalController::new(transport);
    let address: Address = Address::random([0xff, 0x8f, 0x1a, 0x05, 0xe4, 0xff]);
    let mut resources: HostResources<DefaultPacketPool, CONNECTIONS_MAX, L2CAP_CHANNELS_MAX> =
        HostResources::new();
    let stack = trouble_host::new(controller, &mut resources).set_random_address(address);
    let Host {
        mut peripheral,
        mut runner,
        ..
    } = stack.build();

    let server = match Server::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: &name,
        appearance: &appearance::power_device::GENERIC_POWER_DEVICE,
    })) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create GATT server: {:?}", e);
            FAILED.signal(BleError::GattServer);
            return;
        }
    };

    info!("Advertising commissioning service as {}", name.as_str());
    let advertise = async {
        loop {
            let acceptor = match peripheral
                .advertise(&Default::default(), advertising.advertisement())
                .await
            {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    error!("Failed to start BLE advertising: {:?}", e);
                    Timer::after(ADVERTISE_RETRY_DELAY).await;
                    continue;
                }
            };
            let conn = match acceptor.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept BLE connection: {:?}", e);
                    continue;
                }
            };
            let conn = match conn.with_attribute_server(&server) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to attach GATT server to connection: {:?}", e);
                    continue;
                }
            };

            info!("Companion connected");
            let mut session = CommissioningSession::new(security, pop);
            gatt_events(&server, &conn, &mut session).await;
        }
    };

    match select3(runner.run(), advertise, STOP.wait()).await {
        Either3::First(result) => {
            match result {
                Ok(()) => error!("BLE host exited while commissioning"),
                Err(e) => error!("BLE host stopped: {:?}", e),
            }
            FAILED.signal(BleError::HostStopped);
        }
        Either3::Second(_) => {}
        Either3::Third(()) => info!("BLE commissioning stopped"),
    }
}

/// Feeds characteristic writes into `session` until the central disconnects.
async fn gatt_events(
    server: &Server<'_>,
    conn: &GattConnection<'_, '_, DefaultPacketPool>,
    session: &mut CommissioningSession,
) {
    let service = &server.commissioning;
    let mut published = SessionStatus::Idle;
    loop {
        match conn.next().await {
            GattConnectionEvent::Disconnected { reason } => {
                info!("Companion disconnected: {:?}", reason);
                break;
            }
            GattConnectionEvent::Gatt { event } => {
                let outcome = match &event {
                    GattEvent::Write(write) => {
                        let handle = write.handle();
                        let data = write.data();
                        if handle == service.pop.handle {
                            session.submit_proof(data);
                            Ok(())
                        } else if handle == service.ssid.handle {
                            session.set_ssid(data)
                        } else if handle == service.passphrase.handle {
                            session.set_passphrase(data)
                        } else if handle == service.apply.handle {
                            apply(session)
                        } else {
                            Ok(())
                        }
                    }
                    _ => Ok(()),
                };

                let reply = match outcome {
                    Ok(()) => event.accept(),
                    Err(e) => {
                        warn!("Rejecting commissioning write: {}", e);
                        event.reject(att_error(e))
                    }
                };
                match reply {
                    Ok(reply) => reply.send().await,
                    Err(e) => warn!("[gatt] error sending response: {:?}", e),
                }

                let status = session.status();
                if status != published {
                    published = status;
                    if let Err(e) = service.status.notify(conn, &(status as u8)).await {
                        warn!("[gatt] status notify failed: {:?}", e);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Validated credentials go to the bootstrap; rejected ones only change the status.
fn apply(session: &mut CommissioningSession) -> Result<(), SessionError> {
    match session.apply() {
        Ok(credentials) => {
            if APPLIED.try_send(credentials).is_err() {
                warn!("Previous credentials not consumed yet, dropping these");
            }
            Ok(())
        }
        Err(SessionError::Invalid(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

fn att_error(e: SessionError) -> AttErrorCode {
    match e {
        SessionError::ProofRequired => AttErrorCode::INSUFFICIENT_AUTHORIZATION,
        SessionError::TooLong => AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH,
        SessionError::Invalid(_) => AttErrorCode::VALUE_NOT_ALLOWED,
    }
}
