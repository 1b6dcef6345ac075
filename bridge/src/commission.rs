//! Wi-Fi onboarding over BLE, run only when no credentials are stored.

use core::fmt::{self, Write as _};

use embassy_futures::select::{Either, select};
use embedded_storage::nor_flash::NorFlash;
use heapless::String;
use log::{debug, info};

use crate::config::SecurityTier;
use crate::credentials::{CredentialStore, Credentials, StoreError};
use crate::network::NetworkReady;

/// Advertised BLE service name capacity: prefix, dash and six hex digits.
pub type ServiceName = String<32>;

/// BLE commissioning service (GATT server plus advertising).
#[allow(async_fn_in_trait)]
pub trait ProvisioningService {
    type Error: fmt::Debug;

    /// Starts advertising `service_name` and accepting sessions.
    async fn start(
        &mut self,
        service_name: &str,
        security: SecurityTier,
        pop: &'static str,
    ) -> Result<(), Self::Error>;

    /// Waits for the next credential set a companion app applied.
    async fn next_credentials(&mut self) -> Result<Credentials, Self::Error>;

    /// Stops advertising and releases the BLE controller.
    fn stop(&mut self);
}

/// The Wi-Fi station driver. `join` only hands over credentials; association,
/// DHCP and reconnects happen in the background.
pub trait Station {
    fn join(&mut self, credentials: &Credentials);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissionError<P, F> {
    Service(P),
    Store(StoreError<F>),
}

impl<P: fmt::Debug, F: fmt::Debug> fmt::Display for CommissionError<P, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommissionError::Service(e) => write!(f, "provisioning service failed: {:?}", e),
            CommissionError::Store(e) => write!(f, "credential store failed: {}", e),
        }
    }
}

/// How `run_if_needed` finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    AlreadyProvisioned,
    Commissioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Idle,
    Active,
    TornDown,
}

/// `<prefix>-XXYYZZ` from the last three bytes of the station MAC.
pub fn service_name(prefix: &str, mac: &[u8; 6]) -> ServiceName {
    let mut name = ServiceName::new();
    // The prefix length is bounded by config validation.
    let _ = write!(name, "{}-{:02X}{:02X}{:02X}", prefix, mac[3], mac[4], mac[5]);
    name
}

pub struct Commissioning<P: ProvisioningService> {
    service: P,
    state: ManagerState,
    security: SecurityTier,
    pop: &'static str,
    prefix: &'static str,
}

impl<P: ProvisioningService> Commissioning<P> {
    pub fn new(
        service: P,
        security: SecurityTier,
        pop: &'static str,
        prefix: &'static str,
    ) -> Self {
        Self {
            service,
            state: ManagerState::Idle,
            security,
            pop,
            prefix,
        }
    }

    pub fn is_provisioned<F: NorFlash>(&self, store: &CredentialStore<F>) -> bool {
        store.is_provisioned()
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.state == ManagerState::Active
    }

    /// Hands stored credentials to the station, or runs BLE onboarding until the
    /// network-ready bit is set.
    ///
    /// Every applied credential set is persisted and handed to the station. A later
    /// set replaces an earlier one until the station gets an address.
    pub async fn run_if_needed<F: NorFlash, S: Station>(
        &mut self,
        store: &mut CredentialStore<F>,
        station: &mut S,
        mac: &[u8; 6],
        ready: &NetworkReady,
    ) -> Result<Completion, CommissionError<P::Error, F::Error>> {
        if let Some(credentials) = store.credentials() {
            info!("Already provisioned");
            station.join(credentials);
            return Ok(Completion::AlreadyProvisioned);
        }

        let name = service_name(self.prefix, mac);
        info!("Not provisioned, starting BLE commissioning as {}", name);
        self.service
            .start(&name, self.security, self.pop)
            .await
            .map_err(CommissionError::Service)?;
        self.state = ManagerState::Active;

        loop {
            match select(ready.wait(), self.service.next_credentials()).await {
                Either::First(()) => break,
                Either::Second(credentials) => {
                    let credentials = credentials.map_err(CommissionError::Service)?;
                    store.store(&credentials).map_err(CommissionError::Store)?;
                    info!("Credentials received, joining {:?}", credentials.ssid());
                    station.join(&credentials);
                }
            }
        }

        info!("Commissioned and connected, stopping provisioning");
        self.teardown();
        Ok(Completion::Commissioned)
    }

    /// Stops the provisioning service. Safe to call any number of times.
    pub fn teardown(&mut self) {
        match self.state {
            ManagerState::Active => {
                self.service.stop();
                self.state = ManagerState::TornDown;
            }
            ManagerState::Idle => self.state = ManagerState::TornDown,
            ManagerState::TornDown => debug!("Provisioning already torn down"),
        }
    }

    #[cfg(test)]
    pub(crate) fn release(self) -> P {
        self.service
    }
}
