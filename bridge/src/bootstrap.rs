//! Startup sequence: credential store → network stack → (commissioning) → IP →
//! socket + SPI slave → forwarding loop.
//!
//! Stages only ever move forward. Any error on the way is fatal and handed back to
//! the caller, which restarts the device.

use core::convert::Infallible;
use core::fmt;

use embedded_hal::digital::OutputPin;
use embedded_storage::nor_flash::NorFlash;
use log::{error, info};

use crate::bridge::Bridge;
use crate::commission::{Commissioning, ProvisioningService, Station};
use crate::config::{BridgeConfig, PinMap};
use crate::credentials::CredentialStore;
use crate::forwarder::{DatagramSink, UdpForwarder};
use crate::network::NetworkReady;
use crate::ready::{Polarity, ReadyLine};
use crate::receiver::{FramedReceiver, SlaveLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootStage {
    NvsInit,
    NetInit,
    CommissionDecide,
    CommissionActive,
    AwaitIp,
    RuntimeInit,
    Forwarding,
}

/// Tracks the current stage and refuses to go back.
#[derive(Debug)]
pub struct BootSequence {
    stage: BootStage,
}

impl BootSequence {
    pub const fn new() -> Self {
        Self {
            stage: BootStage::NvsInit,
        }
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    /// Moves to `next`, which must come strictly after the current stage.
    pub fn advance(&mut self, next: BootStage) -> Result<(), BootError> {
        if next <= self.stage {
            return Err(BootError {
                stage: self.stage,
                fault: Fault::Sequence,
            });
        }
        info!("Boot stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
        Ok(())
    }
}

impl Default for BootSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// What broke. The underlying driver error is logged where it happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    CredentialStore,
    Platform,
    Commissioning,
    SpiLink,
    ReadyLine,
    Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootError {
    pub stage: BootStage,
    pub fault: Fault,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} failed during {:?}", self.fault, self.stage)
    }
}

/// Parts produced by bringing up the radio and IP stack.
pub struct NetworkParts<S, P> {
    pub station: S,
    pub provisioning: P,
    pub mac: [u8; 6],
}

/// Chip-specific drivers the bootstrap sequences.
#[allow(async_fn_in_trait)]
pub trait Platform {
    type Error: fmt::Debug;
    type Flash: NorFlash;
    type Station: Station;
    type Provisioning: ProvisioningService;
    type Link: SlaveLink;
    type Ready: OutputPin;
    type Sink: DatagramSink;

    /// Flash holding the credential record and the sector offset within it.
    fn credential_flash(&mut self) -> Result<(Self::Flash, u32), Self::Error>;

    /// Starts the Wi-Fi station, IP stack and event tasks. The tasks set `ready`
    /// whenever the station acquires an IPv4 address.
    async fn start_network(
        &mut self,
        ready: &'static NetworkReady,
    ) -> Result<NetworkParts<Self::Station, Self::Provisioning>, Self::Error>;

    async fn open_socket(&mut self) -> Result<Self::Sink, Self::Error>;

    /// The RDY pin must come up at the released level for `rdy_polarity`.
    fn open_spi_slave(
        &mut self,
        pins: &PinMap,
        rdy_polarity: Polarity,
    ) -> Result<(Self::Link, Self::Ready), Self::Error>;
}

pub struct Bootstrap {
    config: BridgeConfig,
    ready: &'static NetworkReady,
    sequence: BootSequence,
}

impl Bootstrap {
    pub fn new(config: BridgeConfig, ready: &'static NetworkReady) -> Self {
        Self {
            config,
            ready,
            sequence: BootSequence::new(),
        }
    }

    /// Runs every stage and then forwards forever. Returns only on a fatal error.
    pub async fn run<P: Platform>(mut self, mut platform: P) -> Result<Infallible, BootError> {
        info!("Boot stage {:?}", self.sequence.stage());
        let (flash, offset) = platform
            .credential_flash()
            .map_err(self.fatal(Fault::Platform))?;
        let mut store = CredentialStore::new(flash, offset);
        if let Err(e) = store.init() {
            if !e.is_recoverable() {
                return Err(self.fatal(Fault::CredentialStore)(e));
            }
            info!("Credential store unusable ({}), erasing", e);
            store.erase().map_err(self.fatal(Fault::CredentialStore))?;
            store.init().map_err(self.fatal(Fault::CredentialStore))?;
        }

        self.sequence.advance(BootStage::NetInit)?;
        let NetworkParts {
            mut station,
            provisioning,
            mac,
        } = platform
            .start_network(self.ready)
            .await
            .map_err(self.fatal(Fault::Platform))?;
        let mut commissioning = Commissioning::new(
            provisioning,
            self.config.commission_security,
            self.config.commission_pop,
            self.config.service_name_prefix,
        );

        self.sequence.advance(BootStage::CommissionDecide)?;
        if !commissioning.is_provisioned(&store) {
            self.sequence.advance(BootStage::CommissionActive)?;
        }
        let completion = commissioning
            .run_if_needed(&mut store, &mut station, &mac, self.ready)
            .await
            .map_err(self.fatal(Fault::Commissioning))?;
        info!("Commissioning decision: {:?}", completion);

        self.sequence.advance(BootStage::AwaitIp)?;
        self.ready.wait().await;
        info!("Network ready, starting UDP + SPI forwarding");

        self.sequence.advance(BootStage::RuntimeInit)?;
        commissioning.teardown();
        let sink = platform
            .open_socket()
            .await
            .map_err(self.fatal(Fault::Platform))?;
        let (link, pin) = platform
            .open_spi_slave(&self.config.pins, self.config.rdy_polarity)
            .map_err(self.fatal(Fault::Platform))?;
        let ready_line =
            ReadyLine::new(pin, self.config.rdy_polarity).map_err(self.fatal(Fault::ReadyLine))?;
        let mut bridge = Bridge::new(
            FramedReceiver::new(link, ready_line, self.config.payload_max),
            UdpForwarder::new(sink, self.config.destination),
        );
        info!(
            "UDP target {}, SPI slave pins {:?}",
            self.config.destination, self.config.pins
        );

        self.sequence.advance(BootStage::Forwarding)?;
        let e = match bridge.run().await {
            Ok(never) => match never {},
            Err(e) => e,
        };
        let fault = match e {
            crate::receiver::ReceiveError::Spi(_) => Fault::SpiLink,
            crate::receiver::ReceiveError::ReadyLine => Fault::ReadyLine,
        };
        Err(self.fatal(fault)(e))
    }

    /// Builds an error mapper that logs the cause against the current stage.
    fn fatal<E: fmt::Debug>(&self, fault: Fault) -> impl FnOnce(E) -> BootError + use<E> {
        let stage = self.sequence.stage();
        move |e| {
            error!("Fatal {:?} error during {:?}: {:?}", fault, stage, e);
            BootError { stage, fault }
        }
    }
}
