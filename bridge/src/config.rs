//! Build-time configuration.
//!
//! Values come from `option_env!` (set in the firmware's `.cargo/config.toml`) and are
//! read once at bootstrap. A malformed value logs a warning and falls back to its
//! default; only an unusable pin map or commissioning identity is fatal.

use core::fmt;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::str::FromStr;

use log::{info, warn};

use crate::chunk::PAYLOAD_MAX;
use crate::ready::Polarity;

pub const DEFAULT_UDP_HOST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
pub const DEFAULT_UDP_HOST_PORT: u16 = 5006;
pub const DEFAULT_POP: &str = "abcd1234";
pub const DEFAULT_SERVICE_NAME_PREFIX: &str = "LV-JPEG";

/// Highest GPIO number on the ESP32-C3.
pub const GPIO_MAX: u8 = 21;

/// GPIO12..=17 drive the SPI flash, GPIO18/19 are the USB serial/JTAG port the
/// logger writes to.
pub const RESERVED_GPIOS: core::ops::RangeInclusive<u8> = 12..=19;

/// `<prefix>-XXYYZZ` must fit in a legacy advertising packet next to the flags.
pub const SERVICE_NAME_PREFIX_MAX: usize = 19;

/// Security tier for BLE commissioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityTier {
    /// No proof of possession.
    Sec0,
    /// The companion must present the proof of possession first.
    #[default]
    Sec1,
}

/// GPIO numbers of the SPI slave and the RDY line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinMap {
    pub sclk: u8,
    pub miso: u8,
    pub mosi: u8,
    pub cs: u8,
    pub rdy: u8,
}

impl Default for PinMap {
    // ESP32-C3 Super Mini wiring.
    fn default() -> Self {
        Self {
            sclk: 4,
            miso: 5,
            mosi: 6,
            cs: 7,
            rdy: 10,
        }
    }
}

impl PinMap {
    pub fn as_array(&self) -> [u8; 5] {
        [self.sclk, self.miso, self.mosi, self.cs, self.rdy]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pins = self.as_array();
        if let Some(&pin) = pins.iter().find(|&&pin| pin > GPIO_MAX) {
            return Err(ConfigError::PinOutOfRange(pin));
        }
        if let Some(&pin) = pins.iter().find(|&&pin| RESERVED_GPIOS.contains(&pin)) {
            return Err(ConfigError::ReservedPin(pin));
        }
        for (i, pin) in pins.iter().enumerate() {
            if pins[i + 1..].contains(pin) {
                return Err(ConfigError::PinConflict(*pin));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    PinOutOfRange(u8),
    ReservedPin(u8),
    PinConflict(u8),
    EmptyProofOfPossession,
    ServiceNamePrefixTooLong,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::PinOutOfRange(pin) => {
                write!(f, "GPIO{} does not exist (max GPIO{})", pin, GPIO_MAX)
            }
            ConfigError::ReservedPin(pin) => {
                write!(f, "GPIO{} is reserved for flash or USB serial/JTAG", pin)
            }
            ConfigError::PinConflict(pin) => write!(f, "GPIO{} assigned twice", pin),
            ConfigError::EmptyProofOfPossession => {
                f.write_str("security tier 1 needs a proof of possession")
            }
            ConfigError::ServiceNamePrefixTooLong => write!(
                f,
                "service name prefix longer than {} bytes",
                SERVICE_NAME_PREFIX_MAX
            ),
        }
    }
}

/// Raw, unparsed configuration strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildEnv {
    pub udp_host_ip: Option<&'static str>,
    pub udp_host_port: Option<&'static str>,
    pub payload_max: Option<&'static str>,
    pub pin_sclk: Option<&'static str>,
    pub pin_miso: Option<&'static str>,
    pub pin_mosi: Option<&'static str>,
    pub pin_cs: Option<&'static str>,
    pub pin_rdy: Option<&'static str>,
    pub rdy_polarity: Option<&'static str>,
    pub commission_pop: Option<&'static str>,
    pub commission_security: Option<&'static str>,
    pub service_name_prefix: Option<&'static str>,
}

impl BuildEnv {
    /// Captures the `BRIDGE_*` variables present when this crate was compiled.
    pub const fn capture() -> Self {
        Self {
            udp_host_ip: option_env!("BRIDGE_UDP_HOST_IP"),
            udp_host_port: option_env!("BRIDGE_UDP_HOST_PORT"),
            payload_max: option_env!("BRIDGE_PAYLOAD_MAX"),
            pin_sclk: option_env!("BRIDGE_PIN_SCLK"),
            pin_miso: option_env!("BRIDGE_PIN_MISO"),
            pin_mosi: option_env!("BRIDGE_PIN_MOSI"),
            pin_cs: option_env!("BRIDGE_PIN_CS"),
            pin_rdy: option_env!("BRIDGE_PIN_RDY"),
            rdy_polarity: option_env!("BRIDGE_RDY_POLARITY"),
            commission_pop: option_env!("BRIDGE_COMMISSION_POP"),
            commission_security: option_env!("BRIDGE_COMMISSION_SECURITY"),
            service_name_prefix: option_env!("BRIDGE_SERVICE_NAME_PREFIX"),
        }
    }
}

/// Everything the bridge needs to know, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    pub destination: SocketAddrV4,
    pub payload_max: usize,
    pub pins: PinMap,
    pub rdy_polarity: Polarity,
    pub commission_pop: &'static str,
    pub commission_security: SecurityTier,
    pub service_name_prefix: &'static str,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            destination: SocketAddrV4::new(DEFAULT_UDP_HOST_IP, DEFAULT_UDP_HOST_PORT),
            payload_max: PAYLOAD_MAX,
            pins: PinMap::default(),
            rdy_polarity: Polarity::ActiveHigh,
            commission_pop: DEFAULT_POP,
            commission_security: SecurityTier::Sec1,
            service_name_prefix: DEFAULT_SERVICE_NAME_PREFIX,
        }
    }
}

impl BridgeConfig {
    pub fn from_build_env() -> Result<Self, ConfigError> {
        Self::from_env(&BuildEnv::capture())
    }

    pub fn from_env(env: &BuildEnv) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let default_pins = defaults.pins;

        let host = parse_or(
            "BRIDGE_UDP_HOST_IP",
            env.udp_host_ip,
            DEFAULT_UDP_HOST_IP,
            |s| Ipv4Addr::from_str(s).ok(),
        );
        let port = parse_or(
            "BRIDGE_UDP_HOST_PORT",
            env.udp_host_port,
            DEFAULT_UDP_HOST_PORT,
            |s| s.parse::<u16>().ok().filter(|&p| p != 0),
        );
        let payload_max = parse_or("BRIDGE_PAYLOAD_MAX", env.payload_max, PAYLOAD_MAX, |s| {
            s.parse::<usize>()
                .ok()
                .filter(|v| (1..=PAYLOAD_MAX).contains(v))
        });
        let pins = PinMap {
            sclk: parse_or("BRIDGE_PIN_SCLK", env.pin_sclk, default_pins.sclk, parse_pin),
            miso: parse_or("BRIDGE_PIN_MISO", env.pin_miso, default_pins.miso, parse_pin),
            mosi: parse_or("BRIDGE_PIN_MOSI", env.pin_mosi, default_pins.mosi, parse_pin),
            cs: parse_or("BRIDGE_PIN_CS", env.pin_cs, default_pins.cs, parse_pin),
            rdy: parse_or("BRIDGE_PIN_RDY", env.pin_rdy, default_pins.rdy, parse_pin),
        };
        pins.validate()?;

        let rdy_polarity = parse_or(
            "BRIDGE_RDY_POLARITY",
            env.rdy_polarity,
            Polarity::ActiveHigh,
            |s| match s {
                "high" | "HIGH" | "1" => Some(Polarity::ActiveHigh),
                "low" | "LOW" | "0" => Some(Polarity::ActiveLow),
                _ => None,
            },
        );
        let commission_security = parse_or(
            "BRIDGE_COMMISSION_SECURITY",
            env.commission_security,
            SecurityTier::Sec1,
            |s| match s {
                "0" => Some(SecurityTier::Sec0),
                "1" => Some(SecurityTier::Sec1),
                "2" => {
                    warn!("Security tier 2 (SRP6a) is not supported, using tier 1");
                    Some(SecurityTier::Sec1)
                }
                _ => None,
            },
        );

        let commission_pop = env.commission_pop.unwrap_or(DEFAULT_POP);
        if commission_security == SecurityTier::Sec1 && commission_pop.is_empty() {
            return Err(ConfigError::EmptyProofOfPossession);
        }
        let service_name_prefix = env
            .service_name_prefix
            .unwrap_or(DEFAULT_SERVICE_NAME_PREFIX);
        if service_name_prefix.len() > SERVICE_NAME_PREFIX_MAX {
            return Err(ConfigError::ServiceNamePrefixTooLong);
        }

        let config = Self {
            destination: SocketAddrV4::new(host, port),
            payload_max,
            pins,
            rdy_polarity,
            commission_pop,
            commission_security,
            service_name_prefix,
        };
        info!(
            "Config: udp target {}, payload_max {}, pins {:?}, rdy {:?}, security {:?}",
            config.destination, config.payload_max, config.pins, config.rdy_polarity,
            config.commission_security
        );
        Ok(config)
    }
}

fn parse_pin(s: &str) -> Option<u8> {
    s.parse::<u8>().ok()
}

fn parse_or<T: fmt::Debug + Copy>(
    name: &str,
    raw: Option<&str>,
    default: T,
    parse: impl FnOnce(&str) -> Option<T>,
) -> T {
    match raw {
        None => default,
        Some(raw) => match parse(raw.trim()) {
            Some(value) => value,
            None => {
                warn!(
                    "Invalid {} value '{}', using default {:?}",
                    name, raw, default
                );
                default
            }
        },
    }
}
