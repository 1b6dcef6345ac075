//! Hardware-independent core of the SPI-to-UDP chunk bridge.
//!
//! The SPI master sends `[10-byte header][payload]` per chunk; the bridge re-emits
//! every chunk verbatim as one UDP datagram. Peripherals are reached through the
//! traits in [`receiver`], [`forwarder`], [`commission`] and [`bootstrap`].

#![cfg_attr(not(test), no_std)]

pub mod bootstrap;
pub mod bridge;
pub mod chunk;
pub mod commission;
pub mod config;
pub mod credentials;
pub mod forwarder;
pub mod network;
pub mod ready;
pub mod receiver;
/// Companion-app exchange behind the BLE commissioning service.
pub mod session;
