#![no_std]

extern crate alloc;

/// BLE commissioning GATT service.
pub mod ble;
pub mod platform;
pub mod spi;
pub mod udp;
pub mod wifi;
