#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Cradle LED 💡
//!
//! A Rust library for controlling Cradle smart LED lights via Bluetooth Low Energy.
//!
//! A Cradle light exposes one GATT service with six characteristics: LED on/off,
//! color, brightness, PIR motion sensing, the device clock and an on/off timer.
//! Every value is a short fixed-layout byte payload.
//!
//! The library has two halves:
//!
//! - [`PeripheralScanner`] discovers lights on a scan/rest duty cycle and
//!   reports every address once per session.
//! - [`CradleLedClient`] holds a single link, walks it through
//!   `Unknown → Connected → Ready`, and runs reads and writes one at a time.
//!
//! Both talk to the radio through small traits ([`GattTransport`],
//! [`ScanRadio`]). The `btleplug` feature (on by default) provides
//! implementations for desktop stacks; [`mock`] provides scriptable ones for tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cradle_led::{ble, ClientConfig, ScanConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = ble::first_adapter().await?;
//!
//!     // Find a light
//!     let scanner = ble::scanner(adapter.clone(), ScanConfig::default());
//!     let mut discovered = scanner.discovered();
//!     scanner.start_scan_default().await?;
//!     let light = discovered.recv().await?;
//!     scanner.stop_scan().await?;
//!
//!     // Connect and wait for service discovery
//!     let client = ble::client(adapter, ClientConfig::default()).await?;
//!     client.connect(&light.address).await?;
//!     client.connection_state().wait_for(|s| s.is_ready()).await?;
//!
//!     // Warm white at 50%
//!     client.set_led_color(255, 180, 100).await?;
//!     client.set_led_brightness_percent(50).await?;
//!
//!     Ok(())
//! }
//! ```

/// btleplug radio backends
#[cfg(feature = "btleplug")]
pub mod ble;
/// GATT layout of the Cradle service
pub mod catalog;
/// Connection state machine and operation queue
pub mod client;
/// Error types and handling
pub mod error;
/// In-memory radio backends for tests
pub mod mock;
/// Characteristic payload encoding and decoding
pub mod protocol;
/// Duty-cycled peripheral discovery
pub mod scanner;
/// Radio capability traits and their events
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use catalog::{Characteristic, ServiceLayout};
pub use client::CradleLedClient;
pub use error::{CradleError, Result};
pub use protocol::{Command, DeviceEvent};
pub use scanner::PeripheralScanner;
pub use transport::{
    AlwaysGranted, GattTransport, LinkId, PermissionCheck, RadioEvent, ScanRadio, TransportEvent,
};
pub use types::{
    AdvertisementData, ClientConfig, ConnectionState, CurrentTime, DeviceSnapshot,
    DiscoveredPeripheral, LedBrightness, LedColor, LedSwitch, PirSwitch, ScanConfig, ScanState,
    Switch, TimerSchedule,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cradle Smart Light Service UUID
///
/// Advertised by every Cradle light; the scanner filters on it.
pub const CRADLE_SERVICE_UUID: &str = "c9ea4800-ad9e-4d67-b570-69352fdc1078";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_uuid_matches_catalog() {
        let parsed = uuid::Uuid::parse_str(CRADLE_SERVICE_UUID).unwrap();
        assert_eq!(parsed, ServiceLayout::cradle().uuid());
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
