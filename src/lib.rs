#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # dircon
//!
//! A Rust client for DIRCON, the TCP-tunneled transport that connected fitness
//! machines use to expose their Bluetooth GATT services over the network.
//!
//! The library discovers a treadmill's services and characteristics, reads its
//! feature characteristics to learn which optional metrics it supports,
//! subscribes to live exercise data and decodes it into typed metrics (speed,
//! incline, distance, cadence, heart rate, stride, elapsed time). Target speed
//! and incline can be written back through the FTMS control point.
//!
//! ## Layers
//!
//! - [`protocol`]: the 6-byte header packet codec
//! - [`metrics`]: FTMS Treadmill Data / RSC Measurement decoding and
//!   capability detection
//! - [`session`]: one TCP connection, discovery and notification streaming
//! - [`supervisor`]: bounded reconnect loop
//! - [`device`]: the caller-facing handle tying everything together
//!
//! ## Quick Start
//!
//! ```no_run
//! use dircon::{probe_capabilities, DeviceConfig, DirconDevice};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Ask the device which metrics it supports
//!     let features = probe_capabilities("192.168.1.40", 36866)
//!         .await
//!         .ok_or("device did not answer")?;
//!
//!     let config = DeviceConfig::new("192.168.1.40", 36866).with_features(features);
//!     let device = DirconDevice::configure(
//!         config,
//!         |metrics| println!("{metrics:?}"),
//!         |status| println!("status: {status}"),
//!     );
//!
//!     device.start_streaming().await;
//!
//!     // Set the belt to 8 km/h
//!     device.write("speed", 8.0).await;
//!
//!     device.stop().await;
//!     Ok(())
//! }
//! ```

/// Caller-facing device handle
pub mod device;
/// Error types and handling
pub mod error;
/// Publish/subscribe listener registry
pub mod listeners;
/// Sans-IO session state machine
pub mod machine;
/// Characteristic payload decoding
pub mod metrics;
/// Packet structures and codec
pub mod protocol;
/// Protocol session over TCP
pub mod session;
/// Reconnect supervisor
pub mod supervisor;
/// Packet framing over async byte streams
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use device::{probe_capabilities, probe_capabilities_with, DirconDevice};
pub use error::{DirconError, Result};
pub use listeners::ListenerHandle;
pub use protocol::{MessageId, Packet, ResponseCode};
pub use session::{CharacteristicEvent, DirconSession};
pub use supervisor::{SessionRunner, Supervisor};
pub use types::{
    CapabilitySet, DeviceConfig, DeviceState, Feature, Metric, MetricSnapshot, RetryConfig,
    RunTargets, SessionConfig, SessionStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// TCP port DIRCON devices usually announce
pub const DEFAULT_DIRCON_PORT: u16 = 36866;

/// Bytes 4..16 of every UUID on the wire (the Bluetooth base UUID)
pub const DIRCON_UUID_SUFFIX: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

/// Fitness Machine Feature characteristic
pub const FTMS_FEATURE: u32 = 0x2ACC;

/// Treadmill Data characteristic (FTMS)
pub const FTMS_TREADMILL_DATA: u32 = 0x2ACD;

/// Training Status characteristic (FTMS)
pub const TRAINING_STATUS: u32 = 0x2AD3;

/// Fitness Machine Control Point characteristic, target of control writes
pub const FTMS_CONTROL_POINT: u32 = 0x2AD9;

/// Fitness Machine Status characteristic
pub const FITNESS_MACHINE_STATUS: u32 = 0x2ADA;

/// RSC Measurement characteristic
pub const RSC_MEASUREMENT: u32 = 0x2A53;

/// RSC Feature characteristic
pub const RSC_FEATURE: u32 = 0x2A54;
