//! Chunked Bluetooth Low Energy transport for peerwire
//!
//! BLE writes are limited to a few dozen bytes, so each envelope is carved
//! into chunks no larger than the smallest write limit among its
//! destinations, followed by a fixed EOM sentinel write. The receiving side
//! reassembles per source device until it sees the sentinel.
//!
//! ## Architecture
//!
//! - [`config`] - Transport configuration and settings
//! - [`error`] - Errors raised by the btleplug central
//! - [`protocol`] - Service/characteristic UUIDs and device naming
//! - [`link`] - The [`BleLink`] boundary and inbound [`LinkEvent`]s
//! - [`peer`] - State of one attached link
//! - [`manager`] - Peer table, reassembly and transfer workers
//! - [`loopback`] - In-memory link pair
//! - [`central`] - btleplug scanning, connecting and writing
//!
//! ## Usage
//!
//! ```rust,no_run
//! use peerwire_ble::{BleCentral, BleConfig, BleManager};
//! use peerwire_core::events::server_event_channel;
//!
//! # async fn example() -> peerwire_core::Result<()> {
//! let (events, _rx) = server_event_channel();
//! let config = BleConfig::new().with_device_name_prefix("peerwire-");
//! let manager = BleManager::new(config.clone(), events)?;
//! manager.start()?;
//!
//! let central = BleCentral::new(config, manager.link_sender()).await?;
//! for device in central.scan().await? {
//!     let link = central.connect(&device).await?;
//!     manager
//!         .connect(link, device.logical_name.as_deref(), "laptop")
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod central;
pub mod config;
pub mod error;
pub mod link;
pub mod loopback;
pub mod manager;
pub mod peer;
pub mod protocol;

// Public API exports
pub use central::{BleCentral, BtleplugLink, DiscoveredDevice};
pub use config::{BleConfig, DEFAULT_BLE_MAX_MESSAGE_SIZE, DEFAULT_CHUNK_SIZE};
pub use error::BleError;
pub use link::{BleLink, LinkEvent, LinkEventReceiver, LinkEventSender};
pub use loopback::{CreditMode, LoopbackEnd, LoopbackLink};
pub use manager::BleManager;
pub use peer::BlePeer;
pub use protocol::{
    device_name, logical_name_from_device, DEFAULT_DEVICE_NAME_PREFIX,
    PEERWIRE_RX_CHARACTERISTIC_UUID, PEERWIRE_SERVICE_UUID, PEERWIRE_TX_CHARACTERISTIC_UUID,
};
