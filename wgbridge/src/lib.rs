//! wgbridge - userspace WireGuard and AmneziaWG interfaces
//!
//! A worker process owns one virtual interface and serves the cross-platform
//! configuration protocol on a Unix control socket until it is told to stop.
//!
//! # Features
//!
//! - Background worker launch with per-interface log files
//! - Ordered device bring-up and teardown around the control socket
//! - WireGuard data plane via boringtun (handshakes, keepalives, AllowedIPs)
//! - Worker discovery through process environment tags
//!
//! # Example
//!
//! ```no_run
//! use wgbridge::config::{DeviceConfig, Flavor};
//! use wgbridge::device::DeviceController;
//! use wgbridge::platform::{LinuxTunProvider, UnixControlSockets};
//! use wgbridge::tunnel::TunnelFactory;
//!
//! # async fn run() -> wgbridge::Result<()> {
//! let mut config = DeviceConfig::new("wg0", Flavor::Wg);
//! let controller =
//!     DeviceController::new(LinuxTunProvider, UnixControlSockets::default(), TunnelFactory);
//! controller.start(&mut config).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod platform;
pub mod runtime;
pub mod tunnel;

pub use error::{Result, WgError};
