//! Bluetooth profile link tracking and active device arbitration.
//!
//! Every enabled profile runs a [`profile::service::ProfileService`] that
//! keeps one state machine per peer. Their notifications feed the
//! [`active_device::ActiveDeviceManager`], which picks the device each
//! profile routes to.

pub mod active_device;
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;
pub mod profile;
