//! Error types for the link service.
//!
//! This module defines the errors surfaced to callers of the profile
//! services and the active device manager, plus the BlueZ, I/O and
//! configuration failures of the daemon itself.

use bluer::Address;
use thiserror::Error;

use crate::profile::Profile;

/// Why a local request was refused without a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
   /// `okToConnect` refused the peer (quiet mode, blocked, not bonded).
   Policy,
   /// The controller refused the outbound request immediately.
   Controller,
   /// The request needs an established link.
   NotConnected,
   /// The profile does not carry the requested channel.
   Unsupported,
   /// The profile's connected audio device limit is reached.
   AudioLimit,
}

/// Main error type for the link service.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid address: {0}")]
   InvalidAddress(String),

   #[error("Request for {peer} rejected: {reason}")]
   Rejected { peer: Address, reason: RejectReason },

   #[error("{profile}: tracking limit of {limit} devices reached")]
   CapacityExceeded { profile: Profile, limit: usize },

   #[error("Device not tracked: {0}")]
   UnknownDevice(Address),

   #[error("Device not connected: {0}")]
   NotConnected(Address),

   #[error("Device record still in use: {0}")]
   RecordBusy(Address),

   #[error("Profile service has been shut down")]
   ServiceShutdown,

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Profile not enabled: {0}")]
   ProfileUnavailable(Profile),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl LinkError {
   pub const fn rejected(peer: Address, reason: RejectReason) -> Self {
      Self::Rejected { peer, reason }
   }

   /// True for the synchronous refusal categories (policy and capacity).
   pub const fn is_rejection(&self) -> bool {
      matches!(self, Self::Rejected { .. } | Self::CapacityExceeded { .. })
   }
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;
