//! Per-profile connection tracking.
//!
//! Each profile runs its own service with a registry of per-device state
//! machines. This module holds the vocabulary shared by all of them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod interface;
pub mod registry;
pub mod service;
pub mod state_machine;

/// Identity of a remote device. Stable for the whole session.
pub type PeerIdentity = bluer::Address;

/// Profiles managed by the service.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   PartialOrd,
   Ord,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::EnumIter,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Profile {
   /// Advanced audio distribution, local role is source.
   A2dp,
   /// Hands-free audio gateway.
   Headset,
   /// Audio streaming for hearing aids.
   HearingAid,
   /// Human interface device host.
   HidHost,
}

impl Profile {
   /// Whether the profile carries a separately negotiated audio channel.
   pub const fn has_audio_channel(self) -> bool {
      matches!(self, Self::A2dp | Self::Headset)
   }

   /// Whether "connected" from the controller only means the transport is
   /// up, with a later service-level connection completing the link.
   pub const fn has_service_level_stage(self) -> bool {
      matches!(self, Self::Headset)
   }

   /// Remote service class the profile connects to.
   pub const fn uuid(self) -> Uuid {
      match self {
         Self::A2dp => Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb), // Audio sink
         Self::Headset => Uuid::from_u128(0x0000111e_0000_1000_8000_00805f9b34fb), // Hands-free
         Self::HearingAid => Uuid::from_u128(0x0000fdf0_0000_1000_8000_00805f9b34fb), // ASHA
         Self::HidHost => Uuid::from_u128(0x00001124_0000_1000_8000_00805f9b34fb), // HID
      }
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Connection progress of one device on one profile.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionPhase {
   #[default]
   Disconnected,
   Connecting,
   Disconnecting,
   Connected,
}

/// Audio channel progress; only leaves `Idle` while connected.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AudioPhase {
   #[default]
   Idle,
   AudioConnecting,
   AudioOn,
   AudioDisconnecting,
}
