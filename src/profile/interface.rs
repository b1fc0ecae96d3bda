//! Boundary to the controller and to the policy collaborators.
//!
//! Hardware callbacks arrive as [`StackEvent`]s carrying the raw state
//! vocabulary of the controller; outbound requests go through
//! [`NativeInterface`], which answers synchronously and confirms later
//! through the event stream.

use std::sync::Arc;

use crate::profile::{PeerIdentity, Profile};

/// Raw link state reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RawConnectionState {
   Disconnected,
   Connecting,
   /// Transport is up. Final for most profiles, intermediate for those with a
   /// service-level stage.
   Connected,
   /// Service-level connection negotiated.
   SlcConnected,
   Disconnecting,
}

/// Raw audio channel state reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RawAudioState {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

/// Hardware callback for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
   ConnectionStateChanged { peer: PeerIdentity, state: RawConnectionState },
   AudioStateChanged { peer: PeerIdentity, state: RawAudioState },
}

impl StackEvent {
   pub const fn peer(&self) -> PeerIdentity {
      match *self {
         Self::ConnectionStateChanged { peer, .. } | Self::AudioStateChanged { peer, .. } => peer,
      }
   }

   /// Events allowed to create a record for a peer nobody tracks yet.
   pub const fn may_create_record(&self) -> bool {
      matches!(
         self,
         Self::ConnectionStateChanged {
            state: RawConnectionState::Connecting
               | RawConnectionState::Connected
               | RawConnectionState::SlcConnected,
            ..
         }
      )
   }
}

/// Who reported a [`StackEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventSource {
   /// The controller itself. A teardown for an untracked peer means the
   /// registry lost track of a link.
   Controller,
   /// A backend observer, which may report one teardown more than once.
   Backend,
}

/// Link signal after the profile's raw vocabulary has been interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LinkSignal {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

impl LinkSignal {
   /// Maps a raw state onto the link signal for `profile`.
   pub const fn from_raw(profile: Profile, raw: RawConnectionState) -> Self {
      match raw {
         RawConnectionState::Disconnected => Self::Disconnected,
         RawConnectionState::Connecting => Self::Connecting,
         RawConnectionState::Connected if profile.has_service_level_stage() => Self::Connecting,
         RawConnectionState::Connected | RawConnectionState::SlcConnected => Self::Connected,
         RawConnectionState::Disconnecting => Self::Disconnecting,
      }
   }
}

/// Outbound command primitives towards the controller.
///
/// Every call returns whether the controller accepted the request; the
/// outcome is confirmed later by a [`StackEvent`].
pub trait NativeInterface: Send + Sync {
   fn connect(&self, peer: PeerIdentity) -> bool;
   fn disconnect(&self, peer: PeerIdentity) -> bool;
   fn connect_audio(&self, peer: PeerIdentity) -> bool;
   fn disconnect_audio(&self, peer: PeerIdentity) -> bool;
   /// Routes the profile's data to `peer`, or to nobody.
   fn set_active_device(&self, peer: Option<PeerIdentity>) -> bool;
}

/// Policy gate consulted before any connection is allowed.
pub trait ConnectionPolicy: Send + Sync {
   fn ok_to_connect(&self, profile: Profile, peer: PeerIdentity) -> bool;
   fn is_bonded(&self, peer: PeerIdentity) -> bool;
}

pub type NativeHandle = Arc<dyn NativeInterface>;
pub type PolicyHandle = Arc<dyn ConnectionPolicy>;
