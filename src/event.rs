//! Event handling for link state updates.
//!
//! Profile services publish a [`Notification`] for every connection, audio
//! and active-device transition. Listeners implement [`EventBus`] and are
//! attached to a [`Broadcaster`], which fans each notification out in the
//! order it was emitted.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use serde_json::json;

use crate::profile::{AudioPhase, ConnectionPhase, PeerIdentity, Profile};

/// Who decided an active device change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ActiveOrigin {
   /// Selection made by the active device manager.
   Policy,
   /// Override from an application or the native layer.
   Explicit,
   /// The previous holder left the connected state.
   Disconnection,
}

/// Events emitted by the profile services and the adapter monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
   ConnectionStateChanged {
      profile: Profile,
      peer: PeerIdentity,
      previous: ConnectionPhase,
      new: ConnectionPhase,
   },
   AudioStateChanged {
      profile: Profile,
      peer: PeerIdentity,
      previous: AudioPhase,
      new: AudioPhase,
   },
   ActiveDeviceChanged {
      profile: Profile,
      previous: Option<PeerIdentity>,
      new: Option<PeerIdentity>,
      origin: ActiveOrigin,
   },
   AdapterStateChanged {
      powered: bool,
   },
}

impl Notification {
   pub const fn profile(&self) -> Option<Profile> {
      match *self {
         Self::ConnectionStateChanged { profile, .. }
         | Self::AudioStateChanged { profile, .. }
         | Self::ActiveDeviceChanged { profile, .. } => Some(profile),
         Self::AdapterStateChanged { .. } => None,
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      let addr = |peer: Option<PeerIdentity>| peer.map(|p| p.to_string());
      match *self {
         Self::ConnectionStateChanged {
            profile,
            peer,
            previous,
            new,
         } => json!({
            "event": "connection_state_changed",
            "profile": profile.to_str(),
            "address": peer.to_string(),
            "previous": previous,
            "new": new,
         }),
         Self::AudioStateChanged {
            profile,
            peer,
            previous,
            new,
         } => json!({
            "event": "audio_state_changed",
            "profile": profile.to_str(),
            "address": peer.to_string(),
            "previous": previous,
            "new": new,
         }),
         Self::ActiveDeviceChanged {
            profile,
            previous,
            new,
            origin,
         } => json!({
            "event": "active_device_changed",
            "profile": profile.to_str(),
            "previous": addr(previous),
            "new": addr(new),
            "origin": <&'static str>::from(origin),
         }),
         Self::AdapterStateChanged { powered } => json!({
            "event": "adapter_state_changed",
            "powered": powered,
         }),
      }
   }
}

impl Serialize for Notification {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      self.to_json().serialize(serializer)
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, notification: &Notification);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Fans notifications out to every registered listener.
#[derive(Default)]
pub struct Broadcaster {
   listeners: Mutex<Vec<EventSender>>,
}

impl Broadcaster {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn register(&self, listener: EventSender) {
      self.listeners.lock().push(listener);
   }

   pub fn listener_count(&self) -> usize {
      self.listeners.lock().len()
   }
}

impl EventBus for Broadcaster {
   fn emit(&self, notification: &Notification) {
      // Snapshot so a listener may register others while being called.
      let listeners = self.listeners.lock().clone();
      for listener in &listeners {
         listener.emit(notification);
      }
   }
}

/// Listener that keeps every notification, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct Recorder {
   events: Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl Recorder {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn take(&self) -> Vec<Notification> {
      std::mem::take(&mut *self.events.lock())
   }

   pub fn connection_changes(&self) -> Vec<(PeerIdentity, ConnectionPhase, ConnectionPhase)> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|n| match *n {
            Notification::ConnectionStateChanged {
               peer, previous, new, ..
            } => Some((peer, previous, new)),
            _ => None,
         })
         .collect()
   }

   pub fn active_changes(&self) -> Vec<(Profile, Option<PeerIdentity>, ActiveOrigin)> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|n| match *n {
            Notification::ActiveDeviceChanged {
               profile, new, origin, ..
            } => Some((profile, new, origin)),
            _ => None,
         })
         .collect()
   }
}

#[cfg(test)]
impl EventBus for Recorder {
   fn emit(&self, notification: &Notification) {
      self.events.lock().push(*notification);
   }
}
