//! BlueZ implementations of the controller and policy collaborators.
//!
//! BlueZ connects and disconnects profiles by service UUID and answers
//! asynchronously, so every request is accepted once the device object
//! exists and the outcome is reported later as a [`StackEvent`].

use std::{collections::HashSet, sync::Arc};

use bluer::{Adapter, Address, Device};
use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{
   config::Config,
   profile::{
      PeerIdentity, Profile,
      interface::{ConnectionPolicy, NativeInterface, RawConnectionState, StackEvent},
      service::ProfileService,
   },
};

/// Raw state BlueZ reaches once a profile connection completes.
pub const fn established(profile: Profile) -> RawConnectionState {
   if profile.has_service_level_stage() {
      RawConnectionState::SlcConnected
   } else {
      RawConnectionState::Connected
   }
}

/// Outbound requests for one profile, carried out over D-Bus.
pub struct BluezInterface {
   profile: Profile,
   adapter: Adapter,
   events: mpsc::UnboundedSender<StackEvent>,
}

impl BluezInterface {
   pub fn new(profile: Profile, adapter: Adapter) -> (Arc<Self>, mpsc::UnboundedReceiver<StackEvent>) {
      let (events, rx) = mpsc::unbounded_channel();
      (
         Arc::new(Self {
            profile,
            adapter,
            events,
         }),
         rx,
      )
   }

   fn device(&self, peer: PeerIdentity) -> Option<Device> {
      match self.adapter.device(peer) {
         Ok(device) => Some(device),
         Err(e) => {
            warn!("{}: no device object for {peer}: {e}", self.profile);
            None
         },
      }
   }

   fn spawn_request(&self, peer: PeerIdentity, connect: bool) -> bool {
      let Some(device) = self.device(peer) else {
         return false;
      };
      let profile = self.profile;
      let uuid = profile.uuid();
      let events = self.events.clone();

      tokio::spawn(async move {
         let state = if connect {
            match device.connect_profile(&uuid).await {
               Ok(()) => established(profile),
               Err(e) => {
                  warn!("{profile}: connecting {peer} failed: {e}");
                  RawConnectionState::Disconnected
               },
            }
         } else {
            if let Err(e) = device.disconnect_profile(&uuid).await {
               warn!("{profile}: disconnecting {peer} failed: {e}");
            }
            RawConnectionState::Disconnected
         };
         if events
            .send(StackEvent::ConnectionStateChanged { peer, state })
            .is_err()
         {
            debug!("{profile}: event pump gone, dropping result for {peer}");
         }
      });
      true
   }
}

impl NativeInterface for BluezInterface {
   fn connect(&self, peer: PeerIdentity) -> bool {
      debug!("{}: connect_profile {peer}", self.profile);
      self.spawn_request(peer, true)
   }

   fn disconnect(&self, peer: PeerIdentity) -> bool {
      debug!("{}: disconnect_profile {peer}", self.profile);
      self.spawn_request(peer, false)
   }

   fn connect_audio(&self, peer: PeerIdentity) -> bool {
      debug!("{}: audio channel of {peer} is not controllable", self.profile);
      false
   }

   fn disconnect_audio(&self, peer: PeerIdentity) -> bool {
      debug!("{}: audio channel of {peer} is not controllable", self.profile);
      false
   }

   fn set_active_device(&self, peer: Option<PeerIdentity>) -> bool {
      // Routing itself belongs to the audio server.
      info!("{}: routing to {peer:?}", self.profile);
      true
   }
}

/// Connection policy backed by the config and the adapter's paired devices.
pub struct BluezPolicy {
   config: Config,
   bonded: RwLock<HashSet<Address>>,
}

impl BluezPolicy {
   pub fn new(config: Config) -> Arc<Self> {
      Arc::new(Self {
         config,
         bonded: RwLock::new(HashSet::new()),
      })
   }

   pub fn set_bonded(&self, peer: Address, bonded: bool) {
      let mut set = self.bonded.write();
      if bonded {
         set.insert(peer);
      } else {
         set.remove(&peer);
      }
   }

   pub fn replace_bonded(&self, peers: impl IntoIterator<Item = Address>) {
      *self.bonded.write() = peers.into_iter().collect();
   }
}

impl ConnectionPolicy for BluezPolicy {
   fn ok_to_connect(&self, profile: Profile, peer: PeerIdentity) -> bool {
      if self.config.quiet_mode {
         debug!("{profile}: quiet mode, refusing {peer}");
         return false;
      }
      if self.config.is_blocked(profile, peer) {
         debug!("{profile}: {peer} is blocked");
         return false;
      }
      if !self.is_bonded(peer) {
         debug!("{profile}: {peer} is not bonded");
         return false;
      }
      true
   }

   fn is_bonded(&self, peer: PeerIdentity) -> bool {
      self.bonded.read().contains(&peer)
   }
}

/// Hands an observed link change to `service`.
///
/// Request results and the device watchers can both report one teardown.
/// The service drops the repeat once the record is gone.
pub async fn deliver(service: &ProfileService, event: StackEvent) {
   let peer = event.peer();
   if let Err(e) = service.backend_event(event).await {
      warn!("{}: failed to deliver event for {peer}: {e}", service.profile());
   }
}

/// Forwards request outcomes reported by a [`BluezInterface`].
pub async fn pump(mut events: mpsc::UnboundedReceiver<StackEvent>, service: ProfileService) {
   while let Some(event) = events.recv().await {
      deliver(&service, event).await;
   }
   debug!("{}: event pump finished", service.profile());
}
