//! Bounded map from peer to connection record for one profile.

use std::collections::HashMap;

use log::{debug, error, info};

use crate::{
   error::{LinkError, Result},
   profile::{PeerIdentity, Profile, state_machine::StateMachine},
};

#[derive(Debug)]
pub struct ConnectionRegistry {
   profile: Profile,
   capacity: usize,
   machines: HashMap<PeerIdentity, StateMachine>,
}

impl ConnectionRegistry {
   pub fn new(profile: Profile, capacity: usize) -> Self {
      Self {
         profile,
         capacity,
         machines: HashMap::with_capacity(capacity),
      }
   }

   pub const fn capacity(&self) -> usize {
      self.capacity
   }

   pub fn len(&self) -> usize {
      self.machines.len()
   }

   pub fn is_empty(&self) -> bool {
      self.machines.is_empty()
   }

   pub fn get(&self, peer: &PeerIdentity) -> Option<&StateMachine> {
      self.machines.get(peer)
   }

   pub fn get_mut(&mut self, peer: &PeerIdentity) -> Option<&mut StateMachine> {
      self.machines.get_mut(peer)
   }

   /// Returns the record for `peer`, creating it if room is left.
   pub fn get_or_create(&mut self, peer: PeerIdentity) -> Result<&mut StateMachine> {
      if !self.machines.contains_key(&peer) && self.machines.len() >= self.capacity {
         error!(
            "{}: cannot track {peer}, limit of {} reached",
            self.profile, self.capacity
         );
         return Err(LinkError::CapacityExceeded {
            profile: self.profile,
            limit: self.capacity,
         });
      }
      let profile = self.profile;
      Ok(self
         .machines
         .entry(peer)
         .or_insert_with(|| StateMachine::new(peer, profile)))
   }

   /// Removes the record of an idle peer.
   pub fn destroy(&mut self, peer: &PeerIdentity) -> Result<StateMachine> {
      let Some(machine) = self.machines.get(peer) else {
         return Err(LinkError::UnknownDevice(*peer));
      };
      if !machine.state().is_idle() {
         error!(
            "{}: refusing to release {peer} in {}/{}",
            self.profile,
            machine.connection_phase(),
            machine.audio_phase()
         );
         return Err(LinkError::RecordBusy(*peer));
      }
      debug!("{}: released record for {peer}", self.profile);
      self
         .machines
         .remove(peer)
         .ok_or(LinkError::UnknownDevice(*peer))
   }

   /// Handles loss of the bond: releases an idle record now, otherwise marks
   /// it for release once it becomes idle. Returns true if released.
   pub fn bond_removed(&mut self, peer: &PeerIdentity) -> bool {
      let Some(machine) = self.machines.get_mut(peer) else {
         return false;
      };
      if machine.state().is_idle() {
         self.machines.remove(peer);
         info!("{}: bond removed, released {peer}", self.profile);
         true
      } else {
         machine.mark_release_pending();
         info!(
            "{}: bond removed for {peer}, releasing once disconnected",
            self.profile
         );
         false
      }
   }

   /// Drops every record regardless of state.
   pub fn drain(&mut self) -> impl Iterator<Item = StateMachine> + '_ {
      self.machines.drain().map(|(_, machine)| machine)
   }

   pub fn iter(&self) -> impl Iterator<Item = &StateMachine> {
      self.machines.values()
   }

   pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StateMachine> {
      self.machines.values_mut()
   }
}
