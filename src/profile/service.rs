//! Per-profile service.
//!
//! [`ProfileCore`] holds the registry and the profile's active device behind
//! one lock and turns commands and stack events into state machine inputs.
//! Notifications are emitted before that lock is released, so listeners see
//! them in the order the state changed.
//! [`ProfileService`] is the handle to an actor that serializes every
//! mutation through one queue and owns the timeout tasks.

use std::{
   collections::{BTreeMap, HashMap},
   sync::Arc,
   time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use smallvec::SmallVec;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   active_device::ActiveDeviceControl,
   config::Config,
   error::{LinkError, RejectReason, Result},
   event::{ActiveOrigin, EventSender, Notification},
   profile::{
      AudioPhase, ConnectionPhase, PeerIdentity, Profile,
      interface::{EventSource, LinkSignal, NativeHandle, PolicyHandle, StackEvent},
      registry::ConnectionRegistry,
      state_machine::{
         Command, DeviceState, Environment, Input, Outcome, Request, StateMachine, TimerKind,
      },
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Timer work produced by the core, carried out by the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
   Arm {
      peer: PeerIdentity,
      kind: TimerKind,
      generation: u64,
      after: Duration,
   },
   Cancel {
      peer: PeerIdentity,
      kind: TimerKind,
   },
}

pub type TimerOps = SmallVec<[TimerOp; 4]>;

struct ProfileState {
   registry: ConnectionRegistry,
   active_device: Option<PeerIdentity>,
}

/// Effect executor handed to a state machine while the lock is held.
/// Notifications are buffered until the machine is done, then emitted under
/// the same lock.
struct Effects<'a> {
   core: &'a ProfileCore,
   active_device: &'a mut Option<PeerIdentity>,
   timers: &'a mut TimerOps,
   outbox: &'a mut Vec<Notification>,
   /// Whether the peer being processed fits under the audio device limit.
   audio_slot_free: bool,
}

impl Environment for Effects<'_> {
   fn ok_to_connect(&mut self, peer: PeerIdentity) -> bool {
      if !self.audio_slot_free {
         warn!(
            "{}: audio device limit of {} reached, refusing {peer}",
            self.core.profile, self.core.max_audio_devices
         );
         return false;
      }
      self.core.policy.ok_to_connect(self.core.profile, peer)
   }

   fn request(&mut self, peer: PeerIdentity, request: Request) -> bool {
      let native = &self.core.native;
      match request {
         Request::Connect => native.connect(peer),
         Request::Disconnect => native.disconnect(peer),
         Request::ConnectAudio => native.connect_audio(peer),
         Request::DisconnectAudio => native.disconnect_audio(peer),
      }
   }

   fn arm_timer(&mut self, peer: PeerIdentity, kind: TimerKind, generation: u64) {
      self.timers.push(TimerOp::Arm {
         peer,
         kind,
         generation,
         after: self.core.timeout_for(kind),
      });
   }

   fn cancel_timer(&mut self, peer: PeerIdentity, kind: TimerKind) {
      self.timers.push(TimerOp::Cancel { peer, kind });
   }

   fn connection_changed(
      &mut self,
      peer: PeerIdentity,
      previous: ConnectionPhase,
      new: ConnectionPhase,
   ) {
      let profile = self.core.profile;
      self.outbox.push(Notification::ConnectionStateChanged {
         profile,
         peer,
         previous,
         new,
      });

      if previous == ConnectionPhase::Connected && *self.active_device == Some(peer) {
         info!("{profile}: active device {peer} left connected state");
         if !self.core.native.set_active_device(None) {
            warn!("{profile}: native layer refused to clear the active device");
         }
         *self.active_device = None;
         self.outbox.push(Notification::ActiveDeviceChanged {
            profile,
            previous: Some(peer),
            new: None,
            origin: ActiveOrigin::Disconnection,
         });
      }

      if new == ConnectionPhase::Connected
         && self.core.single_audio_device()
         && *self.active_device != Some(peer)
      {
         if self.core.native.set_active_device(Some(peer)) {
            info!("{profile}: only audio device {peer} connected, making it active");
            let previous = self.active_device.replace(peer);
            self.outbox.push(Notification::ActiveDeviceChanged {
               profile,
               previous,
               new: Some(peer),
               origin: ActiveOrigin::Policy,
            });
         } else {
            warn!("{profile}: native layer refused active device {peer}");
         }
      }
   }

   fn audio_changed(&mut self, peer: PeerIdentity, previous: AudioPhase, new: AudioPhase) {
      self.outbox.push(Notification::AudioStateChanged {
         profile: self.core.profile,
         peer,
         previous,
         new,
      });
   }
}

/// Synchronous heart of a profile service.
pub struct ProfileCore {
   profile: Profile,
   connect_timeout: Duration,
   audio_timeout: Duration,
   max_audio_devices: usize,
   native: NativeHandle,
   policy: PolicyHandle,
   events: EventSender,
   state: Mutex<ProfileState>,
}

impl ProfileCore {
   pub fn new(
      profile: Profile,
      config: &Config,
      native: NativeHandle,
      policy: PolicyHandle,
      events: EventSender,
   ) -> Self {
      Self {
         profile,
         connect_timeout: config.connect_timeout(),
         audio_timeout: config.audio_timeout(),
         max_audio_devices: config.max_connected_audio_devices,
         native,
         policy,
         events,
         state: Mutex::new(ProfileState {
            registry: ConnectionRegistry::new(profile, config.max_tracked_peers),
            active_device: None,
         }),
      }
   }

   pub const fn profile(&self) -> Profile {
      self.profile
   }

   const fn timeout_for(&self, kind: TimerKind) -> Duration {
      match kind {
         TimerKind::Connection => self.connect_timeout,
         TimerKind::Audio => self.audio_timeout,
      }
   }

   const fn single_audio_device(&self) -> bool {
      self.profile.has_audio_channel() && self.max_audio_devices == 1
   }

   /// Checks whether `peer` may hold a link under the audio device limit.
   ///
   /// Peers already connecting or connected keep their slot.
   fn has_audio_slot(&self, registry: &ConnectionRegistry, peer: PeerIdentity) -> bool {
      if !self.profile.has_audio_channel() {
         return true;
      }
      let mut busy = 0;
      for machine in registry.iter() {
         if matches!(
            machine.connection_phase(),
            ConnectionPhase::Connecting | ConnectionPhase::Connected
         ) {
            if machine.peer() == peer {
               return true;
            }
            busy += 1;
         }
      }
      busy < self.max_audio_devices
   }

   /// Runs `f` under the state lock.
   ///
   /// Listeners are called with the lock held and must not call back into
   /// the core from `emit`.
   fn with_state<R>(
      &self,
      timers: &mut TimerOps,
      f: impl FnOnce(&mut ConnectionRegistry, &mut Effects<'_>) -> R,
   ) -> R {
      let mut outbox = Vec::new();
      let mut guard = self.state.lock();
      let ProfileState {
         registry,
         active_device,
      } = &mut *guard;
      let mut env = Effects {
         core: self,
         active_device,
         timers,
         outbox: &mut outbox,
         audio_slot_free: true,
      };
      let result = f(registry, &mut env);
      for notification in &outbox {
         self.events.emit(notification);
      }
      result
   }

   /// Like [`Self::with_state`], with the audio limit resolved for `peer`.
   fn with_peer<R>(
      &self,
      peer: PeerIdentity,
      timers: &mut TimerOps,
      f: impl FnOnce(&mut ConnectionRegistry, &mut Effects<'_>) -> R,
   ) -> R {
      self.with_state(timers, |registry, env| {
         env.audio_slot_free = self.has_audio_slot(registry, peer);
         f(registry, env)
      })
   }

   /// Releases the record of `peer` once idle, if nothing needs it any more.
   fn release_if_done(&self, registry: &mut ConnectionRegistry, peer: PeerIdentity, fresh: bool) {
      let Some(machine) = registry.get(&peer) else {
         return;
      };
      if !machine.state().is_idle() {
         return;
      }
      if (fresh || machine.is_release_pending() || !self.policy.is_bonded(peer))
         && let Err(e) = registry.destroy(&peer)
      {
         error!("{}: failed to release {peer}: {e}", self.profile);
      }
   }

   /// Runs a local command.
   pub fn command(
      &self,
      peer: PeerIdentity,
      command: Command,
      timers: &mut TimerOps,
   ) -> Result<()> {
      if command.is_audio() && !self.profile.has_audio_channel() {
         warn!("{}: {command} for {peer} not supported", self.profile);
         return Err(LinkError::rejected(peer, RejectReason::Unsupported));
      }

      self.with_peer(peer, timers, |registry, env| {
         let fresh = registry.get(&peer).is_none();
         let machine = match command {
            Command::Connect => {
               if !env.audio_slot_free {
                  warn!(
                     "{}: audio device limit of {} reached, refusing {peer}",
                     self.profile, self.max_audio_devices
                  );
                  return Err(LinkError::rejected(peer, RejectReason::AudioLimit));
               }
               registry.get_or_create(peer)?
            },
            Command::Disconnect => registry
               .get_mut(&peer)
               .ok_or(LinkError::UnknownDevice(peer))?,
            Command::ConnectAudio | Command::DisconnectAudio => registry
               .get_mut(&peer)
               .ok_or(LinkError::NotConnected(peer))?,
         };
         let outcome = machine.process(Input::Command(command), env);
         self.release_if_done(registry, peer, fresh);

         match outcome {
            Outcome::Rejected(reason) => Err(LinkError::rejected(peer, reason)),
            _ => Ok(()),
         }
      })
   }

   /// Feeds a controller callback to the record of its peer.
   ///
   /// # Panics
   ///
   /// Panics when the event references an untracked peer and could not have
   /// opened a link, meaning the controller and the registry disagree.
   pub fn stack_event(&self, event: StackEvent, timers: &mut TimerOps) {
      self.apply_event(event, EventSource::Controller, timers);
   }

   /// Feeds an event observed by the backend.
   ///
   /// Teardown for a peer whose record is already gone is a repeat and is
   /// dropped.
   pub fn backend_event(&self, event: StackEvent, timers: &mut TimerOps) {
      self.apply_event(event, EventSource::Backend, timers);
   }

   fn apply_event(&self, event: StackEvent, source: EventSource, timers: &mut TimerOps) {
      let profile = self.profile;
      let peer = event.peer();
      let input = match event {
         StackEvent::ConnectionStateChanged { state, .. } => {
            Input::Link(LinkSignal::from_raw(profile, state))
         },
         StackEvent::AudioStateChanged { state, .. } => Input::Audio(state),
      };

      self.with_peer(peer, timers, |registry, env| {
         let fresh = registry.get(&peer).is_none();
         if fresh && !event.may_create_record() {
            if source == EventSource::Backend {
               debug!("{profile}: dropping repeated {event:?} for untracked {peer}");
               return;
            }
            panic!("{profile}: desynchronized, {event:?} for untracked {peer}");
         }
         if matches!(input, Input::Audio(_)) && !profile.has_audio_channel() {
            warn!("{profile}: dropping audio event for {peer}, no audio channel");
            return;
         }

         let machine = match registry.get_or_create(peer) {
            Ok(machine) => machine,
            Err(e) => {
               error!("{profile}: refusing incoming {peer}: {e}");
               if !self.native.disconnect(peer) {
                  warn!("{profile}: could not tear down {peer}");
               }
               return;
            },
         };
         machine.process(input, env);
         self.release_if_done(registry, peer, fresh);
      });
   }

   /// Delivers an armed timeout.
   pub fn timeout(
      &self,
      peer: PeerIdentity,
      kind: TimerKind,
      generation: u64,
      timers: &mut TimerOps,
   ) {
      self.with_peer(peer, timers, |registry, env| {
         let Some(machine) = registry.get_mut(&peer) else {
            debug!("{}: {kind} timeout for released {peer}", self.profile);
            return;
         };
         machine.on_timeout(kind, generation, env);
         self.release_if_done(registry, peer, false);
      });
   }

   /// Returns true if the record was released right away.
   pub fn bond_removed(&self, peer: PeerIdentity) -> bool {
      self.state.lock().registry.bond_removed(&peer)
   }

   /// Cancels every timer and drops every record, reporting each live link
   /// as disconnected.
   pub fn shutdown(&self, timers: &mut TimerOps) {
      self.with_state(timers, |registry, env| {
         for machine in registry.iter_mut() {
            machine.cancel_timers(&mut *env);
            let peer = machine.peer();
            let DeviceState { connection, audio } = machine.state();
            if audio != AudioPhase::Idle {
               env.audio_changed(peer, audio, AudioPhase::Idle);
            }
            if connection != ConnectionPhase::Disconnected {
               env.connection_changed(peer, connection, ConnectionPhase::Disconnected);
            }
         }
         let released = registry.drain().count();
         debug_assert!(env.active_device.is_none(), "active device outlived its link");
         info!("{}: shut down, released {released} records", self.profile);
      });
   }

   pub fn connection_state(&self, peer: PeerIdentity) -> ConnectionPhase {
      self
         .state
         .lock()
         .registry
         .get(&peer)
         .map_or(ConnectionPhase::Disconnected, StateMachine::connection_phase)
   }

   pub fn audio_state(&self, peer: PeerIdentity) -> AudioPhase {
      self
         .state
         .lock()
         .registry
         .get(&peer)
         .map_or(AudioPhase::Idle, StateMachine::audio_phase)
   }

   pub fn is_tracked(&self, peer: PeerIdentity) -> bool {
      self.state.lock().registry.get(&peer).is_some()
   }

   pub fn devices_matching_states(&self, states: &[ConnectionPhase]) -> Vec<PeerIdentity> {
      let guard = self.state.lock();
      let mut peers: Vec<_> = guard
         .registry
         .iter()
         .filter(|m| states.contains(&m.connection_phase()))
         .map(StateMachine::peer)
         .collect();
      peers.sort_unstable();
      peers
   }

   pub fn connected_devices(&self) -> Vec<PeerIdentity> {
      self.devices_matching_states(&[ConnectionPhase::Connected])
   }

   pub fn active_device(&self) -> Option<PeerIdentity> {
      self.state.lock().active_device
   }

   /// Routes the profile to `peer`, or to nobody with `None`.
   ///
   /// A peer must be connected and the native layer must accept.
   pub fn set_active_device(&self, peer: Option<PeerIdentity>, origin: ActiveOrigin) -> bool {
      let profile = self.profile;
      let mut guard = self.state.lock();
      let previous = guard.active_device;
      if previous == peer {
         return true;
      }
      if let Some(peer) = peer
         && !guard
            .registry
            .get(&peer)
            .is_some_and(StateMachine::is_connected)
      {
         warn!("{profile}: cannot activate {peer}, not connected");
         return false;
      }
      if !self.native.set_active_device(peer) {
         warn!("{profile}: native layer refused active device {peer:?}");
         return false;
      }
      guard.active_device = peer;
      info!("{profile}: active device now {peer:?} ({origin})");
      self.events.emit(&Notification::ActiveDeviceChanged {
         profile,
         previous,
         new: peer,
         origin,
      });
      true
   }

   pub fn snapshot(&self) -> serde_json::Value {
      let guard = self.state.lock();
      let mut machines: Vec<_> = guard.registry.iter().collect();
      machines.sort_unstable_by_key(|m| m.peer());
      json!({
         "profile": self.profile.to_str(),
         "capacity": guard.registry.capacity(),
         "active_device": guard.active_device.map(|a| a.to_string()),
         "devices": machines.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
      })
   }
}

// === Commands ===

#[derive(Debug)]
enum ServiceCommand {
   Command {
      peer: PeerIdentity,
      command: Command,
      reply: oneshot::Sender<Result<()>>,
   },
   StackEvent(StackEvent, EventSource, oneshot::Sender<()>),
   BondRemoved(PeerIdentity, oneshot::Sender<bool>),
   Timeout {
      peer: PeerIdentity,
      kind: TimerKind,
      generation: u64,
   },
   Shutdown(oneshot::Sender<()>),
}

// === Service Handle ===

/// Handle to one profile's service actor.
///
/// Mutations are queued to the actor in arrival order; queries read the
/// shared core directly.
#[derive(Clone)]
pub struct ProfileService {
   core: Arc<ProfileCore>,
   inbox: mpsc::Sender<ServiceCommand>,
}

impl ProfileService {
   pub fn spawn(core: ProfileCore) -> Self {
      let core = Arc::new(core);
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ServiceActor::new(core.clone(), command_rx).run());
      Self {
         core,
         inbox: command_tx,
      }
   }

   pub fn profile(&self) -> Profile {
      self.core.profile
   }

   async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ServiceCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| LinkError::ServiceShutdown)?;
      rx.await.map_err(|_| LinkError::ServiceShutdown)
   }

   async fn command(&self, peer: PeerIdentity, command: Command) -> Result<()> {
      self
         .call(|reply| ServiceCommand::Command {
            peer,
            command,
            reply,
         })
         .await?
   }

   pub async fn connect(&self, peer: PeerIdentity) -> Result<()> {
      self.command(peer, Command::Connect).await
   }

   pub async fn disconnect(&self, peer: PeerIdentity) -> Result<()> {
      self.command(peer, Command::Disconnect).await
   }

   pub async fn connect_audio(&self, peer: PeerIdentity) -> Result<()> {
      self.command(peer, Command::ConnectAudio).await
   }

   pub async fn disconnect_audio(&self, peer: PeerIdentity) -> Result<()> {
      self.command(peer, Command::DisconnectAudio).await
   }

   /// Queues a controller callback and waits until it has been applied.
   pub async fn stack_event(&self, event: StackEvent) -> Result<()> {
      self
         .call(|reply| ServiceCommand::StackEvent(event, EventSource::Controller, reply))
         .await
   }

   /// Queues an event observed by the backend. Repeated teardowns are
   /// dropped by the actor instead of counting as desynchronization.
   pub async fn backend_event(&self, event: StackEvent) -> Result<()> {
      self
         .call(|reply| ServiceCommand::StackEvent(event, EventSource::Backend, reply))
         .await
   }

   pub async fn bond_removed(&self, peer: PeerIdentity) -> Result<bool> {
      self
         .call(|reply| ServiceCommand::BondRemoved(peer, reply))
         .await
   }

   pub async fn shutdown(&self) -> Result<()> {
      self.call(ServiceCommand::Shutdown).await
   }

   pub fn connection_state(&self, peer: PeerIdentity) -> ConnectionPhase {
      self.core.connection_state(peer)
   }

   pub fn audio_state(&self, peer: PeerIdentity) -> AudioPhase {
      self.core.audio_state(peer)
   }

   pub fn is_tracked(&self, peer: PeerIdentity) -> bool {
      self.core.is_tracked(peer)
   }

   pub fn connected_devices(&self) -> Vec<PeerIdentity> {
      self.core.connected_devices()
   }

   pub fn devices_matching_states(&self, states: &[ConnectionPhase]) -> Vec<PeerIdentity> {
      self.core.devices_matching_states(states)
   }

   pub fn active_device(&self) -> Option<PeerIdentity> {
      self.core.active_device()
   }

   pub fn set_active_device(&self, peer: Option<PeerIdentity>, origin: ActiveOrigin) -> bool {
      self.core.set_active_device(peer, origin)
   }

   pub fn snapshot(&self) -> serde_json::Value {
      self.core.snapshot()
   }
}

// === Service Actor ===

struct ServiceActor {
   core: Arc<ProfileCore>,
   command_rx: mpsc::Receiver<ServiceCommand>,
   loopback_rx: mpsc::Receiver<ServiceCommand>,
   loopback_tx: mpsc::Sender<ServiceCommand>,
   timers: HashMap<(PeerIdentity, TimerKind), JoinHandle<()>>,
}

impl ServiceActor {
   fn new(core: Arc<ProfileCore>, command_rx: mpsc::Receiver<ServiceCommand>) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         core,
         command_rx,
         loopback_rx,
         loopback_tx,
         timers: HashMap::new(),
      }
   }

   async fn run(mut self) {
      info!("{}: service starting up", self.core.profile);

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("{}: service handle dropped", self.core.profile);
                     break;
                 };
                 if !self.handle_command(cmd) {
                     break;
                 }
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 if !self.handle_command(cmd) {
                     break;
                 }
             }
         }
      }

      for (_, handle) in self.timers.drain() {
         handle.abort();
      }
   }

   fn handle_command(&mut self, cmd: ServiceCommand) -> bool {
      let mut ops = TimerOps::new();
      let keep_running = match cmd {
         ServiceCommand::Command {
            peer,
            command,
            reply,
         } => {
            let result = self.core.command(peer, command, &mut ops);
            let _ = reply.send(result);
            true
         },
         ServiceCommand::StackEvent(event, source, reply) => {
            match source {
               EventSource::Controller => self.core.stack_event(event, &mut ops),
               EventSource::Backend => self.core.backend_event(event, &mut ops),
            }
            let _ = reply.send(());
            true
         },
         ServiceCommand::BondRemoved(peer, reply) => {
            let _ = reply.send(self.core.bond_removed(peer));
            true
         },
         ServiceCommand::Timeout {
            peer,
            kind,
            generation,
         } => {
            if self
               .timers
               .get(&(peer, kind))
               .is_some_and(JoinHandle::is_finished)
            {
               self.timers.remove(&(peer, kind));
            }
            self.core.timeout(peer, kind, generation, &mut ops);
            true
         },
         ServiceCommand::Shutdown(reply) => {
            self.core.shutdown(&mut ops);
            self.apply_timer_ops(ops);
            let _ = reply.send(());
            return false;
         },
      };
      self.apply_timer_ops(ops);
      keep_running
   }

   fn apply_timer_ops(&mut self, ops: TimerOps) {
      for op in ops {
         match op {
            TimerOp::Arm {
               peer,
               kind,
               generation,
               after,
            } => {
               let loopback = self.loopback_tx.clone();
               let handle = tokio::spawn(async move {
                  time::sleep(after).await;
                  let _ = loopback
                     .send(ServiceCommand::Timeout {
                        peer,
                        kind,
                        generation,
                     })
                     .await;
               });
               if let Some(previous) = self.timers.insert((peer, kind), handle) {
                  previous.abort();
               }
            },
            TimerOp::Cancel { peer, kind } => {
               if let Some(handle) = self.timers.remove(&(peer, kind)) {
                  handle.abort();
               }
            },
         }
      }
   }
}

// === Service Set ===

/// The running services, one per enabled profile.
#[derive(Clone, Default)]
pub struct ProfileServices {
   services: BTreeMap<Profile, ProfileService>,
}

impl ProfileServices {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn insert(&mut self, service: ProfileService) {
      self.services.insert(service.profile(), service);
   }

   pub fn get(&self, profile: Profile) -> Result<&ProfileService> {
      self
         .services
         .get(&profile)
         .ok_or(LinkError::ProfileUnavailable(profile))
   }

   pub fn iter(&self) -> impl Iterator<Item = &ProfileService> {
      self.services.values()
   }

   /// Forwards a bond loss to every profile.
   pub async fn bond_removed(&self, peer: PeerIdentity) {
      for service in self.services.values() {
         if let Err(e) = service.bond_removed(peer).await {
            warn!("{}: bond removal for {peer} failed: {e}", service.profile());
         }
      }
   }

   pub async fn shutdown(&self) {
      for service in self.services.values() {
         if let Err(e) = service.shutdown().await {
            debug!("{}: shutdown: {e}", service.profile());
         }
      }
   }

   pub fn snapshot(&self) -> serde_json::Value {
      serde_json::Value::Array(self.services.values().map(ProfileService::snapshot).collect())
   }
}

impl ActiveDeviceControl for ProfileServices {
   fn set_active_device(
      &self,
      profile: Profile,
      peer: Option<PeerIdentity>,
      origin: ActiveOrigin,
   ) -> bool {
      self
         .services
         .get(&profile)
         .is_some_and(|s| s.set_active_device(peer, origin))
   }
}

#[cfg(test)]
pub(crate) mod tests {
   use std::collections::HashSet;

   use super::*;
   use crate::{
      event::Recorder,
      profile::interface::{ConnectionPolicy, NativeInterface, RawAudioState, RawConnectionState},
   };
   use bluer::Address;

   #[derive(Debug, Clone, Copy, PartialEq, Eq)]
   pub(crate) enum NativeCall {
      Connect(Address),
      Disconnect(Address),
      ConnectAudio(Address),
      DisconnectAudio(Address),
      SetActive(Option<Address>),
   }

   #[derive(Default)]
   pub(crate) struct FakeNative {
      pub calls: Mutex<Vec<NativeCall>>,
      pub refuse_active: Mutex<bool>,
   }

   impl FakeNative {
      pub fn calls(&self) -> Vec<NativeCall> {
         self.calls.lock().clone()
      }
   }

   impl NativeInterface for FakeNative {
      fn connect(&self, peer: PeerIdentity) -> bool {
         self.calls.lock().push(NativeCall::Connect(peer));
         true
      }

      fn disconnect(&self, peer: PeerIdentity) -> bool {
         self.calls.lock().push(NativeCall::Disconnect(peer));
         true
      }

      fn connect_audio(&self, peer: PeerIdentity) -> bool {
         self.calls.lock().push(NativeCall::ConnectAudio(peer));
         true
      }

      fn disconnect_audio(&self, peer: PeerIdentity) -> bool {
         self.calls.lock().push(NativeCall::DisconnectAudio(peer));
         true
      }

      fn set_active_device(&self, peer: Option<PeerIdentity>) -> bool {
         self.calls.lock().push(NativeCall::SetActive(peer));
         !*self.refuse_active.lock()
      }
   }

   #[derive(Default)]
   pub(crate) struct FakePolicy {
      pub denied: Mutex<HashSet<Address>>,
      pub unbonded: Mutex<HashSet<Address>>,
   }

   impl ConnectionPolicy for FakePolicy {
      fn ok_to_connect(&self, _profile: Profile, peer: PeerIdentity) -> bool {
         !self.denied.lock().contains(&peer)
      }

      fn is_bonded(&self, peer: PeerIdentity) -> bool {
         !self.unbonded.lock().contains(&peer)
      }
   }

   pub(crate) struct Fixture {
      pub native: Arc<FakeNative>,
      pub policy: Arc<FakePolicy>,
      pub recorder: Arc<Recorder>,
   }

   impl Fixture {
      pub fn new() -> Self {
         Self {
            native: Arc::new(FakeNative::default()),
            policy: Arc::new(FakePolicy::default()),
            recorder: Recorder::new(),
         }
      }

      pub fn core(&self, profile: Profile, config: &Config) -> ProfileCore {
         ProfileCore::new(
            profile,
            config,
            self.native.clone(),
            self.policy.clone(),
            self.recorder.clone(),
         )
      }
   }

   const X: Address = Address::new([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x01]);
   const Y: Address = Address::new([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x02]);
   const Z: Address = Address::new([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x03]);

   fn link(peer: Address, state: RawConnectionState) -> StackEvent {
      StackEvent::ConnectionStateChanged { peer, state }
   }

   fn connect(core: &ProfileCore, peer: Address) {
      let mut ops = TimerOps::new();
      core.command(peer, Command::Connect, &mut ops).unwrap();
      core.stack_event(link(peer, RawConnectionState::Connected), &mut ops);
      assert_eq!(core.connection_state(peer), ConnectionPhase::Connected);
   }

   #[test]
   fn test_connect_arms_then_cancels_timer() {
      let fx = Fixture::new();
      let core = fx.core(Profile::A2dp, &Config::default());
      let mut ops = TimerOps::new();

      core.command(X, Command::Connect, &mut ops).unwrap();
      assert_eq!(
         ops.as_slice(),
         &[TimerOp::Arm {
            peer: X,
            kind: TimerKind::Connection,
            generation: 1,
            after: Duration::from_secs(30),
         }]
      );

      ops.clear();
      core.stack_event(link(X, RawConnectionState::Connected), &mut ops);
      assert_eq!(
         ops.as_slice(),
         &[TimerOp::Cancel {
            peer: X,
            kind: TimerKind::Connection
         }]
      );
      assert_eq!(core.connected_devices(), vec![X]);
      assert_eq!(fx.native.calls(), vec![NativeCall::Connect(X)]);
      assert_eq!(
         fx.recorder.connection_changes(),
         vec![
            (X, ConnectionPhase::Disconnected, ConnectionPhase::Connecting),
            (X, ConnectionPhase::Connecting, ConnectionPhase::Connected),
         ]
      );
   }

   #[test]
   fn test_headset_waits_for_service_level_connection() {
      let fx = Fixture::new();
      let core = fx.core(Profile::Headset, &Config::default());
      let mut ops = TimerOps::new();

      core.stack_event(link(X, RawConnectionState::Connecting), &mut ops);
      core.stack_event(link(X, RawConnectionState::Connected), &mut ops);
      assert_eq!(core.connection_state(X), ConnectionPhase::Connecting);
      core.stack_event(link(X, RawConnectionState::SlcConnected), &mut ops);
      assert_eq!(core.connection_state(X), ConnectionPhase::Connected);

      core.command(X, Command::ConnectAudio, &mut ops).unwrap();
      core.stack_event(
         StackEvent::AudioStateChanged {
            peer: X,
            state: RawAudioState::Connected,
         },
         &mut ops,
      );
      assert_eq!(core.audio_state(X), AudioPhase::AudioOn);
   }

   #[test]
   fn test_capacity_rejects_outgoing_and_incoming() {
      let fx = Fixture::new();
      let config = Config {
         max_tracked_peers: 1,
         ..Config::default()
      };
      let core = fx.core(Profile::HidHost, &config);
      let mut ops = TimerOps::new();

      core.command(X, Command::Connect, &mut ops).unwrap();
      let err = core.command(Y, Command::Connect, &mut ops).unwrap_err();
      assert!(matches!(err, LinkError::CapacityExceeded { limit: 1, .. }));

      core.stack_event(link(Y, RawConnectionState::Connecting), &mut ops);
      assert!(!core.is_tracked(Y));
      assert_eq!(fx.native.calls().last(), Some(&NativeCall::Disconnect(Y)));
   }

   #[test]
   #[should_panic(expected = "desynchronized")]
   fn test_unknown_peer_disconnect_is_fatal() {
      let fx = Fixture::new();
      let core = fx.core(Profile::A2dp, &Config::default());
      core.stack_event(link(X, RawConnectionState::Disconnected), &mut TimerOps::new());
   }

   #[test]
   fn test_audio_commands_on_plain_profile_are_unsupported() {
      let fx = Fixture::new();
      let core = fx.core(Profile::HearingAid, &Config::default());
      connect(&core, X);
      let err = core
         .command(X, Command::ConnectAudio, &mut TimerOps::new())
         .unwrap_err();
      assert!(matches!(
         err,
         LinkError::Rejected {
            reason: RejectReason::Unsupported,
            ..
         }
      ));
   }

   #[test]
   fn test_policy_rejection_leaves_no_record() {
      let fx = Fixture::new();
      fx.policy.denied.lock().insert(X);
      let core = fx.core(Profile::A2dp, &Config::default());
      let mut ops = TimerOps::new();

      let err = core.command(X, Command::Connect, &mut ops).unwrap_err();
      assert!(matches!(
         err,
         LinkError::Rejected {
            reason: RejectReason::Policy,
            ..
         }
      ));
      assert!(!core.is_tracked(X));
      assert!(ops.is_empty());
      assert!(fx.native.calls().is_empty());

      // An incoming attempt is torn down instead.
      core.stack_event(link(X, RawConnectionState::Connecting), &mut ops);
      assert!(!core.is_tracked(X));
      assert_eq!(fx.native.calls(), vec![NativeCall::Disconnect(X)]);
   }

   #[test]
   fn test_active_device_requires_connected_peer() {
      let fx = Fixture::new();
      let core = fx.core(Profile::A2dp, &Config::default());
      assert!(!core.set_active_device(Some(X), ActiveOrigin::Explicit));

      connect(&core, X);
      *fx.native.refuse_active.lock() = true;
      assert!(!core.set_active_device(Some(X), ActiveOrigin::Explicit));
      assert_eq!(core.active_device(), None);

      *fx.native.refuse_active.lock() = false;
      assert!(core.set_active_device(Some(X), ActiveOrigin::Explicit));
      assert_eq!(core.active_device(), Some(X));
      assert_eq!(
         fx.recorder.active_changes(),
         vec![(Profile::A2dp, Some(X), ActiveOrigin::Explicit)]
      );
   }

   #[test]
   fn test_active_device_cleared_when_holder_disconnects() {
      let fx = Fixture::new();
      let core = fx.core(Profile::A2dp, &Config::default());
      connect(&core, X);
      assert!(core.set_active_device(Some(X), ActiveOrigin::Policy));

      core.stack_event(link(X, RawConnectionState::Disconnected), &mut TimerOps::new());
      assert_eq!(core.active_device(), None);
      assert_eq!(
         fx.recorder.active_changes().last(),
         Some(&(Profile::A2dp, None, ActiveOrigin::Disconnection))
      );
      assert_eq!(fx.native.calls().last(), Some(&NativeCall::SetActive(None)));
   }

   #[test]
   fn test_records_released_when_bond_is_gone() {
      let fx = Fixture::new();
      let core = fx.core(Profile::A2dp, &Config::default());
      let mut ops = TimerOps::new();

      // Bonded peers keep their record after disconnecting.
      connect(&core, X);
      core.stack_event(link(X, RawConnectionState::Disconnected), &mut ops);
      assert!(core.is_tracked(X));

      // Bond removal while connected waits for the link to drop.
      connect(&core, X);
      assert!(!core.bond_removed(X));
      assert!(core.is_tracked(X));
      core.command(X, Command::Disconnect, &mut ops).unwrap();
      core.stack_event(link(X, RawConnectionState::Disconnected), &mut ops);
      assert!(!core.is_tracked(X));

      // Unbonded peers are released as soon as they are idle.
      fx.policy.unbonded.lock().insert(Y);
      connect(&core, Y);
      core.stack_event(link(Y, RawConnectionState::Disconnected), &mut ops);
      assert!(!core.is_tracked(Y));
   }

   #[test]
   fn test_shutdown_cancels_timers_and_drops_records() {
      let fx = Fixture::new();
      let core = fx.core(Profile::A2dp, &Config::default());
      let mut ops = TimerOps::new();
      core.command(X, Command::Connect, &mut ops).unwrap();
      connect(&core, Y);

      ops.clear();
      core.shutdown(&mut ops);
      assert_eq!(
         ops.as_slice(),
         &[TimerOp::Cancel {
            peer: X,
            kind: TimerKind::Connection
         }]
      );
      assert!(core.devices_matching_states(&[
         ConnectionPhase::Connecting,
         ConnectionPhase::Connected
      ])
      .is_empty());
      assert_eq!(core.snapshot()["devices"], json!([]));
   }

   #[test]
   fn test_shutdown_reports_links_and_active_device() {
      let fx = Fixture::new();
      let core = fx.core(Profile::A2dp, &Config::default());
      let mut ops = TimerOps::new();
      connect(&core, X);
      assert!(core.set_active_device(Some(X), ActiveOrigin::Explicit));
      core.command(Y, Command::Connect, &mut ops).unwrap();
      fx.recorder.take();

      core.shutdown(&mut ops);
      let changes = fx.recorder.connection_changes();
      assert_eq!(changes.len(), 2);
      assert!(changes.contains(&(X, ConnectionPhase::Connected, ConnectionPhase::Disconnected)));
      assert!(changes.contains(&(Y, ConnectionPhase::Connecting, ConnectionPhase::Disconnected)));
      assert_eq!(
         fx.recorder.active_changes(),
         vec![(Profile::A2dp, None, ActiveOrigin::Disconnection)]
      );
      assert_eq!(core.active_device(), None);
      assert_eq!(fx.native.calls().last(), Some(&NativeCall::SetActive(None)));
   }

   #[test]
   fn test_repeated_backend_teardown_is_dropped() {
      let fx = Fixture::new();
      let core = fx.core(Profile::A2dp, &Config::default());
      let mut ops = TimerOps::new();
      connect(&core, X);
      assert!(!core.bond_removed(X));

      core.backend_event(link(X, RawConnectionState::Disconnected), &mut ops);
      assert!(!core.is_tracked(X));
      core.backend_event(link(X, RawConnectionState::Disconnected), &mut ops);
      assert_eq!(
         fx.recorder.connection_changes().last(),
         Some(&(X, ConnectionPhase::Disconnecting, ConnectionPhase::Disconnected))
      );

      connect(&core, Y);
   }

   #[test]
   fn test_active_changes_follow_state_order_across_threads() {
      let fx = Fixture::new();
      let core = fx.core(Profile::A2dp, &Config::default());
      connect(&core, X);

      std::thread::scope(|scope| {
         scope.spawn(|| {
            for _ in 0..500 {
               core.set_active_device(Some(X), ActiveOrigin::Policy);
            }
         });
         scope.spawn(|| {
            let mut ops = TimerOps::new();
            for _ in 0..500 {
               core.stack_event(link(X, RawConnectionState::Disconnected), &mut ops);
               core.stack_event(link(X, RawConnectionState::Connected), &mut ops);
            }
         });
      });

      let mut active = None;
      for notification in fx.recorder.take() {
         if let Notification::ActiveDeviceChanged { previous, new, .. } = notification {
            assert_eq!(previous, active);
            active = new;
         }
      }
      assert_eq!(active, core.active_device());
   }

   #[test]
   fn test_audio_device_limit_gates_connections() {
      let fx = Fixture::new();
      let config = Config {
         max_connected_audio_devices: 2,
         ..Config::default()
      };
      let core = fx.core(Profile::A2dp, &config);
      let mut ops = TimerOps::new();

      connect(&core, X);
      core.command(Y, Command::Connect, &mut ops).unwrap();
      let err = core.command(Z, Command::Connect, &mut ops).unwrap_err();
      assert!(matches!(
         err,
         LinkError::Rejected {
            reason: RejectReason::AudioLimit,
            ..
         }
      ));
      assert!(!core.is_tracked(Z));

      // Incoming attempts are torn down as well.
      core.stack_event(link(Z, RawConnectionState::Connecting), &mut ops);
      assert!(!core.is_tracked(Z));
      assert_eq!(fx.native.calls().last(), Some(&NativeCall::Disconnect(Z)));

      // A peer already holding a slot keeps it.
      core.stack_event(link(Y, RawConnectionState::Connected), &mut ops);
      assert_eq!(core.connection_state(Y), ConnectionPhase::Connected);

      // Profiles without audio are not limited.
      let hid = fx.core(Profile::HidHost, &config);
      for peer in [X, Y, Z] {
         connect(&hid, peer);
      }
   }

   #[test]
   fn test_single_audio_device_becomes_active_on_connect() {
      let fx = Fixture::new();
      let config = Config {
         max_connected_audio_devices: 1,
         ..Config::default()
      };
      let core = fx.core(Profile::A2dp, &config);

      connect(&core, X);
      assert_eq!(core.active_device(), Some(X));
      assert_eq!(
         fx.recorder.active_changes(),
         vec![(Profile::A2dp, Some(X), ActiveOrigin::Policy)]
      );
      assert!(matches!(
         core.command(Y, Command::Connect, &mut TimerOps::new()),
         Err(LinkError::Rejected {
            reason: RejectReason::AudioLimit,
            ..
         })
      ));

      core.stack_event(link(X, RawConnectionState::Disconnected), &mut TimerOps::new());
      assert_eq!(core.active_device(), None);
   }

   #[test]
   fn test_snapshot_lists_records() {
      let fx = Fixture::new();
      let core = fx.core(Profile::HidHost, &Config::default());
      connect(&core, X);
      let snapshot = core.snapshot();
      assert_eq!(snapshot["profile"], "hid_host");
      assert_eq!(snapshot["devices"][0]["address"], X.to_string());
      assert_eq!(snapshot["devices"][0]["connection"], "connected");
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_timeout_rolls_back() {
      let fx = Fixture::new();
      let service = ProfileService::spawn(fx.core(Profile::A2dp, &Config::default()));

      service.connect(X).await.unwrap();
      assert_eq!(service.connection_state(X), ConnectionPhase::Connecting);

      time::sleep(Duration::from_secs(29)).await;
      assert_eq!(service.connection_state(X), ConnectionPhase::Connecting);

      time::sleep(Duration::from_secs(2)).await;
      assert_eq!(service.connection_state(X), ConnectionPhase::Disconnected);
      assert_eq!(
         fx.recorder.connection_changes(),
         vec![
            (X, ConnectionPhase::Disconnected, ConnectionPhase::Connecting),
            (X, ConnectionPhase::Connecting, ConnectionPhase::Disconnected),
         ]
      );
      assert_eq!(
         fx.native.calls(),
         vec![NativeCall::Connect(X), NativeCall::Disconnect(X)]
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_confirmed_connect_never_times_out() {
      let fx = Fixture::new();
      let service = ProfileService::spawn(fx.core(Profile::HidHost, &Config::default()));

      service.connect(X).await.unwrap();
      service
         .stack_event(link(X, RawConnectionState::Connected))
         .await
         .unwrap();
      time::sleep(Duration::from_secs(60)).await;
      assert_eq!(service.connection_state(X), ConnectionPhase::Connected);
      assert_eq!(fx.recorder.connection_changes().len(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_shutdown_closes_service() {
      let fx = Fixture::new();
      let service = ProfileService::spawn(fx.core(Profile::A2dp, &Config::default()));
      service.connect(X).await.unwrap();

      service.shutdown().await.unwrap();
      assert!(!service.is_tracked(X));
      assert!(matches!(
         service.connect(Y).await,
         Err(LinkError::ServiceShutdown)
      ));
   }
}
