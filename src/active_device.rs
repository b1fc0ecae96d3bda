//! Active device arbitration across profiles.
//!
//! The manager listens to every profile service's notifications, keeps the
//! connected peers of each profile in connection order and decides which one
//! is active:
//!
//! - the first connection after every profile was empty becomes active at
//!   once and opens a correlation window;
//! - inside the window, a profile without an active device adopts a peer
//!   that is already active on another profile;
//! - when the window closes, profiles still without an active device get
//!   their oldest connected peer;
//! - explicit overrides win immediately and close the window;
//! - losing the active peer leaves the profile without one;
//! - adapter power changes reset everything.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use log::{debug, info, warn};
use serde_json::json;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   error::{LinkError, Result},
   event::{ActiveOrigin, EventBus, Notification},
   profile::{ConnectionPhase, PeerIdentity, Profile},
};

/// Routes a profile's data to a peer on behalf of the manager.
pub trait ActiveDeviceControl: Send + Sync {
   fn set_active_device(
      &self,
      profile: Profile,
      peer: Option<PeerIdentity>,
      origin: ActiveOrigin,
   ) -> bool;
}

pub type ControlHandle = Arc<dyn ActiveDeviceControl>;

/// Per-profile view kept by the manager.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActiveDeviceState {
   pub active: Option<PeerIdentity>,
   /// Connected peers, oldest first.
   pub connected: Vec<PeerIdentity>,
}

impl ActiveDeviceState {
   fn to_json(&self) -> serde_json::Value {
      json!({
         "active": self.active.map(|a| a.to_string()),
         "connected": self.connected.iter().map(ToString::to_string).collect::<Vec<_>>(),
      })
   }
}

/// What the actor must do with the correlation timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
   Start { generation: u64, after: Duration },
   Cancel,
}

/// Arbitration policy, free of any runtime.
pub struct Arbitrator {
   window: Duration,
   control: ControlHandle,
   profiles: BTreeMap<Profile, ActiveDeviceState>,
   timer: Option<u64>,
   next_generation: u64,
}

impl Arbitrator {
   pub fn new(window: Duration, control: ControlHandle) -> Self {
      Self {
         window,
         control,
         profiles: BTreeMap::new(),
         timer: None,
         next_generation: 0,
      }
   }

   pub fn state(&self, profile: Profile) -> Option<&ActiveDeviceState> {
      self.profiles.get(&profile)
   }

   pub fn active_device(&self, profile: Profile) -> Option<PeerIdentity> {
      self.profiles.get(&profile).and_then(|s| s.active)
   }

   pub fn connected_devices(&self, profile: Profile) -> Vec<PeerIdentity> {
      self
         .profiles
         .get(&profile)
         .map(|s| s.connected.clone())
         .unwrap_or_default()
   }

   pub const fn is_correlating(&self) -> bool {
      self.timer.is_some()
   }

   pub fn on_notification(&mut self, notification: &Notification) -> Option<TimerAction> {
      match *notification {
         Notification::ConnectionStateChanged {
            profile,
            peer,
            previous,
            new,
         } => {
            if new == ConnectionPhase::Connected {
               self.on_connected(profile, peer)
            } else if previous == ConnectionPhase::Connected {
               self.on_disconnected(profile, peer);
               None
            } else {
               None
            }
         },
         Notification::ActiveDeviceChanged {
            profile,
            new,
            origin: ActiveOrigin::Explicit,
            ..
         } => self.on_explicit(profile, new),
         Notification::ActiveDeviceChanged { profile, new, .. } => {
            debug!("{profile}: active device echo {new:?}");
            None
         },
         Notification::AdapterStateChanged { powered } => {
            info!(
               "Adapter powered {}, resetting active devices",
               if powered { "on" } else { "off" }
            );
            self.reset()
         },
         Notification::AudioStateChanged { .. } => None,
      }
   }

   fn on_connected(&mut self, profile: Profile, peer: PeerIdentity) -> Option<TimerAction> {
      let idle = self.profiles.values().all(|s| s.connected.is_empty());
      let correlated = self.timer.is_some()
         && self
            .profiles
            .iter()
            .any(|(p, s)| *p != profile && s.active == Some(peer));

      let state = self.profiles.entry(profile).or_default();
      if state.connected.contains(&peer) {
         debug!("{profile}: {peer} already connected");
         return None;
      }
      state.connected.push(peer);
      let has_active = state.active.is_some();
      info!("{profile}: {peer} connected");

      if idle {
         self.activate(profile, peer);
         self.next_generation += 1;
         self.timer = Some(self.next_generation);
         debug!("Correlation window open for {:?}", self.window);
         return Some(TimerAction::Start {
            generation: self.next_generation,
            after: self.window,
         });
      }
      if correlated && !has_active {
         info!("{profile}: {peer} is active elsewhere, adopting it");
         self.activate(profile, peer);
      }
      None
   }

   fn on_disconnected(&mut self, profile: Profile, peer: PeerIdentity) {
      let Some(state) = self.profiles.get_mut(&profile) else {
         return;
      };
      state.connected.retain(|p| *p != peer);
      if state.active == Some(peer) {
         info!("{profile}: active device {peer} disconnected");
         state.active = None;
      }
   }

   fn on_explicit(&mut self, profile: Profile, peer: Option<PeerIdentity>) -> Option<TimerAction> {
      let state = self.profiles.entry(profile).or_default();
      if let Some(peer) = peer
         && !state.connected.contains(&peer)
      {
         warn!("{profile}: ignoring override to {peer}, not connected");
         return None;
      }
      info!("{profile}: active device overridden to {peer:?}");
      state.active = peer;
      self.timer.take().map(|_| TimerAction::Cancel)
   }

   /// Closes the correlation window armed with `generation`.
   pub fn on_timer(&mut self, generation: u64) {
      if self.timer != Some(generation) {
         debug!("Stale correlation timer #{generation}");
         return;
      }
      self.timer = None;

      let pending: Vec<_> = self
         .profiles
         .iter()
         .filter(|(_, s)| s.active.is_none())
         .filter_map(|(p, s)| s.connected.first().map(|peer| (*p, *peer)))
         .collect();
      for (profile, peer) in pending {
         info!("{profile}: correlation window closed, promoting {peer}");
         self.activate(profile, peer);
      }
   }

   /// Explicit selection requested through the manager.
   pub fn select(&mut self, profile: Profile, peer: PeerIdentity) -> (bool, Option<TimerAction>) {
      if !self.connected_devices(profile).contains(&peer) {
         warn!("{profile}: cannot select {peer}, not connected");
         return (false, None);
      }
      if !self
         .control
         .set_active_device(profile, Some(peer), ActiveOrigin::Explicit)
      {
         return (false, None);
      }
      (true, self.on_explicit(profile, Some(peer)))
   }

   pub fn reset(&mut self) -> Option<TimerAction> {
      self.profiles.clear();
      self.timer.take().map(|_| TimerAction::Cancel)
   }

   fn activate(&mut self, profile: Profile, peer: PeerIdentity) {
      if !self
         .control
         .set_active_device(profile, Some(peer), ActiveOrigin::Policy)
      {
         warn!("{profile}: could not make {peer} active");
         return;
      }
      if let Some(state) = self.profiles.get_mut(&profile) {
         state.active = Some(peer);
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      let profiles: serde_json::Map<_, _> = self
         .profiles
         .iter()
         .map(|(p, s)| (p.to_str().to_owned(), s.to_json()))
         .collect();
      json!({
         "correlating": self.is_correlating(),
         "profiles": profiles,
      })
   }
}

// === Commands ===

enum ManagerCommand {
   Notification(Notification),
   CorrelationExpired(u64),
   Select {
      profile: Profile,
      peer: PeerIdentity,
      reply: oneshot::Sender<bool>,
   },
   GetActive(Profile, oneshot::Sender<Option<PeerIdentity>>),
   GetConnected(Profile, oneshot::Sender<Vec<PeerIdentity>>),
   Snapshot(oneshot::Sender<serde_json::Value>),
   Shutdown(oneshot::Sender<()>),
}

// === Manager Handle ===

/// Handle to the arbitration actor. Register it on the broadcaster to feed
/// it notifications.
pub struct ActiveDeviceManager {
   inbox: mpsc::UnboundedSender<ManagerCommand>,
}

impl ActiveDeviceManager {
   pub fn spawn(window: Duration, control: ControlHandle) -> Arc<Self> {
      let (command_tx, command_rx) = mpsc::unbounded_channel();
      tokio::spawn(ManagerActor::new(Arbitrator::new(window, control), command_rx).run());
      Arc::new(Self { inbox: command_tx })
   }

   async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .map_err(|_| LinkError::ManagerShutdown)?;
      rx.await.map_err(|_| LinkError::ManagerShutdown)
   }

   pub async fn active_device(&self, profile: Profile) -> Result<Option<PeerIdentity>> {
      self
         .call(|reply| ManagerCommand::GetActive(profile, reply))
         .await
   }

   pub async fn connected_devices(&self, profile: Profile) -> Result<Vec<PeerIdentity>> {
      self
         .call(|reply| ManagerCommand::GetConnected(profile, reply))
         .await
   }

   /// Makes `peer` active for `profile`, overriding the policy.
   pub async fn set_active_device(&self, profile: Profile, peer: PeerIdentity) -> Result<bool> {
      self
         .call(|reply| ManagerCommand::Select {
            profile,
            peer,
            reply,
         })
         .await
   }

   pub async fn snapshot(&self) -> Result<serde_json::Value> {
      self.call(ManagerCommand::Snapshot).await
   }

   pub async fn shutdown(&self) -> Result<()> {
      self.call(ManagerCommand::Shutdown).await
   }
}

impl EventBus for ActiveDeviceManager {
   fn emit(&self, notification: &Notification) {
      if self
         .inbox
         .send(ManagerCommand::Notification(*notification))
         .is_err()
      {
         debug!("Active device manager gone, dropping {notification:?}");
      }
   }
}

// === Manager Actor ===

struct ManagerActor {
   arbitrator: Arbitrator,
   command_rx: mpsc::UnboundedReceiver<ManagerCommand>,
   loopback_rx: mpsc::UnboundedReceiver<ManagerCommand>,
   loopback_tx: mpsc::UnboundedSender<ManagerCommand>,
   timer: Option<JoinHandle<()>>,
}

impl ManagerActor {
   fn new(arbitrator: Arbitrator, command_rx: mpsc::UnboundedReceiver<ManagerCommand>) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
      Self {
         arbitrator,
         command_rx,
         loopback_rx,
         loopback_tx,
         timer: None,
      }
   }

   async fn run(mut self) {
      info!("Active device manager starting up");

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Active device manager shutting down");
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

      if let Some(handle) = self.timer.take() {
         handle.abort();
      }
   }

   fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::Notification(notification) => {
            let action = self.arbitrator.on_notification(&notification);
            self.apply(action);
         },
         ManagerCommand::CorrelationExpired(generation) => {
            self.timer = None;
            self.arbitrator.on_timer(generation);
         },
         ManagerCommand::Select {
            profile,
            peer,
            reply,
         } => {
            let (accepted, action) = self.arbitrator.select(profile, peer);
            self.apply(action);
            let _ = reply.send(accepted);
         },
         ManagerCommand::GetActive(profile, reply) => {
            let _ = reply.send(self.arbitrator.active_device(profile));
         },
         ManagerCommand::GetConnected(profile, reply) => {
            let _ = reply.send(self.arbitrator.connected_devices(profile));
         },
         ManagerCommand::Snapshot(reply) => {
            let _ = reply.send(self.arbitrator.to_json());
         },
         ManagerCommand::Shutdown(reply) => {
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   fn apply(&mut self, action: Option<TimerAction>) {
      let Some(action) = action else {
         return;
      };
      if let Some(handle) = self.timer.take() {
         handle.abort();
      }
      if let TimerAction::Start { generation, after } = action {
         let loopback = self.loopback_tx.clone();
         self.timer = Some(tokio::spawn(async move {
            time::sleep(after).await;
            let _ = loopback.send(ManagerCommand::CorrelationExpired(generation));
         }));
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use bluer::Address;
   use parking_lot::Mutex;

   const X: Address = Address::new([0x5c, 0xf3, 0x70, 0x00, 0x00, 0x01]);
   const Y: Address = Address::new([0x5c, 0xf3, 0x70, 0x00, 0x00, 0x02]);
   const Z: Address = Address::new([0x5c, 0xf3, 0x70, 0x00, 0x00, 0x03]);
   const WINDOW: Duration = Duration::from_secs(6);

   #[derive(Default)]
   struct FakeControl {
      calls: Mutex<Vec<(Profile, Option<PeerIdentity>, ActiveOrigin)>>,
      refuse: Mutex<bool>,
   }

   impl ActiveDeviceControl for FakeControl {
      fn set_active_device(
         &self,
         profile: Profile,
         peer: Option<PeerIdentity>,
         origin: ActiveOrigin,
      ) -> bool {
         self.calls.lock().push((profile, peer, origin));
         !*self.refuse.lock()
      }
   }

   fn connected(profile: Profile, peer: Address) -> Notification {
      Notification::ConnectionStateChanged {
         profile,
         peer,
         previous: ConnectionPhase::Connecting,
         new: ConnectionPhase::Connected,
      }
   }

   fn disconnected(profile: Profile, peer: Address) -> Notification {
      Notification::ConnectionStateChanged {
         profile,
         peer,
         previous: ConnectionPhase::Connected,
         new: ConnectionPhase::Disconnecting,
      }
   }

   fn explicit(profile: Profile, new: Option<Address>) -> Notification {
      Notification::ActiveDeviceChanged {
         profile,
         previous: None,
         new,
         origin: ActiveOrigin::Explicit,
      }
   }

   fn arbitrator() -> (Arbitrator, Arc<FakeControl>) {
      let control = Arc::new(FakeControl::default());
      (Arbitrator::new(WINDOW, control.clone()), control)
   }

   #[test]
   fn test_first_connection_becomes_active_and_opens_window() {
      let (mut arb, control) = arbitrator();
      let action = arb.on_notification(&connected(Profile::A2dp, X));
      assert_eq!(
         action,
         Some(TimerAction::Start {
            generation: 1,
            after: WINDOW
         })
      );
      assert_eq!(arb.active_device(Profile::A2dp), Some(X));
      assert_eq!(
         control.calls.lock().as_slice(),
         &[(Profile::A2dp, Some(X), ActiveOrigin::Policy)]
      );
   }

   #[test]
   fn test_same_device_is_adopted_inside_window() {
      let (mut arb, _) = arbitrator();
      arb.on_notification(&connected(Profile::A2dp, X));
      assert_eq!(arb.on_notification(&connected(Profile::Headset, X)), None);
      assert_eq!(arb.active_device(Profile::Headset), Some(X));
   }

   #[test]
   fn test_other_device_waits_for_window_to_close() {
      let (mut arb, _) = arbitrator();
      arb.on_notification(&connected(Profile::A2dp, X));
      arb.on_notification(&connected(Profile::Headset, Y));
      arb.on_notification(&connected(Profile::Headset, Z));
      assert_eq!(arb.active_device(Profile::Headset), None);

      arb.on_timer(1);
      assert_eq!(arb.active_device(Profile::Headset), Some(Y));
      assert_eq!(arb.active_device(Profile::A2dp), Some(X));
      assert!(!arb.is_correlating());
   }

   #[test]
   fn test_connections_after_window_only_join() {
      let (mut arb, control) = arbitrator();
      arb.on_notification(&connected(Profile::A2dp, X));
      arb.on_timer(1);
      control.calls.lock().clear();

      arb.on_notification(&connected(Profile::A2dp, Y));
      arb.on_notification(&connected(Profile::Headset, X));
      assert_eq!(arb.active_device(Profile::A2dp), Some(X));
      assert_eq!(arb.active_device(Profile::Headset), None);
      assert_eq!(arb.connected_devices(Profile::A2dp), vec![X, Y]);
      assert!(control.calls.lock().is_empty());
   }

   #[test]
   fn test_stale_timer_is_ignored() {
      let (mut arb, _) = arbitrator();
      arb.on_notification(&connected(Profile::A2dp, X));
      arb.on_notification(&disconnected(Profile::A2dp, X));
      // Everything is idle again, so a new window opens.
      assert!(matches!(
         arb.on_notification(&connected(Profile::HidHost, Y)),
         Some(TimerAction::Start { generation: 2, .. })
      ));
      arb.on_timer(1);
      assert!(arb.is_correlating());
   }

   #[test]
   fn test_disconnect_of_active_device_never_promotes() {
      let (mut arb, _) = arbitrator();
      arb.on_notification(&connected(Profile::A2dp, X));
      arb.on_notification(&connected(Profile::A2dp, Y));
      arb.on_timer(1);

      arb.on_notification(&disconnected(Profile::A2dp, X));
      assert_eq!(arb.active_device(Profile::A2dp), None);
      assert_eq!(arb.connected_devices(Profile::A2dp), vec![Y]);
   }

   #[test]
   fn test_explicit_override_wins_and_closes_window() {
      let (mut arb, _) = arbitrator();
      arb.on_notification(&connected(Profile::A2dp, X));
      arb.on_notification(&connected(Profile::A2dp, Y));

      assert_eq!(
         arb.on_notification(&explicit(Profile::A2dp, Some(Y))),
         Some(TimerAction::Cancel)
      );
      assert_eq!(arb.active_device(Profile::A2dp), Some(Y));
      assert!(!arb.is_correlating());

      // Overrides to peers the profile does not know are dropped.
      assert_eq!(arb.on_notification(&explicit(Profile::A2dp, Some(Z))), None);
      assert_eq!(arb.active_device(Profile::A2dp), Some(Y));

      arb.on_notification(&explicit(Profile::A2dp, None));
      assert_eq!(arb.active_device(Profile::A2dp), None);
   }

   #[test]
   fn test_policy_echo_does_not_override() {
      let (mut arb, _) = arbitrator();
      arb.on_notification(&connected(Profile::A2dp, X));
      arb.on_notification(&Notification::ActiveDeviceChanged {
         profile: Profile::A2dp,
         previous: None,
         new: Some(X),
         origin: ActiveOrigin::Policy,
      });
      assert!(arb.is_correlating());
   }

   #[test]
   fn test_refused_activation_leaves_profile_without_active() {
      let (mut arb, control) = arbitrator();
      *control.refuse.lock() = true;
      arb.on_notification(&connected(Profile::HearingAid, X));
      assert_eq!(arb.active_device(Profile::HearingAid), None);
      assert_eq!(arb.connected_devices(Profile::HearingAid), vec![X]);
   }

   #[test]
   fn test_adapter_power_change_resets_everything() {
      let (mut arb, _) = arbitrator();
      arb.on_notification(&connected(Profile::A2dp, X));
      assert_eq!(
         arb.on_notification(&Notification::AdapterStateChanged { powered: false }),
         Some(TimerAction::Cancel)
      );
      assert_eq!(arb.active_device(Profile::A2dp), None);
      assert!(arb.connected_devices(Profile::A2dp).is_empty());
      assert_eq!(arb.to_json()["profiles"], json!({}));
   }

   #[test]
   fn test_select_requires_connected_peer() {
      let (mut arb, control) = arbitrator();
      arb.on_notification(&connected(Profile::A2dp, X));
      arb.on_notification(&connected(Profile::A2dp, Y));

      assert_eq!(arb.select(Profile::A2dp, Z), (false, None));
      assert_eq!(
         arb.select(Profile::A2dp, Y),
         (true, Some(TimerAction::Cancel))
      );
      assert_eq!(arb.active_device(Profile::A2dp), Some(Y));
      assert_eq!(
         control.calls.lock().last(),
         Some(&(Profile::A2dp, Some(Y), ActiveOrigin::Explicit))
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_correlation_within_window_without_waiting() {
      let control = Arc::new(FakeControl::default());
      let manager = ActiveDeviceManager::spawn(WINDOW, control.clone());

      manager.emit(&connected(Profile::A2dp, X));
      assert_eq!(manager.active_device(Profile::A2dp).await.unwrap(), Some(X));

      time::sleep(Duration::from_secs(2)).await;
      manager.emit(&connected(Profile::Headset, X));
      assert_eq!(
         manager.active_device(Profile::Headset).await.unwrap(),
         Some(X)
      );
      assert_eq!(manager.snapshot().await.unwrap()["correlating"], true);
   }

   #[tokio::test(start_paused = true)]
   async fn test_window_expiry_with_single_profile() {
      let control = Arc::new(FakeControl::default());
      let manager = ActiveDeviceManager::spawn(WINDOW, control.clone());

      manager.emit(&connected(Profile::A2dp, X));
      time::sleep(Duration::from_secs(7)).await;

      assert_eq!(manager.active_device(Profile::A2dp).await.unwrap(), Some(X));
      assert!(
         manager
            .connected_devices(Profile::Headset)
            .await
            .unwrap()
            .is_empty()
      );
      assert_eq!(manager.snapshot().await.unwrap()["correlating"], false);
      assert_eq!(control.calls.lock().len(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_window_expiry_promotes_oldest_peer() {
      let control = Arc::new(FakeControl::default());
      let manager = ActiveDeviceManager::spawn(WINDOW, control.clone());

      manager.emit(&connected(Profile::A2dp, X));
      manager.emit(&connected(Profile::HidHost, Y));
      manager.emit(&connected(Profile::HidHost, Z));
      assert_eq!(manager.active_device(Profile::HidHost).await.unwrap(), None);

      time::sleep(Duration::from_secs(6) + Duration::from_millis(1)).await;
      assert_eq!(
         manager.active_device(Profile::HidHost).await.unwrap(),
         Some(Y)
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_shutdown_stops_manager() {
      let manager = ActiveDeviceManager::spawn(WINDOW, Arc::new(FakeControl::default()));
      manager.shutdown().await.unwrap();
      assert!(matches!(
         manager.active_device(Profile::A2dp).await,
         Err(LinkError::ManagerShutdown)
      ));
   }
}
