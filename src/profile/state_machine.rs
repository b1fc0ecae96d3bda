//! Per-device connection state machine.
//!
//! Decisions are made by [`transition`], a pure function from the current
//! [`DeviceState`] and one [`Input`] to the next state plus a list of
//! [`Effect`]s. [`StateMachine`] is the record kept for one peer: it owns
//! the deferred command queue and the timer generations, and executes the
//! effects against an [`Environment`].

use std::{collections::VecDeque, time::Instant};

use log::{debug, info, warn};
use serde_json::json;
use smallvec::SmallVec;

use crate::{
   error::RejectReason,
   profile::{
      AudioPhase, ConnectionPhase, PeerIdentity, Profile,
      interface::{LinkSignal, RawAudioState},
   },
};

/// Local commands accepted by a state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
   Connect,
   Disconnect,
   ConnectAudio,
   DisconnectAudio,
}

impl Command {
   pub const fn is_audio(self) -> bool {
      matches!(self, Self::ConnectAudio | Self::DisconnectAudio)
   }
}

/// Outbound controller request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Request {
   Connect,
   Disconnect,
   ConnectAudio,
   DisconnectAudio,
}

/// Timeouts tracked per peer; at most one of each kind is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TimerKind {
   Connection,
   Audio,
}

impl TimerKind {
   const fn slot(self) -> usize {
      match self {
         Self::Connection => 0,
         Self::Audio => 1,
      }
   }
}

/// Everything a state machine can be asked to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
   Command(Command),
   Link(LinkSignal),
   Audio(RawAudioState),
   Timeout(TimerKind),
   /// The controller refused a request issued by a previous step.
   RequestRefused(Request),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceState {
   pub connection: ConnectionPhase,
   pub audio: AudioPhase,
}

impl DeviceState {
   pub const fn new(connection: ConnectionPhase, audio: AudioPhase) -> Self {
      Self { connection, audio }
   }

   pub const fn is_idle(self) -> bool {
      matches!(self.connection, ConnectionPhase::Disconnected)
         && matches!(self.audio, AudioPhase::Idle)
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
   Request(Request),
   ArmTimer(TimerKind),
   CancelTimer(TimerKind),
   ConnectionChanged {
      previous: ConnectionPhase,
      new: ConnectionPhase,
   },
   AudioChanged {
      previous: AudioPhase,
      new: AudioPhase,
   },
}

pub type Effects = SmallVec<[Effect; 6]>;

/// How an input was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
   Transitioned,
   /// Accepted, nothing to do in this phase.
   Unchanged,
   /// Queued until the next transition.
   Deferred,
   /// Not meaningful in this phase; dropped.
   Ignored,
   Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
   pub state: DeviceState,
   pub effects: Effects,
   pub outcome: Outcome,
}

const fn needs_connection_timer(phase: ConnectionPhase) -> bool {
   matches!(
      phase,
      ConnectionPhase::Connecting | ConnectionPhase::Disconnecting
   )
}

const fn needs_audio_timer(phase: AudioPhase) -> bool {
   matches!(
      phase,
      AudioPhase::AudioConnecting | AudioPhase::AudioDisconnecting
   )
}

struct Plan {
   initial: DeviceState,
   state: DeviceState,
   notifications: Effects,
   requests: SmallVec<[Request; 2]>,
}

impl Plan {
   fn new(state: DeviceState) -> Self {
      Self {
         initial: state,
         state,
         notifications: Effects::new(),
         requests: SmallVec::new(),
      }
   }

   fn connection(&mut self, new: ConnectionPhase) {
      let previous = self.state.connection;
      if previous == new {
         return;
      }
      // Audio never outlives the link.
      if previous == ConnectionPhase::Connected {
         self.audio(AudioPhase::Idle);
      }
      self.state.connection = new;
      self
         .notifications
         .push(Effect::ConnectionChanged { previous, new });
   }

   fn audio(&mut self, new: AudioPhase) {
      let previous = self.state.audio;
      if previous == new {
         return;
      }
      self.state.audio = new;
      self.notifications.push(Effect::AudioChanged { previous, new });
   }

   fn request(&mut self, request: Request) {
      self.requests.push(request);
   }

   fn finish(self, outcome: Outcome) -> Step {
      let Self {
         initial,
         state,
         mut notifications,
         requests,
      } = self;

      if initial.connection != state.connection {
         if needs_connection_timer(initial.connection) {
            notifications.push(Effect::CancelTimer(TimerKind::Connection));
         }
         if needs_connection_timer(state.connection) {
            notifications.push(Effect::ArmTimer(TimerKind::Connection));
         }
      }
      if initial.audio != state.audio {
         if needs_audio_timer(initial.audio) {
            notifications.push(Effect::CancelTimer(TimerKind::Audio));
         }
         if needs_audio_timer(state.audio) {
            notifications.push(Effect::ArmTimer(TimerKind::Audio));
         }
      }
      notifications.extend(requests.into_iter().map(Effect::Request));

      Step {
         state,
         effects: notifications,
         outcome,
      }
   }
}

/// Computes the next state and effects for one input.
///
/// `ok_to_connect` is only consulted when the input would open a link.
pub fn transition(
   state: DeviceState,
   input: Input,
   ok_to_connect: &mut dyn FnMut() -> bool,
) -> Step {
   use ConnectionPhase::{Connected, Connecting, Disconnected, Disconnecting};

   let mut plan = Plan::new(state);
   let outcome = match (state.connection, input) {
      // Local commands
      (Disconnected, Input::Command(Command::Connect)) => {
         if ok_to_connect() {
            plan.connection(Connecting);
            plan.request(Request::Connect);
            Outcome::Transitioned
         } else {
            Outcome::Rejected(RejectReason::Policy)
         }
      },
      (Disconnected, Input::Command(Command::Disconnect)) => Outcome::Ignored,
      (
         Disconnected | Disconnecting,
         Input::Command(Command::ConnectAudio | Command::DisconnectAudio),
      ) => Outcome::Rejected(RejectReason::NotConnected),
      (Connecting, Input::Command(Command::Disconnect)) => {
         plan.connection(Disconnected);
         plan.request(Request::Disconnect);
         Outcome::Transitioned
      },
      (Connecting | Disconnecting, Input::Command(_)) => Outcome::Deferred,
      (Connected, Input::Command(Command::Connect)) => Outcome::Ignored,
      (Connected, Input::Command(Command::Disconnect)) => {
         plan.connection(Disconnecting);
         plan.request(Request::Disconnect);
         Outcome::Transitioned
      },
      (Connected, Input::Command(Command::ConnectAudio)) => match state.audio {
         AudioPhase::Idle => {
            plan.audio(AudioPhase::AudioConnecting);
            plan.request(Request::ConnectAudio);
            Outcome::Transitioned
         },
         AudioPhase::AudioDisconnecting => Outcome::Deferred,
         AudioPhase::AudioConnecting | AudioPhase::AudioOn => Outcome::Ignored,
      },
      (Connected, Input::Command(Command::DisconnectAudio)) => match state.audio {
         AudioPhase::AudioOn => {
            plan.audio(AudioPhase::AudioDisconnecting);
            plan.request(Request::DisconnectAudio);
            Outcome::Transitioned
         },
         AudioPhase::AudioConnecting => Outcome::Deferred,
         AudioPhase::Idle | AudioPhase::AudioDisconnecting => Outcome::Ignored,
      },

      // Controller link signals
      (Disconnected | Disconnecting, Input::Link(LinkSignal::Connecting)) => {
         incoming(&mut plan, Connecting, ok_to_connect)
      },
      (Disconnected | Disconnecting, Input::Link(LinkSignal::Connected)) => {
         incoming(&mut plan, Connected, ok_to_connect)
      },
      (Disconnected, Input::Link(LinkSignal::Disconnected | LinkSignal::Disconnecting)) => {
         Outcome::Ignored
      },
      (Connecting | Disconnecting, Input::Link(LinkSignal::Disconnected)) => {
         plan.connection(Disconnected);
         Outcome::Transitioned
      },
      (Connecting, Input::Link(LinkSignal::Connected)) => {
         plan.connection(Connected);
         Outcome::Transitioned
      },
      (Connecting | Connected, Input::Link(LinkSignal::Disconnecting)) => {
         plan.connection(Disconnecting);
         Outcome::Transitioned
      },
      (Connected, Input::Link(LinkSignal::Disconnected)) => {
         plan.connection(Disconnecting);
         plan.connection(Disconnected);
         Outcome::Transitioned
      },
      (Connecting, Input::Link(LinkSignal::Connecting))
      | (Connected, Input::Link(LinkSignal::Connecting | LinkSignal::Connected))
      | (Disconnecting, Input::Link(LinkSignal::Disconnecting)) => Outcome::Unchanged,

      // Audio channel signals
      (Connected, Input::Audio(raw)) => audio_signal(&mut plan, state.audio, raw),
      (_, Input::Audio(RawAudioState::Disconnected)) => Outcome::Unchanged,
      (_, Input::Audio(_)) => Outcome::Ignored,

      // Timeouts
      (Connecting, Input::Timeout(TimerKind::Connection)) => {
         plan.connection(Disconnected);
         plan.request(Request::Disconnect);
         Outcome::Transitioned
      },
      (Disconnecting, Input::Timeout(TimerKind::Connection)) => {
         plan.connection(Disconnected);
         Outcome::Transitioned
      },
      (Connected, Input::Timeout(TimerKind::Audio)) if needs_audio_timer(state.audio) => {
         plan.audio(AudioPhase::Idle);
         Outcome::Transitioned
      },
      (_, Input::Timeout(_)) => Outcome::Ignored,

      // Controller refused a request synchronously
      (Connecting, Input::RequestRefused(Request::Connect))
      | (Disconnecting, Input::RequestRefused(Request::Disconnect)) => {
         plan.connection(Disconnected);
         Outcome::Transitioned
      },
      (Connected, Input::RequestRefused(Request::ConnectAudio))
         if state.audio == AudioPhase::AudioConnecting =>
      {
         plan.audio(AudioPhase::Idle);
         Outcome::Transitioned
      },
      (Connected, Input::RequestRefused(Request::DisconnectAudio))
         if state.audio == AudioPhase::AudioDisconnecting =>
      {
         plan.audio(AudioPhase::AudioOn);
         Outcome::Transitioned
      },
      (_, Input::RequestRefused(_)) => Outcome::Ignored,
   };

   plan.finish(outcome)
}

fn incoming(
   plan: &mut Plan,
   target: ConnectionPhase,
   ok_to_connect: &mut dyn FnMut() -> bool,
) -> Outcome {
   if ok_to_connect() {
      plan.connection(target);
      Outcome::Transitioned
   } else {
      plan.request(Request::Disconnect);
      Outcome::Rejected(RejectReason::Policy)
   }
}

fn audio_signal(plan: &mut Plan, current: AudioPhase, raw: RawAudioState) -> Outcome {
   let next = match (current, raw) {
      (AudioPhase::Idle, RawAudioState::Connecting) => AudioPhase::AudioConnecting,
      (
         AudioPhase::Idle | AudioPhase::AudioConnecting | AudioPhase::AudioDisconnecting,
         RawAudioState::Connected,
      ) => AudioPhase::AudioOn,
      (AudioPhase::AudioOn, RawAudioState::Disconnecting) => AudioPhase::AudioDisconnecting,
      (
         AudioPhase::AudioConnecting | AudioPhase::AudioOn | AudioPhase::AudioDisconnecting,
         RawAudioState::Disconnected,
      ) => AudioPhase::Idle,
      (AudioPhase::Idle, RawAudioState::Disconnected)
      | (AudioPhase::AudioConnecting, RawAudioState::Connecting)
      | (AudioPhase::AudioOn, RawAudioState::Connected)
      | (AudioPhase::AudioDisconnecting, RawAudioState::Disconnecting) => {
         return Outcome::Unchanged;
      },
      _ => return Outcome::Ignored,
   };
   plan.audio(next);
   Outcome::Transitioned
}

/// Side-effect executor for a [`StateMachine`].
pub trait Environment {
   fn ok_to_connect(&mut self, peer: PeerIdentity) -> bool;
   /// Issues a controller request, returning whether it was accepted.
   fn request(&mut self, peer: PeerIdentity, request: Request) -> bool;
   fn arm_timer(&mut self, peer: PeerIdentity, kind: TimerKind, generation: u64);
   fn cancel_timer(&mut self, peer: PeerIdentity, kind: TimerKind);
   fn connection_changed(
      &mut self,
      peer: PeerIdentity,
      previous: ConnectionPhase,
      new: ConnectionPhase,
   );
   fn audio_changed(&mut self, peer: PeerIdentity, previous: AudioPhase, new: AudioPhase);
}

enum Pending {
   Input(Input),
   Replay,
}

/// Connection record of one peer on one profile.
#[derive(Debug)]
pub struct StateMachine {
   peer: PeerIdentity,
   profile: Profile,
   state: DeviceState,
   connecting_since: Option<Instant>,
   deferred: VecDeque<Command>,
   timers: [Option<u64>; 2],
   next_generation: u64,
   release_pending: bool,
}

impl StateMachine {
   pub fn new(peer: PeerIdentity, profile: Profile) -> Self {
      debug!("{profile}: new state machine for {peer}");
      Self {
         peer,
         profile,
         state: DeviceState::default(),
         connecting_since: None,
         deferred: VecDeque::new(),
         timers: [None; 2],
         next_generation: 0,
         release_pending: false,
      }
   }

   pub const fn peer(&self) -> PeerIdentity {
      self.peer
   }

   pub const fn profile(&self) -> Profile {
      self.profile
   }

   pub const fn state(&self) -> DeviceState {
      self.state
   }

   pub const fn connection_phase(&self) -> ConnectionPhase {
      self.state.connection
   }

   pub const fn audio_phase(&self) -> AudioPhase {
      self.state.audio
   }

   pub const fn is_connected(&self) -> bool {
      matches!(self.state.connection, ConnectionPhase::Connected)
   }

   pub const fn connecting_since(&self) -> Option<Instant> {
      self.connecting_since
   }

   pub fn deferred(&self) -> impl ExactSizeIterator<Item = Command> + '_ {
      self.deferred.iter().copied()
   }

   /// Generation of the armed timer of `kind`, if any.
   pub const fn armed_timer(&self, kind: TimerKind) -> Option<u64> {
      self.timers[kind.slot()]
   }

   /// Marks the record for release once it is idle again.
   pub const fn mark_release_pending(&mut self) {
      self.release_pending = true;
   }

   pub const fn is_release_pending(&self) -> bool {
      self.release_pending
   }

   /// Consumes a command or controller signal.
   ///
   /// Timeouts must go through [`StateMachine::on_timeout`] so stale
   /// expirations are filtered.
   pub fn process(&mut self, input: Input, env: &mut dyn Environment) -> Outcome {
      let mut pending = VecDeque::from([Pending::Input(input)]);
      let mut outcome = None;

      while let Some(item) = pending.pop_front() {
         let (input, replayed) = match item {
            Pending::Input(input) => (input, false),
            Pending::Replay => match self.deferred.pop_front() {
               Some(command) => {
                  debug!(
                     "{}: replaying deferred {command} for {}",
                     self.profile, self.peer
                  );
                  (Input::Command(command), true)
               },
               None => continue,
            },
         };

         let peer = self.peer;
         let step = transition(self.state, input, &mut || env.ok_to_connect(peer));
         self.log_step(input, &step);

         if step.outcome == Outcome::Deferred
            && let Input::Command(command) = input
         {
            if replayed {
               self.deferred.push_front(command);
            } else {
               self.deferred.push_back(command);
            }
         }

         let changed = step.state != self.state;
         self.state = step.state;
         let mut refused = false;
         for effect in step.effects {
            if let Some(request) = self.execute(effect, env) {
               refused = true;
               pending.push_back(Pending::Input(Input::RequestRefused(request)));
            }
         }
         debug_assert!(
            self.is_connected() || self.state.audio == AudioPhase::Idle,
            "audio active without a link"
         );

         if outcome.is_none() {
            outcome = Some(if refused && step.outcome == Outcome::Transitioned {
               Outcome::Rejected(RejectReason::Controller)
            } else {
               step.outcome
            });
         }

         if changed {
            self.discard_stale_deferred();
            pending.push_back(Pending::Replay);
         } else if replayed && step.outcome != Outcome::Deferred {
            // Consumed without effect, so the next one may apply now.
            pending.push_back(Pending::Replay);
         }
      }

      outcome.unwrap_or(Outcome::Ignored)
   }

   /// Consumes a timer expiration armed with `generation`.
   pub fn on_timeout(
      &mut self,
      kind: TimerKind,
      generation: u64,
      env: &mut dyn Environment,
   ) -> Outcome {
      if self.timers[kind.slot()] != Some(generation) {
         debug!(
            "{}: stale {kind} timeout #{generation} for {}",
            self.profile, self.peer
         );
         return Outcome::Ignored;
      }
      self.timers[kind.slot()] = None;
      warn!(
         "{}: {kind} timeout for {} in {}/{}",
         self.profile, self.peer, self.state.connection, self.state.audio
      );
      self.process(Input::Timeout(kind), env)
   }

   /// Disarms every pending timer.
   pub fn cancel_timers(&mut self, env: &mut dyn Environment) {
      for kind in [TimerKind::Connection, TimerKind::Audio] {
         if self.timers[kind.slot()].take().is_some() {
            env.cancel_timer(self.peer, kind);
         }
      }
   }

   fn execute(&mut self, effect: Effect, env: &mut dyn Environment) -> Option<Request> {
      match effect {
         Effect::Request(request) => {
            if !env.request(self.peer, request) {
               warn!(
                  "{}: controller refused {request} for {}",
                  self.profile, self.peer
               );
               return Some(request);
            }
         },
         Effect::ArmTimer(kind) => {
            if self.timers[kind.slot()].take().is_some() {
               env.cancel_timer(self.peer, kind);
            }
            self.next_generation += 1;
            self.timers[kind.slot()] = Some(self.next_generation);
            env.arm_timer(self.peer, kind, self.next_generation);
         },
         Effect::CancelTimer(kind) => {
            if self.timers[kind.slot()].take().is_some() {
               env.cancel_timer(self.peer, kind);
            }
         },
         Effect::ConnectionChanged { previous, new } => {
            info!(
               "{}: {} connection {previous} -> {new}",
               self.profile, self.peer
            );
            if new == ConnectionPhase::Connecting {
               self.connecting_since = Some(Instant::now());
            } else if previous == ConnectionPhase::Connecting {
               self.connecting_since = None;
            }
            env.connection_changed(self.peer, previous, new);
         },
         Effect::AudioChanged { previous, new } => {
            info!("{}: {} audio {previous} -> {new}", self.profile, self.peer);
            env.audio_changed(self.peer, previous, new);
         },
      }
      None
   }

   fn discard_stale_deferred(&mut self) {
      let before = self.deferred.len();
      match self.state.connection {
         ConnectionPhase::Connected => {
            self.deferred.retain(|c| *c != Command::Connect);
         },
         ConnectionPhase::Disconnected => {
            self
               .deferred
               .retain(|c| *c != Command::Disconnect && !c.is_audio());
         },
         ConnectionPhase::Connecting | ConnectionPhase::Disconnecting => {},
      }
      let dropped = before - self.deferred.len();
      if dropped > 0 {
         debug!(
            "{}: dropped {dropped} deferred commands for {} now {}",
            self.profile, self.peer, self.state.connection
         );
      }
   }

   fn log_step(&self, input: Input, step: &Step) {
      match step.outcome {
         Outcome::Transitioned | Outcome::Unchanged => {},
         Outcome::Deferred => debug!(
            "{}: deferring {input:?} for {} in {}",
            self.profile, self.peer, self.state.connection
         ),
         Outcome::Ignored => warn!(
            "{}: {input:?} ignored for {} in {}/{}",
            self.profile, self.peer, self.state.connection, self.state.audio
         ),
         Outcome::Rejected(reason) => warn!(
            "{}: {input:?} for {} rejected: {reason}",
            self.profile, self.peer
         ),
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.peer.to_string(),
         "connection": self.state.connection.to_string(),
         "audio": self.state.audio.to_string(),
         "connecting_for_ms": self
            .connecting_since
            .map(|t| t.elapsed().as_millis() as u64),
         "deferred": self.deferred.iter().map(ToString::to_string).collect::<Vec<_>>(),
         "release_pending": self.release_pending,
      })
   }
}
