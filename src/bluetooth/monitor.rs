//! Adapter and device monitoring.
//!
//! Turns BlueZ adapter and device property changes into stack events for
//! the profile services, bond updates for the policy and adapter power
//! notifications for the active device manager.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use rand::Rng;
use tokio::{sync::mpsc, task::JoinHandle, time};

use crate::{
   bluetooth::bluez::{BluezPolicy, deliver, established},
   event::{EventSender, Notification},
   profile::{
      interface::{RawConnectionState, StackEvent},
      service::ProfileServices,
   },
};

/// Base delay before re-subscribing to adapter events
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(2);
/// Maximum re-subscription delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

#[derive(Debug)]
enum MonitorCommand {
   Powered(bool),
   DeviceAdded(Address),
   DeviceRemoved(Address),
   DeviceConnected(Address, bool),
   DevicePaired(Address, bool),
   StreamLost,
   Restart,
}

/// Spawns the monitor for `adapter`.
pub fn spawn(
   adapter: Adapter,
   services: ProfileServices,
   policy: Arc<BluezPolicy>,
   events: EventSender,
) -> JoinHandle<()> {
   tokio::spawn(MonitorActor::new(adapter, services, policy, events).run())
}

struct MonitorActor {
   adapter: Adapter,
   services: ProfileServices,
   policy: Arc<BluezPolicy>,
   events: EventSender,
   loopback_rx: mpsc::Receiver<MonitorCommand>,
   loopback_tx: mpsc::Sender<MonitorCommand>,
   stream: Option<JoinHandle<()>>,
   watchers: HashMap<Address, JoinHandle<()>>,
   retry_count: u32,
}

impl MonitorActor {
   fn new(
      adapter: Adapter,
      services: ProfileServices,
      policy: Arc<BluezPolicy>,
      events: EventSender,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         adapter,
         services,
         policy,
         events,
         loopback_rx,
         loopback_tx,
         stream: None,
         watchers: HashMap::new(),
         retry_count: 0,
      }
   }

   async fn run(mut self) {
      info!("Monitoring adapter {}", self.adapter.name());
      self.start().await;

      while let Some(cmd) = self.loopback_rx.recv().await {
         self.handle_command(cmd).await;
      }

      if let Some(handle) = self.stream.take() {
         handle.abort();
      }
      for (_, handle) in self.watchers.drain() {
         handle.abort();
      }
   }

   async fn start(&mut self) {
      if let Some(handle) = self.stream.take() {
         handle.abort();
      }
      self.stream = Some(Self::start_adapter_stream(
         self.loopback_tx.clone(),
         self.adapter.clone(),
      ));
      self.sync_devices().await;
   }

   fn start_adapter_stream(
      loopback: mpsc::Sender<MonitorCommand>,
      adapter: Adapter,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
               warn!("Failed to get adapter events: {e}");
               let _ = loopback.send(MonitorCommand::StreamLost).await;
               return;
            },
         };

         while let Some(event) = events.next().await {
            let cmd = match event {
               AdapterEvent::DeviceAdded(addr) => MonitorCommand::DeviceAdded(addr),
               AdapterEvent::DeviceRemoved(addr) => MonitorCommand::DeviceRemoved(addr),
               AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
                  MonitorCommand::Powered(powered)
               },
               _ => continue,
            };
            if let Err(e) = loopback.send(cmd).await {
               warn!("Channel overflow sending adapter event: {e}");
            }
         }

         // If we exit the event loop, adapter is probably gone
         let _ = loopback.send(MonitorCommand::StreamLost).await;
      })
   }

   /// Rebuilds the bond cache and reports links that are already up.
   async fn sync_devices(&mut self) {
      let addresses = match self.adapter.device_addresses().await {
         Ok(addresses) => addresses,
         Err(e) => {
            warn!("Failed to list devices: {e}");
            return;
         },
      };
      self.retry_count = 0;

      let mut paired = HashSet::new();
      let mut connected = Vec::new();
      for addr in addresses {
         let Ok(device) = self.adapter.device(addr) else {
            continue;
         };
         if device.is_paired().await.unwrap_or(false) {
            paired.insert(addr);
         }
         if device.is_connected().await.unwrap_or(false) {
            connected.push(addr);
         }
         self.watch(addr);
      }
      info!(
         "Adapter {}: {} paired, {} connected",
         self.adapter.name(),
         paired.len(),
         connected.len()
      );
      self.policy.replace_bonded(paired);

      for addr in connected {
         self.report_connected(addr).await;
      }
   }

   fn watch(&mut self, addr: Address) {
      if self.watchers.get(&addr).is_some_and(|h| !h.is_finished()) {
         return;
      }
      let Ok(device) = self.adapter.device(addr) else {
         return;
      };
      let loopback = self.loopback_tx.clone();
      let handle = tokio::spawn(async move {
         let Ok(mut events) = device.events().await else {
            warn!("Failed to get events for {addr}");
            return;
         };
         while let Some(event) = events.next().await {
            let cmd = match event {
               DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) => {
                  MonitorCommand::DeviceConnected(addr, connected)
               },
               DeviceEvent::PropertyChanged(DeviceProperty::Paired(paired)) => {
                  MonitorCommand::DevicePaired(addr, paired)
               },
               _ => continue,
            };
            if loopback.send(cmd).await.is_err() {
               break;
            }
         }
      });
      self.watchers.insert(addr, handle);
   }

   async fn handle_command(&mut self, cmd: MonitorCommand) {
      debug!("Monitor: {cmd:?}");
      match cmd {
         MonitorCommand::Powered(powered) => {
            info!(
               "Adapter {} powered {}",
               self.adapter.name(),
               if powered { "on" } else { "off" }
            );
            self
               .events
               .emit(&Notification::AdapterStateChanged { powered });
            if powered {
               self.sync_devices().await;
            }
         },
         MonitorCommand::DeviceAdded(addr) => {
            self.watch(addr);
            if let Ok(device) = self.adapter.device(addr)
               && device.is_paired().await.unwrap_or(false)
            {
               self.policy.set_bonded(addr, true);
            }
         },
         MonitorCommand::DeviceRemoved(addr) => {
            if let Some(handle) = self.watchers.remove(&addr) {
               handle.abort();
            }
            self.policy.set_bonded(addr, false);
            self.services.bond_removed(addr).await;
         },
         MonitorCommand::DeviceConnected(addr, true) => {
            self.report_connected(addr).await;
         },
         MonitorCommand::DeviceConnected(addr, false) => {
            self.report_disconnected(addr).await;
         },
         MonitorCommand::DevicePaired(addr, paired) => {
            self.policy.set_bonded(addr, paired);
            if !paired {
               self.services.bond_removed(addr).await;
            }
         },
         MonitorCommand::StreamLost => {
            self.retry_count += 1;
            let delay = calc_retry_delay(self.retry_count);
            warn!(
               "Lost events of adapter {}, retrying in {delay:?}",
               self.adapter.name()
            );
            let loopback = self.loopback_tx.clone();
            tokio::spawn(async move {
               time::sleep(delay).await;
               let _ = loopback.send(MonitorCommand::Restart).await;
            });
         },
         MonitorCommand::Restart => {
            self.start().await;
         },
      }
   }

   /// Reports an established link on every profile the device offers.
   async fn report_connected(&self, addr: Address) {
      let Ok(device) = self.adapter.device(addr) else {
         return;
      };
      let uuids = device.uuids().await.ok().flatten().unwrap_or_default();
      for service in self.services.iter() {
         let profile = service.profile();
         if !uuids.contains(&profile.uuid()) {
            continue;
         }
         deliver(
            service,
            StackEvent::ConnectionStateChanged {
               peer: addr,
               state: established(profile),
            },
         )
         .await;
      }
   }

   async fn report_disconnected(&self, addr: Address) {
      for service in self.services.iter() {
         deliver(
            service,
            StackEvent::ConnectionStateChanged {
               peer: addr,
               state: RawConnectionState::Disconnected,
            },
         )
         .await;
      }
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let exponential = ADAPTER_RECOVERY_DELAY * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
