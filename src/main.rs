//! Bluetooth link service daemon.
//!
//! Tracks profile connections of paired devices through BlueZ and keeps
//! one active device per profile.

use std::{sync::Arc, time::Duration};

use bluer::Session;
use crossbeam::queue::SegQueue;
use log::{debug, info};
use tokio::{signal, sync::Notify, time};

use btlinkd::{
   active_device::ActiveDeviceManager,
   bluetooth::{
      bluez::{self, BluezInterface, BluezPolicy},
      monitor,
   },
   config::Config,
   error::Result,
   event::{Broadcaster, EventBus, Notification},
   profile::service::{ProfileCore, ProfileService, ProfileServices},
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btlinkd...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} profiles and {} blocked devices",
      config.profiles.len(),
      config.blocked_devices.len()
   );

   let session = Session::new().await?;
   let adapter = match &config.adapter {
      Some(name) => session.adapter(name.as_str())?,
      None => session.default_adapter().await?,
   };
   info!("Using adapter {}", adapter.name());

   // Create event channel
   let broadcaster = Broadcaster::new();
   let event_log = EventProcessor::new();
   broadcaster.register(event_log.clone());
   event_log.spawn_dispatcher();

   let policy = BluezPolicy::new(config.clone());

   // One service per profile, each with its own BlueZ request channel
   let mut services = ProfileServices::new();
   for &profile in &config.profiles {
      let (native, stack_events) = BluezInterface::new(profile, adapter.clone());
      let core = ProfileCore::new(
         profile,
         &config,
         native,
         policy.clone(),
         broadcaster.clone(),
      );
      let service = ProfileService::spawn(core);
      tokio::spawn(bluez::pump(stack_events, service.clone()));
      services.insert(service);
   }

   let manager = ActiveDeviceManager::spawn(config.correlation_window(), Arc::new(services.clone()));
   broadcaster.register(manager.clone());

   let monitor = monitor::spawn(adapter, services.clone(), policy, broadcaster.clone());

   info!("btlinkd started");

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down btlinkd...");

   if let Ok(snapshot) = manager.snapshot().await {
      debug!("Active devices at shutdown: {snapshot}");
   }
   debug!("Profiles at shutdown: {}", services.snapshot());

   monitor.abort();
   services.shutdown().await;
   let _ = manager.shutdown().await;

   Ok(())
}

/// Logs every notification from a queue drained off the emitting task.
struct EventProcessor {
   queue: SegQueue<Notification>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<Notification> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn spawn_dispatcher(self: &Arc<Self>) {
      let this = self.clone();
      tokio::spawn(async move {
         while let Some(event) = this.recv().await {
            info!("event: {}", event.to_json());
         }
      });
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, notification: &Notification) {
      self.queue.push(*notification);
      self.notifier.notify_waiters();
   }
}
