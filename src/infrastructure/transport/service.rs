//! Remote Service Module
//!
//! Main service that coordinates the connection slots, their reconnection
//! policies, press disambiguation and command routing for the active remote.

use crate::domain::error::RemoteError;
use crate::domain::models::{
    AppEvent, ConnectionState, DeviceId, KeyMapping, LearnedCommand, MappingMode,
    MessageSeverity, PressEvent, RawCommand, RemoteDevice, StatusMessage, TransportAddress,
    TransportKind,
};
use crate::domain::press::PressDisambiguator;
use crate::domain::registry::DeviceRegistry;
use crate::domain::router::{ActionDispatcher, CommandRouter};
use crate::domain::settings::{
    session_context, ContextPublisher, GlobalSettings, RemoteConfig, SessionContext,
};
use crate::infrastructure::transport::connection::{
    ConnectionConfig, ConnectionHandle, ConnectionStateMachine,
};
use crate::infrastructure::transport::reconnect::ReconnectionPolicy;
use crate::infrastructure::transport::scanner::DiscoverySnapshot;
use crate::infrastructure::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Slot {
    policy: ReconnectionPolicy,
    worker: Option<JoinHandle<()>>,
}

impl Slot {
    /// Stop supervising and drop whatever link the slot holds.
    fn release(&mut self) {
        self.policy.cancel();
        if let Err(e) = self.policy.connection().disconnect() {
            debug!("{} slot already stopped: {}", self.policy.connection().kind(), e);
        }
    }
}

/// Main service coordinating all remote operations
pub struct RemoteService {
    registry: Arc<dyn DeviceRegistry>,
    router: Arc<CommandRouter>,
    publisher: ContextPublisher,
    context: SessionContext,
    slots: HashMap<TransportKind, Slot>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    pipeline: JoinHandle<()>,
    routing: JoinHandle<()>,
}

impl RemoteService {
    /// Loads the stored settings and starts one connection worker per
    /// transport. Nothing connects until [`Self::start`].
    pub async fn new(
        registry: Arc<dyn DeviceRegistry>,
        dispatcher: Arc<dyn ActionDispatcher>,
        transports: Vec<Arc<dyn Transport>>,
        config: ConnectionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self, RemoteError> {
        let stored = registry.load().await?;
        let (publisher, context) = session_context(stored.settings.clone());
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let mut slots = HashMap::new();
        for transport in transports {
            let kind = transport.kind();
            if slots.contains_key(&kind) {
                warn!("Second {} transport ignored", kind);
                continue;
            }
            let (connection, worker) = ConnectionStateMachine::spawn(
                transport,
                config.clone(),
                raw_tx.clone(),
                event_sender.clone(),
            );
            slots.insert(
                kind,
                Slot {
                    policy: ReconnectionPolicy::new(connection, publisher.subscribe()),
                    worker: Some(worker),
                },
            );
        }
        drop(raw_tx);

        let router = Arc::new(CommandRouter::new(
            registry.clone(),
            dispatcher,
            publisher.subscribe(),
        ));
        let (press_tx, press_rx) = mpsc::unbounded_channel();
        let pipeline = tokio::spawn(run_press_pipeline(raw_rx, press_tx, context.clone()));
        let routing = tokio::spawn(run_routing(press_rx, router.clone(), event_sender.clone()));

        info!("Remote service ready with {} transports", slots.len());
        Ok(Self {
            registry,
            router,
            publisher,
            context,
            slots,
            event_sender,
            pipeline,
            routing,
        })
    }

    /// Connects to the active remote, if one is configured.
    pub async fn start(&mut self) -> Result<(), RemoteError> {
        let config = self.registry.load().await?;
        match config.active_device() {
            Some(device) => {
                info!("Starting with active remote '{}'", device.name);
                self.follow(device);
            }
            None => info!("No active remote configured"),
        }
        Ok(())
    }

    pub fn set_riding(&self, riding: bool) {
        info!("Ride {}", if riding { "started" } else { "stopped" });
        self.publisher.set_riding(riding);
    }

    pub fn is_riding(&self) -> bool {
        self.context.is_riding()
    }

    pub fn settings(&self) -> GlobalSettings {
        self.context.settings()
    }

    pub async fn update_settings(
        &mut self,
        settings: GlobalSettings,
    ) -> Result<GlobalSettings, RemoteError> {
        let config = self.registry.update_settings(settings).await?;
        let settings = config.settings.clone();
        self.publisher.publish_settings(settings.clone());
        info!("Settings updated");

        if !settings.auto_reconnect {
            for slot in self.slots.values_mut() {
                slot.policy.cancel();
            }
        } else if let Some(device) = config.active_device() {
            if let Some(slot) = self.slots.get_mut(&device.transport) {
                if !slot.policy.is_monitoring() {
                    slot.policy.monitor(device.address.clone());
                }
            }
        }
        Ok(settings)
    }

    pub async fn add_device(&mut self, device: RemoteDevice) -> Result<RemoteConfig, RemoteError> {
        let previous = self.active_id().await?;
        info!("Adding remote '{}' ({})", device.name, device.id);
        let config = self.registry.add_device(device).await?;
        self.follow_if_changed(previous, &config);
        Ok(config)
    }

    /// Adds a remote picked from the discovered list.
    pub async fn pair_discovered(
        &mut self,
        kind: TransportKind,
        address: TransportAddress,
        name: &str,
    ) -> Result<RemoteConfig, RemoteError> {
        if address.kind().map_or(false, |k| k != kind) {
            return Err(RemoteError::Configuration(format!(
                "{} cannot pair with {} address {}",
                kind,
                address.kind().map_or("unknown".to_string(), |k| k.to_string()),
                address
            )));
        }
        let name = if name.trim().is_empty() {
            format!("{} remote {}", kind, address)
        } else {
            name.trim().to_string()
        };
        self.add_device(RemoteDevice::new(name, kind, address)).await
    }

    pub async fn remove_device(&mut self, id: &DeviceId) -> Result<RemoteConfig, RemoteError> {
        let previous = self.active_id().await?;
        let config = self.registry.remove_device(id).await?;
        info!("Removed remote {}", id);
        if self.router.learning().as_ref() == Some(id) {
            self.router.set_learning(None);
        }
        self.follow_if_changed(previous, &config);
        Ok(config)
    }

    pub async fn activate(&mut self, id: &DeviceId) -> Result<RemoteConfig, RemoteError> {
        let previous = self.active_id().await?;
        let config = self.registry.set_active(id).await?;
        self.follow_if_changed(previous, &config);
        Ok(config)
    }

    pub async fn update_key_mapping(
        &self,
        id: &DeviceId,
        mapping: KeyMapping,
    ) -> Result<RemoteConfig, RemoteError> {
        self.registry.update_key_mapping(id, mapping).await
    }

    pub async fn set_mapping_mode(
        &self,
        id: &DeviceId,
        mode: MappingMode,
    ) -> Result<RemoteConfig, RemoteError> {
        self.registry.set_mapping_mode(id, mode).await
    }

    pub async fn update_learned_commands(
        &self,
        id: &DeviceId,
        commands: Vec<LearnedCommand>,
    ) -> Result<RemoteConfig, RemoteError> {
        self.registry.update_learned_commands(id, commands).await
    }

    /// Record presses of `id` instead of dispatching them. Only takes effect
    /// while `id` is the active remote.
    pub async fn start_learning(&self, id: &DeviceId) -> Result<(), RemoteError> {
        let config = self.registry.load().await?;
        let device = config
            .device(id)
            .ok_or_else(|| RemoteError::UnknownDevice(id.to_string()))?;
        info!("Learning commands for '{}'", device.name);
        self.notify(
            format!("Press buttons on {} to learn them", device.name),
            MessageSeverity::Info,
        );
        self.router.set_learning(Some(id.clone()));
        Ok(())
    }

    pub fn stop_learning(&self) {
        if self.router.learning().is_some() {
            info!("Learning stopped");
        }
        self.router.set_learning(None);
    }

    pub fn learning(&self) -> Option<DeviceId> {
        self.router.learning()
    }

    pub fn start_scan(&self, kind: TransportKind) -> Result<(), RemoteError> {
        self.connection(kind)?.start_scan()
    }

    pub fn stop_scan(&self, kind: TransportKind) -> Result<(), RemoteError> {
        self.connection(kind)?.stop_scan()
    }

    pub fn discovered(&self, kind: TransportKind) -> Result<DiscoverySnapshot, RemoteError> {
        Ok(self.connection(kind)?.discovered())
    }

    pub fn connection_state(&self, kind: TransportKind) -> Option<ConnectionState> {
        self.slots.get(&kind).map(|slot| slot.policy.connection().state())
    }

    pub fn last_error(&self, kind: TransportKind) -> Option<RemoteError> {
        self.slots
            .get(&kind)
            .and_then(|slot| slot.policy.connection().last_error())
    }

    pub fn connection(&self, kind: TransportKind) -> Result<&ConnectionHandle, RemoteError> {
        self.slots
            .get(&kind)
            .map(|slot| slot.policy.connection())
            .ok_or_else(|| RemoteError::TransportUnavailable(format!("no {} transport", kind)))
    }

    /// Cancels every monitor, stops the workers and waits for them to
    /// release their transport handles.
    pub async fn shutdown(&mut self) {
        info!("Shutting down remote service");
        for slot in self.slots.values_mut() {
            slot.policy.cancel();
            let _ = slot.policy.connection().shutdown();
        }
        for (kind, slot) in self.slots.iter_mut() {
            if let Some(worker) = slot.worker.take() {
                if let Err(e) = worker.await {
                    warn!("{} worker ended abnormally: {}", kind, e);
                }
            }
        }
        self.pipeline.abort();
        self.routing.abort();
    }

    async fn active_id(&self) -> Result<Option<DeviceId>, RemoteError> {
        Ok(self
            .registry
            .load()
            .await?
            .active_device()
            .map(|device| device.id.clone()))
    }

    fn follow_if_changed(&mut self, previous: Option<DeviceId>, config: &RemoteConfig) {
        let current = config.active_device();
        if current.map(|device| &device.id) == previous.as_ref() {
            return;
        }
        match current {
            Some(device) => {
                info!("Active remote is now '{}'", device.name);
                self.follow(device);
            }
            None => {
                info!("No remote left to follow");
                for slot in self.slots.values_mut() {
                    slot.release();
                }
            }
        }
    }

    /// Point the connections at `device`: every other slot is released, the
    /// device's own slot connects and is monitored.
    fn follow(&mut self, device: &RemoteDevice) {
        if !self.slots.contains_key(&device.transport) {
            warn!("No {} transport for '{}'", device.transport, device.name);
            self.notify(
                format!("{} is not available for {}", device.transport, device.name),
                MessageSeverity::Error,
            );
            return;
        }

        for (kind, slot) in self.slots.iter_mut() {
            if *kind == device.transport {
                slot.policy.start(device.address.clone());
            } else {
                slot.release();
            }
        }
    }

    fn notify(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

impl Drop for RemoteService {
    fn drop(&mut self) {
        for slot in self.slots.values_mut() {
            slot.policy.cancel();
            if let Some(worker) = slot.worker.take() {
                worker.abort();
            }
        }
        self.pipeline.abort();
        self.routing.abort();
    }
}

/// Raw commands -> disambiguator. Signals are timestamped as soon as they
/// arrive; routing runs on its own task so a slow registry read cannot delay
/// them. The double-tap window follows the current settings.
async fn run_press_pipeline(
    mut raw_commands: mpsc::UnboundedReceiver<RawCommand>,
    presses: mpsc::UnboundedSender<PressEvent>,
    context: SessionContext,
) {
    let mut disambiguator =
        PressDisambiguator::new(context.settings().double_tap_timeout(), presses);

    while let Some(command) = raw_commands.recv().await {
        let timeout = context.settings().double_tap_timeout();
        if timeout != disambiguator.timeout() {
            debug!("Double-tap window now {:?}", timeout);
            disambiguator.set_timeout(timeout);
        }
        disambiguator.handle(command);
    }
    debug!("Press pipeline stopped");
}

/// Disambiguated presses -> router -> event feed, one press at a time.
async fn run_routing(
    mut presses: mpsc::UnboundedReceiver<PressEvent>,
    router: Arc<CommandRouter>,
    events: mpsc::UnboundedSender<AppEvent>,
) {
    while let Some(press) = presses.recv().await {
        let outcome = router.route(press.command, press.press).await;
        let _ = events.send(AppEvent::Routed {
            event: press,
            outcome,
        });
    }
    debug!("Press routing stopped");
}
