//! Command Router
//!
//! Maps disambiguated presses from the active remote to host actions. This is
//! the only place the "only while riding" gate is applied.

use crate::domain::error::RemoteError;
use crate::domain::keymap;
use crate::domain::models::{
    DeviceId, HostAction, LearnedCommand, MappingMode, PressType, RawCommand, RouteOutcome,
};
use crate::domain::registry::DeviceRegistry;
use crate::domain::settings::SessionContext;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Sink for host actions on the bike computer.
pub trait ActionDispatcher: Send + Sync {
    fn dispatch(&self, action: HostAction) -> Result<(), RemoteError>;

    /// Extra host call needed to bring the map page up.
    fn show_map_page(&self) -> Result<(), RemoteError>;
}

pub struct CommandRouter {
    registry: Arc<dyn DeviceRegistry>,
    dispatcher: Arc<dyn ActionDispatcher>,
    context: SessionContext,
    learning: Mutex<Option<DeviceId>>,
}

impl CommandRouter {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        dispatcher: Arc<dyn ActionDispatcher>,
        context: SessionContext,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            context,
            learning: Mutex::new(None),
        }
    }

    /// Capture presses of `device` into its learned-command list instead of
    /// dispatching them. `None` ends learning.
    pub fn set_learning(&self, device: Option<DeviceId>) {
        let mut learning = self
            .learning
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *learning = device;
    }

    pub fn learning(&self) -> Option<DeviceId> {
        self.learning
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn route(&self, command: RawCommand, press: PressType) -> RouteOutcome {
        if let Some(device_id) = self.learning() {
            if let Some(outcome) = self.capture(&device_id, command, press).await {
                return outcome;
            }
        }

        let settings = self.context.settings();
        if settings.only_while_riding && !self.context.is_riding() {
            debug!("Not riding, ignoring {:?} on {}", press, command);
            return RouteOutcome::DroppedNotRiding;
        }

        let config = match self.registry.load().await {
            Ok(config) => config,
            Err(e) => {
                warn!("Could not read device registry: {}", e);
                return RouteOutcome::DroppedNoActiveDevice;
            }
        };
        let Some(device) = config.active_device() else {
            debug!("No active remote, ignoring {}", command);
            return RouteOutcome::DroppedNoActiveDevice;
        };

        if device.transport != command.transport {
            debug!(
                "{} comes from {} but active remote '{}' is {}",
                command, command.transport, device.name, device.transport
            );
            return RouteOutcome::DroppedTransportMismatch;
        }

        let Some(button) = keymap::logical_button(command) else {
            warn!("Unmapped command {} from '{}'", command, device.name);
            return RouteOutcome::DroppedUnmapped;
        };

        let action = match device.mapping_mode {
            MappingMode::Direct => device.key_mapping.action(button, press),
            MappingMode::Learned => device.learned_action(command, press),
        };
        let Some(action) = action else {
            debug!("{:?} {:?} has no action on '{}'", button, press, device.name);
            return RouteOutcome::Unbound;
        };

        self.dispatch(action)
    }

    fn dispatch(&self, action: HostAction) -> RouteOutcome {
        info!("Dispatching host action: {}", action);
        if let Err(e) = self.dispatcher.dispatch(action) {
            error!("Host rejected {}: {}", action, e);
            return RouteOutcome::DispatchFailed(action);
        }

        if action == HostAction::ShowMap {
            if let Err(e) = self.dispatcher.show_map_page() {
                error!("Could not open map page: {}", e);
            }
        }
        RouteOutcome::Dispatched(action)
    }

    /// Records the press when learning targets the active remote. Returns
    /// `None` when routing should continue normally.
    async fn capture(
        &self,
        device_id: &DeviceId,
        command: RawCommand,
        press: PressType,
    ) -> Option<RouteOutcome> {
        let config = match self.registry.load().await {
            Ok(config) => config,
            Err(e) => {
                warn!("Could not read device registry while learning: {}", e);
                return None;
            }
        };
        let device = config.active_device().filter(|d| &d.id == device_id)?;
        if device.transport != command.transport {
            return None;
        }
        // only the three button codes can ever be routed back out
        if keymap::logical_button(command).is_none() {
            warn!("Not learning unmapped command {} from '{}'", command, device.name);
            return Some(RouteOutcome::DroppedUnmapped);
        }

        if device.has_learned(command, press) {
            debug!("{} {:?} already learned on '{}'", command, press, device.name);
            return Some(RouteOutcome::Learned);
        }

        let mut commands = device.learned_commands.clone();
        commands.push(LearnedCommand {
            command,
            press,
            action: None,
        });
        match self
            .registry
            .update_learned_commands(device_id, commands)
            .await
        {
            Ok(_) => info!("Learned {} {:?} on '{}'", command, press, device.name),
            Err(e) => error!("Could not store learned command: {}", e),
        }
        Some(RouteOutcome::Learned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::keymap::{ant, ble};
    use crate::domain::models::{RemoteDevice, TransportAddress, TransportKind};
    use crate::domain::settings::{session_context, ContextPublisher, GlobalSettings, RemoteConfig};
    use async_trait::async_trait;

    #[derive(Default)]
    struct TestRegistry {
        config: Mutex<RemoteConfig>,
    }

    #[async_trait]
    impl DeviceRegistry for TestRegistry {
        async fn load(&self) -> Result<RemoteConfig, RemoteError> {
            Ok(self.config.lock().unwrap().clone())
        }

        async fn store(&self, config: &RemoteConfig) -> Result<(), RemoteError> {
            *self.config.lock().unwrap() = config.clone();
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestDispatcher {
        actions: Mutex<Vec<HostAction>>,
        map_pages: Mutex<usize>,
        fail: bool,
    }

    impl ActionDispatcher for TestDispatcher {
        fn dispatch(&self, action: HostAction) -> Result<(), RemoteError> {
            if self.fail {
                return Err(RemoteError::Dispatch);
            }
            self.actions.lock().unwrap().push(action);
            Ok(())
        }

        fn show_map_page(&self) -> Result<(), RemoteError> {
            *self.map_pages.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct Fixture {
        router: CommandRouter,
        registry: Arc<TestRegistry>,
        dispatcher: Arc<TestDispatcher>,
        publisher: ContextPublisher,
    }

    fn fixture_with(devices: Vec<RemoteDevice>, dispatcher: TestDispatcher) -> Fixture {
        let registry = Arc::new(TestRegistry::default());
        {
            let mut config = registry.config.lock().unwrap();
            for device in devices {
                config.add_device(device);
            }
        }
        let dispatcher = Arc::new(dispatcher);
        let (publisher, context) = session_context(GlobalSettings::default());
        publisher.set_riding(true);
        let router = CommandRouter::new(registry.clone(), dispatcher.clone(), context);
        Fixture {
            router,
            registry,
            dispatcher,
            publisher,
        }
    }

    fn ant_remote() -> RemoteDevice {
        RemoteDevice::new("Bar remote", TransportKind::Ant, TransportAddress::Ant(4242))
    }

    fn fixture() -> Fixture {
        fixture_with(vec![ant_remote()], TestDispatcher::default())
    }

    fn ant_cmd(code: u16) -> RawCommand {
        RawCommand::new(TransportKind::Ant, code)
    }

    #[tokio::test]
    async fn test_routes_single_press_through_key_mapping() {
        let fx = fixture();
        let outcome = fx.router.route(ant_cmd(ant::MENU_DOWN), PressType::Single).await;

        assert_eq!(outcome, RouteOutcome::Dispatched(HostAction::Back));
        assert_eq!(*fx.dispatcher.actions.lock().unwrap(), vec![HostAction::Back]);
    }

    #[tokio::test]
    async fn test_riding_gate_drops_everything() {
        let fx = fixture();
        fx.publisher.set_riding(false);

        for code in [ant::MENU_DOWN, ant::MENU_UP, ant::LAP, 99] {
            for press in [PressType::Single, PressType::Double] {
                let outcome = fx.router.route(ant_cmd(code), press).await;
                assert_eq!(outcome, RouteOutcome::DroppedNotRiding);
            }
        }
        assert!(fx.dispatcher.actions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gate_disabled_routes_when_not_riding() {
        let fx = fixture();
        fx.publisher.set_riding(false);
        fx.publisher.publish_settings(GlobalSettings {
            only_while_riding: false,
            ..GlobalSettings::default()
        });

        let outcome = fx.router.route(ant_cmd(ant::MENU_UP), PressType::Single).await;
        assert_eq!(outcome, RouteOutcome::Dispatched(HostAction::PageRight));
    }

    #[tokio::test]
    async fn test_no_active_device_drops() {
        let fx = fixture_with(Vec::new(), TestDispatcher::default());
        let outcome = fx.router.route(ant_cmd(ant::LAP), PressType::Single).await;
        assert_eq!(outcome, RouteOutcome::DroppedNoActiveDevice);
    }

    #[tokio::test]
    async fn test_unmapped_and_foreign_commands_drop() {
        let fx = fixture();
        assert_eq!(
            fx.router.route(ant_cmd(ant::MENU_SELECT), PressType::Single).await,
            RouteOutcome::DroppedUnmapped
        );
        assert_eq!(
            fx.router
                .route(RawCommand::new(TransportKind::Ble, ble::VOLUME_UP), PressType::Single)
                .await,
            RouteOutcome::DroppedTransportMismatch
        );
        assert!(fx.dispatcher.actions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unbound_double_is_not_dispatched() {
        let fx = fixture();
        let outcome = fx.router.route(ant_cmd(ant::MENU_DOWN), PressType::Double).await;
        assert_eq!(outcome, RouteOutcome::Unbound);
        assert!(fx.dispatcher.actions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_show_map_makes_extra_host_call() {
        let fx = fixture();
        let outcome = fx.router.route(ant_cmd(ant::LAP), PressType::Double).await;

        assert_eq!(outcome, RouteOutcome::Dispatched(HostAction::ShowMap));
        assert_eq!(*fx.dispatcher.actions.lock().unwrap(), vec![HostAction::ShowMap]);
        assert_eq!(*fx.dispatcher.map_pages.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_reported_once() {
        let fx = fixture_with(
            vec![ant_remote()],
            TestDispatcher {
                fail: true,
                ..TestDispatcher::default()
            },
        );
        let outcome = fx.router.route(ant_cmd(ant::MENU_DOWN), PressType::Single).await;
        assert_eq!(outcome, RouteOutcome::DispatchFailed(HostAction::Back));
    }

    #[tokio::test]
    async fn test_learned_mode_uses_learned_commands() {
        let mut remote = ant_remote();
        remote.mapping_mode = MappingMode::Learned;
        remote.learned_commands.push(LearnedCommand {
            command: ant_cmd(ant::MENU_DOWN),
            press: PressType::Double,
            action: Some(HostAction::ZoomOut),
        });
        let fx = fixture_with(vec![remote], TestDispatcher::default());

        assert_eq!(
            fx.router.route(ant_cmd(ant::MENU_DOWN), PressType::Double).await,
            RouteOutcome::Dispatched(HostAction::ZoomOut)
        );
        // Direct mapping is ignored in learned mode
        assert_eq!(
            fx.router.route(ant_cmd(ant::MENU_DOWN), PressType::Single).await,
            RouteOutcome::Unbound
        );
    }

    #[tokio::test]
    async fn test_learning_captures_instead_of_dispatching() {
        let fx = fixture();
        fx.publisher.set_riding(false);
        fx.router.set_learning(Some(ant_remote().id));

        for _ in 0..2 {
            let outcome = fx.router.route(ant_cmd(ant::LAP), PressType::Single).await;
            assert_eq!(outcome, RouteOutcome::Learned);
        }
        fx.router.route(ant_cmd(ant::LAP), PressType::Double).await;

        let config = fx.registry.load().await.unwrap();
        let learned = &config.device(&ant_remote().id).unwrap().learned_commands;
        assert_eq!(learned.len(), 2);
        assert!(learned.iter().all(|l| l.action.is_none()));
        assert!(fx.dispatcher.actions.lock().unwrap().is_empty());

        fx.router.set_learning(None);
        assert_eq!(
            fx.router.route(ant_cmd(ant::LAP), PressType::Single).await,
            RouteOutcome::DroppedNotRiding
        );
    }

    #[tokio::test]
    async fn test_learning_skips_unmapped_codes() {
        let fx = fixture();
        fx.router.set_learning(Some(ant_remote().id));

        let outcome = fx.router.route(ant_cmd(ant::MENU_SELECT), PressType::Single).await;
        assert_eq!(outcome, RouteOutcome::DroppedUnmapped);

        let config = fx.registry.load().await.unwrap();
        assert!(config
            .device(&ant_remote().id)
            .unwrap()
            .learned_commands
            .is_empty());
    }
}
