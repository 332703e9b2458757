//! Connection Module
//!
//! One state machine per transport kind. Commands from the application and
//! callbacks from the transport are queued onto a single event loop, so
//! transitions are applied in the order they were delivered.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──access ok──▶ Connected ──tracking──▶ Tracking
//!                       │                        │                      │
//!                       └──failure──▶ Error ──teardown──▶ Closed ◀──────┘
//! ```

use crate::domain::error::{FailureClass, FailureSeverity, RemoteError};
use crate::domain::models::{
    AppEvent, ConnectionState, DiscoveredDevice, MessageSeverity, RawCommand, StatusMessage,
    TransportAddress, TransportKind,
};
use crate::infrastructure::transport::gatt::{DescriptorQueue, QueueStep};
use crate::infrastructure::transport::protocol;
use crate::infrastructure::transport::scanner::{DiscoveryList, DiscoverySnapshot};
use crate::infrastructure::transport::{
    AccessHandle, Characteristic, EventSink, LinkState, SessionEvent, Transport, TransportEvent,
    DISCOVERY_SESSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connect requests arriving sooner than this after the previous attempt
    /// are dropped
    pub min_attempt_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            min_attempt_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug)]
enum Command {
    Connect(TransportAddress),
    Disconnect,
    StartScan,
    StopScan,
    Shutdown,
}

/// Cloneable front end of a running [`ConnectionStateMachine`].
#[derive(Clone)]
pub struct ConnectionHandle {
    kind: TransportKind,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    last_error: watch::Receiver<Option<RemoteError>>,
    device: watch::Receiver<Option<DiscoveredDevice>>,
    discovered: watch::Receiver<DiscoverySnapshot>,
}

impl ConnectionHandle {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    fn send(&self, command: Command) -> Result<(), RemoteError> {
        self.commands
            .send(command)
            .map_err(|_| RemoteError::ChannelClosed)
    }

    pub fn connect(&self, address: TransportAddress) -> Result<(), RemoteError> {
        self.send(Command::Connect(address))
    }

    pub fn disconnect(&self) -> Result<(), RemoteError> {
        self.send(Command::Disconnect)
    }

    pub fn start_scan(&self) -> Result<(), RemoteError> {
        self.send(Command::StartScan)
    }

    /// Stops discovery, clears the discovered list and drops the link.
    pub fn stop_scan(&self) -> Result<(), RemoteError> {
        self.send(Command::StopScan)
    }

    pub fn shutdown(&self) -> Result<(), RemoteError> {
        self.send(Command::Shutdown)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn last_error(&self) -> Option<RemoteError> {
        self.last_error.borrow().clone()
    }

    /// Identity of the remote the current session reached, if any.
    pub fn connected_device(&self) -> Option<DiscoveredDevice> {
        self.device.borrow().clone()
    }

    pub fn discovered(&self) -> DiscoverySnapshot {
        self.discovered.borrow().clone()
    }

    /// Connected, and to `address` rather than some other remote. A wildcard
    /// address accepts whichever remote answered.
    pub fn is_connected_to(&self, address: &TransportAddress) -> bool {
        if !self.state().is_connected() {
            return false;
        }
        address.is_any()
            || self
                .device
                .borrow()
                .as_ref()
                .map_or(false, |device| device.address == *address)
    }
}

pub struct ConnectionStateMachine {
    kind: TransportKind,
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    raw_commands: mpsc::UnboundedSender<RawCommand>,
    app_events: mpsc::UnboundedSender<AppEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
    last_error: watch::Sender<Option<RemoteError>>,
    device: watch::Sender<Option<DiscoveredDevice>>,
    discovery: DiscoveryList,
    session: u64,
    access: Option<Box<dyn AccessHandle>>,
    target: Option<TransportAddress>,
    last_attempt: Option<Instant>,
    descriptors: DescriptorQueue,
    last_sequence: Option<u8>,
    scanning: bool,
}

impl ConnectionStateMachine {
    /// Start the worker for `transport`. Decoded button codes go to
    /// `raw_commands`; status changes go to `app_events`.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        raw_commands: mpsc::UnboundedSender<RawCommand>,
        app_events: mpsc::UnboundedSender<AppEvent>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let kind = transport.kind();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Idle);
        let (last_error, error_rx) = watch::channel(None);
        let (device, device_rx) = watch::channel(None);
        let discovery = DiscoveryList::new();

        let handle = ConnectionHandle {
            kind,
            commands: command_tx,
            state: state_rx,
            last_error: error_rx,
            device: device_rx,
            discovered: discovery.subscribe(),
        };

        let machine = Self {
            kind,
            transport,
            config,
            raw_commands,
            app_events,
            events_tx,
            state,
            last_error,
            device,
            discovery,
            session: DISCOVERY_SESSION,
            access: None,
            target: None,
            last_attempt: None,
            descriptors: DescriptorQueue::new(),
            last_sequence: None,
            scanning: false,
        };

        let task = tokio::spawn(machine.run(command_rx, events_rx));
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        info!("{} connection worker started", self.kind);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        self.stop_discovery();
        self.teardown();
        info!("{} connection worker stopped", self.kind);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(address) => self.connect(address),
            Command::Disconnect => {
                info!("{} disconnect requested", self.kind);
                self.teardown();
            }
            Command::StartScan => self.start_scan(),
            Command::StopScan => {
                self.stop_discovery();
                self.discovery.clear();
                self.teardown();
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, SessionEvent { session, event }: SessionEvent) {
        match event {
            TransportEvent::DeviceFound(device) => self.on_device_found(device),
            TransportEvent::DiscoveryFailed(class) => self.on_discovery_failed(class),
            event if session != self.session || self.access.is_none() => {
                trace!(
                    "{} ignoring event from stale session {}: {:?}",
                    self.kind,
                    session,
                    event
                );
            }
            TransportEvent::AccessResult(result) => self.on_access_result(result),
            TransportEvent::LinkState(link) => self.on_link_state(link),
            TransportEvent::ServicesDiscovered(characteristics) => {
                self.on_services_discovered(characteristics)
            }
            TransportEvent::DescriptorWritten {
                characteristic,
                success,
            } => self.on_descriptor_written(&characteristic, success),
            TransportEvent::Payload { source, bytes } => self.on_payload(source.as_deref(), &bytes),
        }
    }

    fn connect(&mut self, address: TransportAddress) {
        if let Some(kind) = address.kind() {
            if kind != self.kind {
                self.report(RemoteError::Configuration(format!(
                    "{} address {} given to the {} connection",
                    kind, address, self.kind
                )));
                return;
            }
        }

        // A different remote replaces the current session right away; the
        // pending and debounce guards only hold back repeats of one target.
        let switching = self
            .target
            .as_ref()
            .map_or(false, |target| *target != address);

        let state = self.current();
        if state == ConnectionState::Connecting && !switching {
            debug!("{} connect to {} ignored, attempt pending", self.kind, address);
            return;
        }
        if state.is_connected() && !switching {
            debug!("{} already connected to {}", self.kind, address);
            return;
        }

        let now = Instant::now();
        if let Some(last) = self.last_attempt.filter(|_| !switching) {
            let elapsed = now.duration_since(last);
            if elapsed < self.config.min_attempt_interval {
                debug!(
                    "{} connect to {} dropped, previous attempt {:?} ago",
                    self.kind, address, elapsed
                );
                return;
            }
        }

        if self.access.is_some() {
            info!("{} switching remote to {}", self.kind, address);
            self.teardown();
        }

        self.last_attempt = Some(now);
        self.session += 1;
        self.target = Some(address.clone());
        self.set_state(ConnectionState::Connecting);
        info!("{} connecting to {} (session {})", self.kind, address, self.session);

        let sink = EventSink::new(self.session, self.events_tx.clone());
        match self.transport.request_access(&address, sink) {
            Ok(access) => self.access = Some(access),
            Err(e) => self.fail(e.into()),
        }
    }

    fn on_access_result(&mut self, result: Result<DiscoveredDevice, FailureClass>) {
        if self.current() != ConnectionState::Connecting {
            debug!("{} unexpected access result in {}", self.kind, self.current());
            return;
        }

        match result {
            Ok(device) => {
                info!("{} connected to {} ({})", self.kind, device.name, device.address);
                self.notify(
                    format!("Connected to {}", device.name),
                    MessageSeverity::Success,
                );
                self.device.send_replace(Some(device));
                self.last_error.send_replace(None);
                self.set_state(ConnectionState::Connected);

                if self.kind == TransportKind::Ble {
                    self.discover_services();
                }
            }
            Err(class) => self.fail(RemoteError::ConnectFailure(class)),
        }
    }

    fn on_link_state(&mut self, link: LinkState) {
        match link {
            LinkState::Searching => debug!("{} searching for remote", self.kind),
            LinkState::Tracking => {
                if self.kind == TransportKind::Ant && self.current() == ConnectionState::Connected {
                    self.set_state(ConnectionState::Tracking);
                }
            }
            LinkState::Dead | LinkState::Closed => {
                warn!("{} link reported {:?}", self.kind, link);
                self.notify("Remote connection lost", MessageSeverity::Warning);
                self.teardown();
            }
        }
    }

    fn discover_services(&mut self) {
        let Some(access) = self.access.as_mut() else {
            return;
        };
        if let Err(e) = access.discover_services() {
            self.fail(e.into());
        }
    }

    fn on_services_discovered(&mut self, characteristics: Vec<Characteristic>) {
        if self.kind != TransportKind::Ble || self.current() != ConnectionState::Connected {
            return;
        }

        let subscribable = characteristics
            .iter()
            .filter(|c| c.is_subscribable())
            .count();
        if subscribable == 0 {
            self.fail(RemoteError::ProtocolFailure(
                "remote exposes no notifiable characteristic".to_string(),
            ));
            return;
        }

        debug!("{} enabling {} notifications", self.kind, subscribable);
        let step = self.descriptors.load(characteristics);
        self.apply_step(step);
    }

    fn on_descriptor_written(&mut self, characteristic: &str, success: bool) {
        if self.current() != ConnectionState::Connected || !self.descriptors.is_busy() {
            trace!("{} descriptor ack for {} with nothing in flight", self.kind, characteristic);
            return;
        }
        let step = self.descriptors.acknowledge(characteristic, success);
        self.apply_step(step);
    }

    fn apply_step(&mut self, step: QueueStep) {
        match step {
            QueueStep::Next(characteristic) => {
                let Some(access) = self.access.as_mut() else {
                    return;
                };
                let value = characteristic.descriptor_value();
                trace!(
                    "{} writing descriptor of {} ({} queued)",
                    self.kind,
                    characteristic.uuid,
                    self.descriptors.remaining()
                );
                let result = access
                    .enable_notification(&characteristic)
                    .and_then(|()| access.write_descriptor(&characteristic, value));
                if let Err(e) = result {
                    self.fail(e.into());
                }
            }
            QueueStep::Complete => {
                info!("{} notifications enabled", self.kind);
                self.set_state(ConnectionState::Tracking);
            }
            QueueStep::Failed(characteristic) => {
                self.fail(RemoteError::ProtocolFailure(format!(
                    "descriptor write rejected for {}",
                    characteristic.uuid
                )));
            }
            QueueStep::Ignored => {
                debug!("{} acknowledgment for a descriptor not in flight", self.kind)
            }
        }
    }

    fn on_payload(&mut self, source: Option<&str>, bytes: &[u8]) {
        if !self.current().is_connected() {
            trace!("{} payload before connection, dropped", self.kind);
            return;
        }

        let decoded = match protocol::decode(self.kind, source, bytes) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return,
            Err(e) => {
                warn!("{} dropped malformed payload: {}", self.kind, e);
                return;
            }
        };

        if let Some(sequence) = decoded.sequence {
            if self.last_sequence == Some(sequence) {
                trace!("{} retransmission of sequence {}", self.kind, sequence);
                return;
            }
            self.last_sequence = Some(sequence);
        }

        let command = RawCommand::new(self.kind, decoded.code);
        debug!("Raw command {}", command);
        if self.raw_commands.send(command).is_err() {
            warn!("Press pipeline closed, dropping {}", command);
        }
    }

    fn start_scan(&mut self) {
        if self.scanning {
            debug!("{} scan already running", self.kind);
            return;
        }

        let sink = EventSink::new(DISCOVERY_SESSION, self.events_tx.clone());
        match self.transport.start_discovery(sink) {
            Ok(()) => {
                self.scanning = true;
                info!("{} scan started", self.kind);
                self.notify(
                    format!("Scanning for {} remotes...", self.kind),
                    MessageSeverity::Info,
                );
            }
            Err(e) => self.report(e.into()),
        }
    }

    fn stop_discovery(&mut self) {
        if self.scanning {
            self.transport.stop_discovery();
            self.scanning = false;
            info!("{} scan stopped", self.kind);
        }
    }

    fn on_device_found(&mut self, device: DiscoveredDevice) {
        if !self.scanning {
            return;
        }
        if self.discovery.insert(device.clone()) {
            let _ = self.app_events.send(AppEvent::DeviceFound {
                transport: self.kind,
                device,
            });
        }
    }

    fn on_discovery_failed(&mut self, class: FailureClass) {
        if !self.scanning {
            return;
        }
        self.stop_discovery();
        self.report(RemoteError::ConnectFailure(class));
    }

    /// Report, go through Error, then release everything.
    fn fail(&mut self, err: RemoteError) {
        self.report(err);
        self.set_state(ConnectionState::Error);
        self.teardown();
    }

    fn report(&mut self, err: RemoteError) {
        match &err {
            RemoteError::ConnectFailure(class)
                if class.severity() == FailureSeverity::Recoverable =>
            {
                warn!("{} connection error (recoverable): {}", self.kind, err)
            }
            _ => error!("{} connection error: {}", self.kind, err),
        }
        self.notify(err.to_string(), MessageSeverity::Error);
        self.last_error.send_replace(Some(err));
    }

    fn teardown(&mut self) {
        if let Some(mut access) = self.access.take() {
            debug!("{} releasing session {}", self.kind, self.session);
            access.close();
        }
        self.descriptors.clear();
        self.target = None;
        self.last_sequence = None;
        self.device.send_replace(None);

        if self.current() != ConnectionState::Idle {
            self.set_state(ConnectionState::Closed);
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, state: ConnectionState) {
        let previous = self.current();
        if previous == state {
            return;
        }
        self.state.send_replace(state);
        debug!("{} state {} -> {}", self.kind, previous, state);
        let _ = self.app_events.send(AppEvent::ConnectionStatus {
            transport: self.kind,
            state,
        });
    }

    fn notify(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self
            .app_events
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

impl Drop for ConnectionStateMachine {
    fn drop(&mut self) {
        if let Some(mut access) = self.access.take() {
            access.close();
        }
        if self.scanning {
            self.transport.stop_discovery();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::keymap::ant;
    use crate::infrastructure::transport::loopback::{LoopbackBehavior, LoopbackTransport};
    use crate::infrastructure::transport::protocol::{
        BATTERY_LEVEL_CHAR_UUID, HID_REPORT_CHAR_UUID,
    };

    struct Harness {
        loopback: Arc<LoopbackTransport>,
        handle: ConnectionHandle,
        raw_rx: mpsc::UnboundedReceiver<RawCommand>,
        app_rx: mpsc::UnboundedReceiver<AppEvent>,
        _task: JoinHandle<()>,
    }

    fn harness(kind: TransportKind) -> Harness {
        let loopback = Arc::new(LoopbackTransport::new(kind));
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (handle, task) = ConnectionStateMachine::spawn(
            loopback.clone(),
            ConnectionConfig::default(),
            raw_tx,
            app_tx,
        );
        Harness {
            loopback,
            handle,
            raw_rx,
            app_rx,
            _task: task,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn wait_for(handle: &ConnectionHandle, expected: ConnectionState) {
        let mut rx = handle.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *rx.borrow_and_update() != expected {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {}", expected));
    }

    fn states(app_rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = app_rx.try_recv() {
            if let AppEvent::ConnectionStatus { state, .. } = event {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_connect_issues_one_request() {
        let h = harness(TransportKind::Ant);
        h.handle.connect(TransportAddress::Ant(42)).unwrap();
        h.handle.connect(TransportAddress::Ant(42)).unwrap();

        wait_for(&h.handle, ConnectionState::Tracking).await;
        settle().await;
        assert_eq!(h.loopback.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ant_reaches_tracking() {
        let mut h = harness(TransportKind::Ant);
        h.handle.connect(TransportAddress::Any).unwrap();
        wait_for(&h.handle, ConnectionState::Tracking).await;

        assert_eq!(
            states(&mut h.app_rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Tracking
            ]
        );
        assert!(h.handle.connected_device().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_goes_through_error_to_closed() {
        let mut h = harness(TransportKind::Ant);
        h.loopback
            .set_behavior(LoopbackBehavior::Fail(FailureClass::Timeout));
        h.handle.connect(TransportAddress::Ant(42)).unwrap();
        wait_for(&h.handle, ConnectionState::Closed).await;

        assert_eq!(
            states(&mut h.app_rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Error,
                ConnectionState::Closed
            ]
        );
        assert_eq!(
            h.handle.last_error(),
            Some(RemoteError::ConnectFailure(FailureClass::Timeout))
        );
        assert_eq!(h.loopback.closed_handles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_is_reported() {
        let h = harness(TransportKind::Ble);
        h.loopback.set_behavior(LoopbackBehavior::PermissionDenied);
        h.handle
            .connect(TransportAddress::Ble("aa:bb:cc:dd:ee:ff".into()))
            .unwrap();
        wait_for(&h.handle, ConnectionState::Closed).await;

        assert!(matches!(
            h.handle.last_error(),
            Some(RemoteError::PermissionDenied(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_reconnect_is_debounced() {
        let h = harness(TransportKind::Ant);
        h.loopback
            .set_behavior(LoopbackBehavior::Fail(FailureClass::DeviceBusy));
        h.handle.connect(TransportAddress::Ant(42)).unwrap();
        wait_for(&h.handle, ConnectionState::Closed).await;

        h.handle.connect(TransportAddress::Ant(42)).unwrap();
        settle().await;
        assert_eq!(h.loopback.request_count(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.handle.connect(TransportAddress::Ant(42)).unwrap();
        settle().await;
        assert_eq!(h.loopback.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_elsewhere_tears_down_first() {
        let h = harness(TransportKind::Ant);
        h.handle.connect(TransportAddress::Ant(1)).unwrap();
        wait_for(&h.handle, ConnectionState::Tracking).await;

        // same address: no-op even after the debounce window
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.handle.connect(TransportAddress::Ant(1)).unwrap();
        settle().await;
        assert_eq!(h.loopback.request_count(), 1);

        h.handle.connect(TransportAddress::Ant(2)).unwrap();
        wait_for(&h.handle, ConnectionState::Tracking).await;
        assert_eq!(h.loopback.request_count(), 2);
        assert_eq!(h.loopback.closed_handles(), 1);
        assert_eq!(
            h.loopback.requested_addresses(),
            vec![TransportAddress::Ant(1), TransportAddress::Ant(2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_remote_skips_debounce() {
        let h = harness(TransportKind::Ant);
        h.handle.connect(TransportAddress::Ant(1)).unwrap();
        wait_for(&h.handle, ConnectionState::Tracking).await;

        // well inside the debounce window
        h.handle.connect(TransportAddress::Ant(2)).unwrap();
        settle().await;
        wait_for(&h.handle, ConnectionState::Tracking).await;

        assert_eq!(
            h.loopback.requested_addresses(),
            vec![TransportAddress::Ant(1), TransportAddress::Ant(2)]
        );
        assert!(h.handle.is_connected_to(&TransportAddress::Ant(2)));
        assert!(!h.handle.is_connected_to(&TransportAddress::Ant(1)));
        assert!(h.handle.is_connected_to(&TransportAddress::Any));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_remote_while_connecting() {
        let h = harness(TransportKind::Ant);
        h.loopback.set_behavior(LoopbackBehavior::Unanswered);
        h.handle.connect(TransportAddress::Ant(1)).unwrap();
        settle().await;
        assert_eq!(h.handle.state(), ConnectionState::Connecting);

        // same target again is still held back
        h.handle.connect(TransportAddress::Ant(1)).unwrap();
        h.handle.connect(TransportAddress::Ant(2)).unwrap();
        settle().await;
        assert_eq!(
            h.loopback.requested_addresses(),
            vec![TransportAddress::Ant(1), TransportAddress::Ant(2)]
        );
        assert_eq!(h.loopback.closed_handles(), 1);
        assert_eq!(h.handle.state(), ConnectionState::Connecting);

        assert!(h.loopback.answer_late());
        wait_for(&h.handle, ConnectionState::Connected).await;
        assert!(h.handle.is_connected_to(&TransportAddress::Ant(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_transport_address_is_rejected() {
        let h = harness(TransportKind::Ant);
        h.handle
            .connect(TransportAddress::Ble("aa:bb:cc:dd:ee:ff".into()))
            .unwrap();
        settle().await;

        assert_eq!(h.loopback.request_count(), 0);
        assert_eq!(h.handle.state(), ConnectionState::Idle);
        assert!(matches!(
            h.handle.last_error(),
            Some(RemoteError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ble_descriptors_written_one_at_a_time() {
        let h = harness(TransportKind::Ble);
        h.loopback.hold_descriptor_acks();
        h.handle
            .connect(TransportAddress::Ble("aa:bb:cc:dd:ee:ff".into()))
            .unwrap();
        settle().await;

        assert_eq!(h.handle.state(), ConnectionState::Connected);
        assert_eq!(
            h.loopback.descriptor_writes(),
            vec![HID_REPORT_CHAR_UUID.to_string()]
        );

        assert!(h.loopback.release_descriptor_ack());
        settle().await;
        assert_eq!(
            h.loopback.descriptor_writes(),
            vec![
                HID_REPORT_CHAR_UUID.to_string(),
                BATTERY_LEVEL_CHAR_UUID.to_string()
            ]
        );
        assert_eq!(h.handle.state(), ConnectionState::Connected);

        assert!(h.loopback.release_descriptor_ack());
        wait_for(&h.handle, ConnectionState::Tracking).await;
        assert!(!h.loopback.release_descriptor_ack());
    }

    #[tokio::test(start_paused = true)]
    async fn test_descriptor_failure_aborts_session() {
        let mut h = harness(TransportKind::Ble);
        h.loopback.fail_descriptor(HID_REPORT_CHAR_UUID);
        h.handle
            .connect(TransportAddress::Ble("aa:bb:cc:dd:ee:ff".into()))
            .unwrap();
        wait_for(&h.handle, ConnectionState::Closed).await;

        assert!(states(&mut h.app_rx).contains(&ConnectionState::Error));
        assert!(matches!(
            h.handle.last_error(),
            Some(RemoteError::ProtocolFailure(_))
        ));
        // nothing written after the rejected descriptor
        assert_eq!(
            h.loopback.descriptor_writes(),
            vec![HID_REPORT_CHAR_UUID.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ble_without_notifiable_characteristic_fails() {
        let h = harness(TransportKind::Ble);
        h.loopback.set_characteristics(vec![]);
        h.handle
            .connect(TransportAddress::Ble("aa:bb:cc:dd:ee:ff".into()))
            .unwrap();
        wait_for(&h.handle, ConnectionState::Closed).await;
        assert!(matches!(
            h.handle.last_error(),
            Some(RemoteError::ProtocolFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ant_retransmissions_are_dropped() {
        let mut h = harness(TransportKind::Ant);
        h.handle.connect(TransportAddress::Ant(42)).unwrap();
        wait_for(&h.handle, ConnectionState::Tracking).await;

        assert!(h.loopback.press(ant::LAP));
        assert!(h.loopback.repeat_last());
        assert!(h.loopback.repeat_last());
        assert!(h.loopback.press(ant::LAP));
        settle().await;

        let mut received = Vec::new();
        while let Ok(command) = h.raw_rx.try_recv() {
            received.push(command);
        }
        assert_eq!(
            received,
            vec![
                RawCommand::new(TransportKind::Ant, ant::LAP),
                RawCommand::new(TransportKind::Ant, ant::LAP)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_link_closes_session() {
        let h = harness(TransportKind::Ant);
        h.handle.connect(TransportAddress::Ant(42)).unwrap();
        wait_for(&h.handle, ConnectionState::Tracking).await;

        assert!(h.loopback.drop_link());
        wait_for(&h.handle, ConnectionState::Closed).await;
        assert_eq!(h.loopback.closed_handles(), 1);
        assert!(h.handle.connected_device().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_released_session_are_ignored() {
        let h = harness(TransportKind::Ant);
        h.loopback.set_behavior(LoopbackBehavior::Unanswered);
        h.handle.connect(TransportAddress::Ant(42)).unwrap();
        settle().await;
        assert_eq!(h.handle.state(), ConnectionState::Connecting);

        h.handle.disconnect().unwrap();
        wait_for(&h.handle, ConnectionState::Closed).await;

        assert!(h.loopback.answer_late());
        settle().await;
        assert_eq!(h.handle.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_scan_clears_list_and_disconnects() {
        let mut h = harness(TransportKind::Ant);
        h.handle.start_scan().unwrap();
        settle().await;
        assert!(h.loopback.is_discovering());

        let found = DiscoveredDevice {
            address: TransportAddress::Ant(7),
            name: "Bar remote".into(),
            signal_strength: Some(-60),
        };
        assert!(h.loopback.announce(found.clone()));
        assert!(h.loopback.announce(found.clone()));
        settle().await;
        assert_eq!(h.handle.discovered().as_ref(), &vec![found]);
        let found_events = std::iter::from_fn(|| h.app_rx.try_recv().ok())
            .filter(|e| matches!(e, AppEvent::DeviceFound { .. }))
            .count();
        assert_eq!(found_events, 1);

        h.handle.connect(TransportAddress::Ant(7)).unwrap();
        wait_for(&h.handle, ConnectionState::Tracking).await;

        h.handle.stop_scan().unwrap();
        wait_for(&h.handle, ConnectionState::Closed).await;
        assert!(h.handle.discovered().is_empty());
        assert!(!h.loopback.is_discovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_handle() {
        let h = harness(TransportKind::Ant);
        h.handle.connect(TransportAddress::Ant(42)).unwrap();
        wait_for(&h.handle, ConnectionState::Tracking).await;

        h.handle.shutdown().unwrap();
        h._task.await.unwrap();
        assert_eq!(h.loopback.closed_handles(), 1);
        assert_eq!(h.handle.connect(TransportAddress::Ant(1)), Err(RemoteError::ChannelClosed));
    }
}
