use serde::{Deserialize, Serialize};
use std::fmt;

/// Radio technology a remote talks over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Ant,
    Ble,
}

impl TransportKind {
    pub const ALL: [TransportKind; 2] = [TransportKind::Ant, TransportKind::Ble];

    fn prefix(self) -> &'static str {
        match self {
            Self::Ant => "ant",
            Self::Ble => "ble",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ant => write!(f, "ANT+"),
            Self::Ble => write!(f, "BLE"),
        }
    }
}

/// Where a transport should connect to.
///
/// `Any` (or an ANT device number of 0, or an empty MAC) means "search and
/// take the first remote that answers".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TransportAddress {
    Any,
    Ant(u32),
    Ble(String),
}

impl TransportAddress {
    pub fn is_any(&self) -> bool {
        match self {
            Self::Any => true,
            Self::Ant(number) => *number == 0,
            Self::Ble(mac) => mac.trim().is_empty(),
        }
    }

    /// Transport this address belongs to, `None` for a wildcard.
    pub fn kind(&self) -> Option<TransportKind> {
        match self {
            Self::Any => None,
            Self::Ant(_) => Some(TransportKind::Ant),
            Self::Ble(_) => Some(TransportKind::Ble),
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Ant(number) => write!(f, "#{}", number),
            Self::Ble(mac) => write!(f, "{}", mac.to_uppercase()),
        }
    }
}

/// Opaque identity of a configured remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Stable id derived from the transport address, so pairing the same
    /// remote twice yields the same id.
    pub fn for_address(kind: TransportKind, address: &TransportAddress) -> Self {
        Self(format!("{}:{}", kind.prefix(), address).to_lowercase())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Abstract button role a remote key maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalButton {
    Left,
    Right,
    Up,
}

impl LogicalButton {
    pub const ALL: [LogicalButton; 3] = [LogicalButton::Left, LogicalButton::Right, LogicalButton::Up];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressType {
    Single,
    Double,
}

/// Transport-native button code, before disambiguation or logical mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawCommand {
    pub transport: TransportKind,
    pub code: u16,
}

impl RawCommand {
    pub fn new(transport: TransportKind, code: u16) -> Self {
        Self { transport, code }
    }
}

impl fmt::Display for RawCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#06X}", self.transport.prefix(), self.code)
    }
}

/// A disambiguated press ready for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressEvent {
    pub command: RawCommand,
    pub press: PressType,
}

/// Operation the bike computer performs on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostAction {
    Back,
    Confirm,
    PageLeft,
    PageRight,
    Lap,
    ControlCenter,
    Drawer,
    ShowMap,
    ZoomIn,
    ZoomOut,
}

impl HostAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Back => "Back",
            Self::Confirm => "Confirm",
            Self::PageLeft => "Page left",
            Self::PageRight => "Page right",
            Self::Lap => "Lap",
            Self::ControlCenter => "Control center",
            Self::Drawer => "Drawer",
            Self::ShowMap => "Show map",
            Self::ZoomIn => "Zoom in",
            Self::ZoomOut => "Zoom out",
        }
    }
}

impl fmt::Display for HostAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Actions bound to one logical button.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonBinding {
    #[serde(default)]
    pub single: Option<HostAction>,
    #[serde(default)]
    pub double: Option<HostAction>,
}

impl ButtonBinding {
    pub fn single(action: HostAction) -> Self {
        Self {
            single: Some(action),
            double: None,
        }
    }

    pub fn action(&self, press: PressType) -> Option<HostAction> {
        match press {
            PressType::Single => self.single,
            PressType::Double => self.double,
        }
    }
}

/// Direct key mapping: the three logical buttons to host actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapping {
    #[serde(default)]
    pub left: ButtonBinding,
    #[serde(default)]
    pub right: ButtonBinding,
    #[serde(default)]
    pub up: ButtonBinding,
}

impl Default for KeyMapping {
    fn default() -> Self {
        Self {
            left: ButtonBinding::single(HostAction::Back),
            right: ButtonBinding::single(HostAction::PageRight),
            up: ButtonBinding {
                single: Some(HostAction::Lap),
                double: Some(HostAction::ShowMap),
            },
        }
    }
}

impl KeyMapping {
    pub fn binding(&self, button: LogicalButton) -> &ButtonBinding {
        match button {
            LogicalButton::Left => &self.left,
            LogicalButton::Right => &self.right,
            LogicalButton::Up => &self.up,
        }
    }

    pub fn binding_mut(&mut self, button: LogicalButton) -> &mut ButtonBinding {
        match button {
            LogicalButton::Left => &mut self.left,
            LogicalButton::Right => &mut self.right,
            LogicalButton::Up => &mut self.up,
        }
    }

    pub fn action(&self, button: LogicalButton, press: PressType) -> Option<HostAction> {
        self.binding(button).action(press)
    }

    pub fn bind(&mut self, button: LogicalButton, press: PressType, action: Option<HostAction>) {
        let binding = self.binding_mut(button);
        match press {
            PressType::Single => binding.single = action,
            PressType::Double => binding.double = action,
        }
    }
}

/// A raw command captured in learning mode, optionally bound to an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedCommand {
    pub command: RawCommand,
    pub press: PressType,
    #[serde(default)]
    pub action: Option<HostAction>,
}

/// Which table the router consults for a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    #[default]
    Direct,
    Learned,
}

/// A configured remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    pub id: DeviceId,
    pub name: String,
    pub transport: TransportKind,
    pub address: TransportAddress,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub key_mapping: KeyMapping,
    #[serde(default)]
    pub mapping_mode: MappingMode,
    #[serde(default)]
    pub learned_commands: Vec<LearnedCommand>,
}

impl RemoteDevice {
    pub fn new(name: impl Into<String>, transport: TransportKind, address: TransportAddress) -> Self {
        Self {
            id: DeviceId::for_address(transport, &address),
            name: name.into(),
            transport,
            address,
            active: false,
            key_mapping: KeyMapping::default(),
            mapping_mode: MappingMode::Direct,
            learned_commands: Vec::new(),
        }
    }

    pub fn learned_action(&self, command: RawCommand, press: PressType) -> Option<HostAction> {
        self.learned_commands
            .iter()
            .find(|learned| learned.command == command && learned.press == press)
            .and_then(|learned| learned.action)
    }

    pub fn has_learned(&self, command: RawCommand, press: PressType) -> bool {
        self.learned_commands
            .iter()
            .any(|learned| learned.command == command && learned.press == press)
    }
}

/// Lifecycle of one physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Session is exchanging data (notifications enabled / tracking).
    Tracking,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Tracking)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Tracking => "ready",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// A remote seen during discovery but not (yet) selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: TransportAddress,
    pub name: String,
    pub signal_strength: Option<i16>,
}

/// What the router did with a press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Dispatched(HostAction),
    DispatchFailed(HostAction),
    /// Captured into the learned-command list instead of dispatched.
    Learned,
    Unbound,
    DroppedNotRiding,
    DroppedNoActiveDevice,
    DroppedTransportMismatch,
    DroppedUnmapped,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus {
        transport: TransportKind,
        state: ConnectionState,
    },
    DeviceFound {
        transport: TransportKind,
        device: DiscoveredDevice,
    },
    Routed {
        event: PressEvent,
        outcome: RouteOutcome,
    },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
