use crate::domain::models::RemoteDevice;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ride_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Process-wide remote settings. Read fresh for every reconnect or routing
/// decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_true")]
    pub only_while_riding: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    // One window for every button on both transports
    #[serde(default = "default_double_tap_timeout_ms")]
    pub double_tap_timeout_ms: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            only_while_riding: default_true(),
            auto_reconnect: default_true(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            check_interval_ms: default_check_interval_ms(),
            double_tap_timeout_ms: default_double_tap_timeout_ms(),
        }
    }
}

fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    5_000
}
fn default_max_reconnect_delay_ms() -> u64 {
    80_000
}
fn default_check_interval_ms() -> u64 {
    30_000
}
fn default_double_tap_timeout_ms() -> u64 {
    400
}

const MIN_RECONNECT_DELAY_MS: u64 = 100;
const MIN_CHECK_INTERVAL_MS: u64 = 1_000;
const DOUBLE_TAP_RANGE_MS: (u64, u64) = (100, 2_000);

impl GlobalSettings {
    /// Clamp values a hand-edited file could get wrong.
    pub fn sanitized(mut self) -> Self {
        self.reconnect_attempts = self.reconnect_attempts.max(1);
        self.reconnect_delay_ms = self.reconnect_delay_ms.max(MIN_RECONNECT_DELAY_MS);
        self.max_reconnect_delay_ms = self.max_reconnect_delay_ms.max(self.reconnect_delay_ms);
        self.check_interval_ms = self.check_interval_ms.max(MIN_CHECK_INTERVAL_MS);
        self.double_tap_timeout_ms = self
            .double_tap_timeout_ms
            .clamp(DOUBLE_TAP_RANGE_MS.0, DOUBLE_TAP_RANGE_MS.1);
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn double_tap_timeout(&self) -> Duration {
        Duration::from_millis(self.double_tap_timeout_ms)
    }
}

/// The whole persisted document: configured remotes plus settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub devices: Vec<RemoteDevice>,
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub log_settings: LogSettings,
}

/// Writer side of the session context, owned by the service.
#[derive(Debug)]
pub struct ContextPublisher {
    settings: watch::Sender<GlobalSettings>,
    riding: watch::Sender<bool>,
}

/// Read side handed to the router and reconnection policies. Values are
/// replaced whole and read by value.
#[derive(Debug, Clone)]
pub struct SessionContext {
    settings: watch::Receiver<GlobalSettings>,
    riding: watch::Receiver<bool>,
}

pub fn session_context(initial: GlobalSettings) -> (ContextPublisher, SessionContext) {
    let (settings_tx, settings_rx) = watch::channel(initial);
    let (riding_tx, riding_rx) = watch::channel(false);
    (
        ContextPublisher {
            settings: settings_tx,
            riding: riding_tx,
        },
        SessionContext {
            settings: settings_rx,
            riding: riding_rx,
        },
    )
}

impl ContextPublisher {
    pub fn publish_settings(&self, settings: GlobalSettings) {
        self.settings.send_replace(settings);
    }

    pub fn set_riding(&self, riding: bool) {
        self.riding.send_replace(riding);
    }

    pub fn subscribe(&self) -> SessionContext {
        SessionContext {
            settings: self.settings.subscribe(),
            riding: self.riding.subscribe(),
        }
    }
}

impl SessionContext {
    pub fn settings(&self) -> GlobalSettings {
        self.settings.borrow().clone()
    }

    pub fn is_riding(&self) -> bool {
        *self.riding.borrow()
    }
}
