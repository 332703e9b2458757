//! Reconnection Policy
//!
//! Supervises one connection slot with two independent tasks:
//!
//! - a bounded exponential backoff loop that retries until connected or the
//!   attempt budget is spent
//! - a periodic liveness check that keeps probing forever, so a remote that
//!   comes back after the budget ran out is still picked up
//!
//! Settings are read fresh on every decision.

use crate::domain::models::{ConnectionState, TransportAddress};
use crate::domain::settings::SessionContext;
use crate::infrastructure::transport::connection::ConnectionHandle;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// `min(base * 2^attempt, max)`, saturating.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

struct Monitor {
    address: TransportAddress,
    backoff: JoinHandle<()>,
    liveness: JoinHandle<()>,
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.backoff.abort();
        self.liveness.abort();
    }
}

pub struct ReconnectionPolicy {
    connection: ConnectionHandle,
    context: SessionContext,
    monitor: Option<Monitor>,
}

impl ReconnectionPolicy {
    pub fn new(connection: ConnectionHandle, context: SessionContext) -> Self {
        Self {
            connection,
            context,
            monitor: None,
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Direct connect, then supervision when auto-reconnect is enabled.
    pub fn start(&mut self, address: TransportAddress) {
        self.cancel();
        if let Err(e) = self.connection.connect(address.clone()) {
            warn!("{} connect request failed: {}", self.connection.kind(), e);
        }
        self.monitor(address);
    }

    /// Replaces any running supervision for this slot.
    pub fn monitor(&mut self, address: TransportAddress) {
        self.cancel();

        if !self.context.settings().auto_reconnect {
            debug!(
                "{} auto-reconnect disabled, not monitoring {}",
                self.connection.kind(),
                address
            );
            return;
        }

        info!("{} monitoring {}", self.connection.kind(), address);
        let backoff = tokio::spawn(run_backoff(
            self.connection.clone(),
            self.context.clone(),
            address.clone(),
        ));
        let liveness = tokio::spawn(run_liveness(
            self.connection.clone(),
            self.context.clone(),
            address.clone(),
        ));
        self.monitor = Some(Monitor {
            address,
            backoff,
            liveness,
        });
    }

    pub fn cancel(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            debug!(
                "{} stopped monitoring {}",
                self.connection.kind(),
                monitor.address
            );
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_some()
    }

    pub fn monitored_address(&self) -> Option<&TransportAddress> {
        self.monitor.as_ref().map(|m| &m.address)
    }

    /// Whether the bounded backoff loop is still retrying.
    pub fn is_retrying(&self) -> bool {
        self.monitor
            .as_ref()
            .map_or(false, |m| !m.backoff.is_finished())
    }
}

/// Sleeps for `delay`, returning early with `true` once connected to
/// `address`. A link to any other remote does not count.
async fn wait_or_connected(
    connection: &ConnectionHandle,
    state: &mut watch::Receiver<ConnectionState>,
    address: &TransportAddress,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        state.borrow_and_update();
        if connection.is_connected_to(address) {
            return true;
        }
        tokio::select! {
            _ = &mut sleep => return connection.is_connected_to(address),
            changed = state.changed() => {
                if changed.is_err() {
                    // worker gone; let the timer decide
                    (&mut sleep).await;
                    return false;
                }
            }
        }
    }
}

async fn run_backoff(connection: ConnectionHandle, context: SessionContext, address: TransportAddress) {
    let kind = connection.kind();
    let mut state = connection.subscribe_state();
    let mut attempt: u32 = 0;

    loop {
        let settings = context.settings();
        if !settings.auto_reconnect {
            debug!("{} auto-reconnect turned off, backoff stopped", kind);
            return;
        }
        if attempt >= settings.reconnect_attempts {
            warn!(
                "{} gave up on {} after {} attempts, liveness check continues",
                kind, address, attempt
            );
            return;
        }

        let delay = backoff_delay(
            settings.reconnect_delay(),
            settings.max_reconnect_delay(),
            attempt,
        );
        debug!("{} next reconnect to {} in {:?}", kind, address, delay);
        if wait_or_connected(&connection, &mut state, &address, delay).await {
            info!("{} connected to {}, backoff finished", kind, address);
            return;
        }

        attempt += 1;
        info!(
            "{} reconnect attempt {}/{} to {}",
            kind,
            attempt,
            context.settings().reconnect_attempts,
            address
        );
        if connection.connect(address.clone()).is_err() {
            return;
        }
    }
}

async fn run_liveness(connection: ConnectionHandle, context: SessionContext, address: TransportAddress) {
    let kind = connection.kind();
    let mut was_connected = connection.is_connected_to(&address);
    let mut shortened = false;

    loop {
        let interval = context.settings().check_interval();
        let period = if shortened { interval / 2 } else { interval };
        shortened = false;
        tokio::time::sleep(period).await;

        if !context.settings().auto_reconnect {
            continue;
        }

        if connection.is_connected_to(&address) {
            was_connected = true;
            continue;
        }

        if was_connected {
            info!("{} link to {} dropped since last check", kind, address);
            shortened = true;
        }
        was_connected = false;

        debug!("{} liveness probe reconnecting to {}", kind, address);
        if connection.connect(address.clone()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::FailureClass;
    use crate::domain::models::TransportKind;
    use crate::domain::settings::{session_context, GlobalSettings};
    use crate::infrastructure::transport::connection::{ConnectionConfig, ConnectionStateMachine};
    use crate::infrastructure::transport::loopback::{LoopbackBehavior, LoopbackTransport};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    #[test]
    fn test_backoff_sequence_is_bounded() {
        let base = Duration::from_millis(5_000);
        let max = Duration::from_millis(80_000);
        let delays: Vec<u128> = (0..7)
            .map(|attempt| backoff_delay(base, max, attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![5_000, 10_000, 20_000, 40_000, 80_000, 80_000, 80_000]);
        assert_eq!(backoff_delay(base, max, 40), max);
    }

    fn seconds_since(start: Instant, times: &[Instant]) -> Vec<u64> {
        times
            .iter()
            .map(|t| t.duration_since(start).as_secs_f64().round() as u64)
            .collect()
    }

    struct Slot {
        loopback: Arc<LoopbackTransport>,
        policy: ReconnectionPolicy,
        _task: JoinHandle<()>,
    }

    fn slot(settings: GlobalSettings) -> (Slot, crate::domain::settings::ContextPublisher) {
        let loopback = Arc::new(LoopbackTransport::new(TransportKind::Ant));
        let (raw_tx, _raw_rx) = mpsc::unbounded_channel();
        let (app_tx, _app_rx) = mpsc::unbounded_channel();
        let (handle, task) = ConnectionStateMachine::spawn(
            loopback.clone(),
            ConnectionConfig::default(),
            raw_tx,
            app_tx,
        );
        let (publisher, context) = session_context(settings);
        (
            Slot {
                loopback,
                policy: ReconnectionPolicy::new(handle, context),
                _task: task,
            },
            publisher,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_liveness_probes() {
        let (mut slot, _publisher) = slot(GlobalSettings::default());
        slot.loopback
            .set_behavior(LoopbackBehavior::Fail(FailureClass::Timeout));

        let start = Instant::now();
        slot.policy.start(TransportAddress::Ant(42));
        tokio::time::sleep(Duration::from_secs(250)).await;

        // backoff at 5, 15, 35, 75, 155; liveness every 30
        assert_eq!(
            seconds_since(start, &slot.loopback.request_times()),
            vec![0, 5, 15, 30, 35, 60, 75, 90, 120, 150, 155, 180, 210, 240]
        );
        assert!(!slot.policy.is_retrying());
        assert!(slot.policy.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_monitor_without_auto_reconnect() {
        let (mut slot, _publisher) = slot(GlobalSettings {
            auto_reconnect: false,
            ..GlobalSettings::default()
        });
        slot.loopback
            .set_behavior(LoopbackBehavior::Fail(FailureClass::Timeout));

        slot.policy.start(TransportAddress::Ant(42));
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(slot.loopback.request_count(), 1);
        assert!(!slot.policy.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_stops_once_connected() {
        let (mut slot, _publisher) = slot(GlobalSettings::default());
        slot.loopback
            .set_behavior(LoopbackBehavior::Fail(FailureClass::DeviceBusy));

        slot.policy.start(TransportAddress::Ant(42));
        tokio::time::sleep(Duration::from_secs(1)).await;
        slot.loopback.set_behavior(LoopbackBehavior::Accept);

        // first retry at 5s succeeds
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(slot.loopback.request_count(), 2);
        assert!(!slot.policy.is_retrying());
        assert_eq!(slot.policy.connection().state(), ConnectionState::Tracking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_period_halves_after_drop() {
        let (mut slot, _publisher) = slot(GlobalSettings::default());
        let start = Instant::now();
        slot.policy.start(TransportAddress::Ant(42));
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(slot.loopback.request_count(), 1);

        // drop seen at the 60s check; next check comes 15s later
        slot.loopback
            .set_behavior(LoopbackBehavior::Fail(FailureClass::Timeout));
        assert!(slot.loopback.drop_link());
        tokio::time::sleep(Duration::from_secs(70)).await;

        assert_eq!(
            seconds_since(start, &slot.loopback.request_times()),
            vec![0, 60, 75, 105]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_to_other_remote_is_not_connected() {
        let (mut slot, _publisher) = slot(GlobalSettings::default());
        slot.policy
            .connection()
            .connect(TransportAddress::Ant(1))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(slot
            .policy
            .connection()
            .is_connected_to(&TransportAddress::Ant(1)));

        slot.policy.monitor(TransportAddress::Ant(2));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(
            slot.loopback.requested_addresses(),
            vec![TransportAddress::Ant(1), TransportAddress::Ant(2)]
        );
        assert!(slot
            .policy
            .connection()
            .is_connected_to(&TransportAddress::Ant(2)));
        assert!(!slot.policy.is_retrying());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(slot.loopback.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_monitor_replaces_old() {
        let (mut slot, _publisher) = slot(GlobalSettings::default());
        slot.loopback
            .set_behavior(LoopbackBehavior::Fail(FailureClass::Timeout));

        slot.policy.start(TransportAddress::Ant(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        slot.policy.start(TransportAddress::Ant(2));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(
            slot.loopback.requested_addresses(),
            vec![
                TransportAddress::Ant(1),
                TransportAddress::Ant(2),
                TransportAddress::Ant(2)
            ]
        );
        assert_eq!(slot.policy.monitored_address(), Some(&TransportAddress::Ant(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_all_activity() {
        let (mut slot, _publisher) = slot(GlobalSettings::default());
        slot.loopback
            .set_behavior(LoopbackBehavior::Fail(FailureClass::Timeout));

        slot.policy.start(TransportAddress::Ant(42));
        slot.policy.cancel();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(slot.loopback.request_count(), 1);
    }
}
