//! Loopback Transport
//!
//! In-memory stand-in for a vendor radio stack. The console harness and the
//! tests script it: grant or refuse access, press buttons, drop the link.

use crate::domain::error::{AccessError, FailureClass};
use crate::domain::models::{DiscoveredDevice, TransportAddress, TransportKind};
use crate::infrastructure::transport::protocol::{
    self, BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID, HID_CONTROL_POINT_UUID,
    HID_REPORT_CHAR_UUID, HID_SERVICE_UUID,
};
use crate::infrastructure::transport::{
    AccessHandle, Characteristic, DescriptorValue, EventSink, LinkState, Transport,
    TransportEvent,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

const LOOPBACK_ANT_NUMBER: u32 = 12345;
const LOOPBACK_MAC: &str = "C0:FF:EE:00:00:01";
const LOOPBACK_SERIAL: u16 = 0x3039;

/// How the loopback answers the next access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackBehavior {
    Accept,
    Fail(FailureClass),
    PermissionDenied,
    AdapterOff,
    /// Access is granted but no result is ever reported.
    Unanswered,
}

struct Inner {
    behavior: LoopbackBehavior,
    requests: Vec<(Instant, TransportAddress)>,
    next_handle: u64,
    session: Option<(u64, EventSink)>,
    last_sink: Option<EventSink>,
    discovery: Option<EventSink>,
    sequence: u8,
    last_payload: Option<(Option<String>, Vec<u8>)>,
    characteristics: Vec<Characteristic>,
    failing_descriptor: Option<String>,
    descriptor_writes: Vec<String>,
    hold_acks: bool,
    held_acks: VecDeque<(EventSink, TransportEvent)>,
    closed: usize,
}

pub struct LoopbackTransport {
    kind: TransportKind,
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn hid_characteristics() -> Vec<Characteristic> {
    vec![
        Characteristic {
            uuid: HID_REPORT_CHAR_UUID.to_string(),
            service: HID_SERVICE_UUID.to_string(),
            notify: true,
            indicate: false,
        },
        Characteristic {
            uuid: HID_CONTROL_POINT_UUID.to_string(),
            service: HID_SERVICE_UUID.to_string(),
            notify: false,
            indicate: false,
        },
        Characteristic {
            uuid: BATTERY_LEVEL_CHAR_UUID.to_string(),
            service: BATTERY_SERVICE_UUID.to_string(),
            notify: true,
            indicate: false,
        },
    ]
}

impl LoopbackTransport {
    pub fn new(kind: TransportKind) -> Self {
        let characteristics = match kind {
            TransportKind::Ant => Vec::new(),
            TransportKind::Ble => hid_characteristics(),
        };
        Self {
            kind,
            inner: Arc::new(Mutex::new(Inner {
                behavior: LoopbackBehavior::Accept,
                requests: Vec::new(),
                next_handle: 0,
                session: None,
                last_sink: None,
                discovery: None,
                sequence: 0,
                last_payload: None,
                characteristics,
                failing_descriptor: None,
                descriptor_writes: Vec::new(),
                hold_acks: false,
                held_acks: VecDeque::new(),
                closed: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    pub fn set_behavior(&self, behavior: LoopbackBehavior) {
        self.lock().behavior = behavior;
    }

    /// Identity reported for a granted access request.
    pub fn remote_for(&self, address: &TransportAddress) -> DiscoveredDevice {
        let address = if address.is_any() {
            match self.kind {
                TransportKind::Ant => TransportAddress::Ant(LOOPBACK_ANT_NUMBER),
                TransportKind::Ble => TransportAddress::Ble(LOOPBACK_MAC.to_string()),
            }
        } else {
            address.clone()
        };
        DiscoveredDevice {
            name: format!("Loopback {} remote", self.kind),
            address,
            signal_strength: Some(-60),
        }
    }

    /// Sends one button press on the open session. BLE presses are followed
    /// by the key-release report.
    pub fn press(&self, code: u16) -> bool {
        let mut inner = self.lock();
        let (source, bytes) = match self.kind {
            TransportKind::Ant => {
                inner.sequence = inner.sequence.wrapping_add(1);
                let page = protocol::encode_ant_command(LOOPBACK_SERIAL, inner.sequence, code);
                (None, page.to_vec())
            }
            TransportKind::Ble => (
                Some(HID_REPORT_CHAR_UUID.to_string()),
                protocol::encode_hid_usage(code),
            ),
        };
        inner.last_payload = Some((source.clone(), bytes.clone()));

        let Some((_, sink)) = inner.session.as_ref() else {
            return false;
        };
        let sent = sink.send(TransportEvent::Payload {
            source: source.clone(),
            bytes,
        });
        if self.kind == TransportKind::Ble {
            sink.send(TransportEvent::Payload {
                source,
                bytes: protocol::encode_hid_usage(0),
            });
        }
        sent
    }

    /// Sends the previous payload again unchanged.
    pub fn repeat_last(&self) -> bool {
        let inner = self.lock();
        match (inner.session.as_ref(), inner.last_payload.clone()) {
            (Some((_, sink)), Some((source, bytes))) => {
                sink.send(TransportEvent::Payload { source, bytes })
            }
            _ => false,
        }
    }

    pub fn drop_link(&self) -> bool {
        let inner = self.lock();
        match inner.session.as_ref() {
            Some((_, sink)) => sink.send(TransportEvent::LinkState(LinkState::Dead)),
            None => false,
        }
    }

    /// Grants the most recent request after its handle may already be
    /// released.
    pub fn answer_late(&self) -> bool {
        let inner = self.lock();
        let (Some(sink), Some((_, address))) = (inner.last_sink.as_ref(), inner.requests.last())
        else {
            return false;
        };
        sink.send(TransportEvent::AccessResult(Ok(self.remote_for(address))))
    }

    pub fn announce(&self, device: DiscoveredDevice) -> bool {
        let inner = self.lock();
        match inner.discovery.as_ref() {
            Some(sink) => sink.send(TransportEvent::DeviceFound(device)),
            None => false,
        }
    }

    pub fn fail_discovery(&self, class: FailureClass) -> bool {
        let inner = self.lock();
        match inner.discovery.as_ref() {
            Some(sink) => sink.send(TransportEvent::DiscoveryFailed(class)),
            None => false,
        }
    }

    pub fn set_characteristics(&self, characteristics: Vec<Characteristic>) {
        self.lock().characteristics = characteristics;
    }

    pub fn fail_descriptor(&self, uuid: &str) {
        self.lock().failing_descriptor = Some(uuid.to_string());
    }

    /// Keep descriptor acknowledgments until [`Self::release_descriptor_ack`].
    pub fn hold_descriptor_acks(&self) {
        self.lock().hold_acks = true;
    }

    pub fn release_descriptor_ack(&self) -> bool {
        let mut inner = self.lock();
        match inner.held_acks.pop_front() {
            Some((sink, event)) => sink.send(event),
            None => false,
        }
    }

    pub fn descriptor_writes(&self) -> Vec<String> {
        self.lock().descriptor_writes.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.lock().requests.iter().map(|(at, _)| *at).collect()
    }

    pub fn requested_addresses(&self) -> Vec<TransportAddress> {
        self.lock()
            .requests
            .iter()
            .map(|(_, address)| address.clone())
            .collect()
    }

    pub fn closed_handles(&self) -> usize {
        self.lock().closed
    }

    pub fn has_session(&self) -> bool {
        self.lock().session.is_some()
    }

    pub fn is_discovering(&self) -> bool {
        self.lock().discovery.is_some()
    }

    fn permission(&self) -> &'static str {
        match self.kind {
            TransportKind::Ant => "ANT_RADIO_SERVICE",
            TransportKind::Ble => "BLUETOOTH_CONNECT",
        }
    }
}

impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn request_access(
        &self,
        address: &TransportAddress,
        events: EventSink,
    ) -> Result<Box<dyn AccessHandle>, AccessError> {
        let mut inner = self.lock();
        inner.requests.push((Instant::now(), address.clone()));
        debug!("Loopback {} access request for {}", self.kind, address);

        let behavior = inner.behavior;
        match behavior {
            LoopbackBehavior::PermissionDenied => {
                return Err(AccessError::PermissionDenied(self.permission().to_string()))
            }
            LoopbackBehavior::AdapterOff => return Err(AccessError::AdapterUnavailable),
            LoopbackBehavior::Accept => {
                if self.kind == TransportKind::Ant {
                    events.send(TransportEvent::LinkState(LinkState::Searching));
                }
                events.send(TransportEvent::AccessResult(Ok(self.remote_for(address))));
                if self.kind == TransportKind::Ant {
                    events.send(TransportEvent::LinkState(LinkState::Tracking));
                }
            }
            LoopbackBehavior::Fail(class) => {
                events.send(TransportEvent::AccessResult(Err(class)));
            }
            LoopbackBehavior::Unanswered => {}
        }

        inner.next_handle += 1;
        let id = inner.next_handle;
        inner.last_sink = Some(events.clone());
        inner.session = Some((id, events));
        Ok(Box::new(LoopbackHandle {
            id,
            inner: self.inner.clone(),
        }))
    }

    fn start_discovery(&self, events: EventSink) -> Result<(), AccessError> {
        let mut inner = self.lock();
        match inner.behavior {
            LoopbackBehavior::PermissionDenied => {
                Err(AccessError::PermissionDenied(self.permission().to_string()))
            }
            LoopbackBehavior::AdapterOff => Err(AccessError::AdapterUnavailable),
            _ => {
                inner.discovery = Some(events);
                Ok(())
            }
        }
    }

    fn stop_discovery(&self) {
        self.lock().discovery = None;
    }
}

pub struct LoopbackHandle {
    id: u64,
    inner: Arc<Mutex<Inner>>,
}

impl LoopbackHandle {
    fn sink(&self, inner: &Inner) -> Option<EventSink> {
        inner
            .session
            .as_ref()
            .filter(|(id, _)| *id == self.id)
            .map(|(_, sink)| sink.clone())
    }
}

impl AccessHandle for LoopbackHandle {
    fn close(&mut self) {
        let mut inner = lock(&self.inner);
        inner.closed += 1;
        if inner.session.as_ref().map_or(false, |(id, _)| *id == self.id) {
            inner.session = None;
            inner.held_acks.clear();
        }
    }

    fn discover_services(&mut self) -> Result<(), AccessError> {
        let inner = lock(&self.inner);
        if let Some(sink) = self.sink(&inner) {
            sink.send(TransportEvent::ServicesDiscovered(
                inner.characteristics.clone(),
            ));
        }
        Ok(())
    }

    fn enable_notification(&mut self, _characteristic: &Characteristic) -> Result<(), AccessError> {
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        characteristic: &Characteristic,
        _value: DescriptorValue,
    ) -> Result<(), AccessError> {
        let mut inner = lock(&self.inner);
        inner.descriptor_writes.push(characteristic.uuid.clone());

        let success = inner.failing_descriptor.as_deref() != Some(characteristic.uuid.as_str());
        let event = TransportEvent::DescriptorWritten {
            characteristic: characteristic.uuid.clone(),
            success,
        };
        if let Some(sink) = self.sink(&inner) {
            if inner.hold_acks {
                inner.held_acks.push_back((sink, event));
            } else {
                sink.send(event);
            }
        }
        Ok(())
    }
}
