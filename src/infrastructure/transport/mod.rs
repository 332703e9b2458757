//! Transport Module
//!
//! Connectivity to ANT-like and BLE-like remotes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      RemoteService                        │
//! │   (coordinator - public API for the application)          │
//! └──────┬──────────────────┬──────────────────┬─────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌─────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Reconnection│──▶│  Connection   │   │ Disambiguator│
//! │   Policy    │   │ state machine │──▶│   + Router   │
//! │ - backoff   │   │ (one/transport)   │              │
//! │ - liveness  │   │ - GATT queue  │   └──────────────┘
//! └─────────────┘   └───────┬───────┘
//!                           │ EventSink (channel)
//!                           ▼
//!                   ┌───────────────┐
//!                   │   Transport   │  vendor radio primitives
//!                   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - payload decoding into raw commands
//! - [`scanner`] - deduplicated list of discovered remotes
//! - [`gatt`] - one-at-a-time descriptor write queue (BLE)
//! - [`connection`] - per-transport connection state machine
//! - [`reconnect`] - backoff loop and liveness check
//! - [`loopback`] - scriptable in-memory transport
//! - [`service`] - main service coordinator

pub mod connection;
pub mod gatt;
pub mod loopback;
pub mod protocol;
pub mod reconnect;
pub mod scanner;
pub mod service;

pub use service::RemoteService;

use crate::domain::error::{AccessError, FailureClass};
use crate::domain::models::{DiscoveredDevice, TransportAddress, TransportKind};
use tokio::sync::mpsc;

/// Session number reserved for discovery callbacks.
pub const DISCOVERY_SESSION: u64 = 0;

/// A GATT characteristic reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: String,
    pub service: String,
    pub notify: bool,
    pub indicate: bool,
}

impl Characteristic {
    pub fn is_subscribable(&self) -> bool {
        self.notify || self.indicate
    }

    /// CCCD value to write; notify is preferred when both are offered.
    pub fn descriptor_value(&self) -> DescriptorValue {
        if self.notify {
            DescriptorValue::Notify
        } else {
            DescriptorValue::Indicate
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorValue {
    Notify,
    Indicate,
}

impl DescriptorValue {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Notify => &[0x01, 0x00],
            Self::Indicate => &[0x02, 0x00],
        }
    }
}

/// Radio-level link condition reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Searching,
    Tracking,
    Dead,
    Closed,
}

/// Everything a transport can report back to its state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    AccessResult(Result<DiscoveredDevice, FailureClass>),
    LinkState(LinkState),
    ServicesDiscovered(Vec<Characteristic>),
    DescriptorWritten { characteristic: String, success: bool },
    Payload { source: Option<String>, bytes: Vec<u8> },
    DeviceFound(DiscoveredDevice),
    DiscoveryFailed(FailureClass),
}

#[derive(Debug)]
pub struct SessionEvent {
    pub session: u64,
    pub event: TransportEvent,
}

/// Callback side handed to a transport. Pushes events onto the owning state
/// machine's queue, tagged with the access session they belong to.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Returns false once the state machine is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Release handle returned by [`Transport::request_access`]. GATT requests
/// are answered asynchronously through the session's [`EventSink`].
pub trait AccessHandle: Send {
    fn close(&mut self);

    fn discover_services(&mut self) -> Result<(), AccessError> {
        Err(AccessError::Unsupported)
    }

    fn enable_notification(&mut self, _characteristic: &Characteristic) -> Result<(), AccessError> {
        Err(AccessError::Unsupported)
    }

    fn write_descriptor(
        &mut self,
        _characteristic: &Characteristic,
        _value: DescriptorValue,
    ) -> Result<(), AccessError> {
        Err(AccessError::Unsupported)
    }
}

/// Opaque vendor radio primitives for one transport kind.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn request_access(
        &self,
        address: &TransportAddress,
        events: EventSink,
    ) -> Result<Box<dyn AccessHandle>, AccessError>;

    fn start_discovery(&self, events: EventSink) -> Result<(), AccessError>;

    fn stop_discovery(&self);
}
