//! Remote connectivity and command engine for a bike computer.
//!
//! External wireless remotes (ANT-like and BLE-like) are kept connected by a
//! per-transport connection state machine supervised by a reconnection policy.
//! Raw button signals are disambiguated into single/double presses and routed
//! to host actions through the command router.

pub mod domain;
pub mod infrastructure;

pub use domain::error::RemoteError;
pub use domain::models::{
    AppEvent, ConnectionState, HostAction, LogicalButton, PressType, RawCommand, RemoteDevice,
    TransportAddress, TransportKind,
};
pub use infrastructure::transport::RemoteService;
