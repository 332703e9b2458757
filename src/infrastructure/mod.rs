//! Infrastructure layer: transports, persistence, logging and the host sink.

pub mod dispatcher;
pub mod logging;
pub mod storage;
pub mod transport;
