//! Shared runtime pieces for the Harmony remote driver
//!
//! This crate provides the single-threaded reactor, the transport abstraction
//! the engine is written against, a swappable clock, error types and logging
//! setup. [`test_utils`] holds a scripted transport for exercising the engine
//! without hardware.

pub mod clock;
pub mod error;
pub mod logging;
pub mod reactor;
pub mod test_utils;
pub mod transport;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use reactor::{Reactor, ReactorError, TimerHandle, WatchHandle};
pub use transport::{
    ControlSetup, InterfaceInfo, InterfaceSelector, TransferCompletion, TransferId, TransferStatus, Transport,
    TransportError, TransportEvent,
};
