//! USB transport abstraction
//!
//! The engine talks to the receiver only through [`Transport`]. Completions
//! and hotplug notifications come back as [`TransportEvent`] messages returned
//! from [`Transport::handle_events`], never as re-entrant callbacks, so the
//! engine decides when its own state is borrowed.

use nix::poll::PollFlags;
use std::fmt::Debug;
use std::os::fd::RawFd;
use std::time::Duration;
use thiserror::Error;

/// Transport level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Device not found")]
    NotFound,

    #[error("Access denied (insufficient permissions)")]
    Access,

    #[error("Resource busy")]
    Busy,

    #[error("Device disconnected")]
    NoDevice,

    #[error("Operation timed out")]
    Timeout,

    #[error("Endpoint stalled")]
    Pipe,

    #[error("I/O error")]
    Io,

    #[error("Invalid parameter")]
    InvalidParam,

    #[error("Operation not supported")]
    NotSupported,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Identifies one submitted asynchronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

/// Final status of an asynchronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    Error,
}

/// Completion of an asynchronous transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    pub id: TransferId,
    pub status: TransferStatus,
    /// Bytes actually transferred
    pub data: Vec<u8>,
}

/// Something the transport observed while pumping events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent<D> {
    Transfer(TransferCompletion),
    /// A device matching the hotplug filter was attached
    Arrived(D),
    /// A device matching the hotplug filter was detached
    Left(D),
}

/// Setup fields of a host-to-device control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Which interface and endpoint of the device to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSelector {
    /// Index of the configuration descriptor
    pub config_index: u8,
    pub interface: u8,
    pub alt_setting: u8,
    /// Position of the interrupt IN endpoint within the alternate setting
    pub endpoint_index: usize,
}

/// Result of claiming an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    /// Address of the interrupt IN endpoint, direction bit included
    pub in_endpoint: u8,
}

/// Native USB stack as seen by the engine
pub trait Transport {
    /// Identity of a physical device, stable across open/close
    type Device: Clone + PartialEq + Debug;
    /// An open device
    type Handle;

    /// Subscribe to arrival and departure of devices with these ids
    fn register_hotplug(&mut self, vendor_id: u16, product_id: u16) -> Result<()>;

    fn open_by_id(&mut self, vendor_id: u16, product_id: u16) -> Result<Self::Handle>;

    /// Open a device previously reported by [`TransportEvent::Arrived`]
    fn open_device(&mut self, device: &Self::Device) -> Result<Self::Handle>;

    fn device_of(&self, handle: &Self::Handle) -> Self::Device;

    /// Detach any kernel driver and claim the selected interface
    fn claim_interface(
        &mut self,
        handle: &mut Self::Handle,
        selector: &InterfaceSelector,
    ) -> Result<InterfaceInfo>;

    /// Release `interface`, reattach the kernel driver and close the handle
    fn close(&mut self, handle: Self::Handle, interface: u8);

    /// Start an interrupt IN read of up to `length` bytes
    fn submit_interrupt_in(
        &mut self,
        handle: &Self::Handle,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<TransferId>;

    /// Request cancellation; confirmation arrives as a `Cancelled` completion
    fn cancel_transfer(&mut self, id: TransferId);

    /// Synchronous control OUT transfer, returns the number of bytes written
    fn write_control(
        &mut self,
        handle: &Self::Handle,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Pump the stack, waiting at most `timeout` for something to happen
    fn handle_events(&mut self, timeout: Duration) -> Result<Vec<TransportEvent<Self::Device>>>;

    /// Descriptors the stack currently wants watched, with their interest
    fn poll_fds(&self) -> Vec<(RawFd, PollFlags)>;
}
