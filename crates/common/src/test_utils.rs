//! Test utilities
//!
//! [`MockTransport`] stands in for the native USB stack: tests script the
//! frames a receiver would send, inject hotplug events and failures, and
//! inspect what the engine wrote and how many transfers it kept in flight.
//! [`ManualClock`] makes long-press and deadline timing deterministic.
//!
//! Clones of a `MockTransport` share state, so a test keeps one clone as a
//! controller and hands the other to the code under test.
//!
//! # Example
//!
//! ```
//! use common::test_utils::MockTransport;
//! use common::Transport;
//! use std::time::Duration;
//!
//! let mock = MockTransport::new().unwrap();
//! let device = mock.add_device(1);
//!
//! let mut transport = mock.clone();
//! let handle = transport.open_by_id(0x046d, 0xc52b).unwrap();
//! transport.submit_interrupt_in(&handle, 0x83, 32, Duration::from_secs(1)).unwrap();
//!
//! mock.push_input(device, &[0x20, 0x01, 0x03, 0xEC, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
//! let events = transport.handle_events(Duration::ZERO).unwrap();
//! assert_eq!(events.len(), 1);
//! ```

use crate::clock::Clock;
use crate::transport::{
    ControlSetup, InterfaceInfo, InterfaceSelector, Result, TransferCompletion, TransferId, TransferStatus,
    Transport, TransportError, TransportEvent,
};
use nix::poll::PollFlags;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Default receiver ids used by [`MockTransport::add_device`]
pub const MOCK_VENDOR_ID: u16 = 0x046d;
pub const MOCK_PRODUCT_ID: u16 = 0xc52b;

/// Interrupt IN endpoint reported when an interface is claimed
pub const MOCK_IN_ENDPOINT: u8 = 0x83;

/// Clock that only moves when told to
///
/// Clones share the same time. [`Clock::sleep`] advances it instantly.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }

    /// Time advanced since construction
    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Identity of a simulated receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockDeviceId(pub u32);

/// Open handle to a simulated receiver
#[derive(Debug, PartialEq, Eq)]
pub struct MockHandle {
    device: MockDeviceId,
}

/// A control write recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub device: MockDeviceId,
    pub setup: ControlSetup,
    pub data: Vec<u8>,
    pub timeout: Duration,
}

/// Produces the frames a receiver sends back for a written request
type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>>>;

struct MockDevice {
    id: MockDeviceId,
    vendor_id: u16,
    product_id: u16,
}

struct InFlight {
    id: TransferId,
    device: MockDeviceId,
    deadline: Option<Instant>,
    cancelled: bool,
}

struct MockState {
    devices: Vec<MockDevice>,
    hotplug_filter: Option<(u16, u16)>,
    hotplug: VecDeque<TransportEvent<MockDeviceId>>,
    input: HashMap<MockDeviceId, VecDeque<Vec<u8>>>,
    in_flight: Vec<InFlight>,
    max_in_flight: usize,
    submitted: usize,
    next_transfer: u64,
    timeouts: Vec<Duration>,
    expire_pending: bool,
    open_handles: usize,
    opened: Vec<MockDeviceId>,
    claimed: Vec<MockDeviceId>,
    closed: Vec<MockDeviceId>,
    writes: Vec<SentRequest>,
    responder: Option<Responder>,
    fail_open: Option<TransportError>,
    fail_claim: Option<TransportError>,
    fail_submit: Option<TransportError>,
    fail_writes: Option<TransportError>,
    short_writes: bool,
    ignore_cancel: bool,
    clock: Option<ManualClock>,
    wake_tx: UnixStream,
    wake_rx: UnixStream,
}

impl MockState {
    fn wake(&mut self) {
        // A full socket buffer already means readable
        let _ = self.wake_tx.write(&[1]);
    }

    fn drain_wake(&mut self) {
        let mut buf = [0u8; 64];
        while matches!(self.wake_rx.read(&mut buf), Ok(n) if n > 0) {}
    }

    fn is_present(&self, device: MockDeviceId) -> bool {
        self.devices.iter().any(|d| d.id == device)
    }

    fn now(&self) -> Option<Instant> {
        self.clock.as_ref().map(Clock::now)
    }

    fn matches_filter(&self, device: &MockDevice) -> bool {
        self.hotplug_filter == Some((device.vendor_id, device.product_id))
    }

    /// Completions deliverable without waiting
    fn ready_completions(&mut self, force_timeout: bool) -> Vec<TransferCompletion> {
        let mut completions = Vec::new();
        let now = self.now();
        let mut remaining = Vec::new();

        for transfer in std::mem::take(&mut self.in_flight) {
            let status = if transfer.cancelled {
                Some((TransferStatus::Cancelled, Vec::new()))
            } else if !self.is_present(transfer.device) {
                Some((TransferStatus::NoDevice, Vec::new()))
            } else if let Some(frame) = self
                .input
                .get_mut(&transfer.device)
                .and_then(VecDeque::pop_front)
            {
                Some((TransferStatus::Completed, frame))
            } else if force_timeout
                || matches!((now, transfer.deadline), (Some(now), Some(deadline)) if now >= deadline)
            {
                Some((TransferStatus::TimedOut, Vec::new()))
            } else {
                None
            };

            match status {
                Some((status, data)) => completions.push(TransferCompletion {
                    id: transfer.id,
                    status,
                    data,
                }),
                None => remaining.push(transfer),
            }
        }

        self.in_flight = remaining;
        completions
    }
}

/// Scripted in-memory [`Transport`]
#[derive(Clone)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new() -> io::Result<Self> {
        let (wake_tx, wake_rx) = UnixStream::pair()?;
        wake_tx.set_nonblocking(true)?;
        wake_rx.set_nonblocking(true)?;

        Ok(Self {
            state: Rc::new(RefCell::new(MockState {
                devices: Vec::new(),
                hotplug_filter: None,
                hotplug: VecDeque::new(),
                input: HashMap::new(),
                in_flight: Vec::new(),
                max_in_flight: 0,
                submitted: 0,
                next_transfer: 1,
                timeouts: Vec::new(),
                expire_pending: false,
                open_handles: 0,
                opened: Vec::new(),
                claimed: Vec::new(),
                closed: Vec::new(),
                writes: Vec::new(),
                responder: None,
                fail_open: None,
                fail_claim: None,
                fail_submit: None,
                fail_writes: None,
                short_writes: false,
                ignore_cancel: false,
                clock: None,
                wake_tx,
                wake_rx,
            })),
        })
    }

    /// Drive transfer timeouts from `clock`
    ///
    /// Without a clock an idle transfer times out on any blocking pump.
    pub fn with_clock(self, clock: ManualClock) -> Self {
        self.state.borrow_mut().clock = Some(clock);
        self
    }

    /// A receiver already plugged in, with the default ids
    pub fn add_device(&self, id: u32) -> MockDeviceId {
        self.add_device_with_ids(id, MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
    }

    pub fn add_device_with_ids(&self, id: u32, vendor_id: u16, product_id: u16) -> MockDeviceId {
        let device = MockDeviceId(id);
        self.state.borrow_mut().devices.push(MockDevice {
            id: device,
            vendor_id,
            product_id,
        });
        device
    }

    /// Plug in a receiver and queue an arrival notification
    pub fn arrive(&self, id: u32) -> MockDeviceId {
        let device = self.add_device(id);
        let mut state = self.state.borrow_mut();
        let notify = state
            .devices
            .last()
            .is_some_and(|d| state.matches_filter(d));
        if notify {
            state.hotplug.push_back(TransportEvent::Arrived(device));
            state.wake();
        }
        device
    }

    /// Unplug a receiver and queue a departure notification
    pub fn leave(&self, device: MockDeviceId) {
        let mut state = self.state.borrow_mut();
        let Some(pos) = state.devices.iter().position(|d| d.id == device) else {
            return;
        };
        let removed = state.devices.remove(pos);
        if state.matches_filter(&removed) {
            state.hotplug.push_back(TransportEvent::Left(device));
        }
        state.wake();
    }

    /// Queue a frame the receiver will deliver to the next read
    pub fn push_input(&self, device: MockDeviceId, frame: &[u8]) {
        let mut state = self.state.borrow_mut();
        state
            .input
            .entry(device)
            .or_default()
            .push_back(frame.to_vec());
        state.wake();
    }

    /// Answer every control write with the frames `responder` returns
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + 'static,
    {
        self.state.borrow_mut().responder = Some(Box::new(responder));
    }

    pub fn clear_responder(&self) {
        self.state.borrow_mut().responder = None;
    }

    /// Make every in-flight read time out on the next pump
    pub fn expire_transfers(&self) {
        let mut state = self.state.borrow_mut();
        state.expire_pending = true;
        state.wake();
    }

    pub fn fail_next_open(&self, error: TransportError) {
        self.state.borrow_mut().fail_open = Some(error);
    }

    pub fn fail_next_claim(&self, error: TransportError) {
        self.state.borrow_mut().fail_claim = Some(error);
    }

    pub fn fail_next_submit(&self, error: TransportError) {
        self.state.borrow_mut().fail_submit = Some(error);
    }

    /// Fail all control writes until cleared with `None`
    pub fn fail_writes(&self, error: Option<TransportError>) {
        self.state.borrow_mut().fail_writes = error;
    }

    /// Report one byte fewer than requested for every control write
    pub fn short_writes(&self, enabled: bool) {
        self.state.borrow_mut().short_writes = enabled;
    }

    /// Accept cancellation requests without ever confirming them
    pub fn ignore_cancel(&self, enabled: bool) {
        self.state.borrow_mut().ignore_cancel = enabled;
    }

    /// Transfers submitted and not yet completed
    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight.len()
    }

    /// Highest number of simultaneously outstanding transfers seen
    pub fn max_in_flight(&self) -> usize {
        self.state.borrow().max_in_flight
    }

    pub fn submitted(&self) -> usize {
        self.state.borrow().submitted
    }

    /// Timeout of every submitted read, in submission order
    pub fn submitted_timeouts(&self) -> Vec<Duration> {
        self.state.borrow().timeouts.clone()
    }

    pub fn writes(&self) -> Vec<SentRequest> {
        self.state.borrow().writes.clone()
    }

    pub fn open_handles(&self) -> usize {
        self.state.borrow().open_handles
    }

    /// Devices opened, in order
    pub fn opened(&self) -> Vec<MockDeviceId> {
        self.state.borrow().opened.clone()
    }

    /// Devices with a claimed interface
    pub fn claimed(&self) -> Vec<MockDeviceId> {
        self.state.borrow().claimed.clone()
    }

    /// Devices closed, in order
    pub fn closed(&self) -> Vec<MockDeviceId> {
        self.state.borrow().closed.clone()
    }

    /// Frames still waiting for a read
    pub fn pending_input(&self, device: MockDeviceId) -> usize {
        self.state
            .borrow()
            .input
            .get(&device)
            .map_or(0, VecDeque::len)
    }

    fn open(&mut self, device: MockDeviceId) -> Result<MockHandle> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.fail_open.take() {
            return Err(error);
        }
        if !state.is_present(device) {
            return Err(TransportError::NotFound);
        }
        state.open_handles += 1;
        state.opened.push(device);
        Ok(MockHandle { device })
    }
}

impl Transport for MockTransport {
    type Device = MockDeviceId;
    type Handle = MockHandle;

    fn register_hotplug(&mut self, vendor_id: u16, product_id: u16) -> Result<()> {
        self.state.borrow_mut().hotplug_filter = Some((vendor_id, product_id));
        Ok(())
    }

    fn open_by_id(&mut self, vendor_id: u16, product_id: u16) -> Result<MockHandle> {
        let device = self
            .state
            .borrow()
            .devices
            .iter()
            .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
            .map(|d| d.id);
        match device {
            Some(device) => self.open(device),
            None => Err(TransportError::NotFound),
        }
    }

    fn open_device(&mut self, device: &MockDeviceId) -> Result<MockHandle> {
        self.open(*device)
    }

    fn device_of(&self, handle: &MockHandle) -> MockDeviceId {
        handle.device
    }

    fn claim_interface(
        &mut self,
        handle: &mut MockHandle,
        selector: &InterfaceSelector,
    ) -> Result<InterfaceInfo> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.fail_claim.take() {
            return Err(error);
        }
        state.claimed.push(handle.device);
        Ok(InterfaceInfo {
            number: selector.interface,
            in_endpoint: MOCK_IN_ENDPOINT,
        })
    }

    fn close(&mut self, handle: MockHandle, _interface: u8) {
        let mut state = self.state.borrow_mut();
        state.claimed.retain(|d| *d != handle.device);
        state.open_handles = state.open_handles.saturating_sub(1);
        state.closed.push(handle.device);
    }

    fn submit_interrupt_in(
        &mut self,
        handle: &MockHandle,
        _endpoint: u8,
        _length: usize,
        timeout: Duration,
    ) -> Result<TransferId> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.fail_submit.take() {
            return Err(error);
        }
        if !state.is_present(handle.device) {
            return Err(TransportError::NoDevice);
        }

        let id = TransferId(state.next_transfer);
        state.next_transfer += 1;
        let deadline = state.now().map(|now| now + timeout);
        state.in_flight.push(InFlight {
            id,
            device: handle.device,
            deadline,
            cancelled: false,
        });
        state.submitted += 1;
        state.timeouts.push(timeout);
        state.max_in_flight = state.max_in_flight.max(state.in_flight.len());

        if state
            .input
            .get(&handle.device)
            .is_some_and(|queue| !queue.is_empty())
        {
            state.wake();
        }
        Ok(id)
    }

    fn cancel_transfer(&mut self, id: TransferId) {
        let mut state = self.state.borrow_mut();
        if state.ignore_cancel {
            return;
        }
        if let Some(transfer) = state.in_flight.iter_mut().find(|t| t.id == id) {
            transfer.cancelled = true;
            state.wake();
        }
    }

    fn write_control(
        &mut self,
        handle: &MockHandle,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let responder = {
            let mut state = self.state.borrow_mut();
            if let Some(error) = state.fail_writes.clone() {
                return Err(error);
            }
            if !state.is_present(handle.device) {
                return Err(TransportError::NoDevice);
            }
            state.writes.push(SentRequest {
                device: handle.device,
                setup,
                data: data.to_vec(),
                timeout,
            });
            state.responder.take()
        };

        // Responder runs unborrowed so it may inspect the mock
        if let Some(mut responder) = responder {
            let frames = responder(data);
            let mut state = self.state.borrow_mut();
            if state.responder.is_none() {
                state.responder = Some(responder);
            }
            if !frames.is_empty() {
                state.input.entry(handle.device).or_default().extend(frames);
                state.wake();
            }
        }

        let state = self.state.borrow();
        if state.short_writes {
            Ok(data.len().saturating_sub(1))
        } else {
            Ok(data.len())
        }
    }

    fn handle_events(&mut self, timeout: Duration) -> Result<Vec<TransportEvent<MockDeviceId>>> {
        let mut state = self.state.borrow_mut();
        state.drain_wake();

        let force_timeout = std::mem::take(&mut state.expire_pending);
        let mut events: Vec<_> = state.hotplug.drain(..).collect();
        events.extend(
            state
                .ready_completions(force_timeout)
                .into_iter()
                .map(TransportEvent::Transfer),
        );

        if !events.is_empty() || timeout.is_zero() {
            return Ok(events);
        }

        // Nothing ready: block until the earliest read times out or the
        // pump timeout passes, whichever comes first
        let Some(clock) = state.clock.clone() else {
            if state.in_flight.is_empty() {
                return Ok(events);
            }
            return Ok(state
                .ready_completions(true)
                .into_iter()
                .map(TransportEvent::Transfer)
                .collect());
        };

        let now = clock.now();
        let earliest = state
            .in_flight
            .iter()
            .filter_map(|t| t.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now));

        match earliest {
            Some(wait) if wait <= timeout => {
                clock.advance(wait);
                Ok(state
                    .ready_completions(false)
                    .into_iter()
                    .map(TransportEvent::Transfer)
                    .collect())
            }
            _ => {
                clock.advance(timeout);
                Ok(events)
            }
        }
    }

    fn poll_fds(&self) -> Vec<(RawFd, PollFlags)> {
        vec![(self.state.borrow().wake_rx.as_raw_fd(), PollFlags::POLLIN)]
    }
}
