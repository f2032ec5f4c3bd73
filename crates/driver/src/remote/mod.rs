//! Session and protocol engine for the Harmony remote
//!
//! [`Remote`] owns the connection to the Unifying receiver. It keeps exactly
//! one interrupt read in flight while anyone is listening, decodes each frame
//! and turns press/release/timeout sequences into key codes:
//!
//! - key down, then key up before the long-press threshold: plain code
//! - key down, then no frame until the threshold: code with the long-press flag
//! - wireless link lost while a key is held: nothing
//!
//! The long-press threshold is enforced by the read timeout itself, so no
//! separate timer is involved.
//!
//! HID++ configuration requests share the same read stream. At most one may
//! be outstanding; its response or error frame is picked out of the stream
//! by device index and sub id.
//!
//! # Modes
//!
//! With a [`Reactor`], the transport's descriptors are registered as watches
//! and everything is callback driven. Each completion defers the next read to
//! the following reactor turn. Without a reactor, [`Remote::get_key`],
//! [`Remote::send_request_and_wait`] and [`Remote::process_events`] pump the
//! transport directly.
//!
//! # Reentrancy
//!
//! Engine state lives in a `RefCell` and is never borrowed while user
//! callbacks run. Callbacks may call back into the engine, e.g. to send a
//! request from a key callback.

mod receiver;
mod request;
mod session;

pub use request::{ResponseCallback, ResponseHandlers};
pub use session::KeyState;

use crate::config::Config;
use common::{
    Clock, ControlSetup, InterfaceSelector, Reactor, SystemClock, TransferCompletion, TransferId,
    TransferStatus, Transport, TransportEvent, WatchHandle,
};
use nix::poll::PollFlags;
use protocol::{Frame, FirmwareVersion, KeyCode, Report, TRANSFER_SIZE, hex_dump};
use request::{Outcome, PendingRequest};
use session::Session;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// HID class request writing an output report
const HID_SET_REPORT: u8 = 0x09;

/// Report type field of `SET_REPORT` for output reports
const HID_REPORT_TYPE_OUTPUT: u16 = 2;

/// Poll interval while waiting for a cancellation to be confirmed
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

type KeyCallback = Rc<RefCell<dyn FnMut(KeyCode)>>;

/// Engine parameters taken from [`Config`]
#[derive(Debug, Clone)]
struct Settings {
    vendor_id: u16,
    product_id: u16,
    selector: InterfaceSelector,
    idle_timeout: Duration,
    long_press: Duration,
    request_timeout: Duration,
    firmware_retries: u32,
    firmware_retry_delay: Duration,
    newest_supported_firmware: FirmwareVersion,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            vendor_id: config.receiver.vendor_id,
            product_id: config.receiver.product_id,
            selector: config.receiver.selector(),
            idle_timeout: config.timing.idle_timeout(),
            long_press: config.timing.long_press(),
            request_timeout: config.timing.request_timeout(),
            firmware_retries: config.timing.firmware_retries,
            firmware_retry_delay: config.timing.firmware_retry_delay(),
            newest_supported_firmware: FirmwareVersion(config.timing.newest_supported_firmware),
        }
    }
}

/// User callback queued while engine state was borrowed
enum Notice {
    Key(KeyCode),
    Response(ResponseCallback, Vec<u8>),
}

/// Result of handing a request to the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sent {
    Rejected,
    /// Written; nothing to wait for
    Unanswered,
    /// Written and awaiting the response with this sequence number
    Pending(u64),
}

struct State<T: Transport> {
    transport: T,
    session: Option<Session<T>>,
    pending: Option<PendingRequest>,
    next_seq: u64,
    firmware: Option<FirmwareVersion>,
    /// Bumped on every receiver initialization; stale retry timers check it
    init_generation: u64,
    /// Outstanding firmware query, abandoned when its retry fires
    firmware_request: Option<u64>,
    /// Reactor watches mirroring the transport's descriptors
    watches: HashMap<RawFd, (PollFlags, WatchHandle)>,
    resubmit_scheduled: bool,
    /// Events received but not yet dispatched
    backlog: VecDeque<TransportEvent<T::Device>>,
    shut_down: bool,
}

impl<T: Transport> State<T> {
    fn in_flight(&self) -> Option<TransferId> {
        self.session.as_ref().and_then(|s| s.in_flight)
    }

    fn expire_pending(&mut self, now: Instant) {
        if self.pending.as_ref().is_some_and(|p| p.is_expired(now))
            && let Some(request) = self.pending.take()
        {
            debug!(
                "Request {:#04x} to device {:#04x} timed out",
                request.sub_id, request.device_index
            );
        }
    }

    /// Drop the pending request if it is still `seq`
    fn abandon(&mut self, seq: u64) {
        if self.pending.as_ref().is_some_and(|p| p.seq == seq) {
            self.drop_pending("superseded by a retry");
        }
    }

    fn drop_pending(&mut self, reason: &str) {
        if let Some(request) = self.pending.take() {
            debug!("Dropping request {:#04x}: {}", request.sub_id, reason);
        }
    }
}

struct Shared<T: Transport> {
    reactor: Option<Rc<Reactor>>,
    clock: Rc<dyn Clock>,
    settings: Settings,
    state: RefCell<State<T>>,
    key_callback: RefCell<Option<KeyCallback>>,
    weak_self: Weak<Shared<T>>,
}

/// Driver for one Harmony remote behind a Unifying receiver
///
/// # Example
///
/// ```no_run
/// use common::Reactor;
/// use driver::config::Config;
/// use driver::remote::Remote;
/// use driver::usb::UsbTransport;
/// use std::rc::Rc;
///
/// # fn main() -> anyhow::Result<()> {
/// let config = Config::default();
/// let reactor = Rc::new(Reactor::new());
/// let transport = UsbTransport::new()?;
///
/// let remote = Remote::new(transport, Some(Rc::clone(&reactor)), &config);
/// remote.set_key_callback(|key| println!("{:#07x} {}", key.raw(), key));
/// reactor.run()?;
/// # Ok(())
/// # }
/// ```
pub struct Remote<T: Transport + 'static> {
    shared: Rc<Shared<T>>,
}

impl<T: Transport + 'static> Remote<T> {
    /// Create the engine and try to open the receiver
    ///
    /// Passing no reactor selects blocking mode. A missing receiver is not
    /// an error: it is picked up on first use or on hotplug arrival.
    pub fn new(transport: T, reactor: Option<Rc<Reactor>>, config: &Config) -> Self {
        Self::with_clock(transport, reactor, config, Rc::new(SystemClock))
    }

    pub fn with_clock(
        mut transport: T,
        reactor: Option<Rc<Reactor>>,
        config: &Config,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let settings = Settings::from(config);
        if let Err(e) = transport.register_hotplug(settings.vendor_id, settings.product_id) {
            warn!("Hotplug notifications unavailable: {}", e);
        }

        let shared = Rc::new_cyclic(|weak| Shared {
            reactor,
            clock,
            settings,
            state: RefCell::new(State {
                transport,
                session: None,
                pending: None,
                next_seq: 1,
                firmware: None,
                init_generation: 0,
                firmware_request: None,
                watches: HashMap::new(),
                resubmit_scheduled: false,
                backlog: VecDeque::new(),
                shut_down: false,
            }),
            key_callback: RefCell::new(None),
            weak_self: weak.clone(),
        });

        shared.ensure_session(&mut shared.state.borrow_mut());
        shared.sync_watches();
        shared.initialize_receiver();

        Self { shared }
    }

    /// Deliver every resolved key to `callback`
    ///
    /// Replaces any previous callback and starts reading if needed.
    pub fn set_key_callback<F>(&self, callback: F)
    where
        F: FnMut(KeyCode) + 'static,
    {
        let callback: KeyCallback = Rc::new(RefCell::new(callback));
        self.shared.install_key_callback(Some(callback));
    }

    /// Stop key delivery
    ///
    /// Cancels the outstanding read and waits for the cancellation to be
    /// confirmed. A pending request is dropped without its callbacks.
    pub fn clear_key_callback(&self) {
        self.shared.install_key_callback(None);
    }

    /// Block until the next key is resolved
    ///
    /// Meant for programs without a reactor-driven key callback. Any key
    /// callback is suspended for the duration of the call.
    pub fn get_key(&self) -> KeyCode {
        let captured = Rc::new(Cell::new(None));
        let sink = Rc::clone(&captured);
        let capture: KeyCallback = Rc::new(RefCell::new(move |key: KeyCode| {
            if sink.get().is_none() {
                sink.set(Some(key));
            }
        }));

        let previous = self.shared.key_callback.replace(Some(capture));
        let key = loop {
            if let Some(key) = captured.get() {
                break key;
            }
            self.shared.submit_next();
            self.shared.pump(self.shared.settings.idle_timeout);
        };
        self.shared.install_key_callback(previous);
        key
    }

    /// Write a request to the receiver
    ///
    /// Returns `false` without side effects if the frame length does not
    /// match its report id, another HID++ request is outstanding, or no
    /// receiver can be opened. HID++ requests with at least one callback stay
    /// pending until answered or until the request timeout passes.
    pub fn send_request(&self, request: &[u8], handlers: ResponseHandlers) -> bool {
        self.shared.send(request, handlers) != Sent::Rejected
    }

    /// Like [`send_request`](Self::send_request), then pump until the
    /// request is answered or times out
    ///
    /// A HID++ request still outstanding, such as the firmware query issued
    /// at start-up in reactor mode, is waited for first instead of causing a
    /// rejection.
    pub fn send_request_and_wait(&self, request: &[u8], handlers: ResponseHandlers) -> bool {
        self.shared.send_and_wait(request, handlers)
    }

    /// Pump the transport once, waiting at most `timeout`
    ///
    /// For blocking-mode hosts that run their own loop around a key callback.
    pub fn process_events(&self, timeout: Duration) {
        self.shared.submit_next();
        self.shared.pump(timeout);
    }

    /// Name of the paired device in `slot`, queried from the receiver
    pub fn paired_device_name(&self, slot: u8) -> Option<String> {
        self.shared.paired_device_name(slot)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().session.is_some()
    }

    pub fn has_pending_request(&self) -> bool {
        self.shared.state.borrow().pending.is_some()
    }

    /// Firmware version reported by the receiver, once known
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.shared.firmware()
    }

    /// Time the last frame was received on the current session
    pub fn last_frame_at(&self) -> Option<Instant> {
        self.shared
            .state
            .borrow()
            .session
            .as_ref()
            .and_then(|s| s.last_frame)
    }
}

impl<T: Transport + 'static> Drop for Remote<T> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl<T: Transport + 'static> Shared<T> {
    fn firmware(&self) -> Option<FirmwareVersion> {
        self.state.borrow().firmware
    }

    fn wants_input(&self, state: &State<T>) -> bool {
        !state.shut_down && (self.key_callback.borrow().is_some() || state.pending.is_some())
    }

    /// Open and claim the receiver unless a session already exists
    fn ensure_session(&self, state: &mut State<T>) -> bool {
        if state.session.is_some() {
            return true;
        }
        if state.shut_down {
            return false;
        }

        let handle = match state
            .transport
            .open_by_id(self.settings.vendor_id, self.settings.product_id)
        {
            Ok(handle) => handle,
            Err(e) => {
                debug!(
                    "Receiver {:04x}:{:04x} not available: {}",
                    self.settings.vendor_id, self.settings.product_id, e
                );
                return false;
            }
        };

        match self.claim(&mut state.transport, handle) {
            Some(session) => {
                info!("Receiver opened: {:?}", session.device);
                state.session = Some(session);
                true
            }
            None => false,
        }
    }

    fn claim(&self, transport: &mut T, mut handle: T::Handle) -> Option<Session<T>> {
        let selector = &self.settings.selector;
        match transport.claim_interface(&mut handle, selector) {
            Ok(interface) => {
                let device = transport.device_of(&handle);
                debug!(
                    "Claimed interface {} of {:?}, endpoint {:#04x}",
                    interface.number, device, interface.in_endpoint
                );
                Some(Session::new(handle, device, interface))
            }
            Err(e) => {
                warn!("Failed to claim interface {}: {}", selector.interface, e);
                transport.close(handle, selector.interface);
                None
            }
        }
    }

    /// Arm the next interrupt read if someone is listening and none is in flight
    fn submit_next(&self) {
        let mut guard = self.state.borrow_mut();
        if !self.wants_input(&guard) || !self.ensure_session(&mut guard) {
            return;
        }

        let now = self.clock.now();
        let state = &mut *guard;
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if session.in_flight.is_some() {
            return;
        }

        let timeout =
            session
                .key
                .read_timeout(now, self.settings.long_press, self.settings.idle_timeout);
        match state.transport.submit_interrupt_in(
            &session.handle,
            session.interface.in_endpoint,
            TRANSFER_SIZE,
            timeout,
        ) {
            Ok(id) => {
                trace!("Submitted read {:?} with timeout {:?}", id, timeout);
                session.in_flight = Some(id);
            }
            Err(e) => {
                // Typically the receiver is gone and a hotplug event follows
                warn!("Failed to submit interrupt transfer: {}", e);
                session.key = KeyState::Idle;
                state.drop_pending("transfer submission failed");
            }
        }
    }

    /// Arrange for [`submit_next`](Self::submit_next) on the next reactor turn
    ///
    /// Blocking loops resubmit at the top of every iteration instead.
    fn schedule_resubmit(&self) {
        let Some(reactor) = &self.reactor else {
            return;
        };
        {
            let mut state = self.state.borrow_mut();
            if state.resubmit_scheduled || state.shut_down {
                return;
            }
            state.resubmit_scheduled = true;
        }

        let weak = self.weak_self.clone();
        reactor.defer(move || {
            if let Some(shared) = weak.upgrade() {
                shared.state.borrow_mut().resubmit_scheduled = false;
                shared.submit_next();
                shared.sync_watches();
            }
        });
    }

    /// Pump the transport and process whatever it reports
    fn pump(&self, timeout: Duration) {
        {
            let mut state = self.state.borrow_mut();
            if state.backlog.is_empty() {
                match state.transport.handle_events(timeout) {
                    Ok(events) => state.backlog.extend(events),
                    Err(e) => warn!("Failed to handle USB events: {}", e),
                }
            }
        }

        // Handlers may pump again or wait for a cancellation, both of which
        // feed the same queue
        loop {
            let event = self.state.borrow_mut().backlog.pop_front();
            match event {
                Some(TransportEvent::Transfer(completion)) => self.on_transfer(completion),
                Some(TransportEvent::Arrived(device)) => self.on_arrived(device),
                Some(TransportEvent::Left(device)) => self.on_left(device),
                None => break,
            }
        }
        self.sync_watches();
    }

    fn on_transfer(&self, completion: TransferCompletion) {
        let notices = {
            let mut guard = self.state.borrow_mut();
            let now = self.clock.now();
            let state = &mut *guard;

            if state.in_flight() != Some(completion.id) {
                warn!("Unexpected transfer completion {:?}", completion.id);
                return;
            }
            state.expire_pending(now);

            let Some(session) = state.session.as_mut() else {
                return;
            };
            session.in_flight = None;

            let mut notices = Vec::new();
            match completion.status {
                TransferStatus::TimedOut => {
                    if let Some(code) = session.key.expire() {
                        debug!("Long press: {}", code);
                        notices.push(Notice::Key(code));
                    }
                }
                TransferStatus::Completed => {
                    session.last_frame = Some(now);
                    trace!("Received {}", hex_dump(&completion.data));
                    decode(
                        &completion.data,
                        now,
                        &mut session.key,
                        &mut state.pending,
                        &mut notices,
                    );
                }
                TransferStatus::Cancelled => {
                    session.key = KeyState::Idle;
                }
                status => {
                    warn!("Interrupt transfer failed: {:?}", status);
                    session.key = KeyState::Idle;
                    state.drop_pending("interrupt transfer failed");
                }
            }
            notices
        };

        self.schedule_resubmit();
        self.deliver(notices);
    }

    fn on_arrived(&self, device: T::Device) {
        let session = {
            let mut guard = self.state.borrow_mut();
            if guard.shut_down {
                return;
            }
            let state = &mut *guard;
            let handle = match state.transport.open_device(&device) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Failed to open arrived receiver {:?}: {}", device, e);
                    return;
                }
            };
            match self.claim(&mut state.transport, handle) {
                Some(session) => session,
                None => return,
            }
        };

        info!("Receiver attached: {:?}", device);
        self.teardown_session();
        self.state.borrow_mut().session = Some(session);

        self.schedule_resubmit();
        self.sync_watches();
        self.initialize_receiver();
    }

    fn on_left(&self, device: T::Device) {
        let active = self
            .state
            .borrow()
            .session
            .as_ref()
            .is_some_and(|s| s.device == device);

        if active {
            info!("Receiver detached: {:?}", device);
            self.teardown_session();
        } else {
            debug!("Ignoring departure of inactive device {:?}", device);
        }
    }

    /// Cancel the outstanding read, close the handle and forget all session state
    fn teardown_session(&self) {
        self.cancel_in_flight();

        let mut state = self.state.borrow_mut();
        if let Some(session) = state.session.take() {
            debug!("Closing receiver {:?}", session.device);
            state.transport.close(session.handle, session.interface.number);
        }
        state.drop_pending("receiver closed");
    }

    /// Cancel the outstanding read and wait until the transport confirms it
    ///
    /// Other events seen meanwhile stay queued for the next pump. Gives up
    /// after the idle timeout.
    fn cancel_in_flight(&self) {
        let Some(id) = ({
            let mut state = self.state.borrow_mut();
            let id = state.in_flight();
            if let Some(id) = id {
                state.transport.cancel_transfer(id);
            }
            id
        }) else {
            return;
        };

        let deadline = self.clock.now() + self.settings.idle_timeout;
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        loop {
            if state.in_flight() != Some(id) {
                return;
            }

            let confirmed = state
                .backlog
                .iter()
                .position(|event| matches!(event, TransportEvent::Transfer(c) if c.id == id));
            if let Some(position) = confirmed {
                if let Some(TransportEvent::Transfer(completion)) = state.backlog.remove(position) {
                    debug!("Transfer {:?} finished as {:?}", id, completion.status);
                }
                if let Some(session) = state.session.as_mut() {
                    session.in_flight = None;
                }
                return;
            }

            if self.clock.now() >= deadline {
                warn!("Cancellation of {:?} not confirmed, forgetting it", id);
                if let Some(session) = state.session.as_mut() {
                    session.in_flight = None;
                }
                return;
            }

            match state.transport.handle_events(CANCEL_POLL_INTERVAL) {
                Ok(events) => state.backlog.extend(events),
                Err(e) => warn!("Failed to handle USB events: {}", e),
            }
        }
    }

    fn install_key_callback(&self, callback: Option<KeyCallback>) {
        let enabled = callback.is_some();
        *self.key_callback.borrow_mut() = callback;

        if enabled {
            self.submit_next();
        } else {
            self.cancel_in_flight();
            let mut state = self.state.borrow_mut();
            if let Some(session) = state.session.as_mut() {
                session.key = KeyState::Idle;
            }
            state.drop_pending("key callback cleared");
        }
        self.sync_watches();
    }

    /// Mirror the transport's descriptor set into reactor watches
    fn sync_watches(&self) {
        let Some(reactor) = &self.reactor else {
            return;
        };
        let mut state = self.state.borrow_mut();
        let wanted: HashMap<RawFd, PollFlags> = if state.shut_down {
            HashMap::new()
        } else {
            state.transport.poll_fds().into_iter().collect()
        };

        state.watches.retain(|fd, (interest, handle)| {
            let keep = wanted.get(fd) == Some(&*interest);
            if !keep {
                reactor.remove_watch(*handle);
            }
            keep
        });

        for (fd, interest) in wanted {
            if state.watches.contains_key(&fd) {
                continue;
            }
            let weak = self.weak_self.clone();
            let handle = reactor.add_watch(fd, interest, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.pump(Duration::ZERO);
                }
            });
            trace!("Watching USB descriptor {}", fd);
            state.watches.insert(fd, (interest, handle));
        }
    }

    fn deliver(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Key(code) => {
                    let callback = self.key_callback.borrow().clone();
                    let Some(callback) = callback else {
                        continue;
                    };
                    match callback.try_borrow_mut() {
                        Ok(mut callback) => (&mut *callback)(code),
                        Err(_) => warn!("Key {} dropped: key callback is still running", code),
                    }
                }
                Notice::Response(callback, frame) => callback(&frame),
            }
        }
    }

    fn send(&self, request: &[u8], handlers: ResponseHandlers) -> Sent {
        let frame = match Frame::parse(request) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Rejecting malformed request: {}", e);
                return Sent::Rejected;
            }
        };
        let report_id = frame.report_id();

        let sent = {
            let mut guard = self.state.borrow_mut();
            let now = self.clock.now();
            guard.expire_pending(now);
            if report_id.is_hidpp() && guard.pending.is_some() {
                debug!("Rejecting request: another request is pending");
                return Sent::Rejected;
            }
            if !self.ensure_session(&mut guard) {
                return Sent::Rejected;
            }

            let state = &mut *guard;
            let Some(session) = state.session.as_ref() else {
                return Sent::Rejected;
            };

            let sent = if report_id.is_hidpp() && !handlers.is_empty() {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.pending = Some(PendingRequest::new(
                    seq,
                    &frame,
                    handlers,
                    now + self.settings.request_timeout,
                ));
                Sent::Pending(seq)
            } else {
                Sent::Unanswered
            };

            trace!("Sending {}", hex_dump(request));
            let setup = ControlSetup {
                request_type: rusb::request_type(
                    rusb::Direction::Out,
                    rusb::RequestType::Class,
                    rusb::Recipient::Interface,
                ),
                request: HID_SET_REPORT,
                value: (HID_REPORT_TYPE_OUTPUT << 8) | u16::from(report_id.as_byte()),
                index: u16::from(session.interface.number),
            };
            let written = state.transport.write_control(
                &session.handle,
                setup,
                request,
                self.settings.idle_timeout,
            );

            match written {
                Ok(n) if n == request.len() => sent,
                Ok(n) => {
                    warn!("Short request write: {} of {} bytes", n, request.len());
                    if let Sent::Pending(_) = sent {
                        state.pending = None;
                    }
                    return Sent::Rejected;
                }
                Err(e) => {
                    warn!("Failed to send request: {}", e);
                    if let Sent::Pending(_) = sent {
                        state.pending = None;
                    }
                    return Sent::Rejected;
                }
            }
        };

        if let Sent::Pending(_) = sent {
            self.schedule_resubmit();
            self.sync_watches();
        }
        sent
    }

    fn send_and_wait(&self, request: &[u8], handlers: ResponseHandlers) -> bool {
        if Frame::parse(request).is_ok_and(|frame| frame.report_id().is_hidpp()) {
            self.wait_until_idle();
        }
        match self.send(request, handlers) {
            Sent::Rejected => false,
            Sent::Unanswered => true,
            Sent::Pending(seq) => {
                self.wait_for(seq);
                true
            }
        }
    }

    /// Pump until no request is pending
    ///
    /// Answers may issue follow-up requests, which are waited for as well.
    fn wait_until_idle(&self) {
        loop {
            let pending = self.state.borrow().pending.as_ref().map(|p| p.seq);
            match pending {
                Some(seq) => {
                    debug!("Waiting for request {} before sending", seq);
                    self.wait_for(seq);
                }
                None => return,
            }
        }
    }

    /// Pump until request `seq` is resolved or expires
    fn wait_for(&self, seq: u64) {
        loop {
            let remaining = {
                let mut state = self.state.borrow_mut();
                let now = self.clock.now();
                state.expire_pending(now);
                match &state.pending {
                    Some(request) if request.seq == seq => {
                        request.deadline.saturating_duration_since(now)
                    }
                    _ => return,
                }
            };

            self.submit_next();
            let wait = remaining
                .min(self.settings.idle_timeout)
                .max(Duration::from_millis(1));
            self.pump(wait);
        }
    }

    fn shutdown(&self) {
        self.key_callback.borrow_mut().take();
        self.teardown_session();
        self.state.borrow_mut().shut_down = true;
        self.sync_watches();
        debug!("Remote shut down");
    }
}

/// Interpret one received frame
fn decode(
    data: &[u8],
    now: Instant,
    key: &mut KeyState,
    pending: &mut Option<PendingRequest>,
    notices: &mut Vec<Notice>,
) {
    let frame = match Frame::parse(data) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Discarding frame: {}", e);
            return;
        }
    };

    match frame.report() {
        Report::KeyDown(code) => {
            if key.press(code, now) {
                debug!("Key down: {}", code);
            }
        }
        Report::KeyUp => {
            if let Some(code) = key.release() {
                debug!("Key up: {}", code);
                notices.push(Notice::Key(code));
            }
        }
        Report::LinkLost => match key.take() {
            Some(code) => debug!("Wireless link lost, dropping key {}", code),
            None => debug!("Wireless link lost"),
        },
        Report::LinkEstablished => debug!("Wireless link established"),
        report @ (Report::Response { .. } | Report::Error { .. }) => {
            let outcome = pending.as_ref().and_then(|p| p.classify(&report));
            match (outcome, pending.take_if(|_| outcome.is_some())) {
                (Some(outcome), Some(request)) => {
                    if outcome == Outcome::Error {
                        debug!("Request {:#04x} rejected: {:?}", request.sub_id, report);
                    }
                    if let Some(callback) = request.into_callback(outcome) {
                        notices.push(Notice::Response(callback, frame.bytes().to_vec()));
                    }
                }
                _ => trace!("Ignoring unsolicited {:?}", report),
            }
        }
        Report::Other { .. } => {}
    }
}
