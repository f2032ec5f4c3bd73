//! Single-threaded I/O reactor
//!
//! Multiplexes descriptor readiness, one-shot timers and deferred calls on one
//! thread. The reactor knows nothing about USB; the driver registers the
//! transport's descriptors and its own timers here like any other client.
//!
//! # Registration discipline
//!
//! Registrations made while the reactor is dispatching never disturb the list
//! being iterated: new watches and timers are parked in a pending list and
//! merged before the next wait. Removal vacates the entry's slot at once, so a
//! removed watch or timer is inert from that moment, even if its key is still
//! present in a list captured earlier.
//!
//! # Turn structure
//!
//! 1. Compute the nearest timer deadline (zero if deferred calls are queued).
//! 2. If that is already due, fire due timers and run one batch of deferred
//!    calls without waiting.
//! 3. Otherwise wait in a single `poll(2)` for readiness or the deadline.
//! 4. Invoke each ready watch once, in registration order.

mod slots;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use slots::{SlotKey, Slots};
use std::cell::{Cell, RefCell};
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Errors surfaced by [`Reactor::run`]
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The multiplexed wait itself failed
    #[error("Descriptor wait failed: {0}")]
    Wait(#[from] Errno),
}

/// Handle returned by [`Reactor::add_watch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(SlotKey);

/// Handle returned by [`Reactor::add_timer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(SlotKey);

type WatchCallback = Rc<RefCell<dyn FnMut()>>;

struct Watch {
    fd: RawFd,
    interest: PollFlags,
    callback: WatchCallback,
}

struct Timer {
    deadline: Instant,
    /// Registration sequence, breaks deadline ties deterministically
    seq: u64,
    callback: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct State {
    watches: Slots<Watch>,
    /// Watches polled by the current wait, in registration order
    watch_order: Vec<SlotKey>,
    /// Watches registered since the last wait
    new_watches: Vec<SlotKey>,
    timers: Slots<Timer>,
    timer_order: Vec<SlotKey>,
    new_timers: Vec<SlotKey>,
    next_timer_seq: u64,
    deferred: Vec<Box<dyn FnOnce()>>,
}

impl State {
    /// Merge pending registrations and drop keys of removed entries
    fn apply_changes(&mut self) {
        let watches = &self.watches;
        self.watch_order.retain(|key| watches.contains(*key));
        self.watch_order
            .extend(self.new_watches.drain(..).filter(|key| watches.contains(*key)));

        let timers = &self.timers;
        self.timer_order.retain(|key| timers.contains(*key));
        self.timer_order
            .extend(self.new_timers.drain(..).filter(|key| timers.contains(*key)));
    }

    fn has_work(&self) -> bool {
        !self.watches.is_empty() || !self.timers.is_empty() || !self.deferred.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timer_order
            .iter()
            .filter_map(|key| self.timers.get(*key))
            .map(|timer| timer.deadline)
            .min()
    }
}

/// Readiness-and-timer multiplexer
///
/// All methods take `&self`, so callbacks may freely register and remove
/// watches, timers and deferred calls on the reactor that is running them.
/// Share it between components with `Rc<Reactor>`.
#[derive(Default)]
pub struct Reactor {
    state: RefCell<State>,
    stopped: Cell<bool>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `fd` for the events in `interest`
    ///
    /// Never blocks. Takes effect from the next wait cycle.
    pub fn add_watch<F>(&self, fd: RawFd, interest: PollFlags, callback: F) -> WatchHandle
    where
        F: FnMut() + 'static,
    {
        let mut state = self.state.borrow_mut();
        let key = state.watches.insert(Watch {
            fd,
            interest,
            callback: Rc::new(RefCell::new(callback)),
        });
        state.new_watches.push(key);
        trace!("Watch added: fd={}, interest={:?}", fd, interest);
        WatchHandle(key)
    }

    /// Remove a watch by handle; idempotent
    pub fn remove_watch(&self, handle: WatchHandle) {
        if let Some(watch) = self.state.borrow_mut().watches.remove(handle.0) {
            trace!("Watch removed: fd={}", watch.fd);
        }
    }

    /// Remove every watch on `fd` whose interest equals `interest`
    ///
    /// An empty `interest` matches any watch on the descriptor.
    pub fn remove_watches_for(&self, fd: RawFd, interest: PollFlags) {
        let mut state = self.state.borrow_mut();
        let doomed: Vec<SlotKey> = state
            .watches
            .iter()
            .filter(|(_, w)| w.fd == fd && (interest.is_empty() || w.interest == interest))
            .map(|(key, _)| key)
            .collect();
        for key in doomed {
            state.watches.remove(key);
        }
    }

    /// Run `callback` once, `delay` from now
    pub fn add_timer<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        let mut state = self.state.borrow_mut();
        let seq = state.next_timer_seq;
        state.next_timer_seq += 1;
        let key = state.timers.insert(Timer {
            deadline: Instant::now() + delay,
            seq,
            callback: Box::new(callback),
        });
        state.new_timers.push(key);
        TimerHandle(key)
    }

    /// Cancel a timer; idempotent, and a no-op once the timer has fired
    pub fn remove_timer(&self, handle: TimerHandle) {
        self.state.borrow_mut().timers.remove(handle.0);
    }

    /// Queue `callback` for the next drain pass
    ///
    /// Calls deferred while a batch is draining run in the following batch.
    pub fn defer<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.state.borrow_mut().deferred.push(Box::new(callback));
    }

    /// Ask [`run`](Self::run) to return at the next safe point
    ///
    /// Callbacks already selected for the current turn still run.
    pub fn stop(&self) {
        self.stopped.set(true);
    }

    /// Whether any watch, timer or deferred call is registered
    pub fn has_work(&self) -> bool {
        self.state.borrow().has_work()
    }

    /// Dispatch events until nothing is registered or [`stop`](Self::stop) is called
    pub fn run(&self) -> Result<(), ReactorError> {
        self.state.borrow_mut().apply_changes();
        debug!("Reactor started");

        let result = self.run_loop();

        self.stopped.set(false);
        debug!("Reactor stopped");
        result
    }

    fn run_loop(&self) -> Result<(), ReactorError> {
        while !self.stopped.get() && self.has_work() {
            let now = Instant::now();
            let (has_deferred, deadline) = {
                let state = self.state.borrow();
                (!state.deferred.is_empty(), state.next_deadline())
            };

            let wait = if has_deferred {
                Some(Duration::ZERO)
            } else {
                deadline.map(|d| d.saturating_duration_since(now))
            };

            match wait {
                Some(delay) if delay.is_zero() => {
                    self.fire_timers(now);
                    self.drain_deferred();
                }
                _ => {
                    let ready = self.wait(wait)?;
                    if ready.is_empty() {
                        self.fire_timers(Instant::now());
                        self.drain_deferred();
                    } else {
                        self.dispatch(&ready);
                    }
                }
            }

            self.state.borrow_mut().apply_changes();
        }
        Ok(())
    }

    /// Block in `poll(2)` and return the keys of ready watches
    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<SlotKey>, ReactorError> {
        let polled: Vec<(SlotKey, RawFd, PollFlags)> = {
            let state = self.state.borrow();
            state
                .watch_order
                .iter()
                .filter_map(|key| state.watches.get(*key).map(|w| (*key, w.fd, w.interest)))
                .collect()
        };

        // SAFETY: whoever registers a watch keeps the descriptor open until it
        // removes the watch, and the borrow does not outlive this call.
        let mut fds: Vec<PollFd> = polled
            .iter()
            .map(|(_, fd, interest)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, *interest))
            .collect();

        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(delay) => {
                // Round up so an almost-due timer does not spin
                let ms = delay.as_micros().div_ceil(1000).min(u128::from(u16::MAX));
                PollTimeout::from(ms as u16)
            }
        };

        match poll(&mut fds, timeout) {
            Ok(0) => Ok(Vec::new()),
            Ok(_) => Ok(polled
                .iter()
                .zip(fds.iter())
                .filter(|(_, pfd)| pfd.revents().is_some_and(|r| !r.is_empty()))
                .map(|((key, _, _), _)| *key)
                .collect()),
            Err(Errno::EINTR) => Ok(Vec::new()),
            Err(e) => Err(ReactorError::Wait(e)),
        }
    }

    fn dispatch(&self, ready: &[SlotKey]) {
        for key in ready {
            // Watches removed by an earlier callback this turn are skipped
            let callback = self
                .state
                .borrow()
                .watches
                .get(*key)
                .map(|w| Rc::clone(&w.callback));
            if let Some(callback) = callback {
                (&mut *callback.borrow_mut())();
            }
        }
    }

    fn fire_timers(&self, now: Instant) {
        let mut due: Vec<(Instant, u64, SlotKey)> = {
            let state = self.state.borrow();
            state
                .timer_order
                .iter()
                .filter_map(|key| {
                    state
                        .timers
                        .get(*key)
                        .filter(|t| t.deadline <= now)
                        .map(|t| (t.deadline, t.seq, *key))
                })
                .collect()
        };
        due.sort_by_key(|(deadline, seq, _)| (*deadline, *seq));

        for (_, _, key) in due {
            let timer = self.state.borrow_mut().timers.remove(key);
            if let Some(timer) = timer {
                (timer.callback)();
            }
        }
    }

    fn drain_deferred(&self) {
        let batch = std::mem::take(&mut self.state.borrow_mut().deferred);
        for callback in batch {
            callback();
        }
    }
}
