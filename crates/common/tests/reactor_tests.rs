//! Integration tests for the reactor
//!
//! Readiness is produced with real Unix socket pairs so every test goes
//! through `poll(2)`.

use common::Reactor;
use nix::poll::PollFlags;
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Stop the reactor after `limit` even if a test misbehaves
fn watchdog(reactor: &Rc<Reactor>, limit: Duration) {
    let weak = Rc::downgrade(reactor);
    reactor.add_timer(limit, move || {
        if let Some(reactor) = weak.upgrade() {
            reactor.stop();
        }
    });
}

fn socket_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let reactor = Reactor::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    for (delay, tag) in [(30, "c"), (10, "a"), (20, "b"), (10, "a2")] {
        let log = Rc::clone(&log);
        reactor.add_timer(Duration::from_millis(delay), move || log.borrow_mut().push(tag));
    }
    reactor.run().unwrap();

    assert_eq!(*log.borrow(), vec!["a", "a2", "b", "c"]);
    assert!(!reactor.has_work());
}

#[test]
fn test_timer_waits_for_its_deadline() {
    let reactor = Reactor::new();
    let fired_at = Rc::new(Cell::new(None));

    let start = Instant::now();
    let slot = Rc::clone(&fired_at);
    reactor.add_timer(Duration::from_millis(20), move || slot.set(Some(Instant::now())));
    reactor.run().unwrap();

    let fired_at = fired_at.get().unwrap();
    assert!(fired_at.duration_since(start) >= Duration::from_millis(20));
}

#[test]
fn test_readable_descriptor_invokes_watch() {
    let reactor = Rc::new(Reactor::new());
    let (mut tx, rx) = socket_pair();
    let received = Rc::new(RefCell::new(Vec::new()));

    let handle = {
        let reactor_ref = Rc::downgrade(&reactor);
        let received = Rc::clone(&received);
        let mut rx = rx.try_clone().unwrap();
        reactor.add_watch(rx.as_raw_fd(), PollFlags::POLLIN, move || {
            let mut buf = [0u8; 16];
            let n = rx.read(&mut buf).unwrap_or(0);
            received.borrow_mut().extend_from_slice(&buf[..n]);
            if let Some(reactor) = reactor_ref.upgrade() {
                reactor.stop();
            }
        })
    };
    watchdog(&reactor, Duration::from_secs(5));

    tx.write_all(b"hi").unwrap();
    reactor.run().unwrap();

    assert_eq!(*received.borrow(), b"hi");
    reactor.remove_watch(handle);
}

#[test]
fn test_ready_watches_dispatch_in_registration_order() {
    let reactor = Rc::new(Reactor::new());
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut pairs = Vec::new();

    for tag in 0..3 {
        let (mut tx, rx) = socket_pair();
        tx.write_all(&[tag]).unwrap();
        let order = Rc::clone(&order);
        let reactor_ref = Rc::downgrade(&reactor);
        reactor.add_watch(rx.as_raw_fd(), PollFlags::POLLIN, {
            let mut rx = rx.try_clone().unwrap();
            move || {
                let mut buf = [0u8; 1];
                let _ = rx.read(&mut buf);
                order.borrow_mut().push(buf[0]);
                if buf[0] == 2
                    && let Some(reactor) = reactor_ref.upgrade()
                {
                    reactor.stop();
                }
            }
        });
        pairs.push((tx, rx));
    }
    watchdog(&reactor, Duration::from_secs(5));

    reactor.run().unwrap();

    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn test_watch_removed_by_earlier_callback_is_skipped() {
    let reactor = Rc::new(Reactor::new());
    let (mut tx_a, rx_a) = socket_pair();
    let (mut tx_b, rx_b) = socket_pair();
    tx_a.write_all(b"a").unwrap();
    tx_b.write_all(b"b").unwrap();

    let second = Rc::new(Cell::new(None));
    let second_fired = Rc::new(Cell::new(false));

    {
        let reactor_ref = Rc::downgrade(&reactor);
        let second = Rc::clone(&second);
        let mut rx_a = rx_a.try_clone().unwrap();
        reactor.add_watch(rx_a.as_raw_fd(), PollFlags::POLLIN, move || {
            let mut buf = [0u8; 1];
            let _ = rx_a.read(&mut buf);
            if let Some(reactor) = reactor_ref.upgrade() {
                if let Some(handle) = second.get() {
                    reactor.remove_watch(handle);
                }
                reactor.stop();
            }
        });
    }
    {
        let fired = Rc::clone(&second_fired);
        let handle = reactor.add_watch(rx_b.as_raw_fd(), PollFlags::POLLIN, move || {
            fired.set(true);
        });
        second.set(Some(handle));
    }
    watchdog(&reactor, Duration::from_secs(5));

    reactor.run().unwrap();

    assert!(!second_fired.get());
}

#[test]
fn test_watch_added_in_callback_starts_next_turn() {
    let reactor = Rc::new(Reactor::new());
    let (mut tx_a, rx_a) = socket_pair();
    let (mut tx_b, rx_b) = socket_pair();
    tx_a.write_all(b"a").unwrap();
    tx_b.write_all(b"b").unwrap();

    let log = Rc::new(RefCell::new(Vec::new()));
    let rx_b = Rc::new(RefCell::new(rx_b));

    {
        let reactor_ref = Rc::downgrade(&reactor);
        let log = Rc::clone(&log);
        let rx_b = Rc::clone(&rx_b);
        let mut rx_a = rx_a.try_clone().unwrap();
        let mut added = false;
        reactor.add_watch(rx_a.as_raw_fd(), PollFlags::POLLIN, move || {
            let mut buf = [0u8; 1];
            let _ = rx_a.read(&mut buf);
            log.borrow_mut().push("a");
            if added {
                return;
            }
            added = true;
            let Some(reactor) = reactor_ref.upgrade() else {
                return;
            };
            let log_b = Rc::clone(&log);
            let rx_b = Rc::clone(&rx_b);
            let stopper = Rc::downgrade(&reactor);
            let fd = rx_b.borrow().as_raw_fd();
            reactor.add_watch(fd, PollFlags::POLLIN, move || {
                let mut buf = [0u8; 1];
                let _ = rx_b.borrow_mut().read(&mut buf);
                log_b.borrow_mut().push("b");
                if let Some(reactor) = stopper.upgrade() {
                    reactor.stop();
                }
            });
            // Still in the first turn: the new watch must not run yet
            log.borrow_mut().push("added");
        });
    }
    watchdog(&reactor, Duration::from_secs(5));

    reactor.run().unwrap();

    assert_eq!(*log.borrow(), vec!["a", "added", "b"]);
}

#[test]
fn test_remove_watches_for_descriptor() {
    let reactor = Reactor::new();
    let (_tx, rx) = socket_pair();
    let fd = rx.as_raw_fd();

    reactor.add_watch(fd, PollFlags::POLLIN, || {});
    reactor.add_watch(fd, PollFlags::POLLOUT, || {});
    assert!(reactor.has_work());

    reactor.remove_watches_for(fd, PollFlags::POLLIN);
    assert!(reactor.has_work());

    reactor.remove_watches_for(fd, PollFlags::empty());
    assert!(!reactor.has_work());
}

#[test]
fn test_deferred_calls_queued_while_draining_run_next_batch() {
    let reactor = Rc::new(Reactor::new());
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let reactor_ref = Rc::downgrade(&reactor);
        let log = Rc::clone(&log);
        reactor.defer(move || {
            log.borrow_mut().push("first");
            let log = Rc::clone(&log);
            if let Some(reactor) = reactor_ref.upgrade() {
                reactor.defer(move || log.borrow_mut().push("nested"));
            }
        });
    }
    {
        let log = Rc::clone(&log);
        reactor.defer(move || log.borrow_mut().push("second"));
    }
    reactor.run().unwrap();

    assert_eq!(*log.borrow(), vec!["first", "second", "nested"]);
}

#[test]
fn test_deferred_calls_run_before_distant_timer() {
    let reactor = Rc::new(Reactor::new());
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = Rc::clone(&log);
        reactor.add_timer(Duration::from_millis(10), move || log.borrow_mut().push("timer"));
    }
    {
        let log = Rc::clone(&log);
        reactor.defer(move || log.borrow_mut().push("deferred"));
    }
    reactor.run().unwrap();

    assert_eq!(*log.borrow(), vec!["deferred", "timer"]);
}

#[test]
fn test_stop_from_timer_leaves_other_work_registered() {
    let reactor = Rc::new(Reactor::new());
    let late = Rc::new(Cell::new(false));

    {
        let reactor_ref = Rc::downgrade(&reactor);
        reactor.add_timer(Duration::from_millis(1), move || {
            if let Some(reactor) = reactor_ref.upgrade() {
                reactor.stop();
            }
        });
    }
    {
        let late = Rc::clone(&late);
        reactor.add_timer(Duration::from_secs(60), move || late.set(true));
    }
    reactor.run().unwrap();

    assert!(!late.get());
    assert!(reactor.has_work());
}
