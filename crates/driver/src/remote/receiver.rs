//! Receiver initialization and queries
//!
//! After every (re)connect the receiver is switched to DJ mode, wireless
//! notifications are enabled and the firmware version is read. Firmware
//! queries are retried because a freshly plugged receiver often ignores the
//! first requests.

use super::{ResponseHandlers, Sent, Shared};
use common::Transport;
use protocol::{
    FirmwarePart, FirmwareVersion, MAX_PAIRED_DEVICES, device_name_query, enable_dj_mode,
    enable_notifications, firmware_query, parse_device_name,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, info, warn};

impl<T: Transport + 'static> Shared<T> {
    pub(super) fn initialize_receiver(&self) {
        let generation = {
            let mut state = self.state.borrow_mut();
            if state.session.is_none() {
                debug!("No receiver present, skipping initialization");
                return;
            }
            state.firmware = None;
            state.init_generation += 1;
            state.init_generation
        };

        if self.send(&enable_dj_mode(), ResponseHandlers::new()) == Sent::Rejected {
            warn!("Failed to enable DJ mode");
        }

        if self.reactor.is_some() {
            // The acknowledgement is not worth a round trip
            if self.send(&enable_notifications(), ResponseHandlers::new()) == Sent::Rejected {
                warn!("Failed to enable wireless notifications");
            }
            self.query_firmware(generation, self.settings.firmware_retries);
        } else {
            let handlers = ResponseHandlers::new().on_success(|_| {});
            if !self.send_and_wait(&enable_notifications(), handlers) {
                warn!("Failed to enable wireless notifications");
            }
            self.wait_for_firmware(generation);
        }
    }

    /// Send the release query and arm a retry timer
    fn query_firmware(&self, generation: u64, retries_left: u32) {
        let weak = self.weak_self.clone();
        let handlers = ResponseHandlers::new()
            .on_success(move |frame| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_firmware_release(generation, frame);
                }
            })
            .on_error(|_| debug!("Receiver rejected the firmware query"));

        self.send_firmware_query(&firmware_query(FirmwarePart::Release), handlers);

        let Some(reactor) = &self.reactor else {
            return;
        };
        if retries_left == 0 {
            return;
        }

        let weak = self.weak_self.clone();
        reactor.add_timer(self.settings.firmware_retry_delay, move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut state = shared.state.borrow_mut();
                if state.firmware.is_some() || state.init_generation != generation {
                    return;
                }
                // The unanswered query would block its own retry
                if let Some(seq) = state.firmware_request.take() {
                    state.abandon(seq);
                }
            }
            debug!("Retrying firmware query, {} retries left", retries_left);
            shared.query_firmware(generation, retries_left - 1);
        });
    }

    fn on_firmware_release(&self, generation: u64, frame: &[u8]) {
        if self.state.borrow().init_generation != generation {
            return;
        }
        let release = match FirmwareVersion::from_release(frame) {
            Ok(release) => release,
            Err(e) => {
                debug!("Malformed firmware release answer: {}", e);
                return;
            }
        };

        let weak = self.weak_self.clone();
        let handlers = ResponseHandlers::new()
            .on_success(move |frame| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match release.with_build(frame) {
                    Ok(version) => shared.store_firmware(generation, version),
                    Err(e) => debug!("Malformed firmware build answer: {}", e),
                }
            })
            .on_error(|_| debug!("Receiver rejected the firmware build query"));

        self.send_firmware_query(&firmware_query(FirmwarePart::Build), handlers);
    }

    /// Send one half of the firmware query, remembering it for the retry timer
    fn send_firmware_query(&self, request: &[u8], handlers: ResponseHandlers) {
        match self.send(request, handlers) {
            Sent::Pending(seq) => self.state.borrow_mut().firmware_request = Some(seq),
            Sent::Unanswered => {}
            Sent::Rejected => debug!("Firmware query not sent"),
        }
    }

    /// Blocking counterpart of [`query_firmware`](Self::query_firmware)
    fn wait_for_firmware(&self, generation: u64) {
        let attempts = self.settings.firmware_retries + 1;
        for attempt in 0..attempts {
            if attempt > 0 {
                self.clock.sleep(self.settings.firmware_retry_delay);
            }

            let release = Rc::new(Cell::new(None));
            let sink = Rc::clone(&release);
            let handlers = ResponseHandlers::new()
                .on_success(move |frame| sink.set(FirmwareVersion::from_release(frame).ok()))
                .on_error(|_| debug!("Receiver rejected the firmware query"));
            self.send_and_wait(&firmware_query(FirmwarePart::Release), handlers);
            let Some(release) = release.get() else {
                continue;
            };

            let version = Rc::new(Cell::new(None));
            let sink = Rc::clone(&version);
            let handlers = ResponseHandlers::new()
                .on_success(move |frame| sink.set(release.with_build(frame).ok()))
                .on_error(|_| debug!("Receiver rejected the firmware build query"));
            self.send_and_wait(&firmware_query(FirmwarePart::Build), handlers);
            if let Some(version) = version.get() {
                self.store_firmware(generation, version);
                return;
            }
        }
        warn!("Receiver firmware version unknown after {} attempts", attempts);
    }

    fn store_firmware(&self, generation: u64, version: FirmwareVersion) {
        {
            let mut state = self.state.borrow_mut();
            if state.init_generation != generation {
                return;
            }
            state.firmware = Some(version);
        }

        info!("Receiver firmware {}", version);
        if version > self.settings.newest_supported_firmware {
            warn!(
                "Receiver firmware {} is newer than {}, some keys may not be reported",
                version, self.settings.newest_supported_firmware
            );
        }
    }

    pub(super) fn paired_device_name(&self, slot: u8) -> Option<String> {
        if slot >= MAX_PAIRED_DEVICES {
            return None;
        }

        let name = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&name);
        let handlers = ResponseHandlers::new()
            .on_success(move |frame| match parse_device_name(frame) {
                Ok(parsed) => *sink.borrow_mut() = Some(parsed),
                Err(e) => debug!("Malformed pairing answer: {}", e),
            })
            .on_error(move |_| debug!("No device paired in slot {}", slot));

        if !self.send_and_wait(&device_name_query(slot), handlers) {
            return None;
        }
        name.take()
    }
}
