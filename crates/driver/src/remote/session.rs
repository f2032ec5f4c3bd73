//! Live connection to the receiver and the held-key state machine

use common::{InterfaceInfo, TransferId, Transport};
use protocol::KeyCode;
use std::time::{Duration, Instant};

/// Which key, if any, is currently held down on the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyState {
    #[default]
    Idle,
    Held { code: KeyCode, since: Instant },
}

impl KeyState {
    /// Record a key-down frame
    ///
    /// Returns `true` when this starts a new press. Repeated frames for the
    /// key already held keep the original press time.
    pub fn press(&mut self, code: KeyCode, now: Instant) -> bool {
        match *self {
            KeyState::Held { code: held, .. } if held == code => false,
            _ => {
                *self = KeyState::Held { code, since: now };
                true
            }
        }
    }

    /// Record a release frame, yielding the plain code of a held key
    pub fn release(&mut self) -> Option<KeyCode> {
        self.take()
    }

    /// The read timed out: a held key becomes a long press
    pub fn expire(&mut self) -> Option<KeyCode> {
        self.take().map(KeyCode::long)
    }

    /// Forget the held key without reporting it
    pub fn take(&mut self) -> Option<KeyCode> {
        match std::mem::take(self) {
            KeyState::Held { code, .. } => Some(code),
            KeyState::Idle => None,
        }
    }

    pub fn is_held(&self) -> bool {
        matches!(self, KeyState::Held { .. })
    }

    /// Timeout for the next interrupt read
    ///
    /// While a key is held the read times out when the long-press threshold
    /// is reached, clamped to `1ms..=idle`.
    pub fn read_timeout(&self, now: Instant, long_press: Duration, idle: Duration) -> Duration {
        match *self {
            KeyState::Idle => idle,
            KeyState::Held { since, .. } => long_press
                .saturating_sub(now.saturating_duration_since(since))
                .clamp(Duration::from_millis(1), idle),
        }
    }
}

/// The single open receiver
pub struct Session<T: Transport> {
    pub handle: T::Handle,
    pub device: T::Device,
    pub interface: InterfaceInfo,
    /// The one outstanding interrupt read
    pub in_flight: Option<TransferId>,
    pub key: KeyState,
    pub last_frame: Option<Instant>,
}

impl<T: Transport> Session<T> {
    pub fn new(handle: T::Handle, device: T::Device, interface: InterfaceInfo) -> Self {
        Self {
            handle,
            device,
            interface,
            in_flight: None,
            key: KeyState::Idle,
            last_frame: None,
        }
    }
}
