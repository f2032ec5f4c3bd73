//! HID++ request/response correlation
//!
//! Only one HID++ request may be outstanding. Its device index and sub id
//! are remembered, and the first frame from the receiver that matches
//! either as a response or as an error resolves it.

use protocol::{Frame, Report};
use std::fmt;
use std::time::Instant;

/// Callback receiving the complete response or error frame
pub type ResponseCallback = Box<dyn FnOnce(&[u8])>;

/// Optional success and error callbacks for a request
///
/// ```
/// use driver::remote::ResponseHandlers;
///
/// let handlers = ResponseHandlers::new()
///     .on_success(|frame| println!("answer: {:02x?}", frame))
///     .on_error(|frame| println!("rejected: {:02x?}", frame));
/// assert!(!handlers.is_empty());
/// ```
#[derive(Default)]
pub struct ResponseHandlers {
    success: Option<ResponseCallback>,
    error: Option<ResponseCallback>,
}

impl ResponseHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&[u8]) + 'static,
    {
        self.success = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&[u8]) + 'static,
    {
        self.error = Some(Box::new(callback));
        self
    }

    /// No callbacks: the request is fire-and-forget
    pub fn is_empty(&self) -> bool {
        self.success.is_none() && self.error.is_none()
    }
}

impl fmt::Debug for ResponseHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandlers")
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// How a received frame relates to the pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

/// The outstanding HID++ request
#[derive(Debug)]
pub struct PendingRequest {
    /// Distinguishes successive requests for blocking waits
    pub seq: u64,
    pub device_index: u8,
    pub sub_id: u8,
    /// Dropped unanswered once this passes
    pub deadline: Instant,
    handlers: ResponseHandlers,
}

impl PendingRequest {
    pub fn new(seq: u64, request: &Frame<'_>, handlers: ResponseHandlers, deadline: Instant) -> Self {
        Self {
            seq,
            device_index: request.device_index(),
            sub_id: request.sub_id(),
            deadline,
            handlers,
        }
    }

    /// Match a decoded HID++ report against this request
    ///
    /// Only the device index and sub id are compared. A response from a
    /// different register that happens to share the sub id is accepted.
    pub fn classify(&self, report: &Report) -> Option<Outcome> {
        match *report {
            Report::Error {
                device_index,
                request_sub_id,
                ..
            } if device_index == self.device_index && request_sub_id == self.sub_id => {
                Some(Outcome::Error)
            }
            Report::Response {
                device_index,
                sub_id,
            } if device_index == self.device_index && sub_id == self.sub_id => {
                Some(Outcome::Success)
            }
            _ => None,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Callback to run for `outcome`
    ///
    /// Errors fall back to the success callback when no error callback was
    /// given.
    pub fn into_callback(self, outcome: Outcome) -> Option<ResponseCallback> {
        match outcome {
            Outcome::Success => self.handlers.success,
            Outcome::Error => self.handlers.error.or(self.handlers.success),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    const FIRMWARE_QUERY: [u8; 7] = [0x10, 0xFF, 0x81, 0xF1, 0x01, 0x00, 0x00];

    fn pending(handlers: ResponseHandlers) -> PendingRequest {
        let frame = Frame::parse(&FIRMWARE_QUERY).unwrap();
        PendingRequest::new(1, &frame, handlers, Instant::now() + Duration::from_secs(2))
    }

    #[test]
    fn test_classify() {
        let request = pending(ResponseHandlers::new());

        let response = Report::Response {
            device_index: 0xFF,
            sub_id: 0x81,
        };
        assert_eq!(request.classify(&response), Some(Outcome::Success));

        let error = Report::Error {
            device_index: 0xFF,
            request_sub_id: 0x81,
            error_code: 0x02,
        };
        assert_eq!(request.classify(&error), Some(Outcome::Error));

        let other_device = Report::Response {
            device_index: 0x01,
            sub_id: 0x81,
        };
        assert_eq!(request.classify(&other_device), None);

        let other_sub_id = Report::Response {
            device_index: 0xFF,
            sub_id: 0x80,
        };
        assert_eq!(request.classify(&other_sub_id), None);

        let error_for_other = Report::Error {
            device_index: 0xFF,
            request_sub_id: 0x83,
            error_code: 0x02,
        };
        assert_eq!(request.classify(&error_for_other), None);
    }

    #[test]
    fn test_error_falls_back_to_success_callback() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let request = pending(ResponseHandlers::new().on_success(move |f| {
            sink.borrow_mut().push(f.to_vec());
        }));

        let callback = request.into_callback(Outcome::Error).unwrap();
        callback(&[0x10, 0xFF, 0x8F, 0x81, 0x01, 0x02, 0x00]);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_expiry() {
        let request = pending(ResponseHandlers::new());
        assert!(!request.is_expired(request.deadline - Duration::from_millis(1)));
        assert!(request.is_expired(request.deadline));
    }
}
