//! Asynchronous interrupt transfers
//!
//! rusb only wraps libusb's synchronous API, so interrupt reads go through
//! the raw bindings it re-exports. A completed transfer is pushed onto a
//! queue by the libusb callback and collected by [`Transfers::take_completions`]
//! after `handle_events` returns, so nothing user-visible runs inside libusb.
//!
//! A transfer and its buffer are freed only after libusb reported it done.

use common::{TransferCompletion, TransferId, TransferStatus, TransportError};
use rusb::{Context, DeviceHandle, ffi};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_int, c_uint, c_void};
use std::ptr::NonNull;
use std::time::Duration;
use tracing::{debug, trace, warn};

type DoneQueue = RefCell<VecDeque<*mut ffi::libusb_transfer>>;

struct Pending {
    id: TransferId,
    transfer: NonNull<ffi::libusb_transfer>,
    buffer: Box<[u8]>,
}

/// Interrupt transfers submitted through one libusb context
pub struct Transfers {
    /// Boxed so the address handed to libusb stays fixed
    done: Box<DoneQueue>,
    /// Keyed by transfer address
    pending: HashMap<usize, Pending>,
    next_id: u64,
}

impl Transfers {
    pub fn new() -> Self {
        Self {
            done: Box::new(RefCell::new(VecDeque::new())),
            pending: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Submit an interrupt IN read of `length` bytes
    pub fn submit_interrupt_in(
        &mut self,
        handle: &DeviceHandle<Context>,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<TransferId, TransportError> {
        let mut buffer = vec![0u8; length].into_boxed_slice();
        let c_length = c_int::try_from(length).map_err(|_| TransportError::InvalidParam)?;
        // libusb treats zero as "no timeout"
        let timeout_ms = c_uint::try_from(timeout.as_millis())
            .unwrap_or(c_uint::MAX)
            .max(1);

        // SAFETY: plain allocation, checked for null below
        let raw = unsafe { ffi::libusb_alloc_transfer(0) };
        let transfer = NonNull::new(raw)
            .ok_or_else(|| TransportError::Other("Failed to allocate transfer".to_string()))?;

        let user_data = std::ptr::from_ref::<DoneQueue>(&self.done)
            .cast_mut()
            .cast::<c_void>();

        // SAFETY: the buffer and the done queue outlive the transfer, which is
        // only freed after its callback ran or submission failed
        let rc = unsafe {
            ffi::libusb_fill_interrupt_transfer(
                raw,
                handle.as_raw(),
                endpoint,
                buffer.as_mut_ptr(),
                c_length,
                transfer_done,
                user_data,
                timeout_ms,
            );
            ffi::libusb_submit_transfer(raw)
        };

        if rc != 0 {
            // SAFETY: never submitted, so libusb holds no reference
            unsafe { ffi::libusb_free_transfer(raw) };
            let error = map_libusb_code(rc);
            warn!("Failed to submit interrupt transfer: {}", error);
            return Err(error);
        }

        let id = TransferId(self.next_id);
        self.next_id += 1;
        self.pending.insert(
            raw as usize,
            Pending {
                id,
                transfer,
                buffer,
            },
        );
        trace!(
            "Submitted {:?} on endpoint {:#04x}, timeout {}ms",
            id, endpoint, timeout_ms
        );
        Ok(id)
    }

    /// Ask libusb to cancel `id`; the completion still has to be collected
    pub fn cancel(&mut self, id: TransferId) {
        let Some(pending) = self.pending.values().find(|p| p.id == id) else {
            return;
        };

        // SAFETY: the transfer is still owned by us and not yet freed
        let rc = unsafe { ffi::libusb_cancel_transfer(pending.transfer.as_ptr()) };
        match rc {
            0 => debug!("Cancelling {:?}", id),
            // Already finished, the completion is on its way
            ffi::constants::LIBUSB_ERROR_NOT_FOUND => {}
            rc => warn!("Failed to cancel {:?}: {}", id, map_libusb_code(rc)),
        }
    }

    pub fn cancel_all(&mut self) {
        let ids: Vec<TransferId> = self.pending.values().map(|p| p.id).collect();
        for id in ids {
            self.cancel(id);
        }
    }

    /// Collect transfers whose callbacks ran during the last event pump
    pub fn take_completions(&mut self) -> Vec<TransferCompletion> {
        let done: Vec<_> = self.done.borrow_mut().drain(..).collect();
        let mut completions = Vec::with_capacity(done.len());

        for raw in done {
            let Some(pending) = self.pending.remove(&(raw as usize)) else {
                warn!("Completion for unknown transfer");
                continue;
            };

            // SAFETY: libusb is done with the transfer once its callback ran
            let (status, actual_length) = unsafe { ((*raw).status, (*raw).actual_length) };
            let length = usize::try_from(actual_length)
                .unwrap_or(0)
                .min(pending.buffer.len());

            completions.push(TransferCompletion {
                id: pending.id,
                status: map_transfer_status(status),
                data: pending.buffer[..length].to_vec(),
            });

            // SAFETY: see above; the buffer is dropped right after
            unsafe { ffi::libusb_free_transfer(pending.transfer.as_ptr()) };
        }

        completions
    }
}

impl Default for Transfers {
    fn default() -> Self {
        Self::new()
    }
}

extern "system" fn transfer_done(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data points at the boxed done queue of the `Transfers`
    // that submitted this transfer, and libusb calls back on the thread
    // running `handle_events`
    unsafe {
        let queue = &*((*transfer).user_data as *const DoneQueue);
        queue.borrow_mut().push_back(transfer);
    }
}

fn map_transfer_status(status: c_int) -> TransferStatus {
    use ffi::constants::*;

    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// Map rusb::Error to common::TransportError
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        rusb::Error::Access => TransportError::Access,
        rusb::Error::NotSupported => TransportError::NotSupported,
        _ => TransportError::Other(err.to_string()),
    }
}

/// Map a raw libusb return code
pub fn map_libusb_code(code: c_int) -> TransportError {
    use ffi::constants::*;

    match code {
        LIBUSB_ERROR_TIMEOUT => TransportError::Timeout,
        LIBUSB_ERROR_PIPE => TransportError::Pipe,
        LIBUSB_ERROR_NO_DEVICE => TransportError::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => TransportError::NotFound,
        LIBUSB_ERROR_BUSY => TransportError::Busy,
        LIBUSB_ERROR_IO => TransportError::Io,
        LIBUSB_ERROR_INVALID_PARAM => TransportError::InvalidParam,
        LIBUSB_ERROR_ACCESS => TransportError::Access,
        LIBUSB_ERROR_NOT_SUPPORTED => TransportError::NotSupported,
        code => TransportError::Other(format!("libusb error {}", code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffi::constants::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransportError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransportError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), TransportError::NotFound);
        assert!(matches!(
            map_rusb_error(rusb::Error::Overflow),
            TransportError::Other(_)
        ));
    }

    #[test]
    fn test_map_libusb_code() {
        assert_eq!(map_libusb_code(LIBUSB_ERROR_BUSY), TransportError::Busy);
        assert_eq!(map_libusb_code(LIBUSB_ERROR_ACCESS), TransportError::Access);
        assert_eq!(
            map_libusb_code(-1234),
            TransportError::Other("libusb error -1234".to_string())
        );
    }

    #[test]
    fn test_map_transfer_status() {
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_COMPLETED),
            TransferStatus::Completed
        );
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_TIMED_OUT),
            TransferStatus::TimedOut
        );
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_CANCELLED),
            TransferStatus::Cancelled
        );
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_NO_DEVICE),
            TransferStatus::NoDevice
        );
        assert_eq!(map_transfer_status(LIBUSB_TRANSFER_ERROR), TransferStatus::Error);
    }

    #[test]
    fn test_new_has_nothing_pending() {
        let mut transfers = Transfers::new();
        assert!(transfers.is_empty());
        assert!(transfers.take_completions().is_empty());
        // Unknown ids are ignored
        transfers.cancel(TransferId(7));
    }
}
