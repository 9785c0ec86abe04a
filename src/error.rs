//! Error taxonomy for the USB device core.
//!
//! Every fallible operation in this crate returns one of these variants by
//! value. Nothing here panics or unwinds: per the USB spec, retry is always
//! the host's responsibility, never the core's (see [`crate::request`]).

/// Failure returned from core operations.
///
/// Allocation failures are only expected at init time; submission failures
/// (`QueueFull`) are routine and the caller decides whether to drop the
/// frame or retry later.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The endpoint's transfer queue free-list is empty.
    QueueFull,
    /// A transfer's length needs more buffer-pointer pages than a single
    /// transfer descriptor can address (5 pages of up to 4 KiB each,
    /// anchored to the first page's offset).
    TransferTooLarge,
    /// Endpoint/queue allocation failed (arena or heap exhausted).
    OutOfMemory,
    /// The requested endpoint address has no slot in this controller's
    /// queue-head array.
    InvalidEndpoint,
    /// The requested configuration number is not present in the device's
    /// configuration table at the negotiated speed.
    UnknownConfiguration,
}
